//! Security1 Session Core — Curve25519 + proof-of-possession handshake
//! producing an AES-CTR + HMAC-SHA256 session key, shaped as a
//! deterministic state machine that plugs into either transport.
//!
//! State, keys, and statistics live behind one `parking_lot::Mutex` with a
//! bounded-timeout acquisition: callers that can't get the lock promptly
//! get `MUTEX_TIMEOUT` back rather than blocking indefinitely, since this
//! type is shared between a transport's RX path and its TX path.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use valvelink_core::crypto::{self, CryptoError, Keypair, SessionKey};
use valvelink_core::wire::{
    SessionEstablishRequest, SessionEstablishResponse, SessionVerifyRequest, SessionVerifyResponse,
    WireError,
};
use zeroize::Zeroize;

const MUTEX_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TransportStarting,
    TransportReady,
    HandshakePending,
    HandshakeComplete,
    SessionActive,
    Error,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ble,
    Mqtt,
    Http,
    Custom,
}

#[derive(Debug, Error)]
pub enum Security1Error {
    #[error("lock not acquired within timeout")]
    MutexTimeout,
    #[error("malformed handshake message: {0}")]
    Wire(#[from] WireError),
    #[error("HMAC/PoP verification failed")]
    InvalidMac,
    #[error("operation invalid in state {0:?}")]
    WrongState(SessionState),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub handshake_duration_ms: Option<u64>,
    pub session_duration_ms: Option<u64>,
    pub bytes_encrypted: u64,
    pub bytes_decrypted: u64,
    pub encrypt_ops: u64,
    pub decrypt_ops: u64,
    pub errors_count: u64,
    pub last_activity_ms: u64,
}

struct Inner {
    state: SessionState,
    transport: Option<TransportKind>,
    pop_string: String,
    device_keypair: Option<Keypair>,
    client_pub: Option<[u8; 32]>,
    device_random: Option<[u8; 16]>,
    session_key: Option<SessionKey>,
    started_at_ms: u64,
    stats: SessionStats,
}

pub struct Security1Session {
    inner: Mutex<Inner>,
}

impl Security1Session {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                transport: None,
                pop_string: String::new(),
                device_keypair: None,
                client_pub: None,
                device_random: None,
                session_key: None,
                started_at_ms: 0,
                stats: SessionStats::default(),
            }),
        }
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, Inner>, Security1Error> {
        self.inner
            .try_lock_for(MUTEX_TIMEOUT)
            .ok_or(Security1Error::MutexTimeout)
    }

    pub fn state(&self) -> Result<SessionState, Security1Error> {
        Ok(self.lock()?.state)
    }

    /// `start()`: transport kind + PoP string move the session from IDLE
    /// through TRANSPORT_STARTING to TRANSPORT_READY, awaiting the first
    /// handshake message.
    pub fn start(
        &self,
        now_ms: u64,
        transport: TransportKind,
        pop_string: impl Into<String>,
    ) -> Result<(), Security1Error> {
        let mut inner = self.lock()?;
        inner.transport = Some(transport);
        inner.pop_string = pop_string.into();
        inner.started_at_ms = now_ms;
        inner.state = SessionState::TransportReady;
        Ok(())
    }

    /// Process a SESSION_ESTABLISH request, returning the 51-byte response
    /// to send back. Advances IDLE/TRANSPORT_READY → HANDSHAKE_PENDING.
    pub fn process_session_establish(
        &self,
        now_ms: u64,
        request: &[u8],
    ) -> Result<[u8; SessionEstablishResponse::LEN], Security1Error> {
        let req = SessionEstablishRequest::decode(request)?;

        let mut inner = self.lock()?;
        if inner.state != SessionState::TransportReady {
            return Err(Security1Error::WrongState(inner.state));
        }
        let device_keypair = Keypair::generate();
        let device_random = crypto::random_bytes::<16>();
        let shared_secret = device_keypair.diffie_hellman(&req.client_pub);
        let session_key = crypto::derive_session_key(&shared_secret, &inner.pop_string);

        let response = SessionEstablishResponse {
            device_pub: device_keypair.public,
            device_random,
        };
        let encoded = response.encode();

        inner.client_pub = Some(req.client_pub);
        inner.device_random = Some(device_random);
        inner.session_key = Some(session_key);
        inner.device_keypair = Some(device_keypair);
        inner.state = SessionState::HandshakePending;
        inner.stats.last_activity_ms = now_ms;
        Ok(encoded)
    }

    /// Process a SESSION_VERIFY request. On success, returns the 3-byte
    /// response and advances to HANDSHAKE_COMPLETE. On HMAC/PoP mismatch,
    /// tears the session down to IDLE and returns `InvalidMac` — the
    /// caller must not send a response in that case.
    pub fn process_session_verify(
        &self,
        now_ms: u64,
        request: &[u8],
    ) -> Result<[u8; SessionVerifyResponse::LEN], Security1Error> {
        let req = SessionVerifyRequest::decode(request)?;

        let mut inner = self.lock()?;
        if inner.state != SessionState::HandshakePending {
            return Err(Security1Error::WrongState(inner.state));
        }
        let session_key = inner
            .session_key
            .clone()
            .ok_or(Security1Error::WrongState(inner.state))?;
        let device_random = inner
            .device_random
            .ok_or(Security1Error::WrongState(inner.state))?;
        let device_pub = inner
            .device_keypair
            .as_ref()
            .map(|k| k.public)
            .ok_or(Security1Error::WrongState(inner.state))?;

        let mut decrypted = req.token;
        crypto::aes_ctr_apply(session_key.as_bytes(), &device_random, &mut decrypted);

        use subtle::ConstantTimeEq;
        if decrypted.ct_eq(&device_pub).unwrap_u8() != 1 {
            self.teardown_locked(&mut inner);
            inner.stats.errors_count += 1;
            return Err(Security1Error::InvalidMac);
        }

        inner.state = SessionState::HandshakeComplete;
        inner.stats.handshake_duration_ms =
            Some(now_ms.saturating_sub(inner.started_at_ms));
        inner.stats.last_activity_ms = now_ms;
        Ok(SessionVerifyResponse { status: 0 }.encode())
    }

    /// Transport commits HANDSHAKE_COMPLETE → SESSION_ACTIVE once it has
    /// finished its own transition (e.g. topic resubscription on MQTT).
    pub fn activate(&self) -> Result<(), Security1Error> {
        let mut inner = self.lock()?;
        if inner.state != SessionState::HandshakeComplete {
            return Err(Security1Error::WrongState(inner.state));
        }
        inner.state = SessionState::SessionActive;
        Ok(())
    }

    /// Encrypt is only meaningful once the session key has been derived —
    /// the caller decides whether that's appropriate for its state.
    pub fn encrypt(&self, now_ms: u64, plaintext: &[u8]) -> Result<Vec<u8>, Security1Error> {
        let mut inner = self.lock()?;
        let key = inner
            .session_key
            .clone()
            .ok_or(Security1Error::WrongState(inner.state))?;
        let out = crypto::encrypt(&key, plaintext);
        inner.stats.bytes_encrypted += plaintext.len() as u64;
        inner.stats.encrypt_ops += 1;
        inner.stats.last_activity_ms = now_ms;
        Ok(out)
    }

    /// Permitted as soon as the session key is derived (HANDSHAKE_PENDING
    /// onward), not only in SESSION_ACTIVE — SESSION_VERIFY itself relies
    /// on decrypting under this same key before the handshake completes.
    pub fn decrypt(&self, now_ms: u64, ciphertext: &[u8]) -> Result<Vec<u8>, Security1Error> {
        let mut inner = self.lock()?;
        let key = inner
            .session_key
            .clone()
            .ok_or(Security1Error::WrongState(inner.state))?;
        let out = crypto::decrypt(&key, ciphertext)?;
        inner.stats.bytes_decrypted += ciphertext.len() as u64;
        inner.stats.decrypt_ops += 1;
        inner.stats.last_activity_ms = now_ms;
        Ok(out)
    }

    pub fn stats(&self) -> Result<SessionStats, Security1Error> {
        Ok(self.lock()?.stats.clone())
    }

    /// Graceful stop: zero key material, return to IDLE.
    pub fn stop(&self) -> Result<(), Security1Error> {
        let mut inner = self.lock()?;
        inner.state = SessionState::Stopping;
        self.teardown_locked(&mut inner);
        Ok(())
    }

    fn teardown_locked(&self, inner: &mut Inner) {
        if let Some(mut key) = inner.session_key.take() {
            key.zeroize();
        }
        inner.device_keypair = None;
        inner.client_pub = None;
        if let Some(mut random) = inner.device_random.take() {
            random.zeroize();
        }
        inner.state = SessionState::Idle;
    }
}

impl Default for Security1Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valvelink_core::crypto::Keypair as ClientKeypair;

    fn handshake_request(client_pub: &[u8; 32]) -> Vec<u8> {
        let mut buf = vec![1u8, 1, 32];
        buf.extend_from_slice(client_pub);
        buf
    }

    #[test]
    fn handshake_round_trip() {
        let session = Security1Session::new();
        session
            .start(0, TransportKind::Ble, "test_pop_12345")
            .unwrap();

        let client = ClientKeypair::generate();
        let establish_req = handshake_request(&client.public);
        let establish_resp = session.process_session_establish(0, &establish_req).unwrap();
        assert_eq!(establish_resp.len(), 51);
        assert_eq!(establish_resp[0], 1);
        assert_eq!(establish_resp[1], 1);

        let device_pub: [u8; 32] = establish_resp[3..35].try_into().unwrap();
        let device_random: [u8; 16] = establish_resp[35..51].try_into().unwrap();

        let shared = client.diffie_hellman(&device_pub);
        let client_session_key = valvelink_core::crypto::derive_session_key(&shared, "test_pop_12345");

        let mut token = device_pub;
        valvelink_core::crypto::aes_ctr_apply(client_session_key.as_bytes(), &device_random, &mut token);

        let mut verify_req = vec![1u8, 2, 0x00, 0x20];
        verify_req.extend_from_slice(&token);

        let verify_resp = session.process_session_verify(0, &verify_req).unwrap();
        assert_eq!(verify_resp, [1, 2, 0]);
        assert_eq!(session.state().unwrap(), SessionState::HandshakeComplete);

        session.activate().unwrap();
        assert_eq!(session.state().unwrap(), SessionState::SessionActive);
    }

    #[test]
    fn tampered_verify_token_is_fatal() {
        let session = Security1Session::new();
        session.start(0, TransportKind::Ble, "test_pop_12345").unwrap();
        let client = ClientKeypair::generate();
        session
            .process_session_establish(0, &handshake_request(&client.public))
            .unwrap();

        let mut bad_token = [0u8; 32];
        bad_token[0] ^= 0xFF;
        let mut verify_req = vec![1u8, 2, 0x00, 0x20];
        verify_req.extend_from_slice(&bad_token);

        let err = session.process_session_verify(0, &verify_req).unwrap_err();
        assert!(matches!(err, Security1Error::InvalidMac));
        assert_eq!(session.state().unwrap(), SessionState::Idle);
        assert_eq!(session.stats().unwrap().errors_count, 1);
    }

    #[test]
    fn stray_establish_rejected_once_session_active() {
        let session = Security1Session::new();
        session.start(0, TransportKind::Ble, "test_pop_12345").unwrap();
        let client = ClientKeypair::generate();
        let establish_resp = session
            .process_session_establish(0, &handshake_request(&client.public))
            .unwrap();

        let device_pub: [u8; 32] = establish_resp[3..35].try_into().unwrap();
        let device_random: [u8; 16] = establish_resp[35..51].try_into().unwrap();
        let shared = client.diffie_hellman(&device_pub);
        let session_key = valvelink_core::crypto::derive_session_key(&shared, "test_pop_12345");
        let mut token = device_pub;
        valvelink_core::crypto::aes_ctr_apply(session_key.as_bytes(), &device_random, &mut token);
        let mut verify_req = vec![1u8, 2, 0x00, 0x20];
        verify_req.extend_from_slice(&token);
        session.process_session_verify(0, &verify_req).unwrap();
        session.activate().unwrap();
        assert_eq!(session.state().unwrap(), SessionState::SessionActive);

        // A stray SESSION_ESTABLISH arriving after the session is already
        // active must not regress it back to HANDSHAKE_PENDING.
        let err = session
            .process_session_establish(1, &handshake_request(&ClientKeypair::generate().public))
            .unwrap_err();
        assert!(matches!(err, Security1Error::WrongState(SessionState::SessionActive)));
        assert_eq!(session.state().unwrap(), SessionState::SessionActive);
    }

    #[test]
    fn decrypt_permitted_before_session_active() {
        let session = Security1Session::new();
        session.start(0, TransportKind::Ble, "pop12345").unwrap();
        let client = ClientKeypair::generate();
        session
            .process_session_establish(0, &handshake_request(&client.public))
            .unwrap();
        // Still HANDSHAKE_PENDING: encrypt/decrypt must already work since
        // SESSION_VERIFY depends on it.
        let ct = session.encrypt(0, b"probe").unwrap();
        let pt = session.decrypt(0, &ct).unwrap();
        assert_eq!(pt, b"probe");
    }
}
