//! Transport-MQTT — broker connection state machine, dual-topic routing
//! between legacy and Security1 modes, reconnect backoff.
//!
//! The broker client itself ([`MqttBroker`]) is an external collaborator
//! (ESP-MQTT on device, any `rumqttc`-shaped client off it); this module
//! owns the state machine, topic bookkeeping, and inbound routing policy
//! layered on top of it.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use valvelink_core::message::{CommandJson, Frame, Origin, RespFrame, ResponseJson};
use valvelink_services::security1::Security1Session;

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttState {
    Down,
    Connecting,
    Up,
    Security1Handshake,
    Security1Ready,
    Operational,
    EncryptedComm,
}

#[derive(Debug, Error)]
pub enum MqttIoError {
    #[error("connect failed")]
    ConnectFailed,
    #[error("publish failed")]
    PublishFailed,
    #[error("subscribe failed")]
    SubscribeFailed,
}

#[derive(Debug, Error)]
pub enum MqttTransportError {
    #[error(transparent)]
    Io(#[from] MqttIoError),
    #[error("invalid command json: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error(transparent)]
    Security1(#[from] valvelink_services::security1::Security1Error),
}

/// Contract against the platform's MQTT client.
pub trait MqttBroker: Send + Sync {
    fn connect(&self) -> Result<(), MqttIoError>;
    fn subscribe(&self, topic: &str) -> Result<(), MqttIoError>;
    fn unsubscribe(&self, topic: &str);
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MqttIoError>;
}

#[derive(Debug, Clone)]
pub struct MqttTopics {
    pub handshake_request: String,
    pub handshake_response: String,
    pub data_request: String,
    pub data_response: String,
    pub legacy_command: String,
    pub legacy_response: String,
}

impl MqttTopics {
    pub fn from_prefix(prefix: &str) -> Self {
        Self {
            handshake_request: format!("{prefix}/handshake/request"),
            handshake_response: format!("{prefix}/handshake/response"),
            data_request: format!("{prefix}/data/request"),
            data_response: format!("{prefix}/data/response"),
            legacy_command: format!("{prefix}/command"),
            legacy_response: format!("{prefix}/response"),
        }
    }
}

/// What an inbound MQTT publish resolved to, per spec.md §4.4's four-way
/// routing decision.
pub enum Routed {
    Handshake(Vec<u8>),
    Command(Frame),
    Dropped,
}

pub struct MqttTransport<B: MqttBroker> {
    broker: Arc<B>,
    topics: MqttTopics,
    secure: bool,
    state: Mutex<MqttState>,
    reconnect_backoff: Mutex<Backoff>,
}

impl<B: MqttBroker> MqttTransport<B> {
    pub fn new(broker: Arc<B>, topics: MqttTopics, secure: bool, min_ms: u64, max_ms: u64) -> Self {
        Self {
            broker,
            topics,
            secure,
            state: Mutex::new(MqttState::Down),
            reconnect_backoff: Mutex::new(Backoff::new(min_ms, max_ms)),
        }
    }

    pub fn state(&self) -> MqttState {
        *self.state.lock()
    }

    /// Connect and subscribe the first-stage topics: handshake topics in
    /// secure mode, the legacy command topic otherwise.
    pub fn connect(&self) -> Result<(), MqttIoError> {
        *self.state.lock() = MqttState::Connecting;
        self.broker.connect()?;
        if self.secure {
            self.broker.subscribe(&self.topics.handshake_request)?;
            *self.state.lock() = MqttState::Security1Handshake;
        } else {
            self.broker.subscribe(&self.topics.legacy_command)?;
            *self.state.lock() = MqttState::Operational;
        }
        self.reconnect_backoff.lock().reset();
        Ok(())
    }

    /// Broker connection dropped: schedule a jittered, doubling reconnect
    /// and return to `DOWN` meanwhile.
    pub async fn on_disconnected(&self) {
        *self.state.lock() = MqttState::Down;
        let delay = self.reconnect_backoff.lock().next_delay();
        warn!(delay_ms = delay.as_millis() as u64, "mqtt disconnected, reconnecting");
        tokio::time::sleep(delay).await;
        if let Err(e) = self.connect() {
            warn!(?e, "mqtt reconnect attempt failed");
        }
    }

    /// HANDSHAKE_COMPLETE: subscribe the data topic, drop the handshake
    /// one, mark operational topics active.
    pub fn on_handshake_complete(&self) -> Result<(), MqttIoError> {
        self.broker.subscribe(&self.topics.data_request)?;
        self.broker.unsubscribe(&self.topics.handshake_request);
        *self.state.lock() = MqttState::Security1Ready;
        info!("mqtt handshake complete, operational topics active");
        Ok(())
    }

    pub fn set_state(&self, state: MqttState) {
        *self.state.lock() = state;
    }

    /// Route one inbound publish per spec.md §4.4's ordered decision. In
    /// secure mode, a data-request payload arrives encrypted under
    /// `session` and is decrypted before JSON-decoding.
    pub fn route_inbound(
        &self,
        now_ms: u64,
        session: &Security1Session,
        topic: &str,
        payload: &[u8],
    ) -> Result<Routed, MqttTransportError> {
        let state = self.state();
        if self.secure && topic == self.topics.handshake_request && state == MqttState::Security1Handshake {
            return Ok(Routed::Handshake(payload.to_vec()));
        }
        if self.secure
            && topic == self.topics.data_request
            && matches!(state, MqttState::Security1Ready | MqttState::Operational | MqttState::EncryptedComm)
        {
            let plaintext = session.decrypt(now_ms, payload)?;
            let cmd: CommandJson = serde_json::from_slice(&plaintext)?;
            return Ok(Routed::Command(cmd.into_frame(Origin::Mqtt)));
        }
        if !self.secure && topic == self.topics.legacy_command {
            let cmd: CommandJson = serde_json::from_slice(payload)?;
            return Ok(Routed::Command(cmd.into_frame(Origin::Mqtt)));
        }
        Ok(Routed::Dropped)
    }

    /// Publish a legacy JSON response on the response topic.
    pub fn publish_response(&self, resp: &RespFrame) -> Result<(), MqttIoError> {
        let json = ResponseJson::from(resp);
        let body = serde_json::to_vec(&json).expect("ResponseJson always serializes");
        self.broker.publish(&self.topics.legacy_response, &body)
    }

    /// Publish an encrypted blob on the data-response topic (secure mode).
    pub fn publish_encrypted(&self, blob: &[u8]) -> Result<(), MqttIoError> {
        self.broker.publish(&self.topics.data_response, blob)
    }

    /// Publish a handshake reply blob.
    pub fn publish_handshake(&self, blob: &[u8]) -> Result<(), MqttIoError> {
        self.broker.publish(&self.topics.handshake_response, blob)
    }
}
