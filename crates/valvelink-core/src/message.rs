//! Application-layer frame and its JSON wire shape for MQTT.
//!
//! The binary legacy-BLE shape lives in [`crate::wire`]; this module holds
//! the transport-agnostic `Frame` the Command Router operates on and the
//! serde types MQTT uses to carry it as JSON.

use serde::{Deserialize, Serialize};

/// Which transport a frame arrived on / must be answered on.
///
/// Preserved end-to-end so the router returns a response to the transport
/// that produced the matching command — responses never cross transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Ble,
    Mqtt,
}

/// An application command, transport-agnostic.
///
/// `op` is bounded to 15 ASCII bytes on BLE's legacy wire shape; MQTT's
/// JSON shape does not enforce that bound itself, but the router treats
/// both uniformly once decoded into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub op: String,
    pub payload: Vec<u8>,
    pub origin: Origin,
    pub is_final: bool,
}

/// A response to a `Frame`, carrying the same `id` and `origin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespFrame {
    pub id: u16,
    pub status: i8,
    pub origin: Origin,
    pub is_final: bool,
    pub payload: Vec<u8>,
}

impl RespFrame {
    /// `status = -1`, empty payload — the Command Router's answer to an
    /// unrecognized `op`.
    pub fn unknown_op(id: u16, origin: Origin) -> Self {
        Self {
            id,
            status: -1,
            origin,
            is_final: true,
            payload: Vec::new(),
        }
    }
}

/// `{"id": <u16>, "op": "<name>", "payload": "<string?>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandJson {
    pub id: u16,
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl CommandJson {
    pub fn into_frame(self, origin: Origin) -> Frame {
        Frame {
            id: self.id,
            op: self.op,
            payload: self.payload.map(String::into_bytes).unwrap_or_default(),
            origin,
            is_final: true,
        }
    }
}

/// `{"id": <u16>, "status": <i8>, "is_final": <bool>, "payload": <string|null>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseJson {
    pub id: u16,
    pub status: i8,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl From<&RespFrame> for ResponseJson {
    fn from(r: &RespFrame) -> Self {
        Self {
            id: r.id,
            status: r.status,
            is_final: r.is_final,
            payload: if r.payload.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&r.payload).into_owned())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_json_rejects_missing_fields() {
        let err = serde_json::from_str::<CommandJson>(r#"{"op":"status"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn command_json_round_trips_into_frame() {
        let cmd: CommandJson =
            serde_json::from_str(r#"{"id":7,"op":"status","payload":"x"}"#).unwrap();
        let frame = cmd.into_frame(Origin::Mqtt);
        assert_eq!(frame.id, 7);
        assert_eq!(frame.op, "status");
        assert_eq!(frame.payload, b"x");
    }

    #[test]
    fn unknown_op_response_shape() {
        let resp = RespFrame::unknown_op(7, Origin::Ble);
        assert_eq!(resp.status, -1);
        assert!(resp.is_final);
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn response_json_omits_empty_payload() {
        let resp = RespFrame::unknown_op(7, Origin::Ble);
        let json = ResponseJson::from(&resp);
        let serialized = serde_json::to_string(&json).unwrap();
        assert!(!serialized.contains("payload"));
    }
}
