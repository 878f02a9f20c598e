//! # Control Message Wire Schema
//!
//! Control frames carry one JSON object with a numeric type code and a
//! typed payload:
//!
//! ```text
//! {"type": 0, "payload": {"id": <origin>, "key": <hashed>, "size": <u64>}}   StoreFile
//! {"type": 1, "payload": {"id": <origin>, "key": <hashed>}}                  GetFile
//! ```
//!
//! Field names and type codes are part of the wire contract. Payloads are
//! decoded into closed structs — unknown keys are rejected — while an
//! unknown type code is reported separately so the dispatcher can drop the
//! message without disconnecting the peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type code for a replication announcement.
pub const TYPE_STORE_FILE: u8 = 0;

/// Type code for a fetch request.
pub const TYPE_GET_FILE: u8 = 1;

/// Typed view of an inbound or outbound control frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// "I am about to stream you a replica of this blob."
    /// `cipher_bytes` is the ciphertext size: plaintext plus the 16-byte IV.
    StoreFile {
        origin: String,
        hashed_key: String,
        cipher_bytes: u64,
    },
    /// "Stream me this blob if you hold it."
    GetFile { origin: String, hashed_key: String },
}

/// Failures decoding a control payload.
#[derive(Debug)]
pub enum MessageError {
    /// Not valid JSON, or a payload that does not match the closed schema.
    Malformed(serde_json::Error),
    /// Valid envelope with a type code this node does not understand.
    UnknownType(u8),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::Malformed(e) => write!(f, "malformed control message: {}", e),
            MessageError::UnknownType(code) => write!(f, "unknown message type code: {}", code),
        }
    }
}

impl std::error::Error for MessageError {}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    payload: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreFilePayload {
    id: String,
    key: String,
    size: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetFilePayload {
    id: String,
    key: String,
}

impl ControlMessage {
    /// Serialize into the wire envelope.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let envelope = match self {
            ControlMessage::StoreFile {
                origin,
                hashed_key,
                cipher_bytes,
            } => Envelope {
                kind: TYPE_STORE_FILE,
                payload: serde_json::to_value(StoreFilePayload {
                    id: origin.clone(),
                    key: hashed_key.clone(),
                    size: *cipher_bytes,
                })?,
            },
            ControlMessage::GetFile { origin, hashed_key } => Envelope {
                kind: TYPE_GET_FILE,
                payload: serde_json::to_value(GetFilePayload {
                    id: origin.clone(),
                    key: hashed_key.clone(),
                })?,
            },
        };
        serde_json::to_vec(&envelope)
    }

    /// Decode a control payload received from a peer.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(MessageError::Malformed)?;
        match envelope.kind {
            TYPE_STORE_FILE => {
                let payload: StoreFilePayload =
                    serde_json::from_value(envelope.payload).map_err(MessageError::Malformed)?;
                Ok(ControlMessage::StoreFile {
                    origin: payload.id,
                    hashed_key: payload.key,
                    cipher_bytes: payload.size,
                })
            }
            TYPE_GET_FILE => {
                let payload: GetFilePayload =
                    serde_json::from_value(envelope.payload).map_err(MessageError::Malformed)?;
                Ok(ControlMessage::GetFile {
                    origin: payload.id,
                    hashed_key: payload.key,
                })
            }
            other => Err(MessageError::UnknownType(other)),
        }
    }

}
