//! Event Envelope Codec
//!
//! Single responsibility: Build and parse the envelopes exchanged on the stream.
//!
//! # Wire Format
//!
//! Every frame is one MessagePack map:
//!
//! ```text
//! {
//!     "id": <string>,        // Unique per envelope, used for ack correlation
//!     "type": <string>,      // Discriminates the payload schema
//!     "source": <string>,    // URI identifying this client instance
//!     "payload": <binary>,   // Inner message as msgpack bytes
//! }
//! ```
//!
//! Inner messages are plain serde structs encoded with named (camelCase) keys:
//!
//! ```text
//! CalculationMemberJoinEvent       { id, tags: [string] }
//! CalculationMemberGreetEvent      { id, sourceEventId?, memberId? }
//! EventAckResponse                 { id, sourceEventId, success, message? }
//! CalculationMemberKeepAliveEvent  { id }
//! ```
//!
//! The inner `id` always equals the envelope `id`.

use rmpv::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Cursor;
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Event type discriminators understood by the platform.
pub mod event_types {
    pub const JOIN: &str = "CalculationMemberJoinEvent";
    pub const GREET: &str = "CalculationMemberGreetEvent";
    pub const ACK_RESPONSE: &str = "EventAckResponse";
    pub const KEEP_ALIVE: &str = "CalculationMemberKeepAliveEvent";
}

/// The uniform message wrapper exchanged over the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Decode the inner message.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.payload).map_err(|e| {
            ClientError::Codec(format!(
                "Failed to decode {} payload of {}: {}",
                self.event_type, self.id, e
            ))
        })
    }
}

/// Join request, sent once per connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEvent {
    pub id: String,
    pub tags: Vec<String>,
}

/// Server greeting that completes a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreetEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
}

impl GreetEvent {
    /// The join id this greet answers.
    ///
    /// Platforms that echo the join id as the greet id omit `sourceEventId`.
    pub fn join_id(&self) -> &str {
        self.source_event_id.as_deref().unwrap_or(&self.id)
    }
}

/// Positive or negative acknowledgment of a previously sent envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub id: String,
    pub source_event_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Periodic liveness ping from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveEvent {
    pub id: String,
}

/// Generate a fresh envelope id.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds envelopes stamped with this client's source URI.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    source: String,
}

impl EnvelopeCodec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap an already-built inner message.
    pub fn build<T: Serialize>(&self, event_type: &str, id: String, message: &T) -> Result<Envelope> {
        let payload = rmp_serde::to_vec_named(message).map_err(|e| {
            ClientError::Codec(format!("Failed to encode {} payload: {}", event_type, e))
        })?;

        Ok(Envelope {
            id,
            event_type: event_type.to_string(),
            source: self.source.clone(),
            payload,
        })
    }

    /// Join envelope with a fresh id.
    pub fn join(&self, tags: &[String]) -> Result<Envelope> {
        let id = new_event_id();
        let message = JoinEvent {
            id: id.clone(),
            tags: tags.to_vec(),
        };
        self.build(event_types::JOIN, id, &message)
    }

    /// Ack (or nack) referencing `source_event_id`.
    pub fn ack(&self, source_event_id: &str, success: bool, message: Option<String>) -> Result<Envelope> {
        let id = new_event_id();
        let ack = AckResponse {
            id: id.clone(),
            source_event_id: source_event_id.to_string(),
            success,
            message,
        };
        self.build(event_types::ACK_RESPONSE, id, &ack)
    }

    /// Greet answering `join_id`. Used by the platform side and by tests.
    pub fn greet(&self, join_id: &str, member_id: Option<String>) -> Result<Envelope> {
        let id = new_event_id();
        let greet = GreetEvent {
            id: id.clone(),
            source_event_id: Some(join_id.to_string()),
            member_id,
        };
        self.build(event_types::GREET, id, &greet)
    }

    pub fn keep_alive(&self) -> Result<Envelope> {
        let id = new_event_id();
        let ping = KeepAliveEvent { id: id.clone() };
        self.build(event_types::KEEP_ALIVE, id, &ping)
    }
}

/// Encode an envelope into one wire frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    use rmpv::encode::write_value;

    let frame = Value::Map(vec![
        (Value::String("id".into()), Value::String(envelope.id.as_str().into())),
        (
            Value::String("type".into()),
            Value::String(envelope.event_type.as_str().into()),
        ),
        (
            Value::String("source".into()),
            Value::String(envelope.source.as_str().into()),
        ),
        (Value::String("payload".into()), Value::Binary(envelope.payload.clone())),
    ]);

    let mut bytes = Vec::new();
    write_value(&mut bytes, &frame)
        .map_err(|e| ClientError::Codec(format!("Failed to encode envelope: {}", e)))?;

    Ok(bytes)
}

/// Decode one wire frame.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    use rmpv::decode::read_value;

    let mut cursor = Cursor::new(data);
    let value = read_value(&mut cursor)
        .map_err(|e| ClientError::Codec(format!("Failed to decode envelope: {}", e)))?;

    let map = value
        .as_map()
        .ok_or_else(|| ClientError::Codec("Envelope is not a map".into()))?;

    let id = field(map, "id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClientError::Codec("Envelope missing 'id' field".into()))?;

    let event_type = field(map, "type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClientError::Codec("Envelope missing 'type' field".into()))?;

    let source = field(map, "source").and_then(|v| v.as_str()).unwrap_or_default();

    // A missing or nil payload is an empty message
    let payload = match field(map, "payload") {
        Some(Value::Binary(bytes)) => bytes.clone(),
        Some(Value::Nil) | None => Vec::new(),
        Some(other) => {
            return Err(ClientError::Codec(format!(
                "Envelope payload is not binary: {:?}",
                other
            )))
        }
    };

    Ok(Envelope {
        id: id.to_string(),
        event_type: event_type.to_string(),
        source: source.to_string(),
        payload,
    })
}

fn field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}
