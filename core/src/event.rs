//! Event trait, envelopes and metadata.
//!
//! Domain events are immutable facts. On the way into the log each event is
//! wrapped in a [`SerializedEvent`] (type name, `bincode` payload, JSON
//! metadata). On the way out the log hands back [`RecordedEvent`]s, which add
//! the per-stream and global positions assigned at commit time.
//!
//! # Example
//!
//! ```
//! use eventline_core::event::{encode_payload, Event, EventError};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced { order_id: String }
//!
//! #[derive(Clone, Debug)]
//! enum OrderEvent {
//!     Placed(OrderPlaced),
//! }
//!
//! impl Event for OrderEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::Placed(_) => "OrderPlaced.v1",
//!         }
//!     }
//!
//!     fn to_payload(&self) -> Result<Vec<u8>, EventError> {
//!         match self {
//!             OrderEvent::Placed(e) => encode_payload(e),
//!         }
//!     }
//! }
//! ```

use crate::stream::{GlobalPosition, StreamName, StreamPosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event payload or its metadata.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event payload or its metadata.
    #[error("Failed to deserialize event {event_type}: {reason}")]
    DeserializationError {
        /// Type name recorded in the envelope.
        event_type: String,
        /// Decoder error message.
        reason: String,
    },

    /// No decoder is registered for this type name.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A decoder was registered twice for the same type name.
    #[error("Event type registered twice: {0}")]
    DuplicateEventType(String),
}

/// A domain event that can be stored in the log and replayed.
///
/// Aggregates model their events as a closed enum; `event_type` names each
/// variant with a stable, versioned identifier (`"OrderCreated.v1"`), and
/// `to_payload` encodes only that variant's data. Decoding goes through an
/// [`EventTypeRegistry`](crate::serializer::EventTypeRegistry) keyed by the
/// same identifiers.
pub trait Event: Send + Sync + 'static {
    /// Stable, versioned type name of this event.
    fn event_type(&self) -> &'static str;

    /// Encode this event's payload.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be encoded.
    fn to_payload(&self) -> Result<Vec<u8>, EventError>;
}

/// Encode a payload value with `bincode`.
///
/// # Errors
///
/// Returns `EventError::SerializationError` if `bincode` rejects the value.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, EventError> {
    bincode::serialize(value).map_err(|e| EventError::SerializationError(e.to_string()))
}

/// Decode a payload value with `bincode`.
///
/// # Errors
///
/// Returns `EventError::DeserializationError` if the bytes are corrupt or do
/// not match `T`.
pub fn decode_payload<T: DeserializeOwned>(event_type: &str, bytes: &[u8]) -> Result<T, EventError> {
    bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })
}

/// Metadata supplied by the command handler when storing an aggregate.
///
/// Copied onto every event of the same `store` call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Links all events caused by one request across aggregates.
    pub correlation_id: Option<String>,
    /// Id of the message (command or event) that caused these events.
    pub causation_id: Option<String>,
    /// Authenticated user that issued the command.
    pub user_id: Option<String>,
}

impl CommandMetadata {
    /// Metadata with a correlation id only.
    #[must_use]
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Envelope metadata written next to every event payload (as JSON).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique id of the event.
    pub event_id: Uuid,
    /// Type name of the event.
    pub event_type: String,
    /// Correlation id copied from the command.
    pub correlation_id: Option<String>,
    /// Causation id copied from the command.
    pub causation_id: Option<String>,
    /// User id copied from the command.
    pub user_id: Option<String>,
    /// When the event was recorded by the aggregate store.
    pub timestamp: DateTime<Utc>,
}

impl EventMetadata {
    /// Build the metadata of one event from the command metadata.
    #[must_use]
    pub fn new(
        event_id: Uuid,
        event_type: impl Into<String>,
        command: &CommandMetadata,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            correlation_id: command.correlation_id.clone(),
            causation_id: command.causation_id.clone(),
            user_id: command.user_id.clone(),
            timestamp,
        }
    }

    /// Encode as the JSON value stored in the envelope.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if JSON encoding fails.
    pub fn to_json(&self) -> Result<serde_json::Value, EventError> {
        serde_json::to_value(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode from the JSON value stored in the envelope.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the JSON does not match.
    pub fn from_json(event_type: &str, value: &serde_json::Value) -> Result<Self, EventError> {
        serde_json::from_value(value.clone()).map_err(|e| EventError::DeserializationError {
            event_type: event_type.to_string(),
            reason: format!("metadata: {e}"),
        })
    }
}

/// A serialized event ready for appending.
///
/// This is the log's generic record format on the write path.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// Unique id of the event.
    pub event_id: Uuid,

    /// The event type identifier (e.g., "OrderCreated.v1").
    pub event_type: String,

    /// The bincode-encoded payload.
    pub data: Vec<u8>,

    /// Envelope metadata in JSON format.
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event with a fresh id.
    #[must_use]
    pub fn new(event_type: String, data: Vec<u8>, metadata: Option<serde_json::Value>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            data,
            metadata,
        }
    }

    /// Replace the generated id.
    #[must_use]
    pub const fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// An event as persisted in the log.
///
/// Carries the position inside its stream and the position in the global
/// log, both assigned at commit time and immutable afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Stream the event belongs to.
    pub stream_name: StreamName,
    /// 0-based position inside the stream.
    pub stream_position: StreamPosition,
    /// Position in the global log.
    pub global_position: GlobalPosition,
    /// Unique id of the event.
    pub event_id: Uuid,
    /// The event type identifier.
    pub event_type: String,
    /// The bincode-encoded payload.
    pub data: Vec<u8>,
    /// Envelope metadata in JSON format.
    pub metadata: Option<serde_json::Value>,
    /// Commit timestamp assigned by the log.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Decode the envelope metadata, if any was written.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the metadata is malformed.
    pub fn event_metadata(&self) -> Result<Option<EventMetadata>, EventError> {
        self.metadata
            .as_ref()
            .map(|value| EventMetadata::from_json(&self.event_type, value))
            .transpose()
    }
}

impl fmt::Display for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({}, global {})",
            self.stream_name, self.stream_position, self.event_type, self.global_position
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Created {
        id: String,
        value: i32,
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn payload_roundtrip() {
        let payload = Created {
            id: "test-1".to_string(),
            value: 42,
        };
        let bytes = encode_payload(&payload).expect("encode should succeed");
        let decoded: Created = decode_payload("Created.v1", &bytes).expect("decode should succeed");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn corrupt_payload_is_a_deserialization_error() {
        let result: Result<Created, _> = decode_payload("Created.v1", &[0xff]);
        assert!(matches!(
            result,
            Err(EventError::DeserializationError { ref event_type, .. }) if event_type == "Created.v1"
        ));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn metadata_copies_command_fields() {
        let command = CommandMetadata::correlated("corr-1")
            .with_causation_id("cmd-9")
            .with_user_id("alice");
        let metadata = EventMetadata::new(Uuid::nil(), "Created.v1", &command, Utc::now());

        let json = metadata.to_json().expect("metadata encodes");
        assert_eq!(json["correlation_id"], "corr-1");
        assert_eq!(json["causation_id"], "cmd-9");
        assert_eq!(json["user_id"], "alice");

        let decoded = EventMetadata::from_json("Created.v1", &json).expect("metadata decodes");
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn serialized_event_display() {
        let serialized = SerializedEvent::new("Created.v1".to_string(), vec![1, 2, 3, 4, 5], None);
        let display = format!("{serialized}");
        assert!(display.contains("Created.v1"));
        assert!(display.contains("5 bytes"));
    }
}
