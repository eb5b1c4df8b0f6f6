//! Event serialization through an explicit type-name registry.
//!
//! The registry maps each stable type name (`"OrderCreated.v1"`) to a decoder
//! producing the aggregate's event enum. It is built once at startup and
//! shared by reference (`Arc`) with every [`Serializer`] that needs it; there
//! is no process-wide registry.
//!
//! An unknown type name is always a hard error. Skipping an event during
//! replay would silently corrupt aggregate state.
//!
//! # Example
//!
//! ```
//! use eventline_core::event::{encode_payload, Event, EventError};
//! use eventline_core::serializer::EventTypeRegistry;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct Opened { owner: String }
//!
//! #[derive(Clone, Debug)]
//! enum AccountEvent { Opened(Opened) }
//!
//! impl Event for AccountEvent {
//!     fn event_type(&self) -> &'static str { "AccountOpened.v1" }
//!     fn to_payload(&self) -> Result<Vec<u8>, EventError> {
//!         match self { AccountEvent::Opened(e) => encode_payload(e) }
//!     }
//! }
//!
//! # fn main() -> Result<(), EventError> {
//! let registry = EventTypeRegistry::new()
//!     .with("AccountOpened.v1", AccountEvent::Opened)?;
//! assert!(registry.contains("AccountOpened.v1"));
//! # Ok(())
//! # }
//! ```

use crate::event::{
    CommandMetadata, Event, EventError, EventMetadata, RecordedEvent, SerializedEvent,
    decode_payload,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

type Decoder<E> = Box<dyn Fn(&[u8]) -> Result<E, EventError> + Send + Sync>;

/// Type-name → decoder registry for one event enum.
pub struct EventTypeRegistry<E> {
    decoders: HashMap<String, Decoder<E>>,
}

impl<E: Event> EventTypeRegistry<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the payload type `P` under `event_type`.
    ///
    /// `wrap` lifts the decoded payload into the event enum, typically an
    /// enum variant constructor such as `OrderEvent::Created`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DuplicateEventType` if `event_type` is already
    /// registered.
    pub fn register<P, F>(&mut self, event_type: &str, wrap: F) -> Result<(), EventError>
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> E + Send + Sync + 'static,
    {
        if self.decoders.contains_key(event_type) {
            return Err(EventError::DuplicateEventType(event_type.to_string()));
        }

        let name = event_type.to_string();
        let decoder: Decoder<E> =
            Box::new(move |bytes| decode_payload::<P>(&name, bytes).map(&wrap));
        self.decoders.insert(event_type.to_string(), decoder);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns `EventError::DuplicateEventType` if `event_type` is already
    /// registered.
    pub fn with<P, F>(mut self, event_type: &str, wrap: F) -> Result<Self, EventError>
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> E + Send + Sync + 'static,
    {
        self.register(event_type, wrap)?;
        Ok(self)
    }

    /// Whether a decoder exists for `event_type`.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a payload recorded under `event_type`.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEventType` if no decoder is registered
    /// - `EventError::DeserializationError` if the payload is corrupt
    pub fn decode(&self, event_type: &str, data: &[u8]) -> Result<E, EventError> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| EventError::UnknownEventType(event_type.to_string()))?;
        decoder(data)
    }
}

impl<E: Event> Default for EventTypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventTypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventTypeRegistry")
            .field("event_types", &types)
            .finish()
    }
}

/// Encodes events into the log's envelope and decodes recorded events back.
pub struct Serializer<E> {
    registry: Arc<EventTypeRegistry<E>>,
}

impl<E: Event> Serializer<E> {
    /// Create a serializer over a shared registry.
    #[must_use]
    pub const fn new(registry: Arc<EventTypeRegistry<E>>) -> Self {
        Self { registry }
    }

    /// The registry this serializer decodes with.
    #[must_use]
    pub const fn registry(&self) -> &Arc<EventTypeRegistry<E>> {
        &self.registry
    }

    /// Wrap `event` in an envelope carrying the command metadata.
    ///
    /// Events whose type is not registered are rejected here, so nothing is
    /// ever written that could not be read back.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEventType` if the type name is not registered
    /// - `EventError::SerializationError` if payload or metadata encoding fails
    pub fn serialize(
        &self,
        event: &E,
        command: &CommandMetadata,
        timestamp: DateTime<Utc>,
    ) -> Result<SerializedEvent, EventError> {
        let event_type = event.event_type();
        if !self.registry.contains(event_type) {
            return Err(EventError::UnknownEventType(event_type.to_string()));
        }

        let event_id = Uuid::new_v4();
        let metadata = EventMetadata::new(event_id, event_type, command, timestamp).to_json()?;

        Ok(SerializedEvent {
            event_id,
            event_type: event_type.to_string(),
            data: event.to_payload()?,
            metadata: Some(metadata),
        })
    }

    /// Decode a recorded event.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEventType` if the type name is not registered
    /// - `EventError::DeserializationError` if the payload is corrupt
    pub fn deserialize(&self, recorded: &RecordedEvent) -> Result<E, EventError> {
        self.registry.decode(&recorded.event_type, &recorded.data)
    }

    /// Decode a recorded event together with its envelope metadata.
    ///
    /// # Errors
    ///
    /// Same as [`deserialize`](Self::deserialize), plus malformed metadata.
    pub fn deserialize_with_metadata(
        &self,
        recorded: &RecordedEvent,
    ) -> Result<(E, Option<EventMetadata>), EventError> {
        let event = self.deserialize(recorded)?;
        let metadata = recorded.event_metadata()?;
        Ok((event, metadata))
    }
}

impl<E> Clone for Serializer<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> fmt::Debug for Serializer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::encode_payload;
    use crate::stream::{GlobalPosition, StreamName, StreamPosition};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Withdrawn {
        amount: i64,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum AccountEvent {
        Deposited(Deposited),
        Withdrawn(Withdrawn),
    }

    impl Event for AccountEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Deposited(_) => "Deposited.v1",
                Self::Withdrawn(_) => "Withdrawn.v1",
            }
        }

        fn to_payload(&self) -> Result<Vec<u8>, EventError> {
            match self {
                Self::Deposited(e) => encode_payload(e),
                Self::Withdrawn(e) => encode_payload(e),
            }
        }
    }

    #[allow(clippy::expect_used)]
    fn serializer() -> Serializer<AccountEvent> {
        let registry = EventTypeRegistry::new()
            .with("Deposited.v1", AccountEvent::Deposited)
            .expect("first registration")
            .with("Withdrawn.v1", AccountEvent::Withdrawn)
            .expect("second registration");
        Serializer::new(Arc::new(registry))
    }

    fn recorded(serialized: SerializedEvent) -> RecordedEvent {
        RecordedEvent {
            stream_name: StreamName::new("account-1"),
            stream_position: StreamPosition::START,
            global_position: GlobalPosition::FIRST,
            event_id: serialized.event_id,
            event_type: serialized.event_type,
            data: serialized.data,
            metadata: serialized.metadata,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn serialize_then_deserialize_preserves_event_and_metadata() {
        let serializer = serializer();
        let event = AccountEvent::Withdrawn(Withdrawn { amount: 30 });
        let command = CommandMetadata::correlated("corr-1");

        let envelope = serializer
            .serialize(&event, &command, Utc::now())
            .expect("serialize");
        assert_eq!(envelope.event_type, "Withdrawn.v1");

        let (decoded, metadata) = serializer
            .deserialize_with_metadata(&recorded(envelope.clone()))
            .expect("deserialize");
        assert_eq!(decoded, event);
        let metadata = metadata.expect("metadata present");
        assert_eq!(metadata.event_id, envelope.event_id);
        assert_eq!(metadata.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = EventTypeRegistry::new()
            .with("Deposited.v1", AccountEvent::Deposited)
            .and_then(|r| r.with("Deposited.v1", AccountEvent::Deposited));
        assert!(matches!(result, Err(EventError::DuplicateEventType(_))));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn unknown_event_type_is_a_hard_error() {
        let serializer = serializer();
        let mut event = recorded(
            serializer
                .serialize(
                    &AccountEvent::Deposited(Deposited { amount: 1 }),
                    &CommandMetadata::default(),
                    Utc::now(),
                )
                .expect("serialize"),
        );
        event.event_type = "Closed.v1".to_string();

        assert_eq!(
            serializer.deserialize(&event),
            Err(EventError::UnknownEventType("Closed.v1".to_string()))
        );
    }

    #[test]
    fn unregistered_events_are_not_written() {
        let registry = EventTypeRegistry::new()
            .with("Deposited.v1", AccountEvent::Deposited);
        let Ok(registry) = registry else {
            unreachable!("registration succeeds");
        };
        let serializer = Serializer::new(Arc::new(registry));

        let result = serializer.serialize(
            &AccountEvent::Withdrawn(Withdrawn { amount: 1 }),
            &CommandMetadata::default(),
            Utc::now(),
        );
        assert!(matches!(result, Err(EventError::UnknownEventType(_))));
    }
}
