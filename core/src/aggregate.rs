//! Event-sourced aggregate roots.
//!
//! An aggregate root is an in-memory decision model rebuilt from its own
//! event stream. Business methods validate a command against the current
//! state and then [`record`](Aggregate::record) one or more events. Recording
//! applies the event to the state right away and queues it as *pending*; the
//! [`AggregateStore`](crate::aggregate_store::AggregateStore) later appends
//! the pending events in one atomic write and clears them.
//!
//! Aggregates compose an [`AggregateBase`] that holds the version and pending
//! events. Only the state transition (`when`) and the business methods are
//! domain code.
//!
//! # Example
//!
//! ```
//! use eventline_core::aggregate::{Aggregate, AggregateBase};
//! use eventline_core::event::{encode_payload, Event, EventError};
//! use serde::{Deserialize, Serialize};
//! use std::convert::Infallible;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct Incremented { by: u32 }
//!
//! #[derive(Clone, Debug)]
//! enum CounterEvent { Incremented(Incremented) }
//!
//! impl Event for CounterEvent {
//!     fn event_type(&self) -> &'static str { "Incremented.v1" }
//!     fn to_payload(&self) -> Result<Vec<u8>, EventError> {
//!         match self { CounterEvent::Incremented(e) => encode_payload(e) }
//!     }
//! }
//!
//! struct Counter { id: String, value: u32, base: AggregateBase<CounterEvent> }
//!
//! impl Aggregate for Counter {
//!     const AGGREGATE_TYPE: &'static str = "counter";
//!     type Id = String;
//!     type Event = CounterEvent;
//!     type Error = Infallible;
//!
//!     fn new(id: String) -> Self { Self { id, value: 0, base: AggregateBase::new() } }
//!     fn id(&self) -> &String { &self.id }
//!     fn base(&self) -> &AggregateBase<CounterEvent> { &self.base }
//!     fn base_mut(&mut self) -> &mut AggregateBase<CounterEvent> { &mut self.base }
//!
//!     fn when(&mut self, event: &CounterEvent) -> Result<(), Infallible> {
//!         match event {
//!             CounterEvent::Incremented(e) => self.value += e.by,
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut counter = Counter::new("c-1".to_string());
//! counter.record(CounterEvent::Incremented(Incremented { by: 2 })).unwrap();
//! assert_eq!(counter.value, 2);
//! assert_eq!(counter.pending_events().len(), 1);
//! ```

use crate::event::Event;
use crate::stream::{StreamName, Version};
use std::fmt;

/// Version and pending events of one aggregate instance.
///
/// `version` is the number of events already committed to the stream when
/// the aggregate was loaded (or last stored). Pending events are not counted.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateBase<E> {
    version: Version,
    pending: Vec<E>,
}

impl<E> AggregateBase<E> {
    /// A base for a never-persisted aggregate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            version: Version::INITIAL,
            pending: Vec::new(),
        }
    }

    /// Committed version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Set the committed version (after replay or a successful store).
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Queue an event for the next store.
    pub fn add_event(&mut self, event: E) {
        self.pending.push(event);
    }

    /// Events recorded since the last load or store, in recording order.
    #[must_use]
    pub fn events(&self) -> &[E] {
        &self.pending
    }

    /// Whether any event is waiting to be stored.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop all pending events.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl<E> Default for AggregateBase<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// An event-sourced aggregate root.
///
/// Implementors provide identity, access to their [`AggregateBase`] and the
/// state transition [`when`](Self::when). `when` must be pure and total over
/// the event enum: it is called both when recording new events and when
/// replaying stored ones, and replay must reproduce the exact same state.
pub trait Aggregate: Send + Sync + Sized {
    /// Aggregate type; the first segment of every stream name of this type.
    const AGGREGATE_TYPE: &'static str;

    /// Identifier type.
    type Id: Clone + fmt::Display + Send + Sync;

    /// The closed event enum of this aggregate.
    type Event: Event + Clone;

    /// Error raised when an event cannot be applied to the current state.
    type Error: std::error::Error + Send + Sync + 'static;

    /// A fresh, never-persisted instance.
    fn new(id: Self::Id) -> Self;

    /// The aggregate id.
    fn id(&self) -> &Self::Id;

    /// Shared version/pending state.
    fn base(&self) -> &AggregateBase<Self::Event>;

    /// Mutable shared version/pending state.
    fn base_mut(&mut self) -> &mut AggregateBase<Self::Event>;

    /// Apply one event to the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns the aggregate's error if the event is invalid for the current
    /// state. During replay this is fatal for the load.
    fn when(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Apply `event` and queue it for the next store.
    ///
    /// Nothing is queued if applying fails.
    ///
    /// # Errors
    ///
    /// Propagates the error from [`when`](Self::when).
    fn record(&mut self, event: Self::Event) -> Result<(), Self::Error> {
        self.when(&event)?;
        self.base_mut().add_event(event);
        Ok(())
    }

    /// Committed version (pending events excluded).
    fn version(&self) -> Version {
        self.base().version()
    }

    /// Events recorded since the last load or store.
    fn pending_events(&self) -> &[Self::Event] {
        self.base().events()
    }

    /// Stream name of an aggregate with this id.
    fn stream_name_for(id: &Self::Id) -> StreamName {
        StreamName::for_aggregate(Self::AGGREGATE_TYPE, id)
    }

    /// Stream name of this instance.
    fn stream_name(&self) -> StreamName {
        Self::stream_name_for(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventError, encode_payload};
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    enum LightEvent {
        SwitchedOn,
        SwitchedOff,
    }

    impl Event for LightEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::SwitchedOn => "SwitchedOn.v1",
                Self::SwitchedOff => "SwitchedOff.v1",
            }
        }

        fn to_payload(&self) -> Result<Vec<u8>, EventError> {
            encode_payload(&())
        }
    }

    #[derive(Error, Debug)]
    #[error("light is already {0}")]
    struct AlreadyInState(&'static str);

    struct Light {
        id: u32,
        on: bool,
        base: AggregateBase<LightEvent>,
    }

    impl Aggregate for Light {
        const AGGREGATE_TYPE: &'static str = "light";
        type Id = u32;
        type Event = LightEvent;
        type Error = AlreadyInState;

        fn new(id: u32) -> Self {
            Self {
                id,
                on: false,
                base: AggregateBase::new(),
            }
        }

        fn id(&self) -> &u32 {
            &self.id
        }

        fn base(&self) -> &AggregateBase<LightEvent> {
            &self.base
        }

        fn base_mut(&mut self) -> &mut AggregateBase<LightEvent> {
            &mut self.base
        }

        fn when(&mut self, event: &LightEvent) -> Result<(), AlreadyInState> {
            match (event, self.on) {
                (LightEvent::SwitchedOn, true) => Err(AlreadyInState("on")),
                (LightEvent::SwitchedOff, false) => Err(AlreadyInState("off")),
                (LightEvent::SwitchedOn, false) => {
                    self.on = true;
                    Ok(())
                }
                (LightEvent::SwitchedOff, true) => {
                    self.on = false;
                    Ok(())
                }
            }
        }
    }

    #[test]
    fn new_aggregate_is_unversioned_and_clean() {
        let light = Light::new(1);
        assert_eq!(light.version(), Version::INITIAL);
        assert!(light.pending_events().is_empty());
        assert_eq!(light.stream_name().as_str(), "light-1");
    }

    #[test]
    fn record_applies_then_queues() {
        let mut light = Light::new(1);
        assert!(light.record(LightEvent::SwitchedOn).is_ok());
        assert!(light.on);
        assert_eq!(light.pending_events(), &[LightEvent::SwitchedOn]);
        assert_eq!(light.version(), Version::INITIAL);
    }

    #[test]
    fn failed_apply_queues_nothing() {
        let mut light = Light::new(1);
        assert!(light.record(LightEvent::SwitchedOff).is_err());
        assert!(light.pending_events().is_empty());
    }

    #[test]
    fn clear_keeps_version() {
        let mut base = AggregateBase::new();
        base.add_event(LightEvent::SwitchedOn);
        base.set_version(Version::new(3));
        base.clear();
        assert!(!base.has_pending());
        assert_eq!(base.version(), Version::new(3));
    }
}
