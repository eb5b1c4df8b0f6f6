//! Stream identification, positions and optimistic concurrency tokens.
//!
//! Every aggregate instance owns exactly one stream. The stream name is derived
//! deterministically from the aggregate type and the aggregate id, so loading
//! and storing the same aggregate always address the same log.
//!
//! Three kinds of positions exist:
//!
//! - [`StreamPosition`]: 0-based index of an event inside its own stream
//! - [`Version`]: number of events ever committed to a stream (the next position)
//! - [`GlobalPosition`]: 1-based position in the global log, in commit order
//!
//! [`ExpectedVersion`] is the compare-and-swap token passed on append.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamName` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream name: {0}")]
pub struct ParseStreamNameError(String);

/// Name of an event stream (one per aggregate instance).
///
/// Aggregate streams are named `"{aggregate_type}-{id}"`, for example
/// `"order-7f1c…"`. Subscriptions filter on the aggregate type prefix.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// # Examples
///
/// ```
/// use eventline_core::stream::StreamName;
///
/// let name = StreamName::for_aggregate("order", "42");
/// assert_eq!(name.as_str(), "order-42");
/// assert!(name.has_prefix("order-"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    /// Create a new `StreamName` from a string.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Build the stream name of an aggregate instance.
    ///
    /// The mapping is 1:1: two different `(aggregate_type, id)` pairs never
    /// produce the same name as long as aggregate types do not contain `-`.
    #[must_use]
    pub fn for_aggregate(aggregate_type: &str, id: impl fmt::Display) -> Self {
        Self(format!("{aggregate_type}-{id}"))
    }

    /// Get the stream name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the stream name starts with `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Convert the `StreamName` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamName {
    type Err = ParseStreamNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamNameError(
                "Stream name cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 0-based index of an event within its stream.
///
/// The first event ever appended to a stream has position 0. Positions are
/// never reused, not even after a soft delete.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPosition(u64);

impl StreamPosition {
    /// Position of the first event in a stream.
    pub const START: Self = Self(0);

    /// Create a new `StreamPosition`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The stream version after the event at this position was committed.
    #[must_use]
    pub const fn version_after(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of events ever committed to a stream.
///
/// Versions start at 0 (nothing committed) and increment by 1 for each event
/// appended. The version is therefore also the position the next event will
/// receive.
///
/// # Examples
///
/// ```
/// use eventline_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!(v1.next_position().value(), 1);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a stream with no committed events.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Position the next appended event will receive.
    #[must_use]
    pub const fn next_position(self) -> StreamPosition {
        StreamPosition(self.0)
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Position of an event in the global log.
///
/// Global positions start at 1 and strictly increase in commit order across
/// all streams. Subscriptions and checkpoints are expressed in global
/// positions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    /// Position of the first event in the global log.
    pub const FIRST: Self = Self(1);

    /// Create a new `GlobalPosition`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compare-and-swap token for appends.
///
/// The append is rejected atomically when the stream is not in the expected
/// state. No events are written in that case.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// No check: append to whatever is there (creates the stream if absent).
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist and currently be at exactly this version.
    Exact(Version),
}

impl ExpectedVersion {
    /// Expected version for an aggregate loaded at `version`.
    ///
    /// `Version::INITIAL` means the aggregate was never persisted, so its
    /// stream must not exist.
    #[must_use]
    pub const fn from_loaded(version: Version) -> Self {
        if version.is_initial() {
            Self::NoStream
        } else {
            Self::Exact(version)
        }
    }

    /// Check this expectation against the current stream version.
    ///
    /// `current` is `None` when the stream does not exist (or was deleted).
    #[must_use]
    pub fn matches(self, current: Option<Version>) -> bool {
        match (self, current) {
            (Self::Any, _) | (Self::NoStream, None) => true,
            (Self::Exact(expected), Some(actual)) => expected == actual,
            (Self::NoStream, Some(_)) | (Self::Exact(_), None) => false,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}
