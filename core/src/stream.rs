//! Event stream identification and versioning types.
//!
//! This module defines strong types for event stream identification (`StreamId`)
//! and version control (`Version`) used throughout the event store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Unique identifier for an event stream.
///
/// A stream ID uniquely identifies one logical entity's ordered event
/// history — a user session, a memory buffer, a dead-letter queue. For
/// example:
/// - `"session-12345"`
/// - `"memory-buffer-abc-def"`
///
/// # Design
///
/// `StreamId` is a newtype wrapper around `String` that provides type
/// safety and clear intent in function signatures.
///
/// # Validation
///
/// - `FromStr::from_str()`: validates input (rejects the empty string).
/// - `From::from()` / `new()`: no validation, for trusted application data.
///
/// # Examples
///
/// ```
/// use event_store_core::stream::StreamId;
///
/// let stream_id = StreamId::new("order-12345");
/// assert_eq!(stream_id.as_str(), "order-12345");
///
/// let parsed: StreamId = "customer-abc".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("customer-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Event version number for optimistic concurrency control.
///
/// Versions start at 0 and increment by 1 for each event appended to a
/// stream. A stream's versions form the contiguous sequence `0,1,2,...`
/// with no gaps and no duplicates.
///
/// # Examples
///
/// ```
/// use event_store_core::stream::Version;
///
/// let v0 = Version::new(0);
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The initial version (0) for a new, empty event stream.
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

    /// Check if this is the initial version (0) of an empty stream.
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

#[cfg(test)]
mod tests {
    use super::*;

    mod stream_id_tests {
        use super::*;

        #[test]
        fn new_creates_stream_id() {
            let id = StreamId::new("order-123");
            assert_eq!(id.as_str(), "order-123");
        }

        #[test]
        fn parse_from_str() {
            let id: StreamId = "order-123".parse().expect("parse should succeed");
            assert_eq!(id, StreamId::new("order-123"));
        }

        #[test]
        fn parse_empty_string_fails() {
            let result = "".parse::<StreamId>();
            assert!(result.is_err());
        }

        #[test]
        fn display() {
            let id = StreamId::new("order-123");
            assert_eq!(format!("{id}"), "order-123");
        }

        #[test]
        fn equality() {
            let id1 = StreamId::new("order-123");
            let id2 = StreamId::new("order-123");
            let id3 = StreamId::new("order-456");

            assert_eq!(id1, id2);
            assert_ne!(id1, id3);
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn initial_version() {
            assert_eq!(Version::INITIAL, Version::new(0));
            assert!(Version::INITIAL.is_initial());
        }

        #[test]
        fn next_version() {
            let v0 = Version::new(0);
            let v1 = v0.next();
            let v2 = v1.next();

            assert_eq!(v1, Version::new(1));
            assert_eq!(v2, Version::new(2));
        }

        #[test]
        fn version_ordering() {
            let v1 = Version::new(1);
            let v2 = Version::new(2);
            let v3 = Version::new(3);

            assert!(v1 < v2);
            assert!(v2 < v3);
            assert!(v3 > v1);
        }

        #[test]
        fn version_from_u64() {
            let version = Version::from(42_u64);
            assert_eq!(version.value(), 42);

            let num: u64 = version.into();
            assert_eq!(num, 42);
        }

        #[test]
        fn is_initial() {
            assert!(Version::new(0).is_initial());
            assert!(!Version::new(1).is_initial());
            assert!(!Version::new(100).is_initial());
        }
    }
}
