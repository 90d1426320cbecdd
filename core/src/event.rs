//! The immutable event record and its errors.
//!
//! An [`Event`] is the unit of storage in the event store: identity,
//! stream, type, payload, per-stream version, wall-clock timestamp, and
//! optional correlation metadata. Events are constructed once via
//! [`Event::new`] and never mutated afterwards.

use crate::stream::{StreamId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while constructing or handling an [`Event`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// An already-constructed event cannot be mutated.
    ///
    /// Events are immutable facts; this error is returned by any API that
    /// would otherwise rebuild an event in place (used primarily by test
    /// helpers that probe this guarantee).
    #[error("event {0} is immutable and cannot be modified after construction")]
    ImmutableEventError(Uuid),

    /// Failed to serialize an event to its self-describing textual form.
    #[error("failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event from its self-describing textual form.
    #[error("failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An immutable unit of storage in the event store.
///
/// `Event` carries everything the store needs to persist and replay a fact
/// about something that happened: which stream it belongs to, what kind of
/// event it is, its JSON-serializable payload, its position in the stream,
/// when it was created, and an optional correlation id linking it to
/// related events across streams.
///
/// # Equality
///
/// Two events are equal iff their `event_id`s are equal, regardless of
/// their other fields — `event_id` is the identity of the fact.
///
/// # Examples
///
/// ```
/// use event_store_core::event::Event;
/// use event_store_core::stream::{StreamId, Version};
/// use serde_json::json;
///
/// let event = Event::new(
///     StreamId::new("order-123"),
///     "OrderPlaced".to_string(),
///     json!({ "total": 42.5 }),
///     Version::new(0),
///     None,
/// );
///
/// assert_eq!(event.stream_id(), &StreamId::new("order-123"));
/// assert_eq!(event.version(), Version::new(0));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    event_id: Uuid,
    stream_id: StreamId,
    event_type: String,
    data: serde_json::Value,
    version: Version,
    timestamp: DateTime<Utc>,
    correlation_id: Option<String>,
}

impl Event {
    /// Construct a new event.
    ///
    /// Assigns a fresh `event_id` and the current wall-clock `timestamp`.
    /// Use [`Event::with_metadata`] when the caller needs to control the
    /// identity or timestamp explicitly (e.g. deserializing a stored event,
    /// or deterministic tests).
    #[must_use]
    pub fn new(
        stream_id: StreamId,
        event_type: String,
        data: serde_json::Value,
        version: Version,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            stream_id,
            event_type,
            data,
            version,
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    /// Construct an event with an explicit identity and timestamp.
    ///
    /// This is the deserialization/reconstruction path: the backend reads
    /// back a previously constructed event's exact identity rather than
    /// minting a new one. It is not a mutation API — it always produces a
    /// brand new, independently immutable `Event` value.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn with_metadata(
        event_id: Uuid,
        stream_id: StreamId,
        event_type: String,
        data: serde_json::Value,
        version: Version,
        timestamp: DateTime<Utc>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            event_type,
            data,
            version,
            timestamp,
            correlation_id,
        }
    }

    /// The event's globally unique identity.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// The stream this event belongs to.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// The application-level event type tag.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The event's JSON-serializable payload.
    #[must_use]
    pub const fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// The event's 0-based position within its stream.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// When the event was constructed.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Optional opaque id linking this event to related events across streams.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Return a copy of this event with a different stream-relative version.
    ///
    /// Used internally by the write buffer and migrator when an event must
    /// be re-assigned a version (e.g. the version manager assigning
    /// `next_version` for a caller that didn't pre-assign one). The
    /// `event_id` — the event's identity — is preserved.
    #[must_use]
    pub fn with_version(&self, version: Version) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Attempt to change the event's payload in place.
    ///
    /// Events are immutable facts once constructed; this method always
    /// fails. It exists so that callers attempting to mutate a stored event
    /// (for example, a reducer holding a `&mut Event` by mistake) get an
    /// explicit, typed error instead of silently succeeding.
    ///
    /// # Errors
    ///
    /// Always returns [`EventError::ImmutableEventError`].
    pub fn set_data(&mut self, _data: serde_json::Value) -> Result<(), EventError> {
        Err(EventError::ImmutableEventError(self.event_id))
    }

    /// Serialize this event to its self-describing textual form (JSON).
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be
    /// serialized (only possible if `data` contains a non-finite float,
    /// which `serde_json` rejects).
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from its self-describing textual form (JSON).
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the text is not a
    /// valid serialized `Event`.
    pub fn from_json(text: &str) -> Result<Self, EventError> {
        serde_json::from_str(text).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for Event {}
