//! Per-stream version assignment and validation.
//!
//! The version manager issues the next version for an append and validates
//! caller-supplied versions. It is deliberately stateless and pure: it
//! takes the stream's currently-known last committed version as an input
//! rather than tracking state itself, so the same logic is reused
//! identically by the in-memory and SQL backends, each of which reads
//! "last committed" from its own storage under its own locking scheme.
//!
//! Validation happens inside the critical section of the backend's append
//! path (the transaction, or the exclusive mutex) — no caller-side locking
//! is required for correctness, only for efficiency.

use crate::stream::Version;

/// Compute the next version to assign for an append.
///
/// Returns `0` if the stream is empty (`last_committed` is `None`),
/// otherwise `last_committed + 1`.
///
/// # Examples
///
/// ```
/// use event_store_core::stream::Version;
/// use event_store_core::version_manager::next_version;
///
/// assert_eq!(next_version(None), Version::new(0));
/// assert_eq!(next_version(Some(Version::new(4))), Version::new(5));
/// ```
#[must_use]
pub fn next_version(last_committed: Option<Version>) -> Version {
    last_committed.map_or(Version::INITIAL, Version::next)
}

/// Validate that `version` is the correct next version given the stream's
/// current last committed version.
///
/// Succeeds iff `version == next_version(last_committed)`.
///
/// # Errors
///
/// Returns `Err(actual)` — the version the caller should have used — when
/// `version` does not match. The caller (the backend's append path) is
/// responsible for turning this into an `EventStoreError::ConcurrencyConflict`
/// with the stream id attached.
///
/// # Examples
///
/// ```
/// use event_store_core::stream::Version;
/// use event_store_core::version_manager::validate;
///
/// assert!(validate(Version::new(0), None).is_ok());
/// assert_eq!(validate(Version::new(1), None), Err(Version::new(0)));
/// ```
pub fn validate(version: Version, last_committed: Option<Version>) -> Result<(), Version> {
    let expected = next_version(last_committed);
    if version == expected {
        Ok(())
    } else {
        Err(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_on_empty_stream_is_zero() {
        assert_eq!(next_version(None), Version::new(0));
    }

    #[test]
    fn next_version_increments_last_committed() {
        assert_eq!(next_version(Some(Version::new(0))), Version::new(1));
        assert_eq!(next_version(Some(Version::new(41))), Version::new(42));
    }

    #[test]
    fn validate_accepts_exact_next_version() {
        assert!(validate(Version::new(0), None).is_ok());
        assert!(validate(Version::new(5), Some(Version::new(4))).is_ok());
    }

    #[test]
    fn validate_rejects_stale_version() {
        assert_eq!(validate(Version::new(0), Some(Version::new(0))), Err(Version::new(1)));
    }

    #[test]
    fn validate_rejects_version_too_far_ahead() {
        assert_eq!(validate(Version::new(5), None), Err(Version::new(0)));
    }
}
