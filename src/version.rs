//! Contains the types necessary for Optimistic Locking through versioning.

/// A version used for Optimistic Locking.
///
/// Used by [`sourced::Root`][crate::sourced::Root] to avoid concurrency
/// issues, and by the [Event Store][crate::event::store] to implement
/// stream-local ordering of persisted events.
pub type Version = u64;

/// The version expectation carried by an append to the Event Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Accept the append whatever the current version of the stream is.
    Any,

    /// Accept the append only if the current version of the stream
    /// is exactly the one specified.
    MustBe(Version),
}

impl Check {
    /// Verifies the expectation against the actual latest version of a stream.
    ///
    /// # Errors
    ///
    /// Returns a [`ConflictError`] when the expectation does not hold.
    pub fn verify(self, actual: Version) -> Result<(), ConflictError> {
        match self {
            Check::Any => Ok(()),
            Check::MustBe(expected) if expected == actual => Ok(()),
            Check::MustBe(expected) => Err(ConflictError { expected, actual }),
        }
    }
}

/// This error is returned by a function when a version conflict error has
/// been detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("conflict error detected, expected version was: {expected}, found: {actual}")]
pub struct ConflictError {
    /// The [Version] value that was expected when calling the function that failed.
    pub expected: Version,

    /// The actual [Version] value, which mismatch caused this error.
    pub actual: Version,
}
