/// Errors surfaced by this crate.
///
/// Only [`Error::LockOptionsValidation`], [`Error::LockTableConfigValidation`],
/// [`Error::LockNotGranted`], [`Error::Backend`] and [`Error::Other`] are ever returned
/// from a public method. [`Error::ConditionalCheckFailed`] is control flow internal to
/// the coordinator (it drives a retry, a renewal stop, or a release warn-and-swallow)
/// and is never constructed outside this crate; the enum is `#[non_exhaustive]` so
/// downstream code cannot rely on that variant ever reaching it.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `prolong_every_ms >= lease_duration_in_ms / 2` while prolongation is enabled, or
    /// some other `LockOptions` field failed validation. Raised synchronously before any
    /// backend call is made.
    #[error("lock options validation failed: {0}")]
    LockOptionsValidation(String),

    /// The table descriptor names a partition key, sort key or ttl key that collides
    /// with a reserved attribute name, or otherwise fails validation.
    #[error("lock table config validation failed: {0}")]
    LockTableConfigValidation(String),

    /// `lock()` could not acquire the lock: either the calling handle was already
    /// acquired, or `max_retry_count` attempts were exhausted without success.
    #[error("lock not granted: {0}")]
    LockNotGranted(String),

    /// Internal signal: the backend rejected a conditional write because the record's
    /// version (and, where applicable, owner) no longer matched what was expected. This
    /// variant is never returned to callers of [`crate::LockClient`] — it drives retry,
    /// a renewal stop-and-warn, or a release warn-and-swallow depending on call site.
    #[error("conditional check failed")]
    ConditionalCheckFailed,

    /// A transport-level or otherwise unrecognised error from the backend, propagated
    /// verbatim.
    #[error("dynamodb backend error: {0}")]
    Backend(String),

    /// Catch-all for context-carrying errors raised outside the acquisition hot path
    /// (e.g. table schema checks performed once at client construction).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn lock_options(msg: impl Into<String>) -> Self {
        Error::LockOptionsValidation(msg.into())
    }

    pub(crate) fn lock_table_config(msg: impl Into<String>) -> Self {
        Error::LockTableConfigValidation(msg.into())
    }

    pub(crate) fn lock_not_granted(msg: impl Into<String>) -> Self {
        Error::LockNotGranted(msg.into())
    }

    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }
}
