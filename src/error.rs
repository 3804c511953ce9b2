//! Error types shared across the core.
//!
//! Every control-plane request receives exactly one terminal reply; the
//! variants below are the stable set of outcomes a session can observe.
//! Errors are cheap to clone so the same terminal cause can be broadcast
//! to every session attached to a path.

/// Convenience result type used across the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Terminal outcome of a core operation.
///
/// The core never retries; retries are the caller's business. A session
/// that receives one of these must tear itself down, except for
/// [`CoreError::AuthNotCritical`], after which it may retry with
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Path name rejected syntactically.
    #[error("invalid path name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No path configuration matched the requested name.
    #[error("path '{0}' is not configured")]
    PathNotFound(String),

    /// Authentication failed after credentials were supplied.
    ///
    /// Callers must delay their response by at least
    /// [`PAUSE_AFTER_AUTH_ERROR`](crate::auth::PAUSE_AFTER_AUTH_ERROR)
    /// before surfacing this, to throttle brute force attempts.
    #[error("authentication failed: {0}")]
    AuthCritical(String),

    /// Credentials are missing or a challenge is expected; the session
    /// may retry after challenging the client.
    #[error("authentication required: {0}")]
    AuthNotCritical(String),

    /// The publisher slot is occupied and the path does not allow
    /// overriding.
    #[error("someone is already publishing to path '{0}'")]
    AlreadyPublishing(String),

    /// Read attempt on a path with no publisher and no on-demand source.
    #[error("no one is publishing to path '{0}'")]
    NoOnePublishing(String),

    /// The on-demand source did not become ready within the configured
    /// start timeout.
    #[error("source of path '{0}' did not become ready in time")]
    StartTimeout(String),

    /// The publisher terminated; delivered to every attached reader.
    #[error("source has been closed")]
    SourceClosed,

    /// Another publisher took over the slot (`override_publisher`).
    #[error("replaced by another publisher")]
    ReplacedByNewPublisher,

    /// A configuration reload invalidated the path.
    #[error("path configuration has changed")]
    ConfigurationChanged,

    /// The core (or the target path) is shutting down.
    #[error("terminated")]
    Terminated,

    /// The reader's write queue overflowed; the reader is too slow.
    #[error("write queue is full")]
    QueueOverflow,

    /// The path's `max_readers` limit was reached.
    #[error("too many readers on path '{0}'")]
    TooManyReaders(String),

    /// Invalid configuration, detected at load or reload.
    #[error("invalid configuration: {0}")]
    Conf(String),
}

impl CoreError {
    /// Shorthand for an [`CoreError::InvalidName`].
    pub(crate) fn invalid_name(name: &str, reason: &str) -> Self {
        CoreError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is an authentication failure that must be
    /// rate-limited before being surfaced.
    pub fn is_auth_critical(&self) -> bool {
        matches!(self, CoreError::AuthCritical(_))
    }
}
