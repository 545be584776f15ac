use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::queue::{ListenerError, QueueError, RequestError};

/// Whether retrying an operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention or outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error: a thin wrapper over the component
/// errors, not a replacement for them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

impl Error {
    /// Classifies the error for abort/retry decisions. Waits that ran out
    /// (timeouts, interrupts) are worth retrying after the caller aborts;
    /// a dead peer, a failed request, or bad configuration is not.
    pub fn transience(&self) -> Transience {
        match self {
            Error::Cache(err) => match err {
                CacheError::Timeout { .. }
                | CacheError::Interrupted { .. }
                | CacheError::Busy { .. }
                | CacheError::Locked { .. } => Transience::Retryable,
                CacheError::NotCached { .. } => Transience::Permanent,
            },
            Error::Config(_) => Transience::Permanent,
            Error::Queue(_) => Transience::Permanent,
            Error::Request(err) => match err {
                RequestError::Failed { .. } => Transience::Permanent,
                RequestError::Cancelled => Transience::Permanent,
            },
            Error::Listener(_) => Transience::Permanent,
        }
    }
}
