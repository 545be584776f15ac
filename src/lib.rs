#![forbid(unsafe_code)]

//! Client-side core of a replicated object store: a binding cache with
//! negative-range information, a keyed reader/writer lock manager with
//! deadlock detection, and a reliable ordered request channel to the
//! central authority.

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod lock;
pub mod queue;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the component types at the crate root for convenience.
pub use crate::cache::{BindingCache, BindingEntry, CacheError, EntryState, Lookup};
pub use crate::config::{Config, ConfigError, LockConfig, QueueConfig};
pub use crate::core::{BindingKey, BindingState, ObjectId};
pub use crate::lock::{
    ConflictKind, LockConflict, LockManager, LockRequest, Locker, LockerId,
};
pub use crate::queue::{
    Ack, Connector, FailureReporter, ListenerError, LoggingFailureReporter, NodeServer,
    PerformError, QueueError, Request, RequestError, RequestHandler, RequestQueueClient,
    RequestQueueListener, RequestQueueServer, ServerDispatcher, TcpConnector,
};
