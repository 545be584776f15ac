//! The reliable request queue: an ordered, resumable client->server
//! channel that survives transient disconnects.
//!
//! Requests are delivered in submission order with at-most-once
//! execution. The client numbers each frame with a seqno and keeps a
//! bounded window of unacknowledged requests that it replays after a
//! reconnect; the server suppresses the duplicates by seqno and answers
//! them from a ring of recorded acks. Transport failures never reach
//! callers: the client reconnects internally and only surfaces
//! [`QueueError::PeerDown`] once the retry budget is exhausted, plus
//! per-request [`RequestError::Failed`] for business failures on the
//! server side.

pub mod frame;

mod client;
mod listener;
mod request;
mod server;

pub use client::RequestQueueClient;
pub use frame::Ack;
pub use listener::{ListenerError, RequestQueueListener, ServerDispatcher};
pub use request::{
    Connector, FailureReporter, LoggingFailureReporter, PerformError, QueueError, Request,
    RequestError, RequestHandler, SharedFailureReporter, TcpConnector,
};
pub use server::{CheckpointFn, NodeServer, RequestQueueServer};
