//! The seams of the request queue: requests, handlers, connectors, and
//! failure reporting.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use thiserror::Error;

/// How a request completed on the client side.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The peer executed the request and it failed; the failure is final
    /// and the request is not retried.
    #[error("request failed on the peer: {message}")]
    Failed { message: String },
    /// The queue was shut down before the request was acknowledged.
    #[error("request cancelled by queue shutdown")]
    Cancelled,
}

/// Fatal queue failures handed to the [`FailureReporter`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The client made no progress against the peer for the configured
    /// retry budget; the node should be considered down.
    #[error("no progress contacting node {node_id} for {elapsed_ms} ms")]
    PeerDown { node_id: i64, elapsed_ms: u64 },
    /// The listener failed to accept connections for the configured
    /// retry budget.
    #[error("listener accept failures for {elapsed_ms} ms")]
    AcceptFailed { elapsed_ms: u64 },
}

/// An operation to ship to the peer node.
///
/// The payload is opaque to the queue; only the handler on the far side
/// interprets it. `completed` is invoked exactly once, in submission
/// order, from the queue's worker thread.
pub trait Request: Send {
    /// Serializes the request body (framing excluded).
    fn payload(&self) -> io::Result<Vec<u8>>;

    /// Completion callback: `Ok` if the peer executed the request
    /// successfully, otherwise the final error.
    fn completed(&self, result: Result<(), RequestError>);
}

/// Why performing a request failed on the server side.
#[derive(Debug, Error)]
pub enum PerformError {
    /// Transport-level trouble; the connection is aborted and the client
    /// will resend after reconnecting.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A business-level failure; serialized into the ack and delivered to
    /// the originating request, never retried.
    #[error("{message}")]
    Failed { message: String },
}

impl PerformError {
    pub fn failed(message: impl Into<String>) -> Self {
        PerformError::Failed {
            message: message.into(),
        }
    }
}

/// Server-side decoder and executor for one node's requests.
pub trait RequestHandler: Send {
    type Request;

    /// Decodes a request from its payload. An error aborts the
    /// connection.
    fn read_request(&mut self, payload: &[u8]) -> io::Result<Self::Request>;

    /// Executes a request. See [`PerformError`] for the failure split.
    fn perform_request(&mut self, request: Self::Request) -> Result<(), PerformError>;
}

/// Produces sockets to the peer; the client reconnects through this after
/// every transport failure.
pub trait Connector: Send {
    fn connect(&self) -> io::Result<TcpStream>;
}

/// The plain TCP connector.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(&self.addr)
    }
}

/// Receives the queue's fatal failures. Reported at most once per queue;
/// the node is expected to shut down in response.
pub trait FailureReporter: Send + Sync {
    fn report_failure(&self, error: QueueError);
}

/// A reporter that only logs; for callers that handle node death
/// elsewhere.
pub struct LoggingFailureReporter;

impl FailureReporter for LoggingFailureReporter {
    fn report_failure(&self, error: QueueError) {
        tracing::error!(%error, "request queue failure");
    }
}

pub type SharedFailureReporter = Arc<dyn FailureReporter>;
