//! Accept loop: reads each connection's node handshake and hands the
//! socket to that node's server.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, QueueConfig};
use crate::core::time::now_millis;

use super::frame;
use super::request::{QueueError, SharedFailureReporter};
use super::server::NodeServer;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Resolves a handshaken node id to its server.
pub trait ServerDispatcher: Send + Sync {
    fn server_for(&self, node_id: i64) -> Option<Arc<dyn NodeServer>>;
}

/// Accepts connections for the request queue servers of this node.
pub struct RequestQueueListener {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl RequestQueueListener {
    pub fn bind(
        addr: impl ToSocketAddrs,
        dispatcher: Arc<dyn ServerDispatcher>,
        reporter: SharedFailureReporter,
        config: &QueueConfig,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_config = config.clone();
        let join = thread::Builder::new()
            .name("request-queue-listener".to_string())
            .spawn(move || {
                run_accept_loop(listener, dispatcher, reporter, accept_config, accept_shutdown);
            })
            .expect("spawn request queue listener");
        Ok(Self {
            shutdown,
            join,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.join.join();
    }
}

fn run_accept_loop(
    listener: TcpListener,
    dispatcher: Arc<dyn ServerDispatcher>,
    reporter: SharedFailureReporter,
    config: QueueConfig,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(err) = listener.set_nonblocking(true) {
        warn!(%err, "listener failed to set nonblocking");
        return;
    }
    let mut first_failure: Option<u64> = None;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                first_failure = None;
                let dispatcher = Arc::clone(&dispatcher);
                let handshake_timeout = config.max_retry_ms;
                thread::spawn(move || {
                    dispatch_connection(stream, peer, dispatcher, handshake_timeout);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                warn!(%err, "accept error");
                let now = now_millis();
                let since = *first_failure.get_or_insert(now);
                let elapsed_ms = now.saturating_sub(since);
                if elapsed_ms >= config.max_retry_ms {
                    reporter.report_failure(QueueError::AcceptFailed { elapsed_ms });
                    break;
                }
                thread::sleep(Duration::from_millis(config.retry_wait_ms));
            }
        }
    }
}

fn dispatch_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<dyn ServerDispatcher>,
    handshake_timeout_ms: u64,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(handshake_timeout_ms)));
    let node_id = match frame::read_handshake(&mut stream) {
        Ok(node_id) => node_id,
        Err(err) => {
            debug!(%peer, %err, "handshake failed");
            return;
        }
    };
    let _ = stream.set_read_timeout(None);
    match dispatcher.server_for(node_id) {
        Some(server) => {
            debug!(%peer, node_id, "connection dispatched");
            server.handle_connection(stream);
        }
        None => warn!(%peer, node_id, "connection for unknown node dropped"),
    }
}
