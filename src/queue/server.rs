//! Server half of the reliable request queue: per-node execution with
//! duplicate suppression.
//!
//! One server exists per client node. It remembers the last executed
//! seqno (checkpointed through a callback so restarts do not re-execute
//! committed requests) and a bounded ring of recorded acks; a request at
//! or below the last seqno is a resend from a reconnect and is answered
//! from the ring without running again.

use std::collections::VecDeque;
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use tracing::{debug, trace, warn};

use crate::config::{ConfigError, QueueConfig};

use super::frame::{self, Ack};
use super::request::{PerformError, RequestHandler};

/// Checkpoint callback: receives the newly persisted-to seqno.
pub type CheckpointFn = Box<dyn FnMut(u32) + Send>;

/// Object-safe connection sink, implemented by [`RequestQueueServer`] for
/// any handler; the listener dispatches through this.
pub trait NodeServer: Send + Sync {
    fn node_id(&self) -> i64;

    /// Serves one connection until it drops or turns hostile. Any
    /// previous connection for the node is displaced first.
    fn handle_connection(&self, stream: TcpStream);
}

struct ServerState {
    last_seqno: u32,
    ack_ring: VecDeque<Ack>,
    acks_since_checkpoint: u32,
    current: Option<TcpStream>,
    generation: u64,
}

/// The server end of one node's request channel.
pub struct RequestQueueServer<H: RequestHandler> {
    node_id: i64,
    ack_ring_size: usize,
    checkpoint_interval: u32,
    handler: Mutex<HandlerState<H>>,
    state: Mutex<ServerState>,
}

/// The handler plus the checkpoint hook, locked together so that the
/// duplicate check, execution, and seqno advance are atomic per node:
/// requests execute strictly in submission order even when a stale
/// connection races its replacement.
struct HandlerState<H> {
    handler: H,
    checkpoint: Option<CheckpointFn>,
}

impl<H: RequestHandler> RequestQueueServer<H> {
    pub fn new(node_id: i64, handler: H, config: &QueueConfig) -> Result<Self, ConfigError> {
        Self::with_last_seqno(node_id, handler, config, 0)
    }

    /// Restores a server from persisted state: requests at or below
    /// `last_seqno` will be treated as already executed.
    pub fn with_last_seqno(
        node_id: i64,
        handler: H,
        config: &QueueConfig,
        last_seqno: u32,
    ) -> Result<Self, ConfigError> {
        assert!(node_id >= 0, "node_id must be non-negative, got {node_id}");
        config.validate()?;
        Ok(Self {
            node_id,
            ack_ring_size: config.ack_ring_size,
            checkpoint_interval: config.checkpoint_interval,
            handler: Mutex::new(HandlerState {
                handler,
                checkpoint: None,
            }),
            state: Mutex::new(ServerState {
                last_seqno,
                ack_ring: VecDeque::new(),
                acks_since_checkpoint: 0,
                current: None,
                generation: 0,
            }),
        })
    }

    /// Installs the checkpoint callback invoked with the last executed
    /// seqno every `checkpoint_interval` acks.
    pub fn on_checkpoint(self, checkpoint: CheckpointFn) -> Self {
        self.handler
            .lock()
            .expect("handler state poisoned")
            .checkpoint = Some(checkpoint);
        self
    }

    /// Severs the current connection, if any. The client reconnects and
    /// resends; nothing is lost.
    pub fn disconnect(&self) {
        let mut state = self.state.lock().expect("server state poisoned");
        if let Some(stream) = state.current.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// The last executed seqno, as the next checkpoint would record it.
    pub fn last_seqno(&self) -> u32 {
        self.state.lock().expect("server state poisoned").last_seqno
    }

    fn run_connection(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let my_generation = {
            let mut state = self.state.lock().expect("server state poisoned");
            if let Some(previous) = state.current.take() {
                debug!(node_id = self.node_id, "displacing previous connection");
                let _ = previous.shutdown(Shutdown::Both);
            }
            state.generation += 1;
            state.current = stream.try_clone().ok();
            state.generation
        };

        let mut stream = stream;
        loop {
            match frame::read_request(&mut stream) {
                Ok(Some((seqno, payload))) => {
                    let ack = match self.process(seqno, &payload) {
                        Ok(ack) => ack,
                        Err(reason) => {
                            warn!(node_id = self.node_id, reason, "aborting connection");
                            break;
                        }
                    };
                    if let Err(err) = frame::write_ack(&mut stream, &ack) {
                        debug!(node_id = self.node_id, %err, "ack write failed");
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(node_id = self.node_id, %err, "request read failed");
                    break;
                }
            }
        }
        let _ = stream.shutdown(Shutdown::Both);

        let mut state = self.state.lock().expect("server state poisoned");
        if state.generation == my_generation {
            state.current = None;
        }
    }

    /// Handles one request frame: duplicate re-ack, or in-order
    /// execution. An `Err` aborts the connection without advancing the
    /// seqno, so the client's resend gets another run.
    fn process(&self, seqno: u32, payload: &[u8]) -> Result<Ack, String> {
        let mut handler = self.handler.lock().expect("handler state poisoned");
        {
            let state = self.state.lock().expect("server state poisoned");
            if seqno <= state.last_seqno {
                trace!(node_id = self.node_id, seqno, "duplicate request");
                return match state.ack_ring.iter().find(|ack| ack.seqno == seqno) {
                    Some(ack) => Ok(ack.clone()),
                    None => Err(format!("duplicate seqno {seqno} fell out of the ack ring")),
                };
            }
            let expected = state.last_seqno.wrapping_add(1);
            if seqno != expected {
                return Err(format!("out-of-order seqno {seqno}, expected {expected}"));
            }
        }

        let failure = {
            let request = handler
                .handler
                .read_request(payload)
                .map_err(|err| format!("read request failed: {err}"))?;
            match handler.handler.perform_request(request) {
                Ok(()) => None,
                Err(PerformError::Failed { message }) => Some(message),
                Err(PerformError::Io(err)) => {
                    return Err(format!("perform request io failure: {err}"));
                }
            }
        };
        let ack = Ack { seqno, failure };

        let checkpoint_at = {
            let mut state = self.state.lock().expect("server state poisoned");
            state.last_seqno = seqno;
            state.ack_ring.push_back(ack.clone());
            while state.ack_ring.len() > self.ack_ring_size {
                state.ack_ring.pop_front();
            }
            state.acks_since_checkpoint += 1;
            if state.acks_since_checkpoint >= self.checkpoint_interval {
                state.acks_since_checkpoint = 0;
                true
            } else {
                false
            }
        };
        if checkpoint_at && let Some(checkpoint) = handler.checkpoint.as_mut() {
            checkpoint(seqno);
        }
        Ok(ack)
    }
}

impl<H: RequestHandler> NodeServer for RequestQueueServer<H> {
    fn node_id(&self) -> i64 {
        self.node_id
    }

    fn handle_connection(&self, stream: TcpStream) {
        self.run_connection(stream);
    }
}
