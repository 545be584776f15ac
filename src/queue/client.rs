//! Client half of the reliable request queue.
//!
//! A single worker thread owns the socket. Requests flow through a
//! bounded pending channel (back-pressure for `add_request`) into a
//! sent-but-unacknowledged window. On reconnect the window is replayed in
//! original order with the seqno counter rewound to just past the last
//! acknowledged request, so every resent request reproduces its sequence
//! position and the server can suppress it. A companion reader thread
//! turns acks from the socket into channel messages for the worker.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, QueueConfig};
use crate::core::time::{deadline_saturating, now_millis};

use super::frame::{self, Ack, FrameError};
use super::request::{Connector, QueueError, Request, RequestError, SharedFailureReporter};

/// The client end of an ordered, reliable request channel to one peer
/// node.
pub struct RequestQueueClient {
    node_id: i64,
    incoming: Sender<Box<dyn Request>>,
    shutdown: Arc<AtomicBool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueueClient {
    /// Creates the client and starts its worker thread.
    pub fn new(
        node_id: i64,
        connector: Box<dyn Connector>,
        reporter: SharedFailureReporter,
        config: &QueueConfig,
    ) -> Result<Self, ConfigError> {
        assert!(node_id >= 0, "node_id must be non-negative, got {node_id}");
        config.validate()?;
        let (incoming, receiver) = channel::bounded(config.queue_size);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            node_id,
            config: config.clone(),
            connector,
            reporter,
            incoming: receiver,
            incoming_open: true,
            shutdown: Arc::clone(&shutdown),
            sent: VecDeque::new(),
            next_seqno: 1,
            last_acked: 0,
        };
        let join = thread::Builder::new()
            .name(format!("request-queue-client-{node_id}"))
            .spawn(move || worker.run())
            .expect("spawn request queue worker");
        Ok(Self {
            node_id,
            incoming,
            shutdown,
            worker: std::sync::Mutex::new(Some(join)),
        })
    }

    /// Queues a request for in-order delivery. Blocks while the pending
    /// queue is at capacity.
    ///
    /// Panics once the queue has been shut down or its worker has died;
    /// both are fatal conditions for the node.
    pub fn add_request(&self, request: Box<dyn Request>) {
        if self.shutdown.load(Ordering::Acquire) {
            panic!("request queue client {} is shut down", self.node_id);
        }
        if self.incoming.send(request).is_err() {
            panic!(
                "request queue client {} worker has terminated",
                self.node_id
            );
        }
    }

    /// Bounded variant of [`add_request`](Self::add_request): gives up
    /// after `timeout` and hands the request back untouched instead of
    /// blocking indefinitely on a full queue.
    pub fn add_request_timeout(
        &self,
        request: Box<dyn Request>,
        timeout: Duration,
    ) -> Result<(), Box<dyn Request>> {
        if self.shutdown.load(Ordering::Acquire) {
            panic!("request queue client {} is shut down", self.node_id);
        }
        match self.incoming.send_timeout(request, timeout) {
            Ok(()) => Ok(()),
            Err(channel::SendTimeoutError::Timeout(request)) => Err(request),
            Err(channel::SendTimeoutError::Disconnected(_)) => panic!(
                "request queue client {} worker has terminated",
                self.node_id
            ),
        }
    }

    /// Stops the queue: already-queued requests are drained best-effort
    /// while the connection holds, then everything still outstanding is
    /// completed with [`RequestError::Cancelled`]. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self
            .worker
            .lock()
            .expect("worker handle poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct SentRequest {
    seqno: u32,
    payload: Vec<u8>,
    request: Box<dyn Request>,
}

enum Event {
    Ack(Ack),
    ReaderClosed,
    Incoming(Box<dyn Request>),
    IncomingClosed,
    Tick,
}

enum ConnectionEnd {
    /// Transport trouble; close, retry, resend.
    Reconnect,
    /// Drained (or gave up draining) during shutdown.
    Drained,
    /// Connected but no ack arrived within the retry budget.
    Fatal { elapsed_ms: u64 },
}

struct Worker {
    node_id: i64,
    config: QueueConfig,
    connector: Box<dyn Connector>,
    reporter: SharedFailureReporter,
    incoming: Receiver<Box<dyn Request>>,
    incoming_open: bool,
    shutdown: Arc<AtomicBool>,
    sent: VecDeque<SentRequest>,
    next_seqno: u32,
    last_acked: u32,
}

impl Worker {
    fn run(mut self) {
        debug!(node_id = self.node_id, "request queue client started");
        let mut no_progress_since = now_millis();
        loop {
            if self.shutdown_requested() && self.outstanding_empty() {
                break;
            }
            let end = match self.connector.connect() {
                Ok(stream) => self.run_connection(stream, &mut no_progress_since),
                Err(err) => {
                    warn!(node_id = self.node_id, %err, "connect failed");
                    ConnectionEnd::Reconnect
                }
            };
            match end {
                ConnectionEnd::Reconnect => {
                    if self.shutdown_requested() {
                        break;
                    }
                    let now = now_millis();
                    let elapsed_ms = now.saturating_sub(no_progress_since);
                    if elapsed_ms >= self.config.max_retry_ms {
                        self.reporter.report_failure(QueueError::PeerDown {
                            node_id: self.node_id,
                            elapsed_ms,
                        });
                        break;
                    }
                    thread::sleep(Duration::from_millis(self.config.retry_wait_ms));
                }
                ConnectionEnd::Drained => break,
                ConnectionEnd::Fatal { elapsed_ms } => {
                    self.reporter.report_failure(QueueError::PeerDown {
                        node_id: self.node_id,
                        elapsed_ms,
                    });
                    break;
                }
            }
        }
        self.cancel_outstanding();
        debug!(node_id = self.node_id, "request queue client stopped");
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || !self.incoming_open
    }

    fn outstanding_empty(&self) -> bool {
        self.sent.is_empty() && self.incoming.is_empty()
    }

    fn run_connection(
        &mut self,
        stream: TcpStream,
        no_progress_since: &mut u64,
    ) -> ConnectionEnd {
        if let Err(err) = self.start_connection(&stream) {
            warn!(node_id = self.node_id, %err, "handshake failed");
            let _ = stream.shutdown(Shutdown::Both);
            return ConnectionEnd::Reconnect;
        }
        debug!(
            node_id = self.node_id,
            resent = self.sent.len(),
            "connected"
        );

        let reader_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!(node_id = self.node_id, %err, "socket clone failed");
                let _ = stream.shutdown(Shutdown::Both);
                return ConnectionEnd::Reconnect;
            }
        };
        let (ack_tx, ack_rx) = channel::unbounded();
        let reader = thread::spawn(move || run_ack_reader(reader_stream, ack_tx));

        let end = self.connection_loop(&stream, &ack_rx, no_progress_since);

        // Always tear the socket down so the reader unblocks and exits.
        let _ = stream.shutdown(Shutdown::Both);
        let _ = reader.join();
        end
    }

    /// Handshakes and replays the sent window with rewound seqnos.
    fn start_connection(&mut self, stream: &TcpStream) -> Result<(), FrameError> {
        stream.set_nodelay(true)?;
        let mut writer = stream;
        frame::write_handshake(&mut writer, self.node_id)?;
        let mut seqno = self.last_acked.wrapping_add(1);
        for sent in self.sent.iter_mut() {
            sent.seqno = seqno;
            frame::write_request(&mut writer, seqno, &sent.payload)?;
            seqno = seqno.wrapping_add(1);
        }
        self.next_seqno = seqno;
        Ok(())
    }

    fn connection_loop(
        &mut self,
        stream: &TcpStream,
        ack_rx: &Receiver<Ack>,
        no_progress_since: &mut u64,
    ) -> ConnectionEnd {
        let mut writer = stream;
        let mut drain_deadline = None;
        loop {
            if self.shutdown_requested() {
                if self.outstanding_empty() {
                    return ConnectionEnd::Drained;
                }
                let deadline = *drain_deadline.get_or_insert_with(|| {
                    deadline_saturating(now_millis(), self.config.max_retry_ms)
                });
                if now_millis() >= deadline {
                    debug!(node_id = self.node_id, "shutdown drain deadline expired");
                    return ConnectionEnd::Drained;
                }
            }

            if self.sent.is_empty() {
                // Nothing outstanding: an idle connection is not failing.
                *no_progress_since = now_millis();
            } else {
                let elapsed_ms = now_millis().saturating_sub(*no_progress_since);
                if elapsed_ms >= self.config.max_retry_ms {
                    return ConnectionEnd::Fatal { elapsed_ms };
                }
            }

            match self.next_event(ack_rx) {
                Event::Ack(ack) => {
                    if let Err(reason) = self.apply_ack(ack, no_progress_since) {
                        warn!(node_id = self.node_id, reason, "bad ack");
                        return ConnectionEnd::Reconnect;
                    }
                }
                Event::ReaderClosed => return ConnectionEnd::Reconnect,
                Event::Incoming(request) => {
                    if let Err(err) = self.send_request(&mut writer, request) {
                        warn!(node_id = self.node_id, %err, "send failed");
                        return ConnectionEnd::Reconnect;
                    }
                }
                Event::IncomingClosed => {
                    // The client handle was dropped; drain like shutdown.
                    self.incoming_open = false;
                }
                Event::Tick => {}
            }
        }
    }

    fn next_event(&self, ack_rx: &Receiver<Ack>) -> Event {
        let incoming = &self.incoming;
        let tick = channel::after(Duration::from_millis(25));
        if self.incoming_open && self.sent.len() < self.config.sent_queue_size {
            channel::select! {
                recv(ack_rx) -> msg => msg.map(Event::Ack).unwrap_or(Event::ReaderClosed),
                recv(incoming) -> msg => {
                    msg.map(Event::Incoming).unwrap_or(Event::IncomingClosed)
                },
                recv(tick) -> _ => Event::Tick,
            }
        } else {
            channel::select! {
                recv(ack_rx) -> msg => msg.map(Event::Ack).unwrap_or(Event::ReaderClosed),
                recv(tick) -> _ => Event::Tick,
            }
        }
    }

    /// Serializes and ships one request, moving it into the sent window.
    /// The request stays queued even when the write fails, so a reconnect
    /// replays it.
    fn send_request(
        &mut self,
        writer: &mut impl Write,
        request: Box<dyn Request>,
    ) -> Result<(), FrameError> {
        let payload = match request.payload() {
            Ok(payload) => payload,
            Err(err) => {
                // A request that cannot serialize is failed locally and
                // never occupies the window.
                request.completed(Err(RequestError::Failed {
                    message: format!("serialize: {err}"),
                }));
                return Ok(());
            }
        };
        let seqno = self.next_seqno;
        self.next_seqno = self.next_seqno.wrapping_add(1);
        trace!(node_id = self.node_id, seqno, len = payload.len(), "send");
        let result = frame::write_request(writer, seqno, &payload);
        self.sent.push_back(SentRequest {
            seqno,
            payload,
            request,
        });
        result
    }

    /// Applies one ack: completes every sent request up to and including
    /// its seqno, the last with the ack's outcome and the earlier ones
    /// successfully. The server acks each request individually, so the
    /// loop pops exactly one entry in practice; the cumulative form is
    /// tolerated for generality.
    fn apply_ack(&mut self, ack: Ack, no_progress_since: &mut u64) -> Result<(), String> {
        if ack.seqno <= self.last_acked {
            trace!(node_id = self.node_id, seqno = ack.seqno, "stale ack ignored");
            return Ok(());
        }
        let covered = self
            .sent
            .back()
            .is_some_and(|newest| ack.seqno <= newest.seqno);
        if !covered {
            return Err(format!("ack for unsent seqno {}", ack.seqno));
        }
        while let Some(head) = self.sent.front() {
            if head.seqno > ack.seqno {
                break;
            }
            let head = self
                .sent
                .pop_front()
                .expect("sent window head vanished");
            let result = if head.seqno == ack.seqno {
                match &ack.failure {
                    Some(message) => Err(RequestError::Failed {
                        message: message.clone(),
                    }),
                    None => Ok(()),
                }
            } else {
                Ok(())
            };
            trace!(node_id = self.node_id, seqno = head.seqno, "completed");
            head.request.completed(result);
        }
        self.last_acked = ack.seqno;
        *no_progress_since = now_millis();
        Ok(())
    }

    fn cancel_outstanding(&mut self) {
        for sent in self.sent.drain(..) {
            sent.request.completed(Err(RequestError::Cancelled));
        }
        while let Ok(request) = self.incoming.try_recv() {
            request.completed(Err(RequestError::Cancelled));
        }
    }
}

fn run_ack_reader(mut stream: TcpStream, acks: Sender<Ack>) {
    loop {
        match frame::read_ack(&mut stream) {
            Ok(Some(ack)) => {
                if acks.send(ack).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                trace!(%err, "ack reader stopped");
                break;
            }
        }
    }
}
