//! Request queue scenarios: ordered delivery, reconnects with duplicate
//! suppression, business failures, and peer-down escalation.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use lodestore::config::QueueConfig;
use lodestore::queue::{
    NodeServer, PerformError, QueueError, Request, RequestError, RequestHandler,
    RequestQueueClient, RequestQueueListener, RequestQueueServer, ServerDispatcher, TcpConnector,
};

/* -- Harness -- */

type Outcome = Result<(), RequestError>;

/// A numbered request whose payload is its number, big-endian.
struct NumberedRequest {
    n: u32,
    done: Arc<(Mutex<Option<Outcome>>, Condvar)>,
    on_complete: Option<Box<dyn Fn() + Send + Sync>>,
}

struct Completion(Arc<(Mutex<Option<Outcome>>, Condvar)>);

impl Completion {
    fn await_outcome(&self, timeout: Duration) -> Outcome {
        let (slot, changed) = &*self.0;
        let stop = Instant::now() + timeout;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            let now = Instant::now();
            assert!(now < stop, "request not completed in {timeout:?}");
            let (next, _) = changed.wait_timeout(guard, stop - now).unwrap();
            guard = next;
        }
        guard.clone().unwrap()
    }
}

fn request(n: u32) -> (Box<dyn Request>, Completion) {
    request_with_hook(n, None)
}

fn request_with_hook(
    n: u32,
    on_complete: Option<Box<dyn Fn() + Send + Sync>>,
) -> (Box<dyn Request>, Completion) {
    let done = Arc::new((Mutex::new(None), Condvar::new()));
    let request = NumberedRequest {
        n,
        done: Arc::clone(&done),
        on_complete,
    };
    (Box::new(request), Completion(done))
}

impl Request for NumberedRequest {
    fn payload(&self) -> io::Result<Vec<u8>> {
        Ok(self.n.to_be_bytes().to_vec())
    }

    fn completed(&self, result: Outcome) {
        let (slot, changed) = &*self.done;
        *slot.lock().unwrap() = Some(result);
        changed.notify_all();
        if let Some(hook) = &self.on_complete {
            hook();
        }
    }
}

/// Executes numbered requests, recording each performed number exactly
/// once; optionally fails one number as a business error.
struct RecordingHandler {
    performed: Arc<Mutex<Vec<u32>>>,
    fail_at: Option<u32>,
}

impl RequestHandler for RecordingHandler {
    type Request = u32;

    fn read_request(&mut self, payload: &[u8]) -> io::Result<u32> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad payload"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn perform_request(&mut self, n: u32) -> Result<(), PerformError> {
        if self.fail_at == Some(n) {
            return Err(PerformError::failed(format!("boom {n}")));
        }
        self.performed.lock().unwrap().push(n);
        Ok(())
    }
}

#[derive(Default)]
struct MapDispatcher {
    servers: Mutex<HashMap<i64, Arc<dyn NodeServer>>>,
}

impl MapDispatcher {
    fn set_server(&self, server: Arc<dyn NodeServer>) {
        self.servers
            .lock()
            .unwrap()
            .insert(server.node_id(), server);
    }
}

impl ServerDispatcher for MapDispatcher {
    fn server_for(&self, node_id: i64) -> Option<Arc<dyn NodeServer>> {
        self.servers.lock().unwrap().get(&node_id).cloned()
    }
}

/// Counts failures and remembers whether any arrived.
#[derive(Default)]
struct NoteFailure {
    count: AtomicUsize,
}

impl lodestore::queue::FailureReporter for NoteFailure {
    fn report_failure(&self, error: QueueError) {
        eprintln!("failure reported: {error}");
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

impl NoteFailure {
    fn called(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }

    fn await_called(&self, timeout: Duration) {
        let stop = Instant::now() + timeout;
        while !self.called() {
            assert!(Instant::now() < stop, "failure reporter not called");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

struct Fixture {
    listener: Option<RequestQueueListener>,
    server: Arc<RequestQueueServer<RecordingHandler>>,
    performed: Arc<Mutex<Vec<u32>>>,
    addr: String,
}

fn fixture(config: &QueueConfig, fail_at: Option<u32>) -> Fixture {
    let performed = Arc::new(Mutex::new(Vec::new()));
    let handler = RecordingHandler {
        performed: Arc::clone(&performed),
        fail_at,
    };
    let server = Arc::new(RequestQueueServer::new(1, handler, config).unwrap());
    let dispatcher = Arc::new(MapDispatcher::default());
    dispatcher.set_server(Arc::clone(&server) as Arc<dyn NodeServer>);
    let listener = RequestQueueListener::bind(
        "127.0.0.1:0",
        dispatcher,
        Arc::new(NoteFailure::default()),
        config,
    )
    .unwrap();
    let addr = listener.local_addr().to_string();
    Fixture {
        listener: Some(listener),
        server,
        performed,
        addr,
    }
}

fn test_config() -> QueueConfig {
    QueueConfig {
        max_retry_ms: 5_000,
        retry_wait_ms: 10,
        queue_size: 10,
        sent_queue_size: 10,
        ack_ring_size: 16,
        checkpoint_interval: 1,
    }
}

/* -- Tests -- */

#[test]
fn requests_complete_in_order() {
    let config = test_config();
    let mut fixture = fixture(&config, None);
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new(fixture.addr.clone())),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();

    let completions: Vec<_> = (1..=50)
        .map(|n| {
            let (request, completion) = request(n);
            client.add_request(request);
            completion
        })
        .collect();
    for completion in &completions {
        assert_eq!(completion.await_outcome(Duration::from_secs(5)), Ok(()));
    }
    assert_eq!(*fixture.performed.lock().unwrap(), (1..=50).collect::<Vec<_>>());

    client.shutdown();
    fixture.listener.take().unwrap().shutdown();
}

/// The server drops the connection after acknowledging
/// request 42. The client reconnects and replays its window; the server
/// re-acks the duplicates without re-executing. Every request performs
/// exactly once, in order.
#[test]
fn reconnect_suppresses_duplicates() {
    let config = test_config();
    let mut fixture = fixture(&config, None);
    let server = Arc::clone(&fixture.server);
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new(fixture.addr.clone())),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();

    let mut completions = Vec::new();
    for n in 1..=100u32 {
        let hook: Option<Box<dyn Fn() + Send + Sync>> = if n == 42 {
            let server = Arc::clone(&server);
            Some(Box::new(move || server.disconnect()))
        } else {
            None
        };
        let (request, completion) = request_with_hook(n, hook);
        client.add_request(request);
        completions.push(completion);
    }
    for completion in &completions {
        assert_eq!(completion.await_outcome(Duration::from_secs(10)), Ok(()));
    }

    let performed = fixture.performed.lock().unwrap().clone();
    assert_eq!(performed, (1..=100).collect::<Vec<_>>(), "exactly-once violated");

    client.shutdown();
    fixture.listener.take().unwrap().shutdown();
}

/// Randomized soak: the server connection is torn down repeatedly while
/// a stream of requests flows. Delivery must stay ordered and
/// exactly-once throughout.
#[test]
fn disconnect_storm_keeps_exactly_once_delivery() {
    let config = test_config();
    let mut fixture = fixture(&config, None);
    let server = Arc::clone(&fixture.server);
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new(fixture.addr.clone())),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();

    let storming = Arc::new(AtomicUsize::new(1));
    let storm_flag = Arc::clone(&storming);
    let storm = thread::spawn(move || {
        let mut rng = rand::thread_rng();
        while storm_flag.load(Ordering::SeqCst) == 1 {
            thread::sleep(Duration::from_millis(rng.gen_range(5..40)));
            server.disconnect();
        }
    });

    let total = 500u32;
    let mut completions = Vec::new();
    for n in 1..=total {
        let (request, completion) = request(n);
        client.add_request(request);
        completions.push(completion);
    }
    for completion in &completions {
        assert_eq!(completion.await_outcome(Duration::from_secs(30)), Ok(()));
    }
    storming.store(0, Ordering::SeqCst);
    storm.join().unwrap();

    let performed = fixture.performed.lock().unwrap().clone();
    assert_eq!(performed, (1..=total).collect::<Vec<_>>(), "exactly-once violated");

    client.shutdown();
    fixture.listener.take().unwrap().shutdown();
}

/// A server-side business failure is delivered to the
/// originating request and later requests proceed unaffected.
#[test]
fn business_failure_reaches_its_request_only() {
    let config = test_config();
    let mut fixture = fixture(&config, Some(3));
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new(fixture.addr.clone())),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();

    let completions: Vec<_> = (1..=5)
        .map(|n| {
            let (request, completion) = request(n);
            client.add_request(request);
            completion
        })
        .collect();

    for (i, completion) in completions.iter().enumerate() {
        let outcome = completion.await_outcome(Duration::from_secs(5));
        if i == 2 {
            assert_eq!(
                outcome,
                Err(RequestError::Failed {
                    message: "boom 3".to_string()
                })
            );
        } else {
            assert_eq!(outcome, Ok(()));
        }
    }
    assert_eq!(*fixture.performed.lock().unwrap(), vec![1, 2, 4, 5]);

    client.shutdown();
    fixture.listener.take().unwrap().shutdown();
}

#[test]
fn unreachable_peer_reports_down() {
    let config = QueueConfig {
        max_retry_ms: 200,
        retry_wait_ms: 10,
        ..test_config()
    };
    let reporter = Arc::new(NoteFailure::default());
    // Nothing listens on this address.
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new("127.0.0.1:9")),
        Arc::clone(&reporter) as Arc<dyn lodestore::queue::FailureReporter>,
        &config,
    )
    .unwrap();
    reporter.await_called(Duration::from_secs(5));
    client.shutdown();
}

#[test]
fn silent_server_reports_down() {
    // A raw listener that accepts and then never acks.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept = thread::spawn(move || {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept() {
            held.push(stream);
            if held.len() > 8 {
                break;
            }
        }
    });

    let config = QueueConfig {
        max_retry_ms: 300,
        retry_wait_ms: 10,
        ..test_config()
    };
    let reporter = Arc::new(NoteFailure::default());
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new(addr)),
        Arc::clone(&reporter) as Arc<dyn lodestore::queue::FailureReporter>,
        &config,
    )
    .unwrap();
    let (request, completion) = request(1);
    client.add_request(request);

    reporter.await_called(Duration::from_secs(5));
    assert_eq!(
        completion.await_outcome(Duration::from_secs(5)),
        Err(RequestError::Cancelled)
    );
    client.shutdown();
    drop(accept);
}

#[test]
fn shutdown_cancels_unsent_requests() {
    // No server at all; requests sit in the pending queue.
    let config = QueueConfig {
        max_retry_ms: 60_000,
        retry_wait_ms: 20,
        ..test_config()
    };
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new("127.0.0.1:9")),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();
    let (request, completion) = request(1);
    client.add_request(request);

    client.shutdown();
    assert_eq!(
        completion.await_outcome(Duration::from_secs(5)),
        Err(RequestError::Cancelled)
    );
}

#[test]
fn bounded_add_request_returns_the_request_on_timeout() {
    // No server: nothing drains, so a tiny queue fills immediately.
    let config = QueueConfig {
        max_retry_ms: 60_000,
        retry_wait_ms: 20,
        queue_size: 1,
        sent_queue_size: 1,
        ack_ring_size: 1,
        checkpoint_interval: 1,
    };
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new("127.0.0.1:9")),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();

    let (first, _first_done) = request(1);
    client.add_request(first);
    // Give the worker a moment to pull the first request or not; either
    // way the second and third cannot both fit.
    let (second, _second_done) = request(2);
    let _ = client.add_request_timeout(second, Duration::from_millis(10));
    let (third, _third_done) = request(3);
    let outcome = client.add_request_timeout(third, Duration::from_millis(50));
    assert!(outcome.is_err(), "third request must bounce on a full queue");

    client.shutdown();
}

#[test]
fn add_request_after_shutdown_is_fatal() {
    let config = test_config();
    let client = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new("127.0.0.1:9")),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .unwrap();
    client.shutdown();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let (request, _completion) = request(1);
        client.add_request(request);
    }));
    assert!(result.is_err(), "add_request after shutdown must panic");
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let config = QueueConfig {
        queue_size: 0,
        ..test_config()
    };
    let err = RequestQueueClient::new(
        1,
        Box::new(TcpConnector::new("127.0.0.1:9")),
        Arc::new(NoteFailure::default()),
        &config,
    )
    .err()
    .expect("queue_size 0 must be rejected");
    assert!(err.to_string().contains("queue_size"));
}
