//! Reliable event delivery.
//!
//! [`EventDispatcher`] delivers events through a [`Transport`], parks failed ones in an
//! [`EventStore`] and redelivers them oldest first with exponential backoff. Delivery is
//! at-least-once: a record leaves the store only after a 2xx response or once its retry budget is
//! exhausted.
//!
//! [`EventProcessor`] runs the dispatcher on a background thread so that callers never wait on
//! the network.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    clock::Clock,
    event::EventRecord,
    retry::RetryPolicy,
    single_flight::InFlight,
    storage::{EventStore, InMemoryEventStore, StoredRecord},
    transport::{HttpRequest, Transport},
    Error, Result,
};

/// Configuration for [`EventDispatcher`].
#[derive(Debug, Clone)]
pub struct EventDispatcherConfig {
    /// URL that event payloads are posted to.
    pub endpoint: String,
    /// Timeout of a single delivery request.
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Number of records read from the store at a time while flushing.
    pub batch_size: usize,
}

impl EventDispatcherConfig {
    /// Default value for [`EventDispatcherConfig::endpoint`].
    pub const DEFAULT_ENDPOINT: &'static str = "https://logx.optimizely.com/v1/events";
    /// Default value for [`EventDispatcherConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default value for [`EventDispatcherConfig::batch_size`].
    pub const DEFAULT_BATCH_SIZE: usize = 100;
}

impl Default for EventDispatcherConfig {
    fn default() -> Self {
        EventDispatcherConfig {
            endpoint: EventDispatcherConfig::DEFAULT_ENDPOINT.to_owned(),
            timeout: EventDispatcherConfig::DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            batch_size: EventDispatcherConfig::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Result of a [`EventDispatcher::flush`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records delivered by this flush.
    pub delivered: usize,
    /// Records dropped by this flush because their retry budget ran out.
    pub dropped: usize,
    /// Records left in the queue.
    pub remaining: usize,
    /// `true` if another flush was already running and this call did nothing.
    pub in_progress: bool,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    first_failure: Instant,
    next_attempt: Instant,
}

struct Queue {
    store: Arc<dyn EventStore + Send + Sync>,
    /// Set once the store failed and was replaced by an in-memory one.
    degraded: bool,
    /// Backoff bookkeeping by store id. Records without an entry (e.g., left by a previous
    /// process) are eligible immediately.
    retries: HashMap<u64, RetryState>,
}

enum Attempt {
    Delivered,
    /// Failed, but will be retried later.
    Deferred,
    Dropped,
}

pub struct EventDispatcher {
    transport: Arc<dyn Transport + Send + Sync>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: EventDispatcherConfig,
    queue: Mutex<Queue>,
    flushing: AtomicBool,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn new(
        transport: Arc<dyn Transport + Send + Sync>,
        store: Arc<dyn EventStore + Send + Sync>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: EventDispatcherConfig,
    ) -> EventDispatcher {
        EventDispatcher {
            transport,
            clock,
            config,
            queue: Mutex::new(Queue {
                store,
                degraded: false,
                retries: HashMap::new(),
            }),
            flushing: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver `record`, queueing it for redelivery on failure, then flush the queue.
    ///
    /// If older records are still queued, `record` is queued behind them instead of being sent
    /// first.
    pub fn dispatch(&self, record: &EventRecord) -> FlushOutcome {
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!(target: "splitkit",
                            record_id = record.id,
                            err:display = err;
                            "failed to serialize event, dropping it");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return self.flush();
            }
        };

        if self.pending_count() > 0 {
            self.append(&bytes, None);
        } else {
            match self.send(record) {
                Ok(()) => {
                    log::debug!(target: "splitkit", record_id = record.id; "delivered event");
                }
                Err(err) => {
                    log::warn!(target: "splitkit",
                               record_id = record.id,
                               err:display = err;
                               "failed to deliver event, queueing it for retry");
                    let now = self.clock.now();
                    let state = RetryState {
                        attempts: 1,
                        first_failure: now,
                        next_attempt: now + self.config.retry_policy.retry_interval(1),
                    };
                    if self.config.retry_policy.is_exhausted(1, Duration::ZERO) {
                        self.report_drop(record.id);
                    } else {
                        self.append(&bytes, Some(state));
                    }
                }
            }
        }

        self.flush()
    }

    /// Queue `record` without attempting delivery.
    pub fn enqueue(&self, record: &EventRecord) {
        match serde_json::to_vec(record) {
            Ok(bytes) => self.append(&bytes, None),
            Err(err) => {
                log::error!(target: "splitkit",
                            record_id = record.id,
                            err:display = err;
                            "failed to serialize event, dropping it");
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Redeliver queued records, oldest first.
    ///
    /// Stops at the first record that is still backing off or fails again, so that records are
    /// delivered in order. Only one flush runs at a time. A concurrent call returns immediately
    /// with [`FlushOutcome::in_progress`] set.
    pub fn flush(&self) -> FlushOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.flushing) else {
            log::trace!(target: "splitkit", "flush already in progress");
            return FlushOutcome {
                in_progress: true,
                ..FlushOutcome::default()
            };
        };

        let mut outcome = FlushOutcome::default();
        'drain: loop {
            let batch = self.peek_oldest(self.config.batch_size.max(1));
            if batch.is_empty() {
                break;
            }
            for stored in batch {
                match self.redeliver(stored) {
                    Attempt::Delivered => outcome.delivered += 1,
                    Attempt::Dropped => outcome.dropped += 1,
                    Attempt::Deferred => break 'drain,
                }
            }
        }

        outcome.remaining = self.pending_count();
        if outcome.delivered > 0 || outcome.dropped > 0 {
            log::debug!(target: "splitkit",
                        delivered = outcome.delivered,
                        dropped = outcome.dropped,
                        remaining = outcome.remaining;
                        "flushed event queue");
        }
        outcome
    }

    fn redeliver(&self, stored: StoredRecord) -> Attempt {
        let now = self.clock.now();
        let state = self.lock_queue().retries.get(&stored.id).copied();
        if let Some(state) = state {
            if now < state.next_attempt {
                return Attempt::Deferred;
            }
        }

        let record = match serde_json::from_slice::<EventRecord>(&stored.bytes) {
            Ok(record) => record,
            Err(err) => {
                log::error!(target: "splitkit",
                            store_id = stored.id,
                            err:display = err;
                            "queued event is corrupt, dropping it");
                self.remove(stored.id);
                self.report_drop(stored.id);
                return Attempt::Dropped;
            }
        };

        match self.send(&record) {
            Ok(()) => {
                self.remove(stored.id);
                log::debug!(target: "splitkit", record_id = record.id; "redelivered event");
                Attempt::Delivered
            }
            Err(err) => {
                let attempts = state.map_or(1, |s| s.attempts + 1);
                let first_failure = state.map_or(now, |s| s.first_failure);
                let policy = &self.config.retry_policy;
                if policy.is_exhausted(attempts, now.saturating_duration_since(first_failure)) {
                    self.remove(stored.id);
                    self.report_drop(record.id);
                    return Attempt::Dropped;
                }

                let next_attempt = now + policy.retry_interval(attempts);
                log::warn!(target: "splitkit",
                           record_id = record.id,
                           attempts,
                           err:display = err;
                           "failed to redeliver event");
                self.lock_queue().retries.insert(
                    stored.id,
                    RetryState {
                        attempts,
                        first_failure,
                        next_attempt,
                    },
                );
                Attempt::Deferred
            }
        }
    }

    fn send(&self, record: &EventRecord) -> Result<()> {
        let body = serde_json::to_vec(&record.payload)
            .map_err(|err| Error::Serialization(Arc::new(err)))?;
        let request = HttpRequest::post_json(&self.config.endpoint, body, self.config.timeout);
        let response = self.transport.send(&request)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::HttpStatus(response.status))
        }
    }

    fn report_drop(&self, id: u64) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        log::error!(target: "splitkit",
                    record_id = id,
                    total_dropped = total;
                    "retry budget exhausted, dropping event");
    }

    /// Number of records waiting for redelivery.
    pub fn pending_count(&self) -> usize {
        let mut queue = self.lock_queue();
        match queue.store.count() {
            Ok(count) => count,
            Err(err) => {
                degrade(&mut queue, err);
                queue.store.count().unwrap_or(0)
            }
        }
    }

    /// Number of records dropped since this dispatcher was created.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn append(&self, bytes: &[u8], state: Option<RetryState>) {
        let mut queue = self.lock_queue();
        let id = match queue.store.append(bytes) {
            Ok(id) => id,
            Err(err) => {
                degrade(&mut queue, err);
                match queue.store.append(bytes) {
                    Ok(id) => id,
                    Err(err) => {
                        log::error!(target: "splitkit",
                                    err:display = err;
                                    "failed to queue event, dropping it");
                        drop(queue);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        };
        if let Some(state) = state {
            queue.retries.insert(id, state);
        }
    }

    fn peek_oldest(&self, n: usize) -> Vec<StoredRecord> {
        let mut queue = self.lock_queue();
        match queue.store.peek_oldest(n) {
            Ok(records) => records,
            Err(err) => {
                degrade(&mut queue, err);
                Vec::new()
            }
        }
    }

    fn remove(&self, id: u64) {
        let mut queue = self.lock_queue();
        queue.retries.remove(&id);
        if let Err(err) = queue.store.remove(id) {
            degrade(&mut queue, err);
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replace a failing store with an in-memory one for the rest of the session.
fn degrade(queue: &mut Queue, err: Error) {
    if queue.degraded {
        log::error!(target: "splitkit",
                    err:display = err;
                    "in-memory event store failed");
        return;
    }
    log::error!(target: "splitkit",
                err:display = err;
                "event store failed, queued events are kept in memory from now on");
    queue.store = Arc::new(InMemoryEventStore::new());
    queue.retries.clear();
    queue.degraded = true;
}

enum Command {
    Dispatch(Box<EventRecord>),
    Flush,
    Stop,
}

/// Background thread feeding an [`EventDispatcher`].
///
/// Events handed to [`EventProcessor::process`] are delivered in the order they were submitted.
/// The queue is also flushed on [`EventProcessor::flush`], on an optional timer, and on shutdown.
pub struct EventProcessor {
    dispatcher: Arc<EventDispatcher>,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventProcessor {
    /// Start the processor thread.
    pub fn start(
        dispatcher: Arc<EventDispatcher>,
        flush_interval: Option<Duration>,
    ) -> std::io::Result<EventProcessor> {
        let (sender, receiver) = mpsc::channel::<Command>();

        let join_handle = {
            let dispatcher = Arc::clone(&dispatcher);
            std::thread::Builder::new()
                .name("splitkit-events".to_owned())
                .spawn(move || loop {
                    let command = match flush_interval {
                        Some(interval) => match receiver.recv_timeout(interval) {
                            Ok(command) => command,
                            Err(RecvTimeoutError::Timeout) => Command::Flush,
                            Err(RecvTimeoutError::Disconnected) => Command::Stop,
                        },
                        None => receiver.recv().unwrap_or(Command::Stop),
                    };
                    match command {
                        Command::Dispatch(record) => {
                            dispatcher.dispatch(&record);
                        }
                        Command::Flush => {
                            dispatcher.flush();
                        }
                        Command::Stop => {
                            log::debug!(target: "splitkit", "event processor received stop command");
                            dispatcher.flush();
                            return;
                        }
                    }
                })?
        };

        Ok(EventProcessor {
            dispatcher,
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Hand `record` to the processor thread.
    ///
    /// After shutdown, records are queued for a later flush instead.
    pub fn process(&self, record: EventRecord) {
        let rejected = match &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(sender) => sender
                .send(Command::Dispatch(Box::new(record)))
                .err()
                .and_then(|err| match err.0 {
                    Command::Dispatch(record) => Some(*record),
                    _ => None,
                }),
            None => Some(record),
        };
        if let Some(record) = rejected {
            log::warn!(target: "splitkit",
                       record_id = record.id;
                       "event processor is stopped, queueing event");
            self.dispatcher.enqueue(&record);
        }
    }

    /// Ask the processor thread to flush the queue. Does not wait for the flush to finish.
    pub fn flush(&self) {
        if let Some(sender) = &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            // Error means that the thread exited. Nothing to flush with.
            let _ = sender.send(Command::Flush);
        }
    }

    /// Flush the queue and stop the processor thread, blocking until it exits.
    ///
    /// Calling it more than once is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = sender.send(Command::Stop);
        }

        let join_handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join_handle) = join_handle {
            join_handle
                .join()
                .map_err(|_| Error::EventProcessorPanicked)?;
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc, Mutex};

    use super::*;
    use crate::{
        clock::ManualClock,
        event::EventBuilder,
        project_config::tests::fixture,
        storage::{FileEventStore, InMemoryEventStore},
        transport::{
            tests::{response, ScriptedTransport},
            HttpResponse, TransportError,
        },
        Attributes, EventTags,
    };

    fn config() -> EventDispatcherConfig {
        EventDispatcherConfig {
            endpoint: "http://events.test/v1/events".to_owned(),
            retry_policy: RetryPolicy {
                backoff_coefficient: 2,
                initial_interval: Duration::from_secs(10),
                maximum_interval: Duration::from_secs(60),
                max_attempts: 3,
                max_elapsed: Duration::from_secs(3600),
            },
            ..EventDispatcherConfig::default()
        }
    }

    fn record(event_key: &str) -> EventRecord {
        let config = fixture();
        let event = config.event_by_key(event_key).unwrap();
        EventBuilder::new().build_conversion(
            &config,
            event,
            "user42",
            &Attributes::new(),
            &EventTags::new(),
            None,
        )
    }

    fn sent_event_keys(transport: &ScriptedTransport) -> Vec<String> {
        transport
            .requests()
            .iter()
            .map(|request| {
                let payload: serde_json::Value =
                    serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
                payload["visitors"][0]["snapshots"][0]["events"][0]["key"]
                    .as_str()
                    .unwrap()
                    .to_owned()
            })
            .collect()
    }

    #[test]
    fn delivers_immediately_on_success() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(204))));
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(ManualClock::new()),
            config(),
        );

        let outcome = dispatcher.dispatch(&record("purchase"));
        assert_eq!(outcome.remaining, 0);
        assert_eq!(dispatcher.pending_count(), 0);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://events.test/v1/events");
        assert_eq!(requests[0].header("content-type"), Some("application/json"));
    }

    #[test]
    fn timeout_then_backoff_then_redelivery() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        transport.push(Err(TransportError::Timeout));
        let clock = Arc::new(ManualClock::new());
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(InMemoryEventStore::new()),
            clock.clone(),
            config(),
        );

        // Delivery fails; the opportunistic flush finds the record still backing off.
        let outcome = dispatcher.dispatch(&record("purchase"));
        assert_eq!(outcome.remaining, 1);
        assert_eq!(outcome.delivered, 0);
        assert_eq!(transport.requests().len(), 1);

        // An immediate flush is a no-op.
        let outcome = dispatcher.flush();
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(transport.requests().len(), 1);

        // Once the backoff elapses, the record is redelivered and removed.
        clock.advance(Duration::from_secs(10));
        let outcome = dispatcher.flush();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn non_success_status_is_a_failure() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        transport.push(Ok(response(503)));
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(ManualClock::new()),
            config(),
        );
        assert_eq!(dispatcher.dispatch(&record("purchase")).remaining, 1);
    }

    #[test]
    fn backoff_grows_and_budget_drops_record() {
        let transport = Arc::new(ScriptedTransport::new(Err(TransportError::Connection(
            "refused".to_owned(),
        ))));
        let clock = Arc::new(ManualClock::new());
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(InMemoryEventStore::new()),
            clock.clone(),
            config(),
        );

        dispatcher.dispatch(&record("purchase"));
        assert_eq!(transport.requests().len(), 1);

        // Second attempt after the initial interval.
        clock.advance(Duration::from_secs(10));
        let outcome = dispatcher.flush();
        assert_eq!(outcome.remaining, 1);
        assert_eq!(transport.requests().len(), 2);

        // The interval doubled: 10s is not enough anymore.
        clock.advance(Duration::from_secs(10));
        dispatcher.flush();
        assert_eq!(transport.requests().len(), 2);

        // Third attempt exhausts the budget.
        clock.advance(Duration::from_secs(10));
        let outcome = dispatcher.flush();
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(dispatcher.dropped_count(), 1);
    }

    #[test]
    fn queued_records_keep_their_order() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        transport.push(Err(TransportError::Timeout));
        let clock = Arc::new(ManualClock::new());
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(InMemoryEventStore::new()),
            clock.clone(),
            config(),
        );

        dispatcher.dispatch(&record("purchase"));
        // The queue is not empty, so this one waits behind the failed record.
        dispatcher.dispatch(&record("signup"));
        assert_eq!(dispatcher.pending_count(), 2);
        assert_eq!(sent_event_keys(&transport), ["purchase"]);

        clock.advance(Duration::from_secs(10));
        let outcome = dispatcher.flush();
        assert_eq!(outcome.delivered, 2);
        assert_eq!(sent_event_keys(&transport), ["purchase", "purchase", "signup"]);
    }

    #[test]
    fn restart_redelivers_in_order() {
        let dir = tempfile::tempdir().unwrap();

        {
            let transport = Arc::new(ScriptedTransport::new(Err(TransportError::Timeout)));
            let dispatcher = EventDispatcher::new(
                transport,
                Arc::new(FileEventStore::open(dir.path()).unwrap()),
                Arc::new(ManualClock::new()),
                config(),
            );
            dispatcher.dispatch(&record("purchase"));
            dispatcher.dispatch(&record("signup"));
            assert_eq!(dispatcher.pending_count(), 2);
            // Process exits before the backoff elapses.
        }

        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(FileEventStore::open(dir.path()).unwrap()),
            Arc::new(ManualClock::new()),
            config(),
        );
        assert_eq!(dispatcher.pending_count(), 2);

        let outcome = dispatcher.flush();
        assert_eq!(outcome.delivered, 2);
        assert_eq!(sent_event_keys(&transport), ["purchase", "signup"]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn restart_mid_flush_keeps_unconfirmed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileEventStore::open(dir.path()).unwrap());
        store
            .append(&serde_json::to_vec(&record("purchase")).unwrap())
            .unwrap();
        store
            .append(&serde_json::to_vec(&record("signup")).unwrap())
            .unwrap();

        {
            // First record is confirmed, second fails; then the process "crashes".
            let transport = Arc::new(ScriptedTransport::new(Err(TransportError::Cancelled)));
            transport.push(Ok(response(200)));
            let dispatcher = EventDispatcher::new(
                transport,
                store.clone(),
                Arc::new(ManualClock::new()),
                config(),
            );
            let outcome = dispatcher.flush();
            assert_eq!(outcome.delivered, 1);
            assert_eq!(outcome.remaining, 1);
        }

        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(FileEventStore::open(dir.path()).unwrap()),
            Arc::new(ManualClock::new()),
            config(),
        );
        dispatcher.flush();
        assert_eq!(sent_event_keys(&transport), ["signup"]);
    }

    struct FailingStore;

    impl EventStore for FailingStore {
        fn append(&self, _bytes: &[u8]) -> Result<u64> {
            Err(Error::Persistence(Arc::new(std::io::Error::other("read-only"))))
        }
        fn peek_oldest(&self, _n: usize) -> Result<Vec<StoredRecord>> {
            Err(Error::Persistence(Arc::new(std::io::Error::other("read-only"))))
        }
        fn remove(&self, _id: u64) -> Result<()> {
            Err(Error::Persistence(Arc::new(std::io::Error::other("read-only"))))
        }
        fn count(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn failing_store_degrades_to_memory() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        transport.push(Err(TransportError::Timeout));
        let clock = Arc::new(ManualClock::new());
        let dispatcher = EventDispatcher::new(
            transport.clone(),
            Arc::new(FailingStore),
            clock.clone(),
            config(),
        );

        dispatcher.dispatch(&record("purchase"));
        assert_eq!(dispatcher.pending_count(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(dispatcher.flush().delivered, 1);
        assert_eq!(dispatcher.dropped_count(), 0);
    }

    /// Transport that blocks every request until released.
    struct GatedTransport {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Transport for GatedTransport {
        fn send(
            &self,
            _request: &HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(response(200))
        }
    }

    #[test]
    fn concurrent_flush_is_a_no_op() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let transport = Arc::new(GatedTransport {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append(&serde_json::to_vec(&record("purchase")).unwrap())
            .unwrap();
        let dispatcher = Arc::new(EventDispatcher::new(
            transport,
            store,
            Arc::new(ManualClock::new()),
            config(),
        ));

        let flushing = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || dispatcher.flush())
        };
        started_rx.recv().unwrap();

        let outcome = dispatcher.flush();
        assert!(outcome.in_progress);
        assert_eq!(outcome.delivered, 0);

        release_tx.send(()).unwrap();
        let outcome = flushing.join().unwrap();
        assert!(!outcome.in_progress);
        assert_eq!(outcome.delivered, 1);
    }

    #[test]
    fn processor_delivers_in_background_and_flushes_on_shutdown() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(200))));
        let dispatcher = Arc::new(EventDispatcher::new(
            transport.clone(),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(ManualClock::new()),
            config(),
        ));
        let processor = EventProcessor::start(dispatcher.clone(), None).unwrap();

        processor.process(record("purchase"));
        processor.process(record("signup"));
        processor.shutdown().unwrap();
        processor.shutdown().unwrap();

        assert_eq!(sent_event_keys(&transport), ["purchase", "signup"]);

        // After shutdown, records are parked in the queue.
        processor.process(record("purchase"));
        assert_eq!(dispatcher.pending_count(), 1);
        assert_eq!(transport.requests().len(), 2);
    }
}
