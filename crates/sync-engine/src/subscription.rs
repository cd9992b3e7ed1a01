//! Change-stream subscription manager.
//!
//! Keeps exactly one stream connection per session. Conversation switches
//! rebind the filter and handler on the live connection; only failures
//! recreate it. Every connect attempt gets a new generation and signals from
//! any other generation are dropped on arrival.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::MessagingRepositoryTrait;
use huddle_core::sync::{
    with_timeout, ChangeEvent, ChangeOp, ChangeStreamConnection, ChangeStreamTransport,
    SessionProvider, StreamFilter, StreamPayload, StreamSignal, StreamSink, SyncRetryClass,
};

use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Called after every successful (re)connect so missed changes get fetched.
pub type CatchUpListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct HandlerBinding {
    epoch: u64,
    handler: ChangeHandler,
}

pub struct SubscriptionManager {
    transport: Arc<dyn ChangeStreamTransport>,
    session: Arc<dyn SessionProvider>,
    messaging: Arc<dyn MessagingRepositoryTrait>,
    config: StreamConfig,
    token_timeout: std::time::Duration,

    generation: AtomicU64,
    binding_epoch: AtomicU64,
    /// Bumped by `disconnect` so an in-flight connect sequence gives up.
    session_epoch: AtomicU64,
    failures: AtomicU32,
    stopped: AtomicBool,

    connection: StdMutex<Option<Arc<dyn ChangeStreamConnection>>>,
    reconnect_lock: Mutex<()>,
    filter: RwLock<StreamFilter>,
    handlers: RwLock<HashMap<String, HandlerBinding>>,
    catch_up: RwLock<Option<CatchUpListener>>,
    last_seen: StdMutex<Option<Instant>>,
    last_attempt: StdMutex<Option<Instant>>,

    state: watch::Sender<ConnectionState>,
    sink: StreamSink,
    receiver: StdMutex<Option<mpsc::UnboundedReceiver<StreamSignal>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn ChangeStreamTransport>,
        session: Arc<dyn SessionProvider>,
        messaging: Arc<dyn MessagingRepositoryTrait>,
        config: StreamConfig,
        token_timeout: std::time::Duration,
        actor_id: Option<String>,
    ) -> Arc<Self> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            session,
            messaging,
            config,
            token_timeout,
            generation: AtomicU64::new(0),
            binding_epoch: AtomicU64::new(0),
            session_epoch: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            connection: StdMutex::new(None),
            reconnect_lock: Mutex::new(()),
            filter: RwLock::new(StreamFilter::for_conversation(actor_id, None)),
            handlers: RwLock::new(HashMap::new()),
            catch_up: RwLock::new(None),
            last_seen: StdMutex::new(None),
            last_attempt: StdMutex::new(None),
            state,
            sink,
            receiver: StdMutex::new(Some(receiver)),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn set_catch_up_listener(&self, listener: CatchUpListener) {
        if let Ok(mut slot) = self.catch_up.write() {
            *slot = Some(listener);
        }
    }

    /// Spawns the dispatcher and the watchdog, then connects in the
    /// background.
    pub fn start(self: &Arc<Self>) {
        let Some(receiver) = self.receiver.lock().ok().and_then(|mut r| r.take()) else {
            debug!("[Stream] Already started");
            return;
        };
        self.stopped.store(false, Ordering::SeqCst);

        let dispatcher = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.run_dispatcher(receiver).await })
        };
        let watchdog = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.run_watchdog().await })
        };
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(dispatcher);
            tasks.push(watchdog);
        }
        self.request_reconnect();
    }

    /// Fire-and-forget [`connect`](Self::connect).
    pub fn request_reconnect(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = manager.connect().await {
                warn!("[Stream] Gave up connecting: {}", err);
            }
        });
    }

    /// Runs one connect sequence: attempts with backoff until a connection is
    /// up. Returns `Ok(false)` when another sequence is already running or
    /// the manager was disconnected meanwhile.
    pub async fn connect(&self) -> Result<bool> {
        let Ok(_sequence) = self.reconnect_lock.try_lock() else {
            debug!("[Stream] Connect already in progress; request coalesced");
            return Ok(false);
        };
        let session_epoch = self.session_epoch.load(Ordering::SeqCst);

        if let Some(previous) = self.take_connection() {
            self.set_state(ConnectionState::Reconnecting);
            self.close_quietly(previous).await;
        }

        loop {
            if self.stopped.load(Ordering::SeqCst)
                || self.session_epoch.load(Ordering::SeqCst) != session_epoch
            {
                return Ok(false);
            }
            self.wait_for_cooldown().await;

            self.set_state(ConnectionState::Connecting);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(mut last_attempt) = self.last_attempt.lock() {
                *last_attempt = Some(Instant::now());
            }

            match self.open(generation).await {
                Ok(connection) => {
                    if self.generation() != generation
                        || self.session_epoch.load(Ordering::SeqCst) != session_epoch
                    {
                        self.close_quietly(Arc::from(connection)).await;
                        return Ok(false);
                    }
                    if let Ok(mut slot) = self.connection.lock() {
                        *slot = Some(Arc::from(connection));
                    }
                    self.touch();
                    self.failures.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    info!("[Stream] Connected (generation {})", generation);
                    self.notify_catch_up();
                    return Ok(true);
                }
                Err(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if err.retry_class() == SyncRetryClass::ReauthRequired {
                        self.session.reset().await;
                    }
                    if self
                        .config
                        .max_reconnect_attempts
                        .is_some_and(|max| failures >= max)
                    {
                        error!(
                            "[Stream] Connect failed {} time(s), staying disconnected: {}",
                            failures, err
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return Err(err);
                    }

                    let delay = self.config.backoff.delay(failures);
                    warn!(
                        "[Stream] Connect attempt {} failed, retrying in {}ms: {}",
                        failures,
                        delay.as_millis(),
                        err
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn open(&self, generation: u64) -> Result<Box<dyn ChangeStreamConnection>> {
        let token = self.session.get_valid_token(self.token_timeout).await?;
        let filter = self.current_filter();
        with_timeout(
            self.config.connect_timeout(),
            self.transport
                .connect(&token, generation, filter, self.sink.clone()),
        )
        .await
    }

    async fn wait_for_cooldown(&self) {
        let last_attempt = self.last_attempt.lock().ok().and_then(|last| *last);
        if let Some(last_attempt) = last_attempt {
            let ready_at = last_attempt + self.config.cooldown();
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }

    /// Points the stream at `conversation_id` and installs `handler` for its
    /// events, replacing every previous binding. The connection stays up
    /// unless the new filter cannot be written to it, in which case it is
    /// recreated with that filter.
    pub async fn bind_conversation(
        self: &Arc<Self>,
        conversation_id: Option<String>,
        handler: Option<ChangeHandler>,
    ) -> Result<u64> {
        let epoch = self.binding_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let filter = {
            let mut filter = self
                .filter
                .write()
                .map_err(|_| Error::Internal("stream filter lock poisoned".to_string()))?;
            filter.conversation_id = conversation_id.clone();
            filter.clone()
        };

        let mut table = HashMap::new();
        if let (Some(conversation_id), Some(handler)) = (conversation_id, handler) {
            table.insert(conversation_id, HandlerBinding { epoch, handler });
        }
        *self
            .handlers
            .write()
            .map_err(|_| Error::Internal("handler table lock poisoned".to_string()))? = table;

        if let Some(connection) = self.live_connection() {
            let written =
                with_timeout(self.config.write_timeout(), connection.set_filter(filter)).await;
            if let Err(err) = written {
                self.drop_connection(connection.generation(), "filter update", &err);
            }
        }
        debug!("[Stream] Bound conversation filter (epoch {})", epoch);
        Ok(epoch)
    }

    /// Closes the connection for logout. Signals still in the pipe become
    /// stale.
    pub async fn disconnect(&self) {
        self.session_epoch.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = self.take_connection() {
            self.close_quietly(connection).await;
        }
        self.failures.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        info!("[Stream] Disconnected");
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.disconnect().await;
    }

    async fn run_dispatcher(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<StreamSignal>) {
        while let Some(signal) = receiver.recv().await {
            self.dispatch(signal).await;
        }
        debug!("[Stream] Dispatcher stopped");
    }

    async fn dispatch(self: &Arc<Self>, signal: StreamSignal) {
        let current = self.generation();
        if signal.generation != current {
            debug!(
                "[Stream] Dropping signal from generation {} (current {})",
                signal.generation, current
            );
            return;
        }
        self.touch();

        match signal.payload {
            StreamPayload::Heartbeat => {}
            StreamPayload::Change(event) => {
                self.apply_change(&event).await;
                self.notify_handler(&event);
            }
            StreamPayload::Closed { reason } => {
                warn!(
                    "[Stream] Connection closed (generation {}): {}",
                    signal.generation, reason
                );
                self.set_state(ConnectionState::Reconnecting);
                self.request_reconnect();
            }
        }
    }

    async fn apply_change(&self, event: &ChangeEvent) {
        let result = match (event.op, &event.row) {
            (ChangeOp::Delete, _) => self
                .messaging
                .apply_remote_delete(event.collection, event.entity_id.clone())
                .await
                .map(|_| ()),
            (_, Some(row)) => self
                .messaging
                .apply_remote_rows(vec![row.clone()])
                .await
                .map(|report| {
                    if let Some(failure) = report.failure {
                        warn!(
                            "[Stream] Live {} {} not applied: {}",
                            event.collection, failure.entity_id, failure.error
                        );
                    }
                }),
            (_, None) => {
                debug!(
                    "[Stream] {:?} on {} {} without a row",
                    event.op, event.collection, event.entity_id
                );
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("[Stream] Failed to store live change: {}", err);
        }
    }

    fn notify_handler(&self, event: &ChangeEvent) {
        let Some(conversation_id) = event.conversation_id() else {
            return;
        };
        let binding = self
            .handlers
            .read()
            .ok()
            .and_then(|table| table.get(conversation_id).cloned());
        let Some(binding) = binding else {
            return;
        };
        // A rebind after the lookup retires this handler.
        if binding.epoch == self.binding_epoch.load(Ordering::SeqCst) {
            (binding.handler)(event);
        }
    }

    async fn run_watchdog(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) || self.state() != ConnectionState::Connected {
                continue;
            }

            let silent_for = self
                .last_seen
                .lock()
                .ok()
                .and_then(|seen| *seen)
                .map(|seen| seen.elapsed());
            if silent_for.is_some_and(|silent| silent > self.config.stale_after()) {
                warn!(
                    "[Stream] No traffic for {}ms, forcing reconnect",
                    silent_for.map(|s| s.as_millis()).unwrap_or_default()
                );
                self.set_state(ConnectionState::Reconnecting);
                self.request_reconnect();
                continue;
            }

            let Some(connection) = self.live_connection() else {
                continue;
            };
            let heartbeat =
                with_timeout(self.config.write_timeout(), connection.send_heartbeat()).await;
            if let Err(err) = heartbeat {
                self.drop_connection(connection.generation(), "heartbeat", &err);
            }
        }
    }

    fn live_connection(&self) -> Option<Arc<dyn ChangeStreamConnection>> {
        self.connection.lock().ok().and_then(|slot| slot.clone())
    }

    fn take_connection(&self) -> Option<Arc<dyn ChangeStreamConnection>> {
        self.connection.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn close_quietly(&self, connection: Arc<dyn ChangeStreamConnection>) {
        let generation = connection.generation();
        let closing = async {
            connection.close().await;
            Ok::<(), Error>(())
        };
        if let Err(err) = with_timeout(self.config.write_timeout(), closing).await {
            warn!("[Stream] Close of generation {} abandoned: {}", generation, err);
        }
    }

    /// Treats a failed or stuck write as a dead connection. A no-op when the
    /// connection was already replaced.
    fn drop_connection(self: &Arc<Self>, generation: u64, what: &str, err: &Error) {
        if self.generation() != generation {
            return;
        }
        warn!(
            "[Stream] {} failed on generation {}, reconnecting: {}",
            what, generation, err
        );
        self.set_state(ConnectionState::Reconnecting);
        self.request_reconnect();
    }

    fn current_filter(&self) -> StreamFilter {
        self.filter
            .read()
            .map(|filter| filter.clone())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Some(Instant::now());
        }
    }

    fn notify_catch_up(&self) {
        let listener = self.catch_up.read().ok().and_then(|slot| slot.clone());
        if let Some(listener) = listener {
            listener();
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("[Stream] {:?} -> {:?}", previous, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        eventually, harness, message, FakeTransport, StaticSession,
    };
    use huddle_core::messaging::MessagingRepositoryTrait;
    use huddle_core::sync::{BackoffPolicy, Collection, SyncRow};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manager(
        store: &huddle_storage_sqlite::LocalStore,
        transport: Arc<FakeTransport>,
        config: StreamConfig,
    ) -> Arc<SubscriptionManager> {
        SubscriptionManager::new(
            transport,
            Arc::new(StaticSession::new("tok")),
            Arc::new(store.messaging()),
            config,
            Duration::from_secs(1),
            Some("u1".to_string()),
        )
    }

    fn live_insert(id: &str) -> StreamPayload {
        let row = SyncRow::Message(message(id, "c1", "u2", 10));
        StreamPayload::Change(ChangeEvent {
            op: ChangeOp::Insert,
            collection: Collection::Messages,
            entity_id: id.to_string(),
            row: Some(row),
            filter_match: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_grow_up_to_the_cap_and_sequences_coalesce() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(3));
        let config = StreamConfig {
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.2, 5),
            cooldown_ms: 2_000,
            ..StreamConfig::default()
        };
        let manager = manager(&h.store, transport.clone(), config.clone());

        let (first, second) = tokio::join!(manager.connect(), manager.connect());
        assert!(first.expect("connect"));
        assert!(!second.expect("coalesced"));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.generation(), 4);

        let attempts = transport.attempts.lock().expect("lock").clone();
        assert_eq!(attempts.len(), 4);
        let gaps = attempts
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect::<Vec<_>>();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "gaps shrank: {gaps:?}");
        }
        for gap in &gaps {
            assert!(*gap >= config.cooldown());
            assert!(*gap <= config.backoff.cap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(10));
        let manager = manager(
            &h.store,
            transport.clone(),
            StreamConfig {
                max_reconnect_attempts: Some(3),
                ..StreamConfig::default()
            },
        );

        assert!(manager.connect().await.is_err());
        assert_eq!(transport.attempt_count(), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn signals_from_superseded_generations_are_dropped() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(2));
        let manager = manager(
            &h.store,
            transport.clone(),
            StreamConfig {
                backoff: BackoffPolicy::new(
                    Duration::from_millis(10),
                    Duration::from_millis(50),
                    0.0,
                    5,
                ),
                cooldown_ms: 0,
                ..StreamConfig::default()
            },
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        manager
            .bind_conversation(
                Some("c1".to_string()),
                Some(Arc::new(move |_event: &ChangeEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as ChangeHandler),
            )
            .await
            .expect("bind");

        manager.start();
        let mut state = manager.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("connected in time")
        .expect("state channel");

        let (generation, sink) = transport.latest_sink().expect("connected sink");
        assert_eq!(generation, 3);
        sink.send(StreamSignal {
            generation: 1,
            payload: live_insert("m-stale"),
        })
        .expect("send stale");
        sink.send(StreamSignal {
            generation,
            payload: live_insert("m-live"),
        })
        .expect("send live");

        let messaging = h.store.messaging();
        assert!(
            eventually(Duration::from_secs(5), || {
                messaging.get_message("m-live").ok().flatten().is_some()
            })
            .await
        );
        assert!(messaging.get_message("m-stale").expect("get").is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn rebinding_keeps_the_connection_and_retires_the_old_handler() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(0));
        let manager = manager(&h.store, transport.clone(), StreamConfig::default());
        let old_calls = Arc::new(AtomicUsize::new(0));
        let new_calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&old_calls);
        manager
            .bind_conversation(
                Some("c1".to_string()),
                Some(Arc::new(move |_: &ChangeEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as ChangeHandler),
            )
            .await
            .expect("bind");
        manager.start();
        let mut state = manager.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("connected in time")
        .expect("state channel");

        let counter = Arc::clone(&new_calls);
        manager
            .bind_conversation(
                Some("c1".to_string()),
                Some(Arc::new(move |_: &ChangeEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as ChangeHandler),
            )
            .await
            .expect("rebind");

        assert_eq!(transport.attempt_count(), 1);
        let log = transport.connection_log(0);
        assert_eq!(log.lock().expect("lock").filters.len(), 2);

        let (generation, sink) = transport.latest_sink().expect("sink");
        sink.send(StreamSignal {
            generation,
            payload: live_insert("m1"),
        })
        .expect("send");
        assert!(
            eventually(Duration::from_secs(5), || new_calls.load(Ordering::SeqCst) == 1).await
        );
        assert_eq!(old_calls.load(Ordering::SeqCst), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn handler_looked_up_before_a_rebind_is_not_called() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(0));
        let manager = manager(&h.store, transport, StreamConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: ChangeHandler = Arc::new(move |_: &ChangeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let epoch = manager
            .bind_conversation(Some("c1".to_string()), Some(Arc::clone(&handler)))
            .await
            .expect("bind");
        let StreamPayload::Change(event) = live_insert("m1") else {
            panic!("expected a change payload");
        };
        manager.notify_handler(&event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Another bind lands while this binding is still in the table.
        manager.binding_epoch.fetch_add(1, Ordering::SeqCst);
        manager.notify_handler(&event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let current = manager
            .bind_conversation(Some("c1".to_string()), Some(handler))
            .await
            .expect("rebind");
        assert!(current > epoch + 1);
        manager.notify_handler(&event);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_replaces_a_silent_connection() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(0));
        let manager = manager(
            &h.store,
            transport.clone(),
            StreamConfig {
                heartbeat_interval_ms: 1_000,
                stale_after_ms: 3_000,
                cooldown_ms: 500,
                ..StreamConfig::default()
            },
        );
        let catch_ups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&catch_ups);
        manager.set_catch_up_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.start();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert_eq!(transport.attempt_count(), 2);
        assert!(transport.connection_log(0).lock().expect("lock").closed);
        assert!(transport.connection_log(0).lock().expect("lock").heartbeats >= 1);
        assert_eq!(catch_ups.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_writes_time_out_and_replace_the_connection() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(0));
        transport.stall_next_connection();
        let manager = manager(
            &h.store,
            transport.clone(),
            StreamConfig {
                heartbeat_interval_ms: 1_000,
                stale_after_ms: 60_000,
                write_timeout_ms: 2_000,
                cooldown_ms: 500,
                ..StreamConfig::default()
            },
        );

        manager.start();
        let mut state = manager.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("connected in time")
        .expect("state channel");

        let bound = tokio::time::timeout(
            Duration::from_secs(30),
            manager.bind_conversation(Some("c1".to_string()), None),
        )
        .await
        .expect("bind is bounded");
        assert!(bound.is_ok());

        assert!(
            eventually(Duration::from_secs(30), || {
                transport.attempt_count() >= 2 && manager.state() == ConnectionState::Connected
            })
            .await
        );
        assert!(manager.generation() >= 2);
        assert!(transport.connection_log(0).lock().expect("lock").closed);
        let replacement = transport.connection_log(1);
        let filters = replacement.lock().expect("lock").filters.clone();
        assert_eq!(filters[0].conversation_id.as_deref(), Some("c1"));
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_makes_pending_signals_stale() {
        let h = harness(0).await;
        let transport = Arc::new(FakeTransport::failing_first(0));
        let manager = manager(&h.store, transport.clone(), StreamConfig::default());

        assert!(manager.connect().await.expect("connect"));
        let (generation, _) = transport.latest_sink().expect("sink");
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_ne!(manager.generation(), generation);
        assert!(transport.connection_log(0).lock().expect("lock").closed);
    }
}
