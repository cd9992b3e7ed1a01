//! In-process fakes for the remote collaborators and a migrated store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::{
    Conversation, Membership, Message, MessageType, MessagingRepositoryTrait,
};
use huddle_core::sync::{
    classify_http_status, ChangeStreamConnection, ChangeStreamTransport, Collection, FetchPage,
    ManualClock, MutationAck, NewOutboxEntry, OutboxEntry, OutboxMutationKind, RemoteBackend,
    SessionProvider, StreamFilter, StreamSink, SyncRow,
};
use huddle_storage_sqlite::{ConnectionOptions, LocalStore};

pub(crate) struct Harness {
    pub store: LocalStore,
    pub clock: Arc<ManualClock>,
}

/// Fresh store with conversation `c1` already present.
pub(crate) async fn harness(start_millis: i64) -> Harness {
    let app_data = tempdir()
        .expect("tempdir")
        .keep()
        .to_string_lossy()
        .to_string();
    let store = LocalStore::open(&app_data, ConnectionOptions::default()).expect("open store");
    store
        .messaging()
        .upsert(SyncRow::Conversation(conversation("c1", 1)))
        .await
        .expect("seed conversation");
    Harness {
        store,
        clock: Arc::new(ManualClock::new(start_millis)),
    }
}

pub(crate) fn conversation(id: &str, updated_at: i64) -> Conversation {
    Conversation {
        id: id.to_string(),
        name: format!("Conversation {}", id),
        created_by: None,
        created_at: updated_at,
        updated_at,
    }
}

pub(crate) fn membership(conversation_id: &str, actor_id: &str, updated_at: i64) -> Membership {
    Membership {
        conversation_id: conversation_id.to_string(),
        actor_id: actor_id.to_string(),
        joined_at: updated_at,
        last_read_at: 0,
        last_read_message_id: None,
        updated_at,
    }
}

pub(crate) fn message(id: &str, conversation_id: &str, actor_id: &str, created_at: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        actor_id: actor_id.to_string(),
        content: format!("body of {}", id),
        message_type: MessageType::Text,
        parent_id: None,
        created_at,
        updated_at: created_at,
        is_ghost: false,
        category: None,
        image_url: None,
    }
}

pub(crate) fn send_request(message_id: &str, created_at: i64) -> NewOutboxEntry {
    NewOutboxEntry::new(
        OutboxMutationKind::SendMessage,
        "c1",
        "u1",
        message_id,
        json!({ "id": message_id, "conversation_id": "c1" }),
        created_at,
    )
}

fn remote_error(status: u16) -> Error {
    Error::Remote {
        class: classify_http_status(status),
        status: Some(status),
        message: format!("scripted {}", status),
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ScriptedSend {
    Ok,
    Echo(SyncRow),
    Fail(u16),
}

/// Backend with a scripted mutation endpoint and an in-memory remote table
/// per collection.
#[derive(Default)]
pub(crate) struct FakeBackend {
    sends: Mutex<VecDeque<ScriptedSend>>,
    sent: Mutex<Vec<String>>,
    send_delay: Mutex<Option<Duration>>,
    remote: Mutex<HashMap<Collection, Vec<SyncRow>>>,
    fetch_failures: Mutex<HashMap<Collection, u16>>,
    fetch_delay: Mutex<Option<Duration>>,
    pub fetches: AtomicUsize,
    pub entity_fetches: AtomicUsize,
}

impl FakeBackend {
    pub fn script_sends(&self, script: impl IntoIterator<Item = ScriptedSend>) {
        self.sends.lock().expect("lock").extend(script);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().expect("lock") = Some(delay);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().expect("lock") = Some(delay);
    }

    pub fn sent_mutation_ids(&self) -> Vec<String> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn put_remote(&self, row: SyncRow) {
        let mut remote = self.remote.lock().expect("lock");
        let rows = remote.entry(row.collection()).or_default();
        rows.retain(|existing| existing.entity_id() != row.entity_id());
        rows.push(row);
    }

    pub fn fail_fetches(&self, collection: Collection, status: u16) {
        self.fetch_failures
            .lock()
            .expect("lock")
            .insert(collection, status);
    }

    pub fn clear_fetch_failures(&self) {
        self.fetch_failures.lock().expect("lock").clear();
    }
}

#[async_trait]
impl RemoteBackend for FakeBackend {
    async fn send_mutation(&self, _token: &str, entry: &OutboxEntry) -> Result<MutationAck> {
        self.sent
            .lock()
            .expect("lock")
            .push(entry.mutation_id.clone());
        let delay = *self.send_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let step = self
            .sends
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(ScriptedSend::Ok);
        match step {
            ScriptedSend::Ok => Ok(MutationAck {
                mutation_id: entry.mutation_id.clone(),
                row: None,
            }),
            ScriptedSend::Echo(row) => Ok(MutationAck {
                mutation_id: entry.mutation_id.clone(),
                row: Some(row),
            }),
            ScriptedSend::Fail(status) => Err(remote_error(status)),
        }
    }

    async fn fetch_since(
        &self,
        _token: &str,
        collection: Collection,
        since: i64,
        limit: i64,
    ) -> Result<FetchPage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.fetch_failures.lock().expect("lock").get(&collection) {
            return Err(remote_error(*status));
        }

        let mut rows = self
            .remote
            .lock()
            .expect("lock")
            .get(&collection)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|row| row.updated_at() > since)
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| row.updated_at());
        let limit = limit.max(1) as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        Ok(FetchPage { rows, has_more })
    }

    async fn fetch_entity(
        &self,
        _token: &str,
        entity_id: &str,
        _conversation_id: &str,
    ) -> Result<Option<SyncRow>> {
        self.entity_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self
            .fetch_failures
            .lock()
            .expect("lock")
            .get(&Collection::Messages)
        {
            return Err(remote_error(*status));
        }
        Ok(self
            .remote
            .lock()
            .expect("lock")
            .get(&Collection::Messages)
            .and_then(|rows| rows.iter().find(|row| row.entity_id() == entity_id).cloned()))
    }
}

pub(crate) struct StaticSession {
    token: Option<String>,
    pub resets: AtomicUsize,
}

impl StaticSession {
    pub fn new(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            token: None,
            resets: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn access_token(&self) -> Result<String> {
        self.token
            .clone()
            .ok_or_else(|| Error::Session("signed out".to_string()))
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// What the fake transport observed for one connection.
#[derive(Default)]
pub(crate) struct ConnectionLog {
    pub filters: Vec<StreamFilter>,
    pub heartbeats: usize,
    pub closed: bool,
}

pub(crate) struct FakeConnection {
    generation: u64,
    log: Arc<Mutex<ConnectionLog>>,
    /// Filter and heartbeat writes never complete.
    stalled: bool,
}

#[async_trait]
impl ChangeStreamConnection for FakeConnection {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn set_filter(&self, filter: StreamFilter) -> Result<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.log.lock().expect("lock").filters.push(filter);
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.log.lock().expect("lock").heartbeats += 1;
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().expect("lock").closed = true;
    }
}

/// Transport that fails the first `failures` connects, then succeeds.
pub(crate) struct FakeTransport {
    failures_left: Mutex<usize>,
    stall_next: AtomicBool,
    pub attempts: Mutex<Vec<tokio::time::Instant>>,
    pub sinks: Mutex<Vec<(u64, StreamSink)>>,
    pub connections: Mutex<Vec<Arc<Mutex<ConnectionLog>>>>,
}

impl FakeTransport {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            stall_next: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// The next successful connect hands out a connection whose writes hang.
    pub fn stall_next_connection(&self) {
        self.stall_next.store(true, Ordering::SeqCst);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().expect("lock").len()
    }

    /// Sink and generation of the most recent successful connect.
    pub fn latest_sink(&self) -> Option<(u64, StreamSink)> {
        self.sinks.lock().expect("lock").last().cloned()
    }

    pub fn connection_log(&self, index: usize) -> Arc<Mutex<ConnectionLog>> {
        Arc::clone(&self.connections.lock().expect("lock")[index])
    }
}

#[async_trait]
impl ChangeStreamTransport for FakeTransport {
    async fn connect(
        &self,
        _token: &str,
        generation: u64,
        filter: StreamFilter,
        sink: StreamSink,
    ) -> Result<Box<dyn ChangeStreamConnection>> {
        self.attempts
            .lock()
            .expect("lock")
            .push(tokio::time::Instant::now());
        {
            let mut failures_left = self.failures_left.lock().expect("lock");
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(remote_error(503));
            }
        }

        let log = Arc::new(Mutex::new(ConnectionLog {
            filters: vec![filter],
            ..ConnectionLog::default()
        }));
        self.sinks.lock().expect("lock").push((generation, sink));
        self.connections.lock().expect("lock").push(Arc::clone(&log));
        Ok(Box::new(FakeConnection {
            generation,
            log,
            stalled: self.stall_next.swap(false, Ordering::SeqCst),
        }))
    }
}

/// Polls `condition` until it holds or `within` elapses.
pub(crate) async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
