//! Contracts for the remote collaborators: backend, session and change stream.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{Error, Result};

use super::sync_model::{ChangeEvent, Collection, OutboxEntry, SyncRow};

/// Races `future` against `duration`. Elapsing is an [`Error::Timeout`].
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(duration.as_millis() as u64)),
    }
}

/// Acknowledgment of a mutation accepted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationAck {
    pub mutation_id: String,
    /// Authoritative row echoed back by the server, when there is one.
    #[serde(default)]
    pub row: Option<SyncRow>,
}

/// One page of a delta fetch, ordered by `updated_at` ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPage {
    pub rows: Vec<SyncRow>,
    pub has_more: bool,
}

/// Remote relational backend.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Applies one outbox mutation. `entry.mutation_id` is the idempotency key.
    async fn send_mutation(&self, token: &str, entry: &OutboxEntry) -> Result<MutationAck>;

    /// Rows of `collection` with `updated_at` strictly greater than `since`.
    async fn fetch_since(
        &self,
        token: &str,
        collection: Collection,
        since: i64,
        limit: i64,
    ) -> Result<FetchPage>;

    /// Single message lookup used by push wake-ups.
    async fn fetch_entity(
        &self,
        token: &str,
        entity_id: &str,
        conversation_id: &str,
    ) -> Result<Option<SyncRow>>;
}

/// Authenticated session. Token acquisition itself is owned by the host.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Returns a token, refreshing it if needed. May block on the network.
    async fn access_token(&self) -> Result<String>;

    /// Drops any cached session state so the next call starts fresh.
    async fn reset(&self);

    /// Time-boxed [`access_token`](Self::access_token). A hang resets the
    /// session before the timeout is reported.
    async fn get_valid_token(&self, timeout: Duration) -> Result<String> {
        match with_timeout(timeout, self.access_token()).await {
            Err(err) if err.is_timeout() => {
                log::warn!("[Session] Token acquisition timed out, resetting session");
                self.reset().await;
                Err(err)
            }
            other => other,
        }
    }
}

/// Which events the single stream connection should deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFilter {
    /// Conversation whose messages are delivered. Membership and conversation
    /// changes for the user are always delivered.
    pub conversation_id: Option<String>,
    pub actor_id: Option<String>,
}

impl StreamFilter {
    pub fn for_conversation(actor_id: Option<String>, conversation_id: Option<String>) -> Self {
        Self {
            conversation_id,
            actor_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPayload {
    Change(ChangeEvent),
    Heartbeat,
    Closed { reason: String },
}

/// Anything the transport reports, tagged with the generation of the
/// connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSignal {
    pub generation: u64,
    pub payload: StreamPayload,
}

pub type StreamSink = mpsc::UnboundedSender<StreamSignal>;

/// Opens change-stream connections.
#[async_trait]
pub trait ChangeStreamTransport: Send + Sync {
    /// Opens a connection and reports every signal into `sink` tagged with
    /// `generation`.
    async fn connect(
        &self,
        token: &str,
        generation: u64,
        filter: StreamFilter,
        sink: StreamSink,
    ) -> Result<Box<dyn ChangeStreamConnection>>;
}

/// A live change-stream connection.
#[async_trait]
pub trait ChangeStreamConnection: Send + Sync {
    fn generation(&self) -> u64;

    /// Rebinds the event filter without reconnecting.
    async fn set_filter(&self, filter: StreamFilter) -> Result<()>;

    async fn send_heartbeat(&self) -> Result<()>;

    async fn close(&self);
}
