//! Sync domain models: collections, remote rows, outbox entries, tombstones
//! and cursors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::Result;
use crate::messaging::{Conversation, Membership, Message, User};

/// Collections that participate in delta reconciliation, in parent-first order.
pub const SYNC_COLLECTIONS: [Collection; 4] = [
    Collection::Conversations,
    Collection::Users,
    Collection::Memberships,
    Collection::Messages,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Conversations,
    Users,
    Memberships,
    Messages,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Conversations => "conversations",
            Collection::Users => "users",
            Collection::Memberships => "memberships",
            Collection::Messages => "messages",
        }
    }

    /// Position in the dependency order. Parents always rank lower.
    pub fn rank(&self) -> u8 {
        match self {
            Collection::Conversations => 0,
            Collection::Users => 1,
            Collection::Memberships => 2,
            Collection::Messages => 3,
        }
    }

    pub fn parse(value: &str) -> Option<Collection> {
        match value {
            "conversations" | "groups" => Some(Collection::Conversations),
            "users" => Some(Collection::Users),
            "memberships" | "group_members" => Some(Collection::Memberships),
            "messages" => Some(Collection::Messages),
            _ => None,
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of any synced collection, as received from the backend or produced
/// locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum SyncRow {
    Conversation(Conversation),
    User(User),
    Membership(Membership),
    Message(Message),
}

impl SyncRow {
    /// Parses a JSON row for the given collection.
    pub fn from_value(collection: Collection, value: serde_json::Value) -> Result<SyncRow> {
        let row = match collection {
            Collection::Conversations => SyncRow::Conversation(serde_json::from_value(value)?),
            Collection::Users => SyncRow::User(serde_json::from_value(value)?),
            Collection::Memberships => SyncRow::Membership(serde_json::from_value(value)?),
            Collection::Messages => SyncRow::Message(serde_json::from_value(value)?),
        };
        Ok(row)
    }

    pub fn collection(&self) -> Collection {
        match self {
            SyncRow::Conversation(_) => Collection::Conversations,
            SyncRow::User(_) => Collection::Users,
            SyncRow::Membership(_) => Collection::Memberships,
            SyncRow::Message(_) => Collection::Messages,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            SyncRow::Conversation(row) => row.id.clone(),
            SyncRow::User(row) => row.id.clone(),
            SyncRow::Membership(row) => row.key(),
            SyncRow::Message(row) => row.id.clone(),
        }
    }

    pub fn updated_at(&self) -> i64 {
        match self {
            SyncRow::Conversation(row) => row.updated_at,
            SyncRow::User(row) => row.updated_at,
            SyncRow::Membership(row) => row.updated_at,
            SyncRow::Message(row) => row.updated_at,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            SyncRow::Conversation(row) => Some(&row.id),
            SyncRow::User(_) => None,
            SyncRow::Membership(row) => Some(&row.conversation_id),
            SyncRow::Message(row) => Some(&row.conversation_id),
        }
    }

    /// The row this one cannot exist without.
    pub fn parent(&self) -> Option<(Collection, &str)> {
        match self {
            SyncRow::Membership(row) => Some((Collection::Conversations, &row.conversation_id)),
            SyncRow::Message(row) => Some((Collection::Conversations, &row.conversation_id)),
            SyncRow::Conversation(_) | SyncRow::User(_) => None,
        }
    }

    pub fn into_json(self) -> Result<serde_json::Value> {
        let value = match self {
            SyncRow::Conversation(row) => serde_json::to_value(row)?,
            SyncRow::User(row) => serde_json::to_value(row)?,
            SyncRow::Membership(row) => serde_json::to_value(row)?,
            SyncRow::Message(row) => serde_json::to_value(row)?,
        };
        Ok(value)
    }
}

/// Orders a batch parent-before-child: by collection rank, then by
/// `updated_at`, and within messages a reply never precedes its parent when
/// both are in the batch.
pub fn order_parent_first(rows: Vec<SyncRow>) -> Vec<SyncRow> {
    let mut rows = rows;
    rows.sort_by_key(|row| (row.collection().rank(), row.updated_at()));

    let split = rows
        .iter()
        .position(|row| row.collection() == Collection::Messages)
        .unwrap_or(rows.len());
    let messages = rows.split_off(split);

    let batch_ids = messages
        .iter()
        .map(|row| row.entity_id())
        .collect::<std::collections::HashSet<_>>();
    let mut placed = std::collections::HashSet::new();
    let mut pending = messages;
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for row in pending {
            let waits_on_parent = match &row {
                SyncRow::Message(message) => message.parent_id.as_ref().is_some_and(|parent| {
                    batch_ids.contains(parent) && !placed.contains(parent)
                }),
                _ => false,
            };
            if waits_on_parent {
                deferred.push(row);
            } else {
                placed.insert(row.entity_id());
                rows.push(row);
            }
        }
        if deferred.len() == before {
            // Reply cycle inside one batch; keep the remaining order as is.
            rows.extend(deferred);
            break;
        }
        pending = deferred;
    }
    rows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One event from the realtime change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub collection: Collection,
    pub entity_id: String,
    /// Full row for inserts and updates. Deletes may carry only the id.
    pub row: Option<SyncRow>,
    pub filter_match: Option<String>,
}

impl ChangeEvent {
    pub fn conversation_id(&self) -> Option<&str> {
        match &self.row {
            Some(row) => row.conversation_id(),
            None => self.filter_match.as_deref(),
        }
    }
}

/// What happened to one row handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApplyOutcome {
    /// Row inserted or replaced.
    Applied,
    /// Local row is newer; incoming row ignored.
    Stale,
    /// Entity has a live tombstone; incoming row ignored.
    Tombstoned,
    /// Parent row absent; skipped without touching the store.
    Orphaned {
        parent: Collection,
        parent_id: String,
    },
    /// Row removed by a remote delete.
    Deleted,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowResult {
    pub collection: Collection,
    pub entity_id: String,
    pub updated_at: i64,
    pub outcome: ApplyOutcome,
}

/// Result of one ingestion batch. Rows are processed in order and the batch
/// stops at the first hard failure; `results` covers the processed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub results: Vec<RowResult>,
    pub failure: Option<ApplyFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFailure {
    pub entity_id: String,
    pub updated_at: i64,
    pub error: String,
}

impl ApplyReport {
    pub fn applied_count(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome.is_applied())
            .count()
    }

    pub fn count(&self, predicate: impl Fn(&ApplyOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }

    pub fn outcome_for(&self, entity_id: &str) -> Option<&ApplyOutcome> {
        self.results
            .iter()
            .find(|result| result.entity_id == entity_id)
            .map(|result| &result.outcome)
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxMutationKind {
    SendMessage,
    DeleteMessage,
    MarkRead,
}

/// Local outbox lifecycle status. A delivered entry is deleted, not marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Dead,
}

/// Outgoing mutation persisted before the remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub local_seq: i64,
    pub mutation_id: String,
    pub kind: OutboxMutationKind,
    pub conversation_id: String,
    pub actor_id: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOutboxEntry {
    /// Caller-generated idempotency id; generated when absent.
    pub mutation_id: Option<String>,
    pub kind: OutboxMutationKind,
    pub conversation_id: String,
    pub actor_id: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

impl NewOutboxEntry {
    pub fn new(
        kind: OutboxMutationKind,
        conversation_id: impl Into<String>,
        actor_id: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        created_at: i64,
    ) -> Self {
        Self {
            mutation_id: None,
            kind,
            conversation_id: conversation_id.into(),
            actor_id: actor_id.into(),
            entity_id: entity_id.into(),
            payload,
            created_at,
        }
    }

    pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub entity_id: String,
    pub entity_kind: Collection,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub collection: Collection,
    pub last_sync_timestamp: i64,
    pub checksum: Option<String>,
    pub updated_at: i64,
}

impl SyncCursor {
    pub fn initial(collection: Collection) -> Self {
        Self {
            collection,
            last_sync_timestamp: 0,
            checksum: None,
            updated_at: 0,
        }
    }
}

/// Trigger source for sync work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    AppResume,
    NetworkReconnected,
    LocalMutation,
    Periodic,
    PushWake,
    Manual,
}

/// An incoming remote row replaces the local one unless it is older.
pub fn should_apply_lww(local_updated_at: i64, remote_updated_at: i64) -> bool {
    remote_updated_at >= local_updated_at
}

/// Content checksum over `(id, updated_at)` keys. Order-independent.
pub fn collection_checksum<I, S>(keys: I) -> String
where
    I: IntoIterator<Item = (S, i64)>,
    S: AsRef<str>,
{
    let mut keys = keys
        .into_iter()
        .map(|(id, updated_at)| format!("{}@{}", id.as_ref(), updated_at))
        .collect::<Vec<_>>();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
