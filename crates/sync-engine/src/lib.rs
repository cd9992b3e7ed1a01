//! Huddle sync engine.
//!
//! Local-first synchronization for group conversations: every UI write lands
//! in the local store first and is delivered through a durable outbox; remote
//! changes arrive over one change stream and are backfilled by checksum-gated
//! delta reconciliation.

pub mod config;
pub mod engine;
pub mod outbox;
pub mod push_wake;
pub mod read_tracker;
pub mod reconciler;
pub mod subscription;
pub mod tombstones;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    OutboxConfig, ReconcilerConfig, StreamConfig, SyncEngineConfig, TombstoneConfig,
};
pub use engine::{LocalSend, SyncEngine, SyncEngineDeps};
pub use outbox::{DrainReport, OutboxEvent, OutboxProcessor};
pub use push_wake::{AppPresence, PushDisposition, PushIngest, PushPayload, PushWakeHandler};
pub use read_tracker::{MarkReadResult, ReadTracker};
pub use reconciler::{ReconcileMode, ReconcileOutcome, Reconciler};
pub use subscription::{CatchUpListener, ChangeHandler, ConnectionState, SubscriptionManager};
pub use tombstones::{FinalizedListener, TombstoneManager};
