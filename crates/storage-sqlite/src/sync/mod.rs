//! SQLite persistence for the outbox, tombstones and reconciliation cursors.

mod cursors;
mod model;
mod outbox;
mod tombstones;

pub use cursors::SyncCursorRepository;
pub use model::{NewOutboxEntryDB, OutboxEntryDB, SyncCursorDB, TombstoneDB};
pub use outbox::{write_outbox_entry, OutboxRepository};
pub use tombstones::{write_tombstone, TombstoneRepository};

pub(crate) use outbox::send_statuses_for;
pub(crate) use tombstones::is_tombstoned;
