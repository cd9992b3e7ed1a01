//! SQLite implementation of the Huddle local store.
//!
//! Reads go through the r2d2 pool; every write goes through the single
//! writer thread so transactions never contend.

pub mod db;
pub mod errors;
pub mod messaging;
pub mod schema;
pub mod sync;

mod store;
mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use db::ConnectionOptions;
pub use errors::StorageError;
pub use messaging::{MessagingRepository, ReadStateRepository};
pub use store::LocalStore;
pub use sync::{OutboxRepository, SyncCursorRepository, TombstoneRepository};
