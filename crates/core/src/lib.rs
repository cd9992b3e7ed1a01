//! Huddle core: domain models, error taxonomy and the contracts the sync
//! engine is built on. Nothing in this crate performs I/O.

pub mod errors;
pub mod messaging;
pub mod sync;

pub use errors::{DatabaseError, Error, Result};
