//! Sync domain models, policies and collaborator contracts.

mod remote;
mod sync_model;
mod sync_policy;
mod sync_scheduler;
mod sync_traits;

pub use remote::*;
pub use sync_model::*;
pub use sync_policy::*;
pub use sync_scheduler::*;
pub use sync_traits::*;

#[cfg(test)]
mod tests;
