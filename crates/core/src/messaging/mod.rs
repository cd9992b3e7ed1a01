//! Messaging domain models and repository contracts.

mod messaging_model;
mod messaging_traits;

pub use messaging_model::*;
pub use messaging_traits::*;
