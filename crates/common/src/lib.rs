//! Shared types used across the persistence and event-pipeline crates.

pub mod timestamp;
pub mod types;

pub use types::{EntityId, ParentRef};
