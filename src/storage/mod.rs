//! Storage collaborators for the Polaris core.
//!
//! The traits describe the transactional graph engine and the durable event
//! store; the in-memory backends implement both for tests and embedded use.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{GraphSnapshot, InMemoryEventStore, InMemoryGraphStore, RetargetMode};
pub use traits::{
    simulated_retarget, with_transaction, EventStore, GraphStore, GraphTransaction, PutOutcome,
    StorageError, RETARGET_MARKER,
};
