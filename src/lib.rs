//! # Polaris Core - identity resolution for a collaborative music registry
//!
//! Polaris Core decides what constitutes "the same real-world entity" across
//! independently submitted data bundles, merges duplicates without losing
//! provenance, and guarantees that applying the same ledger-anchored event
//! twice never corrupts state.
//!
//! ## Core Concepts
//!
//! - **Canonical entity**: a `polaris:{type}:{uuid}` node, the single identity of a
//!   real-world person, group, song, track, release, master or label
//! - **Alias**: a provisional or external id pointing at a canonical entity
//! - **Tombstone**: the post-merge record of an absorbed entity
//! - **Claim**: one provenance-tagged assertion about one entity
//! - **Event**: an immutable, content-addressed change request anchored on a ledger
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use polaris_core::{
//!     identity::{mint_typed, EntityType},
//!     graph::Node,
//!     storage::{GraphStore, InMemoryGraphStore},
//!     MergeEngine, MergeOptions,
//! };
//!
//! let store = Arc::new(InMemoryGraphStore::new());
//! let survivor = mint_typed(EntityType::Group);
//! let duplicate = mint_typed(EntityType::Group);
//! {
//!     let mut tx = store.begin()?;
//!     tx.insert_node(Node::entity(survivor.as_str(), EntityType::Group))?;
//!     tx.insert_node(Node::entity(duplicate.as_str(), EntityType::Group))?;
//!     tx.commit()?;
//! }
//!
//! let engine = MergeEngine::new(store.clone());
//! let report = engine.merge(survivor.as_str(), &[duplicate.as_str()], &MergeOptions::new("curator", "evt-1"))?;
//! assert_eq!(report.tombstones_created, 1);
//! # Ok::<(), polaris_core::PolarisError>(())
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Identity model
pub mod claim;
pub mod error;
pub mod graph;
pub mod identity;

// Storage seams
pub mod event;
pub mod storage;

// Operations
pub mod config;
pub mod ingest;
pub mod merge;
pub mod resolution;

// Re-export primary types at crate root for convenience
pub use claim::{Claim, ClaimId, Confidence};
pub use config::PolarisConfig;
pub use error::{ErrorKind, ErrorReport, PolarisError, PolarisResult};
pub use event::{Event, EventType, StoredEvent};
pub use identity::{CanonicalId, EntityType, ExternalSource, IdKind};
pub use ingest::{
    AnchoredEvent, IngestOutcome, IngestRuntime, IngestStatus, IngestionPipeline, Payload, RestoreSummary,
};
pub use merge::{MergeEngine, MergeOptions, MergeReport};
pub use resolution::{AliasOptions, IdentityResolver, MappingRequest};
pub use storage::{EventStore, GraphStore, GraphTransaction, StorageError};
