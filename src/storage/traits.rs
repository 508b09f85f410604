//! Abstract storage traits for the Polaris core.
//!
//! Two collaborators sit behind these traits:
//! - a transactional property graph holding entities, aliases, edges, claims and
//!   external mappings
//! - a durable event store keyed by the authoritative event hash
//!
//! Both are `Send + Sync` so a single handle can be shared across ingest workers.

use serde_json::Value;
use thiserror::Error;

use crate::claim::{Claim, ClaimId};
use crate::event::StoredEvent;
use crate::graph::{Direction, Edge, EdgeId, Endpoint, ExternalMapping, MappingKey, Node};

/// Property set on an edge while it is being moved between endpoints.
///
/// Any edge still carrying it once a merge finishes indicates a half-applied
/// retarget.
pub const RETARGET_MARKER: &str = "_pending_retarget";

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Edge not found.
    #[error("Edge not found: {0}")]
    EdgeNotFound(EdgeId),

    /// Claim not found.
    #[error("Claim not found: {0}")]
    ClaimNotFound(ClaimId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Edge endpoint does not exist.
    #[error("Edge endpoint does not exist: {0}")]
    DanglingEdge(String),

    /// Attempt to change an immutable field.
    #[error("Immutable field '{field}' cannot change on {id}")]
    ImmutableField { id: String, field: &'static str },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true if the same operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendError(_) | Self::Io(_))
    }
}

/// One open graph transaction.
///
/// Dropping a transaction without calling [`GraphTransaction::commit`] rolls it back.
pub trait GraphTransaction {
    /// Get a node by id.
    fn get_node(&self, id: &str) -> Result<Option<Node>, StorageError>;

    /// Insert a node. Returns error if the id already exists.
    fn insert_node(&mut self, node: Node) -> Result<(), StorageError>;

    /// Replace a node. Changing its id or kind is refused.
    fn update_node(&mut self, node: Node) -> Result<(), StorageError>;

    /// Get an edge by id.
    fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>, StorageError>;

    /// Edges incident to `node_id` in the given direction.
    fn edges_of(&self, node_id: &str, direction: Direction) -> Result<Vec<Edge>, StorageError>;

    /// Insert an edge. Both endpoints must exist.
    fn insert_edge(&mut self, edge: Edge) -> Result<(), StorageError>;

    /// Replace an edge's properties. Endpoints and relationship are fixed.
    fn update_edge(&mut self, edge: Edge) -> Result<(), StorageError>;

    /// Delete an edge.
    fn delete_edge(&mut self, id: EdgeId) -> Result<(), StorageError>;

    /// Edges carrying `key` as a property.
    fn edges_with_property(&self, key: &str) -> Result<Vec<Edge>, StorageError>;

    /// Moves one end of an edge to `new_node`, returning the edge as it now exists.
    ///
    /// Backends without an atomic in-place retarget keep this default: the
    /// original is marked with [`RETARGET_MARKER`], a marked replacement is
    /// created at the new endpoint, the original is deleted, and the marker is
    /// cleared. The replacement gets a fresh id.
    fn retarget_edge(
        &mut self,
        id: EdgeId,
        endpoint: Endpoint,
        new_node: &str,
    ) -> Result<Edge, StorageError> {
        simulated_retarget(self, id, endpoint, new_node)
    }

    /// Get a claim by id.
    fn get_claim(&self, id: ClaimId) -> Result<Option<Claim>, StorageError>;

    /// Claims currently attached to `entity_id`.
    fn claims_about(&self, entity_id: &str) -> Result<Vec<Claim>, StorageError>;

    /// Insert a claim. Returns error if the id already exists.
    fn insert_claim(&mut self, claim: Claim) -> Result<(), StorageError>;

    /// Replace an existing claim.
    fn update_claim(&mut self, claim: Claim) -> Result<(), StorageError>;

    /// Get an external mapping.
    fn get_mapping(&self, key: &MappingKey) -> Result<Option<ExternalMapping>, StorageError>;

    /// Upsert an external mapping, returning the one it replaced.
    fn put_mapping(
        &mut self,
        mapping: ExternalMapping,
    ) -> Result<Option<ExternalMapping>, StorageError>;

    /// Make every change visible atomically.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard every change.
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Retarget through create, delete and unmark steps, for backends that cannot move
/// an endpoint in place.
///
/// # Errors
/// Whatever the underlying edge operations return.
pub fn simulated_retarget<T>(
    tx: &mut T,
    id: EdgeId,
    endpoint: Endpoint,
    new_node: &str,
) -> Result<Edge, StorageError>
where
    T: GraphTransaction + ?Sized,
{
    let mut original = tx.get_edge(id)?.ok_or(StorageError::EdgeNotFound(id))?;
    original
        .properties
        .insert(RETARGET_MARKER.to_string(), Value::Bool(true));
    tx.update_edge(original.clone())?;

    // Seeded from the move itself so every replica picks the same replacement id.
    let seed = format!("retarget:{id}:{endpoint:?}:{new_node}");
    let mut replacement = original.with_id(EdgeId::from_seed(&seed));
    replacement.set_endpoint(endpoint, new_node);
    tx.insert_edge(replacement.clone())?;
    tx.delete_edge(id)?;

    replacement.properties.remove(RETARGET_MARKER);
    tx.update_edge(replacement.clone())?;
    Ok(replacement)
}

/// A transactional graph backend.
pub trait GraphStore: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>, StorageError>;
}

/// Runs `f` inside one transaction: commit on `Ok`, roll back on `Err`.
///
/// # Errors
/// Whatever `f` returns, or the backend's begin/commit failure.
pub fn with_transaction<T, E, F>(store: &dyn GraphStore, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&mut dyn GraphTransaction) -> Result<T, E>,
{
    let mut tx = store.begin()?;
    match f(tx.as_mut()) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                tracing::error!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Whether an event put stored something new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyPresent,
}

/// Durable, content-addressed event storage.
pub trait EventStore: Send + Sync {
    /// Store an event under its hash. Storing an existing hash is a no-op.
    fn put(&self, event: StoredEvent) -> Result<PutOutcome, StorageError>;

    /// Get an event by hash.
    fn get(&self, hash: &str) -> Result<Option<StoredEvent>, StorageError>;

    /// Returns true if an event with this hash is stored.
    fn contains(&self, hash: &str) -> Result<bool, StorageError> {
        Ok(self.get(hash)?.is_some())
    }

    /// Number of stored events.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if no events are stored.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}
