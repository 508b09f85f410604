//! In-memory storage backend.
//!
//! Thread-safe in-memory implementations of the storage traits, used for
//! embedded deployments, tests, and as the reference implementation.
//!
//! Graph transactions are serializable: `begin` takes the store's lock for the
//! life of the transaction and works on a private copy of the state; `commit`
//! swaps the copy in and dropping the transaction discards it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};

use crate::claim::{Claim, ClaimId};
use crate::event::StoredEvent;
use crate::graph::{Direction, Edge, EdgeId, Endpoint, ExternalMapping, MappingKey, Node};
use crate::storage::traits::{
    EventStore, GraphStore, GraphTransaction, PutOutcome, StorageError, RETARGET_MARKER,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Full contents of an in-memory graph. Ordered maps keep snapshots comparable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, Node>,
    pub edges: BTreeMap<EdgeId, Edge>,
    pub claims: BTreeMap<ClaimId, Claim>,
    pub mappings: BTreeMap<MappingKey, ExternalMapping>,
}

impl GraphSnapshot {
    /// Edges carrying the pending-retarget marker.
    #[must_use]
    pub fn marked_edges(&self) -> usize {
        self.edges
            .values()
            .filter(|e| e.properties.contains_key(RETARGET_MARKER))
            .count()
    }
}

/// How the backend moves edge endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetargetMode {
    /// Endpoint changes in place; the edge keeps its id.
    #[default]
    Native,
    /// Create-marked-replacement, delete, unmark (as a backend without in-place retarget would).
    Simulated,
}

/// Thread-safe in-memory graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: Mutex<GraphSnapshot>,
    mode: RetargetMode,
}

impl InMemoryGraphStore {
    /// Creates an empty store with native retargeting.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store using the given retarget strategy.
    #[must_use]
    pub fn with_retarget_mode(mode: RetargetMode) -> Self {
        Self {
            state: Mutex::new(GraphSnapshot::default()),
            mode,
        }
    }

    /// Copies the committed state.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<GraphSnapshot, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("graph.snapshot"))?;
        Ok(state.clone())
    }
}

impl GraphStore for InMemoryGraphStore {
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>, StorageError> {
        let guard = self.state.lock().map_err(|_| lock_err("graph.begin"))?;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            working,
            mode: self.mode,
        }))
    }
}

struct InMemoryTransaction<'a> {
    guard: MutexGuard<'a, GraphSnapshot>,
    working: GraphSnapshot,
    mode: RetargetMode,
}

impl InMemoryTransaction<'_> {
    fn require_node(&self, id: &str) -> Result<(), StorageError> {
        if self.working.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(StorageError::DanglingEdge(id.to_string()))
        }
    }
}

impl GraphTransaction for InMemoryTransaction<'_> {
    fn get_node(&self, id: &str) -> Result<Option<Node>, StorageError> {
        Ok(self.working.nodes.get(id).cloned())
    }

    fn insert_node(&mut self, node: Node) -> Result<(), StorageError> {
        if self.working.nodes.contains_key(&node.id) {
            return Err(StorageError::DuplicateKey(node.id));
        }
        self.working.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    fn update_node(&mut self, node: Node) -> Result<(), StorageError> {
        let existing = self
            .working
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| StorageError::NodeNotFound(node.id.clone()))?;
        if existing.kind != node.kind {
            return Err(StorageError::ImmutableField {
                id: node.id,
                field: "kind",
            });
        }
        *existing = node;
        Ok(())
    }

    fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>, StorageError> {
        Ok(self.working.edges.get(&id).cloned())
    }

    fn edges_of(&self, node_id: &str, direction: Direction) -> Result<Vec<Edge>, StorageError> {
        Ok(self
            .working
            .edges
            .values()
            .filter(|e| direction.matches(e, node_id))
            .cloned()
            .collect())
    }

    fn insert_edge(&mut self, edge: Edge) -> Result<(), StorageError> {
        if self.working.edges.contains_key(&edge.id) {
            return Err(StorageError::DuplicateKey(edge.id.to_string()));
        }
        self.require_node(&edge.from)?;
        self.require_node(&edge.to)?;
        self.working.edges.insert(edge.id, edge);
        Ok(())
    }

    fn update_edge(&mut self, edge: Edge) -> Result<(), StorageError> {
        let existing = self
            .working
            .edges
            .get_mut(&edge.id)
            .ok_or(StorageError::EdgeNotFound(edge.id))?;
        if existing.from != edge.from || existing.to != edge.to {
            return Err(StorageError::ImmutableField {
                id: edge.id.to_string(),
                field: "endpoints",
            });
        }
        if existing.rel != edge.rel {
            return Err(StorageError::ImmutableField {
                id: edge.id.to_string(),
                field: "rel",
            });
        }
        existing.properties = edge.properties;
        Ok(())
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<(), StorageError> {
        self.working
            .edges
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::EdgeNotFound(id))
    }

    fn edges_with_property(&self, key: &str) -> Result<Vec<Edge>, StorageError> {
        Ok(self
            .working
            .edges
            .values()
            .filter(|e| e.properties.contains_key(key))
            .cloned()
            .collect())
    }

    fn retarget_edge(
        &mut self,
        id: EdgeId,
        endpoint: Endpoint,
        new_node: &str,
    ) -> Result<Edge, StorageError> {
        if self.mode == RetargetMode::Simulated {
            return super::simulated_retarget(self, id, endpoint, new_node);
        }
        self.require_node(new_node)?;
        let edge = self
            .working
            .edges
            .get_mut(&id)
            .ok_or(StorageError::EdgeNotFound(id))?;
        edge.set_endpoint(endpoint, new_node);
        Ok(edge.clone())
    }

    fn get_claim(&self, id: ClaimId) -> Result<Option<Claim>, StorageError> {
        Ok(self.working.claims.get(&id).cloned())
    }

    fn claims_about(&self, entity_id: &str) -> Result<Vec<Claim>, StorageError> {
        Ok(self
            .working
            .claims
            .values()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect())
    }

    fn insert_claim(&mut self, claim: Claim) -> Result<(), StorageError> {
        if self.working.claims.contains_key(&claim.id) {
            return Err(StorageError::DuplicateKey(claim.id.to_string()));
        }
        if !self.working.nodes.contains_key(&claim.entity_id) {
            return Err(StorageError::NodeNotFound(claim.entity_id));
        }
        self.working.claims.insert(claim.id, claim);
        Ok(())
    }

    fn update_claim(&mut self, claim: Claim) -> Result<(), StorageError> {
        let existing = self
            .working
            .claims
            .get_mut(&claim.id)
            .ok_or(StorageError::ClaimNotFound(claim.id))?;
        *existing = claim;
        Ok(())
    }

    fn get_mapping(&self, key: &MappingKey) -> Result<Option<ExternalMapping>, StorageError> {
        Ok(self.working.mappings.get(key).cloned())
    }

    fn put_mapping(
        &mut self,
        mapping: ExternalMapping,
    ) -> Result<Option<ExternalMapping>, StorageError> {
        Ok(self.working.mappings.insert(mapping.key.clone(), mapping))
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let Self {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Thread-safe in-memory event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, StoredEvent>>,
}

impl InMemoryEventStore {
    /// Creates an empty event store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn put(&self, event: StoredEvent) -> Result<PutOutcome, StorageError> {
        let mut events = self.events.write().map_err(|_| lock_err("event.put"))?;
        if events.contains_key(&event.hash) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        events.insert(event.hash.clone(), event);
        Ok(PutOutcome::Inserted)
    }

    fn get(&self, hash: &str) -> Result<Option<StoredEvent>, StorageError> {
        let events = self.events.read().map_err(|_| lock_err("event.get"))?;
        Ok(events.get(hash).cloned())
    }

    fn contains(&self, hash: &str) -> Result<bool, StorageError> {
        let events = self.events.read().map_err(|_| lock_err("event.contains"))?;
        Ok(events.contains_key(hash))
    }

    fn len(&self) -> Result<usize, StorageError> {
        let events = self.events.read().map_err(|_| lock_err("event.len"))?;
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AnchorInfo, Event, EventType, Verification};
    use crate::graph::RelType;
    use crate::identity::EntityType;
    use chrono::Utc;

    fn seeded(mode: RetargetMode) -> InMemoryGraphStore {
        let store = InMemoryGraphStore::with_retarget_mode(mode);
        let mut tx = store.begin().unwrap();
        tx.insert_node(Node::entity("g1", EntityType::Group)).unwrap();
        tx.insert_node(Node::entity("g2", EntityType::Group)).unwrap();
        tx.insert_node(Node::entity("t1", EntityType::Track)).unwrap();
        tx.commit().unwrap();
        store
    }

    #[test]
    fn uncommitted_changes_are_discarded_on_drop() {
        let store = seeded(RetargetMode::Native);
        {
            let mut tx = store.begin().unwrap();
            tx.insert_node(Node::entity("g3", EntityType::Group)).unwrap();
        }
        assert!(!store.snapshot().unwrap().nodes.contains_key("g3"));
    }

    #[test]
    fn rollback_discards_changes() {
        let store = seeded(RetargetMode::Native);
        let mut tx = store.begin().unwrap();
        tx.insert_edge(Edge::new(RelType::PerformedOn, "g1", "t1")).unwrap();
        tx.rollback().unwrap();
        assert!(store.snapshot().unwrap().edges.is_empty());
    }

    #[test]
    fn insert_edge_requires_endpoints() {
        let store = seeded(RetargetMode::Native);
        let mut tx = store.begin().unwrap();
        let err = tx
            .insert_edge(Edge::new(RelType::PerformedOn, "g1", "missing"))
            .unwrap_err();
        assert!(matches!(err, StorageError::DanglingEdge(ref id) if id == "missing"));
    }

    #[test]
    fn update_node_refuses_kind_change() {
        let store = seeded(RetargetMode::Native);
        let mut tx = store.begin().unwrap();
        let mut node = tx.get_node("g1").unwrap().unwrap();
        node.kind = crate::graph::NodeKind::Entity(EntityType::Person);
        let err = tx.update_node(node).unwrap_err();
        assert!(matches!(err, StorageError::ImmutableField { field: "kind", .. }));
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let store = seeded(RetargetMode::Native);
        let mut tx = store.begin().unwrap();
        let err = tx.insert_node(Node::entity("g1", EntityType::Group)).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn native_retarget_keeps_edge_id() {
        let store = seeded(RetargetMode::Native);
        let mut tx = store.begin().unwrap();
        let edge = Edge::new(RelType::PerformedOn, "g2", "t1");
        let id = edge.id;
        tx.insert_edge(edge).unwrap();
        let moved = tx.retarget_edge(id, Endpoint::From, "g1").unwrap();
        assert_eq!(moved.id, id);
        assert_eq!(moved.from, "g1");
        tx.commit().unwrap();
        assert_eq!(store.snapshot().unwrap().edges.len(), 1);
    }

    #[test]
    fn simulated_retarget_matches_native_shape() {
        let store = seeded(RetargetMode::Simulated);
        let mut tx = store.begin().unwrap();
        let edge = Edge::new(RelType::PerformedOn, "g2", "t1").with_property("role", "lead");
        let id = edge.id;
        tx.insert_edge(edge).unwrap();
        let moved = tx.retarget_edge(id, Endpoint::From, "g1").unwrap();
        tx.commit().unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.marked_edges(), 0);
        let stored = &snapshot.edges[&moved.id];
        assert_eq!(stored.from, "g1");
        assert_eq!(stored.to, "t1");
        assert_eq!(stored.properties["role"], "lead");
        assert!(!snapshot.edges.contains_key(&id));
    }

    #[test]
    fn simulated_retarget_picks_the_same_replacement_everywhere() {
        let moved: Vec<EdgeId> = (0..2)
            .map(|_| {
                let store = seeded(RetargetMode::Simulated);
                let mut tx = store.begin().unwrap();
                let edge = Edge::new(RelType::PerformedOn, "g2", "t1").with_id(EdgeId::from_seed("perf"));
                tx.insert_edge(edge).unwrap();
                let moved = tx.retarget_edge(EdgeId::from_seed("perf"), Endpoint::From, "g1").unwrap();
                tx.commit().unwrap();
                moved.id
            })
            .collect();
        assert_eq!(moved[0], moved[1]);
        assert_ne!(moved[0], EdgeId::from_seed("perf"));
    }

    #[test]
    fn put_mapping_returns_previous() {
        let store = seeded(RetargetMode::Native);
        let mut tx = store.begin().unwrap();
        let key = MappingKey::new(crate::identity::ExternalSource::Discogs, "artist", "1").unwrap();
        let mapping = ExternalMapping {
            key: key.clone(),
            canonical_id: "g1".to_string(),
            confidence: 1.0,
            submitter: "a".to_string(),
            evidence: String::new(),
            updated_at: Utc::now(),
        };
        assert!(tx.put_mapping(mapping.clone()).unwrap().is_none());
        let replaced = tx
            .put_mapping(ExternalMapping {
                canonical_id: "g2".to_string(),
                ..mapping
            })
            .unwrap();
        assert_eq!(replaced.unwrap().canonical_id, "g1");
        assert_eq!(tx.get_mapping(&key).unwrap().unwrap().canonical_id, "g2");
    }

    #[test]
    fn event_store_put_is_idempotent() {
        let store = InMemoryEventStore::new();
        let stored = StoredEvent {
            hash: "h1".to_string(),
            event: Event::new(EventType::Vote, "alice", 1),
            verification: Verification::ExternallyVerified {
                anchor: AnchorInfo::default(),
            },
            stored_at: Utc::now(),
        };
        assert_eq!(store.put(stored.clone()).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(stored).unwrap(), PutOutcome::AlreadyPresent);
        assert!(store.contains("h1").unwrap());
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get("nope").unwrap().is_none());
    }
}
