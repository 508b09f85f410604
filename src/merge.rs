//! Merge engine: collapse N duplicate entities into one survivor.
//!
//! A merge runs in a single transaction spanning the whole batch. Absorbed
//! entities become tombstones pointing at the survivor; their edges are moved
//! to the survivor and their claims re-attached with provenance stamps.
//! Nothing is deleted except self-loops created by the move.
//!
//! Every absorbed id must name the survivor's entity type; that is checked
//! from the ids alone, before any transaction opens.
//!
//! An absorbed id that no longer exists (or is already a tombstone) is
//! skipped: a concurrent or earlier merge consumed it, and re-submitting the
//! identical merge is always safe.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{IntegrityViolation, NotFoundError, PolarisResult, ValidationError};
use crate::graph::{Direction, Endpoint, EntityStatus, Node, RelType, Tombstone};
use crate::identity::CanonicalId;
use crate::resolution::{self, DEFAULT_MAX_HOPS};
use crate::storage::{with_transaction, GraphStore, GraphTransaction, RETARGET_MARKER};

/// Options for one merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Account performing the merge.
    pub submitter: String,
    /// Hash of the event that requested the merge.
    pub event_hash: String,
    #[serde(default)]
    pub evidence: String,
    /// Move edges onto the survivor. When false, data edges are dropped.
    #[serde(default = "default_true")]
    pub rewire_edges: bool,
    /// Re-attach claims to the survivor.
    #[serde(default = "default_true")]
    pub move_claims: bool,
}

const fn default_true() -> bool {
    true
}

impl MergeOptions {
    /// Options with edges and claims moved.
    #[must_use]
    pub fn new(submitter: impl Into<String>, event_hash: impl Into<String>) -> Self {
        Self {
            submitter: submitter.into(),
            event_hash: event_hash.into(),
            evidence: String::new(),
            rewire_edges: true,
            move_claims: true,
        }
    }

    /// Sets the evidence string (builder style).
    #[must_use]
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    /// Sets whether edges are rewired (builder style).
    #[must_use]
    pub const fn rewire_edges(mut self, rewire: bool) -> Self {
        self.rewire_edges = rewire;
        self
    }

    /// Sets whether claims are moved (builder style).
    #[must_use]
    pub const fn move_claims(mut self, move_claims: bool) -> Self {
        self.move_claims = move_claims;
        self
    }
}

/// What a merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// The live survivor (after following any tombstone chain).
    pub survivor: String,
    pub edges_rewired: usize,
    pub claims_moved: usize,
    pub tombstones_created: usize,
    pub self_loops_removed: usize,
    pub edges_dropped: usize,
    /// Absorbed ids that were already gone.
    pub skipped: Vec<String>,
}

/// Merge engine over a shared graph store.
#[derive(Clone)]
pub struct MergeEngine {
    graph: Arc<dyn GraphStore>,
    max_hops: usize,
}

impl MergeEngine {
    /// Creates an engine with the default hop limit.
    #[must_use]
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Overrides the hop limit used to resolve a tombstoned survivor (builder style).
    #[must_use]
    pub const fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Merges every id in `absorbed_ids` into `survivor_id`, atomically.
    ///
    /// # Errors
    /// - Validation: non-canonical ids, empty batch, self merge, absorbed id of another type
    /// - NotFound: missing survivor
    /// - Integrity: stored node of the wrong type, leftover retarget markers, live edges on a tombstone
    ///
    /// Any error rolls back the whole batch.
    pub fn merge<S: AsRef<str>>(
        &self,
        survivor_id: &str,
        absorbed_ids: &[S],
        options: &MergeOptions,
    ) -> PolarisResult<MergeReport> {
        let survivor = CanonicalId::parse(survivor_id)?;
        let absorbed = validate_absorbed(&survivor, absorbed_ids)?;

        let span = tracing::info_span!(
            "merge",
            survivor = %survivor,
            absorbed = absorbed.len(),
            event_hash = %options.event_hash,
        );
        let _enter = span.enter();

        let max_hops = self.max_hops;
        let result = with_transaction(self.graph.as_ref(), |tx| {
            merge_in_transaction(tx, &survivor, &absorbed, options, max_hops)
        });

        match &result {
            Ok(report) => tracing::info!(
                survivor = %report.survivor,
                edges_rewired = report.edges_rewired,
                claims_moved = report.claims_moved,
                tombstones_created = report.tombstones_created,
                skipped = report.skipped.len(),
                "merge committed"
            ),
            Err(e) => tracing::warn!(error = %e, kind = %e.kind(), "merge rolled back"),
        }
        result
    }
}

fn validate_absorbed<S: AsRef<str>>(
    survivor: &CanonicalId,
    absorbed_ids: &[S],
) -> Result<Vec<CanonicalId>, ValidationError> {
    if absorbed_ids.is_empty() {
        return Err(ValidationError::EmptyMergeBatch);
    }
    let mut out: Vec<CanonicalId> = Vec::with_capacity(absorbed_ids.len());
    for raw in absorbed_ids {
        let id = CanonicalId::parse(raw.as_ref())?;
        if id == *survivor {
            return Err(ValidationError::SelfMerge { id: id.to_string() });
        }
        if id.entity_type() != survivor.entity_type() {
            return Err(ValidationError::WrongEntityType {
                id: id.to_string(),
                expected: survivor.entity_type().to_string(),
                actual: id.entity_type().to_string(),
            });
        }
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

fn live_survivor(
    tx: &dyn GraphTransaction,
    survivor: &CanonicalId,
    max_hops: usize,
) -> PolarisResult<Node> {
    let node = tx.get_node(survivor.as_str())?.ok_or_else(|| NotFoundError::Entity {
        id: survivor.to_string(),
    })?;
    let node = if node.is_tombstoned() {
        let live = resolution::resolve_to_canonical(tx, survivor.as_str(), max_hops)?;
        tracing::debug!(requested = %survivor, live = %live, "survivor is a tombstone; using its successor");
        tx.get_node(&live)?
            .ok_or(NotFoundError::Entity { id: live })?
    } else {
        node
    };

    if node.entity_type() != Some(survivor.entity_type()) {
        return Err(IntegrityViolation::MalformedNode {
            id: node.id,
            reason: format!("node type does not match id type {}", survivor.entity_type()),
        }
        .into());
    }
    Ok(node)
}

/// Runs a merge inside an already-open transaction.
///
/// `absorbed` must already be validated (canonical, deduplicated, not the survivor).
///
/// # Errors
/// See [`MergeEngine::merge`]. The caller is responsible for rolling back.
pub fn merge_in_transaction(
    tx: &mut dyn GraphTransaction,
    survivor: &CanonicalId,
    absorbed: &[CanonicalId],
    options: &MergeOptions,
    max_hops: usize,
) -> PolarisResult<MergeReport> {
    let mut survivor_node = live_survivor(tx, survivor, max_hops)?;
    let survivor_id = survivor_node.id.clone();
    let survivor_type = survivor.entity_type();
    let now = Utc::now();

    let mut report = MergeReport {
        survivor: survivor_id.clone(),
        ..MergeReport::default()
    };
    let mut tombstoned = Vec::new();

    for id in absorbed {
        let absorbed_id = id.as_str();
        let node = match tx.get_node(absorbed_id)? {
            Some(node) if !node.is_tombstoned() && node.id != survivor_id => node,
            _ => {
                tracing::info!(absorbed = absorbed_id, "absorbed entity no longer exists; skipping");
                report.skipped.push(absorbed_id.to_string());
                continue;
            }
        };

        // Ids were type-checked up front; this catches a node stored under a foreign id.
        let absorbed_type = node.entity_type();
        if absorbed_type != Some(survivor_type) {
            return Err(IntegrityViolation::TypeMismatch {
                survivor: survivor_id,
                survivor_type: survivor_type.to_string(),
                absorbed: absorbed_id.to_string(),
                absorbed_type: absorbed_type.map_or_else(|| "alias".to_string(), |t| t.to_string()),
            }
            .into());
        }

        move_edges(tx, absorbed_id, &survivor_id, options.rewire_edges, &mut report)?;

        if options.move_claims {
            for mut claim in tx.claims_about(absorbed_id)? {
                claim.move_to(&survivor_id, &options.submitter, now);
                tx.update_claim(claim)?;
                report.claims_moved += 1;
            }
        }

        let mut node = node;
        node.status = EntityStatus::Merged;
        node.tombstone = Some(Tombstone {
            merged_into: survivor_id.clone(),
            merged_at: now,
            merged_by: options.submitter.clone(),
            merge_event_hash: options.event_hash.clone(),
            merge_evidence: options.evidence.clone(),
        });
        node.updated_at = now;
        tx.update_node(node)?;
        report.tombstones_created += 1;
        tombstoned.push(absorbed_id.to_string());
    }

    if report.tombstones_created > 0 {
        survivor_node.absorbed_count += report.tombstones_created as u64;
        survivor_node.last_merged_at = Some(now);
        survivor_node.updated_at = now;
        tx.update_node(survivor_node)?;
    }

    verify_no_leftovers(tx, &tombstoned)?;
    Ok(report)
}

fn move_edges(
    tx: &mut dyn GraphTransaction,
    absorbed_id: &str,
    survivor_id: &str,
    rewire: bool,
    report: &mut MergeReport,
) -> PolarisResult<()> {
    for edge in tx.edges_of(absorbed_id, Direction::Both)? {
        let new_from = if edge.from == absorbed_id { survivor_id } else { edge.from.as_str() };
        let new_to = if edge.to == absorbed_id { survivor_id } else { edge.to.as_str() };

        if new_from == new_to {
            tx.delete_edge(edge.id)?;
            report.self_loops_removed += 1;
            continue;
        }

        // Alias pointers always follow the entity; only data edges honor `rewire`.
        if !rewire && edge.rel != RelType::AliasOf {
            tx.delete_edge(edge.id)?;
            report.edges_dropped += 1;
            continue;
        }

        let mut id = edge.id;
        if edge.from == absorbed_id {
            id = tx.retarget_edge(id, Endpoint::From, survivor_id)?.id;
        }
        if edge.to == absorbed_id {
            tx.retarget_edge(id, Endpoint::To, survivor_id)?;
        }
        report.edges_rewired += 1;
    }
    Ok(())
}

fn verify_no_leftovers(tx: &dyn GraphTransaction, tombstoned: &[String]) -> PolarisResult<()> {
    let marked = tx.edges_with_property(RETARGET_MARKER)?;
    if !marked.is_empty() {
        return Err(IntegrityViolation::LeftoverRetargetEdges { count: marked.len() }.into());
    }
    for id in tombstoned {
        let live = tx.edges_of(id, Direction::Both)?;
        if !live.is_empty() {
            return Err(IntegrityViolation::TombstoneHasEdges {
                id: id.clone(),
                count: live.len(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::Claim;
    use crate::error::PolarisError;
    use crate::graph::Edge;
    use crate::identity::{mint_typed, EntityType};
    use crate::storage::InMemoryGraphStore;

    fn setup() -> (Arc<InMemoryGraphStore>, MergeEngine) {
        let store = Arc::new(InMemoryGraphStore::new());
        let engine = MergeEngine::new(store.clone());
        (store, engine)
    }

    fn insert(store: &InMemoryGraphStore, nodes: Vec<Node>, edges: Vec<Edge>, claims: Vec<Claim>) {
        let mut tx = store.begin().unwrap();
        for n in nodes {
            tx.insert_node(n).unwrap();
        }
        for e in edges {
            tx.insert_edge(e).unwrap();
        }
        for c in claims {
            tx.insert_claim(c).unwrap();
        }
        tx.commit().unwrap();
    }

    fn claim(entity: &str, property: &str) -> Claim {
        Claim::builder()
            .entity(entity)
            .property(property)
            .value("v")
            .submitter("alice")
            .build()
            .unwrap()
    }

    #[test]
    fn empty_batch_is_rejected() {
        let (_, engine) = setup();
        let s = mint_typed(EntityType::Group);
        let err = engine
            .merge::<String>(s.as_str(), &[], &MergeOptions::new("bob", "h"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn non_canonical_survivor_is_rejected() {
        let (_, engine) = setup();
        let a = mint_typed(EntityType::Group);
        let err = engine
            .merge("prov:group:1", &[a.as_str()], &MergeOptions::new("bob", "h"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn self_merge_is_rejected() {
        let (_, engine) = setup();
        let s = mint_typed(EntityType::Group);
        let err = engine
            .merge(s.as_str(), &[s.as_str()], &MergeOptions::new("bob", "h"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn absorbed_id_of_another_type_is_rejected_before_lookup() {
        let (store, engine) = setup();
        let s = mint_typed(EntityType::Group);
        insert(&store, vec![Node::entity(s.as_str(), EntityType::Group)], vec![], vec![]);
        let before = store.snapshot().unwrap();

        // The person node does not exist; the id alone is enough to refuse.
        let person = mint_typed(EntityType::Person);
        let err = engine
            .merge(s.as_str(), &[person.as_str()], &MergeOptions::new("bob", "h"))
            .unwrap_err();
        assert!(matches!(
            err,
            PolarisError::Validation(ValidationError::WrongEntityType { ref expected, ref actual, .. })
                if expected == "group" && actual == "person"
        ));
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[test]
    fn missing_survivor_is_not_found() {
        let (_, engine) = setup();
        let s = mint_typed(EntityType::Group);
        let a = mint_typed(EntityType::Group);
        let err = engine
            .merge(s.as_str(), &[a.as_str()], &MergeOptions::new("bob", "h"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn edge_between_survivor_and_absorbed_becomes_removed_self_loop() {
        let (store, engine) = setup();
        let s = mint_typed(EntityType::Person);
        let a = mint_typed(EntityType::Person);
        let g = mint_typed(EntityType::Group);
        insert(
            &store,
            vec![
                Node::entity(s.as_str(), EntityType::Person),
                Node::entity(a.as_str(), EntityType::Person),
                Node::entity(g.as_str(), EntityType::Group),
            ],
            vec![
                Edge::new(RelType::MemberOf, a.as_str(), g.as_str()),
                // Odd but legal input: the two duplicates linked to each other.
                Edge::new(RelType::MemberOf, a.as_str(), s.as_str()),
            ],
            vec![],
        );

        let report = engine
            .merge(s.as_str(), &[a.as_str()], &MergeOptions::new("bob", "h"))
            .unwrap();
        assert_eq!(report.edges_rewired, 1);
        assert_eq!(report.self_loops_removed, 1);

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.edges.len(), 1);
        assert!(snapshot.edges.values().all(|e| e.from == s.as_str()));
    }

    #[test]
    fn without_rewire_data_edges_are_dropped_but_aliases_follow() {
        let (store, engine) = setup();
        let s = mint_typed(EntityType::Track);
        let a = mint_typed(EntityType::Track);
        let r = mint_typed(EntityType::Release);
        insert(
            &store,
            vec![
                Node::entity(s.as_str(), EntityType::Track),
                Node::entity(a.as_str(), EntityType::Track),
                Node::entity(r.as_str(), EntityType::Release),
                Node::alias("prov:track:1"),
            ],
            vec![
                Edge::new(RelType::InRelease, a.as_str(), r.as_str()),
                Edge::new(RelType::AliasOf, "prov:track:1", a.as_str()),
            ],
            vec![],
        );

        let report = engine
            .merge(
                s.as_str(),
                &[a.as_str()],
                &MergeOptions::new("bob", "h").rewire_edges(false),
            )
            .unwrap();
        assert_eq!(report.edges_dropped, 1);
        assert_eq!(report.edges_rewired, 1);

        let snapshot = store.snapshot().unwrap();
        let alias_edge = snapshot.edges.values().find(|e| e.rel == RelType::AliasOf).unwrap();
        assert_eq!(alias_edge.to, s.as_str());
    }

    #[test]
    fn claims_stay_put_when_not_moved() {
        let (store, engine) = setup();
        let s = mint_typed(EntityType::Label);
        let a = mint_typed(EntityType::Label);
        insert(
            &store,
            vec![
                Node::entity(s.as_str(), EntityType::Label),
                Node::entity(a.as_str(), EntityType::Label),
            ],
            vec![],
            vec![claim(a.as_str(), "name")],
        );
        let report = engine
            .merge(
                s.as_str(),
                &[a.as_str()],
                &MergeOptions::new("bob", "h").move_claims(false),
            )
            .unwrap();
        assert_eq!(report.claims_moved, 0);
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.claims.values().all(|c| c.entity_id == a.as_str()));
    }

    #[test]
    fn survivor_bookkeeping_is_bumped() {
        let (store, engine) = setup();
        let s = mint_typed(EntityType::Song);
        let a = mint_typed(EntityType::Song);
        let b = mint_typed(EntityType::Song);
        insert(
            &store,
            vec![
                Node::entity(s.as_str(), EntityType::Song),
                Node::entity(a.as_str(), EntityType::Song),
                Node::entity(b.as_str(), EntityType::Song),
            ],
            vec![],
            vec![],
        );
        engine
            .merge(s.as_str(), &[a.as_str(), b.as_str(), a.as_str()], &MergeOptions::new("bob", "h"))
            .unwrap();
        let node = store.snapshot().unwrap().nodes[s.as_str()].clone();
        assert_eq!(node.absorbed_count, 2);
        assert!(node.last_merged_at.is_some());
    }

    #[test]
    fn tombstoned_survivor_resolves_to_successor() {
        let (store, engine) = setup();
        let a = mint_typed(EntityType::Master);
        let b = mint_typed(EntityType::Master);
        let c = mint_typed(EntityType::Master);
        insert(
            &store,
            vec![
                Node::entity(a.as_str(), EntityType::Master),
                Node::entity(b.as_str(), EntityType::Master),
                Node::entity(c.as_str(), EntityType::Master),
            ],
            vec![],
            vec![],
        );
        engine.merge(b.as_str(), &[a.as_str()], &MergeOptions::new("x", "h1")).unwrap();
        let report = engine.merge(a.as_str(), &[c.as_str()], &MergeOptions::new("x", "h2")).unwrap();
        assert_eq!(report.survivor, b.as_str());
        let snapshot = store.snapshot().unwrap();
        assert_eq!(
            snapshot.nodes[c.as_str()].tombstone.as_ref().unwrap().merged_into,
            b.as_str()
        );
    }
}
