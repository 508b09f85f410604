//! Alias and external-mapping accessors.
//!
//! Aliases are pointer nodes (`prov:…` or external-grammar ids) joined to a
//! canonical entity by one `ALIAS_OF` edge. External mappings are a keyed
//! lookup table from `source:type:id` to a canonical id.
//!
//! Every operation exists in two forms: a free function taking an open
//! transaction, which ingestion handlers compose into one atomic unit, and a
//! method on [`IdentityResolver`] that runs it in its own transaction.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claim::Confidence;
use crate::error::{IntegrityViolation, NotFoundError, PolarisError, PolarisResult, ValidationError};
use crate::graph::{
    AliasKind, Direction, Edge, EdgeId, ExternalMapping, MappingKey, Node, NodeKind, RelType,
};
use crate::identity::{self, ExternalSource, IdKind, ParsedId};
use crate::storage::{with_transaction, GraphStore, GraphTransaction};

/// Default bound on alias/mapping/tombstone hops during resolution.
pub const DEFAULT_MAX_HOPS: usize = 128;

/// Upsert request for an external mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRequest {
    pub source: ExternalSource,
    pub external_type: String,
    pub external_id: String,
    pub canonical_id: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub submitter: String,
    #[serde(default)]
    pub evidence: String,
}

const fn default_confidence() -> f64 {
    1.0
}

/// Provenance recorded on an alias edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasOptions {
    pub created_by: String,
    pub kind: AliasKind,
    pub method: String,
}

impl AliasOptions {
    /// Options for a provisional alias.
    #[must_use]
    pub fn provisional(created_by: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            kind: AliasKind::Provisional,
            method: method.into(),
        }
    }

    /// Options for an external-reference alias.
    #[must_use]
    pub fn external(created_by: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            kind: AliasKind::External,
            method: method.into(),
        }
    }
}

/// Whether `create_alias` wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasOutcome {
    Created,
    AlreadyExists,
}

/// Mapping key for an id in external grammar, if it is one.
#[must_use]
pub fn mapping_key_for(id: &str) -> Option<MappingKey> {
    let c = identity::classify(id);
    if c.kind != IdKind::External || !c.valid {
        return None;
    }
    match c.fields {
        ParsedId::External {
            source,
            external_type,
            external_id,
        } => MappingKey::new(source, &external_type, &external_id).ok(),
        _ => None,
    }
}

fn require_canonical(id: &str) -> Result<(), ValidationError> {
    if identity::is_canonical(id) {
        Ok(())
    } else {
        Err(ValidationError::NotCanonical { id: id.to_string() })
    }
}

/// Upserts an external mapping. Last write wins.
///
/// # Errors
/// - `NotCanonical` / `ConfidenceOutOfRange` / `MissingField` for bad input
/// - `NotFound` if the canonical entity does not exist
pub fn create_external_mapping(
    tx: &mut dyn GraphTransaction,
    request: &MappingRequest,
) -> PolarisResult<ExternalMapping> {
    require_canonical(&request.canonical_id)?;
    let confidence = Confidence::new(request.confidence)?;
    let key = MappingKey::new(request.source, &request.external_type, &request.external_id)?;

    match tx.get_node(&request.canonical_id)? {
        Some(node) if !node.is_alias() => {}
        _ => {
            return Err(NotFoundError::Entity {
                id: request.canonical_id.clone(),
            }
            .into())
        }
    }

    let mapping = ExternalMapping {
        key,
        canonical_id: request.canonical_id.clone(),
        confidence: confidence.value(),
        submitter: request.submitter.clone(),
        evidence: request.evidence.clone(),
        updated_at: Utc::now(),
    };
    let previous = tx.put_mapping(mapping.clone())?;
    if let Some(prev) = previous.filter(|p| p.canonical_id != mapping.canonical_id) {
        tracing::info!(
            key = %mapping.key,
            from = %prev.canonical_id,
            to = %mapping.canonical_id,
            "external mapping re-pointed"
        );
    }
    Ok(mapping)
}

/// Looks up an external mapping.
///
/// # Errors
/// `NotFound` when no mapping exists for the key.
pub fn resolve_external_mapping(
    tx: &dyn GraphTransaction,
    source: ExternalSource,
    external_type: &str,
    external_id: &str,
) -> PolarisResult<String> {
    let key = MappingKey::new(source, external_type, external_id)?;
    tx.get_mapping(&key)?
        .map(|m| m.canonical_id)
        .ok_or_else(|| NotFoundError::Mapping { key: key.to_string() }.into())
}

fn alias_target(tx: &dyn GraphTransaction, alias_id: &str) -> PolarisResult<Option<String>> {
    let targets: Vec<String> = tx
        .edges_of(alias_id, Direction::Outbound)?
        .into_iter()
        .filter(|e| e.rel == RelType::AliasOf)
        .map(|e| e.to)
        .collect();
    match targets.as_slice() {
        [] => Ok(None),
        [target] => Ok(Some(target.clone())),
        _ => Err(IntegrityViolation::MalformedNode {
            id: alias_id.to_string(),
            reason: format!("alias has {} ALIAS_OF edges", targets.len()),
        }
        .into()),
    }
}

/// Creates `alias_id -ALIAS_OF-> canonical_id`, idempotently.
///
/// The target is checked before anything is written, so a missing target
/// leaves no alias node behind.
///
/// # Errors
/// - `NotFound` if the canonical target does not exist
/// - `AliasConflict` if the alias already points elsewhere
/// - `InvalidIdentifier` / `NotCanonical` for bad ids
pub fn create_alias(
    tx: &mut dyn GraphTransaction,
    alias_id: &str,
    canonical_id: &str,
    options: &AliasOptions,
    max_hops: usize,
) -> PolarisResult<AliasOutcome> {
    if alias_id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "alias_id".to_string(),
        }
        .into());
    }
    if identity::is_canonical(alias_id) {
        return Err(ValidationError::InvalidIdentifier {
            id: alias_id.to_string(),
            reason: "canonical ids cannot be aliases".to_string(),
        }
        .into());
    }
    require_canonical(canonical_id)?;

    match tx.get_node(canonical_id)? {
        Some(node) if !node.is_alias() => {}
        _ => {
            return Err(NotFoundError::AliasTarget {
                alias: alias_id.to_string(),
                target: canonical_id.to_string(),
            }
            .into())
        }
    }

    match tx.get_node(alias_id)? {
        Some(node) if !node.is_alias() => {
            return Err(ValidationError::InvalidIdentifier {
                id: alias_id.to_string(),
                reason: "id already names an entity".to_string(),
            }
            .into());
        }
        Some(_) => {
            if let Some(existing) = alias_target(tx, alias_id)? {
                if existing == canonical_id
                    || resolve_to_canonical(tx, &existing, max_hops)?
                        == resolve_to_canonical(tx, canonical_id, max_hops)?
                {
                    return Ok(AliasOutcome::AlreadyExists);
                }
                return Err(ValidationError::AliasConflict {
                    alias: alias_id.to_string(),
                    existing,
                    requested: canonical_id.to_string(),
                }
                .into());
            }
        }
        None => tx.insert_node(Node::alias(alias_id))?,
    }

    let edge = Edge::new(RelType::AliasOf, alias_id, canonical_id)
        .with_id(EdgeId::from_seed(&format!("alias:{alias_id}")))
        .with_property("kind", options.kind.as_str())
        .with_property("method", options.method.as_str())
        .with_property("created_by", options.created_by.as_str())
        .with_property("created_at", Value::String(Utc::now().to_rfc3339()));
    tx.insert_edge(edge)?;

    tracing::debug!(alias = alias_id, target = canonical_id, kind = %options.kind, "alias created");
    Ok(AliasOutcome::Created)
}

/// Resolves any identifier to the live canonical entity it denotes.
///
/// Follows alias edges, external mappings (for external ids with no alias
/// node), and tombstone chains.
///
/// # Errors
/// - `NotFound` if the id never existed
/// - `HopLimitExceeded` / `TombstoneCycle` / `MalformedNode` on a corrupt chain
pub fn resolve_to_canonical(
    tx: &dyn GraphTransaction,
    id: &str,
    max_hops: usize,
) -> PolarisResult<String> {
    let mut current = id.to_string();
    let mut seen = HashSet::new();

    for _ in 0..=max_hops {
        if !seen.insert(current.clone()) {
            return Err(IntegrityViolation::TombstoneCycle { id: id.to_string() }.into());
        }

        let Some(node) = tx.get_node(&current)? else {
            if current == id {
                let mapped = match mapping_key_for(id) {
                    Some(key) => tx.get_mapping(&key)?,
                    None => None,
                };
                if let Some(mapping) = mapped {
                    current = mapping.canonical_id;
                    continue;
                }
                return Err(NotFoundError::Entity { id: id.to_string() }.into());
            }
            return Err(IntegrityViolation::MalformedNode {
                id: current,
                reason: format!("resolution of '{id}' reached a missing node"),
            }
            .into());
        };

        current = match node.kind {
            NodeKind::Alias => alias_target(tx, &node.id)?.ok_or_else(|| {
                PolarisError::from(IntegrityViolation::MalformedNode {
                    id: node.id.clone(),
                    reason: "alias has no ALIAS_OF edge".to_string(),
                })
            })?,
            NodeKind::Entity(_) if node.is_tombstoned() => node
                .tombstone
                .as_ref()
                .map(|t| t.merged_into.clone())
                .ok_or_else(|| {
                    PolarisError::from(IntegrityViolation::MalformedNode {
                        id: node.id.clone(),
                        reason: "merged entity has no tombstone".to_string(),
                    })
                })?,
            NodeKind::Entity(_) => return Ok(node.id),
        };
    }

    Err(IntegrityViolation::HopLimitExceeded {
        id: id.to_string(),
        limit: max_hops,
    }
    .into())
}

/// Like [`resolve_to_canonical`], but an unknown id yields `Ok(None)`.
///
/// # Errors
/// Integrity and storage failures.
pub fn try_resolve(
    tx: &dyn GraphTransaction,
    id: &str,
    max_hops: usize,
) -> PolarisResult<Option<String>> {
    match resolve_to_canonical(tx, id, max_hops) {
        Ok(found) => Ok(Some(found)),
        Err(PolarisError::NotFound(NotFoundError::Entity { .. })) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Identity accessors over a shared graph store, one transaction per call.
#[derive(Clone)]
pub struct IdentityResolver {
    graph: Arc<dyn GraphStore>,
    max_hops: usize,
}

impl IdentityResolver {
    /// Creates a resolver with the default hop limit.
    #[must_use]
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Overrides the hop limit (builder style).
    #[must_use]
    pub const fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// See [`create_external_mapping`].
    ///
    /// # Errors
    /// See [`create_external_mapping`].
    pub fn create_external_mapping(&self, request: &MappingRequest) -> PolarisResult<ExternalMapping> {
        with_transaction(self.graph.as_ref(), |tx| create_external_mapping(tx, request))
    }

    /// See [`resolve_external_mapping`].
    ///
    /// # Errors
    /// See [`resolve_external_mapping`].
    pub fn resolve_external_mapping(
        &self,
        source: ExternalSource,
        external_type: &str,
        external_id: &str,
    ) -> PolarisResult<String> {
        with_transaction(self.graph.as_ref(), |tx| {
            resolve_external_mapping(tx, source, external_type, external_id)
        })
    }

    /// See [`create_alias`].
    ///
    /// # Errors
    /// See [`create_alias`].
    pub fn create_alias(
        &self,
        alias_id: &str,
        canonical_id: &str,
        options: &AliasOptions,
    ) -> PolarisResult<AliasOutcome> {
        let max_hops = self.max_hops;
        with_transaction(self.graph.as_ref(), |tx| {
            create_alias(tx, alias_id, canonical_id, options, max_hops)
        })
    }

    /// See [`resolve_to_canonical`].
    ///
    /// # Errors
    /// See [`resolve_to_canonical`].
    pub fn resolve_to_canonical(&self, id: &str) -> PolarisResult<String> {
        let max_hops = self.max_hops;
        with_transaction(self.graph.as_ref(), |tx| resolve_to_canonical(tx, id, max_hops))
    }

    /// See [`try_resolve`].
    ///
    /// # Errors
    /// See [`try_resolve`].
    pub fn try_resolve(&self, id: &str) -> PolarisResult<Option<String>> {
        let max_hops = self.max_hops;
        with_transaction(self.graph.as_ref(), |tx| try_resolve(tx, id, max_hops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{mint_typed, EntityType};
    use crate::storage::InMemoryGraphStore;

    fn store_with(ids: &[(&str, EntityType)]) -> Arc<InMemoryGraphStore> {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut tx = store.begin().unwrap();
        for (id, t) in ids {
            tx.insert_node(Node::entity(*id, *t)).unwrap();
        }
        tx.commit().unwrap();
        store
    }

    fn opts() -> AliasOptions {
        AliasOptions::provisional("alice", "bundle")
    }

    #[test]
    fn alias_to_missing_target_leaves_nothing() {
        let store = store_with(&[]);
        let resolver = IdentityResolver::new(store.clone());
        let missing = mint_typed(EntityType::Group);

        let err = resolver.create_alias("x", missing.as_str(), &opts()).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.snapshot().unwrap().nodes.get("x").is_none());
    }

    #[test]
    fn alias_creation_is_idempotent() {
        let c1 = mint_typed(EntityType::Person);
        let store = store_with(&[(c1.as_str(), EntityType::Person)]);
        let resolver = IdentityResolver::new(store.clone());

        assert_eq!(resolver.create_alias("p1", c1.as_str(), &opts()).unwrap(), AliasOutcome::Created);
        assert_eq!(
            resolver.create_alias("p1", c1.as_str(), &opts()).unwrap(),
            AliasOutcome::AlreadyExists
        );

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.nodes.values().filter(|n| n.is_alias()).count(), 1);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(resolver.resolve_to_canonical("p1").unwrap(), c1.as_str());
    }

    #[test]
    fn alias_refuses_to_repoint() {
        let c1 = mint_typed(EntityType::Person);
        let c2 = mint_typed(EntityType::Person);
        let store = store_with(&[(c1.as_str(), EntityType::Person), (c2.as_str(), EntityType::Person)]);
        let resolver = IdentityResolver::new(store);

        resolver.create_alias("p1", c1.as_str(), &opts()).unwrap();
        let err = resolver.create_alias("p1", c2.as_str(), &opts()).unwrap_err();
        assert!(matches!(
            err,
            PolarisError::Validation(ValidationError::AliasConflict { .. })
        ));
    }

    #[test]
    fn canonical_ids_cannot_be_aliases() {
        let c1 = mint_typed(EntityType::Person);
        let other = mint_typed(EntityType::Person);
        let store = store_with(&[(c1.as_str(), EntityType::Person)]);
        let resolver = IdentityResolver::new(store);
        let err = resolver.create_alias(other.as_str(), c1.as_str(), &opts()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn external_mapping_last_write_wins() {
        let c1 = mint_typed(EntityType::Group);
        let c2 = mint_typed(EntityType::Group);
        let store = store_with(&[(c1.as_str(), EntityType::Group), (c2.as_str(), EntityType::Group)]);
        let resolver = IdentityResolver::new(store);

        let mut request = MappingRequest {
            source: ExternalSource::Discogs,
            external_type: "artist".to_string(),
            external_id: "42".to_string(),
            canonical_id: c1.to_string(),
            confidence: 0.9,
            submitter: "alice".to_string(),
            evidence: String::new(),
        };
        resolver.create_external_mapping(&request).unwrap();
        request.canonical_id = c2.to_string();
        resolver.create_external_mapping(&request).unwrap();

        assert_eq!(
            resolver
                .resolve_external_mapping(ExternalSource::Discogs, "artist", "42")
                .unwrap(),
            c2.as_str()
        );
        assert_eq!(resolver.resolve_to_canonical("discogs:artist:42").unwrap(), c2.as_str());
    }

    #[test]
    fn external_mapping_validates_input() {
        let c1 = mint_typed(EntityType::Group);
        let store = store_with(&[(c1.as_str(), EntityType::Group)]);
        let resolver = IdentityResolver::new(store);
        let request = MappingRequest {
            source: ExternalSource::Spotify,
            external_type: "artist".to_string(),
            external_id: "abc".to_string(),
            canonical_id: "prov:group:1".to_string(),
            confidence: 1.0,
            submitter: String::new(),
            evidence: String::new(),
        };
        assert!(resolver.create_external_mapping(&request).unwrap_err().is_validation());

        let request = MappingRequest {
            canonical_id: c1.to_string(),
            confidence: 1.5,
            ..request
        };
        assert!(resolver.create_external_mapping(&request).unwrap_err().is_validation());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = store_with(&[]);
        let resolver = IdentityResolver::new(store);
        assert!(resolver.resolve_to_canonical("prov:person:nobody").unwrap_err().is_not_found());
        assert_eq!(resolver.try_resolve("prov:person:nobody").unwrap(), None);
        assert!(resolver
            .resolve_external_mapping(ExternalSource::Isrc, "recording", "X")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn tombstone_cycle_is_an_integrity_violation() {
        let a = mint_typed(EntityType::Group);
        let b = mint_typed(EntityType::Group);
        let store = store_with(&[(a.as_str(), EntityType::Group), (b.as_str(), EntityType::Group)]);
        {
            let mut tx = store.begin().unwrap();
            for (from, to) in [(&a, &b), (&b, &a)] {
                let mut node = tx.get_node(from.as_str()).unwrap().unwrap();
                node.status = crate::graph::EntityStatus::Merged;
                node.tombstone = Some(crate::graph::Tombstone {
                    merged_into: to.to_string(),
                    merged_at: Utc::now(),
                    merged_by: "test".to_string(),
                    merge_event_hash: String::new(),
                    merge_evidence: String::new(),
                });
                tx.update_node(node).unwrap();
            }
            tx.commit().unwrap();
        }
        let resolver = IdentityResolver::new(store);
        assert!(resolver.resolve_to_canonical(a.as_str()).unwrap_err().is_integrity());
    }
}
