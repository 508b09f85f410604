//! Release-bundle ingestion.
//!
//! A bundle describes one release together with the people, groups, songs,
//! tracks, labels and master around it. Every reference is resolved to a
//! canonical entity (existing, aliased, mapped, or minted deterministically
//! from the event hash) and the whole bundle lands in one transaction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PolarisError, PolarisResult, ValidationError};
use crate::event::Event;
use crate::graph::{Edge, EdgeId, Node, RelType};
use crate::identity::{self, classify, EntityType, IdKind};
use crate::resolution::{self, AliasOptions, AliasOutcome};
use crate::storage::{with_transaction, GraphTransaction};

use super::dispatch::{external_mapping_request, insert_property_claims, parse_body, HandlerContext};

/// One entity in a bundle. Unrecognized fields are submitted properties.
#[derive(Debug, Default, Deserialize)]
struct Item {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    external_ids: Vec<String>,
    /// Groups: member persons.
    #[serde(default)]
    members: Vec<String>,
    /// Songs: writing persons.
    #[serde(default)]
    writers: Vec<String>,
    /// Tracks: the recorded song.
    #[serde(default)]
    song: Option<String>,
    /// Tracks: performing groups.
    #[serde(default)]
    performed_by: Vec<String>,
    /// Tracks: guest persons.
    #[serde(default)]
    guests: Vec<String>,
    #[serde(flatten)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BundleBody {
    release: Item,
    #[serde(default)]
    master: Option<Item>,
    #[serde(default)]
    labels: Vec<Item>,
    #[serde(default)]
    persons: Vec<Item>,
    #[serde(default)]
    groups: Vec<Item>,
    #[serde(default)]
    songs: Vec<Item>,
    #[serde(default)]
    tracks: Vec<Item>,
}

/// Counts reported for a processed bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSummary {
    pub release_id: String,
    pub entities_created: usize,
    pub entities_reused: usize,
    pub edges_created: usize,
    pub claims_created: usize,
    pub aliases_created: usize,
    pub mappings_created: usize,
}

struct BundleWriter<'a> {
    ctx: &'a HandlerContext<'a>,
    author: &'a str,
    /// Bundle-local references already resolved.
    local: HashMap<String, String>,
    summary: BundleSummary,
}

pub(crate) fn handle(ctx: &HandlerContext<'_>, event: &Event) -> PolarisResult<Value> {
    let body: BundleBody = parse_body(event)?;
    let author = event.author_pubkey.as_str();

    let summary = with_transaction(ctx.graph, |tx| {
        let mut writer = BundleWriter {
            ctx,
            author,
            local: HashMap::new(),
            summary: BundleSummary::default(),
        };
        writer.write(tx, &body)?;
        Ok::<_, PolarisError>(writer.summary)
    })?;

    tracing::info!(
        release = %summary.release_id,
        created = summary.entities_created,
        reused = summary.entities_reused,
        edges = summary.edges_created,
        claims = summary.claims_created,
        "release bundle ingested"
    );
    serde_json::to_value(summary).map_err(|e| PolarisError::internal(format!("bundle summary: {e}")))
}

impl BundleWriter<'_> {
    fn write(&mut self, tx: &mut dyn GraphTransaction, body: &BundleBody) -> PolarisResult<()> {
        let release = self.entity(tx, &body.release, EntityType::Release, 0)?;
        self.summary.release_id.clone_from(&release);

        if let Some(master) = &body.master {
            let master = self.entity(tx, master, EntityType::Master, 0)?;
            self.edge(tx, RelType::InMaster, &release, &master)?;
        }
        for (i, label) in body.labels.iter().enumerate() {
            let label = self.entity(tx, label, EntityType::Label, i)?;
            self.edge(tx, RelType::ReleasedBy, &release, &label)?;
        }
        for (i, person) in body.persons.iter().enumerate() {
            self.entity(tx, person, EntityType::Person, i)?;
        }
        for (i, group) in body.groups.iter().enumerate() {
            let group_id = self.entity(tx, group, EntityType::Group, i)?;
            for member in &group.members {
                let person = self.reference(tx, member, EntityType::Person)?;
                self.edge(tx, RelType::MemberOf, &person, &group_id)?;
            }
        }
        for (i, song) in body.songs.iter().enumerate() {
            let song_id = self.entity(tx, song, EntityType::Song, i)?;
            for writer in &song.writers {
                let person = self.reference(tx, writer, EntityType::Person)?;
                self.edge(tx, RelType::Wrote, &person, &song_id)?;
            }
        }
        for (i, track) in body.tracks.iter().enumerate() {
            let track_id = self.entity(tx, track, EntityType::Track, i)?;
            self.edge(tx, RelType::InRelease, &track_id, &release)?;
            if let Some(song) = &track.song {
                let song = self.reference(tx, song, EntityType::Song)?;
                self.edge(tx, RelType::RecordingOf, &track_id, &song)?;
            }
            for performer in &track.performed_by {
                let group = self.reference(tx, performer, EntityType::Group)?;
                self.edge(tx, RelType::PerformedOn, &group, &track_id)?;
            }
            for guest in &track.guests {
                let person = self.reference(tx, guest, EntityType::Person)?;
                self.edge(tx, RelType::GuestOn, &person, &track_id)?;
            }
        }
        Ok(())
    }

    /// Resolves a listed item, attaching its properties and external ids.
    fn entity(
        &mut self,
        tx: &mut dyn GraphTransaction,
        item: &Item,
        entity_type: EntityType,
        index: usize,
    ) -> PolarisResult<String> {
        let id = match &item.id {
            Some(raw) => self.resolve(tx, raw, entity_type, &item.properties)?,
            None => {
                let seed = format!("{}:{entity_type}:{index}", self.ctx.event_hash);
                let id = identity::mint_from_seed(entity_type, &seed);
                self.ensure_node(tx, id.as_str(), entity_type, &item.properties)?
            }
        };

        let seed = format!("{}:{id}", self.ctx.event_hash);
        self.summary.claims_created +=
            insert_property_claims(tx, &id, &item.properties, &seed, self.author, self.ctx.event_hash)?;

        for external in &item.external_ids {
            let request = external_mapping_request(external, &id, 1.0, self.author, self.ctx.event_hash)?;
            resolution::create_external_mapping(tx, &request)?;
            self.summary.mappings_created += 1;
        }
        Ok(id)
    }

    /// Resolves a bare reference from a relationship field.
    fn reference(
        &mut self,
        tx: &mut dyn GraphTransaction,
        raw: &str,
        entity_type: EntityType,
    ) -> PolarisResult<String> {
        self.resolve(tx, raw, entity_type, &Map::new())
    }

    fn resolve(
        &mut self,
        tx: &mut dyn GraphTransaction,
        raw: &str,
        entity_type: EntityType,
        properties: &Map<String, Value>,
    ) -> PolarisResult<String> {
        if let Some(id) = self.local.get(raw) {
            return Ok(id.clone());
        }

        let c = classify(raw);
        if !c.valid {
            return Err(ValidationError::InvalidIdentifier {
                id: raw.to_string(),
                reason: c.reason.unwrap_or_else(|| "malformed identifier".to_string()),
            }
            .into());
        }
        if let Some(declared) = c.entity_type().filter(|t| *t != entity_type) {
            return Err(ValidationError::WrongEntityType {
                id: raw.to_string(),
                expected: entity_type.to_string(),
                actual: declared.to_string(),
            }
            .into());
        }

        let id = match resolution::try_resolve(tx, raw, self.ctx.max_hops)? {
            Some(existing) => {
                check_type(raw, &existing, entity_type)?;
                self.summary.entities_reused += 1;
                existing
            }
            None if c.kind == IdKind::Canonical => self.ensure_node(tx, raw, entity_type, properties)?,
            None => {
                let minted = identity::mint_from_seed(entity_type, &format!("{}:{raw}", self.ctx.event_hash));
                let minted = self.ensure_node(tx, minted.as_str(), entity_type, properties)?;
                if c.kind == IdKind::External {
                    let request = external_mapping_request(raw, &minted, 1.0, self.author, self.ctx.event_hash)?;
                    resolution::create_external_mapping(tx, &request)?;
                    self.summary.mappings_created += 1;
                } else {
                    let options = AliasOptions::provisional(self.author, "release_bundle");
                    if resolution::create_alias(tx, raw, &minted, &options, self.ctx.max_hops)?
                        == AliasOutcome::Created
                    {
                        self.summary.aliases_created += 1;
                    }
                }
                minted
            }
        };

        self.local.insert(raw.to_string(), id.clone());
        Ok(id)
    }

    /// Creates the entity unless it exists; returns the live id.
    fn ensure_node(
        &mut self,
        tx: &mut dyn GraphTransaction,
        id: &str,
        entity_type: EntityType,
        properties: &Map<String, Value>,
    ) -> PolarisResult<String> {
        if tx.get_node(id)?.is_some() {
            // A replayed mint may have been merged away since.
            let live = resolution::resolve_to_canonical(tx, id, self.ctx.max_hops)?;
            check_type(id, &live, entity_type)?;
            self.summary.entities_reused += 1;
            return Ok(live);
        }
        tx.insert_node(Node::entity(id, entity_type).with_properties(properties.clone()))?;
        self.summary.entities_created += 1;
        Ok(id.to_string())
    }

    fn edge(&mut self, tx: &mut dyn GraphTransaction, rel: RelType, from: &str, to: &str) -> PolarisResult<()> {
        let id = EdgeId::from_seed(&format!("{}:{rel}:{from}:{to}", self.ctx.event_hash));
        if tx.get_edge(id)?.is_none() {
            tx.insert_edge(Edge::new(rel, from, to).with_id(id))?;
            self.summary.edges_created += 1;
        }
        Ok(())
    }
}

fn check_type(raw: &str, resolved: &str, expected: EntityType) -> Result<(), ValidationError> {
    let actual = classify(resolved).entity_type();
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(ValidationError::WrongEntityType {
            id: raw.to_string(),
            expected: expected.to_string(),
            actual: actual.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::merge::MergeEngine;
    use crate::storage::InMemoryGraphStore;
    use serde_json::json;
    use std::sync::Arc;

    fn run(store: &Arc<InMemoryGraphStore>, hash: &str, body: Value) -> PolarisResult<BundleSummary> {
        let merge = MergeEngine::new(store.clone());
        let ctx = HandlerContext {
            graph: store.as_ref(),
            merge: &merge,
            max_hops: 128,
            event_hash: hash,
        };
        let event = Event::new(EventType::CreateReleaseBundle, "alice", 1).with_body(body);
        let value = handle(&ctx, &event)?;
        Ok(serde_json::from_value(value).unwrap())
    }

    fn sample() -> Value {
        json!({
            "release": {"name": "Tago Mago", "year": 1971},
            "labels": [{"id": "discogs:label:1", "name": "United Artists"}],
            "persons": [{"id": "prov:person:damo", "name": "Damo Suzuki"}],
            "groups": [{"id": "prov:group:can", "name": "Can", "members": ["prov:person:damo", "prov:person:holger"]}],
            "songs": [{"id": "prov:song:oh-yeah", "title": "Oh Yeah", "writers": ["prov:person:holger"]}],
            "tracks": [{"title": "Oh Yeah", "song": "prov:song:oh-yeah", "performed_by": ["prov:group:can"]}]
        })
    }

    #[test]
    fn bundle_creates_entities_edges_and_claims() {
        let store = Arc::new(InMemoryGraphStore::new());
        let summary = run(&store, "h1", sample()).unwrap();

        // release, label, damo, can, holger, song, track
        assert_eq!(summary.entities_created, 7);
        // IN_RELEASE, RELEASED_BY, 2x MEMBER_OF, WROTE, RECORDING_OF, PERFORMED_ON
        assert_eq!(summary.edges_created, 7);
        assert_eq!(summary.mappings_created, 1);
        assert_eq!(summary.aliases_created, 4);

        let resolver = resolution::IdentityResolver::new(store.clone());
        let can = resolver.resolve_to_canonical("prov:group:can").unwrap();
        assert!(can.starts_with("polaris:group:"));
        let label = resolver.resolve_to_canonical("discogs:label:1").unwrap();
        assert!(label.starts_with("polaris:label:"));

        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.claims.values().any(|c| c.property == "year" && c.value == json!(1971)));
    }

    #[test]
    fn bundle_replay_converges() {
        let store = Arc::new(InMemoryGraphStore::new());
        run(&store, "h1", sample()).unwrap();
        let before = store.snapshot().unwrap();
        let again = run(&store, "h1", sample()).unwrap();
        assert_eq!(again.entities_created, 0);
        assert_eq!(again.edges_created, 0);
        assert_eq!(again.claims_created, 0);
        let after = store.snapshot().unwrap();
        assert_eq!(before.nodes.len(), after.nodes.len());
        assert_eq!(before.edges.len(), after.edges.len());
        assert_eq!(before.claims.len(), after.claims.len());
    }

    #[test]
    fn second_bundle_reuses_resolved_entities() {
        let store = Arc::new(InMemoryGraphStore::new());
        run(&store, "h1", sample()).unwrap();
        let summary = run(
            &store,
            "h2",
            json!({
                "release": {"name": "Ege Bamyasi"},
                "tracks": [{"title": "Vitamin C", "performed_by": ["prov:group:can"]}]
            }),
        )
        .unwrap();
        assert_eq!(summary.entities_created, 2);
        assert_eq!(summary.entities_reused, 1);
    }

    #[test]
    fn wrong_reference_type_rolls_back() {
        let store = Arc::new(InMemoryGraphStore::new());
        let err = run(
            &store,
            "h1",
            json!({
                "release": {"name": "X"},
                "tracks": [{"title": "Y", "performed_by": ["prov:person:someone"]}]
            }),
        )
        .unwrap_err();
        assert!(err.is_validation());
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.nodes.is_empty());
    }

    #[test]
    fn bundle_without_release_is_malformed() {
        let store = Arc::new(InMemoryGraphStore::new());
        let err = run(&store, "h1", json!({"tracks": []})).unwrap_err();
        assert!(err.is_validation());
    }
}
