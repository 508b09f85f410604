//! End-to-end ingestion: anchored ledger actions in, registry state out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use polaris_core::config::PolarisConfig;
use polaris_core::graph::EntityStatus;
use polaris_core::ingest::{IngestRuntimeConfig, StatsSnapshot};
use polaris_core::storage::{InMemoryEventStore, InMemoryGraphStore};
use polaris_core::{
    AnchoredEvent, ErrorKind, Event, EventStore, EventType, IdentityResolver, IngestRuntime, IngestStatus,
    IngestionPipeline, Payload,
};

struct Registry {
    graph: Arc<InMemoryGraphStore>,
    events: Arc<InMemoryEventStore>,
    pipeline: IngestionPipeline,
    clock: i64,
}

impl Registry {
    fn new() -> Self {
        let graph = Arc::new(InMemoryGraphStore::new());
        let events = Arc::new(InMemoryEventStore::new());
        let pipeline = IngestionPipeline::new(graph.clone(), events.clone());
        Self {
            graph,
            events,
            pipeline,
            clock: 1_700_000_000,
        }
    }

    fn anchored(&mut self, event_type: EventType, author: &str, body: Value) -> AnchoredEvent {
        self.clock += 1;
        put(&Event::new(event_type, author, self.clock).with_body(body))
    }

    fn apply(&mut self, event_type: EventType, author: &str, body: Value) -> (AnchoredEvent, Value) {
        let anchored = self.anchored(event_type, author, body);
        let outcome = self.pipeline.ingest(&anchored).unwrap();
        assert_eq!(outcome.status, IngestStatus::Processed, "{:?}", outcome.error);
        assert!(outcome.hash_mismatch.is_none());
        (anchored, outcome.processing_result.unwrap())
    }

    fn resolver(&self) -> IdentityResolver {
        IdentityResolver::new(self.graph.clone())
    }
}

fn put(event: &Event) -> AnchoredEvent {
    let payload = json!({
        "author": event.author_pubkey,
        "type": event.event_type.code(),
        "event": event,
    });
    AnchoredEvent {
        content_hash: event.canonical_hash().unwrap(),
        payload: Some(Payload::Text(payload.to_string())),
        contract_account: "polaris".to_string(),
        action_name: "put".to_string(),
        block_num: 42,
        trx_id: "trx".to_string(),
        timestamp: 1_700_000_000,
        ..AnchoredEvent::default()
    }
}

fn bundle() -> Value {
    json!({
        "release": {"name": "Tago Mago", "year": 1971, "external_ids": ["discogs:release:123"]},
        "labels": [{"id": "discogs:label:1", "name": "United Artists"}],
        "persons": [
            {"id": "prov:person:damo", "name": "Damo Suzuki"},
            {"id": "prov:person:holger", "name": "Holger Czukay"}
        ],
        "groups": [{"id": "prov:group:can", "name": "Can", "members": ["prov:person:damo", "prov:person:holger"]}],
        "songs": [{"id": "prov:song:halleluhwah", "title": "Halleluhwah", "writers": ["prov:person:holger"]}],
        "tracks": [{
            "title": "Halleluhwah",
            "position": "B1",
            "song": "prov:song:halleluhwah",
            "performed_by": ["prov:group:can"]
        }]
    })
}

#[test]
fn registry_lifecycle_converges_under_replay() {
    let mut reg = Registry::new();
    let mut log = Vec::new();

    let (anchored, summary) = reg.apply(EventType::CreateReleaseBundle, "alice", bundle());
    log.push(anchored);
    let release = summary["release_id"].as_str().unwrap().to_string();
    assert!(release.starts_with("polaris:release:"));
    assert_eq!(reg.resolver().resolve_to_canonical("discogs:release:123").unwrap(), release);

    // A second contributor mints the same band independently.
    let (anchored, minted) = reg.apply(
        EventType::MintEntity,
        "bob",
        json!({"entity_type": "group", "provisional_id": "prov:group:the-can", "properties": {"name": "The Can"}}),
    );
    log.push(anchored);
    let duplicate = minted["canonical_id"].as_str().unwrap().to_string();

    let (anchored, _) = reg.apply(
        EventType::ResolveId,
        "bob",
        json!({"subject_id": "musicbrainz:artist:can-mbid", "canonical_id": duplicate}),
    );
    log.push(anchored);

    let (anchored, claim) = reg.apply(
        EventType::AddClaim,
        "bob",
        json!({"entity_id": "prov:group:the-can", "property": "formed", "value": 1968}),
    );
    log.push(anchored);
    assert_eq!(claim["entity_id"], duplicate.as_str());

    let survivor = reg.resolver().resolve_to_canonical("prov:group:can").unwrap();
    let (anchored, report) = reg.apply(
        EventType::MergeEntity,
        "curator",
        json!({"survivor_id": survivor, "absorbed_ids": [duplicate], "evidence": "same band"}),
    );
    log.push(anchored);
    assert_eq!(report["tombstones_created"], 1);
    assert_eq!(report["claims_moved"], 2);

    // Every id anyone ever used for the band now lands on the survivor.
    let resolver = reg.resolver();
    for id in ["prov:group:can", "prov:group:the-can", "musicbrainz:artist:can-mbid", duplicate.as_str()] {
        assert_eq!(resolver.resolve_to_canonical(id).unwrap(), survivor, "{id}");
    }
    let snapshot = reg.graph.snapshot().unwrap();
    assert_eq!(snapshot.nodes[&duplicate].status, EntityStatus::Merged);
    assert!(snapshot
        .claims
        .values()
        .filter(|c| c.origin_entity_id == duplicate)
        .all(|c| c.entity_id == survivor));

    // Redelivering the whole log changes nothing.
    let stored = reg.events.len().unwrap();
    for anchored in &log {
        let outcome = reg.pipeline.ingest(anchored).unwrap();
        assert_eq!(outcome.status, IngestStatus::Duplicate);
    }
    assert_eq!(reg.graph.snapshot().unwrap(), snapshot);
    assert_eq!(reg.events.len().unwrap(), stored);

    let stats = reg.pipeline.stats().snapshot();
    assert_eq!(
        stats,
        StatsSnapshot {
            received: 10,
            processed: 5,
            duplicates: 5,
            ..StatsSnapshot::default()
        }
    );
}

#[test]
fn restart_with_cold_cache_still_deduplicates() {
    let mut reg = Registry::new();
    let (anchored, _) = reg.apply(EventType::CreateReleaseBundle, "alice", bundle());
    let before = reg.graph.snapshot().unwrap();

    let restarted = IngestionPipeline::new(reg.graph.clone(), reg.events.clone());
    let outcome = restarted.ingest(&anchored).unwrap();
    assert_eq!(outcome.status, IngestStatus::Duplicate);
    assert_eq!(reg.graph.snapshot().unwrap(), before);
}

#[test]
fn rejected_merge_is_reported_and_leaves_graph_untouched() {
    let mut reg = Registry::new();
    reg.apply(EventType::CreateReleaseBundle, "alice", bundle());
    let group = reg.resolver().resolve_to_canonical("prov:group:can").unwrap();
    let person = reg.resolver().resolve_to_canonical("prov:person:damo").unwrap();
    let before = reg.graph.snapshot().unwrap();

    let anchored = reg.anchored(
        EventType::MergeEntity,
        "curator",
        json!({"survivor_id": group, "absorbed_ids": [person]}),
    );
    let outcome = reg.pipeline.ingest(&anchored).unwrap();
    assert_eq!(outcome.status, IngestStatus::Failed);
    assert_eq!(outcome.event_type, Some(EventType::MergeEntity));
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::Validation);
    assert_eq!(reg.graph.snapshot().unwrap(), before);

    // The failure is final for this hash.
    assert!(reg.events.contains(&anchored.content_hash).unwrap());
    assert_eq!(reg.pipeline.ingest(&anchored).unwrap().status, IngestStatus::Duplicate);
}

#[test]
fn resolving_onto_missing_entity_fails() {
    let mut reg = Registry::new();
    let anchored = reg.anchored(
        EventType::ResolveId,
        "bob",
        json!({"subject_id": "discogs:artist:9", "canonical_id": "polaris:person:00000000-0000-4000-8000-000000000000"}),
    );
    let outcome = reg.pipeline.ingest(&anchored).unwrap();
    assert_eq!(outcome.status, IngestStatus::Failed);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::NotFound);
    assert!(reg.graph.snapshot().unwrap().mappings.is_empty());
}

#[test]
fn social_actions_do_not_touch_the_graph() {
    let mut reg = Registry::new();
    let (_, result) = reg.apply(EventType::Vote, "carol", json!({"target": "h", "val": 1}));
    assert_eq!(result["deferred"], true);

    let vote_action = AnchoredEvent {
        content_hash: "vote-action-hash".to_string(),
        payload: Some(Payload::from(r#"{"voter":"dave","target":"h","val":-1}"#)),
        action_name: "vote".to_string(),
        timestamp: 1_700_000_100,
        ..AnchoredEvent::default()
    };
    let outcome = reg.pipeline.ingest(&vote_action).unwrap();
    assert_eq!(outcome.status, IngestStatus::Processed);
    assert_eq!(outcome.event_type, Some(EventType::Vote));
    // Rebuilt envelopes never hash to the ledger's opaque id.
    assert!(outcome.hash_mismatch.is_some());

    let like = reg.anchored(EventType::Like, "erin", json!({"target": "h"}));
    let outcome = reg.pipeline.ingest(&like).unwrap();
    assert_eq!(outcome.status, IngestStatus::Skipped);

    assert!(reg.graph.snapshot().unwrap().nodes.is_empty());
    assert_eq!(reg.events.len().unwrap(), 3);
}

#[test]
fn configured_pipeline_filters_contract() {
    let config: PolarisConfig = "[ingest]\ncontract_account = \"polaris.test\"\ndedup_cache_capacity = 0\n"
        .parse()
        .unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let events = Arc::new(InMemoryEventStore::new());
    let pipeline = IngestionPipeline::from_config(graph, events.clone(), &config);

    let event = Event::new(EventType::MintEntity, "alice", 1).with_body(json!({"entity_type": "label"}));
    let mut anchored = put(&event);
    assert_eq!(pipeline.ingest(&anchored).unwrap().status, IngestStatus::Skipped);
    assert!(events.is_empty().unwrap());

    anchored.contract_account = "polaris.test".to_string();
    assert_eq!(pipeline.ingest(&anchored).unwrap().status, IngestStatus::Processed);
    assert_eq!(pipeline.ingest(&anchored).unwrap().status, IngestStatus::Duplicate);
}

#[test]
fn runtime_applies_concurrent_claims_once_each() {
    let mut reg = Registry::new();
    let (_, minted) = reg.apply(EventType::MintEntity, "alice", json!({"entity_type": "song"}));
    let song = minted["canonical_id"].as_str().unwrap().to_string();

    let claims: Vec<AnchoredEvent> = (0..32)
        .map(|n| reg.anchored(EventType::AddClaim, "bob", json!({"entity_id": song, "property": format!("p{n}"), "value": n})))
        .collect();

    let Registry { graph, pipeline, .. } = reg;
    let runtime = IngestRuntime::start(
        Arc::new(pipeline),
        &IngestRuntimeConfig {
            workers: 4,
            queue_capacity: 64,
        },
    )
    .unwrap();

    // Each event is submitted twice; only one delivery may apply.
    let handles: Vec<_> = claims
        .iter()
        .chain(claims.iter())
        .map(|a| runtime.submit(a.clone()).unwrap())
        .collect();
    let mut processed = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.join_timeout(Duration::from_secs(10)).unwrap().status {
            IngestStatus::Processed => processed += 1,
            IngestStatus::Duplicate => duplicates += 1,
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!(processed, 32);
    assert_eq!(duplicates, 32);
    assert_eq!(graph.snapshot().unwrap().claims.len(), 32);
}
