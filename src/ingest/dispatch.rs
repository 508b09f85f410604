//! Typed event handlers.
//!
//! Dispatch is a closed match over [`EventType`]. Every mutating handler runs
//! in one graph transaction, so a failed event leaves no partial state.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::claim::{Claim, ClaimId, Confidence};
use crate::error::{NotFoundError, PolarisError, PolarisResult, ValidationError};
use crate::event::{Event, EventType};
use crate::graph::{Node, NodeKind};
use crate::identity::{self, classify, CanonicalId, EntityType, IdKind, ParsedId};
use crate::merge::{MergeEngine, MergeOptions};
use crate::resolution::{self, AliasOptions, MappingRequest};
use crate::storage::{with_transaction, GraphStore, GraphTransaction};

use super::bundle;

/// How a dispatched event ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Processed(Value),
    Skipped(String),
}

/// Everything a handler needs besides the event itself.
pub struct HandlerContext<'a> {
    pub graph: &'a dyn GraphStore,
    pub merge: &'a MergeEngine,
    pub max_hops: usize,
    /// Authoritative hash of the event being handled.
    pub event_hash: &'a str,
}

/// Routes an event to its handler.
///
/// # Errors
/// Whatever the handler raises; the caller reports it as a failed event.
pub fn dispatch(ctx: &HandlerContext<'_>, event: &Event) -> PolarisResult<Disposition> {
    match &event.event_type {
        EventType::CreateReleaseBundle => bundle::handle(ctx, event).map(Disposition::Processed),
        EventType::MintEntity => mint_entity(ctx, event).map(Disposition::Processed),
        EventType::ResolveId => resolve_id(ctx, event).map(Disposition::Processed),
        EventType::AddClaim => add_claim(ctx, event, false).map(Disposition::Processed),
        EventType::EditClaim => add_claim(ctx, event, true).map(Disposition::Processed),
        EventType::MergeEntity => merge_entity(ctx, event).map(Disposition::Processed),
        EventType::Vote | EventType::Finalize => Ok(Disposition::Processed(json!({
            "deferred": true,
            "event_type": event.event_type.name(),
        }))),
        EventType::Like | EventType::Discuss => Ok(Disposition::Skipped(format!(
            "{} events do not mutate the registry",
            event.event_type
        ))),
        EventType::Other(name) => Ok(Disposition::Skipped(format!("no handler for event type {name}"))),
    }
}

/// Deserializes an event body, tagging failures with the event type.
pub(crate) fn parse_body<T: DeserializeOwned>(event: &Event) -> Result<T, ValidationError> {
    serde_json::from_value(event.body.clone()).map_err(|e| ValidationError::MalformedBody {
        event_type: event.event_type.to_string(),
        reason: e.to_string(),
    })
}

/// Mapping request for an id in external grammar.
pub(crate) fn external_mapping_request(
    external: &str,
    canonical_id: &str,
    confidence: f64,
    submitter: &str,
    evidence: &str,
) -> Result<MappingRequest, ValidationError> {
    let c = classify(external);
    match c.fields {
        ParsedId::External {
            source,
            external_type,
            external_id,
        } if c.valid => Ok(MappingRequest {
            source,
            external_type,
            external_id,
            canonical_id: canonical_id.to_string(),
            confidence,
            submitter: submitter.to_string(),
            evidence: evidence.to_string(),
        }),
        _ => Err(ValidationError::InvalidIdentifier {
            id: external.to_string(),
            reason: c
                .reason
                .unwrap_or_else(|| "not an external identifier".to_string()),
        }),
    }
}

/// One claim per property, with ids derived from the event so replays converge.
pub(crate) fn insert_property_claims(
    tx: &mut dyn GraphTransaction,
    entity_id: &str,
    properties: &Map<String, Value>,
    seed: &str,
    submitter: &str,
    event_hash: &str,
) -> PolarisResult<usize> {
    let mut inserted = 0;
    for (property, value) in properties {
        let id = ClaimId::from_seed(&format!("{seed}:{property}"));
        if tx.get_claim(id)?.is_some() {
            continue;
        }
        let claim = Claim::builder()
            .id(id)
            .entity(entity_id)
            .property(property.as_str())
            .value(value.clone())
            .submitter(submitter)
            .event_hash(event_hash)
            .build()?;
        tx.insert_claim(claim)?;
        inserted += 1;
    }
    Ok(inserted)
}

#[derive(Debug, Deserialize)]
struct MintBody {
    entity_type: EntityType,
    #[serde(default)]
    canonical_id: Option<String>,
    #[serde(default)]
    provisional_id: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    external_ids: Vec<String>,
}

fn mint_entity(ctx: &HandlerContext<'_>, event: &Event) -> PolarisResult<Value> {
    let body: MintBody = parse_body(event)?;
    let id = match &body.canonical_id {
        Some(raw) => {
            let id = CanonicalId::parse(raw)?;
            if id.entity_type() != body.entity_type {
                return Err(ValidationError::WrongEntityType {
                    id: raw.clone(),
                    expected: body.entity_type.to_string(),
                    actual: id.entity_type().to_string(),
                }
                .into());
            }
            id
        }
        None => identity::mint_from_seed(body.entity_type, &format!("{}:mint", ctx.event_hash)),
    };

    let author = event.author_pubkey.as_str();
    with_transaction(ctx.graph, |tx| {
        if let Some(existing) = tx.get_node(id.as_str())? {
            return match existing.kind {
                NodeKind::Entity(t) if t == body.entity_type => {
                    tracing::debug!(id = %id, "entity already minted");
                    Ok(json!({ "canonical_id": id.as_str(), "created": false }))
                }
                kind => Err(ValidationError::WrongEntityType {
                    id: id.to_string(),
                    expected: body.entity_type.to_string(),
                    actual: kind
                        .entity_type()
                        .map_or_else(|| "alias".to_string(), |t| t.to_string()),
                }
                .into()),
            };
        }

        tx.insert_node(Node::entity(id.as_str(), body.entity_type).with_properties(body.properties.clone()))?;
        let claims = insert_property_claims(
            tx,
            id.as_str(),
            &body.properties,
            &format!("{}:{id}", ctx.event_hash),
            author,
            ctx.event_hash,
        )?;

        if let Some(provisional) = &body.provisional_id {
            resolution::create_alias(
                tx,
                provisional,
                id.as_str(),
                &AliasOptions::provisional(author, "mint"),
                ctx.max_hops,
            )?;
        }
        for external in &body.external_ids {
            let request = external_mapping_request(external, id.as_str(), 1.0, author, ctx.event_hash)?;
            resolution::create_external_mapping(tx, &request)?;
        }

        tracing::info!(id = %id, entity_type = %body.entity_type, claims, "entity minted");
        Ok(json!({
            "canonical_id": id.as_str(),
            "created": true,
            "claims": claims,
            "mappings": body.external_ids.len(),
        }))
    })
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    subject_id: String,
    canonical_id: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    evidence: Option<String>,
}

fn resolve_id(ctx: &HandlerContext<'_>, event: &Event) -> PolarisResult<Value> {
    let body: ResolveBody = parse_body(event)?;
    let author = event.author_pubkey.as_str();
    let subject = classify(&body.subject_id);

    with_transaction(ctx.graph, |tx| match subject.kind {
        IdKind::External => {
            let request = external_mapping_request(
                &body.subject_id,
                &body.canonical_id,
                body.confidence.unwrap_or(1.0),
                author,
                body.evidence.as_deref().unwrap_or(ctx.event_hash),
            )?;
            let mapping = resolution::create_external_mapping(tx, &request)?;
            Ok(json!({ "mapping": mapping.key.as_str(), "canonical_id": mapping.canonical_id }))
        }
        IdKind::Provisional => {
            if let Some(c) = body.confidence {
                Confidence::new(c)?;
            }
            let options = AliasOptions::provisional(author, body.method.as_deref().unwrap_or("resolve"));
            let outcome =
                resolution::create_alias(tx, &body.subject_id, &body.canonical_id, &options, ctx.max_hops)?;
            Ok(json!({
                "alias": body.subject_id,
                "canonical_id": body.canonical_id,
                "created": outcome == resolution::AliasOutcome::Created,
            }))
        }
        IdKind::Canonical => Err(PolarisError::from(ValidationError::InvalidIdentifier {
            id: body.subject_id.clone(),
            reason: "a canonical id cannot be resolved onto another; merge instead".to_string(),
        })),
    })
}

#[derive(Debug, Deserialize)]
struct ClaimBody {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    claim_id: Option<ClaimId>,
    #[serde(default)]
    property: Option<String>,
    value: Value,
    #[serde(default)]
    confidence: Option<f64>,
}

fn add_claim(ctx: &HandlerContext<'_>, event: &Event, edit: bool) -> PolarisResult<Value> {
    let body: ClaimBody = parse_body(event)?;
    let confidence = body.confidence.map(Confidence::new).transpose()?.unwrap_or_default();
    let author = event.author_pubkey.as_str();

    with_transaction(ctx.graph, |tx| {
        let previous = match (edit, body.claim_id) {
            (true, Some(id)) => Some(tx.get_claim(id)?.ok_or_else(|| NotFoundError::Claim { id: id.to_string() })?),
            (true, None) => {
                return Err(ValidationError::MissingField {
                    field: "claim_id".to_string(),
                }
                .into())
            }
            (false, _) => None,
        };

        let entity_ref = body
            .entity_id
            .clone()
            .or_else(|| previous.as_ref().map(|c| c.entity_id.clone()))
            .ok_or_else(|| ValidationError::MissingField {
                field: "entity_id".to_string(),
            })?;
        let property = body
            .property
            .clone()
            .or_else(|| previous.as_ref().map(|c| c.property.clone()))
            .ok_or_else(|| ValidationError::MissingField {
                field: "property".to_string(),
            })?;

        let entity_id = resolution::resolve_to_canonical(tx, &entity_ref, ctx.max_hops)?;
        let claim = Claim::builder()
            .id(ClaimId::from_seed(&format!("{}:claim", ctx.event_hash)))
            .entity(entity_id.as_str())
            .property(property)
            .value(body.value.clone())
            .confidence(confidence)
            .submitter(author)
            .event_hash(ctx.event_hash)
            .supersedes(previous.map(|c| c.id))
            .build()?;
        let claim_id = claim.id;
        tx.insert_claim(claim)?;

        Ok(json!({ "claim_id": claim_id.to_string(), "entity_id": entity_id }))
    })
}

#[derive(Debug, Deserialize)]
struct MergeBody {
    survivor_id: String,
    absorbed_ids: Vec<String>,
    #[serde(default)]
    evidence: String,
    #[serde(default)]
    rewire_edges: Option<bool>,
    #[serde(default)]
    move_claims: Option<bool>,
}

fn merge_entity(ctx: &HandlerContext<'_>, event: &Event) -> PolarisResult<Value> {
    let body: MergeBody = parse_body(event)?;
    let options = MergeOptions::new(event.author_pubkey.as_str(), ctx.event_hash)
        .with_evidence(body.evidence)
        .rewire_edges(body.rewire_edges.unwrap_or(true))
        .move_claims(body.move_claims.unwrap_or(true));
    let report = ctx.merge.merge(&body.survivor_id, &body.absorbed_ids, &options)?;
    serde_json::to_value(report).map_err(|e| PolarisError::internal(format!("merge report: {e}")))
}
