//! Rebuilds event envelopes from raw contract-action payloads.
//!
//! The anchoring contract exposes a handful of actions. `put` anchors an
//! off-chain event by hash and carries its numeric type code; the other
//! actions are thin acknowledgements whose payload becomes the event body.

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::event::{Event, EventType, Proofs, EVENT_VERSION};

use super::{AnchoredEvent, Payload};

/// Fields of a `put` action that belong to the envelope rather than the body.
const PUT_ENVELOPE_FIELDS: [&str; 6] = ["author", "type", "hash", "parent", "ts", "event"];

/// Account fields, in lookup order, naming who performed a non-`put` action.
const AUTHOR_FIELDS: [&str; 5] = ["author", "voter", "account", "attestor", "submitter"];

/// Decodes the raw payload into a JSON object.
///
/// # Errors
/// `MalformedPayload` for invalid UTF-8/JSON or a non-object payload.
pub fn decode_payload(payload: &Payload) -> Result<Map<String, Value>, ValidationError> {
    let value: Value = match payload {
        Payload::Text(text) => serde_json::from_str(text),
        Payload::Bytes(bytes) => serde_json::from_slice(bytes),
    }
    .map_err(|e| ValidationError::MalformedPayload {
        reason: e.to_string(),
    })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::MalformedPayload {
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Event type denoted by an action.
///
/// # Errors
/// `MalformedPayload` if a `put` has no numeric `type`.
pub fn event_type_for(action_name: &str, payload: &Map<String, Value>) -> Result<EventType, ValidationError> {
    let event_type = match action_name {
        "put" => {
            let code = payload
                .get("type")
                .and_then(Value::as_u64)
                .ok_or_else(|| ValidationError::MalformedPayload {
                    reason: "put action has no numeric type".to_string(),
                })?;
            u8::try_from(code)
                .ok()
                .and_then(EventType::from_code)
                .unwrap_or_else(|| EventType::Other(format!("TYPE_{code}")))
        }
        "vote" => EventType::Vote,
        "finalize" => EventType::Finalize,
        "like" => EventType::Like,
        "attest" => EventType::from("ATTEST"),
        other => EventType::from(other.to_uppercase()),
    };
    Ok(event_type)
}

/// Reconstructs the canonical event envelope for an anchored action.
///
/// A `put` carrying an embedded `event` envelope is taken verbatim. Otherwise
/// the envelope is assembled from the action fields.
///
/// # Errors
/// `MalformedPayload` when the action fields cannot form an envelope.
pub fn reconstruct(
    anchored: &AnchoredEvent,
    payload: Map<String, Value>,
) -> Result<Event, ValidationError> {
    if anchored.action_name == "put" {
        if let Some(embedded) = payload.get("event") {
            return serde_json::from_value(embedded.clone()).map_err(|e| {
                ValidationError::MalformedPayload {
                    reason: format!("embedded event: {e}"),
                }
            });
        }
    }

    let event_type = event_type_for(&anchored.action_name, &payload)?;
    let timestamp = i64::try_from(anchored.timestamp).unwrap_or(i64::MAX);

    if anchored.action_name != "put" {
        let author = AUTHOR_FIELDS
            .iter()
            .find_map(|f| payload.get(*f).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        return Ok(Event {
            v: EVENT_VERSION,
            event_type,
            author_pubkey: author,
            created_at: timestamp,
            parents: Vec::new(),
            body: Value::Object(payload),
            proofs: Proofs::default(),
            sig: String::new(),
        });
    }

    let author = payload
        .get("author")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let created_at = payload.get("ts").and_then(Value::as_i64).unwrap_or(timestamp);
    let parents = payload
        .get("parent")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(|p| vec![p.to_string()])
        .unwrap_or_default();

    let body = match payload.get("body") {
        Some(body) => body.clone(),
        None => Value::Object(
            payload
                .into_iter()
                .filter(|(k, _)| !PUT_ENVELOPE_FIELDS.contains(&k.as_str()))
                .collect(),
        ),
    };

    Ok(Event {
        v: EVENT_VERSION,
        event_type,
        author_pubkey: author,
        created_at,
        parents,
        body,
        proofs: Proofs::default(),
        sig: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn anchored(action: &str) -> AnchoredEvent {
        AnchoredEvent {
            content_hash: "h".to_string(),
            action_name: action.to_string(),
            timestamp: 1_700_000_000,
            ..AnchoredEvent::default()
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(decode_payload(&Payload::Text("[1,2]".to_string())).is_err());
        assert!(decode_payload(&Payload::Text("{not json".to_string())).is_err());
        assert!(decode_payload(&Payload::Bytes(b"{\"a\":1}".to_vec())).is_ok());
    }

    #[test]
    fn test_put_type_codes() {
        let payload = object(json!({"type": 60}));
        assert_eq!(event_type_for("put", &payload).unwrap(), EventType::MergeEntity);
        let payload = object(json!({"type": 99}));
        assert_eq!(
            event_type_for("put", &payload).unwrap(),
            EventType::Other("TYPE_99".to_string())
        );
        assert!(event_type_for("put", &Map::new()).is_err());
    }

    #[test]
    fn test_unknown_actions_are_uppercased() {
        assert_eq!(
            event_type_for("stake", &Map::new()).unwrap(),
            EventType::Other("STAKE".to_string())
        );
        assert_eq!(event_type_for("vote", &Map::new()).unwrap(), EventType::Vote);
    }

    #[test]
    fn test_put_with_embedded_event_is_verbatim() {
        let event = Event::new(EventType::MintEntity, "alice", 42).with_body(json!({"entity_type": "person"}));
        let payload = object(json!({"type": 22, "author": "alice", "event": serde_json::to_value(&event).unwrap()}));
        let rebuilt = reconstruct(&anchored("put"), payload).unwrap();
        assert_eq!(rebuilt, event);
    }

    #[test]
    fn test_put_from_fields() {
        let payload = object(json!({
            "author": "alice", "type": 30, "hash": "abc", "parent": "p0", "ts": 7,
            "tags": ["x"], "entity_id": "prov:group:1"
        }));
        let event = reconstruct(&anchored("put"), payload).unwrap();
        assert_eq!(event.event_type, EventType::AddClaim);
        assert_eq!(event.author_pubkey, "alice");
        assert_eq!(event.created_at, 7);
        assert_eq!(event.parents, vec!["p0".to_string()]);
        assert_eq!(event.body, json!({"tags": ["x"], "entity_id": "prov:group:1"}));
    }

    #[test]
    fn test_vote_action() {
        let payload = object(json!({"voter": "bob", "tx_hash": "abc", "val": 1}));
        let event = reconstruct(&anchored("vote"), payload).unwrap();
        assert_eq!(event.event_type, EventType::Vote);
        assert_eq!(event.author_pubkey, "bob");
        assert_eq!(event.created_at, 1_700_000_000);
        assert_eq!(event.body["val"], 1);
    }
}
