//! Events: immutable, content-addressed registry submissions.
//!
//! An event's identity is the SHA-256 of its canonical JSON form: object keys
//! sorted at every nesting level, arrays left in order, no whitespace. Every
//! implementation must sort identically for hashes to be portable, so the
//! serializer here is explicit rather than relying on map ordering.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{PolarisError, PolarisResult};

/// Envelope version produced by current clients.
pub const EVENT_VERSION: u32 = 1;

/// Event type. Known types form a closed set; anything else is carried verbatim
/// so that validity can be decided by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    CreateReleaseBundle,
    MintEntity,
    ResolveId,
    AddClaim,
    EditClaim,
    Vote,
    Like,
    Discuss,
    Finalize,
    MergeEntity,
    Other(String),
}

impl EventType {
    const KNOWN: [(Self, &'static str, u8); 10] = [
        (Self::CreateReleaseBundle, "CREATE_RELEASE_BUNDLE", 21),
        (Self::MintEntity, "MINT_ENTITY", 22),
        (Self::ResolveId, "RESOLVE_ID", 23),
        (Self::AddClaim, "ADD_CLAIM", 30),
        (Self::EditClaim, "EDIT_CLAIM", 31),
        (Self::Vote, "VOTE", 40),
        (Self::Like, "LIKE", 41),
        (Self::Discuss, "DISCUSS", 42),
        (Self::Finalize, "FINALIZE", 50),
        (Self::MergeEntity, "MERGE_ENTITY", 60),
    ];

    /// Wire name, e.g. `MERGE_ENTITY`.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Other(name) => name,
            known => Self::KNOWN
                .iter()
                .find(|(t, _, _)| t == known)
                .map_or("UNKNOWN", |(_, name, _)| name),
        }
    }

    /// Numeric type code used by the anchoring contract.
    #[must_use]
    pub fn code(&self) -> Option<u8> {
        Self::KNOWN.iter().find(|(t, _, _)| t == self).map(|(_, _, code)| *code)
    }

    /// Looks up a contract type code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::KNOWN
            .iter()
            .find(|(_, _, c)| *c == code)
            .map(|(t, _, _)| t.clone())
    }

    /// Returns true for types outside the known set.
    #[must_use]
    pub const fn is_other(&self) -> bool {
        matches!(self, Self::Other(_))
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self::KNOWN
            .iter()
            .find(|(_, name, _)| *name == value)
            .map_or(Self::Other(value), |(t, _, _)| t.clone())
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Supporting evidence attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proofs {
    #[serde(default)]
    pub source_links: Vec<String>,

    /// Any additional proof fields, preserved so hashing stays faithful.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub v: u32,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub author_pubkey: String,

    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,

    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(default)]
    pub body: Value,

    #[serde(default)]
    pub proofs: Proofs,

    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Creates an unsigned event with an empty body.
    #[must_use]
    pub fn new(event_type: EventType, author_pubkey: impl Into<String>, created_at: i64) -> Self {
        Self {
            v: EVENT_VERSION,
            event_type,
            author_pubkey: author_pubkey.into(),
            created_at,
            parents: Vec::new(),
            body: Value::Object(Map::new()),
            proofs: Proofs::default(),
            sig: String::new(),
        }
    }

    /// Sets the body (builder style).
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Sets the parent hashes (builder style).
    #[must_use]
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    /// Canonical JSON form of this event.
    ///
    /// # Errors
    /// Only if the body contains values serde cannot represent.
    pub fn canonical_json(&self) -> PolarisResult<String> {
        let value = serde_json::to_value(self)
            .map_err(|e| PolarisError::internal(format!("event serialization failed: {e}")))?;
        Ok(canonical_json(&value))
    }

    /// Hex SHA-256 of [`Event::canonical_json`].
    ///
    /// # Errors
    /// Only if the body contains values serde cannot represent.
    pub fn canonical_hash(&self) -> PolarisResult<String> {
        Ok(sha256_hex(self.canonical_json()?.as_bytes()))
    }
}

/// Serializes `value` with recursively sorted object keys and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex SHA-256 of the canonical form of an arbitrary JSON value.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Where an event was anchored on the external ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorInfo {
    pub block_num: u64,
    pub block_id: String,
    pub trx_id: String,
    pub action_ordinal: u32,
    /// Block timestamp, unix seconds.
    pub timestamp: u64,
    pub source: String,
    pub contract_account: String,
    pub action_name: String,
}

/// How the stored event's authenticity was established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Verification {
    /// Trust derives from inclusion in the ledger; no detached signature check.
    ExternallyVerified {
        anchor: AnchorInfo,
    },
}

/// An event as held by the durable event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Authoritative hash the event is stored under.
    pub hash: String,
    pub event: Event,
    pub verification: Verification,
    pub stored_at: DateTime<Utc>,
}
