//! Graph data model.
//!
//! Nodes are either canonical entities or aliases; edges carry a relationship
//! type from a closed set. Free-form label strings never reach a backend: every
//! node kind and relationship type is a tagged variant validated at the edge of
//! the system.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::identity::{EntityType, ExternalSource};

/// Property bag attached to nodes and edges.
pub type Properties = Map<String, Value>;

/// Lifecycle status of a canonical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    #[default]
    Active,
    Merged,
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Merged => write!(f, "MERGED"),
        }
    }
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "label", content = "entity_type", rename_all = "snake_case")]
pub enum NodeKind {
    /// A canonical entity of a fixed type.
    Entity(EntityType),
    /// A provisional or external pointer. Never data-bearing.
    Alias,
}

impl NodeKind {
    /// The entity type, if this is an entity node.
    #[must_use]
    pub const fn entity_type(self) -> Option<EntityType> {
        match self {
            Self::Entity(t) => Some(t),
            Self::Alias => None,
        }
    }
}

/// Post-merge record carried by an absorbed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub merged_into: String,
    pub merged_at: DateTime<Utc>,
    pub merged_by: String,
    pub merge_event_hash: String,
    #[serde(default)]
    pub merge_evidence: String,
}

/// A graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Immutable identifier.
    pub id: String,

    /// Immutable kind.
    pub kind: NodeKind,

    #[serde(default)]
    pub status: EntityStatus,

    #[serde(default)]
    pub properties: Properties,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Number of entities merged into this one.
    #[serde(default)]
    pub absorbed_count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_merged_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Tombstone>,
}

impl Node {
    /// Creates an active entity node.
    #[must_use]
    pub fn entity(id: impl Into<String>, entity_type: EntityType) -> Self {
        Self::with_kind(id, NodeKind::Entity(entity_type))
    }

    /// Creates an alias node.
    #[must_use]
    pub fn alias(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Alias)
    }

    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: EntityStatus::Active,
            properties: Properties::new(),
            created_at: now,
            updated_at: now,
            absorbed_count: 0,
            last_merged_at: None,
            tombstone: None,
        }
    }

    /// Sets the property bag (builder style).
    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// The entity type, if this is an entity node.
    #[must_use]
    pub const fn entity_type(&self) -> Option<EntityType> {
        self.kind.entity_type()
    }

    /// Returns true if this node has been merged away.
    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        self.status == EntityStatus::Merged
    }

    /// Returns true for alias nodes.
    #[must_use]
    pub const fn is_alias(&self) -> bool {
        matches!(self.kind, NodeKind::Alias)
    }

    /// Updates the `updated_at` timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Stable edge identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(Uuid);

impl EdgeId {
    /// Creates a new random edge ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic edge ID from a seed.
    #[must_use]
    pub fn from_seed(seed: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()))
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of relationship types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelType {
    /// group -> track
    PerformedOn,
    /// person -> track
    GuestOn,
    /// person -> group
    MemberOf,
    /// person -> song
    Wrote,
    /// track -> song
    RecordingOf,
    /// track -> release
    InRelease,
    /// release -> label
    ReleasedBy,
    /// release -> master
    InMaster,
    /// alias -> entity
    AliasOf,
}

impl RelType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerformedOn => "PERFORMED_ON",
            Self::GuestOn => "GUEST_ON",
            Self::MemberOf => "MEMBER_OF",
            Self::Wrote => "WROTE",
            Self::RecordingOf => "RECORDING_OF",
            Self::InRelease => "IN_RELEASE",
            Self::ReleasedBy => "RELEASED_BY",
            Self::InMaster => "IN_MASTER",
            Self::AliasOf => "ALIAS_OF",
        }
    }

    /// Endpoint types this relationship connects, `None` meaning "alias".
    #[must_use]
    pub const fn endpoints(self) -> (Option<EntityType>, Option<EntityType>) {
        use EntityType::{Group, Label, Master, Person, Release, Song, Track};
        match self {
            Self::PerformedOn => (Some(Group), Some(Track)),
            Self::GuestOn => (Some(Person), Some(Track)),
            Self::MemberOf => (Some(Person), Some(Group)),
            Self::Wrote => (Some(Person), Some(Song)),
            Self::RecordingOf => (Some(Track), Some(Song)),
            Self::InRelease => (Some(Track), Some(Release)),
            Self::ReleasedBy => (Some(Release), Some(Label)),
            Self::InMaster => (Some(Release), Some(Master)),
            Self::AliasOf => (None, None),
        }
    }
}

impl fmt::Display for RelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, typed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub rel: RelType,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// Creates an edge with a random id.
    #[must_use]
    pub fn new(rel: RelType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: EdgeId::new(),
            rel,
            from: from.into(),
            to: to.into(),
            properties: Properties::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the edge id (builder style).
    #[must_use]
    pub fn with_id(mut self, id: EdgeId) -> Self {
        self.id = id;
        self
    }

    /// Adds a property (builder style).
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns true if `node_id` is either endpoint.
    #[must_use]
    pub fn touches(&self, node_id: &str) -> bool {
        self.from == node_id || self.to == node_id
    }

    /// Returns true if both endpoints are the same node.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }

    /// Returns the node id at the given endpoint.
    #[must_use]
    pub fn endpoint(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::From => &self.from,
            Endpoint::To => &self.to,
        }
    }

    /// Replaces the node id at the given endpoint.
    pub fn set_endpoint(&mut self, endpoint: Endpoint, node_id: impl Into<String>) {
        match endpoint {
            Endpoint::From => self.from = node_id.into(),
            Endpoint::To => self.to = node_id.into(),
        }
    }
}

/// Edge enumeration direction relative to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
    Both,
}

impl Direction {
    /// Returns true if `edge` is incident to `node_id` in this direction.
    #[must_use]
    pub fn matches(self, edge: &Edge, node_id: &str) -> bool {
        match self {
            Self::Outbound => edge.from == node_id,
            Self::Inbound => edge.to == node_id,
            Self::Both => edge.touches(node_id),
        }
    }
}

/// Which end of an edge to retarget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    From,
    To,
}

/// Kind of alias edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasKind {
    Provisional,
    External,
}

impl AliasKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisional => "provisional",
            Self::External => "external",
        }
    }
}

impl fmt::Display for AliasKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of an external identity mapping: `source:external_type:external_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingKey(String);

impl MappingKey {
    /// Builds a key, validating every segment.
    ///
    /// # Errors
    /// `MissingField` when any segment is empty.
    pub fn new(
        source: ExternalSource,
        external_type: &str,
        external_id: &str,
    ) -> Result<Self, ValidationError> {
        if external_type.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "external_type".to_string(),
            });
        }
        if external_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "external_id".to_string(),
            });
        }
        Ok(Self(format!("{source}:{}:{}", external_type.trim(), external_id.trim())))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External catalog id -> canonical id. Last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMapping {
    pub key: MappingKey,
    pub canonical_id: String,
    pub confidence: f64,
    pub submitter: String,
    #[serde(default)]
    pub evidence: String,
    pub updated_at: DateTime<Utc>,
}
