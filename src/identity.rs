//! Identifier grammar: classification and minting.
//!
//! Three identifier families exist:
//!
//! - canonical: `polaris:{type}:{uuid}`, one per real-world entity, immutable
//! - external: `{source}:{type}:{id}` for a known third-party catalog
//! - provisional: anything else (conventionally `prov:{type}:{local-id}`)
//!
//! Everything here is pure and stateless. [`classify`] never fails; malformed
//! input comes back with `valid == false` and callers must check.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Prefix of every canonical identifier.
pub const CANONICAL_PREFIX: &str = "polaris";

/// Conventional prefix of provisional identifiers.
pub const PROVISIONAL_PREFIX: &str = "prov";

/// Namespace for deterministic (UUIDv5) mints.
const MINT_NAMESPACE: Uuid = Uuid::from_u128(0x3c5e_8b2a_9d41_4f7e_a0b6_52c1_d8e3_f901);

fn canonical_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^polaris:([a-z]+):([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$")
            .unwrap_or_else(|e| unreachable!("canonical id regex is a literal: {e}"))
    })
}

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.\-]+$")
            .unwrap_or_else(|e| unreachable!("segment regex is a literal: {e}"))
    })
}

/// The closed set of canonical entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityType {
    /// An individual musician, writer, or producer.
    Person,
    /// A band, ensemble, or performing act.
    Group,
    /// A composition.
    Song,
    /// A recording of a composition.
    Track,
    /// A concrete release (album, single, EP).
    Release,
    /// A master grouping of releases.
    Master,
    /// A record label.
    Label,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Person,
        Self::Group,
        Self::Song,
        Self::Track,
        Self::Release,
        Self::Master,
        Self::Label,
    ];

    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Group => "group",
            Self::Song => "song",
            Self::Track => "track",
            Self::Release => "release",
            Self::Master => "master",
            Self::Label => "label",
        }
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| ValidationError::UnknownEntityType {
                value: value.to_string(),
            })
    }
}

impl TryFrom<String> for EntityType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Third-party catalogs whose identifiers are recognized as external references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExternalSource {
    Discogs,
    MusicBrainz,
    Isni,
    Isrc,
    Iswc,
    Spotify,
    Apple,
    Wikidata,
    Bandcamp,
    Youtube,
}

impl ExternalSource {
    /// Every recognized source.
    pub const ALL: [Self; 10] = [
        Self::Discogs,
        Self::MusicBrainz,
        Self::Isni,
        Self::Isrc,
        Self::Iswc,
        Self::Spotify,
        Self::Apple,
        Self::Wikidata,
        Self::Bandcamp,
        Self::Youtube,
    ];

    /// Token used as the first identifier segment.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discogs => "discogs",
            Self::MusicBrainz => "musicbrainz",
            Self::Isni => "isni",
            Self::Isrc => "isrc",
            Self::Iswc => "iswc",
            Self::Spotify => "spotify",
            Self::Apple => "apple",
            Self::Wikidata => "wikidata",
            Self::Bandcamp => "bandcamp",
            Self::Youtube => "youtube",
        }
    }

    /// Looks up a source token (exact, lowercase).
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == token)
    }
}

impl TryFrom<String> for ExternalSource {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_token(value.trim()).ok_or(ValidationError::InvalidIdentifier {
            id: value,
            reason: "unknown external source".to_string(),
        })
    }
}

impl From<ExternalSource> for String {
    fn from(value: ExternalSource) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ExternalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdKind {
    Canonical,
    Provisional,
    External,
}

/// Fields extracted while classifying an identifier.
///
/// Fields are best-effort: an invalid id still reports whatever parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedId {
    Canonical {
        entity_type: Option<EntityType>,
        uuid: Option<Uuid>,
    },
    External {
        source: ExternalSource,
        external_type: String,
        external_id: String,
    },
    Provisional {
        entity_type: Option<EntityType>,
        local_id: String,
    },
}

/// Result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: IdKind,
    pub fields: ParsedId,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Classification {
    fn ok(kind: IdKind, fields: ParsedId) -> Self {
        Self {
            kind,
            fields,
            valid: true,
            reason: None,
        }
    }

    fn invalid(kind: IdKind, fields: ParsedId, reason: impl Into<String>) -> Self {
        Self {
            kind,
            fields,
            valid: false,
            reason: Some(reason.into()),
        }
    }

    /// Entity type carried by a canonical or provisional id, if any.
    #[must_use]
    pub fn entity_type(&self) -> Option<EntityType> {
        match &self.fields {
            ParsedId::Canonical { entity_type, .. } | ParsedId::Provisional { entity_type, .. } => {
                *entity_type
            }
            ParsedId::External { .. } => None,
        }
    }
}

/// Classifies an identifier. Never fails; check `valid`.
#[must_use]
pub fn classify(id: &str) -> Classification {
    let mut parts = id.splitn(3, ':');
    let head = parts.next().unwrap_or_default();

    if head == CANONICAL_PREFIX {
        return classify_canonical(id);
    }

    if let Some(source) = ExternalSource::from_token(head) {
        let external_type = parts.next().unwrap_or_default().to_string();
        let external_id = parts.next().unwrap_or_default().to_string();
        let valid_type = segment_re().is_match(&external_type);
        let valid_id = !external_id.trim().is_empty() && external_id.trim() == external_id;
        let fields = ParsedId::External {
            source,
            external_type,
            external_id,
        };
        return match (valid_type, valid_id) {
            (true, true) => Classification::ok(IdKind::External, fields),
            (false, _) => Classification::invalid(IdKind::External, fields, "missing or malformed external type"),
            (true, false) => Classification::invalid(IdKind::External, fields, "missing external id"),
        };
    }

    if id.trim().is_empty() {
        return Classification::invalid(
            IdKind::Provisional,
            ParsedId::Provisional {
                entity_type: None,
                local_id: String::new(),
            },
            "identifier is empty",
        );
    }

    if head == PROVISIONAL_PREFIX {
        let type_part = parts.next().unwrap_or_default();
        if let Some(local) = parts.next().filter(|l| !l.is_empty()) {
            return Classification::ok(
                IdKind::Provisional,
                ParsedId::Provisional {
                    entity_type: type_part.parse().ok(),
                    local_id: local.to_string(),
                },
            );
        }
    }

    Classification::ok(
        IdKind::Provisional,
        ParsedId::Provisional {
            entity_type: None,
            local_id: id.to_string(),
        },
    )
}

fn classify_canonical(id: &str) -> Classification {
    let Some(caps) = canonical_re().captures(id) else {
        let mut parts = id.splitn(3, ':').skip(1);
        let entity_type = parts.next().and_then(|t| t.parse().ok());
        let uuid = parts.next().and_then(|u| Uuid::parse_str(u).ok());
        return Classification::invalid(
            IdKind::Canonical,
            ParsedId::Canonical { entity_type, uuid },
            "expected polaris:{type}:{lowercase hyphenated uuid}",
        );
    };

    let entity_type = caps[1].parse::<EntityType>().ok();
    let uuid = Uuid::parse_str(&caps[2]).ok();
    let fields = ParsedId::Canonical { entity_type, uuid };
    match (entity_type, uuid) {
        (Some(_), Some(_)) => Classification::ok(IdKind::Canonical, fields),
        (None, _) => Classification::invalid(IdKind::Canonical, fields, "unknown entity type"),
        (_, None) => Classification::invalid(IdKind::Canonical, fields, "malformed uuid"),
    }
}

/// Returns true if `id` is a well-formed canonical identifier.
#[must_use]
pub fn is_canonical(id: &str) -> bool {
    let c = classify(id);
    c.kind == IdKind::Canonical && c.valid
}

/// Mints a fresh canonical id for a type named by string.
///
/// # Errors
/// `UnknownEntityType` if `entity_type` is outside the closed set.
pub fn mint(entity_type: &str) -> Result<CanonicalId, ValidationError> {
    Ok(mint_typed(entity_type.parse()?))
}

/// Mints a fresh, random canonical id.
#[must_use]
pub fn mint_typed(entity_type: EntityType) -> CanonicalId {
    CanonicalId::from_parts(entity_type, Uuid::new_v4())
}

/// Mints a deterministic canonical id: the same type and seed always yield the same id.
#[must_use]
pub fn mint_from_seed(entity_type: EntityType, seed: &str) -> CanonicalId {
    let name = format!("{}:{seed}", entity_type.as_str());
    CanonicalId::from_parts(entity_type, Uuid::new_v5(&MINT_NAMESPACE, name.as_bytes()))
}

/// A validated canonical identifier.
///
/// # Examples
///
/// ```
/// use polaris_core::identity::{mint_typed, CanonicalId, EntityType};
///
/// let id = mint_typed(EntityType::Group);
/// let parsed = CanonicalId::parse(id.as_str()).unwrap();
/// assert_eq!(parsed.entity_type(), EntityType::Group);
/// assert_eq!(parsed.uuid(), id.uuid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalId {
    raw: String,
    entity_type: EntityType,
    uuid: Uuid,
}

impl CanonicalId {
    fn from_parts(entity_type: EntityType, uuid: Uuid) -> Self {
        Self {
            raw: format!("{CANONICAL_PREFIX}:{}:{}", entity_type.as_str(), uuid.hyphenated()),
            entity_type,
            uuid,
        }
    }

    /// Parses and validates a canonical id.
    ///
    /// # Errors
    /// `NotCanonical` for provisional or external ids, `InvalidIdentifier` for malformed canonical ids.
    pub fn parse(id: &str) -> Result<Self, ValidationError> {
        let c = classify(id);
        if c.kind != IdKind::Canonical {
            return Err(ValidationError::NotCanonical { id: id.to_string() });
        }
        match (c.valid, &c.fields) {
            (
                true,
                ParsedId::Canonical {
                    entity_type: Some(entity_type),
                    uuid: Some(uuid),
                },
            ) => Ok(Self {
                raw: id.to_string(),
                entity_type: *entity_type,
                uuid: *uuid,
            }),
            _ => Err(ValidationError::InvalidIdentifier {
                id: id.to_string(),
                reason: c.reason.unwrap_or_else(|| "malformed canonical id".to_string()),
            }),
        }
    }

    /// The entity type encoded in the id.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// The UUID tail of the id.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CanonicalId> for String {
    fn from(value: CanonicalId) -> Self {
        value.raw
    }
}

impl AsRef<str> for CanonicalId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
