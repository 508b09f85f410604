//! Claims: the atomic, provenance-tagged unit of data about an entity.
//!
//! A claim is attached to exactly one entity at a time. Merges re-point it and
//! stamp where it came from; nothing ever deletes or copies a claim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

/// Stable claim identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(Uuid);

impl ClaimId {
    /// Creates a new random claim ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic claim ID, so replays of one event mint the same claims.
    #[must_use]
    pub fn from_seed(seed: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()))
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Confidence in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Full confidence.
    pub const CERTAIN: Self = Self(1.0);

    /// Validates and wraps a confidence value.
    ///
    /// # Errors
    /// `ConfidenceOutOfRange` for NaN or values outside `[0.0, 1.0]`.
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::ConfidenceOutOfRange { value })
        }
    }

    /// The raw value.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::CERTAIN
    }
}

impl TryFrom<f64> for Confidence {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

/// One assertion about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,

    /// The entity this claim is currently attached to.
    pub entity_id: String,

    /// The entity the claim was first asserted about. Never changes.
    pub origin_entity_id: String,

    pub property: String,
    pub value: Value,
    pub confidence: Confidence,

    /// Account that submitted the claim.
    pub submitter: String,

    /// Hash of the event that carried the claim.
    pub event_hash: String,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ClaimId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_from: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_by: Option<String>,
}

impl Claim {
    /// Starts building a claim.
    #[must_use]
    pub fn builder() -> ClaimBuilder {
        ClaimBuilder::default()
    }

    /// Re-points this claim at `survivor`, stamping the move.
    pub fn move_to(&mut self, survivor: &str, merged_by: &str, at: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.entity_id, survivor.to_string());
        self.merged_from = Some(previous);
        self.merged_at = Some(at);
        self.merged_by = Some(merged_by.to_string());
    }

    /// Returns true if this claim has been moved by a merge.
    #[must_use]
    pub fn was_merged(&self) -> bool {
        self.merged_from.is_some()
    }
}

/// Builder for [`Claim`].
#[derive(Debug, Default)]
pub struct ClaimBuilder {
    id: Option<ClaimId>,
    entity_id: Option<String>,
    property: Option<String>,
    value: Option<Value>,
    confidence: Option<Confidence>,
    submitter: Option<String>,
    event_hash: Option<String>,
    supersedes: Option<ClaimId>,
}

impl ClaimBuilder {
    #[must_use]
    pub fn id(mut self, id: ClaimId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    #[must_use]
    pub fn event_hash(mut self, event_hash: impl Into<String>) -> Self {
        self.event_hash = Some(event_hash.into());
        self
    }

    #[must_use]
    pub fn supersedes(mut self, previous: Option<ClaimId>) -> Self {
        self.supersedes = previous;
        self
    }

    /// Builds the claim.
    ///
    /// # Errors
    /// `MissingField` when entity, property, or value is absent or empty.
    pub fn build(self) -> Result<Claim, ValidationError> {
        let entity_id = self
            .entity_id
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingField {
                field: "entity_id".to_string(),
            })?;
        let property = self
            .property
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingField {
                field: "property".to_string(),
            })?;
        let value = self.value.ok_or_else(|| ValidationError::MissingField {
            field: "value".to_string(),
        })?;

        Ok(Claim {
            id: self.id.unwrap_or_default(),
            origin_entity_id: entity_id.clone(),
            entity_id,
            property,
            value,
            confidence: self.confidence.unwrap_or_default(),
            submitter: self.submitter.unwrap_or_default(),
            event_hash: self.event_hash.unwrap_or_default(),
            created_at: Utc::now(),
            supersedes: self.supersedes,
            merged_from: None,
            merged_at: None,
            merged_by: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bounds() {
        assert!(Confidence::new(0.0).is_ok());
        assert!(Confidence::new(1.0).is_ok());
        assert!(Confidence::new(1.01).is_err());
        assert!(Confidence::new(-0.1).is_err());
        assert!(Confidence::new(f64::NAN).is_err());
    }

    #[test]
    fn test_confidence_deserialize_validates() {
        assert!(serde_json::from_str::<Confidence>("0.5").is_ok());
        assert!(serde_json::from_str::<Confidence>("2.0").is_err());
    }

    #[test]
    fn test_builder_requires_fields() {
        let err = Claim::builder().property("name").value("x").build().unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field } if field == "entity_id"));

        let err = Claim::builder().entity("e").value("x").build().unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field } if field == "property"));
    }

    #[test]
    fn test_move_to_stamps_provenance() {
        let mut claim = Claim::builder()
            .entity("polaris:group:a")
            .property("name")
            .value("The Band")
            .submitter("alice")
            .build()
            .unwrap();
        let at = Utc::now();
        claim.move_to("polaris:group:b", "bob", at);

        assert_eq!(claim.entity_id, "polaris:group:b");
        assert_eq!(claim.origin_entity_id, "polaris:group:a");
        assert_eq!(claim.merged_from.as_deref(), Some("polaris:group:a"));
        assert_eq!(claim.merged_by.as_deref(), Some("bob"));
        assert_eq!(claim.merged_at, Some(at));
        assert!(claim.was_merged());
    }

    #[test]
    fn test_claim_id_from_seed_is_stable() {
        assert_eq!(ClaimId::from_seed("e:1"), ClaimId::from_seed("e:1"));
    }
}
