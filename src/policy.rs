//! Access-control policy assertions bound to key access objects
//!
//! The KAS treats policy semantics as opaque: it never evaluates who may see
//! what; that is the decision point's job. What it does own is the policy's
//! *shape*: canonical serialization for binding computation, structural
//! validation, the classification hierarchy that drives cache TTLs, and the
//! embargo window pre-check that runs before any decision-point call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::KasError;

/// Classification markings ordered from least to most sensitive
///
/// Variant order matters: `Ord` on this enum is the sensitivity ranking used
/// for cache TTL selection and metadata escalation checks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    #[default]
    Unclassified,
    Restricted,
    Confidential,
    Secret,
    TopSecret,
}

impl Classification {
    /// Numeric rank, higher = more sensitive
    pub fn rank(&self) -> u8 {
        match self {
            Classification::Unclassified => 0,
            Classification::Restricted => 1,
            Classification::Confidential => 2,
            Classification::Secret => 3,
            Classification::TopSecret => 4,
        }
    }

    /// All levels, least sensitive first
    pub fn all() -> [Classification; 5] {
        [
            Classification::Unclassified,
            Classification::Restricted,
            Classification::Confidential,
            Classification::Secret,
            Classification::TopSecret,
        ]
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Unclassified => "UNCLASSIFIED",
            Classification::Restricted => "RESTRICTED",
            Classification::Confidential => "CONFIDENTIAL",
            Classification::Secret => "SECRET",
            Classification::TopSecret => "TOP_SECRET",
        };
        f.write_str(s)
    }
}

/// The access-control assertion bound to a key access object
///
/// Field declaration order is the canonical serialization order; the policy
/// binding HMAC is computed over this exact layout. Empty lists serialize as
/// null so that producers in other languages compute identical bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub uuid: String,
    pub classification: Classification,
    #[serde(
        rename = "releasableTo",
        default,
        serialize_with = "serialize_empty_vec_as_null",
        deserialize_with = "deserialize_null_as_empty_vec"
    )]
    pub releasable_to: Vec<String>,
    #[serde(
        rename = "coiTags",
        default,
        serialize_with = "serialize_empty_vec_as_null",
        deserialize_with = "deserialize_null_as_empty_vec"
    )]
    pub coi_tags: Vec<String>,
    /// Embargo start: the object may not be released before this instant
    #[serde(rename = "validFrom", skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// Embargo end: the object may not be released after this instant
    #[serde(rename = "validTo", skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

/// Serialize empty Vec as null so bindings are stable across producers
fn serialize_empty_vec_as_null<T, S>(vec: &Vec<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: serde::Serialize,
    S: serde::Serializer,
{
    if vec.is_empty() {
        serializer.serialize_none()
    } else {
        vec.serialize(serializer)
    }
}

fn deserialize_null_as_empty_vec<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl Policy {
    /// Create a policy with no embargo window
    pub fn new(
        uuid: impl Into<String>,
        classification: Classification,
        releasable_to: Vec<String>,
        coi_tags: Vec<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            classification,
            releasable_to,
            coi_tags,
            valid_from: None,
            valid_to: None,
        }
    }

    /// Set the embargo window
    #[must_use]
    pub fn with_embargo(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    /// Canonical JSON used for binding computation
    pub fn canonical_json(&self) -> Result<String, KasError> {
        serde_json::to_string(self).map_err(KasError::from)
    }

    /// Parse a policy from its JSON form
    pub fn from_json(json: &str) -> Result<Self, KasError> {
        serde_json::from_str(json).map_err(KasError::from)
    }

    /// Check the embargo window against a point in time
    pub fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
        let after_start = self.valid_from.is_none_or(|from| time >= from);
        let before_end = self.valid_to.is_none_or(|to| time <= to);
        after_start && before_end
    }

    /// Structural validation, run before any cryptographic work
    pub fn validate(&self) -> Result<(), KasError> {
        if uuid::Uuid::parse_str(&self.uuid).is_err() {
            return Err(KasError::Validation(format!(
                "policy uuid '{}' is not a valid UUID",
                self.uuid
            )));
        }
        if let (Some(from), Some(to)) = (self.valid_from, self.valid_to) {
            if from >= to {
                return Err(KasError::Validation(
                    "policy validFrom must precede validTo".to_string(),
                ));
            }
        }
        for entity in &self.releasable_to {
            if entity.trim().is_empty() {
                return Err(KasError::Validation(
                    "policy releasableTo contains an empty entity".to_string(),
                ));
            }
        }
        for tag in &self.coi_tags {
            if tag.trim().is_empty() {
                return Err(KasError::Validation(
                    "policy coiTags contains an empty tag".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resource attribute bundle handed to the decision point
    ///
    /// The KAS forwards these values verbatim; it attaches no interpretation.
    pub fn resource_attributes(&self) -> serde_json::Value {
        json!({
            "policyId": self.uuid,
            "classification": self.classification,
            "releasableTo": self.releasable_to,
            "coiTags": self.coi_tags,
            "validFrom": self.valid_from,
            "validTo": self.valid_to,
        })
    }
}
