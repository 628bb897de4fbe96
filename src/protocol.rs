//! Wire types for the ACP-240 rewrap protocol
//!
//! Request/response bodies for the client-facing rewrap endpoint and the
//! reduced peer-to-peer federation sub-request. All binary fields travel as
//! standard base64; field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::error::KasError;
use crate::policy::Policy;
use crate::split::SplitMode;
use crate::token::Subject;

/// A client rewrap request, scoped to the lifetime of one HTTP call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrapRequest {
    /// The caller's ephemeral public key (PEM), target of the rewrap
    #[serde(rename = "clientPublicKey")]
    pub client_public_key: String,
    pub requests: Vec<RewrapEntry>,
}

/// One policy with the key access objects bound to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrapEntry {
    pub policy: Policy,
    #[serde(rename = "keyAccessObjects")]
    pub key_access_objects: Vec<KeyAccessObject>,
}

/// One share of a (possibly split) data-encryption key
///
/// Owned by the object producer; the KAS only reads and unwraps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAccessObject {
    pub id: String,
    /// The wrapped key share, base64
    #[serde(rename = "wrappedKeyShare")]
    pub wrapped_key_share: String,
    /// Identifier of the KAS node holding the unwrap key for this share
    #[serde(rename = "kasIdentifier")]
    pub kas_identifier: String,
    #[serde(rename = "policyBinding")]
    pub policy_binding: PolicyBinding,
    /// Shares carrying the same splitId recombine into one data key
    #[serde(rename = "splitId", skip_serializing_if = "Option::is_none")]
    pub split_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SplitMode>,
    /// Optional AEAD-sealed metadata blob, base64
    #[serde(rename = "encryptedMetadata", skip_serializing_if = "Option::is_none")]
    pub encrypted_metadata: Option<String>,
    /// Key handle hint for the key management backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Keyed hash binding a policy to a specific key share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

impl PolicyBinding {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            algorithm: Some("HS256".to_string()),
        }
    }
}

/// Aggregated response: one result per processed key access object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrapResponse {
    pub results: Vec<KaoResult>,
    /// Present when the client key is EC: the session key used for wrapping
    #[serde(rename = "sessionPublicKey", skip_serializing_if = "Option::is_none")]
    pub session_public_key: Option<String>,
}

/// Per-object outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KaoStatus {
    Success,
    Failure,
}

/// Result of one key access object within a rewrap request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KaoResult {
    pub id: String,
    pub status: KaoStatus,
    #[serde(rename = "rewrappedKey", skip_serializing_if = "Option::is_none")]
    pub rewrapped_key: Option<String>,
    #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KaoResult {
    /// A successful rewrap carrying the wrapped key material
    pub fn success(id: impl Into<String>, rewrapped_key: String) -> Self {
        Self {
            id: id.into(),
            status: KaoStatus::Success,
            rewrapped_key: Some(rewrapped_key),
            error_kind: None,
            reason: None,
        }
    }

    /// A failure carrying only the coarse kind and a sanitized reason
    pub fn failure(id: impl Into<String>, err: &KasError) -> Self {
        Self {
            id: id.into(),
            status: KaoStatus::Failure,
            rewrapped_key: None,
            error_kind: Some(err.kind().as_str().to_string()),
            reason: Some(err.client_reason()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == KaoStatus::Success
    }
}

/// Federation sub-request: a single KAO plus the originating request context
///
/// Carries the policy and subject so the peer can re-evaluate authorization
/// independently; peers never trust a bare allow from the caller. The share
/// comes back wrapped to `nodePublicKey`, the requesting node's session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRewrapRequest {
    #[serde(rename = "keyAccessObject")]
    pub key_access_object: KeyAccessObject,
    pub policy: Policy,
    pub subject: Subject,
    /// Session public key (PEM) of the requesting KAS node
    #[serde(rename = "nodePublicKey")]
    pub node_public_key: String,
    /// Identifier of the requesting node, for the peer's audit trail
    #[serde(rename = "originKas")]
    pub origin_kas: String,
}

/// Federation sub-response for a single share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRewrapResponse {
    /// "permit" or "fail"
    pub status: String,
    /// The share wrapped to the requesting node's session key, base64
    #[serde(rename = "wrappedShare", skip_serializing_if = "Option::is_none")]
    pub wrapped_share: Option<String>,
    /// Peer's session public key (PEM) used for the wrap
    #[serde(rename = "sessionPublicKey", skip_serializing_if = "Option::is_none")]
    pub session_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerRewrapResponse {
    pub fn permit(wrapped_share: String, session_public_key: Option<String>) -> Self {
        Self {
            status: "permit".to_string(),
            wrapped_share: Some(wrapped_share),
            session_public_key,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: "fail".to_string(),
            wrapped_share: None,
            session_public_key: None,
            error: Some(error.into()),
        }
    }

    pub fn is_permit(&self) -> bool {
        self.status == "permit"
    }
}
