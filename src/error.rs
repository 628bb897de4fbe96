//! Unified error type for the Key Access Service
//!
//! Every failure on the rewrap path maps to one coarse [`ErrorKind`], which is
//! the only error detail a client ever sees. Request-level errors reject the
//! whole call; everything else is scoped to a single key access object (or a
//! single share within a split) so that multi-object requests degrade
//! gracefully instead of failing wholesale.

use thiserror::Error;

/// Coarse, wire-safe error categories
///
/// These are the `errorKind` values carried in per-object results. Detailed
/// diagnostics (peer identities, KMS internals, stack traces) go only to the
/// audit and tracing sinks, never to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or expired token, or proof-of-possession failure
    Authentication,
    /// Malformed or oversized input
    Validation,
    /// Policy binding hash mismatch (tamper evidence)
    PolicyBinding,
    /// Encrypted metadata failed to decrypt or contradicts the outer policy
    Metadata,
    /// Decision point said no, or could not be reached (fail-closed)
    AuthorizationDenied,
    /// Peer unreachable, circuit open, or peer protocol failure
    Federation,
    /// Key management backend failure
    KeyManagement,
    /// A request-scoped deadline expired
    Timeout,
}

impl ErrorKind {
    /// Wire representation used in the `errorKind` response field
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::PolicyBinding => "PolicyBindingError",
            ErrorKind::Metadata => "MetadataError",
            ErrorKind::AuthorizationDenied => "AuthorizationDenied",
            ErrorKind::Federation => "FederationError",
            ErrorKind::KeyManagement => "KeyManagementError",
            ErrorKind::Timeout => "TimeoutError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all KAS operations
#[derive(Debug, Error)]
pub enum KasError {
    /// Token or proof-of-possession verification failed; rejects the call
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed or oversized request; rejected before any crypto work
    #[error("invalid request: {0}")]
    Validation(String),

    /// Per-client rate limit exceeded; rejected before any crypto work
    #[error("rate limit exceeded for client '{0}'")]
    RateLimited(String),

    /// Recomputed policy binding does not match the stored binding
    #[error("policy binding mismatch for key access object '{kao_id}'")]
    PolicyBinding { kao_id: String },

    /// Encrypted metadata could not be decrypted or escalates the policy
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Non-affirmative verdict, or the decision point was unreachable
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Peer call failed or its circuit breaker is open
    #[error("federation error for peer '{peer}': {reason}")]
    Federation { peer: String, reason: String },

    /// The key management backend refused or failed the operation
    #[error("key management error: {0}")]
    KeyManagement(String),

    /// A deadline expired while waiting on the named downstream call
    #[error("deadline exceeded during {0}")]
    Timeout(&'static str),
}

impl KasError {
    /// The wire-safe category for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            KasError::Authentication(_) => ErrorKind::Authentication,
            KasError::Validation(_) | KasError::RateLimited(_) => ErrorKind::Validation,
            KasError::PolicyBinding { .. } => ErrorKind::PolicyBinding,
            KasError::Metadata(_) => ErrorKind::Metadata,
            KasError::AuthorizationDenied(_) => ErrorKind::AuthorizationDenied,
            KasError::Federation { .. } => ErrorKind::Federation,
            KasError::KeyManagement(_) => ErrorKind::KeyManagement,
            KasError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// True if this error rejects the whole request rather than one object
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            KasError::Authentication(_) | KasError::Validation(_) | KasError::RateLimited(_)
        )
    }

    /// True if a bounded retry may succeed
    ///
    /// Binding mismatches and authentication failures are never transient and
    /// must never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KasError::Timeout(_) | KasError::Federation { .. })
    }

    /// Sanitized message suitable for the per-object `reason` field
    ///
    /// Federation and key-management failures are deliberately flattened so
    /// clients learn nothing about peer topology or KMS internals.
    pub fn client_reason(&self) -> String {
        match self {
            KasError::Federation { .. } => "peer key service unavailable".to_string(),
            KasError::KeyManagement(_) => "key operation failed".to_string(),
            KasError::Timeout(stage) => format!("deadline exceeded during {stage}"),
            other => other.to_string(),
        }
    }
}

impl From<base64::DecodeError> for KasError {
    fn from(e: base64::DecodeError) -> Self {
        KasError::Validation(format!("invalid base64: {e}"))
    }
}

impl From<serde_json::Error> for KasError {
    fn from(e: serde_json::Error) -> Self {
        KasError::Validation(format!("invalid JSON: {e}"))
    }
}
