//! Per-client rate limiting and structural input validation
//!
//! Both run before any cryptographic work so hostile or misconfigured
//! clients are shed cheaply: an oversized body or an exhausted token bucket
//! rejects the whole request without touching a single key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::KasError;
use crate::protocol::RewrapRequest;

/// Structural bounds applied to every request
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub max_body_bytes: usize,
    pub max_entries: usize,
    pub max_kaos_per_entry: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_entries: 16,
            max_kaos_per_entry: 64,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by client identity
///
/// Shared mutable state, mutated only under the internal lock; consulted
/// before any cryptographic work is performed.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for a client, or reject with `RateLimited`
    pub fn check(&self, client_id: &str) -> Result<(), KasError> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let bucket = buckets.entry(client_id.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(KasError::RateLimited(client_id.to_string()))
        }
    }

    /// Drop idle buckets; call periodically from a background task
    pub fn purge_idle(&self, idle_secs: u64) {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill).as_secs() < idle_secs);
    }
}

/// Validate request structure and size before any crypto work
pub fn validate_request(
    request: &RewrapRequest,
    limits: &RequestLimits,
    body_bytes: usize,
) -> Result<(), KasError> {
    if body_bytes > limits.max_body_bytes {
        return Err(KasError::Validation(format!(
            "request body {} bytes exceeds limit {}",
            body_bytes, limits.max_body_bytes
        )));
    }
    if request.client_public_key.trim().is_empty() {
        return Err(KasError::Validation(
            "clientPublicKey must not be empty".to_string(),
        ));
    }
    if request.requests.is_empty() {
        return Err(KasError::Validation(
            "request carries no rewrap entries".to_string(),
        ));
    }
    if request.requests.len() > limits.max_entries {
        return Err(KasError::Validation(format!(
            "{} entries exceeds limit {}",
            request.requests.len(),
            limits.max_entries
        )));
    }

    for entry in &request.requests {
        entry.policy.validate()?;
        if entry.key_access_objects.is_empty() {
            return Err(KasError::Validation(format!(
                "policy '{}' carries no key access objects",
                entry.policy.uuid
            )));
        }
        if entry.key_access_objects.len() > limits.max_kaos_per_entry {
            return Err(KasError::Validation(format!(
                "{} key access objects exceeds limit {}",
                entry.key_access_objects.len(),
                limits.max_kaos_per_entry
            )));
        }
        for kao in &entry.key_access_objects {
            if kao.id.trim().is_empty() {
                return Err(KasError::Validation(
                    "key access object id must not be empty".to_string(),
                ));
            }
            if kao.wrapped_key_share.is_empty() {
                return Err(KasError::Validation(format!(
                    "KAO '{}' carries no wrapped key share",
                    kao.id
                )));
            }
            if kao.kas_identifier.trim().is_empty() {
                return Err(KasError::Validation(format!(
                    "KAO '{}' missing kasIdentifier",
                    kao.id
                )));
            }
        }
    }
    Ok(())
}
