//! Policy decision point client; fail closed, always
//!
//! Builds the attribute bundle for a rewrap decision and asks the external
//! decision point. There is no default-allow path anywhere in this module:
//! transport errors, timeouts, unparseable responses, and unknown verdict
//! strings all collapse to [`Verdict::Deny`]. One bounded retry is attempted
//! for transient transport failures only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cache::DecisionCache;
use crate::error::KasError;
use crate::policy::Policy;
use crate::token::Subject;

/// The action this service ever asks about
pub const ACTION_REWRAP: &str = "rewrap";

/// Outcome of a policy decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { reason: String },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Verdict::Deny {
            reason: reason.into(),
        }
    }
}

/// Attribute bundle sent to the decision point
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub subject: Subject,
    pub resource: serde_json::Value,
    pub action: String,
}

impl DecisionRequest {
    pub fn rewrap(subject: &Subject, policy: &Policy) -> Self {
        Self {
            subject: subject.clone(),
            resource: policy.resource_attributes(),
            action: ACTION_REWRAP.to_string(),
        }
    }
}

/// External decision point seam
///
/// `evaluate` returns `Err` for transport-level failures; mapping those to
/// deny happens in [`DecisionClient`] so the fail-closed rule lives in
/// exactly one place.
#[async_trait]
pub trait DecisionPoint: Send + Sync {
    async fn evaluate(&self, request: &DecisionRequest) -> Result<Verdict, KasError>;
}

#[derive(Debug, Deserialize)]
struct DecisionWireResponse {
    verdict: String,
    #[serde(default)]
    reason: Option<String>,
}

/// HTTP decision point speaking `{subject, resource, action}` → `{verdict, reason}`
pub struct HttpDecisionPoint {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDecisionPoint {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DecisionPoint for HttpDecisionPoint {
    async fn evaluate(&self, request: &DecisionRequest) -> Result<Verdict, KasError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KasError::Timeout("decision point call")
                } else {
                    KasError::AuthorizationDenied(format!("decision point unreachable: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(KasError::AuthorizationDenied(format!(
                "decision point returned HTTP {}",
                response.status()
            )));
        }

        let wire: DecisionWireResponse = response
            .json()
            .await
            .map_err(|e| KasError::AuthorizationDenied(format!("unparseable verdict: {e}")))?;

        // Only a literal affirmative counts; anything else denies
        match wire.verdict.as_str() {
            "allow" => Ok(Verdict::Allow),
            "deny" => Ok(Verdict::deny(
                wire.reason.unwrap_or_else(|| "denied by policy".to_string()),
            )),
            other => Ok(Verdict::deny(format!("ambiguous verdict '{other}'"))),
        }
    }
}

/// Caching, fail-closed front of the decision point
pub struct DecisionClient {
    point: Arc<dyn DecisionPoint>,
    cache: DecisionCache,
}

impl DecisionClient {
    pub fn new(point: Arc<dyn DecisionPoint>, cache: DecisionCache) -> Self {
        Self { point, cache }
    }

    /// Authorize one rewrap; never returns allow on any kind of failure
    pub async fn authorize(&self, subject: &Subject, policy: &Policy) -> Verdict {
        // Embargo window is a cheap local pre-filter in front of the PDP
        if !policy.is_valid_at(Utc::now()) {
            return Verdict::deny("policy outside its embargo window");
        }

        let key = DecisionCache::key(
            &subject.id,
            &policy.uuid,
            ACTION_REWRAP,
            policy.classification,
        );
        if let Some(verdict) = self.cache.get(&key).await {
            metrics::counter!("kas_decision_cache_hits_total", 1);
            return verdict;
        }
        metrics::counter!("kas_decision_cache_misses_total", 1);

        let request = DecisionRequest::rewrap(subject, policy);
        let verdict = match self.point.evaluate(&request).await {
            Ok(verdict) => verdict,
            Err(first) if first.is_retryable() => match self.point.evaluate(&request).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    tracing::warn!(error = %err, subject = %subject.id, policy = %policy.uuid,
                        "decision point failed after retry, denying");
                    return Verdict::deny("decision point unavailable");
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, subject = %subject.id, policy = %policy.uuid,
                    "decision point failed, denying");
                return Verdict::deny("decision point unavailable");
            }
        };

        self.cache
            .insert(key, &subject.id, policy.classification, verdict.clone())
            .await;
        verdict
    }

    /// Logout signal: drop cached verdicts for a subject
    pub async fn on_logout(&self, subject_id: &str) {
        self.cache.invalidate_subject(subject_id).await;
    }

    /// Policy-update signal: drop every cached verdict
    pub async fn on_policy_update(&self) {
        self.cache.clear().await;
    }

    /// Evict expired verdicts; driven by a periodic maintenance task
    pub async fn purge_expired(&self) {
        self.cache.purge_expired().await;
    }
}
