//! Append-only audit trail of every rewrap attempt
//!
//! One event per decision (allow or deny, success or failure) with enough
//! detail to reconstruct the reasoning. Events flow through an unbounded
//! channel to a background sink task: audit is a best-effort side effect and
//! never blocks or fails a response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Allow/deny outcome as recorded for compliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditVerdict {
    Allow,
    Deny,
}

/// Immutable audit record; written once, never updated or deleted here
///
/// Retention and rotation are the sink's concern, not this service's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the originating HTTP request
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    #[serde(rename = "subjectId")]
    pub subject_id: String,
    /// Policy uuid of the resource the decision concerned
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    /// Key access object this event concerns, when scoped to one
    #[serde(rename = "kaoId", skip_serializing_if = "Option::is_none")]
    pub kao_id: Option<String>,
    #[serde(rename = "kasIdentifier")]
    pub kas_identifier: String,
    pub verdict: AuditVerdict,
    #[serde(rename = "reasonCode")]
    pub reason_code: String,
    #[serde(rename = "latencyMs")]
    pub latency_ms: u64,
}

impl AuditEvent {
    /// Reason code recorded for successful rewraps
    pub const REASON_OK: &'static str = "ok";

    pub fn allow(
        correlation_id: &str,
        subject_id: &str,
        resource_id: &str,
        kao_id: Option<&str>,
        kas_identifier: &str,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            subject_id: subject_id.to_string(),
            resource_id: resource_id.to_string(),
            kao_id: kao_id.map(String::from),
            kas_identifier: kas_identifier.to_string(),
            verdict: AuditVerdict::Allow,
            reason_code: Self::REASON_OK.to_string(),
            latency_ms,
        }
    }

    pub fn deny(
        correlation_id: &str,
        subject_id: &str,
        resource_id: &str,
        kao_id: Option<&str>,
        kas_identifier: &str,
        kind: ErrorKind,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            subject_id: subject_id.to_string(),
            resource_id: resource_id.to_string(),
            kao_id: kao_id.map(String::from),
            kas_identifier: kas_identifier.to_string(),
            verdict: AuditVerdict::Deny,
            reason_code: kind.as_str().to_string(),
            latency_ms,
        }
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Sink that emits events as structured tracing records
///
/// Target `kas::audit` lets deployments route the audit stream to a
/// dedicated appender without touching application logs.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            target: "kas::audit",
            event_id = %event.id,
            correlation_id = %event.correlation_id,
            subject_id = %event.subject_id,
            resource_id = %event.resource_id,
            kao_id = event.kao_id.as_deref().unwrap_or("-"),
            kas_identifier = %event.kas_identifier,
            verdict = ?event.verdict,
            reason_code = %event.reason_code,
            latency_ms = event.latency_ms,
            "rewrap audit event"
        );
    }
}

/// In-memory sink for tests and local inspection
#[derive(Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Hands events to the sink without ever blocking the request path
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditLogger {
    /// Spawn the drain task; must be called within a tokio runtime
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.record(&event);
            }
        });
        Self { tx }
    }

    /// Record an event, best effort
    pub fn record(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            // Audit failures never block the response
            tracing::warn!("audit sink channel closed, dropping event");
        }
    }
}
