//! Short-TTL cache of authorization verdicts
//!
//! Keyed by a hash of (subject, resource, action); TTL is inversely
//! proportional to the resource's classification so highly sensitive
//! decisions are re-evaluated sooner. Entries expire naturally and can be
//! invalidated explicitly on logout or policy-update signals, so the cache
//! never outlives either signal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::decision::Verdict;
use crate::policy::Classification;

/// Cache key: SHA-256 over the decision inputs
pub type DecisionKey = [u8; 32];

struct Entry {
    verdict: Verdict,
    subject_id: String,
    expires_at: Instant,
}

/// Process-wide verdict cache, mutated only through the decision client
pub struct DecisionCache {
    ttls: HashMap<Classification, Duration>,
    entries: RwLock<HashMap<DecisionKey, Entry>>,
}

impl DecisionCache {
    /// Build a cache from a per-classification TTL table (seconds)
    pub fn new(ttl_secs: &HashMap<Classification, u64>) -> Self {
        let mut ttls = HashMap::new();
        for classification in Classification::all() {
            let secs = ttl_secs
                .get(&classification)
                .copied()
                .unwrap_or_else(|| default_ttl_secs(classification));
            ttls.insert(classification, Duration::from_secs(secs));
        }
        Self {
            ttls,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Compute the cache key for one decision
    pub fn key(
        subject_id: &str,
        policy_uuid: &str,
        action: &str,
        classification: Classification,
    ) -> DecisionKey {
        let mut hasher = Sha256::new();
        hasher.update(subject_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(policy_uuid.as_bytes());
        hasher.update([0u8]);
        hasher.update(action.as_bytes());
        hasher.update([classification.rank()]);
        hasher.finalize().into()
    }

    /// TTL applied to verdicts at this classification
    pub fn ttl_for(&self, classification: Classification) -> Duration {
        // The table is fully populated in new()
        self.ttls
            .get(&classification)
            .copied()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Fetch a live verdict, expiring lazily
    pub async fn get(&self, key: &DecisionKey) -> Option<Verdict> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.verdict.clone())
    }

    /// Store a verdict under the TTL for its classification
    pub async fn insert(
        &self,
        key: DecisionKey,
        subject_id: &str,
        classification: Classification,
        verdict: Verdict,
    ) {
        let ttl = self.ttl_for(classification);
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                verdict,
                subject_id: subject_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every verdict for a subject (logout signal)
    pub async fn invalidate_subject(&self, subject_id: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.subject_id != subject_id);
    }

    /// Drop everything (policy-update signal)
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Evict expired entries; call periodically from a background task
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of live entries, for metrics
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Default TTLs: tens of seconds at the top, minutes at the bottom
fn default_ttl_secs(classification: Classification) -> u64 {
    match classification {
        Classification::TopSecret => 15,
        Classification::Secret => 30,
        Classification::Confidential => 60,
        Classification::Restricted => 120,
        Classification::Unclassified => 300,
    }
}
