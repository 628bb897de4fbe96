//! Service configuration
//!
//! Loaded once at startup from a JSON file with environment overrides for
//! the common deployment knobs. The peer registry is the only section that
//! supports live refresh; everything else is immutable for the process
//! lifetime.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KasError;
use crate::federation::FederationPeer;
use crate::policy::Classification;

/// Top-level KAS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KasConfig {
    /// This node's identifier; KAOs naming it are unwrapped locally
    #[serde(rename = "kasId")]
    pub kas_id: String,
    #[serde(rename = "keyHandles")]
    pub key_handles: KeyHandleConfig,
    pub token: TokenConfig,
    /// Endpoint of the external policy decision point
    #[serde(rename = "decisionEndpoint")]
    pub decision_endpoint: String,
    pub limits: LimitsConfig,
    pub deadlines: DeadlineConfig,
    pub breaker: BreakerSettings,
    /// Verdict cache TTLs in seconds, keyed by classification
    #[serde(rename = "cacheTtlSecs")]
    pub cache_ttl_secs: HashMap<Classification, u64>,
    /// Peer registry; supports live refresh through the federation router
    pub peers: Vec<FederationPeer>,
}

/// Key handles the backend serves, selected by wrapped-share shape when a
/// KAO carries no `kid`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyHandleConfig {
    pub ec: String,
    pub rsa: String,
}

impl Default for KeyHandleConfig {
    fn default() -> Self {
        Self {
            ec: "kas-ec-primary".to_string(),
            rsa: "kas-rsa-primary".to_string(),
        }
    }
}

/// Token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    /// JWKS endpoint; absent means a static key is injected at wiring time
    #[serde(rename = "jwksUrl")]
    pub jwks_url: Option<String>,
    /// Proof-of-possession freshness window, seconds
    #[serde(rename = "freshnessSecs")]
    pub freshness_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "https://idp.dive.example".to_string(),
            audience: "acp-kas".to_string(),
            jwks_url: None,
            freshness_secs: 60,
        }
    }
}

/// Request-shedding thresholds, applied before any cryptographic work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(rename = "maxBodyBytes")]
    pub max_body_bytes: usize,
    #[serde(rename = "maxEntries")]
    pub max_entries: usize,
    #[serde(rename = "maxKaosPerEntry")]
    pub max_kaos_per_entry: usize,
    /// Token-bucket capacity per client
    #[serde(rename = "rateCapacity")]
    pub rate_capacity: u32,
    /// Token-bucket refill rate per client, tokens per second
    #[serde(rename = "rateRefillPerSec")]
    pub rate_refill_per_sec: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_entries: 16,
            max_kaos_per_entry: 64,
            rate_capacity: 20,
            rate_refill_per_sec: 10.0,
        }
    }
}

/// Deadlines per downstream call type, milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    #[serde(rename = "requestMs")]
    pub request_ms: u64,
    #[serde(rename = "decisionMs")]
    pub decision_ms: u64,
    #[serde(rename = "federationMs")]
    pub federation_ms: u64,
    #[serde(rename = "kmsMs")]
    pub kms_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            request_ms: 10_000,
            decision_ms: 2_000,
            federation_ms: 3_000,
            kms_ms: 2_000,
        }
    }
}

impl DeadlineConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn decision(&self) -> Duration {
        Duration::from_millis(self.decision_ms)
    }

    pub fn federation(&self) -> Duration {
        Duration::from_millis(self.federation_ms)
    }

    pub fn kms(&self) -> Duration {
        Duration::from_millis(self.kms_ms)
    }
}

/// Circuit breaker thresholds, shared by every peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    #[serde(rename = "failureThreshold")]
    pub failure_threshold: u32,
    #[serde(rename = "cooldownMs")]
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for KasConfig {
    fn default() -> Self {
        Self {
            kas_id: "kas-local".to_string(),
            key_handles: KeyHandleConfig::default(),
            token: TokenConfig::default(),
            decision_endpoint: "http://localhost:8181/v1/decision".to_string(),
            limits: LimitsConfig::default(),
            deadlines: DeadlineConfig::default(),
            breaker: BreakerSettings::default(),
            cache_ttl_secs: HashMap::new(),
            peers: Vec::new(),
        }
    }
}

impl KasConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KasError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            KasError::Validation(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: KasConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check the configuration before wiring services
    pub fn validate(&self) -> Result<(), KasError> {
        if self.kas_id.trim().is_empty() {
            return Err(KasError::Validation("kasId must not be empty".to_string()));
        }
        if self.token.freshness_secs <= 0 {
            return Err(KasError::Validation(
                "token.freshnessSecs must be positive".to_string(),
            ));
        }
        if self.deadlines.request_ms == 0 {
            return Err(KasError::Validation(
                "deadlines.requestMs must be positive".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(KasError::Validation(
                "breaker.failureThreshold must be positive".to_string(),
            ));
        }
        for peer in &self.peers {
            peer.validate()?;
            if peer.kas_identifier == self.kas_id {
                return Err(KasError::Validation(format!(
                    "peer registry must not contain the local node '{}'",
                    self.kas_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::TrustLevel;

    #[test]
    fn test_defaults_validate() {
        assert!(KasConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: KasConfig = serde_json::from_str(
            r#"{"kasId": "kas-nld-01", "decisionEndpoint": "https://pdp.example/v1/decision"}"#,
        )
        .unwrap();
        assert_eq!(config.kas_id, "kas-nld-01");
        assert_eq!(config.limits.max_entries, 16);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.token.freshness_secs, 60);
    }

    #[test]
    fn test_local_node_in_peer_registry_is_rejected() {
        let mut config = KasConfig::default();
        config.peers.push(FederationPeer {
            kas_identifier: config.kas_id.clone(),
            endpoint: "https://self.example".to_string(),
            trust_level: TrustLevel::High,
            certificate_fingerprint: "ab".repeat(32),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_table_roundtrip() {
        let config: KasConfig = serde_json::from_str(
            r#"{"cacheTtlSecs": {"TOP_SECRET": 5, "UNCLASSIFIED": 600}}"#,
        )
        .unwrap();
        assert_eq!(
            config.cache_ttl_secs.get(&Classification::TopSecret),
            Some(&5)
        );
        assert_eq!(
            config.cache_ttl_secs.get(&Classification::Unclassified),
            Some(&600)
        );
    }

    #[test]
    fn test_zero_thresholds_are_rejected() {
        let mut config = KasConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = KasConfig::default();
        config.deadlines.request_ms = 0;
        assert!(config.validate().is_err());
    }
}
