//! Federation routing to peer KAS nodes, with per-peer failure isolation
//!
//! Key access objects whose `kasIdentifier` names another node are forwarded
//! as reduced sub-requests. Each peer has an independent circuit breaker:
//! closed → (N consecutive failures) → open → (cooldown) → half-open with
//! exactly one probe → closed on success, open again on failure. All breaker
//! transitions happen under a per-peer lock so concurrent calls cannot race
//! the state machine. An open circuit fails fast with no network attempt,
//! and a peer failure only ever fails the shares that depended on that peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KasError;
use crate::kms::{ClientKeypair, KeyType};
use crate::policy::Policy;
use crate::protocol::{KeyAccessObject, PeerRewrapRequest, PeerRewrapResponse};
use crate::token::Subject;

/// How much a peer's verdicts are trusted; orders `any-of` candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Low,
    Medium,
    High,
}

/// A federated peer KAS node, loaded from the peer registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationPeer {
    #[serde(rename = "kasIdentifier")]
    pub kas_identifier: String,
    pub endpoint: String,
    #[serde(rename = "trustLevel")]
    pub trust_level: TrustLevel,
    /// SHA-256 fingerprint (hex) of the peer's TLS certificate
    #[serde(rename = "certificateFingerprint")]
    pub certificate_fingerprint: String,
}

impl FederationPeer {
    /// A peer is callable only with a well-formed certificate pin
    pub fn validate(&self) -> Result<(), KasError> {
        let decoded = hex::decode(&self.certificate_fingerprint)
            .map_err(|_| KasError::Validation(format!(
                "peer '{}': certificate fingerprint is not hex",
                self.kas_identifier
            )))?;
        if decoded.len() != 32 {
            return Err(KasError::Validation(format!(
                "peer '{}': certificate fingerprint must be 32 bytes, got {}",
                self.kas_identifier,
                decoded.len()
            )));
        }
        if self.endpoint.trim().is_empty() || self.kas_identifier.trim().is_empty() {
            return Err(KasError::Validation(
                "peer endpoint and identifier must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing one probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker position, observable for tests and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-peer circuit breaker; all transitions under one lock
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask permission to place a call
    ///
    /// Open circuits fail fast until the cooldown elapses, then admit exactly
    /// one probe; further callers are refused until the probe resolves.
    pub fn try_call(&self) -> Result<(), ()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        let was_probe = inner.state == BreakerState::HalfOpen;
        inner.probe_in_flight = false;
        if was_probe || inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }
}

/// Transport seam for peer sub-requests
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn rewrap(
        &self,
        peer: &FederationPeer,
        request: &PeerRewrapRequest,
    ) -> Result<PeerRewrapResponse, KasError>;
}

/// HTTPS transport posting to the peer's federation endpoint
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new() -> Result<Self, KasError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| KasError::Federation {
                peer: "-".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn rewrap(
        &self,
        peer: &FederationPeer,
        request: &PeerRewrapRequest,
    ) -> Result<PeerRewrapResponse, KasError> {
        let url = format!("{}/v2/rewrap/peer", peer.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| KasError::Federation {
                peer: peer.kas_identifier.clone(),
                reason: format!("request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(KasError::Federation {
                peer: peer.kas_identifier.clone(),
                reason: format!("peer returned HTTP {}", response.status()),
            });
        }

        response.json().await.map_err(|e| KasError::Federation {
            peer: peer.kas_identifier.clone(),
            reason: format!("unparseable peer response: {e}"),
        })
    }
}

struct PeerHandle {
    peer: FederationPeer,
    /// Registry position, the final tie-break for candidate ordering
    order: usize,
    breaker: Arc<CircuitBreaker>,
}

/// Routes shares held by other nodes, owning all per-peer breaker state
///
/// The breaker map is the only place federation state lives; nothing outside
/// this struct can mutate it.
pub struct FederationRouter {
    local_kas: String,
    breaker_config: BreakerConfig,
    call_timeout: Duration,
    transport: Arc<dyn PeerTransport>,
    peers: RwLock<HashMap<String, Arc<PeerHandle>>>,
}

impl FederationRouter {
    pub fn new(
        local_kas: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        breaker_config: BreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            local_kas: local_kas.into(),
            breaker_config,
            call_timeout,
            transport,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Load or refresh the peer registry
    ///
    /// Peers with invalid certificate pins are skipped. Breaker state for
    /// identifiers that survive the refresh is preserved so a registry reload
    /// does not reset failure isolation.
    pub fn load_peers(&self, peers: Vec<FederationPeer>) {
        let mut map = self
            .peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::take(&mut *map);

        for (order, peer) in peers.into_iter().enumerate() {
            if let Err(err) = peer.validate() {
                tracing::warn!(peer = %peer.kas_identifier, error = %err,
                    "skipping peer with invalid registration");
                continue;
            }
            // A refresh that keeps a peer at the same endpoint keeps its
            // breaker state; a relocated peer starts closed.
            let breaker = previous
                .get(&peer.kas_identifier)
                .filter(|existing| existing.peer.endpoint == peer.endpoint)
                .map(|existing| existing.breaker.clone())
                .unwrap_or_else(|| Arc::new(CircuitBreaker::new(self.breaker_config)));
            let handle = Arc::new(PeerHandle {
                peer,
                order,
                breaker,
            });
            map.insert(handle.peer.kas_identifier.clone(), handle);
        }
    }

    pub fn local_kas(&self) -> &str {
        &self.local_kas
    }

    pub fn is_local(&self, kas_identifier: &str) -> bool {
        kas_identifier == self.local_kas
    }

    /// Deterministic candidate ordering for `any-of` resolution
    ///
    /// Local first, then peers by descending trust, then registry order.
    /// Unknown identifiers sort last so their failure is reported after every
    /// real candidate had its chance.
    pub fn sort_key(&self, kas_identifier: &str) -> (u8, u8, usize) {
        if self.is_local(kas_identifier) {
            return (0, 0, 0);
        }
        let peers = self
            .peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match peers.get(kas_identifier) {
            Some(handle) => (
                1,
                TrustLevel::High as u8 - handle.peer.trust_level as u8,
                handle.order,
            ),
            None => (2, 0, usize::MAX),
        }
    }

    /// Breaker position for a peer, for tests and metrics
    pub fn breaker_state(&self, kas_identifier: &str) -> Option<BreakerState> {
        let peers = self
            .peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.get(kas_identifier).map(|h| h.breaker.state())
    }

    /// Forward one share to its holding peer and recover the plaintext
    ///
    /// The share travels back wrapped to a fresh node session key generated
    /// here, so plaintext key material never crosses the wire.
    pub async fn rewrap_remote(
        &self,
        kas_identifier: &str,
        kao: &KeyAccessObject,
        policy: &Policy,
        subject: &Subject,
    ) -> Result<Vec<u8>, KasError> {
        let handle = {
            let peers = self
                .peers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            peers.get(kas_identifier).cloned()
        };
        let Some(handle) = handle else {
            return Err(KasError::Federation {
                peer: kas_identifier.to_string(),
                reason: "peer not registered".to_string(),
            });
        };

        if handle.breaker.try_call().is_err() {
            metrics::counter!("kas_federation_circuit_rejections_total", 1);
            return Err(KasError::Federation {
                peer: kas_identifier.to_string(),
                reason: "circuit open".to_string(),
            });
        }

        let node_keypair = ClientKeypair::generate(KeyType::Ec)?;
        let request = PeerRewrapRequest {
            key_access_object: kao.clone(),
            policy: policy.clone(),
            subject: subject.clone(),
            node_public_key: node_keypair.public_key_pem().to_string(),
            origin_kas: self.local_kas.clone(),
        };

        let call = self.transport.rewrap(&handle.peer, &request);
        let response = match tokio::time::timeout(self.call_timeout, call).await {
            Err(_) => {
                handle.breaker.record_failure();
                return Err(KasError::Federation {
                    peer: kas_identifier.to_string(),
                    reason: "peer call timed out".to_string(),
                });
            }
            Ok(Err(err)) => {
                handle.breaker.record_failure();
                tracing::warn!(peer = %kas_identifier, error = %err, "peer rewrap failed");
                return Err(err);
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_permit() {
            // The peer answered; its transport is healthy. Denial is an
            // authorization outcome, not a breaker failure.
            handle.breaker.record_success();
            return Err(KasError::AuthorizationDenied(
                response
                    .error
                    .unwrap_or_else(|| "denied by peer".to_string()),
            ));
        }

        let Some(wrapped_share) = response.wrapped_share else {
            handle.breaker.record_failure();
            return Err(KasError::Federation {
                peer: kas_identifier.to_string(),
                reason: "permit response missing wrapped share".to_string(),
            });
        };

        match node_keypair.unwrap_rewrapped(&wrapped_share, response.session_public_key.as_deref())
        {
            Ok(share) => {
                handle.breaker.record_success();
                Ok(share)
            }
            Err(_) => {
                handle.breaker.record_failure();
                Err(KasError::Federation {
                    peer: kas_identifier.to_string(),
                    reason: "could not unwrap peer share".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PolicyBinding;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn test_breaker_opens_after_exactly_n_failures() {
        let breaker = breaker(3, 60_000);
        for _ in 0..2 {
            assert!(breaker.try_call().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        assert!(breaker.try_call().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_call().is_err());
    }

    #[test]
    fn test_breaker_success_resets_failure_count() {
        let breaker = breaker(3, 60_000);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let breaker = breaker(1, 0);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cooldown of zero has elapsed: one probe is admitted
        assert!(breaker.try_call().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // A second concurrent caller is refused while the probe is out
        assert!(breaker.try_call().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens_and_restarts_cooldown() {
        let breaker = breaker(1, 60_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // Force the cooldown to look elapsed
        breaker.lock().last_failure = Some(Instant::now() - Duration::from_secs(120));

        assert!(breaker.try_call().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // Fresh failure timestamp: the cooldown restarted
        assert!(breaker.try_call().is_err());
    }

    struct CountingTransport {
        calls: AtomicUsize,
        response: fn() -> Result<PeerRewrapResponse, KasError>,
    }

    #[async_trait]
    impl PeerTransport for CountingTransport {
        async fn rewrap(
            &self,
            peer: &FederationPeer,
            _request: &PeerRewrapRequest,
        ) -> Result<PeerRewrapResponse, KasError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.response)().map_err(|_| KasError::Federation {
                peer: peer.kas_identifier.clone(),
                reason: "down".to_string(),
            })
        }
    }

    fn peer(id: &str, trust: TrustLevel) -> FederationPeer {
        FederationPeer {
            kas_identifier: id.to_string(),
            endpoint: format!("https://{id}.example.test"),
            trust_level: trust,
            certificate_fingerprint: "ab".repeat(32),
        }
    }

    fn sample_kao(kas_id: &str) -> KeyAccessObject {
        KeyAccessObject {
            id: "kao-0".to_string(),
            wrapped_key_share: "AAAA".to_string(),
            kas_identifier: kas_id.to_string(),
            policy_binding: PolicyBinding::new("unused"),
            split_id: None,
            mode: None,
            encrypted_metadata: None,
            kid: None,
        }
    }

    fn sample_subject() -> Subject {
        Subject {
            id: "alice".to_string(),
            attributes: Default::default(),
        }
    }

    fn sample_policy() -> Policy {
        Policy::new(
            uuid::Uuid::new_v4().to_string(),
            crate::policy::Classification::Secret,
            vec![],
            vec![],
        )
    }

    fn router_with(transport: Arc<dyn PeerTransport>, threshold: u32) -> FederationRouter {
        let router = FederationRouter::new(
            "kas-local",
            transport,
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            },
            Duration::from_secs(1),
        );
        router.load_peers(vec![
            peer("kas-high", TrustLevel::High),
            peer("kas-low", TrustLevel::Low),
        ]);
        router
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_network() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            response: || {
                Err(KasError::Federation {
                    peer: String::new(),
                    reason: "down".to_string(),
                })
            },
        });
        let router = router_with(transport.clone(), 2);
        let kao = sample_kao("kas-high");
        let policy = sample_policy();
        let subject = sample_subject();

        for _ in 0..2 {
            let err = router
                .rewrap_remote("kas-high", &kao, &policy, &subject)
                .await
                .unwrap_err();
            assert!(matches!(err, KasError::Federation { .. }));
        }
        assert_eq!(router.breaker_state("kas-high"), Some(BreakerState::Open));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        // Circuit open: rejected immediately, no further network attempts
        let err = router
            .rewrap_remote("kas-high", &kao, &policy, &subject)
            .await
            .unwrap_err();
        assert!(matches!(err, KasError::Federation { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_denial_is_authorization_not_breaker_failure() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            response: || Ok(PeerRewrapResponse::fail("insufficient clearance")),
        });
        let router = router_with(transport, 1);
        let err = router
            .rewrap_remote(
                "kas-high",
                &sample_kao("kas-high"),
                &sample_policy(),
                &sample_subject(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KasError::AuthorizationDenied(_)));
        assert_eq!(router.breaker_state("kas-high"), Some(BreakerState::Closed));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_federation_error() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            response: || Ok(PeerRewrapResponse::fail("unused")),
        });
        let router = router_with(transport, 1);
        let err = router
            .rewrap_remote(
                "kas-unknown",
                &sample_kao("kas-unknown"),
                &sample_policy(),
                &sample_subject(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KasError::Federation { .. }));
    }

    #[test]
    fn test_candidate_ordering_local_then_trust_then_registry() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            response: || Ok(PeerRewrapResponse::fail("unused")),
        });
        let router = router_with(transport, 1);

        let mut ids = vec!["kas-low", "kas-unknown", "kas-local", "kas-high"];
        ids.sort_by_key(|id| router.sort_key(id));
        assert_eq!(ids, vec!["kas-local", "kas-high", "kas-low", "kas-unknown"]);
    }

    #[test]
    fn test_invalid_fingerprint_peer_is_not_registered() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            response: || Ok(PeerRewrapResponse::fail("unused")),
        });
        let router = FederationRouter::new(
            "kas-local",
            transport,
            BreakerConfig::default(),
            Duration::from_secs(1),
        );
        let mut bad = peer("kas-bad", TrustLevel::High);
        bad.certificate_fingerprint = "zz".to_string();
        router.load_peers(vec![bad]);
        assert_eq!(router.breaker_state("kas-bad"), None);
    }
}
