//! Shared fixtures for the integration suites
//!
//! Builds a fully wired `RewrapService` with in-process seams: a software
//! key backend, a static-key token verifier, a programmable decision point,
//! a mock peer transport, and a memory audit sink. No sockets anywhere.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;

use acp_kas::binding::bind_policy;
use acp_kas::cache::DecisionCache;
use acp_kas::decision::{DecisionPoint, DecisionRequest};
use acp_kas::federation::{BreakerConfig, FederationPeer, PeerTransport};
use acp_kas::kms::{ec_wrap_share, rewrap_to_client, ClientKey, RewrapSession};
use acp_kas::KeyBackend;
use acp_kas::token::{jwk_thumbprint, EcJwk};
use acp_kas::{
    Classification, DecisionClient, FederationRouter, KasConfig, KasError, KeyAccessObject,
    KeyType, MemorySink, PeerRewrapRequest, PeerRewrapResponse, Policy, RewrapService,
    SoftwareKeyBackend, TokenVerifier, TrustLevel, Verdict,
};
use acp_kas::{AuditLogger, RequestMeta};

pub const REWRAP_URL: &str = "https://kas-local.example.test/v2/rewrap";
pub const ISSUER: &str = "https://idp.coalition.test";
pub const AUDIENCE: &str = "acp-kas";

/// Decision point whose verdict tests can flip at will
pub struct ProgrammableDecision {
    pub verdict: Mutex<Verdict>,
    pub calls: AtomicUsize,
}

impl ProgrammableDecision {
    pub fn allowing() -> Self {
        Self {
            verdict: Mutex::new(Verdict::Allow),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, verdict: Verdict) {
        *self.verdict.lock().unwrap() = verdict;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionPoint for ProgrammableDecision {
    async fn evaluate(&self, _request: &DecisionRequest) -> Result<Verdict, KasError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.lock().unwrap().clone())
    }
}

/// How a mock peer responds to sub-requests
#[derive(Clone)]
pub enum PeerBehavior {
    /// Serve the registered share, wrapped to the requesting node
    Serve,
    /// Answer with an authorization denial
    Deny(String),
    /// Transport-level failure
    Down,
    /// Serve, but only after a delay (for deadline tests)
    Slow(u64),
}

/// In-process peer fleet standing in for remote KAS nodes
pub struct MockPeerTransport {
    behaviors: Mutex<HashMap<String, PeerBehavior>>,
    shares: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: AtomicUsize,
}

impl MockPeerTransport {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            shares: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, peer_id: &str, behavior: PeerBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), behavior);
    }

    /// Register the plaintext share a peer holds for a KAO id
    pub fn hold_share(&self, kao_id: &str, share: &[u8]) {
        self.shares
            .lock()
            .unwrap()
            .insert(kao_id.to_string(), share.to_vec());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn rewrap(
        &self,
        peer: &FederationPeer,
        request: &PeerRewrapRequest,
    ) -> Result<PeerRewrapResponse, KasError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&peer.kas_identifier)
            .cloned()
            .unwrap_or(PeerBehavior::Serve);

        match behavior {
            PeerBehavior::Down => Err(KasError::Federation {
                peer: peer.kas_identifier.clone(),
                reason: "connection refused".to_string(),
            }),
            PeerBehavior::Deny(reason) => Ok(PeerRewrapResponse::fail(reason)),
            PeerBehavior::Slow(delay_ms) => {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                self.serve_share(peer, request)
            }
            PeerBehavior::Serve => self.serve_share(peer, request),
        }
    }
}

impl MockPeerTransport {
    fn serve_share(
        &self,
        peer: &FederationPeer,
        request: &PeerRewrapRequest,
    ) -> Result<PeerRewrapResponse, KasError> {
        let share = self
            .shares
            .lock()
            .unwrap()
            .get(&request.key_access_object.id)
            .cloned()
            .ok_or_else(|| KasError::Federation {
                peer: peer.kas_identifier.clone(),
                reason: "share not held".to_string(),
            })?;
        let node_key = ClientKey::from_pem(&request.node_public_key)?;
        let session = RewrapSession::for_client(&node_key)?;
        let wrapped = rewrap_to_client(&share, &node_key, &session)?;
        Ok(PeerRewrapResponse::permit(
            wrapped,
            session.public_key_pem().map(String::from),
        ))
    }
}

pub struct TestEnv {
    pub service: RewrapService,
    pub sink: Arc<MemorySink>,
    pub decision: Arc<ProgrammableDecision>,
    pub transport: Arc<MockPeerTransport>,
    pub backend: Arc<SoftwareKeyBackend>,
    pub ec_public_pem: String,
    pub issuer_key: SigningKey,
    pub proof_key: SigningKey,
}

pub fn peer(id: &str, trust: TrustLevel) -> FederationPeer {
    FederationPeer {
        kas_identifier: id.to_string(),
        endpoint: format!("https://{id}.example.test"),
        trust_level: trust,
        certificate_fingerprint: "ab".repeat(32),
    }
}

/// Build the wired service; `customize` tweaks the config before wiring
pub async fn build_env(customize: impl FnOnce(&mut KasConfig)) -> TestEnv {
    let mut config = KasConfig::default();
    config.kas_id = "kas-local".to_string();
    config.token.issuer = ISSUER.to_string();
    config.token.audience = AUDIENCE.to_string();
    config.limits.rate_capacity = 1000;
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_ms = 60_000;
    config.peers = vec![
        peer("kas-alpha", TrustLevel::High),
        peer("kas-beta", TrustLevel::Low),
    ];
    customize(&mut config);

    let backend = Arc::new(SoftwareKeyBackend::new());
    backend
        .generate(&config.key_handles.ec, KeyType::Ec)
        .await
        .unwrap();
    backend
        .generate(&config.key_handles.rsa, KeyType::Rsa)
        .await
        .unwrap();
    let ec_public_pem = backend.public_key_pem(&config.key_handles.ec).await.unwrap();

    let issuer_key = SigningKey::random(&mut OsRng);
    let proof_key = SigningKey::random(&mut OsRng);
    let verifier = TokenVerifier::with_static_key(
        config.token.issuer.clone(),
        config.token.audience.clone(),
        config.token.freshness_secs,
        *issuer_key.verifying_key(),
    );

    let decision = Arc::new(ProgrammableDecision::allowing());
    let decisions = DecisionClient::new(
        decision.clone(),
        DecisionCache::new(&config.cache_ttl_secs),
    );

    let transport = Arc::new(MockPeerTransport::new());
    let federation = Arc::new(FederationRouter::new(
        config.kas_id.clone(),
        transport.clone(),
        BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            cooldown: config.breaker.cooldown(),
        },
        config.deadlines.federation(),
    ));
    federation.load_peers(config.peers.clone());

    let sink = Arc::new(MemorySink::new());
    let audit = AuditLogger::new(sink.clone());

    let service = RewrapService::new(
        config,
        verifier,
        decisions,
        backend.clone(),
        federation,
        audit,
    );

    TestEnv {
        service,
        sink,
        decision,
        transport,
        backend,
        ec_public_pem,
        issuer_key,
        proof_key,
    }
}

pub async fn env() -> TestEnv {
    build_env(|_| {}).await
}

fn b64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_compact(key: &SigningKey, header: &serde_json::Value, claims: &serde_json::Value) -> String {
    let signing_input = format!(
        "{}.{}",
        b64url(&serde_json::to_vec(header).unwrap()),
        b64url(&serde_json::to_vec(claims).unwrap())
    );
    let signature: Signature = key.sign(signing_input.as_bytes());
    format!("{}.{}", signing_input, b64url(&signature.to_bytes()))
}

fn jwk_for(key: &SigningKey) -> EcJwk {
    let point = key.verifying_key().to_encoded_point(false);
    EcJwk {
        kty: "EC".to_string(),
        crv: "P-256".to_string(),
        x: b64url(point.x().unwrap()),
        y: b64url(point.y().unwrap()),
        kid: None,
    }
}

impl TestEnv {
    /// Mint a valid access token bound to the proof key
    pub fn token(&self) -> String {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": "alice@coalition.test",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now + 300,
            "attributes": {"clearance": "SECRET", "country": "NLD"},
            "cnf": {"jkt": jwk_thumbprint(&jwk_for(&self.proof_key))},
        });
        sign_compact(
            &self.issuer_key,
            &json!({"alg": "ES256", "typ": "JWT"}),
            &claims,
        )
    }

    /// Mint a fresh proof bound to the rewrap endpoint
    pub fn proof(&self) -> String {
        let claims = json!({
            "htm": "POST",
            "htu": REWRAP_URL,
            "iat": Utc::now().timestamp(),
            "jti": uuid::Uuid::new_v4().to_string(),
        });
        sign_compact(
            &self.proof_key,
            &json!({"alg": "ES256", "typ": "dpop+jwt", "jwk": jwk_for(&self.proof_key)}),
            &claims,
        )
    }

    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            client_id: "itest-client".to_string(),
            correlation_id: "corr-itest".to_string(),
            method: "POST".to_string(),
            url: REWRAP_URL.to_string(),
            body_bytes: 1024,
        }
    }

    /// A KAO whose share this node can unwrap locally
    pub fn local_kao(&self, id: &str, policy: &Policy, share: &[u8]) -> KeyAccessObject {
        let wrapped = ec_wrap_share(&self.ec_public_pem, share).unwrap();
        KeyAccessObject {
            id: id.to_string(),
            wrapped_key_share: BASE64.encode(&wrapped),
            kas_identifier: "kas-local".to_string(),
            policy_binding: bind_policy(policy, &wrapped).unwrap(),
            split_id: None,
            mode: None,
            encrypted_metadata: None,
            kid: None,
        }
    }

    /// A KAO whose share lives on a peer; registers the plaintext there
    pub fn remote_kao(
        &self,
        id: &str,
        peer_id: &str,
        policy: &Policy,
        share: &[u8],
    ) -> KeyAccessObject {
        let mut opaque = vec![0u8; 48];
        OsRng.fill_bytes(&mut opaque);
        self.transport.hold_share(id, share);
        KeyAccessObject {
            id: id.to_string(),
            wrapped_key_share: BASE64.encode(&opaque),
            kas_identifier: peer_id.to_string(),
            policy_binding: bind_policy(policy, &opaque).unwrap(),
            split_id: None,
            mode: None,
            encrypted_metadata: None,
            kid: None,
        }
    }
}

pub fn secret_policy() -> Policy {
    Policy::new(
        uuid::Uuid::new_v4().to_string(),
        Classification::Secret,
        vec!["NLD".to_string(), "FRA".to_string()],
        vec!["OP-ALPHA".to_string()],
    )
}

/// Wait for the audit drain task to flush
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
