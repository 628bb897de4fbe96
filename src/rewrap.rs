//! Rewrap orchestrator
//!
//! Sequences the full request pipeline: rate limit and input validation,
//! token and proof verification, then per key access object binding check →
//! metadata check → authorization → key recovery → rewrap under the caller's
//! key. Split groups and independent objects are processed concurrently;
//! one object's failure never aborts its siblings, and every allow, deny,
//! and error lands in the audit trail.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::future::{join_all, try_join_all};
use tokio::time::timeout;

use crate::audit::{AuditEvent, AuditLogger};
use crate::binding::verify_policy_binding;
use crate::config::KasConfig;
use crate::decision::DecisionClient;
use crate::error::{ErrorKind, KasError};
use crate::federation::FederationRouter;
use crate::kms::{rewrap_to_client, ClientKey, KeyBackend, RewrapSession};
use crate::metadata::{check_consistency, decrypt_metadata};
use crate::policy::Policy;
use crate::protocol::{KaoResult, KeyAccessObject, RewrapRequest, RewrapResponse};
use crate::ratelimit::{validate_request, RateLimiter};
use crate::split::{combine_shares, group_by_split, SplitGroup, SplitMode};
use crate::token::{RequestContext, Subject, TokenVerifier};

/// Per-call context the transport layer extracts before dispatch
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Client identity used for rate limiting
    pub client_id: String,
    /// Correlation id threaded through audit events
    pub correlation_id: String,
    pub method: String,
    pub url: String,
    /// Raw body size, checked against the configured bound
    pub body_bytes: usize,
}

/// The top-level request handler wiring every component together
pub struct RewrapService {
    config: KasConfig,
    verifier: TokenVerifier,
    decisions: DecisionClient,
    kms: Arc<dyn KeyBackend>,
    federation: Arc<FederationRouter>,
    limiter: RateLimiter,
    audit: AuditLogger,
}

impl RewrapService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: KasConfig,
        verifier: TokenVerifier,
        decisions: DecisionClient,
        kms: Arc<dyn KeyBackend>,
        federation: Arc<FederationRouter>,
        audit: AuditLogger,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.limits.rate_capacity,
            config.limits.rate_refill_per_sec,
        );
        Self {
            config,
            verifier,
            decisions,
            kms,
            federation,
            limiter,
            audit,
        }
    }

    pub fn federation(&self) -> &FederationRouter {
        &self.federation
    }

    pub fn decisions(&self) -> &DecisionClient {
        &self.decisions
    }

    /// Process one rewrap call end to end
    ///
    /// Request-level failures (rate limit, malformed input, authentication)
    /// return `Err` and reject the whole call; everything past token
    /// verification degrades per object inside the `Ok` response.
    pub async fn handle(
        &self,
        meta: &RequestMeta,
        bearer: &str,
        proof: &str,
        request: RewrapRequest,
    ) -> Result<RewrapResponse, KasError> {
        let started = Instant::now();
        metrics::counter!("kas_rewrap_requests_total", 1);

        // Shed load before any cryptographic work
        if let Err(err) = self.limiter.check(&meta.client_id) {
            self.audit_request_rejection(meta, started, &err);
            return Err(err);
        }
        if let Err(err) = validate_request(&request, &self.request_limits(), meta.body_bytes) {
            self.audit_request_rejection(meta, started, &err);
            return Err(err);
        }

        let ctx = RequestContext {
            method: meta.method.clone(),
            url: meta.url.clone(),
        };
        let subject = match self.verifier.verify(bearer, proof, &ctx).await {
            Ok(subject) => subject,
            Err(err) => {
                self.audit_request_rejection(meta, started, &err);
                return Err(err);
            }
        };

        let client_key = ClientKey::from_pem(&request.client_public_key)?;
        let session = RewrapSession::for_client(&client_key)?;

        let mut tagged = Vec::new();
        for entry in &request.requests {
            for group in group_by_split(&entry.key_access_objects)? {
                let ids: Vec<String> = group.members.iter().map(|m| m.id.clone()).collect();
                let policy_uuid = entry.policy.uuid.clone();
                let fut = self.process_group(
                    meta,
                    started,
                    &subject,
                    &entry.policy,
                    group,
                    &client_key,
                    &session,
                );
                tagged.push((ids, policy_uuid, fut));
            }
        }

        let deadline = self.config.deadlines.request();
        let subject_id = subject.id.clone();
        let results: Vec<KaoResult> = join_all(tagged.into_iter().map(
            |(ids, policy_uuid, fut)| {
                let subject_id = subject_id.clone();
                async move {
                    match timeout(deadline, fut).await {
                        Ok(results) => results,
                        Err(_) => ids
                            .iter()
                            .map(|id| {
                                self.audit_deny(
                                    meta,
                                    started,
                                    &subject_id,
                                    &policy_uuid,
                                    Some(id.as_str()),
                                    ErrorKind::Timeout,
                                );
                                KaoResult::failure(id.as_str(), &KasError::Timeout("rewrap"))
                            })
                            .collect(),
                    }
                }
            },
        ))
        .await
        .into_iter()
        .flatten()
        .collect();

        for result in &results {
            let status = if result.is_success() { "success" } else { "failure" };
            metrics::counter!("kas_kao_results_total", 1, "status" => status);
        }
        metrics::histogram!(
            "kas_rewrap_request_ms",
            started.elapsed().as_millis() as f64
        );

        Ok(RewrapResponse {
            results,
            session_public_key: session.public_key_pem().map(String::from),
        })
    }

    /// Serve a federation sub-request from a peer node
    ///
    /// The transport layer has already mutually authenticated the peer; this
    /// node still re-evaluates authorization from the forwarded policy and
    /// subject context rather than trusting the caller's conclusion. The
    /// recovered share goes back wrapped to the peer's session key, so
    /// plaintext never crosses the wire.
    pub async fn handle_peer(
        &self,
        meta: &RequestMeta,
        request: crate::protocol::PeerRewrapRequest,
    ) -> crate::protocol::PeerRewrapResponse {
        use crate::protocol::PeerRewrapResponse;

        let started = Instant::now();
        metrics::counter!("kas_peer_rewrap_requests_total", 1);

        let kao = &request.key_access_object;
        if !self.federation.is_local(&kao.kas_identifier) {
            return PeerRewrapResponse::fail("share is not held by this node");
        }

        let outcome = self
            .fetch_share(&request.subject, &request.policy, kao)
            .await
            .and_then(|share| {
                let node_key = ClientKey::from_pem(&request.node_public_key)?;
                let session = RewrapSession::for_client(&node_key)?;
                let wrapped = rewrap_to_client(&share, &node_key, &session)?;
                Ok((wrapped, session.public_key_pem().map(String::from)))
            });

        match outcome {
            Ok((wrapped, session_public_key)) => {
                self.audit_allow(
                    meta,
                    started,
                    &request.subject.id,
                    &request.policy.uuid,
                    Some(kao.id.as_str()),
                );
                PeerRewrapResponse::permit(wrapped, session_public_key)
            }
            Err(err) => {
                self.audit_deny(
                    meta,
                    started,
                    &request.subject.id,
                    &request.policy.uuid,
                    Some(kao.id.as_str()),
                    err.kind(),
                );
                PeerRewrapResponse::fail(err.client_reason())
            }
        }
    }

    fn request_limits(&self) -> crate::ratelimit::RequestLimits {
        crate::ratelimit::RequestLimits {
            max_body_bytes: self.config.limits.max_body_bytes,
            max_entries: self.config.limits.max_entries,
            max_kaos_per_entry: self.config.limits.max_kaos_per_entry,
        }
    }

    /// Process one split group into per-object results
    ///
    /// `single`: the one share is the key. `all-of`: every member share must
    /// arrive (concurrently; first failure cancels the rest) before the XOR
    /// combine. `any-of`: candidates are tried in deterministic priority
    /// order (local, then peers by trust), stopping at the first authorized
    /// share; later candidates are never started.
    #[allow(clippy::too_many_arguments)]
    async fn process_group<'a>(
        &self,
        meta: &RequestMeta,
        started: Instant,
        subject: &Subject,
        policy: &Policy,
        group: SplitGroup<'a>,
        client_key: &ClientKey,
        session: &RewrapSession,
    ) -> Vec<KaoResult> {
        match group.mode {
            SplitMode::Single => {
                let kao = group.members[0];
                match self.fetch_share(subject, policy, kao).await {
                    Ok(share) => self.finish_group(meta, started, subject, policy, &[kao], &share, client_key, session),
                    Err(err) => {
                        self.audit_deny(
                            meta,
                            started,
                            &subject.id,
                            &policy.uuid,
                            Some(kao.id.as_str()),
                            err.kind(),
                        );
                        vec![KaoResult::failure(kao.id.as_str(), &err)]
                    }
                }
            }
            SplitMode::AllOf => {
                let fetches = group
                    .members
                    .iter()
                    .map(|kao| self.fetch_share(subject, policy, kao));
                match try_join_all(fetches).await {
                    Ok(shares) => match combine_shares(&shares) {
                        Ok(key) => self.finish_group(
                            meta, started, subject, policy, &group.members, &key, client_key, session,
                        ),
                        Err(err) => self.fail_group(meta, started, subject, policy, &group.members, &err),
                    },
                    // No partial key material: one missing share fails the group
                    Err(err) => self.fail_group(meta, started, subject, policy, &group.members, &err),
                }
            }
            SplitMode::AnyOf => {
                let mut candidates: Vec<&KeyAccessObject> = group.members.to_vec();
                candidates.sort_by_key(|kao| self.federation.sort_key(&kao.kas_identifier));

                let mut failures: Vec<(String, KasError)> = Vec::new();
                for kao in candidates {
                    match self.fetch_share(subject, policy, kao).await {
                        Ok(share) => {
                            // Short-circuit: losers after this point are never tried
                            for (id, err) in &failures {
                                self.audit_deny(
                                    meta,
                                    started,
                                    &subject.id,
                                    &policy.uuid,
                                    Some(id.as_str()),
                                    err.kind(),
                                );
                            }
                            return self.finish_group(
                                meta, started, subject, policy, &[kao], &share, client_key, session,
                            );
                        }
                        Err(err) => failures.push((kao.id.clone(), err)),
                    }
                }

                failures
                    .into_iter()
                    .map(|(id, err)| {
                        self.audit_deny(
                            meta,
                            started,
                            &subject.id,
                            &policy.uuid,
                            Some(id.as_str()),
                            err.kind(),
                        );
                        KaoResult::failure(id.as_str(), &err)
                    })
                    .collect()
            }
        }
    }

    /// Rewrap a recovered key for the caller and emit success results
    #[allow(clippy::too_many_arguments)]
    fn finish_group(
        &self,
        meta: &RequestMeta,
        started: Instant,
        subject: &Subject,
        policy: &Policy,
        members: &[&KeyAccessObject],
        key: &[u8],
        client_key: &ClientKey,
        session: &RewrapSession,
    ) -> Vec<KaoResult> {
        match rewrap_to_client(key, client_key, session) {
            Ok(rewrapped) => members
                .iter()
                .map(|kao| {
                    self.audit_allow(meta, started, &subject.id, &policy.uuid, Some(kao.id.as_str()));
                    KaoResult::success(kao.id.as_str(), rewrapped.clone())
                })
                .collect(),
            Err(err) => self.fail_group(meta, started, subject, policy, members, &err),
        }
    }

    fn fail_group(
        &self,
        meta: &RequestMeta,
        started: Instant,
        subject: &Subject,
        policy: &Policy,
        members: &[&KeyAccessObject],
        err: &KasError,
    ) -> Vec<KaoResult> {
        members
            .iter()
            .map(|kao| {
                self.audit_deny(
                    meta,
                    started,
                    &subject.id,
                    &policy.uuid,
                    Some(kao.id.as_str()),
                    err.kind(),
                );
                KaoResult::failure(kao.id.as_str(), err)
            })
            .collect()
    }

    /// Obtain one plaintext share, locally or via federation
    ///
    /// Order is fixed: binding check first (before any privileged
    /// operation), then metadata, then authorization, then key recovery.
    async fn fetch_share(
        &self,
        subject: &Subject,
        policy: &Policy,
        kao: &KeyAccessObject,
    ) -> Result<Vec<u8>, KasError> {
        if let Err(err) = verify_policy_binding(policy, kao) {
            if matches!(err, KasError::PolicyBinding { .. }) {
                tracing::error!(
                    kao_id = %kao.id,
                    policy = %policy.uuid,
                    "policy binding mismatch, object treated as tampered"
                );
            }
            return Err(err);
        }

        if let Some(metadata) = decrypt_metadata(kao)? {
            check_consistency(&metadata, policy)?;
        }

        if self.federation.is_local(&kao.kas_identifier) {
            let verdict = self.decisions.authorize(subject, policy).await;
            if let crate::decision::Verdict::Deny { reason } = verdict {
                return Err(KasError::AuthorizationDenied(reason));
            }

            let wrapped = BASE64.decode(&kao.wrapped_key_share)?;
            let handle = kao.kid.clone().unwrap_or_else(|| {
                if wrapped.len() == 256 {
                    self.config.key_handles.rsa.clone()
                } else {
                    self.config.key_handles.ec.clone()
                }
            });
            match timeout(self.config.deadlines.kms(), self.kms.unwrap(&handle, &wrapped)).await {
                Ok(result) => result,
                Err(_) => Err(KasError::Timeout("key unwrap")),
            }
        } else {
            // Remote share: the peer re-evaluates authorization itself
            self.federation
                .rewrap_remote(&kao.kas_identifier, kao, policy, subject)
                .await
        }
    }

    fn audit_allow(
        &self,
        meta: &RequestMeta,
        started: Instant,
        subject_id: &str,
        resource_id: &str,
        kao_id: Option<&str>,
    ) {
        self.audit.record(AuditEvent::allow(
            &meta.correlation_id,
            subject_id,
            resource_id,
            kao_id,
            self.federation.local_kas(),
            started.elapsed().as_millis() as u64,
        ));
    }

    fn audit_deny(
        &self,
        meta: &RequestMeta,
        started: Instant,
        subject_id: &str,
        resource_id: &str,
        kao_id: Option<&str>,
        kind: ErrorKind,
    ) {
        self.audit.record(AuditEvent::deny(
            &meta.correlation_id,
            subject_id,
            resource_id,
            kao_id,
            self.federation.local_kas(),
            kind,
            started.elapsed().as_millis() as u64,
        ));
    }

    /// Request-level rejections are audited once, with no object scope
    fn audit_request_rejection(&self, meta: &RequestMeta, started: Instant, err: &KasError) {
        self.audit.record(AuditEvent::deny(
            &meta.correlation_id,
            &meta.client_id,
            "-",
            None,
            self.federation.local_kas(),
            err.kind(),
            started.elapsed().as_millis() as u64,
        ));
    }
}
