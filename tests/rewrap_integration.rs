//! End-to-end rewrap flows through the orchestrator, no sockets involved

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::*;

use acp_kas::metadata::{seal_metadata, MetadataAssertions, ObjectMetadata};
use acp_kas::{
    AuditVerdict, Classification, ClientKeypair, KaoStatus, KasError, KeyType, RewrapEntry,
    RewrapRequest, Verdict,
};

const DEK: &[u8] = b"the-original-data-encryption-key";

fn single_request(env: &TestEnv, client: &ClientKeypair) -> (RewrapRequest, acp_kas::Policy) {
    let policy = secret_policy();
    let kao = env.local_kao("kao-0", &policy, DEK);
    (
        RewrapRequest {
            client_public_key: client.public_key_pem().to_string(),
            requests: vec![RewrapEntry {
                policy: policy.clone(),
                key_access_objects: vec![kao],
            }],
        },
        policy,
    )
}

#[tokio::test]
async fn valid_request_rewraps_key_for_caller() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (request, _) = single_request(&env, &client);

    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    let result = &response.results[0];
    assert_eq!(result.status, KaoStatus::Success);
    assert_eq!(result.id, "kao-0");

    // The caller's private key recovers the exact original DEK
    let recovered = client
        .unwrap_rewrapped(
            result.rewrapped_key.as_ref().unwrap(),
            response.session_public_key.as_deref(),
        )
        .unwrap();
    assert_eq!(recovered, DEK);

    settle().await;
    let events = env.sink.events();
    assert!(events
        .iter()
        .any(|e| e.verdict == AuditVerdict::Allow && e.kao_id.as_deref() == Some("kao-0")));
}

#[tokio::test]
async fn rsa_client_key_is_supported() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Rsa).unwrap();
    let (request, _) = single_request(&env, &client);

    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();

    assert!(response.session_public_key.is_none());
    let result = &response.results[0];
    assert_eq!(result.status, KaoStatus::Success);
    let recovered = client
        .unwrap_rewrapped(result.rewrapped_key.as_ref().unwrap(), None)
        .unwrap();
    assert_eq!(recovered, DEK);
}

#[tokio::test]
async fn corrupted_binding_fails_before_authorization() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (mut request, _) = single_request(&env, &client);

    // Flip one byte of the stored policy binding
    let kao = &mut request.requests[0].key_access_objects[0];
    let mut raw = BASE64.decode(&kao.policy_binding.hash).unwrap();
    raw[0] ^= 1;
    kao.policy_binding.hash = BASE64.encode(&raw);

    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.status, KaoStatus::Failure);
    assert_eq!(result.error_kind.as_deref(), Some("PolicyBindingError"));

    // Binding check precedes authorization: the decision point was never asked
    assert_eq!(env.decision.call_count(), 0);
}

#[tokio::test]
async fn binding_failure_beats_allow_verdict() {
    let env = env().await;
    env.decision.set(Verdict::Allow);
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let policy = secret_policy();
    let mut kao = env.local_kao("kao-0", &policy, DEK);

    // Rebind against a different policy: tampered pair
    let other_policy = secret_policy();
    let wrapped = BASE64.decode(&kao.wrapped_key_share).unwrap();
    kao.policy_binding = acp_kas::binding::bind_policy(&other_policy, &wrapped).unwrap();

    let request = RewrapRequest {
        client_public_key: client.public_key_pem().to_string(),
        requests: vec![RewrapEntry {
            policy,
            key_access_objects: vec![kao],
        }],
    };
    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();
    assert_eq!(
        response.results[0].error_kind.as_deref(),
        Some("PolicyBindingError")
    );
}

#[tokio::test]
async fn denied_subject_gets_authorization_denied() {
    let env = env().await;
    env.decision.set(Verdict::deny("clearance too low"));
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (request, _) = single_request(&env, &client);

    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.status, KaoStatus::Failure);
    assert_eq!(result.error_kind.as_deref(), Some("AuthorizationDenied"));
}

#[tokio::test]
async fn bad_token_rejects_whole_request() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (request, _) = single_request(&env, &client);

    let err = env
        .service
        .handle(&env.meta(), "not.a.token", &env.proof(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, KasError::Authentication(_)));

    // No per-object processing happened
    settle().await;
    assert!(env.sink.events().iter().all(|e| e.kao_id.is_none()));
    assert_eq!(env.decision.call_count(), 0);
}

#[tokio::test]
async fn rate_limited_request_is_shed_before_crypto() {
    let env = build_env(|config| {
        config.limits.rate_capacity = 0;
    })
    .await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (request, _) = single_request(&env, &client);

    let err = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, KasError::RateLimited(_)));

    // Shed before any cryptographic or decision work: no decision-point
    // calls, no object-scoped audit events
    assert_eq!(env.decision.call_count(), 0);
    settle().await;
    assert!(env.sink.events().iter().all(|e| e.kao_id.is_none()));
}

#[tokio::test]
async fn identical_requests_yield_identical_verdicts() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (request, _) = single_request(&env, &client);

    let first = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request.clone())
        .await
        .unwrap();
    let second = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();

    let statuses = |r: &acp_kas::RewrapResponse| {
        r.results
            .iter()
            .map(|k| (k.id.clone(), k.status, k.error_kind.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(statuses(&first), statuses(&second));
    // The cached verdict served the second pass
    assert_eq!(env.decision.call_count(), 1);
}

#[tokio::test]
async fn metadata_escalation_fails_only_that_kao() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let policy = secret_policy();

    let good = env.local_kao("kao-good", &policy, DEK);

    // Second KAO carries metadata claiming a lower classification
    let mut bad = env.local_kao("kao-bad", &policy, DEK);
    let wrapped = BASE64.decode(&bad.wrapped_key_share).unwrap();
    let metadata = ObjectMetadata {
        assertions: Some(MetadataAssertions {
            classification: Some(Classification::Unclassified),
            releasable_to: None,
        }),
        extra: serde_json::Map::new(),
    };
    bad.encrypted_metadata = Some(seal_metadata(&metadata, &wrapped).unwrap());

    let request = RewrapRequest {
        client_public_key: client.public_key_pem().to_string(),
        requests: vec![RewrapEntry {
            policy,
            key_access_objects: vec![good, bad],
        }],
    };
    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();

    let by_id = |id: &str| response.results.iter().find(|r| r.id == id).unwrap();
    assert_eq!(by_id("kao-good").status, KaoStatus::Success);
    assert_eq!(by_id("kao-bad").status, KaoStatus::Failure);
    assert_eq!(by_id("kao-bad").error_kind.as_deref(), Some("MetadataError"));
}

#[tokio::test]
async fn consistent_metadata_passes() {
    let env = env().await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let policy = secret_policy();

    let mut kao = env.local_kao("kao-0", &policy, DEK);
    let wrapped = BASE64.decode(&kao.wrapped_key_share).unwrap();
    let metadata = ObjectMetadata {
        assertions: Some(MetadataAssertions {
            classification: Some(Classification::Secret),
            releasable_to: Some(vec!["NLD".to_string()]),
        }),
        extra: serde_json::Map::new(),
    };
    kao.encrypted_metadata = Some(seal_metadata(&metadata, &wrapped).unwrap());

    let request = RewrapRequest {
        client_public_key: client.public_key_pem().to_string(),
        requests: vec![RewrapEntry {
            policy,
            key_access_objects: vec![kao],
        }],
    };
    let response = env
        .service
        .handle(&env.meta(), &env.token(), &env.proof(), request)
        .await
        .unwrap();
    assert_eq!(response.results[0].status, KaoStatus::Success);
}

#[tokio::test]
async fn oversized_request_is_rejected_as_validation() {
    let env = build_env(|config| {
        config.limits.max_body_bytes = 100;
    })
    .await;
    let client = ClientKeypair::generate(KeyType::Ec).unwrap();
    let (request, _) = single_request(&env, &client);

    let mut meta = env.meta();
    meta.body_bytes = 4096;
    let err = env
        .service
        .handle(&meta, &env.token(), &env.proof(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, KasError::Validation(_)));
    assert_eq!(env.decision.call_count(), 0);
}
