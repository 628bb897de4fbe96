//! Policy binding computation and constant-time verification
//!
//! The binding is a keyed hash tying a policy to one specific wrapped key
//! share: altering either side invalidates it. The binding key is derived
//! from the wrapped share itself (HKDF-SHA256), so verification runs before
//! any decryption or KMS call, so forged objects never reach privileged
//! operations.
//!
//! Binding format: `BASE64(HEX(HMAC-SHA256(bindingKey, BASE64(policyJson))))`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::KasError;
use crate::policy::Policy;
use crate::protocol::{KeyAccessObject, PolicyBinding};

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation tag for the binding key derivation salt
const BINDING_SALT_TAG: &[u8] = b"ACP240-BINDING";

/// Derive the binding key for a wrapped share
///
/// salt = SHA256(tag), ikm = wrapped share bytes. Both the policy and the
/// recipient-key material flow into the final HMAC: the policy as message,
/// the share through this key.
pub fn binding_key(wrapped_share: &[u8]) -> Result<[u8; 32], KasError> {
    let salt = Sha256::digest(BINDING_SALT_TAG);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), wrapped_share);
    let mut key = [0u8; 32];
    hkdf.expand(b"policy-binding", &mut key)
        .map_err(|e| KasError::KeyManagement(format!("HKDF expansion failed: {e}")))?;
    Ok(key)
}

/// Calculate a policy binding over canonical policy JSON
///
/// Producer-side counterpart of [`verify_policy_binding`]; also used by the
/// verifier to recompute the expected value.
pub fn calculate_policy_binding(policy_json: &str, key: &[u8]) -> Result<String, KasError> {
    let policy_base64 = BASE64.encode(policy_json);

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| KasError::KeyManagement("HMAC initialization failed".to_string()))?;
    mac.update(policy_base64.as_bytes());
    let hmac_result = mac.finalize().into_bytes();

    let hex_string = hex::encode(hmac_result);
    Ok(BASE64.encode(hex_string.as_bytes()))
}

/// Build the binding structure for a policy/share pair (producer side)
pub fn bind_policy(policy: &Policy, wrapped_share: &[u8]) -> Result<PolicyBinding, KasError> {
    let key = binding_key(wrapped_share)?;
    let hash = calculate_policy_binding(&policy.canonical_json()?, &key)?;
    Ok(PolicyBinding::new(hash))
}

/// Verify a KAO's stored binding against a recomputed one, constant time
///
/// Mismatch means the object was tampered with: the KAO is rejected with
/// `PolicyBindingError` and must not be processed further.
pub fn verify_policy_binding(policy: &Policy, kao: &KeyAccessObject) -> Result<(), KasError> {
    let wrapped_share = BASE64
        .decode(&kao.wrapped_key_share)
        .map_err(|_| KasError::Validation(format!("KAO '{}': wrapped share is not base64", kao.id)))?;

    let key = binding_key(&wrapped_share)?;
    let expected = calculate_policy_binding(&policy.canonical_json()?, &key)?;

    let stored = BASE64
        .decode(&kao.policy_binding.hash)
        .map_err(|_| KasError::Validation(format!("KAO '{}': policy binding is not base64", kao.id)))?;
    let computed = BASE64.decode(&expected)?;

    // Constant-time comparison: binding checks must not leak match position
    if computed.ct_eq(&stored).into() {
        Ok(())
    } else {
        Err(KasError::PolicyBinding {
            kao_id: kao.id.clone(),
        })
    }
}
