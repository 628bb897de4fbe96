//! Encrypted-metadata decryption and policy consistency checks
//!
//! A key access object may carry a sealed metadata blob (AES-256-GCM, key
//! derived from the wrapped share). Any policy assertions embedded in the
//! metadata must be consistent with the outer policy: assertions may tighten
//! it, never loosen it. Escalation fails that KAO with `MetadataError` and
//! leaves siblings untouched.
//!
//! Blob layout: `nonce (12 bytes) || ciphertext + tag`.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KasError;
use crate::policy::{Classification, Policy};
use crate::protocol::KeyAccessObject;

/// Domain-separation tag for the metadata key derivation salt
const METADATA_SALT_TAG: &[u8] = b"ACP240-METADATA";

/// Policy assertions a producer may embed inside sealed metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataAssertions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(rename = "releasableTo", skip_serializing_if = "Option::is_none")]
    pub releasable_to: Option<Vec<String>>,
}

/// Decrypted metadata attached to a key access object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertions: Option<MetadataAssertions>,
    /// Producer-defined fields the KAS carries without interpreting
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Derive the metadata AEAD key for a wrapped share
pub fn metadata_key(wrapped_share: &[u8]) -> Result<[u8; 32], KasError> {
    let salt = Sha256::digest(METADATA_SALT_TAG);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), wrapped_share);
    let mut key = [0u8; 32];
    hkdf.expand(b"metadata", &mut key)
        .map_err(|e| KasError::Metadata(format!("HKDF expansion failed: {e}")))?;
    Ok(key)
}

/// Seal metadata for a key access object (producer side, used by tests)
pub fn seal_metadata(metadata: &ObjectMetadata, wrapped_share: &[u8]) -> Result<String, KasError> {
    let key_bytes = metadata_key(wrapped_share)?;
    let plaintext = serde_json::to_vec(metadata)?;

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let nonce_ga = GenericArray::from_slice(&nonce);

    let key = Key::<Aes256Gcm>::from(key_bytes);
    let cipher = Aes256Gcm::new(&key);
    let ciphertext = cipher
        .encrypt(nonce_ga, plaintext.as_slice())
        .map_err(|_| KasError::Metadata("metadata encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(nonce.len() + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(&blob))
}

/// Decrypt a KAO's metadata blob, if present
pub fn decrypt_metadata(kao: &KeyAccessObject) -> Result<Option<ObjectMetadata>, KasError> {
    let Some(encrypted) = &kao.encrypted_metadata else {
        return Ok(None);
    };

    let blob = BASE64
        .decode(encrypted)
        .map_err(|_| KasError::Metadata(format!("KAO '{}': metadata is not base64", kao.id)))?;
    if blob.len() < 12 + 16 {
        return Err(KasError::Metadata(format!(
            "KAO '{}': metadata blob too short ({} bytes)",
            kao.id,
            blob.len()
        )));
    }

    let wrapped_share = BASE64
        .decode(&kao.wrapped_key_share)
        .map_err(|_| KasError::Metadata(format!("KAO '{}': wrapped share is not base64", kao.id)))?;
    let key_bytes = metadata_key(&wrapped_share)?;

    let nonce = GenericArray::from_slice(&blob[..12]);
    let key = Key::<Aes256Gcm>::from(key_bytes);
    let cipher = Aes256Gcm::new(&key);
    let plaintext = cipher
        .decrypt(nonce, &blob[12..])
        .map_err(|_| KasError::Metadata(format!("KAO '{}': metadata decryption failed", kao.id)))?;

    let metadata: ObjectMetadata = serde_json::from_slice(&plaintext)
        .map_err(|e| KasError::Metadata(format!("KAO '{}': metadata is not valid JSON: {e}", kao.id)))?;
    Ok(Some(metadata))
}

/// Validate embedded assertions against the outer policy
///
/// An embedded classification may not be lower than the outer one (that would
/// claim the data is less sensitive than the policy says), and an embedded
/// releasability set may not name entities the outer policy does not.
pub fn check_consistency(metadata: &ObjectMetadata, policy: &Policy) -> Result<(), KasError> {
    let Some(assertions) = &metadata.assertions else {
        return Ok(());
    };

    if let Some(classification) = assertions.classification {
        if classification < policy.classification {
            return Err(KasError::Metadata(format!(
                "embedded classification {} downgrades outer {}",
                classification, policy.classification
            )));
        }
    }

    if let Some(releasable_to) = &assertions.releasable_to {
        for entity in releasable_to {
            if !policy.releasable_to.contains(entity) {
                return Err(KasError::Metadata(format!(
                    "embedded releasability names '{entity}' outside the outer policy"
                )));
            }
        }
    }

    Ok(())
}
