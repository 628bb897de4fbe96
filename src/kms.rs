//! Key management backend and rewrap cryptography
//!
//! [`KeyBackend`] is the opaque boundary in front of an HSM/KMS: callers hand
//! it a key handle and wrapped bytes and get plaintext share material back;
//! private keys never cross the trait. [`SoftwareKeyBackend`] is the
//! in-process implementation holding EC P-256 and RSA-2048 keypairs.
//!
//! Rewrapping the recovered data key under the caller's ephemeral public key
//! is a separate, public-key-only operation and never touches the backend.
//!
//! Wrapped-share formats:
//! - EC: `ephemeral SEC1 point (65) || nonce (12) || AES-256-GCM ciphertext`,
//!   key = HKDF-SHA256(ECDH shared secret, salt = SHA256("ACP240-WRAP"))
//! - RSA: RSA-OAEP-SHA256 ciphertext (256 bytes for RSA-2048)

use std::collections::HashMap;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit};
use aes_gcm::Aes256Gcm;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey as P256PublicKey, SecretKey as P256SecretKey};
use pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::KasError;

/// Domain-separation tag for share wrapping
const WRAP_SALT_TAG: &[u8] = b"ACP240-WRAP";
/// Domain-separation tag for client session rewrapping
const SESSION_SALT_TAG: &[u8] = b"ACP240-SESSION";

const SEC1_POINT_LEN: usize = 65;
const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const RSA_2048_CIPHERTEXT_LEN: usize = 256;

/// Key algorithm for backend handles and client keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Elliptic curve P-256
    Ec,
    /// RSA-2048
    Rsa,
}

fn derive_aead_key(shared_secret: &[u8], salt_tag: &[u8]) -> Result<[u8; 32], KasError> {
    let salt = Sha256::digest(salt_tag);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"", &mut key)
        .map_err(|e| KasError::KeyManagement(format!("HKDF expansion failed: {e}")))?;
    Ok(key)
}

fn aead_seal(key_bytes: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, KasError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let nonce_ga = GenericArray::from_slice(&nonce);

    let key = Key::<Aes256Gcm>::from(*key_bytes);
    let cipher = Aes256Gcm::new(&key);
    let ciphertext = cipher
        .encrypt(nonce_ga, plaintext)
        .map_err(|_| KasError::KeyManagement("AES-GCM encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_open(key_bytes: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, KasError> {
    if blob.len() < NONCE_LEN + GCM_TAG_LEN {
        return Err(KasError::KeyManagement(format!(
            "sealed blob too short: {} bytes",
            blob.len()
        )));
    }
    let nonce = GenericArray::from_slice(&blob[..NONCE_LEN]);
    let key = Key::<Aes256Gcm>::from(*key_bytes);
    let cipher = Aes256Gcm::new(&key);
    cipher
        .decrypt(nonce, &blob[NONCE_LEN..])
        .map_err(|_| KasError::KeyManagement("AES-GCM decryption failed".to_string()))
}

fn ecdh_secret(secret: &P256SecretKey, public: &P256PublicKey) -> Vec<u8> {
    let shared = p256::elliptic_curve::ecdh::diffie_hellman(
        secret.to_nonzero_scalar(),
        public.as_affine(),
    );
    shared.raw_secret_bytes().to_vec()
}

/// Abstraction over the HSM/KMS holding the service's unwrap keys
///
/// The only operations the rest of the process may perform. Implementations
/// must never expose private key bytes through this interface.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Unwrap a wrapped key share under the named key handle
    async fn unwrap(&self, key_handle: &str, wrapped: &[u8]) -> Result<Vec<u8>, KasError>;

    /// Public key (PEM) for a handle, for producers wrapping new shares
    async fn public_key_pem(&self, key_handle: &str) -> Result<String, KasError>;

    /// Replace the keypair behind a handle with fresh material
    async fn rotate(&self, key_handle: &str) -> Result<(), KasError>;
}

enum BackendKeypair {
    Ec(P256SecretKey),
    Rsa(RsaPrivateKey),
}

impl BackendKeypair {
    fn generate(key_type: KeyType) -> Result<Self, KasError> {
        match key_type {
            KeyType::Ec => Ok(BackendKeypair::Ec(P256SecretKey::random(&mut OsRng))),
            KeyType::Rsa => {
                let private = RsaPrivateKey::new(&mut OsRng, 2048).map_err(|e| {
                    KasError::KeyManagement(format!("RSA key generation failed: {e}"))
                })?;
                Ok(BackendKeypair::Rsa(private))
            }
        }
    }

    fn key_type(&self) -> KeyType {
        match self {
            BackendKeypair::Ec(_) => KeyType::Ec,
            BackendKeypair::Rsa(_) => KeyType::Rsa,
        }
    }

    fn public_key_pem(&self) -> Result<String, KasError> {
        match self {
            BackendKeypair::Ec(secret) => secret
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| KasError::KeyManagement(format!("PEM encoding failed: {e}"))),
            BackendKeypair::Rsa(private) => RsaPublicKey::from(private)
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| KasError::KeyManagement(format!("PEM encoding failed: {e}"))),
        }
    }
}

/// In-process software implementation of [`KeyBackend`]
///
/// Suitable for development, tests, and deployments where the host already
/// provides hardware-backed disk encryption. Handles map to EC or RSA
/// keypairs generated at startup.
pub struct SoftwareKeyBackend {
    keys: RwLock<HashMap<String, BackendKeypair>>,
}

impl SoftwareKeyBackend {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Generate and register a keypair under a handle
    pub async fn generate(&self, key_handle: &str, key_type: KeyType) -> Result<(), KasError> {
        let keypair = BackendKeypair::generate(key_type)?;
        self.keys
            .write()
            .await
            .insert(key_handle.to_string(), keypair);
        Ok(())
    }
}

impl Default for SoftwareKeyBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyBackend for SoftwareKeyBackend {
    async fn unwrap(&self, key_handle: &str, wrapped: &[u8]) -> Result<Vec<u8>, KasError> {
        let keys = self.keys.read().await;
        let keypair = keys
            .get(key_handle)
            .ok_or_else(|| KasError::KeyManagement(format!("key handle '{key_handle}' not configured")))?;

        match keypair {
            BackendKeypair::Ec(secret) => {
                if wrapped.len() < SEC1_POINT_LEN + NONCE_LEN + GCM_TAG_LEN {
                    return Err(KasError::KeyManagement(format!(
                        "wrapped share too short: {} bytes",
                        wrapped.len()
                    )));
                }
                let ephemeral = P256PublicKey::from_sec1_bytes(&wrapped[..SEC1_POINT_LEN])
                    .map_err(|e| KasError::KeyManagement(format!("invalid ephemeral point: {e}")))?;
                let shared = ecdh_secret(secret, &ephemeral);
                let key = derive_aead_key(&shared, WRAP_SALT_TAG)?;
                aead_open(&key, &wrapped[SEC1_POINT_LEN..])
            }
            BackendKeypair::Rsa(private) => {
                if wrapped.len() != RSA_2048_CIPHERTEXT_LEN {
                    return Err(KasError::KeyManagement(format!(
                        "RSA wrapped share must be {RSA_2048_CIPHERTEXT_LEN} bytes, got {}",
                        wrapped.len()
                    )));
                }
                let padding = Oaep::new::<Sha256>();
                private
                    .decrypt(padding, wrapped)
                    .map_err(|e| KasError::KeyManagement(format!("RSA-OAEP decryption failed: {e}")))
            }
        }
    }

    async fn public_key_pem(&self, key_handle: &str) -> Result<String, KasError> {
        let keys = self.keys.read().await;
        let keypair = keys
            .get(key_handle)
            .ok_or_else(|| KasError::KeyManagement(format!("key handle '{key_handle}' not configured")))?;
        keypair.public_key_pem()
    }

    async fn rotate(&self, key_handle: &str) -> Result<(), KasError> {
        let mut keys = self.keys.write().await;
        let key_type = keys
            .get(key_handle)
            .ok_or_else(|| KasError::KeyManagement(format!("key handle '{key_handle}' not configured")))?
            .key_type();
        keys.insert(key_handle.to_string(), BackendKeypair::generate(key_type)?);
        Ok(())
    }
}

/// Wrap a share to an EC KAS public key (producer side, used by tests)
pub fn ec_wrap_share(kas_public_pem: &str, share: &[u8]) -> Result<Vec<u8>, KasError> {
    let kas_public = P256PublicKey::from_public_key_pem(kas_public_pem)
        .map_err(|e| KasError::Validation(format!("invalid EC public key: {e}")))?;

    let ephemeral = P256SecretKey::random(&mut OsRng);
    let shared = ecdh_secret(&ephemeral, &kas_public);
    let key = derive_aead_key(&shared, WRAP_SALT_TAG)?;
    let sealed = aead_seal(&key, share)?;

    let point = ephemeral.public_key().to_encoded_point(false);
    let mut out = Vec::with_capacity(point.as_bytes().len() + sealed.len());
    out.extend_from_slice(point.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Wrap a share to an RSA KAS public key (producer side, used by tests)
pub fn rsa_wrap_share(kas_public_pem: &str, share: &[u8]) -> Result<Vec<u8>, KasError> {
    let kas_public = RsaPublicKey::from_public_key_pem(kas_public_pem)
        .map_err(|e| KasError::Validation(format!("invalid RSA public key: {e}")))?;
    let padding = Oaep::new::<Sha256>();
    kas_public
        .encrypt(&mut OsRng, padding, share)
        .map_err(|e| KasError::KeyManagement(format!("RSA-OAEP encryption failed: {e}")))
}

/// The caller's ephemeral public key, parsed from PEM
pub enum ClientKey {
    Rsa(RsaPublicKey),
    Ec(P256PublicKey),
}

impl ClientKey {
    /// Parse a client public key, accepting RSA or EC P-256
    pub fn from_pem(pem: &str) -> Result<Self, KasError> {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(ClientKey::Rsa(key));
        }
        P256PublicKey::from_public_key_pem(pem)
            .map(ClientKey::Ec)
            .map_err(|_| {
                KasError::Validation("clientPublicKey is neither RSA nor EC P-256 PEM".to_string())
            })
    }
}

/// Per-request session key material for EC client rewraps
///
/// One session serves every key access object in a request, so the response
/// carries a single session public key. RSA clients need no session.
pub struct RewrapSession {
    secret: Option<P256SecretKey>,
    public_pem: Option<String>,
}

impl RewrapSession {
    /// Create the session appropriate for a client key
    pub fn for_client(client: &ClientKey) -> Result<Self, KasError> {
        match client {
            ClientKey::Rsa(_) => Ok(Self {
                secret: None,
                public_pem: None,
            }),
            ClientKey::Ec(_) => {
                let secret = P256SecretKey::random(&mut OsRng);
                let public_pem = secret
                    .public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| KasError::KeyManagement(format!("PEM encoding failed: {e}")))?;
                Ok(Self {
                    secret: Some(secret),
                    public_pem: Some(public_pem),
                })
            }
        }
    }

    /// Session public key to return in the response, if any
    pub fn public_key_pem(&self) -> Option<&str> {
        self.public_pem.as_deref()
    }
}

/// Re-encrypt a recovered data key under the caller's ephemeral public key
///
/// Public-key material only: this path never touches the key backend.
pub fn rewrap_to_client(
    dek: &[u8],
    client: &ClientKey,
    session: &RewrapSession,
) -> Result<String, KasError> {
    match client {
        ClientKey::Rsa(public) => {
            let padding = Oaep::new::<Sha256>();
            let wrapped = public
                .encrypt(&mut OsRng, padding, dek)
                .map_err(|e| KasError::KeyManagement(format!("RSA-OAEP encryption failed: {e}")))?;
            Ok(BASE64.encode(&wrapped))
        }
        ClientKey::Ec(public) => {
            let secret = session.secret.as_ref().ok_or_else(|| {
                KasError::KeyManagement("EC rewrap requires a session key".to_string())
            })?;
            let shared = ecdh_secret(secret, public);
            let key = derive_aead_key(&shared, SESSION_SALT_TAG)?;
            let sealed = aead_seal(&key, dek)?;
            Ok(BASE64.encode(&sealed))
        }
    }
}

/// Client-side ephemeral keypair, the counterpart of [`rewrap_to_client`]
///
/// Used by SDK callers and by this crate's tests to round-trip rewrapped
/// keys, and by the federation router for node-to-node share transport.
pub enum ClientKeypair {
    Ec {
        secret: P256SecretKey,
        public_pem: String,
    },
    Rsa {
        private: RsaPrivateKey,
        public_pem: String,
    },
}

impl ClientKeypair {
    /// Generate a fresh ephemeral keypair of the given type
    pub fn generate(key_type: KeyType) -> Result<Self, KasError> {
        match key_type {
            KeyType::Ec => {
                let secret = P256SecretKey::random(&mut OsRng);
                let public_pem = secret
                    .public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| KasError::KeyManagement(format!("PEM encoding failed: {e}")))?;
                Ok(ClientKeypair::Ec { secret, public_pem })
            }
            KeyType::Rsa => {
                let private = RsaPrivateKey::new(&mut OsRng, 2048).map_err(|e| {
                    KasError::KeyManagement(format!("RSA key generation failed: {e}"))
                })?;
                let public_pem = RsaPublicKey::from(&private)
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| KasError::KeyManagement(format!("PEM encoding failed: {e}")))?;
                Ok(ClientKeypair::Rsa { private, public_pem })
            }
        }
    }

    /// The public key PEM presented as `clientPublicKey`
    pub fn public_key_pem(&self) -> &str {
        match self {
            ClientKeypair::Ec { public_pem, .. } => public_pem,
            ClientKeypair::Rsa { public_pem, .. } => public_pem,
        }
    }

    /// Unwrap a rewrapped key produced by [`rewrap_to_client`]
    ///
    /// EC keypairs need the session public key from the response.
    pub fn unwrap_rewrapped(
        &self,
        rewrapped_b64: &str,
        session_public_pem: Option<&str>,
    ) -> Result<Vec<u8>, KasError> {
        let blob = BASE64.decode(rewrapped_b64)?;
        match self {
            ClientKeypair::Rsa { private, .. } => {
                let padding = Oaep::new::<Sha256>();
                private
                    .decrypt(padding, &blob)
                    .map_err(|e| KasError::KeyManagement(format!("RSA-OAEP decryption failed: {e}")))
            }
            ClientKeypair::Ec { secret, .. } => {
                let session_pem = session_public_pem.ok_or_else(|| {
                    KasError::Validation("EC unwrap requires the session public key".to_string())
                })?;
                let session_public = P256PublicKey::from_public_key_pem(session_pem)
                    .map_err(|e| KasError::Validation(format!("invalid session public key: {e}")))?;
                let shared = ecdh_secret(secret, &session_public);
                let key = derive_aead_key(&shared, SESSION_SALT_TAG)?;
                aead_open(&key, &blob)
            }
        }
    }
}
