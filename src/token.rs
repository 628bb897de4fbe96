//! Bearer token and proof-of-possession verification
//!
//! Access tokens are ES256 compact JWTs verified against either a static
//! verifying key or a JWKS endpoint with an in-process cache. The token must
//! carry a confirmation claim (`cnf.jkt`) naming the thumbprint of the
//! client's proof key; each request then presents a DPoP-style proof JWS
//! signed by that key and bound to the live request's method and URL, with a
//! short freshness window to stop replay.
//!
//! Every failure here is an `AuthenticationError` and rejects the whole
//! request before any key access object is touched.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::KasError;

/// Allowed forward clock skew on proof timestamps, seconds
const IAT_LEEWAY_SECS: i64 = 5;

/// The authenticated caller, as asserted by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    /// Stable subject identifier (`sub` claim)
    pub id: String,
    /// Attributes forwarded verbatim to the decision point
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// The live request a proof must be bound to
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct JoseHeader {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    jwk: Option<EcJwk>,
}

/// An EC P-256 key in JWK form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    iss: String,
    aud: String,
    exp: i64,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    cnf: Option<Confirmation>,
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    jkt: String,
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    htm: String,
    htu: String,
    iat: i64,
    jti: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<EcJwk>,
}

/// Where access-token verifying keys come from
pub enum KeySource {
    /// A single pinned verifying key (tests, single-issuer deployments)
    Static(VerifyingKey),
    /// JWKS endpoint with a kid-indexed cache, refreshed on miss
    Jwks {
        url: String,
        client: reqwest::Client,
        cache: RwLock<HashMap<String, VerifyingKey>>,
    },
}

/// Verifies bearer tokens and their proof-of-possession
pub struct TokenVerifier {
    issuer: String,
    audience: String,
    freshness_secs: i64,
    source: KeySource,
}

impl TokenVerifier {
    /// Verifier pinned to a single known key
    pub fn with_static_key(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        freshness_secs: i64,
        key: VerifyingKey,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            freshness_secs,
            source: KeySource::Static(key),
        }
    }

    /// Verifier backed by a JWKS endpoint
    pub fn with_jwks(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        freshness_secs: i64,
        jwks_url: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            freshness_secs,
            source: KeySource::Jwks {
                url: jwks_url.into(),
                client: reqwest::Client::new(),
                cache: RwLock::new(HashMap::new()),
            },
        }
    }

    /// Verify a bearer token and its proof against the live request
    pub async fn verify(
        &self,
        bearer: &str,
        proof: &str,
        ctx: &RequestContext,
    ) -> Result<Subject, KasError> {
        let (header, signing_input, signature, payload) = split_compact(bearer)?;
        if header.alg != "ES256" {
            return Err(unauthorized("unsupported signing algorithm"));
        }

        let key = self.lookup_key(&header).await?;
        key.verify(signing_input.as_bytes(), &signature)
            .map_err(|_| unauthorized("token signature verification failed"))?;

        let claims: AccessClaims =
            serde_json::from_slice(&payload).map_err(|_| unauthorized("invalid token payload"))?;
        self.validate_claims(&claims)?;

        let jkt = claims
            .cnf
            .as_ref()
            .map(|c| c.jkt.as_str())
            .ok_or_else(|| unauthorized("token missing key confirmation (cnf.jkt)"))?;

        self.verify_proof(proof, jkt, ctx)?;

        Ok(Subject {
            id: claims.sub,
            attributes: claims.attributes,
        })
    }

    fn validate_claims(&self, claims: &AccessClaims) -> Result<(), KasError> {
        let now = Utc::now().timestamp();
        if claims.exp <= now {
            return Err(unauthorized("token expired"));
        }
        if claims.nbf.is_some_and(|nbf| nbf > now + IAT_LEEWAY_SECS) {
            return Err(unauthorized("token not yet valid"));
        }
        if claims.iss != self.issuer {
            return Err(unauthorized("invalid issuer"));
        }
        if claims.aud != self.audience {
            return Err(unauthorized("invalid audience"));
        }
        Ok(())
    }

    fn verify_proof(&self, proof: &str, jkt: &str, ctx: &RequestContext) -> Result<(), KasError> {
        let (header, signing_input, signature, payload) = split_compact(proof)?;
        if header.alg != "ES256" {
            return Err(unauthorized("unsupported proof algorithm"));
        }
        if header.typ.as_deref() != Some("dpop+jwt") {
            return Err(unauthorized("proof is not a dpop+jwt"));
        }
        let jwk = header
            .jwk
            .as_ref()
            .ok_or_else(|| unauthorized("proof missing embedded key"))?;

        let key = verifying_key_from_jwk(jwk)?;
        key.verify(signing_input.as_bytes(), &signature)
            .map_err(|_| unauthorized("proof signature verification failed"))?;

        // The proof key must be the one the token was bound to
        if jwk_thumbprint(jwk) != jkt {
            return Err(unauthorized("proof key does not match token binding"));
        }

        let claims: ProofClaims =
            serde_json::from_slice(&payload).map_err(|_| unauthorized("invalid proof payload"))?;
        if !claims.htm.eq_ignore_ascii_case(&ctx.method) {
            return Err(unauthorized("proof bound to a different method"));
        }
        if claims.htu != ctx.url {
            return Err(unauthorized("proof bound to a different URL"));
        }
        if claims.jti.is_empty() {
            return Err(unauthorized("proof missing jti"));
        }

        let now = Utc::now().timestamp();
        if claims.iat > now + IAT_LEEWAY_SECS {
            return Err(unauthorized("proof issued in the future"));
        }
        if now - claims.iat > self.freshness_secs {
            return Err(unauthorized("proof outside freshness window"));
        }
        Ok(())
    }

    async fn lookup_key(&self, header: &JoseHeader) -> Result<VerifyingKey, KasError> {
        match &self.source {
            KeySource::Static(key) => Ok(*key),
            KeySource::Jwks { url, client, cache } => {
                let kid = header
                    .kid
                    .clone()
                    .ok_or_else(|| unauthorized("token missing key identifier (kid)"))?;

                if let Some(existing) = cache.read().await.get(&kid).copied() {
                    return Ok(existing);
                }

                let jwks = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| unauthorized(format!("failed to fetch JWKS: {e}")))?
                    .error_for_status()
                    .map_err(|e| unauthorized(format!("invalid JWKS response: {e}")))?
                    .json::<JwksDocument>()
                    .await
                    .map_err(|e| unauthorized(format!("failed to decode JWKS: {e}")))?;

                let mut cache_guard = cache.write().await;
                tracing::debug!(url = %url, keys = jwks.keys.len(), "refreshing JWKS cache");
                for jwk in &jwks.keys {
                    let Some(key_id) = jwk.kid.clone() else {
                        continue;
                    };
                    if let Ok(key) = verifying_key_from_jwk(jwk) {
                        cache_guard.insert(key_id, key);
                    }
                }

                cache_guard
                    .get(&kid)
                    .copied()
                    .ok_or_else(|| unauthorized("unable to locate signing key for token"))
            }
        }
    }
}

fn unauthorized(message: impl Into<String>) -> KasError {
    KasError::Authentication(message.into())
}

/// Split a compact JWS and parse its header
fn split_compact(token: &str) -> Result<(JoseHeader, String, Signature, Vec<u8>), KasError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(unauthorized("missing token"));
    }
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(unauthorized("invalid token format"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(segments[0])
        .map_err(|_| unauthorized("invalid token header"))?;
    let header: JoseHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| unauthorized("invalid token header"))?;

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|_| unauthorized("invalid token payload"))?;

    let signature_bytes = URL_SAFE_NO_PAD
        .decode(segments[2])
        .map_err(|_| unauthorized("invalid token signature"))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| unauthorized("invalid token signature"))?;

    let signing_input = format!("{}.{}", segments[0], segments[1]);
    Ok((header, signing_input, signature, payload))
}

/// RFC 7638 thumbprint of an EC JWK: SHA-256 over the canonical members
pub fn jwk_thumbprint(jwk: &EcJwk) -> String {
    let canonical = format!(
        r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
        jwk.crv, jwk.kty, jwk.x, jwk.y
    );
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

fn verifying_key_from_jwk(jwk: &EcJwk) -> Result<VerifyingKey, KasError> {
    if jwk.kty != "EC" || jwk.crv != "P-256" {
        return Err(unauthorized("proof key must be EC P-256"));
    }
    let x = URL_SAFE_NO_PAD
        .decode(&jwk.x)
        .map_err(|_| unauthorized("invalid JWK x coordinate"))?;
    let y = URL_SAFE_NO_PAD
        .decode(&jwk.y)
        .map_err(|_| unauthorized("invalid JWK y coordinate"))?;
    if x.len() != 32 || y.len() != 32 {
        return Err(unauthorized("invalid JWK coordinate length"));
    }

    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&x),
        p256::FieldBytes::from_slice(&y),
        false,
    );
    let key: Option<VerifyingKey> = VerifyingKey::from_encoded_point(&point).ok();
    key.ok_or_else(|| unauthorized("JWK does not encode a valid P-256 point"))
}
