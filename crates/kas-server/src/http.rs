//! HTTP surface: the rewrap endpoint, the peer federation endpoint, health
//! and metrics
//!
//! The rewrap endpoint returns 200 for any request that was processed, even
//! when every object inside failed; 400/401/429/503 are reserved for
//! request-level rejections that happened before per-object work.

use std::sync::Arc;

use acp_kas::{PeerRewrapRequest, RequestMeta, RewrapRequest, RewrapService};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use sha2::{Digest, Sha256};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::AppError;

const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RewrapService>,
    pub metrics: PrometheusHandle,
    /// External base URL proof-of-possession URLs are checked against
    pub public_url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v2/rewrap", post(rewrap))
        .route("/v2/rewrap/peer", post(rewrap_peer))
        .route("/healthz", get(health_check))
        .route("/metrics", get(export_metrics))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn export_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Client rewrap endpoint
async fn rewrap(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let correlation_id = correlation_id(&headers);
    let bearer = bearer_token(&headers).unwrap_or_default().to_string();
    let proof = header_value(&headers, "dpop").unwrap_or_default().to_string();

    let meta = RequestMeta {
        client_id: client_bucket(&bearer),
        correlation_id: correlation_id.clone(),
        method: "POST".to_string(),
        url: format!("{}/v2/rewrap", state.public_url),
        body_bytes: body.len(),
    };

    let request: RewrapRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::new(e.into(), correlation_id.clone()))?;

    let span = tracing::info_span!(
        "rewrap",
        correlation_id = %correlation_id,
        entries = request.requests.len()
    );
    let response = async {
        state
            .service
            .handle(&meta, &bearer, &proof, request)
            .await
    }
    .instrument(span)
    .await
    .map_err(|err| AppError::new(err, correlation_id))?;

    Ok((StatusCode::OK, Json(response)))
}

/// Peer federation endpoint; mutual authentication happens at the TLS layer
async fn rewrap_peer(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let correlation_id = correlation_id(&headers);
    let request: PeerRewrapRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::new(e.into(), correlation_id.clone()))?;

    let meta = RequestMeta {
        client_id: format!("peer:{}", request.origin_kas),
        correlation_id: correlation_id.clone(),
        method: "POST".to_string(),
        url: format!("{}/v2/rewrap/peer", state.public_url),
        body_bytes: body.len(),
    };

    let span = tracing::info_span!(
        "rewrap_peer",
        correlation_id = %correlation_id,
        origin = %request.origin_kas
    );
    let response = async { state.service.handle_peer(&meta, request).await }
        .instrument(span)
        .await;

    Ok((StatusCode::OK, Json(response)))
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = header_value(headers, "authorization")?.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
}

/// Rate-limit bucket key: a digest of the presented credential
///
/// Runs before token verification so load shedding stays cheap; unauthenticated
/// callers share one bucket and are rejected at verification anyway.
fn client_bucket(bearer: &str) -> String {
    if bearer.is_empty() {
        return "anonymous".to_string();
    }
    hex::encode(&Sha256::digest(bearer.as_bytes())[..8])
}
