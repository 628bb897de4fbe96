//! ACP-240 Key Access Service server binary
//!
//! Wires the core service from configuration: software key backend, JWKS
//! token verification, HTTP decision point, federation router with the
//! configured peer registry, tracing, and a Prometheus metrics exporter.

mod error;
mod http;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use acp_kas::cache::DecisionCache;
use acp_kas::federation::BreakerConfig;
use acp_kas::{
    AuditLogger, DecisionClient, FederationRouter, HttpDecisionPoint, HttpPeerTransport, KasConfig,
    KeyType, RewrapService, SoftwareKeyBackend, TokenVerifier, TracingSink,
};
use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "acp-kas-server", about = "ACP-240 Key Access Service")]
struct ServerArgs {
    /// Path to the JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind address
    #[arg(long, default_value = "0.0.0.0:8443")]
    bind: String,
    /// External base URL proof-of-possession URLs are checked against
    #[arg(long, default_value = "http://localhost:8443")]
    public_url: String,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("kas server exited with error: {err:#}");
        process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().json())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = ServerArgs::parse();
    let config = match &args.config {
        Some(path) => KasConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => KasConfig::default(),
    };

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;

    let service = Arc::new(build_service(&config).await?);

    let state = http::AppState {
        service: service.clone(),
        metrics: metrics_handle,
        public_url: args.public_url.trim_end_matches('/').to_string(),
    };

    // Periodic cache maintenance off the hot path
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            service.decisions().purge_expired().await;
        }
    });

    let addr: SocketAddr = args.bind.parse().context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(kas_id = %config.kas_id, %addr, peers = config.peers.len(), "KAS server listening");

    axum::serve(listener, http::router(state))
        .await
        .context("serving HTTP")?;
    Ok(())
}

async fn build_service(config: &KasConfig) -> anyhow::Result<RewrapService> {
    let backend = SoftwareKeyBackend::new();
    backend
        .generate(&config.key_handles.ec, KeyType::Ec)
        .await
        .context("generating EC key")?;
    backend
        .generate(&config.key_handles.rsa, KeyType::Rsa)
        .await
        .context("generating RSA key")?;

    let jwks_url = config
        .token
        .jwks_url
        .clone()
        .context("token.jwksUrl is required for the server binary")?;
    let verifier = TokenVerifier::with_jwks(
        config.token.issuer.clone(),
        config.token.audience.clone(),
        config.token.freshness_secs,
        jwks_url,
    );

    let decision_point = Arc::new(HttpDecisionPoint::new(
        config.decision_endpoint.clone(),
        config.deadlines.decision(),
    ));
    let decisions = DecisionClient::new(decision_point, DecisionCache::new(&config.cache_ttl_secs));

    let transport = Arc::new(HttpPeerTransport::new().context("building peer transport")?);
    let federation = Arc::new(FederationRouter::new(
        config.kas_id.clone(),
        transport,
        BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            cooldown: config.breaker.cooldown(),
        },
        config.deadlines.federation(),
    ));
    federation.load_peers(config.peers.clone());

    let audit = AuditLogger::new(Arc::new(TracingSink));

    Ok(RewrapService::new(
        config.clone(),
        verifier,
        decisions,
        Arc::new(backend),
        federation,
        audit,
    ))
}
