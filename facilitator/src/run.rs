//! x402 Facilitator HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server that exposes the x402 protocol interface
//! for payment verification and settlement via EIP-155 (EVM-compatible) networks, alongside
//! the background upto-session sweeper (C9) and tracking-store auto-prune (C10).
//!
//! Endpoints:
//! - `GET /supported` – List supported payment kinds (version/scheme/network)
//! - `POST /verify` – Verify a payment payload against requirements
//! - `POST /settle` – Settle an accepted payment payload on-chain
//!
//! This server includes:
//! - OpenTelemetry tracing via `TraceLayer`
//! - CORS support for cross-origin clients
//! - Ethereum provider cache for per-network RPC routing
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `BEARER_TOKEN` / `BEARER_TOKENS` gate `/verify` and `/settle`
//! - `OTEL_*` variables enable tracing to systems like Honeycomb

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;

use x402_chain_eip155::chain::Eip155ChainProvider;
use x402_chain_eip155::{ExactEip155Blueprint, UptoEip155Blueprint};
use x402_facilitator_local::handlers::{self, FacilitatorState};
use x402_facilitator_local::session_store::{InMemoryUptoSessionStore, UptoSessionStore};
use x402_facilitator_local::sweeper::{NoopLock, UptoSweeper};
use x402_facilitator_local::tracking_engine::{InMemoryTrackingStore, TrackingEngine, TrackingStore};
use x402_facilitator_local::util::SigDown;
use x402_facilitator_local::FacilitatorLocal;
use x402_types::chain::{ChainId, ChainRegistry, FromConfig};
use x402_types::scheme::{SchemeBlueprints, SchemeRegistry};

#[cfg(feature = "telemetry")]
use x402_facilitator_local::util::Telemetry;

use crate::config::Config;

/// How often the upto sweeper checks for expired sessions (original §9 default).
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How long to keep tracking records before auto-pruning them.
const TRACKING_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the auto-prune tick runs.
const TRACKING_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Initializes the x402 facilitator server.
///
/// - Loads `.env` variables.
/// - Initializes OpenTelemetry tracing.
/// - Connects to EIP-155 providers for configured networks and registers the
///   `exact`/`upto` schemes against them.
/// - Starts the upto sweeper and tracking auto-prune background tasks.
/// - Starts an Axum HTTP server with the x402 protocol handlers.
///
/// Binds to the address specified by the `HOST` and `PORT` env vars.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize rustls crypto provider (ring)
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("Failed to initialize rustls crypto provider");

    // Load .env variables
    dotenv().ok();

    #[cfg(feature = "telemetry")]
    let telemetry_layer = {
        let telemetry = Telemetry::new()
            .with_name(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .register();
        telemetry.http_tracing()
    };

    let config = Config::load()?;

    let chain_registry: ChainRegistry<Arc<Eip155ChainProvider>> =
        ChainRegistry::from_config(config.chains()).await?;
    let known_networks: Vec<(ChainId, Arc<Eip155ChainProvider>)> = chain_registry
        .iter()
        .map(|(chain_id, provider)| (chain_id.clone(), provider.clone()))
        .collect();
    let known_chain_ids = chain_registry.chain_ids();

    let scheme_blueprints = SchemeBlueprints::new()
        .and_register(ExactEip155Blueprint)
        .and_register(UptoEip155Blueprint);
    let scheme_registry = SchemeRegistry::build(&known_networks, &scheme_blueprints)?;

    let facilitator = Arc::new(FacilitatorLocal::new(scheme_registry, known_chain_ids));

    let tracking_store: Arc<dyn TrackingStore> = Arc::new(InMemoryTrackingStore::new());
    let tracking_engine = TrackingEngine::new(tracking_store);

    let upto_store: Arc<dyn UptoSessionStore> = Arc::new(InMemoryUptoSessionStore::new());
    let sweeper = UptoSweeper::new(upto_store, Arc::new(NoopLock), SWEEP_INTERVAL);

    let facilitator_state = FacilitatorState::new(
        facilitator,
        Some(tracking_engine.clone()),
        config.bearer_tokens().to_vec(),
    )?;

    let http_endpoints = Router::new().merge(handlers::router(facilitator_state));
    #[cfg(feature = "telemetry")]
    let http_endpoints = http_endpoints.layer(telemetry_layer);
    let http_endpoints = http_endpoints.layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host(), config.port());
    #[cfg(feature = "telemetry")]
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await;
    #[cfg(feature = "telemetry")]
    let listener = listener.inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e));
    let listener = listener?;

    let sig_down = SigDown::try_new()?;
    let cancellation = sig_down.cancellation_token();

    tokio::spawn(sweeper.run(cancellation.clone()));
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            tracking_engine
                .run_auto_prune(TRACKING_RETENTION, TRACKING_PRUNE_INTERVAL, cancellation)
                .await
        }
    });

    let axum_graceful_shutdown = async move { cancellation.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
