//! x402 Facilitator HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server that exposes the x402 protocol interface
//! for payment verification and settlement on EIP-155 (EVM-compatible) networks, plus the
//! background upto-session sweeper and tracking-store auto-prune tasks.
//!
//! Endpoints:
//! - `GET /supported` – List supported payment kinds (version/scheme/network)
//! - `POST /verify` – Verify a payment payload against requirements
//! - `POST /settle` – Settle an accepted payment payload on-chain
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `BEARER_TOKEN` / `BEARER_TOKENS` gate `/verify` and `/settle`
//! - `OTEL_*` variables enable tracing to systems like Honeycomb

mod chain;
mod config;
mod run;

use std::process;

use crate::run::run;

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(e) = result {
        println!("{e}");
        process::exit(1)
    }
}
