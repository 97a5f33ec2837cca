#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Local facilitator implementation for the x402 payment protocol.
//!
//! This crate provides [`FacilitatorLocal`], a [`Facilitator`](x402_types::facilitator::Facilitator)
//! implementation that routes verify/settle requests to registered scheme
//! handlers, plus the supporting engine components: upto-session tracking,
//! a background sweeper, and a request-tracking audit trail.
//!
//! # Architecture
//!
//! 1. **Scheme Registry** ([`x402_types::scheme::SchemeRegistry`]): built by a
//!    chain crate (e.g. `x402-chain-eip155`) from its scheme blueprints.
//! 2. **[`FacilitatorLocal`]**: routes a verify/settle request to the
//!    registered handler for its `(network, scheme)` pair.
//! 3. **[`session_store`]**: tracks the running total consumed against each
//!    upto-scheme session's cap.
//! 4. **[`sweeper`]**: periodically closes upto sessions past their deadline.
//! 5. **[`tracking_engine`]**: records an audit trail of every request
//!    reaching the HTTP pipeline.
//! 6. **[`handlers`]**: the `/verify`, `/settle`, `/supported` HTTP endpoints.
//!
//! # Modules
//!
//! - [`facilitator_local`] - Core facilitator implementation
//! - [`session_store`] - Upto session cap tracking
//! - [`sweeper`] - Background upto session expiry sweep
//! - [`tracking_engine`] - Request audit trail
//! - [`handlers`] - HTTP endpoints for the x402 protocol
//! - [`util`] - Utilities for graceful shutdown and telemetry
//!
//! # Example
//!
//! ```ignore
//! use x402_facilitator_local::{FacilitatorLocal, handlers};
//! use x402_types::scheme::{SchemeBlueprints, SchemeRegistry};
//! use x402_chain_eip155::{ExactEip155Blueprint, UptoEip155Blueprint};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let blueprints = SchemeBlueprints::new()
//!         .and_register(ExactEip155Blueprint)
//!         .and_register(UptoEip155Blueprint);
//!
//!     let registry = SchemeRegistry::build(&known_networks, &blueprints)?;
//!     let facilitator = Arc::new(FacilitatorLocal::new(registry, known_networks));
//!
//!     let app = handlers::router(facilitator);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8090").await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod facilitator_local;
pub mod handlers;
pub mod session_store;
pub mod sweeper;
pub mod tracking_engine;
pub mod util;

pub use facilitator_local::*;
pub use handlers::*;
