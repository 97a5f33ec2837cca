#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Axum middleware for enforcing [x402](https://www.x402.org) payments on protected routes.
//!
//! This middleware validates incoming `X-Payment` headers using a configured x402 facilitator.
//! For the `exact` scheme it settles the payment after your handler runs (or before, if
//! configured); for the `upto` scheme it tracks accrual against a local session store and
//! leaves settlement to the sweeper.
//!
//! Returns a `402 Payment Required` response if the request lacks a valid payment.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use axum::{Router, routing::get, Json};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use serde_json::json;
//! use x402_axum::X402Middleware;
//! use x402_types::chain::ChainId;
//! use x402_types::proto::v2::PriceTag;
//!
//! let x402 = X402Middleware::try_from("https://facilitator.example/").unwrap();
//! let price_tag = PriceTag::new(x402_types::proto::v2::PaymentRequirements {
//!     scheme: "exact".to_string(),
//!     network: ChainId::new("eip155", "84532"),
//!     amount: "25000".to_string(),
//!     pay_to: "0xADDRESS".to_string(),
//!     max_timeout_seconds: 300,
//!     asset: "0xUSDC".to_string(),
//!     extra: None,
//! });
//!
//! let app: Router = Router::new().route(
//!     "/protected",
//!     get(my_handler).layer(
//!         x402.with_description("Access to /protected")
//!             .with_price_tag(vec![price_tag]),
//!     ),
//! );
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, Json(json!({ "hello": "world" })))
//! }
//! ```
//!
//! See [`X402Middleware`] for full configuration options.
//! For low-level interaction with the facilitator, see [`facilitator_client::FacilitatorClient`].
//!
//! ## Scheme Support
//!
//! Both `exact` (one-shot) and `upto` (accruing session) schemes are supported per route;
//! see [`X402Middleware::with_upto_store`] to enable the latter.
//!
//! ## Settlement Timing
//!
//! By default, `exact` settlement occurs **after** the request is processed.
//! **[`X402Middleware::with_settle_before_execution`]** switches to settling **before**
//! request execution, which avoids running the handler on a payment that later fails to settle.
//!
//! ## Configuration Notes
//!
//! - **[`X402Middleware::with_price_tag`]** / **[`X402Middleware::or_price_tag`]** set the
//!   assets, networks and amounts accepted for payment.
//! - **[`X402Middleware::with_description`]** and **[`X402Middleware::with_mime_type`]** are
//!   optional but help the payer understand what is being paid for.
//! - **[`X402Middleware::with_resource`]** explicitly sets the full URI of the protected
//!   resource, avoiding recomputation on every request.
//! - **[`X402Middleware::with_base_url`]** sets the base URL used to compute the resource URI
//!   when `with_resource` isn't used. Defaults to `http://localhost/` (avoid in production).
//! - **[`X402Middleware::with_upto_store`]** must be called for routes that accept the `upto`
//!   scheme.

pub mod facilitator_client;
pub mod layer;
pub mod paygate;

pub use layer::X402Middleware;
pub use paygate::{Paygate, PaygateError, DEFAULT_DEADLINE_BUFFER_SECS};
