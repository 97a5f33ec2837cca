//! Axum middleware for enforcing [x402](https://www.x402.org) payments on protected routes.
//!
//! This middleware validates incoming `X-Payment` headers using a configured x402 facilitator.
//! For the `exact` scheme it settles the payment after your handler runs (or before, if
//! configured); for the `upto` scheme it tracks accrual against a local session store and
//! leaves settlement to the sweeper (see [`crate::paygate`]).
//!
//! Returns a `402 Payment Required` JSON response if the request lacks a valid payment.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use axum::{Router, routing::get, Json};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use serde_json::json;
//! use x402_axum::layer::X402Middleware;
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
//! ## Configuration Notes
//!
//! - **[`X402Middleware::with_price_tag`]** sets the assets and amounts accepted for payment.
//! - **[`X402Middleware::with_description`]** and **[`X402Middleware::with_mime_type`]** are optional but help the payer understand what is being paid for.
//! - **[`X402Middleware::with_resource`]** explicitly sets the full URI of the protected resource.
//!   This avoids recomputing the resource URL on every request and should be preferred when possible.
//! - If `with_resource` is **not** used, the middleware will compute the resource URI dynamically from the request
//!   and a base URL set via **[`X402Middleware::with_base_url`]**.
//! - If no base URL is provided, the default is `http://localhost/` (avoid this in production).
//! - **[`X402Middleware::with_upto_store`]** must be called for routes that accept the `upto` scheme;
//!   without it, an `upto` payload is rejected as if the route didn't accept that scheme.

use axum_core::{extract::Request, response::Response};
use std::collections::HashSet;
use std::sync::Arc;
use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;

use x402_facilitator_local::session_store::UptoSessionStore;
use x402_types::facilitator::Facilitator;
use x402_types::proto::v2;

use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use crate::paygate::{DEFAULT_DEADLINE_BUFFER_SECS, Paygate};

/// Middleware layer that enforces x402 payment verification and settlement.
///
/// Wraps an Axum service, intercepts incoming HTTP requests, gates them
/// behind a matching accepted payment, and forwards to the inner service.
#[derive(Clone)]
pub struct X402Middleware<F> {
    facilitator: Arc<F>,
    description: String,
    mime_type: String,
    resource: Option<Url>,
    base_url: Option<Url>,
    price_tags: Vec<v2::PriceTag>,
    settle_before_execution: bool,
    deadline_buffer_secs: u64,
    upto_store: Option<Arc<dyn UptoSessionStore>>,
}

impl TryFrom<&str> for X402Middleware<FacilitatorClient> {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let facilitator = FacilitatorClient::try_from(value)?;
        Ok(X402Middleware::new(facilitator))
    }
}

impl TryFrom<String> for X402Middleware<FacilitatorClient> {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        X402Middleware::try_from(value.as_str())
    }
}

impl<F> X402Middleware<F> {
    pub fn new(facilitator: F) -> Self {
        Self {
            facilitator: Arc::new(facilitator),
            description: String::new(),
            mime_type: "application/json".to_string(),
            resource: None,
            base_url: None,
            price_tags: Vec::new(),
            settle_before_execution: false,
            deadline_buffer_secs: DEFAULT_DEADLINE_BUFFER_SECS,
            upto_store: None,
        }
    }

    fn base_url(&self) -> Url {
        self.base_url
            .clone()
            .unwrap_or_else(|| Url::parse("http://localhost/").unwrap())
    }

    /// Sets the description sent back in the 402 response body.
    pub fn with_description(&self, description: &str) -> Self {
        let mut this = self.clone();
        this.description = description.to_string();
        this
    }

    /// Sets the MIME type of the protected resource.
    pub fn with_mime_type(&self, mime: &str) -> Self {
        let mut this = self.clone();
        this.mime_type = mime.to_string();
        this
    }

    /// Sets the resource URL directly, avoiding per-request auto-detection.
    pub fn with_resource(&self, resource: Url) -> Self {
        let mut this = self.clone();
        this.resource = Some(resource);
        this
    }

    /// Sets the base URL used to construct the resource URL dynamically.
    pub fn with_base_url(&self, base_url: Url) -> Self {
        let mut this = self.clone();
        this.base_url = Some(base_url);
        this
    }

    /// Replaces all accepted price tags with the provided value(s).
    pub fn with_price_tag<T: Into<Vec<v2::PriceTag>>>(&self, price_tag: T) -> Self {
        let mut this = self.clone();
        this.price_tags = price_tag.into();
        this
    }

    /// Adds new price tags to the existing list, skipping duplicates by
    /// `(scheme, network, asset)`.
    pub fn or_price_tag<T: Into<Vec<v2::PriceTag>>>(&self, price_tag: T) -> Self {
        let mut this = self.clone();
        let mut seen: HashSet<(String, String, String)> = this
            .price_tags
            .iter()
            .map(|pt| {
                (
                    pt.requirements.scheme.clone(),
                    pt.requirements.network.to_string(),
                    pt.requirements.asset.clone(),
                )
            })
            .collect();
        for tag in price_tag.into() {
            let key = (
                tag.requirements.scheme.clone(),
                tag.requirements.network.to_string(),
                tag.requirements.asset.clone(),
            );
            if seen.insert(key) {
                this.price_tags.push(tag);
            }
        }
        this
    }

    /// Settles `exact` payments before the inner handler runs instead of after.
    pub fn with_settle_before_execution(&self, settle_before_execution: bool) -> Self {
        let mut this = self.clone();
        this.settle_before_execution = settle_before_execution;
        this
    }

    /// Overrides the default deadline buffer used when tracking `upto` accrual.
    pub fn with_deadline_buffer_secs(&self, seconds: u64) -> Self {
        let mut this = self.clone();
        this.deadline_buffer_secs = seconds;
        this
    }

    /// Enables the `upto` scheme on this route, backed by `store`.
    pub fn with_upto_store(&self, store: Arc<dyn UptoSessionStore>) -> Self {
        let mut this = self.clone();
        this.upto_store = Some(store);
        this
    }

    fn resource_info(&self, req: &Request) -> v2::ResourceInfo {
        let url = self.resource.clone().unwrap_or_else(|| {
            let mut url = self.base_url();
            url.set_path(req.uri().path());
            url.set_query(req.uri().query());
            url
        });
        v2::ResourceInfo {
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            url: url.to_string(),
        }
    }
}

impl X402Middleware<FacilitatorClient> {
    pub fn facilitator_url(&self) -> &Url {
        self.facilitator.base_url()
    }
}

impl<S, F> Layer<S> for X402Middleware<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + Send + Sync + 'static,
{
    type Service = X402MiddlewareService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        X402MiddlewareService {
            middleware: self.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Wraps a cloned inner Axum service and augments it with payment enforcement logic.
#[derive(Clone)]
pub struct X402MiddlewareService<F> {
    middleware: X402Middleware<F>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Service<Request> for X402MiddlewareService<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let resource = self.middleware.resource_info(&req);
        let paygate = Paygate {
            facilitator: self.middleware.facilitator.clone(),
            settle_before_execution: self.middleware.settle_before_execution,
            accepts: Arc::new(self.middleware.price_tags.clone()),
            resource,
            upto_store: self.middleware.upto_store.clone(),
            deadline_buffer_secs: self.middleware.deadline_buffer_secs,
        };
        let inner = self.inner.clone();
        Box::pin(async move { paygate.handle_request(inner, req).await })
    }
}

#[async_trait::async_trait]
impl<F> Facilitator for Arc<F>
where
    F: Facilitator + Send + Sync,
{
    type Error = F::Error;

    async fn verify(
        &self,
        request: &x402_types::proto::VerifyRequest,
    ) -> Result<x402_types::proto::VerifyResponse, Self::Error> {
        F::verify(self, request).await
    }

    async fn settle(
        &self,
        request: &x402_types::proto::SettleRequest,
    ) -> Result<x402_types::proto::SettleResponse, Self::Error> {
        F::settle(self, request).await
    }

    async fn supported(&self) -> Result<x402_types::proto::SupportedResponse, Self::Error> {
        F::supported(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_core::body::Body;

    #[test]
    fn or_price_tag_skips_duplicates() {
        let network = x402_types::chain::ChainId::new("eip155", "8453");
        let tag = v2::PriceTag::new(v2::PaymentRequirements {
            scheme: "exact".to_string(),
            network: network.clone(),
            amount: "1000".to_string(),
            pay_to: "0xpayto".to_string(),
            max_timeout_seconds: 300,
            asset: "0xusdc".to_string(),
            extra: None,
        });
        let middleware =
            X402Middleware::new(FacilitatorClient::try_new(Url::parse("http://localhost/").unwrap()).unwrap())
                .with_price_tag(vec![tag.clone()])
                .or_price_tag(vec![tag]);
        assert_eq!(middleware.price_tags.len(), 1);
    }

    #[test]
    fn resource_info_falls_back_to_localhost_without_base_url() {
        let middleware =
            X402Middleware::new(FacilitatorClient::try_new(Url::parse("http://localhost/").unwrap()).unwrap());
        let req = Request::builder()
            .uri("/protected?x=1")
            .body(Body::empty())
            .unwrap();
        let resource = middleware.resource_info(&req);
        assert_eq!(resource.url, "http://localhost/protected?x=1");
    }
}
