//! HTTP endpoints implemented by the x402 **facilitator** (C11).
//!
//! `POST /verify` and `POST /settle` are bearer-authenticated; `GET
//! /supported` is open. Every request is recorded through the
//! [`TrackingEngine`](crate::tracking_engine::TrackingEngine) audit trail
//! when one is configured on the [`FacilitatorState`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use x402_types::chain::ChainId;
use x402_types::facilitator::Facilitator;
use x402_types::proto::{self, ErrorReason, SettleResponse};

use crate::tracking_engine::{
    FinalizeUpdate, RequestInfo, ResourceCallRecord, SettlementUpdate, TrackingEngine,
    VerificationUpdate,
};

/// Paths that require `Authorization: Bearer <token>`.
pub const PROTECTED_PATHS: &[&str] = &["/verify", "/settle"];

/// An error type that can represent an application-level "settlement
/// aborted" outcome rather than a transport failure: the HTTP layer renders
/// these as `200 {success:false, errorReason, network}` instead of a 5xx,
/// per the "aborted settlements are values" propagation policy. Facilitators
/// whose `settle` never fails (e.g. [`FacilitatorLocal`](crate::FacilitatorLocal),
/// whose `Error = Infallible`) never produce one.
pub trait SettlementAbort {
    fn as_aborted(&self) -> Option<(ChainId, ErrorReason)>;
}

impl SettlementAbort for Infallible {
    fn as_aborted(&self) -> Option<(ChainId, ErrorReason)> {
        match *self {}
    }
}

/// Shared state for the facilitator's HTTP routes.
pub struct FacilitatorState<F> {
    pub facilitator: Arc<F>,
    pub tracking: Option<TrackingEngine>,
    pub bearer_tokens: Arc<Vec<String>>,
    pub realm: String,
}

impl<F> Clone for FacilitatorState<F> {
    fn clone(&self) -> Self {
        Self {
            facilitator: self.facilitator.clone(),
            tracking: self.tracking.clone(),
            bearer_tokens: self.bearer_tokens.clone(),
            realm: self.realm.clone(),
        }
    }
}

impl<F> FacilitatorState<F> {
    /// Fails fast (per original §6) if no bearer tokens are configured: an
    /// unauthenticated facilitator would accept `/verify`/`/settle` from
    /// anyone able to reach it.
    pub fn new(
        facilitator: Arc<F>,
        tracking: Option<TrackingEngine>,
        bearer_tokens: Vec<String>,
    ) -> Result<Self, &'static str> {
        if bearer_tokens.is_empty() {
            return Err("at least one bearer token must be configured");
        }
        Ok(Self {
            facilitator,
            tracking,
            bearer_tokens: Arc::new(bearer_tokens),
            realm: "x402-facilitator".to_string(),
        })
    }
}

pub fn router<F>(state: FacilitatorState<F>) -> Router
where
    F: Facilitator + Send + Sync + 'static,
    F::Error: std::fmt::Display + SettlementAbort + Send + Sync,
{
    let protected = Router::new()
        .route("/verify", post(post_verify::<F>))
        .route("/settle", post(post_settle::<F>))
        .route_layer(middleware::from_fn_with_state(state.clone(), bearer_auth::<F>));

    Router::new()
        .merge(protected)
        .route("/supported", get(get_supported::<F>))
        .with_state(state)
}

async fn bearer_auth<F>(
    State(state): State<FacilitatorState<F>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !PROTECTED_PATHS.contains(&path) {
        return next.run(request).await;
    }
    if token_matches(request.headers(), &state.bearer_tokens) {
        return next.run(request).await;
    }
    unauthorized(&state.realm)
}

fn token_matches(headers: &HeaderMap, tokens: &[String]) -> bool {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    tokens.iter().any(|token| token == presented)
}

fn unauthorized(realm: &str) -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized",
            "message": "Valid Bearer token is required",
        })),
    )
        .into_response();
    let header_value = format!("Bearer realm=\"{realm}\"");
    if let Ok(value) = axum::http::HeaderValue::from_str(&header_value) {
        response
            .headers_mut()
            .insert(axum::http::header::WWW_AUTHENTICATE, value);
    }
    response
}

fn new_record(method: &str, path: &str, headers: &HeaderMap) -> ResourceCallRecord {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ResourceCallRecord {
        id: Uuid::new_v4(),
        method: method.to_string(),
        path: path.to_string(),
        route_key: format!("{method} {path}"),
        url: path.to_string(),
        timestamp: x402_types::timestamp::UnixTimestamp::now(),
        payment_required: true,
        payment_verified: false,
        verification_error: None,
        payment: None,
        settlement: None,
        upto_session: None,
        response_status: None,
        response_time_ms: None,
        handler_executed: false,
        request: RequestInfo {
            user_agent,
            ..Default::default()
        },
        route_config: None,
        metadata: None,
        network: None,
        scheme: None,
        asset: None,
        payer: None,
        settlement_success: None,
        x402_version: None,
        payment_nonce: None,
        payment_valid_before: None,
        payload_hash: None,
        requirements_hash: None,
        payment_signature_hash: None,
    }
}

/// `POST /verify`: facilitator-side verification of a proposed x402 payment.
pub async fn post_verify<F>(
    State(state): State<FacilitatorState<F>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse
where
    F: Facilitator,
    F::Error: std::fmt::Display,
{
    let started = Instant::now();
    let record_id = Uuid::new_v4();
    if let Some(tracking) = &state.tracking {
        let mut record = new_record("POST", "/verify", &headers);
        record.id = record_id;
        tracking.create(record);
    }

    let Ok(raw) = serde_json::from_slice::<Box<serde_json::value::RawValue>>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing paymentPayload or paymentRequirements"})),
        )
            .into_response();
    };
    let request = proto::VerifyRequest::from(raw);

    match state.facilitator.verify(&request).await {
        Ok(response) => {
            if let Some(tracking) = &state.tracking {
                tracking.record_verification(
                    record_id,
                    VerificationUpdate {
                        payment_verified: response.is_valid,
                        verification_error: response.invalid_reason.map(|r| format!("{r:?}")),
                        payer: response.payer.clone(),
                        payload: request.payment_payload().ok(),
                        requirements: request.payment_requirements().ok(),
                        ..Default::default()
                    },
                );
                tracking.finalize(
                    record_id,
                    FinalizeUpdate {
                        response_status: Some(StatusCode::OK.as_u16()),
                        response_time_ms: Some(started.elapsed().as_millis() as u64),
                        handler_executed: true,
                    },
                );
            }
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            #[cfg(feature = "telemetry")]
            tracing::warn!(error = %err, "verification failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))).into_response()
        }
    }
}

/// `POST /settle`: facilitator-side execution of a verified x402 payment.
///
/// An error whose [`SettlementAbort::as_aborted`] resolves to `Some` is an
/// application-level rejection, not a transport failure: it is rendered as
/// `200 {success:false, errorReason, network}` rather than a 5xx.
pub async fn post_settle<F>(
    State(state): State<FacilitatorState<F>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse
where
    F: Facilitator,
    F::Error: std::fmt::Display + SettlementAbort,
{
    let started = Instant::now();
    let record_id = Uuid::new_v4();
    if let Some(tracking) = &state.tracking {
        let mut record = new_record("POST", "/settle", &headers);
        record.id = record_id;
        tracking.create(record);
    }

    let Ok(raw) = serde_json::from_slice::<Box<serde_json::value::RawValue>>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing paymentPayload or paymentRequirements"})),
        )
            .into_response();
    };
    let request = proto::SettleRequest::from(raw);

    match state.facilitator.settle(&request).await {
        Ok(response) => {
            if let Some(tracking) = &state.tracking {
                tracking.record_settlement(
                    record_id,
                    SettlementUpdate {
                        settlement: serde_json::to_value(&response).ok(),
                        settlement_success: Some(response.success),
                    },
                );
                tracking.finalize(
                    record_id,
                    FinalizeUpdate {
                        response_status: Some(StatusCode::OK.as_u16()),
                        response_time_ms: Some(started.elapsed().as_millis() as u64),
                        handler_executed: true,
                    },
                );
            }
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            if let Some((network, reason)) = err.as_aborted() {
                let response = SettleResponse::failed(network, reason, None);
                if let Some(tracking) = &state.tracking {
                    tracking.record_settlement(
                        record_id,
                        SettlementUpdate {
                            settlement: serde_json::to_value(&response).ok(),
                            settlement_success: Some(false),
                        },
                    );
                    tracking.finalize(
                        record_id,
                        FinalizeUpdate {
                            response_status: Some(StatusCode::OK.as_u16()),
                            response_time_ms: Some(started.elapsed().as_millis() as u64),
                            handler_executed: true,
                        },
                    );
                }
                return (StatusCode::OK, Json(response)).into_response();
            }
            #[cfg(feature = "telemetry")]
            tracing::warn!(error = %err, "settlement failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))).into_response()
        }
    }
}

/// `GET /supported`: lists the schemes/networks this facilitator handles,
/// after forcing `x402Version = 1` on any bare (non-CAIP-2) legacy network.
pub async fn get_supported<F>(State(state): State<FacilitatorState<F>>) -> impl IntoResponse
where
    F: Facilitator,
    F::Error: std::fmt::Display,
{
    match state.facilitator.supported().await {
        Ok(supported) => (StatusCode::OK, Json(supported.normalize_legacy_versions())).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator_local::FacilitatorLocal;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use x402_types::chain::ChainIdPattern;
    use x402_types::proto::VerifyResponse;
    use x402_types::scheme::{SchemeBlueprints, SchemeFacilitator, SchemeFacilitatorBuilder, SchemeRegistry};

    #[derive(Debug)]
    struct EchoScheme;

    #[async_trait]
    impl SchemeFacilitator for EchoScheme {
        fn scheme(&self) -> &'static str {
            "exact"
        }
        async fn verify(&self, _payload: &Value, _requirements: &Value) -> VerifyResponse {
            VerifyResponse::valid("0xpayer")
        }
        async fn settle(&self, _payload: &Value, _requirements: &Value) -> SettleResponse {
            SettleResponse::success(ChainId::new("eip155", "8453"), "0xtx", "0xpayer")
        }
        fn signers(&self, _network: &ChainId) -> Vec<String> {
            vec!["0xsigner".into()]
        }
    }

    struct EchoBlueprint;
    impl SchemeFacilitatorBuilder<()> for EchoBlueprint {
        fn scheme(&self) -> &'static str {
            "exact"
        }
        fn network_pattern(&self) -> ChainIdPattern {
            ChainIdPattern::wildcard("eip155")
        }
        fn build(
            &self,
            _provider: &(),
            _config: Option<Value>,
        ) -> Result<Arc<dyn SchemeFacilitator>, Box<dyn std::error::Error>> {
            Ok(Arc::new(EchoScheme))
        }
    }

    fn build_state() -> FacilitatorState<FacilitatorLocal> {
        let base = ChainId::new("eip155", "8453");
        let blueprints = SchemeBlueprints::new().and_register(EchoBlueprint);
        let registry = SchemeRegistry::build(&[(base.clone(), ())], &blueprints).unwrap();
        let facilitator = Arc::new(FacilitatorLocal::new(registry, vec![base]));
        FacilitatorState::new(facilitator, None, vec!["secret".to_string()]).unwrap()
    }

    fn body() -> Body {
        Body::from(
            serde_json::json!({
                "x402Version": 2,
                "paymentPayload": {"accepted": {"network": "eip155:8453", "scheme": "exact"}},
                "paymentRequirements": {
                    "scheme": "exact",
                    "network": "eip155:8453",
                    "amount": "100",
                    "payTo": "0x0000000000000000000000000000000000000002",
                    "maxTimeoutSeconds": 60,
                    "asset": "0x0000000000000000000000000000000000000003"
                }
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn verify_without_bearer_token_is_unauthorized() {
        let app = router(build_state());
        let response = app
            .oneshot(
                Request::post("/verify")
                    .header("content-type", "application/json")
                    .body(body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn verify_with_bearer_token_succeeds() {
        let app = router(build_state());
        let response = app
            .oneshot(
                Request::post("/verify")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer secret")
                    .body(body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn supported_does_not_require_bearer_token() {
        let app = router(build_state());
        let response = app
            .oneshot(Request::get("/supported").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
