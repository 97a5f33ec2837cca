//! Payment gate for the v2 (CAIP-2) x402 wire protocol.
//!
//! This module handles the two schemes a paid route can accept:
//!
//! - `exact`: a one-shot payment. The payload is verified with the
//!   facilitator before the inner handler runs, then settled after it
//!   responds (or before, if `settle_before_execution` is set).
//! - `upto`: an accumulating session. The payload is tracked against a
//!   local [`UptoSessionStore`] (no facilitator round-trip); settlement is
//!   left to the sweeper running alongside the facilitator. On success the
//!   response carries `X-Upto-Session-Id` so the caller can correlate future
//!   calls with the session.

use axum_core::body::Body;
use axum_core::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tower::Service;

#[cfg(feature = "telemetry")]
use tracing::Instrument;
#[cfg(feature = "telemetry")]
use tracing::instrument;

use x402_facilitator_local::session_store::{UptoSession, UptoSessionStore};
use x402_types::facilitator::Facilitator;
use x402_types::proto::{self, v2};
use x402_types::timestamp::UnixTimestamp;
use x402_types::util::Base64Bytes;

/// Default buffer (seconds) before a session's deadline at which new
/// accrual is refused, matching the upto tracking table's default.
pub const DEFAULT_DEADLINE_BUFFER_SECS: u64 = 60;

pub const PAYMENT_HEADER: &str = "X-Payment";
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";
pub const UPTO_SESSION_HEADER: &str = "X-Upto-Session-Id";

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while gating a request behind a payment.
#[derive(Debug, thiserror::Error)]
pub enum PaygateError {
    #[error("{0} header is required")]
    PaymentHeaderRequired(&'static str),
    #[error("Invalid or malformed payment header")]
    InvalidPaymentHeader,
    #[error("Unable to find matching payment requirements")]
    NoPaymentMatching,
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
    #[error("Settlement failed: {0}")]
    Settlement(String),
    #[error("upto session tracking failed: {0:?}")]
    UptoTracking(proto::ErrorReason),
}

impl PaygateError {
    /// The HTTP status this error should be reported with. Upto tracking
    /// errors carry the §4.7 error→status map; everything else is a plain
    /// 402 Payment Required.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PaygateError::UptoTracking(reason) => {
                StatusCode::from_u16(reason.http_status()).unwrap_or(StatusCode::PAYMENT_REQUIRED)
            }
            _ => StatusCode::PAYMENT_REQUIRED,
        }
    }
}

fn error_response(err: PaygateError, accepts: &[v2::PriceTag], resource: &v2::ResourceInfo) -> Response {
    let status = err.status_code();
    let payment_required = v2::PaymentRequired {
        x402_version: v2::X402Version2,
        resource: Some(resource.clone()),
        accepts: accepts.iter().map(|pt| pt.enrich()).collect(),
        error: Some(err.to_string()),
    };
    let body = serde_json::to_vec(&payment_required).expect("serialization failed");
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .expect("failed to construct response")
}

// ============================================================================
// Wire extraction helpers
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedSlug {
    network: x402_types::chain::ChainId,
    scheme: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayloadEnvelope {
    accepted: AcceptedSlug,
}

fn decode_payment_header(header_bytes: &[u8]) -> Option<Value> {
    let decoded = Base64Bytes::from(header_bytes).decode().ok()?;
    serde_json::from_slice(&decoded).ok()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UptoPermitWire {
    owner: String,
    value: String,
    deadline: UnixTimestamp,
    nonce: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UptoPayloadWire {
    permit: UptoPermitWire,
    amount: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyEnvelope<'a> {
    x402_version: v2::X402Version2,
    payment_payload: &'a Value,
    payment_requirements: &'a v2::PaymentRequirements,
}

fn build_verify_request(
    payload: &Value,
    requirements: &v2::PaymentRequirements,
) -> Result<proto::VerifyRequest, PaygateError> {
    let envelope = VerifyEnvelope {
        x402_version: v2::X402Version2,
        payment_payload: payload,
        payment_requirements: requirements,
    };
    let json_string = serde_json::to_string(&envelope)
        .map_err(|e| PaygateError::VerificationFailed(e.to_string()))?;
    let raw = serde_json::value::RawValue::from_string(json_string)
        .map_err(|e| PaygateError::VerificationFailed(e.to_string()))?;
    Ok(proto::VerifyRequest::from(raw))
}

fn settlement_header(settlement: &proto::SettleResponse) -> Result<HeaderValue, PaygateError> {
    let json = serde_json::to_vec(settlement).map_err(|e| PaygateError::Settlement(e.to_string()))?;
    let encoded = Base64Bytes::encode(json);
    HeaderValue::from_bytes(encoded.as_ref()).map_err(|e| PaygateError::Settlement(e.to_string()))
}

// ============================================================================
// Paygate
// ============================================================================

/// Gates a route behind payment verification/settlement (`exact`) or upto
/// session tracking (`upto`), per the matched [`v2::PriceTag`]'s scheme.
pub struct Paygate<F> {
    /// The facilitator used for the `exact` scheme's verify/settle calls.
    pub facilitator: F,
    /// Whether `exact` settles before or after the inner handler runs.
    pub settle_before_execution: bool,
    /// Requirements this route accepts, one per scheme/network/asset.
    pub accepts: Arc<Vec<v2::PriceTag>>,
    /// Description of the protected resource, sent back in 402 bodies.
    pub resource: v2::ResourceInfo,
    /// Session store backing the `upto` scheme. `None` means this route
    /// does not accept `upto` payments even if listed in `accepts`.
    pub upto_store: Option<Arc<dyn UptoSessionStore>>,
    /// Buffer before a session's deadline at which new accrual is refused.
    pub deadline_buffer_secs: u64,
}

impl<F> Paygate<F> {
    async fn call_inner<ReqBody, ResBody, S>(
        mut inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<http::Response<ResBody>, S::Error>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Future: Send,
    {
        #[cfg(feature = "telemetry")]
        {
            inner.call(req).instrument(tracing::info_span!("inner")).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            inner.call(req).await
        }
    }

    fn find_accepted<'a>(&'a self, accepted: &AcceptedSlug) -> Option<&'a v2::PriceTag> {
        self.accepts.iter().find(|pt| {
            pt.requirements.network == accepted.network && pt.requirements.scheme == accepted.scheme
        })
    }
}

impl<F> Paygate<F>
where
    F: Facilitator,
{
    /// Handles an incoming request, turning any [`PaygateError`] into a 402
    /// (or §4.7-mapped) HTTP response instead of surfacing it.
    #[cfg_attr(feature = "telemetry", instrument(name = "x402.handle_request", skip_all))]
    pub async fn handle_request<ReqBody, ResBody, S>(
        self,
        inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, Infallible>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        match self.handle_request_fallible(inner, req).await {
            Ok(response) => Ok(response),
            Err(err) => Ok(error_response(err, &self.accepts, &self.resource)),
        }
    }

    /// Stamps `extra` onto each accepted requirement from the facilitator's
    /// `/supported` response (e.g. EIP-712 domain info for a token the
    /// resource server didn't specify one for). Falls back to the
    /// unenriched list if `/supported` fails.
    pub async fn enrich_accepts(&mut self) {
        let capabilities = self.facilitator.supported().await.unwrap_or_default();
        let accepts = self
            .accepts
            .iter()
            .map(|pt| {
                let mut pt = pt.clone();
                if let Some(extra) = capabilities
                    .kinds
                    .iter()
                    .find(|k| {
                        k.network == pt.requirements.network.to_string() && k.scheme == pt.requirements.scheme
                    })
                    .and_then(|k| k.extra.clone())
                {
                    pt.requirements.extra = Some(extra);
                }
                pt
            })
            .collect::<Vec<_>>();
        self.accepts = Arc::new(accepts);
    }

    /// Fallible version of [`Self::handle_request`].
    pub async fn handle_request_fallible<ReqBody, ResBody, S>(
        &self,
        inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, PaygateError>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        let payload = extract_payment_payload(req.headers())?;
        let accepted: PaymentPayloadEnvelope = serde_json::from_value(payload.clone())
            .map_err(|_| PaygateError::InvalidPaymentHeader)?;
        let selected = self
            .find_accepted(&accepted.accepted)
            .ok_or(PaygateError::NoPaymentMatching)?
            .requirements
            .clone();

        if accepted.accepted.scheme == "upto" {
            self.handle_upto(&payload, &selected, inner, req).await
        } else {
            self.handle_exact(&payload, &selected, inner, req).await
        }
    }

    async fn handle_exact<ReqBody, ResBody, S>(
        &self,
        payload: &Value,
        requirements: &v2::PaymentRequirements,
        inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, PaygateError>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        let verify_request = build_verify_request(payload, requirements)?;

        if self.settle_before_execution {
            let settlement = self.settle(&verify_request).await?;
            let header_value = settlement_header(&settlement)?;
            let response = match Self::call_inner(inner, req).await {
                Ok(response) => response,
                Err(err) => return Ok(err.into_response()),
            };
            let mut res = response.into_response();
            res.headers_mut().insert(PAYMENT_RESPONSE_HEADER, header_value);
            Ok(res)
        } else {
            self.verify(&verify_request).await?;

            let response = match Self::call_inner(inner, req).await {
                Ok(response) => response,
                Err(err) => return Ok(err.into_response()),
            };
            let response = response.into_response();
            if response.status().is_client_error() || response.status().is_server_error() {
                return Ok(response);
            }

            let settlement = self.settle(&verify_request).await?;
            let header_value = settlement_header(&settlement)?;
            let mut res = response;
            res.headers_mut().insert(PAYMENT_RESPONSE_HEADER, header_value);
            Ok(res)
        }
    }

    /// §4.13 step 5: track the permit's accrual locally, then run the
    /// handler. Settlement itself is deferred to the sweeper (§4.9).
    async fn handle_upto<ReqBody, ResBody, S>(
        &self,
        payload: &Value,
        requirements: &v2::PaymentRequirements,
        inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, PaygateError>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        let session = self.track_upto(payload, requirements).await?;

        let response = match Self::call_inner(inner, req).await {
            Ok(response) => response,
            Err(err) => return Ok(err.into_response()),
        };
        let mut res = response.into_response();
        let header_value = HeaderValue::from_str(&session.id.to_string())
            .map_err(|_| PaygateError::UptoTracking(proto::ErrorReason::SessionCreationFailed))?;
        res.headers_mut().insert(UPTO_SESSION_HEADER, header_value);
        Ok(res)
    }

    async fn track_upto(
        &self,
        payload: &Value,
        requirements: &v2::PaymentRequirements,
    ) -> Result<UptoSession, PaygateError> {
        let store = self.upto_store.clone().ok_or_else(|| {
            PaygateError::VerificationFailed("route does not accept upto payments".to_string())
        })?;
        let wire: UptoPayloadWire =
            serde_json::from_value(payload.clone()).map_err(|_| PaygateError::InvalidPaymentHeader)?;
        let cap: u128 = wire
            .permit
            .value
            .parse()
            .map_err(|_| PaygateError::InvalidPaymentHeader)?;
        let amount: u128 = wire.amount.parse().map_err(|_| PaygateError::InvalidPaymentHeader)?;

        store
            .track_payment(
                &requirements.network,
                &requirements.asset,
                &wire.permit.owner,
                &requirements.pay_to,
                cap,
                wire.permit.deadline,
                &wire.permit.nonce,
                amount,
                self.deadline_buffer_secs,
            )
            .await
            .map_err(PaygateError::UptoTracking)
    }

    async fn verify(&self, verify_request: &proto::VerifyRequest) -> Result<(), PaygateError> {
        let response = self
            .facilitator
            .verify(verify_request)
            .await
            .map_err(|e| PaygateError::VerificationFailed(e.to_string()))?;
        if response.is_valid {
            Ok(())
        } else {
            let reason = response
                .invalid_reason
                .map(|r| format!("{r:?}"))
                .unwrap_or_else(|| "unknown".to_string());
            Err(PaygateError::VerificationFailed(reason))
        }
    }

    async fn settle(
        &self,
        settle_request: &proto::SettleRequest,
    ) -> Result<proto::SettleResponse, PaygateError> {
        let settlement = self
            .facilitator
            .settle(settle_request)
            .await
            .map_err(|e| PaygateError::Settlement(e.to_string()))?;
        if settlement.success {
            Ok(settlement)
        } else {
            let reason = settlement
                .error_reason
                .map(|r| format!("{r:?}"))
                .unwrap_or_else(|| "unknown".to_string());
            Err(PaygateError::Settlement(reason))
        }
    }
}

fn extract_payment_payload(headers: &HeaderMap) -> Result<Value, PaygateError> {
    let header = headers
        .get(PAYMENT_HEADER)
        .ok_or(PaygateError::PaymentHeaderRequired(PAYMENT_HEADER))?;
    decode_payment_header(header.as_bytes()).ok_or(PaygateError::InvalidPaymentHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402_types::chain::ChainId;

    fn price_tag(scheme: &str, network: ChainId, asset: &str) -> v2::PriceTag {
        v2::PriceTag::new(v2::PaymentRequirements {
            scheme: scheme.to_string(),
            network,
            amount: "1000".to_string(),
            pay_to: "0xpayto".to_string(),
            max_timeout_seconds: 300,
            asset: asset.to_string(),
            extra: None,
        })
    }

    #[test]
    fn finds_accepted_price_tag_by_scheme_and_network() {
        let network = ChainId::new("eip155", "8453");
        let paygate = Paygate {
            facilitator: (),
            settle_before_execution: false,
            accepts: Arc::new(vec![price_tag("exact", network.clone(), "0xusdc")]),
            resource: v2::ResourceInfo {
                description: "".to_string(),
                mime_type: "application/json".to_string(),
                url: "http://localhost/".to_string(),
            },
            upto_store: None,
            deadline_buffer_secs: DEFAULT_DEADLINE_BUFFER_SECS,
        };
        let accepted = AcceptedSlug {
            network,
            scheme: "exact".to_string(),
        };
        assert!(paygate.find_accepted(&accepted).is_some());
    }

    #[test]
    fn rejects_unknown_scheme_network_combination() {
        let network = ChainId::new("eip155", "8453");
        let other = ChainId::new("eip155", "84532");
        let paygate = Paygate {
            facilitator: (),
            settle_before_execution: false,
            accepts: Arc::new(vec![price_tag("exact", network, "0xusdc")]),
            resource: v2::ResourceInfo {
                description: "".to_string(),
                mime_type: "application/json".to_string(),
                url: "http://localhost/".to_string(),
            },
            upto_store: None,
            deadline_buffer_secs: DEFAULT_DEADLINE_BUFFER_SECS,
        };
        let accepted = AcceptedSlug {
            network: other,
            scheme: "exact".to_string(),
        };
        assert!(paygate.find_accepted(&accepted).is_none());
    }
}
