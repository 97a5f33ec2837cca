//! Local facilitator implementation for x402 payments (C3).
//!
//! [`FacilitatorLocal`] routes `/verify` and `/settle` requests to the scheme
//! handler registered for the request's `(network, scheme)` pair. Per the
//! "application-level failures are values, not exceptions" propagation
//! policy, an unresolved scheme is itself returned as an invalid/failed
//! response rather than a Rust error — [`Facilitator::Error`] is reserved
//! for transport or programming failures, of which this implementation has
//! none of its own.

use std::convert::Infallible;

use x402_types::chain::ChainId;
use x402_types::facilitator::Facilitator;
use x402_types::proto::{
    ErrorReason, SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse,
};
use x402_types::scheme::SchemeRegistry;

/// A [`Facilitator`] that delegates to a [`SchemeRegistry`].
pub struct FacilitatorLocal {
    registry: SchemeRegistry,
    known_networks: Vec<ChainId>,
}

impl FacilitatorLocal {
    pub fn new(registry: SchemeRegistry, known_networks: Vec<ChainId>) -> Self {
        Self {
            registry,
            known_networks,
        }
    }
}

#[async_trait::async_trait]
impl Facilitator for FacilitatorLocal {
    type Error = Infallible;

    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, Self::Error> {
        let Some(slug) = request.scheme_handler_slug() else {
            return Ok(VerifyResponse::invalid(ErrorReason::InvalidFormat, None));
        };
        let Some(handler) = self.registry.resolve(&slug.chain_id, &slug.scheme) else {
            return Ok(VerifyResponse::invalid(ErrorReason::UnsupportedScheme, None));
        };
        let (Ok(payload), Ok(requirements)) =
            (request.payment_payload(), request.payment_requirements())
        else {
            return Ok(VerifyResponse::invalid(ErrorReason::InvalidFormat, None));
        };
        Ok(handler.verify(&payload, &requirements).await)
    }

    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, Self::Error> {
        let Some(slug) = request.scheme_handler_slug() else {
            return Ok(SettleResponse::failed(
                ChainId::new("unknown", "0"),
                ErrorReason::InvalidFormat,
                None,
            ));
        };
        let Some(handler) = self.registry.resolve(&slug.chain_id, &slug.scheme) else {
            return Ok(SettleResponse::failed(
                slug.chain_id,
                ErrorReason::UnsupportedScheme,
                None,
            ));
        };
        let (Ok(payload), Ok(requirements)) =
            (request.payment_payload(), request.payment_requirements())
        else {
            return Ok(SettleResponse::failed(
                slug.chain_id,
                ErrorReason::InvalidFormat,
                None,
            ));
        };
        Ok(handler.settle(&payload, &requirements).await)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        Ok(self.registry.supported(&self.known_networks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use x402_types::chain::ChainIdPattern;
    use x402_types::scheme::{SchemeBlueprints, SchemeFacilitator, SchemeFacilitatorBuilder};

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
        ) -> Result<std::sync::Arc<dyn SchemeFacilitator>, Box<dyn std::error::Error>> {
            Ok(std::sync::Arc::new(EchoScheme))
        }
    }

    fn build_facilitator() -> FacilitatorLocal {
        let base = ChainId::new("eip155", "8453");
        let blueprints = SchemeBlueprints::new().and_register(EchoBlueprint);
        let registry = SchemeRegistry::build(&[(base.clone(), ())], &blueprints).unwrap();
        FacilitatorLocal::new(registry, vec![base])
    }

    fn v2_request(network: &str, scheme: &str) -> VerifyRequest {
        let body = serde_json::json!({
            "x402Version": 2,
            "paymentPayload": {
                "accepted": {"network": network, "scheme": scheme}
            },
            "paymentRequirements": {
                "scheme": scheme,
                "network": network,
                "amount": "100",
                "payTo": "0x0000000000000000000000000000000000000002",
                "maxTimeoutSeconds": 60,
                "asset": "0x0000000000000000000000000000000000000003"
            }
        });
        let raw = serde_json::value::to_raw_value(&body).unwrap();
        VerifyRequest::from(raw)
    }

    #[tokio::test]
    async fn routes_to_registered_scheme() {
        let facilitator = build_facilitator();
        let request = v2_request("eip155:8453", "exact");
        let response = facilitator.verify(&request).await.unwrap();
        assert!(response.is_valid);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_a_value_not_an_error() {
        let facilitator = build_facilitator();
        let request = v2_request("eip155:8453", "upto");
        let response = facilitator.verify(&request).await.unwrap();
        assert!(!response.is_valid);
        assert_eq!(response.invalid_reason, Some(ErrorReason::UnsupportedScheme));
    }
}
