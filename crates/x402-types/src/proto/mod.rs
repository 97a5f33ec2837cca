//! Protocol types for x402 payment messages.
//!
//! This module defines the wire format types used between resource servers,
//! payers, and the facilitator. It carries both the v2 (CAIP-2 network id)
//! wire shape and v1 (bare network name) compatibility, since `GET /supported`
//! must be able to advertise both simultaneously (see [`v1`]/[`v2`]).

use serde::{Deserialize, Serialize};
use serde_with::{VecSkipError, serde_as};
use std::collections::HashMap;

use crate::chain::ChainId;
use crate::scheme::SchemeHandlerSlug;

pub mod v1;
pub mod v2;

/// Describes a payment method supported by a facilitator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    /// The x402 protocol version (1 or 2).
    pub x402_version: u8,
    pub scheme: String,
    /// CAIP-2 chain id for v2 kinds, bare v1 network name for v1 kinds.
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Response from a facilitator's `GET /supported` endpoint.
#[serde_as]
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    #[serde_as(as = "VecSkipError<_>")]
    pub kinds: Vec<SupportedPaymentKind>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub signers: HashMap<ChainId, Vec<String>>,
}

impl SupportedResponse {
    /// Forces `x402Version = 1` on every kind whose network has no CAIP-2
    /// `:` separator, per the legacy-compatibility normalization pass.
    pub fn normalize_legacy_versions(mut self) -> Self {
        for kind in &mut self.kinds {
            if !kind.network.contains(':') {
                kind.x402_version = 1;
            }
        }
        self
    }
}

/// Raw request body for `/verify` and `/settle`: parsed lazily so that the
/// scheme dispatcher only needs to inspect `x402Version`/`network`/`scheme`
/// before handing the whole body to the resolved scheme handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest(Box<serde_json::value::RawValue>);

pub type SettleRequest = VerifyRequest;

impl From<Box<serde_json::value::RawValue>> for VerifyRequest {
    fn from(value: Box<serde_json::value::RawValue>) -> Self {
        Self(value)
    }
}

impl VerifyRequest {
    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    pub fn payment_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Envelope {
            payment_payload: serde_json::Value,
        }
        let envelope: Envelope = serde_json::from_str(self.as_str())?;
        Ok(envelope.payment_payload)
    }

    pub fn payment_requirements(&self) -> Result<serde_json::Value, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Envelope {
            payment_requirements: serde_json::Value,
        }
        let envelope: Envelope = serde_json::from_str(self.as_str())?;
        Ok(envelope.payment_requirements)
    }

    /// Determines which registered scheme handler should process this
    /// request, from either the v1 (bare network name) or v2 (CAIP-2
    /// `accepted.network`) wire shape.
    pub fn scheme_handler_slug(&self) -> Option<SchemeHandlerSlug> {
        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Wire {
            #[serde(rename_all = "camelCase")]
            V1 {
                x402_version: v1::X402Version1,
                payment_payload: PaymentPayloadV1,
            },
            #[serde(rename_all = "camelCase")]
            V2 {
                x402_version: v2::X402Version2,
                payment_payload: PaymentPayloadV2,
            },
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PaymentPayloadV1 {
            network: String,
            scheme: String,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PaymentPayloadV2 {
            accepted: AcceptedV2,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AcceptedV2 {
            network: ChainId,
            scheme: String,
        }

        let wire = serde_json::from_str::<Wire>(self.as_str()).ok()?;
        match wire {
            Wire::V1 {
                payment_payload,
                x402_version,
            } => {
                let chain_id = ChainId::from_network_name(&payment_payload.network)?;
                Some(SchemeHandlerSlug::new(
                    chain_id,
                    x402_version.into(),
                    payment_payload.scheme,
                ))
            }
            Wire::V2 {
                payment_payload,
                x402_version,
            } => Some(SchemeHandlerSlug::new(
                payment_payload.accepted.network,
                x402_version.into(),
                payment_payload.accepted.scheme,
            )),
        }
    }
}

/// Response to a verification request.
///
/// `invalidReason` is present only when `isValid == false`; `payer` is filled
/// whenever the payload's signer could be recovered, even on failure, so
/// callers can attribute the attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<ErrorReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerifyResponse {
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.into()),
        }
    }

    pub fn invalid(reason: ErrorReason, payer: Option<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason),
            payer,
        }
    }
}

/// Response to a settlement request.
///
/// `transaction` is the empty string when nothing was due (e.g. an upto
/// session settlement with zero pending spend).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<ErrorReason>,
    pub transaction: String,
    pub network: ChainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl SettleResponse {
    pub fn success(network: ChainId, transaction: impl Into<String>, payer: impl Into<String>) -> Self {
        Self {
            success: true,
            error_reason: None,
            transaction: transaction.into(),
            network,
            payer: Some(payer.into()),
        }
    }

    pub fn failed(network: ChainId, reason: ErrorReason, payer: Option<String>) -> Self {
        Self {
            success: false,
            error_reason: Some(reason),
            transaction: String::new(),
            network,
            payer,
        }
    }
}

/// Machine-readable error reason codes, covering the protocol, state, and
/// chain error categories. State errors (`settling_in_progress`, …) surface
/// as HTTP statuses rather than in a response body, but share this enum so
/// tracking records and hook payloads can carry one consistent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    // Protocol errors
    UnsupportedScheme,
    NetworkMismatch,
    MissingEip712Domain,
    InvalidUptoEvmPayload,
    InvalidChainId,
    AuthorizationExpired,
    NotYetValid,
    CapTooLow,
    CapBelowRequiredMax,
    TotalExceedsCap,
    SpenderNotFacilitator,
    InvalidPermitSignature,
    InvalidAuthorizationSignature,
    UnsupportedSignatureType,
    InvalidFormat,
    RecipientMismatch,
    AssetMismatch,
    AcceptedRequirementsMismatch,
    // State errors (C7 / C8)
    SettlingInProgress,
    SessionClosed,
    DeadlineTooClose,
    CapExhausted,
    SessionCreationFailed,
    // Chain errors
    TransactionFailed,
    InvalidTransactionState,
    InsufficientAllowance,
    PermitFailed,
    // Catch-all
    UnexpectedError,
}

impl ErrorReason {
    /// HTTP status used when this reason is surfaced standalone (C7's
    /// tracking-error → status map; protocol/chain errors travel inside a
    /// 200 response body instead).
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorReason::SettlingInProgress => 409,
            ErrorReason::SessionClosed => 410,
            ErrorReason::DeadlineTooClose => 403,
            ErrorReason::CapExhausted => 402,
            ErrorReason::SessionCreationFailed => 500,
            _ => 200,
        }
    }
}

/// Verbatim JSON, used where a field must round-trip exactly (e.g. original
/// `PaymentRequirements` as received, for legacy conversion).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OriginalJson(pub Box<serde_json::value::RawValue>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_network_names_to_v1() {
        let resp = SupportedResponse {
            kinds: vec![
                SupportedPaymentKind {
                    x402_version: 2,
                    scheme: "exact".into(),
                    network: "base".into(),
                    extra: None,
                },
                SupportedPaymentKind {
                    x402_version: 2,
                    scheme: "exact".into(),
                    network: "eip155:8453".into(),
                    extra: None,
                },
            ],
            extensions: vec![],
            signers: HashMap::new(),
        }
        .normalize_legacy_versions();
        assert_eq!(resp.kinds[0].x402_version, 1);
        assert_eq!(resp.kinds[1].x402_version, 2);
    }

    #[test]
    fn verify_response_round_trips() {
        let v = VerifyResponse::invalid(ErrorReason::CapTooLow, Some("0xabc".into()));
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"invalidReason\":\"cap_too_low\""));
    }
}
