//! Protocol v1: payment requirements keyed by a bare network name
//! (e.g. `"base-sepolia"`) instead of a CAIP-2 chain id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::networks::chain_id_by_network_name;

/// x402 protocol version marker, always serializes as the integer `1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X402Version1;

impl Serialize for X402Version1 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(1)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u8::deserialize(deserializer)?;
        if n == 1 {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom("expected x402Version == 1"))
        }
    }
}

impl From<X402Version1> for u8 {
    fn from(_: X402Version1) -> Self {
        1
    }
}

/// `PaymentRequirements` as advertised on the v1 wire: `network` is a bare
/// name, resolved against [`crate::networks`] when converting to the
/// canonical CAIP-2 form the engine operates on internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    #[serde(default)]
    pub description: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_schema: Option<Value>,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<Value>,
}

impl PaymentRequirements {
    /// Resolves `network` to a CAIP-2 chain id, if it is a known v1 name.
    pub fn chain_id(&self) -> Option<crate::chain::ChainId> {
        chain_id_by_network_name(&self.network)
    }
}

/// `PaymentRequired` (HTTP 402 body) for v1 clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version1,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builder for a single `PaymentRequirements` entry, with an optional
/// enrichment hook applied once the facilitator's supported signers/networks
/// are known (mirrors the v2 `PriceTag`).
#[derive(Clone)]
pub struct PriceTag {
    pub requirements: PaymentRequirements,
    pub enricher: Option<Arc<dyn Fn(&mut PaymentRequirements) + Send + Sync>>,
}

impl std::fmt::Debug for PriceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceTag")
            .field("requirements", &self.requirements)
            .finish()
    }
}

impl PriceTag {
    pub fn new(requirements: PaymentRequirements) -> Self {
        Self {
            requirements,
            enricher: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.requirements.max_timeout_seconds = seconds;
        self
    }

    pub fn enrich(&self) -> PaymentRequirements {
        let mut requirements = self.requirements.clone();
        if let Some(enricher) = &self.enricher {
            enricher(&mut requirements);
        }
        requirements
    }
}
