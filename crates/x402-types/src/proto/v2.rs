//! Protocol v2: payment requirements keyed by a CAIP-2 chain id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::chain::ChainId;

/// x402 protocol version marker, always serializes as the integer `2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X402Version2;

impl Serialize for X402Version2 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(2)
    }
}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u8::deserialize(deserializer)?;
        if n == 2 {
            Ok(X402Version2)
        } else {
            Err(serde::de::Error::custom("expected x402Version == 2"))
        }
    }
}

impl From<X402Version2> for u8 {
    fn from(_: X402Version2) -> Self {
        2
    }
}

/// Describes the resource a paid route protects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    #[serde(default)]
    pub description: String,
    pub mime_type: String,
    pub url: String,
}

/// `PaymentRequirements` as advertised on the v2 wire, per original §3:
/// `scheme`, `network`, `asset`, `amount`, `payTo`, `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: ChainId,
    pub amount: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extra: Option<Value>,
}

/// `PaymentRequired` (HTTP 402 body) for v2 clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version2,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builder for a single v2 `PaymentRequirements` entry, with an optional
/// enrichment hook applied once the facilitator's supported signers/networks
/// are known (e.g. to fill in `extra.name`/`extra.version` from the deployed
/// token's EIP-712 domain).
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

impl PartialEq<PaymentRequirements> for PriceTag {
    fn eq(&self, other: &PaymentRequirements) -> bool {
        self.requirements.scheme == other.scheme
            && self.requirements.network == other.network
            && self.requirements.asset == other.asset
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
