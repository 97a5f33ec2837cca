//! The "exact" payment scheme for EVM chains: a one-shot EIP-3009
//! `transferWithAuthorization` transfer, verified by simulating the on-chain
//! call and settled by submitting it for real.

use alloy_primitives::{Address, Bytes, FixedBytes, U256};
use alloy_provider::Provider;
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use x402_types::chain::{ChainId, ChainIdPattern, ChainProviderOps};
use x402_types::proto::v2::PaymentRequirements;
use x402_types::proto::{ErrorReason, SettleResponse, VerifyResponse};
use x402_types::scheme::{SchemeFacilitator, SchemeFacilitatorBuilder};
use x402_types::timestamp::UnixTimestamp;

use crate::chain::erc20::IEip3009;
use crate::chain::{Eip155MetaTransactionProvider, MetaTransaction};

/// EIP-712 domain parameters a resource server stamps onto `extra` so the
/// facilitator doesn't need to guess a token's `name`/`version` (see
/// [`x402_types::proto::v2::PriceTag::enrich`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequirementsExtra {
    name: String,
    version: String,
}

/// The signed ERC-3009 authorization and its signature, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExactEvmPayload {
    signature: Bytes,
    authorization: ExactEvmAuthorization,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExactEvmAuthorization {
    from: Address,
    to: Address,
    #[serde(with = "x402_types_decimal_u256")]
    value: U256,
    valid_after: UnixTimestamp,
    valid_before: UnixTimestamp,
    nonce: FixedBytes<32>,
}

mod x402_types_decimal_u256 {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom)
    }
}

/// Blueprint registered once per process; `build()` wires it to a concrete
/// [`crate::chain::Eip155ChainProvider`] for every matching chain.
#[derive(Debug, Default)]
pub struct ExactEip155Blueprint;

impl<P> SchemeFacilitatorBuilder<P> for ExactEip155Blueprint
where
    P: Eip155MetaTransactionProvider + ChainProviderOps + Clone + Send + Sync + 'static,
    P::Inner: Provider + Clone,
{
    fn scheme(&self) -> &'static str {
        "exact"
    }

    fn network_pattern(&self) -> ChainIdPattern {
        ChainIdPattern::wildcard("eip155")
    }

    fn build(
        &self,
        provider: &P,
        _config: Option<Value>,
    ) -> Result<Arc<dyn SchemeFacilitator>, Box<dyn std::error::Error>> {
        Ok(Arc::new(ExactEip155Facilitator {
            provider: provider.clone(),
        }))
    }
}

struct ExactEip155Facilitator<P> {
    provider: P,
}

impl<P> std::fmt::Debug for ExactEip155Facilitator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExactEip155Facilitator").finish_non_exhaustive()
    }
}

/// Parses the wire payload/requirements and checks every precondition that
/// doesn't require an RPC round-trip: scheme/network/recipient match, the
/// authorization window, and that the signed value covers what's required.
fn assert_preconditions(
    chain_id: &ChainId,
    payload: &Value,
    requirements: &Value,
) -> Result<(ExactEvmPayload, PaymentRequirements), ErrorReason> {
    let requirements: PaymentRequirements =
        serde_json::from_value(requirements.clone()).map_err(|_| ErrorReason::InvalidFormat)?;
    if &requirements.network != chain_id {
        return Err(ErrorReason::NetworkMismatch);
    }
    let payload: ExactEvmPayload =
        serde_json::from_value(payload.clone()).map_err(|_| ErrorReason::InvalidFormat)?;

    let pay_to: Address = requirements
        .pay_to
        .parse()
        .map_err(|_| ErrorReason::InvalidFormat)?;
    if payload.authorization.to != pay_to {
        return Err(ErrorReason::RecipientMismatch);
    }

    let now = UnixTimestamp::now();
    if payload.authorization.valid_before < now + 6 {
        return Err(ErrorReason::AuthorizationExpired);
    }
    if payload.authorization.valid_after > now {
        return Err(ErrorReason::NotYetValid);
    }

    let amount_required: U256 = requirements
        .amount
        .parse()
        .map_err(|_| ErrorReason::InvalidFormat)?;
    if payload.authorization.value < amount_required {
        return Err(ErrorReason::AssetMismatch);
    }

    Ok((payload, requirements))
}

fn domain_extra(requirements: &PaymentRequirements) -> Result<PaymentRequirementsExtra, ErrorReason> {
    requirements
        .extra
        .as_ref()
        .and_then(|extra| serde_json::from_value(extra.clone()).ok())
        .ok_or(ErrorReason::MissingEip712Domain)
}

/// Splits a 65-byte `r || s || v` signature into the components EIP-3009's
/// `v`/`r`/`s` overload expects, normalizing a 0/1 recovery id to 27/28.
fn split_signature(signature: &Bytes) -> Result<(u8, FixedBytes<32>, FixedBytes<32>), ErrorReason> {
    if signature.len() != 65 {
        return Err(ErrorReason::InvalidFormat);
    }
    let r = FixedBytes::<32>::from_slice(&signature[0..32]);
    let s = FixedBytes::<32>::from_slice(&signature[32..64]);
    let v = match signature[64] {
        0 | 1 => signature[64] + 27,
        v => v,
    };
    Ok((v, r, s))
}

#[async_trait]
impl<P> SchemeFacilitator for ExactEip155Facilitator<P>
where
    P: Eip155MetaTransactionProvider + ChainProviderOps + Send + Sync,
    P::Inner: Provider,
{
    fn scheme(&self) -> &'static str {
        "exact"
    }

    async fn verify(&self, payload: &Value, requirements: &Value) -> VerifyResponse {
        let chain_id = self.provider.chain_id();
        let (payload, requirements) = match assert_preconditions(&chain_id, payload, requirements) {
            Ok(parsed) => parsed,
            Err(reason) => return VerifyResponse::invalid(reason, None),
        };
        let payer = payload.authorization.from.to_string();
        if domain_extra(&requirements).is_err() {
            return VerifyResponse::invalid(ErrorReason::MissingEip712Domain, Some(payer));
        }
        let Ok(asset) = requirements.asset.parse::<Address>() else {
            return VerifyResponse::invalid(ErrorReason::InvalidFormat, Some(payer));
        };
        let (v, r, s) = match split_signature(&payload.signature) {
            Ok(parts) => parts,
            Err(reason) => return VerifyResponse::invalid(reason, Some(payer)),
        };
        let contract = IEip3009::new(asset, self.provider.inner());
        let simulated = contract
            .transferWithAuthorization(
                payload.authorization.from,
                payload.authorization.to,
                payload.authorization.value,
                U256::from(payload.authorization.valid_after.as_secs()),
                U256::from(payload.authorization.valid_before.as_secs()),
                payload.authorization.nonce,
                v,
                r,
                s,
            )
            .call()
            .await;
        match simulated {
            Ok(()) => VerifyResponse::valid(payer),
            Err(_) => VerifyResponse::invalid(ErrorReason::InvalidAuthorizationSignature, Some(payer)),
        }
    }

    async fn settle(&self, payload: &Value, requirements: &Value) -> SettleResponse {
        let chain_id = self.provider.chain_id();
        let (payload, requirements) = match assert_preconditions(&chain_id, payload, requirements) {
            Ok(parsed) => parsed,
            Err(reason) => return SettleResponse::failed(chain_id, reason, None),
        };
        let payer = payload.authorization.from.to_string();
        if domain_extra(&requirements).is_err() {
            return SettleResponse::failed(chain_id, ErrorReason::MissingEip712Domain, Some(payer));
        }
        let Ok(asset) = requirements.asset.parse::<Address>() else {
            return SettleResponse::failed(chain_id, ErrorReason::InvalidFormat, Some(payer));
        };
        let (v, r, s) = match split_signature(&payload.signature) {
            Ok(parts) => parts,
            Err(reason) => return SettleResponse::failed(chain_id, reason, Some(payer)),
        };
        let calldata = IEip3009::transferWithAuthorizationCall {
            from: payload.authorization.from,
            to: payload.authorization.to,
            value: payload.authorization.value,
            validAfter: U256::from(payload.authorization.valid_after.as_secs()),
            validBefore: U256::from(payload.authorization.valid_before.as_secs()),
            nonce: payload.authorization.nonce,
            v,
            r,
            s,
        };
        let tx = MetaTransaction {
            to: asset,
            calldata: Bytes::from(calldata.abi_encode()),
            confirmations: 1,
        };
        match self.provider.send_transaction(tx).await {
            Ok(receipt) if receipt.status() => {
                SettleResponse::success(chain_id, receipt.transaction_hash.to_string(), payer)
            }
            Ok(_) => SettleResponse::failed(chain_id, ErrorReason::TransactionFailed, Some(payer)),
            Err(_) => SettleResponse::failed(chain_id, ErrorReason::TransactionFailed, Some(payer)),
        }
    }

    fn signers(&self, _network: &ChainId) -> Vec<String> {
        self.provider.signer_addresses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements_json(network: &str, pay_to: &str, amount: &str) -> Value {
        serde_json::json!({
            "scheme": "exact",
            "network": network,
            "amount": amount,
            "payTo": pay_to,
            "maxTimeoutSeconds": 60,
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "extra": {"name": "USD Coin", "version": "2"}
        })
    }

    fn payload_json(to: &str, value: &str, valid_before: u64) -> Value {
        serde_json::json!({
            "signature": "0x00",
            "authorization": {
                "from": "0x0000000000000000000000000000000000000001",
                "to": to,
                "value": value,
                "validAfter": "0",
                "validBefore": valid_before.to_string(),
                "nonce": "0x0000000000000000000000000000000000000000000000000000000000000001",
            }
        })
    }

    #[test]
    fn rejects_recipient_mismatch() {
        let chain_id = ChainId::new("eip155", "8453");
        let requirements = requirements_json(
            "eip155:8453",
            "0x0000000000000000000000000000000000000002",
            "100",
        );
        let payload = payload_json(
            "0x0000000000000000000000000000000000000003",
            "100",
            UnixTimestamp::now().as_secs() + 3600,
        );
        let err = assert_preconditions(&chain_id, &payload, &requirements).unwrap_err();
        assert_eq!(err, ErrorReason::RecipientMismatch);
    }

    #[test]
    fn rejects_insufficient_authorized_value() {
        let chain_id = ChainId::new("eip155", "8453");
        let requirements = requirements_json(
            "eip155:8453",
            "0x0000000000000000000000000000000000000002",
            "100",
        );
        let payload = payload_json(
            "0x0000000000000000000000000000000000000002",
            "50",
            UnixTimestamp::now().as_secs() + 3600,
        );
        let err = assert_preconditions(&chain_id, &payload, &requirements).unwrap_err();
        assert_eq!(err, ErrorReason::AssetMismatch);
    }

    #[test]
    fn rejects_expired_authorization() {
        let chain_id = ChainId::new("eip155", "8453");
        let requirements = requirements_json(
            "eip155:8453",
            "0x0000000000000000000000000000000000000002",
            "100",
        );
        let payload = payload_json("0x0000000000000000000000000000000000000002", "100", 1);
        let err = assert_preconditions(&chain_id, &payload, &requirements).unwrap_err();
        assert_eq!(err, ErrorReason::AuthorizationExpired);
    }
}
