//! The "upto" payment scheme for EVM chains: a session-based accumulating
//! payment backed by an ERC-2612 `permit`. The payer signs a single permit
//! capping the total the facilitator may ever pull; each settlement attempts
//! `permit()` followed by `transferFrom()` for the amount actually consumed,
//! falling back to a plain `transferFrom()` against the existing allowance
//! once the permit's nonce has already been spent in an earlier settlement.

use alloy_primitives::{Address, Bytes, FixedBytes, U256};
use alloy_provider::Provider;
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use x402_types::chain::{ChainId, ChainIdPattern, ChainProviderOps};
use x402_types::proto::v2::PaymentRequirements;
use x402_types::proto::{ErrorReason, SettleResponse, VerifyResponse};
use x402_types::scheme::{SchemeFacilitator, SchemeFacilitatorBuilder};
use x402_types::timestamp::UnixTimestamp;

use crate::chain::erc20::{IERC20, IErc2612};
use crate::chain::{Eip155MetaTransactionProvider, MetaTransaction};

/// EIP-712 domain parameters for the permitted token, stamped onto
/// `requirements.extra` by the resource server the same way the exact scheme
/// requires it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequirementsExtra {
    name: String,
    version: String,
}

/// The signed permit and the amount this particular settlement should pull,
/// as sent on the wire. `amount` may be less than the permit's `value`
/// (the session cap) — it is the resource cost being charged for this call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UptoEvmPayload {
    signature: Bytes,
    permit: UptoPermit,
    #[serde(with = "x402_types_decimal_u256")]
    amount: U256,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UptoPermit {
    owner: Address,
    spender: Address,
    #[serde(with = "x402_types_decimal_u256")]
    value: U256,
    deadline: UnixTimestamp,
    /// The ERC-2612 nonce this permit was signed against (`nonces(owner)` at
    /// signing time). Not passed to the `permit()` call itself — the
    /// contract reads its own nonce from storage — but included on the wire
    /// so the facilitator's upto session identity can distinguish two
    /// permits the same payer signs to the same spender.
    #[serde(with = "x402_types_decimal_u256")]
    nonce: U256,
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
pub struct UptoEip155Blueprint;

impl<P> SchemeFacilitatorBuilder<P> for UptoEip155Blueprint
where
    P: Eip155MetaTransactionProvider + ChainProviderOps + Clone + Send + Sync + 'static,
    P::Inner: Provider + Clone,
{
    fn scheme(&self) -> &'static str {
        "upto"
    }

    fn network_pattern(&self) -> ChainIdPattern {
        ChainIdPattern::wildcard("eip155")
    }

    fn build(
        &self,
        provider: &P,
        _config: Option<Value>,
    ) -> Result<Arc<dyn SchemeFacilitator>, Box<dyn std::error::Error>> {
        Ok(Arc::new(UptoEip155Facilitator {
            provider: provider.clone(),
        }))
    }
}

struct UptoEip155Facilitator<P> {
    provider: P,
}

impl<P> std::fmt::Debug for UptoEip155Facilitator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UptoEip155Facilitator").finish_non_exhaustive()
    }
}

/// Parses the wire payload/requirements and checks every precondition that
/// doesn't require an RPC round-trip: scheme/network match, the permit
/// deadline, and that the session cap and per-call amount are consistent
/// with what the resource requires.
fn assert_preconditions(
    chain_id: &ChainId,
    payload: &Value,
    requirements: &Value,
) -> Result<(UptoEvmPayload, PaymentRequirements), ErrorReason> {
    let requirements: PaymentRequirements =
        serde_json::from_value(requirements.clone()).map_err(|_| ErrorReason::InvalidFormat)?;
    if &requirements.network != chain_id {
        return Err(ErrorReason::NetworkMismatch);
    }
    let payload: UptoEvmPayload =
        serde_json::from_value(payload.clone()).map_err(|_| ErrorReason::InvalidFormat)?;

    let spender: Address = requirements
        .pay_to
        .parse()
        .map_err(|_| ErrorReason::InvalidFormat)?;
    if payload.permit.spender != spender {
        return Err(ErrorReason::RecipientMismatch);
    }

    if payload.permit.deadline < UnixTimestamp::now() {
        return Err(ErrorReason::AuthorizationExpired);
    }

    let amount_required: U256 = requirements
        .amount
        .parse()
        .map_err(|_| ErrorReason::InvalidFormat)?;
    if payload.amount < amount_required || payload.amount > payload.permit.value {
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
impl<P> SchemeFacilitator for UptoEip155Facilitator<P>
where
    P: Eip155MetaTransactionProvider + ChainProviderOps + Send + Sync,
    P::Inner: Provider,
{
    fn scheme(&self) -> &'static str {
        "upto"
    }

    async fn verify(&self, payload: &Value, requirements: &Value) -> VerifyResponse {
        let chain_id = self.provider.chain_id();
        let (payload, requirements) = match assert_preconditions(&chain_id, payload, requirements) {
            Ok(parsed) => parsed,
            Err(reason) => return VerifyResponse::invalid(reason, None),
        };
        let payer = payload.permit.owner.to_string();
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

        let erc20 = IERC20::new(asset, self.provider.inner());
        let Ok(balance) = erc20.balanceOf(payload.permit.owner).call().await else {
            return VerifyResponse::invalid(ErrorReason::InsufficientAllowance, Some(payer));
        };
        if balance < payload.amount {
            return VerifyResponse::invalid(ErrorReason::InsufficientAllowance, Some(payer));
        }

        let erc2612 = IErc2612::new(asset, self.provider.inner());
        let simulated = erc2612
            .permit(
                payload.permit.owner,
                payload.permit.spender,
                payload.permit.value,
                U256::from(payload.permit.deadline.as_secs()),
                v,
                r,
                s,
            )
            .call()
            .await;
        if simulated.is_ok() {
            return VerifyResponse::valid(payer);
        }

        // The permit call reverted. Most likely its nonce was already spent
        // by an earlier settlement in this session — fall back to checking
        // that the existing allowance still covers this call's amount.
        let Ok(remaining) = erc20
            .allowance(payload.permit.owner, payload.permit.spender)
            .call()
            .await
        else {
            return VerifyResponse::invalid(ErrorReason::InvalidAuthorizationSignature, Some(payer));
        };
        if remaining >= payload.amount {
            VerifyResponse::valid(payer)
        } else {
            VerifyResponse::invalid(ErrorReason::InvalidAuthorizationSignature, Some(payer))
        }
    }

    async fn settle(&self, payload: &Value, requirements: &Value) -> SettleResponse {
        let chain_id = self.provider.chain_id();
        let (payload, requirements) = match assert_preconditions(&chain_id, payload, requirements) {
            Ok(parsed) => parsed,
            Err(reason) => return SettleResponse::failed(chain_id, reason, None),
        };
        let payer = payload.permit.owner.to_string();
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

        let erc2612 = IErc2612::new(asset, self.provider.inner());
        let permit_still_valid = erc2612
            .permit(
                payload.permit.owner,
                payload.permit.spender,
                payload.permit.value,
                U256::from(payload.permit.deadline.as_secs()),
                v,
                r,
                s,
            )
            .call()
            .await
            .is_ok();

        if permit_still_valid {
            let permit_call = IErc2612::permitCall {
                owner: payload.permit.owner,
                spender: payload.permit.spender,
                value: payload.permit.value,
                deadline: U256::from(payload.permit.deadline.as_secs()),
                v,
                r,
                s,
            };
            let tx = MetaTransaction {
                to: asset,
                calldata: Bytes::from(permit_call.abi_encode()),
                confirmations: 1,
            };
            if self.provider.send_transaction(tx).await.is_err() {
                return SettleResponse::failed(chain_id, ErrorReason::TransactionFailed, Some(payer));
            }
        }

        let transfer_call = IERC20::transferFromCall {
            from: payload.permit.owner,
            to: payload.permit.spender,
            amount: payload.amount,
        };
        let tx = MetaTransaction {
            to: asset,
            calldata: Bytes::from(transfer_call.abi_encode()),
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
            "scheme": "upto",
            "network": network,
            "amount": amount,
            "payTo": pay_to,
            "maxTimeoutSeconds": 3600,
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "extra": {"name": "USD Coin", "version": "2"}
        })
    }

    fn payload_json(spender: &str, permit_value: &str, amount: &str, deadline: u64) -> Value {
        serde_json::json!({
            "signature": "0x00",
            "permit": {
                "owner": "0x0000000000000000000000000000000000000001",
                "spender": spender,
                "value": permit_value,
                "deadline": deadline.to_string(),
                "nonce": "0",
            },
            "amount": amount,
        })
    }

    #[test]
    fn rejects_spender_mismatch() {
        let chain_id = ChainId::new("eip155", "8453");
        let requirements = requirements_json(
            "eip155:8453",
            "0x0000000000000000000000000000000000000002",
            "10",
        );
        let payload = payload_json(
            "0x0000000000000000000000000000000000000003",
            "1000",
            "10",
            UnixTimestamp::now().as_secs() + 3600,
        );
        let err = assert_preconditions(&chain_id, &payload, &requirements).unwrap_err();
        assert_eq!(err, ErrorReason::RecipientMismatch);
    }

    #[test]
    fn rejects_amount_above_session_cap() {
        let chain_id = ChainId::new("eip155", "8453");
        let requirements = requirements_json(
            "eip155:8453",
            "0x0000000000000000000000000000000000000002",
            "10",
        );
        let payload = payload_json(
            "0x0000000000000000000000000000000000000002",
            "100",
            "200",
            UnixTimestamp::now().as_secs() + 3600,
        );
        let err = assert_preconditions(&chain_id, &payload, &requirements).unwrap_err();
        assert_eq!(err, ErrorReason::AssetMismatch);
    }

    #[test]
    fn rejects_expired_permit() {
        let chain_id = ChainId::new("eip155", "8453");
        let requirements = requirements_json(
            "eip155:8453",
            "0x0000000000000000000000000000000000000002",
            "10",
        );
        let payload = payload_json(
            "0x0000000000000000000000000000000000000002",
            "100",
            "10",
            1,
        );
        let err = assert_preconditions(&chain_id, &payload, &requirements).unwrap_err();
        assert_eq!(err, ErrorReason::AuthorizationExpired);
    }
}
