//! The facilitator contract (C3): the role both the in-process engine
//! ([`x402_facilitator_local`]) and an HTTP-backed client
//! ([`x402_axum::facilitator_client`]) implement.

use async_trait::async_trait;

use crate::proto::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse};

/// A payment facilitator: verifies and settles payments, and advertises
/// what it supports. Implementations never fail verify/settle with a Rust
/// error for application-level rejections (original §7); `Error` here
/// covers only transport/programming failures (a downed RPC endpoint, an
/// unreachable facilitator over HTTP).
#[async_trait]
pub trait Facilitator: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, Self::Error>;

    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, Self::Error>;

    async fn supported(&self) -> Result<SupportedResponse, Self::Error>;
}
