//! EIP-155 chain provider registry for the x402 facilitator.
//!
//! This binary serves payments over EVM-compatible (EIP-155) networks only;
//! see `DESIGN.md` for why Solana and Aptos support was dropped from this
//! deployment.
//!
//! # Example
//!
//! ```ignore
//! use x402_types::chain::{ChainId, ChainIdPattern};
//!
//! let base = ChainId::new("eip155", "8453");
//! let all_evm = ChainIdPattern::wildcard("eip155");
//! assert!(all_evm.matches(&base));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use x402_chain_eip155::chain::Eip155ChainProvider;
use x402_types::chain::{ChainProviderOps, ChainRegistry, FromConfig};

use crate::config::ChainsConfig;

/// Creates a new chain registry from configuration.
///
/// Initializes a provider for every configured EIP-155 network.
///
/// # Errors
///
/// Returns an error if any chain provider fails to initialize.
#[async_trait::async_trait]
impl FromConfig<ChainsConfig> for ChainRegistry<Arc<Eip155ChainProvider>> {
    async fn from_config(chains: &ChainsConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let mut providers = HashMap::new();
        for config in chains.iter() {
            let provider = Arc::new(Eip155ChainProvider::from_config(config).await?);
            providers.insert(provider.chain_id(), provider);
        }
        Ok(Self::new(providers))
    }
}
