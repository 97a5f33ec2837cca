//! EIP-155 (EVM) chain support for the x402 payment protocol.
//!
//! This crate provides facilitator-side scheme implementations for EVM-compatible
//! blockchains using the EIP-155 chain ID standard: a one-shot "exact" payment
//! backed by ERC-3009 `transferWithAuthorization`, and a session-based "upto"
//! payment backed by an ERC-2612 `permit`.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`chain`] - Core EVM chain types, providers, and configuration
//! - [`exact`] - The "exact" scheme: EIP-3009 `transferWithAuthorization`
//! - [`upto`] - The "upto" scheme: ERC-2612 `permit` + `transferFrom`
//! - [`networks`] - Well-known EVM networks and their USDC deployments
//!
//! # Feature Flags
//!
//! - `facilitator` - Facilitator-side payment verification and settlement
//! - `telemetry` - Tracing support for the nonce manager and chain provider
//! - `full` - All of the above
//!
//! # Usage
//!
//! ```ignore
//! use x402_chain_eip155::chain::Eip155ChainProvider;
//! use x402_chain_eip155::{ExactEip155Blueprint, UptoEip155Blueprint};
//! use x402_types::chain::FromConfig;
//! use x402_types::scheme::{SchemeBlueprints, SchemeRegistry};
//!
//! let provider = Eip155ChainProvider::from_config(&config).await?;
//! let blueprints = SchemeBlueprints::new()
//!     .and_register(ExactEip155Blueprint)
//!     .and_register(UptoEip155Blueprint);
//! let registry = SchemeRegistry::build(&[(provider.chain_id(), provider)], &blueprints)?;
//! ```

pub mod chain;

#[cfg(feature = "facilitator")]
pub mod exact;
#[cfg(feature = "facilitator")]
pub mod upto;

mod networks;
pub use networks::*;

#[cfg(feature = "facilitator")]
pub use exact::ExactEip155Blueprint;
#[cfg(feature = "facilitator")]
pub use upto::UptoEip155Blueprint;
