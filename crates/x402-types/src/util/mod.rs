//! Utility types and functions for x402.
//!
//! This module provides various helper types used throughout the x402 crate:
//!
//! - [`b64`] - Base64 encoding/decoding utilities
//! - [`money_amount`] - Human-readable currency amount parsing
//! - [`canonical_json`] - Deterministic JSON serialization for audit hashing

pub mod b64;
pub mod canonical_json;
pub mod money_amount;

pub use b64::*;
pub use canonical_json::*;
