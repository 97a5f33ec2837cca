//! The payment scheme system: per-(network, scheme) dispatch (C1/C2).
//!
//! A [`SchemeFacilitator`] implements one payment scheme (e.g. `"exact"`,
//! `"upto"`) for one chain family. The [`SchemeRegistry`] maps a CAIP-2
//! network pattern and scheme name to the concrete facilitator that should
//! handle it, resolved in registration order so the first matching pattern
//! wins ties between overlapping wildcards.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::{ChainId, ChainIdPattern};
use crate::proto::{SettleResponse, SupportedPaymentKind, SupportedResponse, VerifyResponse};

/// Identifies which registered scheme handler a wire request targets.
///
/// `x402_version` does not participate in handler resolution (the same
/// handler serves both v1 and v2 wire shapes for a given network/scheme);
/// it is carried through for response version-normalization at the HTTP
/// layer (`GET /supported`, original §4.11).
#[derive(Debug, Clone)]
pub struct SchemeHandlerSlug {
    pub chain_id: ChainId,
    pub x402_version: u8,
    pub scheme: String,
}

impl SchemeHandlerSlug {
    pub fn new(chain_id: ChainId, x402_version: u8, scheme: impl Into<String>) -> Self {
        Self {
            chain_id,
            x402_version,
            scheme: scheme.into(),
        }
    }
}

/// Server-side role implementing one payment scheme (original §4.1).
///
/// `verify`/`settle` never fail with a Rust error: every protocol, state, or
/// chain-level rejection is encoded in the returned response value, per the
/// "application-level failures are values, not exceptions" propagation
/// policy (original §7).
#[async_trait]
pub trait SchemeFacilitator: Send + Sync + std::fmt::Debug {
    /// The scheme name this facilitator answers for, e.g. `"exact"`.
    fn scheme(&self) -> &'static str;

    async fn verify(&self, payload: &Value, requirements: &Value) -> VerifyResponse;

    async fn settle(&self, payload: &Value, requirements: &Value) -> SettleResponse;

    /// Scheme-specific extra advertised in `GET /supported` for `network`.
    fn extra(&self, network: &ChainId) -> Option<Value> {
        let _ = network;
        None
    }

    /// Addresses this facilitator can settle from, for `network`.
    fn signers(&self, network: &ChainId) -> Vec<String>;
}

/// Builds a [`SchemeFacilitator`] from a chain provider `P`, for one scheme.
///
/// Implemented once per (chain family, scheme) pair, e.g. the eip155 exact
/// and upto schemes each implement this over `Eip155ChainProvider`.
pub trait SchemeFacilitatorBuilder<P>: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// The network pattern this blueprint is eligible for, e.g.
    /// `ChainIdPattern::wildcard("eip155")`.
    fn network_pattern(&self) -> ChainIdPattern;

    fn build(
        &self,
        provider: &P,
        config: Option<Value>,
    ) -> Result<Arc<dyn SchemeFacilitator>, Box<dyn std::error::Error>>;
}

/// An ordered collection of scheme blueprints, expanded against a chain
/// registry at startup to produce a [`SchemeRegistry`] (original §4.12).
pub struct SchemeBlueprints<P> {
    entries: Vec<Arc<dyn SchemeFacilitatorBuilder<P>>>,
}

impl<P> Default for SchemeBlueprints<P> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<P> SchemeBlueprints<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and_register(mut self, blueprint: impl SchemeFacilitatorBuilder<P> + 'static) -> Self {
        self.entries.push(Arc::new(blueprint));
        self
    }
}

/// Error produced while assembling a [`SchemeRegistry`] at startup.
#[derive(Debug, thiserror::Error)]
pub enum SchemeRegistryError {
    #[error("duplicate registration for network {network} scheme {scheme:?}")]
    DuplicateRegistration { network: ChainId, scheme: String },
    #[error("failed to build scheme facilitator for network {network} scheme {scheme:?}: {source}")]
    Build {
        network: ChainId,
        scheme: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

type SchemeMap = HashMap<String, Arc<dyn SchemeFacilitator>>;

/// Immutable, write-once-at-startup dispatch table mapping a (network,
/// scheme) query to its facilitator (original §4.2).
#[derive(Default)]
pub struct SchemeRegistry {
    /// `(pattern, schemes)` in registration order; first matching pattern
    /// wins for a given scheme name.
    entries: Vec<(ChainIdPattern, SchemeMap)>,
}

impl SchemeRegistry {
    /// Expands `blueprints` against every chain registered in
    /// `known_networks`, building one concrete facilitator per matching
    /// (chain, scheme) pair. Registration is fatal on duplicates.
    pub fn build<P>(
        known_networks: &[(ChainId, P)],
        blueprints: &SchemeBlueprints<P>,
    ) -> Result<Self, SchemeRegistryError> {
        let mut registry = SchemeRegistry::default();
        for blueprint in &blueprints.entries {
            let pattern = blueprint.network_pattern();
            let scheme = blueprint.scheme();
            let mut map = SchemeMap::new();
            for (chain_id, provider) in known_networks {
                if !pattern.matches(chain_id) {
                    continue;
                }
                let facilitator = blueprint.build(provider, None).map_err(|source| {
                    SchemeRegistryError::Build {
                        network: chain_id.clone(),
                        scheme: scheme.to_string(),
                        source: source.into(),
                    }
                })?;
                map.insert(scheme.to_string(), facilitator);
            }
            if !map.is_empty() {
                registry.register(pattern, map)?;
            }
        }
        Ok(registry)
    }

    fn register(&mut self, pattern: ChainIdPattern, schemes: SchemeMap) -> Result<(), SchemeRegistryError> {
        for (existing_pattern, existing_schemes) in &self.entries {
            if existing_pattern == &pattern {
                for scheme in schemes.keys() {
                    if existing_schemes.contains_key(scheme) {
                        return Err(SchemeRegistryError::DuplicateRegistration {
                            network: ChainId::new(pattern.namespace(), "*"),
                            scheme: scheme.clone(),
                        });
                    }
                }
            }
        }
        self.entries.push((pattern, schemes));
        Ok(())
    }

    /// Resolves the facilitator for `(chain_id, scheme)`, honoring
    /// registration order: the first pattern whose family matches and whose
    /// reference is `*` or exactly equal wins.
    pub fn resolve(&self, chain_id: &ChainId, scheme: &str) -> Option<Arc<dyn SchemeFacilitator>> {
        for (pattern, schemes) in &self.entries {
            if pattern.matches(chain_id) {
                if let Some(handler) = schemes.get(scheme) {
                    return Some(Arc::clone(handler));
                }
            }
        }
        None
    }

    /// Union of every registered (network, scheme) pair, for `GET
    /// /supported`. `known_networks` resolves wildcard patterns to the
    /// concrete networks the facilitator actually knows signers for.
    pub fn supported(&self, known_networks: &[ChainId]) -> SupportedResponse {
        let mut kinds = Vec::new();
        let mut signers: HashMap<ChainId, Vec<String>> = HashMap::new();
        for (pattern, schemes) in &self.entries {
            let matching: Vec<&ChainId> = known_networks.iter().filter(|n| pattern.matches(n)).collect();
            for network in matching {
                for (scheme_name, handler) in schemes {
                    kinds.push(SupportedPaymentKind {
                        x402_version: 2,
                        scheme: scheme_name.clone(),
                        network: network.to_string(),
                        extra: handler.extra(network),
                    });
                    signers
                        .entry(network.clone())
                        .or_default()
                        .extend(handler.signers(network));
                }
            }
        }
        for addrs in signers.values_mut() {
            addrs.sort();
            addrs.dedup();
        }
        SupportedResponse {
            kinds,
            extensions: Vec::new(),
            signers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DummyScheme(&'static str);

    #[async_trait]
    impl SchemeFacilitator for DummyScheme {
        fn scheme(&self) -> &'static str {
            self.0
        }
        async fn verify(&self, _payload: &Value, _requirements: &Value) -> VerifyResponse {
            VerifyResponse::valid("0xabc")
        }
        async fn settle(&self, _payload: &Value, _requirements: &Value) -> SettleResponse {
            SettleResponse::success(ChainId::new("eip155", "8453"), "0xdead", "0xabc")
        }
        fn signers(&self, _network: &ChainId) -> Vec<String> {
            vec!["0xabc".into()]
        }
    }

    #[test]
    fn resolves_first_matching_pattern_in_registration_order() {
        let mut registry = SchemeRegistry::default();
        let mut exact = SchemeMap::new();
        exact.insert("exact".into(), Arc::new(DummyScheme("exact")) as Arc<dyn SchemeFacilitator>);
        registry
            .register(ChainIdPattern::wildcard("eip155"), exact)
            .unwrap();

        let base = ChainId::new("eip155", "8453");
        assert!(registry.resolve(&base, "exact").is_some());
        assert!(registry.resolve(&base, "upto").is_none());
    }

    #[test]
    fn duplicate_pattern_scheme_registration_is_fatal() {
        let mut registry = SchemeRegistry::default();
        let mut map = SchemeMap::new();
        map.insert("exact".into(), Arc::new(DummyScheme("exact")) as Arc<dyn SchemeFacilitator>);
        registry
            .register(ChainIdPattern::wildcard("eip155"), map.clone())
            .unwrap();
        let err = registry.register(ChainIdPattern::wildcard("eip155"), map).unwrap_err();
        assert!(matches!(err, SchemeRegistryError::DuplicateRegistration { .. }));
    }
}
