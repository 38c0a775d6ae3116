//! Chain specification parsing.
//!
//! Only the few top-level fields chainmux needs are read; the rest of the
//! spec is opaque and handed to the engine untouched.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::EngineError;

/// Identifying fields of a JSON chain specification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainSpecInfo {
    /// Human-readable chain name (e.g. "Westend").
    pub name: String,
    /// Chain id (e.g. "westend2").
    pub id: String,
    /// For parachains, the id of the relay chain.
    #[serde(default, alias = "relayChain")]
    pub relay_chain: Option<String>,
    /// For parachains, the parachain id.
    #[serde(default, alias = "paraId")]
    pub para_id: Option<u32>,
}

impl ChainSpecInfo {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::InvalidChainSpec(e.to_string()))
    }

    pub fn is_parachain(&self) -> bool {
        self.relay_chain.is_some()
    }
}

/// Hex SHA-256 of the raw spec text; identifies an ad-hoc chain.
pub fn spec_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}
