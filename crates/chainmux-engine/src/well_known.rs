//! Chains known to the process by name.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::EngineError;
use crate::spec::ChainSpecInfo;

/// Names apps are expected to ask for.
pub const DEFAULT_NAMES: &[&str] = &["polkadot", "kusama", "rococo", "westend"];

/// Name → chain spec table.
#[derive(Debug, Clone, Default)]
pub struct WellKnownChains {
    specs: BTreeMap<String, Arc<str>>,
}

impl WellKnownChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec under `name`, validating that it parses.
    pub fn insert(&mut self, name: impl Into<String>, spec: impl Into<Arc<str>>) -> Result<(), EngineError> {
        let spec = spec.into();
        ChainSpecInfo::parse(&spec)?;
        self.specs.insert(name.into(), spec);
        Ok(())
    }

    /// Read a spec file from disk and register it under `name`.
    pub fn load_file(&mut self, name: &str, path: &Path) -> Result<(), EngineError> {
        let spec = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidChainSpec(format!("{}: {e}", path.display()))
        })?;
        self.insert(name, spec)?;
        info!("Loaded well-known chain {name} from {}", path.display());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<str>> {
        self.specs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
