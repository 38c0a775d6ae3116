//! Externally visible manager state.

use serde::{Deserialize, Serialize};

/// Snapshot emitted on every visible change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerState {
    /// Apps in the order they first attached.
    pub apps: Vec<AppState>,
    /// Chains in the order they were created.
    pub chains: Vec<ChainState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub name: String,
    pub tab_id: u64,
    /// Chains in the order the app attached to them.
    pub chains: Vec<ChainRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub name: String,
    pub healthy: bool,
    pub peers: Option<u64>,
    pub is_syncing: Option<bool>,
    pub ref_count: usize,
}

impl ManagerState {
    /// App names with their chain names, as `(name, [chain, ...])`.
    pub fn app_chains(&self) -> Vec<(&str, Vec<&str>)> {
        self.apps
            .iter()
            .map(|app| {
                (
                    app.name.as_str(),
                    app.chains.iter().map(|c| c.name.as_str()).collect(),
                )
            })
            .collect()
    }
}
