//! Messages exchanged between an app and the connection manager.
//!
//! Protocol flow on one app port (one port carries one chain):
//!   1. App sends `add-chain` or `add-well-known-chain`
//!   2. Manager answers exactly once with `chain-added-ok` or `chain-added-ko`
//!   3. Both sides exchange `rpc` messages carrying opaque JSON-RPC text
//!   4. Manager may send `crash-error` and close the port at any time
//!
//! Encoded as `{ "type": "...", "payload": ... }`.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// App → Manager
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ToManager {
    /// Attach to a chain described by an ad-hoc chain spec.
    AddChain {
        #[serde(rename = "chainSpec")]
        chain_spec: String,
        /// Names of chains this app already holds that may serve as relay chain.
        #[serde(rename = "potentialRelayChainIds", default)]
        potential_relay_chain_ids: Vec<String>,
    },
    /// Attach to a chain known to the manager by name.
    AddWellKnownChain(String),
    /// A JSON-RPC request for the attached chain.
    Rpc(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager → App
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ToApp {
    ChainAddedOk,
    /// The chain could not be added; carries the reason.
    ChainAddedKo(String),
    /// A JSON-RPC response or notification for this app only.
    Rpc(String),
    /// The chain failed irrecoverably; the port is closed after this message.
    CrashError(String),
}

impl ToManager {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ToApp {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
