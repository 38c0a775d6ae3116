//! App and chain identities.

use std::fmt;

use chainmux_protocol::ToManager;
use serde::{Deserialize, Serialize};

/// An app: a named caller living in one tab (or connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppId {
    pub name: String,
    pub tab_id: u64,
}

impl AppId {
    pub fn new(name: impl Into<String>, tab_id: u64) -> Self {
        Self {
            name: name.into(),
            tab_id,
        }
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.tab_id)
    }
}

/// How an app asks for a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachRequest {
    /// A chain the manager knows by name.
    WellKnown(String),
    /// An ad-hoc chain described by its spec.
    Custom {
        chain_spec: String,
        /// Names of chains the app already holds that may serve as relay chain.
        potential_relay_chain_ids: Vec<String>,
    },
}

impl AttachRequest {
    /// The attach request carried by a handshake message, if it is one.
    pub fn from_message(message: ToManager) -> Option<Self> {
        match message {
            ToManager::AddWellKnownChain(name) => Some(Self::WellKnown(name)),
            ToManager::AddChain {
                chain_spec,
                potential_relay_chain_ids,
            } => Some(Self::Custom {
                chain_spec,
                potential_relay_chain_ids,
            }),
            ToManager::Rpc(_) => None,
        }
    }
}

/// Identity under which a chain is shared between apps.
///
/// Well-known chains are shared by name; ad-hoc chains by the digest of
/// their raw spec, so two apps sending the same spec share one chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainIdentity {
    WellKnown(String),
    Custom(String),
}

impl fmt::Display for ChainIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WellKnown(name) => write!(f, "well-known:{name}"),
            Self::Custom(digest) => write!(f, "custom:{}", &digest[..digest.len().min(16)]),
        }
    }
}
