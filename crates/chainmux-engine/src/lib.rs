//! Chain engine interface
//!
//! The engine is the component that actually runs a chain (a light client,
//! a remote node, a relay to another process). chainmux only ever talks to it
//! through this interface:
//!
//! - [`Engine::add_chain`] creates a chain and returns its [`ChainHandle`]
//! - [`ChainHandle::send_json_rpc`] forwards raw JSON-RPC text to the chain
//! - [`ChainHandle::remove`] destroys the chain
//! - raw JSON-RPC text coming back from the chain is pushed into the
//!   [`JsonRpcSender`] given at creation; the engine drops the sender when the
//!   chain is gone
//!
//! Implementations live in [`upstream`] (a WebSocket JSON-RPC node per chain)
//! and [`memory`] (an in-process loopback used for tests and local runs).

pub mod memory;
pub mod spec;
pub mod upstream;
pub mod well_known;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

pub use spec::ChainSpecInfo;
pub use well_known::WellKnownChains;

/// Channel on which an engine delivers raw JSON-RPC text for one chain.
pub type JsonRpcSender = mpsc::UnboundedSender<String>;

/// Engine-local identifier of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineChainId(pub u64);

impl fmt::Display for EngineChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain#{}", self.0)
    }
}

/// Failures an engine can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("chain has already been destroyed")]
    AlreadyDestroyed,

    #[error("engine crashed: {0}")]
    Crash(String),

    #[error("JSON-RPC is disabled for this chain")]
    JsonRpcDisabled,

    #[error("invalid chain spec: {0}")]
    InvalidChainSpec(String),

    #[error("chain was rejected: {0}")]
    Rejected(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Parameters of [`Engine::add_chain`].
pub struct AddChainRequest {
    /// Raw chain specification text.
    pub chain_spec: String,
    /// Chains created by the same engine that may act as this chain's relay chain.
    pub potential_relay_chains: Vec<EngineChainId>,
    /// Where inbound JSON-RPC text goes. `None` disables JSON-RPC for the chain.
    pub json_rpc: Option<JsonRpcSender>,
}

/// A live chain inside an engine.
pub trait ChainHandle: Send + Sync {
    fn id(&self) -> EngineChainId;

    /// Forward one JSON-RPC request. Never blocks; responses arrive on the
    /// chain's [`JsonRpcSender`].
    fn send_json_rpc(&self, rpc: String) -> Result<(), EngineError>;

    /// Destroy the chain. A second call fails with `AlreadyDestroyed`.
    fn remove(&self) -> Result<(), EngineError>;
}

/// Trait implemented by every chain engine.
pub trait Engine: Send + Sync + 'static {
    /// Create a chain.
    fn add_chain(
        &self,
        request: AddChainRequest,
    ) -> impl Future<Output = Result<Arc<dyn ChainHandle>, EngineError>> + Send;
}

/// Object-safe wrapper for the Engine trait.
pub trait EngineDyn: Send + Sync {
    fn add_chain_dyn(
        &self,
        request: AddChainRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ChainHandle>, EngineError>> + Send + '_>>;
}

impl<T: Engine> EngineDyn for T {
    fn add_chain_dyn(
        &self,
        request: AddChainRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ChainHandle>, EngineError>> + Send + '_>> {
        Box::pin(self.add_chain(request))
    }
}

/// An engine shared between every provider of a process.
pub type SharedEngine = Arc<dyn EngineDyn>;

/// Lifecycle of a chain handle whose traffic is carried by background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Alive,
    Removed,
    Crashed(String),
}

impl ChainStatus {
    /// Fail the way an operation on a chain in this state must fail.
    pub fn check(&self) -> Result<(), EngineError> {
        match self {
            Self::Alive => Ok(()),
            Self::Removed => Err(EngineError::AlreadyDestroyed),
            Self::Crashed(reason) => Err(EngineError::Crash(reason.clone())),
        }
    }
}
