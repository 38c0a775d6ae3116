//! chainmux connection manager
//!
//! Owns the process-wide registry of shared chains and of the apps attached
//! to them. Transports hand it attach/detach requests and app payloads; it
//! never inspects JSON-RPC payloads itself, only identities.

pub mod app;
pub mod registry;
pub mod state;

pub use app::{AppId, AttachRequest, ChainIdentity};
pub use registry::{ConnectionManager, ManagerConfig};
pub use state::{AppState, ChainRef, ChainState, ManagerState};
