//! chainmux transport layer
//!
//! Carries the app ⇄ manager message schema over WebSocket. One socket is
//! one "port": it attaches to exactly one chain during its handshake and
//! carries that chain's JSON-RPC traffic until either side closes.
//!
//! - [`server`]: axum server in front of a [`chainmux_server::ConnectionManager`]
//! - [`client`]: [`RelayClient`], an [`chainmux_engine::Engine`] whose chains
//!   live in a remote manager

pub mod client;
pub mod server;

pub use client::{RelayClient, RelayClientConfig};
pub use server::{TransportConfig, TransportError, TransportServer};
