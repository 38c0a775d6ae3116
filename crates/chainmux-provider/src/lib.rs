//! chainmux provider layer
//!
//! - [`HealthTracker`] polls a chain's `system_health` and reports readiness changes
//! - [`Provider`] multiplexes many logical callers over one engine chain
//! - [`AppRelay`] gives one app an isolated request/subscription namespace on a provider

pub mod health;
pub mod provider;
pub mod relay;

pub use health::{HEALTH_REQUEST_PREFIX, HealthEvent, HealthTracker, SystemHealth};
pub use provider::{ChainRequest, Provider, ProviderConfig, ProviderEvent, SubscriptionCallback, translate};
pub use relay::AppRelay;
