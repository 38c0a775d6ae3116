//! chainmux protocol types
//!
//! JSON-RPC 2.0 types shared by every chainmux crate: the wire envelopes,
//! the error taxonomy that crosses the provider boundary, the request coder
//! used on a shared chain connection, the table of subscription methods and
//! the message schema spoken between an app and the connection manager.

pub mod coder;
pub mod error;
pub mod jsonrpc;
pub mod messages;
pub mod methods;

pub use coder::{Inbound, RpcCoder, SubscriptionNotification};
pub use error::{ErrorCode, MuxError, RpcError};
pub use jsonrpc::{
    ErrorResponse, Notification, Request, RequestId, Response, SubscriptionId, SuccessResponse,
    subscription_key,
};
pub use messages::{ToApp, ToManager};
pub use methods::{Methods, SubscriptionMethods};
