//! Request encoding and inbound message classification for one chain connection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::{MuxError, RpcError};
use crate::jsonrpc::{Request, RequestId, SubscriptionId, subscription_key};

/// Encodes outgoing requests with connection-unique ids and decodes raw
/// inbound text into responses or subscription notifications.
///
/// Ids start at 1 and increase strictly for the lifetime of the coder.
#[derive(Debug)]
pub struct RpcCoder {
    next_id: AtomicU64,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a request previously sent on this connection.
    Response {
        id: RequestId,
        result: Result<Value, RpcError>,
    },
    /// A notification for a server-side subscription.
    Notification(SubscriptionNotification),
}

/// A `{ method, params: { subscription, result } }` message.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionNotification {
    pub method: String,
    pub subscription: SubscriptionId,
    pub result: Result<Value, RpcError>,
}

impl SubscriptionNotification {
    /// `<method>::<subscription>` — matches the key built at subscribe time.
    pub fn key(&self) -> String {
        subscription_key(&self.method, &self.subscription)
    }
}

impl RpcCoder {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Encode a request, returning the wire text and the id it was assigned.
    pub fn encode(&self, method: &str, params: Value) -> Result<(String, u64), MuxError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wire_id = i64::try_from(id)
            .map_err(|_| MuxError::Decode("request id space exhausted".into()))?;
        let request = Request::new(RequestId::Number(wire_id), method, Some(params));
        let text = serde_json::to_string(&request).map_err(|e| MuxError::Decode(e.to_string()))?;
        Ok((text, id))
    }

    /// Classify raw inbound text.
    ///
    /// Anything with a `method` and a `params.subscription` is a notification,
    /// whatever its `id`. Everything else must be a response carrying an `id`
    /// and either `result` or `error`.
    pub fn decode(raw: &str) -> Result<Inbound, MuxError> {
        let parsed: Value =
            serde_json::from_str(raw).map_err(|e| MuxError::Decode(format!("invalid JSON: {e}")))?;
        let object = parsed
            .as_object()
            .ok_or_else(|| MuxError::Decode("message is not an object".into()))?;

        if let Some(method) = object.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| MuxError::Decode("method is not a string".into()))?;
            let params = object.get("params");
            let subscription = params
                .and_then(|p| p.get("subscription"))
                .ok_or_else(|| MuxError::Decode(format!("{method} is not a subscription notification")))?;
            let subscription: SubscriptionId = serde_json::from_value(subscription.clone())
                .map_err(|_| MuxError::Decode(format!("invalid subscription id in {method}")))?;
            let result = match params.and_then(|p| p.get("error")) {
                Some(error) => Err(decode_error(error)?),
                None => Ok(params
                    .and_then(|p| p.get("result"))
                    .cloned()
                    .unwrap_or(Value::Null)),
            };
            return Ok(Inbound::Notification(SubscriptionNotification {
                method: method.to_string(),
                subscription,
                result,
            }));
        }

        let id: RequestId = object
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| MuxError::Decode("response has no usable id".into()))?;

        let result = if let Some(error) = object.get("error") {
            Err(decode_error(error)?)
        } else if let Some(result) = object.get("result") {
            Ok(result.clone())
        } else {
            return Err(MuxError::Decode(format!(
                "response {id} has neither result nor error"
            )));
        };

        Ok(Inbound::Response { id, result })
    }
}

impl Default for RpcCoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_error(error: &Value) -> Result<RpcError, MuxError> {
    serde_json::from_value(error.clone())
        .map_err(|e| MuxError::Decode(format!("invalid error object: {e}")))
}
