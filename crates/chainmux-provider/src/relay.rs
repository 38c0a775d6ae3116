//! Per-app relay — gives one app its own request and subscription namespace
//! on a shared provider.
//!
//! App requests are re-issued through the provider, which assigns fresh wire
//! ids, and answered with the app's own id. Subscriptions created by the app
//! are tracked here so that an app can only cancel its own, and so that all
//! of them are cancelled when the app goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chainmux_protocol::methods::{self, SubscriptionMethods};
use chainmux_protocol::{
    MuxError, Notification, Request, RequestId, Response, RpcError, SubscriptionId, ToApp,
    subscription_key,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{Provider, SubscriptionCallback};

/// A subscription created by this app.
#[derive(Debug, Clone)]
struct OwnedSubscription {
    methods: &'static SubscriptionMethods,
    id: SubscriptionId,
}

/// One app's view of a shared chain.
pub struct AppRelay {
    label: String,
    provider: Arc<Provider>,
    outbound: mpsc::UnboundedSender<ToApp>,
    subscriptions: Mutex<HashMap<String, OwnedSubscription>>,
    closed: AtomicBool,
}

impl AppRelay {
    pub fn new(
        label: impl Into<String>,
        provider: Arc<Provider>,
        outbound: mpsc::UnboundedSender<ToApp>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            provider,
            outbound,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of live subscriptions this app holds.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Accept one JSON-RPC payload from the app. Processed in the background;
    /// the answer goes to the app's outbound channel.
    pub fn handle(self: &Arc<Self>, payload: String) {
        let relay = self.clone();
        tokio::spawn(async move {
            if let Some(response) = relay.dispatch(&payload).await {
                relay.reply(&response);
            }
        });
    }

    /// Process one payload and produce the response for the app.
    ///
    /// Subscription notifications start flowing only after the subscribe
    /// response has been queued, so the app always sees the id first.
    pub async fn dispatch(self: &Arc<Self>, payload: &str) -> Option<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return Some(Response::error(None, RpcError::parse_error(e.to_string()))),
        };
        if value.is_object() && value.get("id").is_none() {
            // Notifications get no answer
            debug!("[{}] ignoring notification from app", self.label);
            return None;
        }
        let request: Request = match serde_json::from_value(value.clone()) {
            Ok(r) => r,
            Err(e) => {
                let id = value
                    .get("id")
                    .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
                return Some(Response::error(id, RpcError::invalid_request(e.to_string())));
            }
        };
        if !request.is_valid() {
            return Some(Response::error(
                Some(request.id),
                RpcError::invalid_request("jsonrpc must be \"2.0\" and method must be set"),
            ));
        }

        let id = request.id;
        let params = request.params.unwrap_or_else(|| json!([]));
        let result = if let Some(methods) = methods::by_subscribe(&request.method) {
            match self.subscribe(methods, params).await {
                Ok((sub_id, notifications)) => {
                    self.reply(&Response::success(id, json!(sub_id)));
                    self.forward(methods, sub_id, notifications);
                    return None;
                }
                Err(e) => Err(e),
            }
        } else if let Some(methods) = methods::by_unsubscribe(&request.method) {
            self.unsubscribe(methods, &params).await.map(Value::Bool)
        } else {
            self.provider.send(&request.method, params).await
        };

        Some(match result {
            Ok(value) => Response::success(id, value),
            Err(e) => Response::error(Some(id), e.to_rpc_error()),
        })
    }

    async fn subscribe(
        &self,
        methods: &'static SubscriptionMethods,
        params: Value,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Result<Value, MuxError>>), MuxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: SubscriptionCallback = Arc::new(move |message: Result<Value, MuxError>| {
            let _ = tx.send(message);
        });
        let sub_id = self
            .provider
            .subscribe(methods.notification, methods.subscribe, params, callback)
            .await?;

        let key = subscription_key(methods.notification, &sub_id);
        let registered = {
            let mut subscriptions = self.subscriptions.lock();
            // `close` sets the flag before it drains
            let open = !self.closed.load(Ordering::SeqCst);
            if open {
                subscriptions.insert(
                    key,
                    OwnedSubscription {
                        methods,
                        id: sub_id.clone(),
                    },
                );
            }
            open
        };
        if !registered {
            debug!("[{}] closed while subscribing, cancelling {}", self.label, sub_id);
            if let Err(e) = self
                .provider
                .unsubscribe(methods.notification, methods.unsubscribe, &sub_id)
                .await
            {
                debug!("[{}] cancelling {} failed: {e}", self.label, sub_id);
            }
            return Err(MuxError::Disconnected);
        }
        debug!("[{}] subscribed {} {}", self.label, methods.subscribe, sub_id);
        Ok((sub_id, rx))
    }

    /// Re-encode notifications of one subscription for this app.
    fn forward(
        self: &Arc<Self>,
        methods: &'static SubscriptionMethods,
        sub_id: SubscriptionId,
        mut notifications: mpsc::UnboundedReceiver<Result<Value, MuxError>>,
    ) {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(message) = notifications.recv().await {
                let text = match message {
                    Ok(result) => {
                        let notification = Notification::subscription(methods.notification, &sub_id, result);
                        serde_json::to_string(&notification).unwrap_or_default()
                    }
                    Err(MuxError::Rpc(error)) => json!({
                        "jsonrpc": "2.0",
                        "method": methods.notification,
                        "params": {"subscription": sub_id, "error": error},
                    })
                    .to_string(),
                    Err(e) => {
                        // Chain torn down; the subscription is gone
                        debug!("[{}] subscription {} ended: {e}", relay.label, sub_id);
                        relay
                            .subscriptions
                            .lock()
                            .remove(&subscription_key(methods.notification, &sub_id));
                        break;
                    }
                };
                if relay.outbound.send(ToApp::Rpc(text)).is_err() {
                    break;
                }
            }
        });
    }

    async fn unsubscribe(&self, methods: &'static SubscriptionMethods, params: &Value) -> Result<bool, MuxError> {
        let sub_id: SubscriptionId = params
            .get(0)
            .cloned()
            .and_then(|id| serde_json::from_value(id).ok())
            .ok_or_else(|| RpcError::invalid_params("expected a subscription id"))?;

        let key = subscription_key(methods.notification, &sub_id);
        if self.subscriptions.lock().remove(&key).is_none() {
            // Unknown here, or owned by another app
            debug!("[{}] {}", self.label, MuxError::UnknownSubscription(key));
            return Ok(false);
        }
        self.provider
            .unsubscribe(methods.notification, methods.unsubscribe, &sub_id)
            .await
    }

    fn reply(&self, response: &Response) {
        match serde_json::to_string(response) {
            Ok(text) => {
                if self.outbound.send(ToApp::Rpc(text)).is_err() {
                    debug!("[{}] app is gone, dropping response", self.label);
                }
            }
            Err(e) => warn!("[{}] failed to encode response: {e}", self.label),
        }
    }

    /// Stop accepting requests and cancel every subscription this app holds.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned: Vec<OwnedSubscription> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for subscription in owned {
            let methods = subscription.methods;
            match self
                .provider
                .unsubscribe(methods.notification, methods.unsubscribe, &subscription.id)
                .await
            {
                Ok(_) => debug!("[{}] cancelled {} {}", self.label, methods.subscribe, subscription.id),
                Err(e) => debug!("[{}] cancelling {} failed: {e}", self.label, subscription.id),
            }
        }
    }
}
