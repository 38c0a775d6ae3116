//! Multiplexing provider — one engine chain, many logical callers.
//!
//! The provider owns the chain handle exclusively. Requests are encoded with
//! fresh ids by its [`RpcCoder`] and correlated through a pending map;
//! notifications are routed by subscription key, and notifications whose
//! subscription is not registered yet are kept as orphans until it is.
//!
//! Inbound text from the engine is consumed by a single reader task, so
//! responses and notifications are handled in delivery order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chainmux_engine::{AddChainRequest, ChainHandle, EngineChainId, EngineError, SharedEngine};
use chainmux_protocol::{Inbound, MuxError, RpcCoder, SubscriptionId, subscription_key};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::{HealthEvent, HealthTracker, SystemHealth};

/// Provider tuning.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Interval between `system_health` polls.
    pub health_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(10),
        }
    }
}

/// What the provider asks the engine to create.
#[derive(Debug, Clone)]
pub struct ChainRequest {
    pub chain_spec: String,
    pub potential_relay_chains: Vec<EngineChainId>,
}

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A chain exists and reports ready.
    Connected,
    /// The chain stopped being ready or was released.
    Disconnected,
    /// Readiness reported by the health tracker.
    Health(HealthEvent),
    /// Creating the chain failed; `connect` may be retried.
    ConnectFailed(MuxError),
    /// The chain died underneath the provider and was torn down.
    ChainLost(MuxError),
}

/// Receives every notification of one subscription.
///
/// Invoked with the provider locked: it must not call back into the provider.
pub type SubscriptionCallback = Arc<dyn Fn(Result<Value, MuxError>) + Send + Sync>;

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), MuxError>>>;

/// Request/response and subscription API over one engine chain.
pub struct Provider {
    engine: SharedEngine,
    request: ChainRequest,
    config: ProviderConfig,
    coder: RpcCoder,
    state: Mutex<ProviderState>,
    events: broadcast::Sender<ProviderEvent>,
}

struct ProviderState {
    phase: Phase,
    /// Bumped on every connect attempt; tasks and callbacks of older
    /// generations are ignored.
    generation: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value, MuxError>>>,
    subscriptions: HashMap<String, SubscriptionCallback>,
    orphans: HashMap<String, Vec<Result<Value, MuxError>>>,
    healthy: bool,
    last_health: Option<SystemHealth>,
}

enum Phase {
    Idle,
    Connecting(ConnectAttempt),
    Connected(Live),
    Closed,
}

struct Live {
    chain: Arc<dyn ChainHandle>,
    health: HealthTracker,
    reader: JoinHandle<()>,
}

impl Provider {
    pub fn new(engine: SharedEngine, request: ChainRequest, config: ProviderConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            engine,
            request,
            config,
            coder: RpcCoder::new(),
            state: Mutex::new(ProviderState {
                phase: Phase::Idle,
                generation: 0,
                pending: HashMap::new(),
                subscriptions: HashMap::new(),
                orphans: HashMap::new(),
                healthy: false,
                last_health: None,
            }),
            events,
        })
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create the chain if there is none. Concurrent calls share one attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<(), MuxError> {
        let attempt = {
            let mut state = self.state.lock();
            let in_flight = match &state.phase {
                Phase::Closed => return Err(MuxError::AlreadyDestroyed),
                Phase::Connected(_) => return Ok(()),
                Phase::Connecting(attempt) => Some(attempt.clone()),
                Phase::Idle => None,
            };
            match in_flight {
                Some(attempt) => attempt,
                None => {
                    state.generation += 1;
                    let attempt = establish(Arc::downgrade(self), state.generation)
                        .boxed()
                        .shared();
                    state.phase = Phase::Connecting(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Release the chain. Pending requests and subscriptions fail with
    /// `Disconnected`. No-op when not connected.
    pub async fn disconnect(&self) -> Result<(), MuxError> {
        self.settle().await;
        self.teardown(MuxError::Disconnected, None, false);
        Ok(())
    }

    /// Disconnect for good; every later operation fails with `AlreadyDestroyed`.
    pub async fn close(&self) {
        self.settle().await;
        self.teardown(MuxError::Disconnected, None, true);
    }

    /// Wait for an in-flight connect attempt to finish.
    async fn settle(&self) {
        let in_flight = match &self.state.lock().phase {
            Phase::Connecting(attempt) => Some(attempt.clone()),
            _ => None,
        };
        if let Some(attempt) = in_flight {
            let _ = attempt.await;
        }
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Issue one request and wait for its response.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, MuxError> {
        let rx = {
            let mut state = self.state.lock();
            let chain = match &state.phase {
                Phase::Connected(live) => live.chain.clone(),
                Phase::Closed => return Err(MuxError::AlreadyDestroyed),
                _ => return Err(MuxError::NotConnected),
            };
            let generation = state.generation;
            let (text, id) = self.coder.encode(method, params)?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);

            if let Err(e) = chain.send_json_rpc(text) {
                state.pending.remove(&id);
                drop(state);
                let error = translate(e);
                warn!("Sending {method} failed, dropping chain: {error}");
                if self.teardown(error.clone(), Some(generation), false) {
                    let _ = self.events.send(ProviderEvent::ChainLost(error.clone()));
                }
                return Err(error);
            }
            rx
        };
        rx.await.map_err(|_| MuxError::Disconnected)?
    }

    /// Register a subscription. Notifications that arrived before the
    /// registration response are replayed to `callback` first, in order.
    pub async fn subscribe(
        &self,
        notification_method: &str,
        subscribe_method: &str,
        params: Value,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, MuxError> {
        let generation = self.state.lock().generation;
        let result = self.send(subscribe_method, params).await?;
        let id: SubscriptionId = serde_json::from_value(result).map_err(|_| {
            MuxError::Decode(format!("{subscribe_method} did not return a subscription id"))
        })?;
        let key = subscription_key(notification_method, &id);

        let mut state = self.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Connected(_)) {
            return Err(MuxError::Disconnected);
        }
        if let Some(orphans) = state.orphans.remove(&key) {
            debug!("Replaying {} buffered notifications for {key}", orphans.len());
            for message in orphans {
                callback(message);
            }
        }
        state.subscriptions.insert(key, callback);
        Ok(id)
    }

    /// Cancel a subscription. Returns `false` if it is not known here.
    pub async fn unsubscribe(
        &self,
        notification_method: &str,
        unsubscribe_method: &str,
        id: &SubscriptionId,
    ) -> Result<bool, MuxError> {
        let key = subscription_key(notification_method, id);
        if self.state.lock().subscriptions.remove(&key).is_none() {
            debug!("{}", MuxError::UnknownSubscription(key));
            return Ok(false);
        }
        let result = self.send(unsubscribe_method, json!([id])).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Route one raw message delivered by the engine.
    pub fn route_inbound(&self, raw: &str) {
        let health = match &self.state.lock().phase {
            Phase::Connected(live) => Some(live.health.clone()),
            _ => None,
        };
        if let Some(health) = health {
            if !health.response_pass_through(raw) {
                return;
            }
        }

        let inbound = match RpcCoder::decode(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping inbound message: {e}");
                return;
            }
        };

        let mut state = self.state.lock();
        match inbound {
            Inbound::Response { id, result } => {
                match id.as_u64().and_then(|id| state.pending.remove(&id)) {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(MuxError::from));
                    }
                    None => debug!("No pending request for response {id}"),
                }
            }
            Inbound::Notification(notification) => {
                let key = notification.key();
                let message = notification.result.map_err(MuxError::from);
                match state.subscriptions.get(&key) {
                    Some(callback) => callback(message),
                    None => state.orphans.entry(key).or_default().push(message),
                }
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// True when a chain exists and the health tracker reports it ready.
    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        matches!(state.phase, Phase::Connected(_)) && state.healthy
    }

    /// True when a chain exists, healthy or not.
    pub fn has_chain(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Connected(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Closed)
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.state.lock().subscriptions.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Number of buffered notifications, across all keys.
    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphans.values().map(Vec::len).sum()
    }

    pub fn last_health(&self) -> Option<SystemHealth> {
        self.state.lock().last_health
    }

    pub fn engine_chain_id(&self) -> Option<EngineChainId> {
        match &self.state.lock().phase {
            Phase::Connected(live) => Some(live.chain.id()),
            _ => None,
        }
    }

    pub fn chain_spec(&self) -> &str {
        &self.request.chain_spec
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Install a freshly created chain, unless the attempt was superseded.
    fn install(
        self: &Arc<Self>,
        generation: u64,
        chain: Arc<dyn ChainHandle>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), MuxError> {
        let health = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Connecting(_)) {
                drop(state);
                let _ = chain.remove();
                return Err(MuxError::Disconnected);
            }

            let sender = chain.clone();
            let health = HealthTracker::new(
                Arc::new(move |text: String| sender.send_json_rpc(text).map_err(translate)),
                self.config.health_interval,
            );
            let reader = tokio::spawn(read_chain(Arc::downgrade(self), generation, inbound));
            info!("Chain {} connected", chain.id());
            state.phase = Phase::Connected(Live {
                chain,
                health: health.clone(),
                reader,
            });
            state.healthy = false;
            state.last_health = None;
            health
        };

        let weak = Arc::downgrade(self);
        health.start(Arc::new(move |event: HealthEvent| {
            if let Some(provider) = weak.upgrade() {
                provider.on_health(generation, event);
            }
        }));
        Ok(())
    }

    fn connect_failed(&self, generation: u64, error: MuxError) -> MuxError {
        {
            let mut state = self.state.lock();
            if state.generation == generation && matches!(state.phase, Phase::Connecting(_)) {
                state.phase = Phase::Idle;
            }
        }
        warn!("Failed to create chain: {error}");
        let _ = self.events.send(ProviderEvent::ConnectFailed(error.clone()));
        error
    }

    fn on_health(&self, generation: u64, event: HealthEvent) {
        let transition = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Connected(_)) {
                return;
            }
            state.last_health = event.health;
            let was_healthy = std::mem::replace(&mut state.healthy, event.ready);
            (was_healthy != event.ready).then_some(event.ready)
        };

        let _ = self.events.send(ProviderEvent::Health(event));
        match transition {
            Some(true) => {
                let _ = self.events.send(ProviderEvent::Connected);
            }
            Some(false) => {
                let _ = self.events.send(ProviderEvent::Disconnected);
            }
            None => {}
        }
    }

    fn chain_lost(&self, generation: u64) {
        let error = MuxError::Crash("the engine dropped the chain".into());
        if self.teardown(error.clone(), Some(generation), false) {
            warn!("Chain lost: {error}");
            let _ = self.events.send(ProviderEvent::ChainLost(error));
        }
    }

    /// Release the current chain and fail every waiter with `reason`.
    ///
    /// With `only` set, nothing happens unless that generation is current.
    /// Returns whether a chain was released.
    fn teardown(&self, reason: MuxError, only: Option<u64>, close: bool) -> bool {
        let (live, pending, subscriptions, was_healthy) = {
            let mut state = self.state.lock();
            if only.is_some_and(|generation| generation != state.generation) {
                return false;
            }
            let next = if close || matches!(state.phase, Phase::Closed) {
                Phase::Closed
            } else {
                Phase::Idle
            };
            let live = match std::mem::replace(&mut state.phase, next) {
                Phase::Connected(live) => Some(live),
                Phase::Connecting(attempt) if !close => {
                    // Leave an in-flight attempt alone unless closing
                    state.phase = Phase::Connecting(attempt);
                    None
                }
                _ => None,
            };
            state.orphans.clear();
            (
                live,
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.subscriptions),
                std::mem::replace(&mut state.healthy, false),
            )
        };

        if !pending.is_empty() || !subscriptions.is_empty() {
            debug!(
                "Failing {} pending requests and {} subscriptions: {reason}",
                pending.len(),
                subscriptions.len()
            );
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(reason.clone()));
        }
        for (_, callback) in subscriptions {
            callback(Err(reason.clone()));
        }

        let Some(live) = live else {
            return false;
        };
        live.health.stop();
        live.reader.abort();
        if let Err(e) = live.chain.remove() {
            debug!("Removing chain {}: {e}", live.chain.id());
        }
        info!("Chain {} released", live.chain.id());
        if was_healthy {
            let _ = self.events.send(ProviderEvent::Disconnected);
        }
        true
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        if let Phase::Connected(live) = &self.state.get_mut().phase {
            live.health.stop();
            live.reader.abort();
            let _ = live.chain.remove();
        }
    }
}

/// Create the chain for `provider`. Holds only a weak reference so an
/// abandoned attempt does not keep the provider alive.
async fn establish(provider: Weak<Provider>, generation: u64) -> Result<(), MuxError> {
    let (engine, request) = match provider.upgrade() {
        Some(p) => (p.engine.clone(), p.request.clone()),
        None => return Err(MuxError::AlreadyDestroyed),
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let created = engine
        .add_chain_dyn(AddChainRequest {
            chain_spec: request.chain_spec,
            potential_relay_chains: request.potential_relay_chains,
            json_rpc: Some(tx),
        })
        .await;

    let Some(provider) = provider.upgrade() else {
        if let Ok(chain) = created {
            let _ = chain.remove();
        }
        return Err(MuxError::AlreadyDestroyed);
    };
    match created {
        Ok(chain) => provider.install(generation, chain, rx),
        Err(e) => Err(provider.connect_failed(generation, translate(e))),
    }
}

/// Single consumer of a chain's inbound text.
async fn read_chain(provider: Weak<Provider>, generation: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(raw) = inbound.recv().await {
        let Some(provider) = provider.upgrade() else {
            return;
        };
        provider.route_inbound(&raw);
    }
    if let Some(provider) = provider.upgrade() {
        provider.chain_lost(generation);
    }
}

/// Map an engine failure onto the caller-facing taxonomy.
pub fn translate(error: EngineError) -> MuxError {
    match error {
        EngineError::AlreadyDestroyed => MuxError::AlreadyDestroyed,
        EngineError::Crash(message) => MuxError::Crash(message),
        EngineError::JsonRpcDisabled => MuxError::JsonRpcDisabled,
        EngineError::InvalidChainSpec(message) => MuxError::InvalidChainSpec(message),
        other @ (EngineError::Rejected(_) | EngineError::Unavailable(_)) => {
            MuxError::Crash(other.to_string())
        }
    }
}
