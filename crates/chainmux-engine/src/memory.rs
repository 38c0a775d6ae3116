//! In-process loopback engine.
//!
//! Chains created here keep every request they are sent, optionally answer
//! requests through a [`Responder`], and let the owner push arbitrary inbound
//! text (responses, notifications) or simulate a crash. Used by tests and by
//! the binary's `--engine memory` mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

use crate::{AddChainRequest, ChainHandle, Engine, EngineChainId, EngineError, JsonRpcSender};

/// Computes the `result` for a request `(method, params)`; `None` leaves it unanswered.
pub type Responder = Arc<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;

/// Loopback engine recording every chain it creates.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Mutex<MemoryState>>,
    responder: Option<Responder>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    chains: Vec<Arc<MemoryChain>>,
    removed: usize,
    fail_next_add: Option<EngineError>,
}

/// A chain living in a [`MemoryEngine`].
pub struct MemoryChain {
    id: EngineChainId,
    chain_spec: String,
    potential_relay_chains: Vec<EngineChainId>,
    json_rpc_enabled: bool,
    json_rpc: Mutex<Option<JsonRpcSender>>,
    sent: Mutex<Vec<String>>,
    removed: AtomicBool,
    fail_sends: AtomicBool,
    responder: Option<Responder>,
    engine: Arc<Mutex<MemoryState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose chains answer requests through `responder`.
    pub fn with_responder(
        responder: impl Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::default(),
            responder: Some(Arc::new(responder)),
        }
    }

    /// Make the next `add_chain` fail with `error`.
    pub fn fail_next_add(&self, error: EngineError) {
        self.inner.lock().fail_next_add = Some(error);
    }

    /// Every chain ever created, in creation order.
    pub fn chains(&self) -> Vec<Arc<MemoryChain>> {
        self.inner.lock().chains.clone()
    }

    pub fn last_chain(&self) -> Option<Arc<MemoryChain>> {
        self.inner.lock().chains.last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().chains.len()
    }

    pub fn removed_count(&self) -> usize {
        self.inner.lock().removed
    }

    /// Chains created and not yet removed.
    pub fn live_count(&self) -> usize {
        let state = self.inner.lock();
        state.chains.len() - state.removed
    }
}

impl Engine for MemoryEngine {
    async fn add_chain(&self, request: AddChainRequest) -> Result<Arc<dyn ChainHandle>, EngineError> {
        // Yield once so concurrent callers observe an in-flight creation.
        tokio::task::yield_now().await;

        let mut state = self.inner.lock();
        if let Some(error) = state.fail_next_add.take() {
            return Err(error);
        }
        state.next_id += 1;
        let chain = Arc::new(MemoryChain {
            id: EngineChainId(state.next_id),
            chain_spec: request.chain_spec,
            potential_relay_chains: request.potential_relay_chains,
            json_rpc_enabled: request.json_rpc.is_some(),
            json_rpc: Mutex::new(request.json_rpc),
            sent: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            responder: self.responder.clone(),
            engine: self.inner.clone(),
        });
        state.chains.push(chain.clone());
        debug!("memory engine created {}", chain.id);
        Ok(chain)
    }
}

impl MemoryChain {
    pub fn chain_spec(&self) -> &str {
        &self.chain_spec
    }

    pub fn potential_relay_chains(&self) -> &[EngineChainId] {
        &self.potential_relay_chains
    }

    /// Every request text received so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Received requests parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Push inbound text to whoever owns the chain. Returns false once the
    /// chain is gone.
    pub fn deliver(&self, raw: impl Into<String>) -> bool {
        match self.json_rpc.lock().as_ref() {
            Some(tx) => tx.send(raw.into()).is_ok(),
            None => false,
        }
    }

    /// Answer request `id` with `result`.
    pub fn respond(&self, id: &Value, result: Value) -> bool {
        self.deliver(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
    }

    /// Make subsequent sends fail synchronously.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Drop the inbound channel as an engine does when a chain dies.
    pub fn crash(&self) {
        self.json_rpc.lock().take();
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl ChainHandle for MemoryChain {
    fn id(&self) -> EngineChainId {
        self.id
    }

    fn send_json_rpc(&self, rpc: String) -> Result<(), EngineError> {
        if self.is_removed() {
            return Err(EngineError::AlreadyDestroyed);
        }
        if !self.json_rpc_enabled {
            return Err(EngineError::JsonRpcDisabled);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::Crash("send failed".into()));
        }
        self.sent.lock().push(rpc.clone());

        if let Some(responder) = &self.responder {
            let Ok(request) = serde_json::from_str::<Value>(&rpc) else {
                return Ok(());
            };
            let method = request["method"].as_str().unwrap_or_default();
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            if let Some(result) = responder(method, &params) {
                self.respond(&request["id"], result);
            }
        }
        Ok(())
    }

    fn remove(&self) -> Result<(), EngineError> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyDestroyed);
        }
        self.json_rpc.lock().take();
        self.engine.lock().removed += 1;
        debug!("memory engine removed {}", self.id);
        Ok(())
    }
}

/// A `system_health` answer for a responder.
pub fn health(is_syncing: bool, peers: u64, should_have_peers: bool) -> Value {
    json!({
        "isSyncing": is_syncing,
        "peers": peers,
        "shouldHavePeers": should_have_peers,
    })
}
