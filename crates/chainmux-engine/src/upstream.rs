//! Upstream engine — runs each chain as a WebSocket JSON-RPC connection to a node.
//!
//! The chain spec's `id` selects the endpoint. Raw text is shuttled both
//! ways without interpretation. When the socket closes, the chain's inbound
//! channel is dropped so the owner sees the chain die.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::spec::ChainSpecInfo;
use crate::{
    AddChainRequest, ChainHandle, ChainStatus, Engine, EngineChainId, EngineError, JsonRpcSender,
};

/// Configuration for the upstream engine.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    /// Chain spec `id` → WebSocket URL of a node serving that chain.
    pub endpoints: HashMap<String, String>,
}

/// Engine backed by one WebSocket connection per chain.
pub struct UpstreamEngine {
    config: UpstreamConfig,
    next_id: AtomicU64,
}

/// Handle to one upstream connection.
struct UpstreamChain {
    id: EngineChainId,
    url: String,
    json_rpc_enabled: bool,
    status: Arc<Mutex<ChainStatus>>,
    writer_tx: mpsc::UnboundedSender<Message>,
}

impl UpstreamEngine {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self, chain_id: &str) -> Option<&str> {
        self.config.endpoints.get(chain_id).map(String::as_str)
    }
}

impl Engine for UpstreamEngine {
    async fn add_chain(&self, request: AddChainRequest) -> Result<Arc<dyn ChainHandle>, EngineError> {
        let info = ChainSpecInfo::parse(&request.chain_spec)?;
        let url = self
            .endpoint(&info.id)
            .ok_or_else(|| EngineError::Unavailable(format!("no upstream endpoint for chain {}", info.id)))?
            .to_string();

        if !request.potential_relay_chains.is_empty() {
            debug!(
                "upstream {} serves {} directly; ignoring {} potential relay chains",
                url,
                info.id,
                request.potential_relay_chains.len()
            );
        }

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| EngineError::Unavailable(format!("failed to connect to {url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let id = EngineChainId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let status = Arc::new(Mutex::new(ChainStatus::Alive));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        // Writer task — forwards requests to the node
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task — forwards node output to the chain owner
        let reader_status = status.clone();
        let json_rpc_enabled = request.json_rpc.is_some();
        let json_rpc: Option<JsonRpcSender> = request.json_rpc;
        let reader_url = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(tx) = &json_rpc {
                            if tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Upstream {reader_url} error: {e}");
                        break;
                    }
                }
            }
            let mut status = reader_status.lock();
            if *status == ChainStatus::Alive {
                *status = ChainStatus::Crashed(format!("connection to {reader_url} closed"));
                warn!("Upstream {reader_url} closed the connection");
            }
            // json_rpc is dropped here, closing the owner's channel
        });

        info!("Upstream chain {} ({}) connected to {}", info.name, id, url);
        Ok(Arc::new(UpstreamChain {
            id,
            url,
            json_rpc_enabled,
            status,
            writer_tx,
        }))
    }
}

impl ChainHandle for UpstreamChain {
    fn id(&self) -> EngineChainId {
        self.id
    }

    fn send_json_rpc(&self, rpc: String) -> Result<(), EngineError> {
        self.status.lock().check()?;
        if !self.json_rpc_enabled {
            return Err(EngineError::JsonRpcDisabled);
        }
        self.writer_tx
            .send(Message::Text(rpc.into()))
            .map_err(|_| EngineError::Crash(format!("connection to {} closed", self.url)))
    }

    fn remove(&self) -> Result<(), EngineError> {
        {
            let mut status = self.status.lock();
            status.check()?;
            *status = ChainStatus::Removed;
        }
        let _ = self.writer_tx.send(Message::Close(None));
        debug!("Upstream chain {} removed", self.id);
        Ok(())
    }
}
