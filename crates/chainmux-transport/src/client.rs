//! Relay client — an engine whose chains live in a remote connection manager.
//!
//! Every chain is one port (WebSocket) to a [`crate::TransportServer`]. The
//! add-chain handshake resolves exactly once; after `chain-added-ok` the
//! port carries `rpc` messages both ways. A `crash-error` or a closed socket
//! kills the chain: later sends fail with `Crash` and the chain's inbound
//! channel is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chainmux_engine::{
    AddChainRequest, ChainHandle, ChainSpecInfo, ChainStatus, Engine, EngineChainId, EngineError,
    JsonRpcSender,
};
use chainmux_protocol::{ToApp, ToManager};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Where the manager lives and who we are to it.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// WebSocket endpoint of the transport, e.g. `ws://127.0.0.1:9944/ws`.
    pub url: String,
    pub app: String,
    pub tab_id: u64,
}

/// Names of the live chains, by engine id. Shared with every port so a
/// dead chain stops being offered as a relay chain.
type ChainNames = Arc<Mutex<HashMap<EngineChainId, String>>>;

pub struct RelayClient {
    config: RelayClientConfig,
    next_id: AtomicU64,
    names: ChainNames,
}

struct RelayChain {
    id: EngineChainId,
    name: String,
    json_rpc_enabled: bool,
    status: Arc<Mutex<ChainStatus>>,
    writer_tx: mpsc::UnboundedSender<Message>,
    names: ChainNames,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            names: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach to a chain the manager knows by name.
    pub async fn add_well_known_chain(
        &self,
        name: &str,
        json_rpc: Option<JsonRpcSender>,
    ) -> Result<Arc<dyn ChainHandle>, EngineError> {
        self.open(ToManager::AddWellKnownChain(name.into()), name.into(), json_rpc)
            .await
    }

    fn endpoint(&self) -> Result<Url, EngineError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| EngineError::Unavailable(format!("invalid manager url {}: {e}", self.config.url)))?;
        url.query_pairs_mut()
            .append_pair("app", &self.config.app)
            .append_pair("tab", &self.config.tab_id.to_string());
        Ok(url)
    }

    async fn open(
        &self,
        handshake: ToManager,
        name: String,
        json_rpc: Option<JsonRpcSender>,
    ) -> Result<Arc<dyn ChainHandle>, EngineError> {
        let url = self.endpoint()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| EngineError::Unavailable(format!("failed to connect to {url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        ws_tx
            .send(Message::Text(handshake.to_json().into()))
            .await
            .map_err(|e| EngineError::Unavailable(format!("failed to send handshake: {e}")))?;

        match next_message(&mut ws_rx).await {
            Some(ToApp::ChainAddedOk) => {}
            Some(ToApp::ChainAddedKo(reason)) => return Err(EngineError::Rejected(reason)),
            Some(ToApp::CrashError(reason)) => return Err(EngineError::Crash(reason)),
            Some(ToApp::Rpc(_)) => {
                return Err(EngineError::Crash("rpc message before chain-added".into()));
            }
            None => return Err(EngineError::Crash("port closed during handshake".into())),
        }

        let id = EngineChainId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.names.lock().insert(id, name.clone());
        let status = Arc::new(Mutex::new(ChainStatus::Alive));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        // Writer task — forwards requests to the manager
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task — forwards responses and notifications to the chain owner
        let reader_status = status.clone();
        let reader_names = self.names.clone();
        let reader_name = name.clone();
        let json_rpc_enabled = json_rpc.is_some();
        tokio::spawn(async move {
            let mut reason = String::from("port to the manager closed");
            while let Some(message) = next_message(&mut ws_rx).await {
                match message {
                    ToApp::Rpc(payload) => {
                        if let Some(tx) = &json_rpc {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                    }
                    ToApp::CrashError(crash) => {
                        reason = crash;
                        break;
                    }
                    other => warn!("Relay chain {reader_name} ignoring {other:?}"),
                }
            }
            reader_names.lock().remove(&id);
            let mut status = reader_status.lock();
            if *status == ChainStatus::Alive {
                warn!("Relay chain {reader_name} died: {reason}");
                *status = ChainStatus::Crashed(reason);
            }
            // json_rpc is dropped here, closing the owner's channel
        });

        info!("Relay chain {name} ({id}) attached");
        Ok(Arc::new(RelayChain {
            id,
            name,
            json_rpc_enabled,
            status,
            writer_tx,
            names: self.names.clone(),
        }))
    }
}

impl Engine for RelayClient {
    async fn add_chain(&self, request: AddChainRequest) -> Result<Arc<dyn ChainHandle>, EngineError> {
        let info = ChainSpecInfo::parse(&request.chain_spec)?;
        let potential_relay_chain_ids: Vec<String> = {
            let names = self.names.lock();
            request
                .potential_relay_chains
                .iter()
                .filter_map(|id| names.get(id).cloned())
                .collect()
        };
        self.open(
            ToManager::AddChain {
                chain_spec: request.chain_spec,
                potential_relay_chain_ids,
            },
            info.name,
            request.json_rpc,
        )
        .await
    }
}

impl ChainHandle for RelayChain {
    fn id(&self) -> EngineChainId {
        self.id
    }

    fn send_json_rpc(&self, rpc: String) -> Result<(), EngineError> {
        self.status.lock().check()?;
        if !self.json_rpc_enabled {
            return Err(EngineError::JsonRpcDisabled);
        }
        self.writer_tx
            .send(Message::Text(ToManager::Rpc(rpc).to_json().into()))
            .map_err(|_| EngineError::Crash(format!("port for {} closed", self.name)))
    }

    fn remove(&self) -> Result<(), EngineError> {
        {
            let mut status = self.status.lock();
            status.check()?;
            *status = ChainStatus::Removed;
        }
        self.names.lock().remove(&self.id);
        let _ = self.writer_tx.send(Message::Close(None));
        debug!("Relay chain {} removed", self.name);
        Ok(())
    }
}

/// Next manager message on a port. Undecodable frames are skipped.
async fn next_message<S>(ws_rx: &mut S) -> Option<ToApp>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Malformed message from the manager: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}
