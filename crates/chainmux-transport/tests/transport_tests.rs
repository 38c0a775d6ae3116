//! Transport tests — port handshake, rpc relaying, crash propagation and the
//! relay client engine, all over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use chainmux_engine::memory::{self, MemoryEngine};
use chainmux_engine::{AddChainRequest, ChainHandle, Engine, EngineError, WellKnownChains};
use chainmux_protocol::{ToApp, ToManager};
use chainmux_provider::{ChainRequest, Provider, ProviderConfig};
use chainmux_server::{ConnectionManager, ManagerConfig};
use chainmux_transport::{RelayClient, RelayClientConfig, TransportConfig, TransportServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

const WESTEND: &str = r#"{"name":"Westend","id":"westend2"}"#;
const WESTMINT: &str = r#"{"name":"Westmint","id":"westmint","relay_chain":"westend2","para_id":1000}"#;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    engine: MemoryEngine,
    manager: Arc<ConnectionManager>,
    server: TransportServer,
}

impl Harness {
    async fn start() -> Self {
        Self::with_config(TransportConfig {
            port: 0,
            ..TransportConfig::default()
        })
        .await
    }

    async fn with_config(config: TransportConfig) -> Self {
        let engine = MemoryEngine::with_responder(|method, _| match method {
            "system_chain" => Some(json!("Westend")),
            "system_health" => Some(memory::health(false, 2, true)),
            _ => None,
        });
        let mut well_known = WellKnownChains::new();
        well_known.insert("westend", WESTEND).unwrap();
        let manager = ConnectionManager::new(
            Arc::new(engine.clone()),
            well_known,
            ManagerConfig {
                provider: ProviderConfig {
                    health_interval: Duration::from_secs(3600),
                },
                ..ManagerConfig::default()
            },
        );
        let server = TransportServer::start(config, manager.clone()).await.unwrap();
        Self {
            engine,
            manager,
            server,
        }
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.server.port())
    }

    async fn open(&self, app: &str, tab: u64) -> Socket {
        let url = format!("{}?app={app}&tab={tab}", self.url());
        let (socket, _) = connect_async(url.as_str()).await.unwrap();
        socket
    }

    fn client(&self, app: &str) -> RelayClient {
        RelayClient::new(RelayClientConfig {
            url: self.url(),
            app: app.into(),
            tab_id: 1,
        })
    }
}

async fn send(socket: &mut Socket, message: ToManager) {
    socket.send(Message::Text(message.to_json().into())).await.unwrap();
}

/// Next manager message, or `None` once the port is closed.
async fn recv(socket: &mut Socket) -> Option<ToApp> {
    let next = timeout(Duration::from_secs(5), async {
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    });
    next.await.expect("timed out waiting for the manager")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn port_attaches_and_relays_rpc() {
    let harness = Harness::start().await;
    let mut socket = harness.open("dapp", 3).await;

    send(&mut socket, ToManager::AddWellKnownChain("westend".into())).await;
    assert_eq!(recv(&mut socket).await, Some(ToApp::ChainAddedOk));
    assert_eq!(harness.manager.registered_apps(), vec!["dapp::westend"]);
    assert_eq!(harness.manager.state().apps[0].tab_id, 3);

    send(
        &mut socket,
        ToManager::Rpc(r#"{"jsonrpc":"2.0","id":"app-1","method":"system_chain","params":[]}"#.into()),
    )
    .await;
    let Some(ToApp::Rpc(payload)) = recv(&mut socket).await else {
        panic!("expected an rpc message");
    };
    let response: Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(response["id"], "app-1");
    assert_eq!(response["result"], "Westend");
}

#[tokio::test]
async fn unknown_chain_is_refused_once() {
    let harness = Harness::start().await;
    let mut socket = harness.open("dapp", 1).await;

    send(&mut socket, ToManager::AddWellKnownChain("polkadot".into())).await;
    assert_eq!(
        recv(&mut socket).await,
        Some(ToApp::ChainAddedKo("unknown chain: polkadot".into()))
    );
    assert_eq!(recv(&mut socket).await, None);
    assert_eq!(harness.manager.app_count(), 0);
}

#[tokio::test]
async fn rpc_before_handshake_is_refused() {
    let harness = Harness::start().await;
    let mut socket = harness.open("dapp", 1).await;

    send(&mut socket, ToManager::Rpc("{}".into())).await;
    assert!(matches!(recv(&mut socket).await, Some(ToApp::ChainAddedKo(_))));
    assert_eq!(recv(&mut socket).await, None);
}

#[tokio::test]
async fn silent_port_times_out() {
    let harness = Harness::with_config(TransportConfig {
        port: 0,
        handshake_timeout: Duration::from_millis(100),
        ..TransportConfig::default()
    })
    .await;
    let mut socket = harness.open("dapp", 1).await;

    assert_eq!(
        recv(&mut socket).await,
        Some(ToApp::ChainAddedKo("handshake timed out".into()))
    );
    assert_eq!(recv(&mut socket).await, None);
}

#[tokio::test]
async fn closing_the_port_detaches_the_app() {
    let harness = Harness::start().await;
    let mut socket = harness.open("dapp", 1).await;
    send(&mut socket, ToManager::AddWellKnownChain("westend".into())).await;
    assert_eq!(recv(&mut socket).await, Some(ToApp::ChainAddedOk));

    socket.close(None).await.unwrap();
    wait_until(|| harness.engine.removed_count() == 1).await;
    assert_eq!(harness.manager.app_count(), 0);
    assert_eq!(harness.manager.chain_count(), 0);
}

#[tokio::test]
async fn port_dropped_mid_handshake_leaves_no_attachment() {
    let harness = Harness::start().await;
    let mut socket = harness.open("dapp", 5).await;
    send(&mut socket, ToManager::AddWellKnownChain("westend".into())).await;
    drop(socket);

    wait_until(|| harness.engine.created_count() == 1 && harness.manager.app_count() == 0).await;
    wait_until(|| harness.engine.removed_count() == 1).await;

    // The same app can attach again
    let mut socket = harness.open("dapp", 5).await;
    send(&mut socket, ToManager::AddWellKnownChain("westend".into())).await;
    assert_eq!(recv(&mut socket).await, Some(ToApp::ChainAddedOk));
    assert_eq!(harness.manager.registered_apps(), vec!["dapp::westend"]);
}

#[tokio::test]
async fn crash_is_reported_then_port_closes() {
    let harness = Harness::start().await;
    let mut socket = harness.open("dapp", 1).await;
    send(&mut socket, ToManager::AddWellKnownChain("westend".into())).await;
    assert_eq!(recv(&mut socket).await, Some(ToApp::ChainAddedOk));

    harness.engine.last_chain().unwrap().crash();

    assert!(matches!(recv(&mut socket).await, Some(ToApp::CrashError(_))));
    assert_eq!(recv(&mut socket).await, None);
    assert_eq!(harness.manager.chain_count(), 0);
}

#[tokio::test]
async fn connection_limit_rejects_extra_ports() {
    let harness = Harness::with_config(TransportConfig {
        port: 0,
        max_connections: Some(1),
        ..TransportConfig::default()
    })
    .await;
    let mut first = harness.open("dapp", 1).await;
    send(&mut first, ToManager::AddWellKnownChain("westend".into())).await;
    assert_eq!(recv(&mut first).await, Some(ToApp::ChainAddedOk));

    let url = format!("{}?app=other&tab=2", harness.url());
    assert!(connect_async(url.as_str()).await.is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay client
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn relay_client_carries_json_rpc() {
    let harness = Harness::start().await;
    let client = harness.client("dapp");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let chain = client.add_well_known_chain("westend", Some(tx)).await.unwrap();
    chain
        .send_json_rpc(r#"{"jsonrpc":"2.0","id":5,"method":"system_chain","params":[]}"#.into())
        .unwrap();
    let text = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let response: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(response["id"], 5);
    assert_eq!(response["result"], "Westend");

    chain.remove().unwrap();
    assert_eq!(chain.remove(), Err(EngineError::AlreadyDestroyed));
    assert_eq!(chain.send_json_rpc("{}".into()), Err(EngineError::AlreadyDestroyed));
    wait_until(|| harness.manager.app_count() == 0).await;
}

#[tokio::test]
async fn relay_client_reports_refusal() {
    let harness = Harness::start().await;
    let client = harness.client("dapp");

    let err = client.add_well_known_chain("polkadot", None).await.err().unwrap();
    assert_eq!(err, EngineError::Rejected("unknown chain: polkadot".into()));
}

#[tokio::test]
async fn relay_client_without_json_rpc_refuses_sends() {
    let harness = Harness::start().await;
    let client = harness.client("dapp");

    let chain = client.add_well_known_chain("westend", None).await.unwrap();
    assert_eq!(chain.send_json_rpc("{}".into()), Err(EngineError::JsonRpcDisabled));
}

#[tokio::test]
async fn relay_client_chain_dies_with_the_remote_chain() {
    let harness = Harness::start().await;
    let client = harness.client("dapp");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let chain = client.add_well_known_chain("westend", Some(tx)).await.unwrap();

    harness.engine.last_chain().unwrap().crash();

    assert_eq!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap(), None);
    assert!(matches!(chain.send_json_rpc("{}".into()), Err(EngineError::Crash(_))));
}

#[tokio::test]
async fn relay_client_passes_relay_chains_by_name() {
    let harness = Harness::start().await;
    let client = harness.client("dapp");
    let (tx, _rx) = mpsc::unbounded_channel();
    let relay = client.add_well_known_chain("westend", Some(tx)).await.unwrap();
    let remote_relay = harness.engine.last_chain().unwrap().id();

    let (tx, _rx) = mpsc::unbounded_channel();
    client
        .add_chain(AddChainRequest {
            chain_spec: WESTMINT.into(),
            potential_relay_chains: vec![relay.id()],
            json_rpc: Some(tx),
        })
        .await
        .unwrap();

    let parachain = harness.engine.last_chain().unwrap();
    assert_eq!(parachain.chain_spec(), WESTMINT);
    assert_eq!(parachain.potential_relay_chains(), &[remote_relay]);
    assert_eq!(
        harness.manager.registered_apps(),
        vec!["dapp::westend", "dapp::Westmint"]
    );
}

#[tokio::test]
async fn provider_runs_on_a_relay_client() {
    let harness = Harness::start().await;
    let provider = Provider::new(
        Arc::new(harness.client("dapp")),
        ChainRequest {
            chain_spec: WESTEND.into(),
            potential_relay_chains: vec![],
        },
        ProviderConfig {
            health_interval: Duration::from_secs(3600),
        },
    );

    provider.connect().await.unwrap();
    let name = provider.send("system_chain", json!([])).await.unwrap();
    assert_eq!(name, "Westend");
    wait_until(|| provider.is_connected()).await;

    provider.close().await;
    wait_until(|| harness.manager.app_count() == 0).await;
}
