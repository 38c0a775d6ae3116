//! Engine tests — loopback engine behavior, well-known chain table,
//! and the upstream engine against a local WebSocket node.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use chainmux_engine::memory::{self, MemoryEngine};
use chainmux_engine::upstream::{UpstreamConfig, UpstreamEngine};
use chainmux_engine::{AddChainRequest, Engine, EngineChainId, EngineDyn, EngineError, WellKnownChains};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WESTEND: &str = r#"{"name":"Westend","id":"westend2","bootNodes":[]}"#;

fn request(spec: &str) -> (AddChainRequest, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        AddChainRequest {
            chain_spec: spec.into(),
            potential_relay_chains: vec![],
            json_rpc: Some(tx),
        },
        rx,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory engine
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn memory_chain_records_requests() {
    let engine = MemoryEngine::new();
    let (req, _rx) = request(WESTEND);
    let chain = engine.add_chain(req).await.unwrap();

    chain.send_json_rpc(r#"{"jsonrpc":"2.0","id":1,"method":"system_name"}"#.into()).unwrap();

    let created = engine.last_chain().unwrap();
    assert_eq!(created.sent().len(), 1);
    assert_eq!(created.sent_json()[0]["method"], "system_name");
    assert_eq!(created.chain_spec(), WESTEND);
    assert_eq!(engine.created_count(), 1);
    assert_eq!(engine.live_count(), 1);
}

#[tokio::test]
async fn memory_chain_answers_through_responder() {
    let engine = MemoryEngine::with_responder(|method, _params| match method {
        "system_health" => Some(memory::health(false, 3, true)),
        _ => None,
    });
    let (req, mut rx) = request(WESTEND);
    let chain = engine.add_chain(req).await.unwrap();

    chain.send_json_rpc(r#"{"jsonrpc":"2.0","id":9,"method":"system_health","params":[]}"#.into()).unwrap();
    chain.send_json_rpc(r#"{"jsonrpc":"2.0","id":10,"method":"system_name","params":[]}"#.into()).unwrap();

    let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["result"]["peers"], 3);
    assert!(rx.try_recv().is_err(), "unanswered method must stay unanswered");
}

#[tokio::test]
async fn memory_chain_remove_twice_fails() {
    let engine = MemoryEngine::new();
    let (req, mut rx) = request(WESTEND);
    let chain = engine.add_chain(req).await.unwrap();

    chain.remove().unwrap();
    assert_eq!(chain.remove(), Err(EngineError::AlreadyDestroyed));
    assert_eq!(chain.send_json_rpc("{}".into()), Err(EngineError::AlreadyDestroyed));
    assert_eq!(engine.removed_count(), 1);
    assert_eq!(engine.live_count(), 0);
    // Inbound channel closes on removal
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn memory_chain_without_json_rpc_rejects_sends() {
    let engine = MemoryEngine::new();
    let chain = engine
        .add_chain(AddChainRequest {
            chain_spec: WESTEND.into(),
            potential_relay_chains: vec![],
            json_rpc: None,
        })
        .await
        .unwrap();

    assert_eq!(chain.send_json_rpc("{}".into()), Err(EngineError::JsonRpcDisabled));
}

#[tokio::test]
async fn memory_engine_injected_failure_applies_once() {
    let engine = MemoryEngine::new();
    engine.fail_next_add(EngineError::Crash("boom".into()));

    let (req, _rx) = request(WESTEND);
    let err = engine.add_chain(req).await.err().unwrap();
    assert_eq!(err, EngineError::Crash("boom".into()));

    let (req, _rx) = request(WESTEND);
    assert!(engine.add_chain(req).await.is_ok());
    assert_eq!(engine.created_count(), 1);
}

#[tokio::test]
async fn memory_chain_crash_closes_inbound() {
    let engine = MemoryEngine::new();
    let (req, mut rx) = request(WESTEND);
    engine.add_chain(req).await.unwrap();

    let chain = engine.last_chain().unwrap();
    assert!(chain.deliver("hello"));
    chain.crash();
    assert!(!chain.deliver("lost"));

    assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn memory_chain_keeps_potential_relay_chains() {
    let engine = MemoryEngine::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let engine_dyn: &dyn EngineDyn = &engine;
    engine_dyn
        .add_chain_dyn(AddChainRequest {
            chain_spec: WESTEND.into(),
            potential_relay_chains: vec![EngineChainId(4)],
            json_rpc: Some(tx),
        })
        .await
        .unwrap();

    let chain = engine.last_chain().unwrap();
    assert_eq!(chain.potential_relay_chains(), &[EngineChainId(4)]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Well-known chains
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn well_known_insert_validates_spec() {
    let mut chains = WellKnownChains::new();
    assert!(chains.insert("westend", WESTEND).is_ok());
    assert!(matches!(
        chains.insert("broken", "not json"),
        Err(EngineError::InvalidChainSpec(_))
    ));

    assert_eq!(chains.len(), 1);
    assert!(chains.contains("westend"));
    assert!(!chains.contains("broken"));
    assert_eq!(chains.get("westend").as_deref(), Some(WESTEND));
}

#[test]
fn well_known_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(WESTEND.as_bytes()).unwrap();

    let mut chains = WellKnownChains::new();
    chains.load_file("westend", file.path()).unwrap();
    assert_eq!(chains.names(), vec!["westend"]);

    let missing = chains.load_file("kusama", std::path::Path::new("/nonexistent/kusama.json"));
    assert!(matches!(missing, Err(EngineError::InvalidChainSpec(_))));
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream engine
// ─────────────────────────────────────────────────────────────────────────────

/// A node that answers every request with `{"result": "<method>"}` and
/// closes the socket after `close_after` requests.
async fn start_node(close_after: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut served = 0;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let req: Value = serde_json::from_str(&text).unwrap();
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": req["method"]});
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                served += 1;
                if served == close_after {
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }
    });
    format!("ws://{addr}")
}

fn upstream_for(url: String) -> UpstreamEngine {
    UpstreamEngine::new(UpstreamConfig {
        endpoints: HashMap::from([("westend2".to_string(), url)]),
    })
}

#[tokio::test]
async fn upstream_relays_text_both_ways() {
    let engine = upstream_for(start_node(usize::MAX).await);
    let (req, mut rx) = request(WESTEND);
    let chain = engine.add_chain(req).await.unwrap();

    chain.send_json_rpc(r#"{"jsonrpc":"2.0","id":1,"method":"system_chain"}"#.into()).unwrap();
    let reply = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"], "system_chain");

    chain.remove().unwrap();
    assert_eq!(chain.remove(), Err(EngineError::AlreadyDestroyed));
}

#[tokio::test]
async fn upstream_connection_loss_is_a_crash() {
    let engine = upstream_for(start_node(1).await);
    let (req, mut rx) = request(WESTEND);
    let chain = engine.add_chain(req).await.unwrap();

    chain.send_json_rpc(r#"{"jsonrpc":"2.0","id":1,"method":"system_chain"}"#.into()).unwrap();
    assert!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_some());
    // Node closed after one request: inbound channel ends
    assert!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_none());

    assert!(matches!(
        chain.send_json_rpc("{}".into()),
        Err(EngineError::Crash(_))
    ));
}

#[tokio::test]
async fn upstream_unknown_chain_is_unavailable() {
    let engine = UpstreamEngine::new(UpstreamConfig::default());
    let (req, _rx) = request(WESTEND);
    let err = engine.add_chain(req).await.err().unwrap();
    assert!(matches!(err, EngineError::Unavailable(_)));
}

#[tokio::test]
async fn upstream_rejects_invalid_spec() {
    let engine = UpstreamEngine::new(UpstreamConfig::default());
    let (req, _rx) = request("{not json");
    let err = engine.add_chain(req).await.err().unwrap();
    assert!(matches!(err, EngineError::InvalidChainSpec(_)));
}
