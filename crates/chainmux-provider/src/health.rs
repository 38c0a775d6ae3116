//! Health tracker — polls `system_health` on a chain and reports readiness.
//!
//! Poll requests carry string ids starting with [`HEALTH_REQUEST_PREFIX`],
//! which never collide with the numeric ids of the provider's coder. Inbound
//! messages are offered to [`HealthTracker::response_pass_through`] first so
//! that poll replies never reach ordinary request correlation.

use std::sync::Arc;
use std::time::Duration;

use chainmux_protocol::{Methods, MuxError, Request, RequestId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Prefix of the request ids used by health polls.
pub const HEALTH_REQUEST_PREFIX: &str = "health-checker:";

/// Result of a `system_health` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub is_syncing: bool,
    pub peers: u64,
    pub should_have_peers: bool,
}

impl SystemHealth {
    /// Ready when not syncing and either connected to peers or not expected to be.
    pub fn is_ready(&self) -> bool {
        !self.is_syncing && (self.peers > 0 || !self.should_have_peers)
    }
}

/// A readiness change reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub ready: bool,
    /// The poll result behind the change; `None` when the poll failed.
    pub health: Option<SystemHealth>,
}

/// Sends raw JSON-RPC text to the chain being tracked.
pub type SendJsonRpc = Arc<dyn Fn(String) -> Result<(), MuxError> + Send + Sync>;

/// Invoked on every readiness change.
pub type HealthCallback = Arc<dyn Fn(HealthEvent) + Send + Sync>;

/// Periodic `system_health` poller with change detection.
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    send: SendJsonRpc,
    interval: Duration,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    on_change: Option<HealthCallback>,
    last_ready: Option<bool>,
    next_poll: u64,
    task: Option<JoinHandle<()>>,
}

impl HealthTracker {
    pub fn new(send: SendJsonRpc, interval: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                send,
                interval,
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// Begin polling. The first poll is sent immediately and its result is
    /// always reported; afterwards only changes are.
    pub fn start(&self, on_change: HealthCallback) {
        let mut state = self.inner.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.on_change = Some(on_change);
        state.last_ready = None;

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        state.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.poll(),
                    None => break,
                }
            }
        }));
    }

    /// Send one poll now.
    pub fn poll(&self) {
        self.inner.poll();
    }

    /// Offer an inbound message to the tracker. Returns `false` when the
    /// message was a poll reply and has been consumed.
    pub fn response_pass_through(&self, raw: &str) -> bool {
        // Cheap pre-check before parsing every inbound message
        if !raw.contains(HEALTH_REQUEST_PREFIX) {
            return true;
        }
        let Ok(message) = serde_json::from_str::<Value>(raw) else {
            return true;
        };
        let is_poll_reply = message
            .get("id")
            .and_then(Value::as_str)
            .is_some_and(|id| id.starts_with(HEALTH_REQUEST_PREFIX));
        if !is_poll_reply {
            return true;
        }

        let health = message
            .get("result")
            .and_then(|result| serde_json::from_value::<SystemHealth>(result.clone()).ok());
        if health.is_none() {
            debug!("Malformed health reply: {raw}");
        }
        self.inner.report(health);
        false
    }

    /// Stop polling. Replies still in flight are consumed but not reported.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.on_change = None;
        state.last_ready = None;
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }
}

impl TrackerInner {
    fn poll(&self) {
        let id = {
            let mut state = self.state.lock();
            if state.on_change.is_none() {
                return;
            }
            state.next_poll += 1;
            format!("{HEALTH_REQUEST_PREFIX}{}", state.next_poll)
        };
        let request = Request::new(RequestId::String(id), Methods::SYSTEM_HEALTH, Some(json!([])));
        let sent = serde_json::to_string(&request)
            .map_err(|e| MuxError::Decode(e.to_string()))
            .and_then(|text| (self.send)(text));
        if let Err(e) = sent {
            debug!("Health poll failed to send: {e}");
            self.report(None);
        }
    }

    fn report(&self, health: Option<SystemHealth>) {
        let ready = health.is_some_and(|h| h.is_ready());
        let callback = {
            let mut state = self.state.lock();
            let Some(callback) = state.on_change.clone() else {
                return;
            };
            if state.last_ready == Some(ready) {
                return;
            }
            state.last_ready = Some(ready);
            callback
        };
        callback(HealthEvent { ready, health });
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (HealthCallback, Arc<Mutex<Vec<HealthEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (Arc::new(move |e: HealthEvent| sink.lock().push(e)), events)
    }

    fn capturing_send() -> (SendJsonRpc, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        (
            Arc::new(move |text: String| {
                sink.lock().push(text);
                Ok::<(), MuxError>(())
            }),
            sent,
        )
    }

    fn reply(id: &str, is_syncing: bool, peers: u64, should_have_peers: bool) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"isSyncing": is_syncing, "peers": peers, "shouldHavePeers": should_have_peers},
        })
        .to_string()
    }

    #[test]
    fn readiness_rule() {
        let h = |is_syncing, peers, should_have_peers| SystemHealth { is_syncing, peers, should_have_peers };
        assert!(h(false, 1, true).is_ready());
        assert!(h(false, 0, false).is_ready());
        assert!(!h(false, 0, true).is_ready());
        assert!(!h(true, 5, true).is_ready());
    }

    #[tokio::test]
    async fn first_poll_reports_and_repeats_are_silent() {
        let (send, _sent) = capturing_send();
        let tracker = HealthTracker::new(send, Duration::from_secs(3600));
        let (on_change, events) = recording();
        tracker.start(on_change);

        let raw = reply("health-checker:1", false, 0, true);
        assert!(!tracker.response_pass_through(&raw));
        for _ in 0..100 {
            assert!(!tracker.response_pass_through(&raw));
        }
        assert_eq!(events.lock().len(), 1);
        assert!(!events.lock()[0].ready);

        tracker.response_pass_through(&reply("health-checker:2", false, 4, true));
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[1].ready);
        assert_eq!(events[1].health.map(|h| h.peers), Some(4));
        tracker.stop();
    }

    #[tokio::test]
    async fn other_messages_pass_through() {
        let (send, _sent) = capturing_send();
        let tracker = HealthTracker::new(send, Duration::from_secs(3600));
        let (on_change, events) = recording();
        tracker.start(on_change);

        assert!(tracker.response_pass_through(r#"{"jsonrpc":"2.0","id":1,"result":true}"#));
        assert!(tracker.response_pass_through(
            r#"{"jsonrpc":"2.0","id":"health-checker-lookalike","result":true}"#
        ));
        assert!(tracker.response_pass_through("not json"));
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_reply_counts_as_not_ready() {
        let (send, _sent) = capturing_send();
        let tracker = HealthTracker::new(send, Duration::from_secs(3600));
        let (on_change, events) = recording();
        tracker.start(on_change);

        tracker.response_pass_through(&reply("health-checker:1", false, 2, true));
        assert!(!tracker.response_pass_through(
            r#"{"jsonrpc":"2.0","id":"health-checker:2","result":"garbage"}"#
        ));
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], HealthEvent { ready: false, health: None });
    }

    #[tokio::test]
    async fn send_failure_counts_as_not_ready() {
        let send: SendJsonRpc = Arc::new(|_: String| Err(MuxError::Crash("gone".into())));
        let tracker = HealthTracker::new(send, Duration::from_secs(3600));
        let (on_change, events) = recording();
        tracker.start(on_change);

        tracker.poll();
        tracker.poll();
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(!events[0].ready);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval() {
        let (send, sent) = capturing_send();
        let tracker = HealthTracker::new(send, Duration::from_secs(10));
        let (on_change, _events) = recording();
        tracker.start(on_change);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sent.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        let sent = sent.lock().clone();
        assert_eq!(sent.len(), 3);
        let first: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(first["method"], "system_health");
        assert_eq!(first["id"], "health-checker:1");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_polling_and_reporting() {
        let (send, sent) = capturing_send();
        let tracker = HealthTracker::new(send, Duration::from_secs(10));
        let (on_change, events) = recording();
        tracker.start(on_change);
        tokio::time::sleep(Duration::from_millis(1)).await;

        tracker.stop();
        assert!(!tracker.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sent.lock().len(), 1);

        // Late reply is still swallowed but not reported
        assert!(!tracker.response_pass_through(&reply("health-checker:1", false, 1, true)));
        assert!(events.lock().is_empty());
    }
}
