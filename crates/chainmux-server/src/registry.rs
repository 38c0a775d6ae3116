//! ConnectionManager — shares engine chains between apps with ref-counting.
//!
//! Each chain identity maps to at most one [`Provider`]. The first app to
//! attach creates it; later apps bump its refcount. Every (app, chain)
//! attachment gets its own [`AppRelay`], so apps never see each other's
//! request ids or subscriptions. The chain is released when the last app
//! detaches.
//!
//! Uses parking_lot::RwLock (sync) for the registry so queries can be made
//! from any context. Async work (connect, unsubscribe, close) happens
//! outside the lock. Operations on one app are serialized by a per-app
//! async lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chainmux_engine::spec::{ChainSpecInfo, spec_digest};
use chainmux_engine::{EngineChainId, SharedEngine, WellKnownChains};
use chainmux_protocol::{MuxError, ToApp};
use chainmux_provider::{AppRelay, ChainRequest, Provider, ProviderConfig, ProviderEvent, translate};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::{AppId, AttachRequest, ChainIdentity};
use crate::state::{AppState, ChainRef, ChainState, ManagerState};

/// Manager tuning.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub provider: ProviderConfig,
    /// How long a chain nobody holds is kept before it is released.
    /// Zero releases it immediately.
    pub teardown_grace: Duration,
}

/// One shared chain.
struct ChainEntry {
    identity: ChainIdentity,
    name: String,
    provider: Arc<Provider>,
    refcount: usize,
    /// Bumped whenever the refcount drops to zero, so a delayed release
    /// only applies to the release that scheduled it.
    release_epoch: u64,
    watcher: JoinHandle<()>,
}

/// One app holding one chain.
struct Attachment {
    identity: ChainIdentity,
    chain_name: String,
    relay: Arc<AppRelay>,
    outbound: mpsc::UnboundedSender<ToApp>,
}

struct AppEntry {
    id: AppId,
    attachments: Vec<Attachment>,
}

#[derive(Default)]
struct Registry {
    chains: Vec<ChainEntry>,
    apps: Vec<AppEntry>,
}

impl Registry {
    fn chain(&self, identity: &ChainIdentity) -> Option<&ChainEntry> {
        self.chains.iter().find(|c| &c.identity == identity)
    }

    fn chain_mut(&mut self, identity: &ChainIdentity) -> Option<&mut ChainEntry> {
        self.chains.iter_mut().find(|c| &c.identity == identity)
    }

    fn remove_chain(&mut self, identity: &ChainIdentity) -> Option<ChainEntry> {
        let index = self.chains.iter().position(|c| &c.identity == identity)?;
        Some(self.chains.remove(index))
    }

    fn app(&self, id: &AppId) -> Option<&AppEntry> {
        self.apps.iter().find(|a| &a.id == id)
    }

    fn attachment(&self, app: &AppId, identity: &ChainIdentity) -> Option<&Attachment> {
        self.app(app)?.attachments.iter().find(|a| &a.identity == identity)
    }

    /// Remove one attachment, dropping the app when it holds nothing else.
    fn remove_attachment(&mut self, app: &AppId, identity: &ChainIdentity) -> Option<Attachment> {
        let index = self.apps.iter().position(|a| &a.id == app)?;
        let entry = &mut self.apps[index];
        let position = entry.attachments.iter().position(|a| &a.identity == identity)?;
        let attachment = entry.attachments.remove(position);
        if entry.attachments.is_empty() {
            self.apps.remove(index);
        }
        Some(attachment)
    }

    fn push_attachment(&mut self, app: &AppId, attachment: Attachment) {
        match self.apps.iter_mut().find(|a| &a.id == app) {
            Some(entry) => entry.attachments.push(attachment),
            None => self.apps.push(AppEntry {
                id: app.clone(),
                attachments: vec![attachment],
            }),
        }
    }
}

/// Registry of shared chains and the apps attached to them.
pub struct ConnectionManager {
    engine: SharedEngine,
    well_known: WellKnownChains,
    config: ManagerConfig,
    registry: RwLock<Registry>,
    app_locks: DashMap<AppId, Arc<AsyncMutex<()>>>,
    state_tx: broadcast::Sender<ManagerState>,
    destroyed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(engine: SharedEngine, well_known: WellKnownChains, config: ManagerConfig) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            engine,
            well_known,
            config,
            registry: RwLock::new(Registry::default()),
            app_locks: DashMap::new(),
            state_tx,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn well_known(&self) -> &WellKnownChains {
        &self.well_known
    }

    /// Receive a snapshot after every visible change.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    // ── Attach / detach ─────────────────────────────────────────────────

    /// Attach `app` to a chain, creating the chain if nobody holds it yet.
    ///
    /// Responses and notifications for the app go to `outbound`.
    pub async fn attach(
        self: &Arc<Self>,
        app: &AppId,
        request: AttachRequest,
        outbound: mpsc::UnboundedSender<ToApp>,
    ) -> Result<ChainIdentity, MuxError> {
        self.ensure_alive()?;
        let result = self.attach_locked(app, request, outbound).await;
        self.forget_idle_lock(app);
        result
    }

    async fn attach_locked(
        self: &Arc<Self>,
        app: &AppId,
        request: AttachRequest,
        outbound: mpsc::UnboundedSender<ToApp>,
    ) -> Result<ChainIdentity, MuxError> {
        let lock = self.app_lock(app);
        let _guard = lock.lock().await;
        self.ensure_alive()?;

        let (identity, name, chain_spec, relay_names) = self.resolve(request)?;

        let (provider, created) = {
            let mut registry = self.registry.write();
            if registry.attachment(app, &identity).is_some() {
                return Err(MuxError::AlreadyAttached {
                    app: app.name.clone(),
                    chain: name,
                });
            }

            match registry.chain_mut(&identity) {
                Some(entry) => {
                    entry.refcount += 1;
                    debug!("Chain {} shared (refcount: {})", entry.name, entry.refcount);
                    (entry.provider.clone(), false)
                }
                None => {
                    let potential_relay_chains = resolve_relay_chains(&registry, app, &relay_names);
                    let provider = Provider::new(
                        self.engine.clone(),
                        ChainRequest {
                            chain_spec,
                            potential_relay_chains,
                        },
                        self.config.provider.clone(),
                    );
                    let watcher = tokio::spawn(watch_chain(
                        Arc::downgrade(self),
                        identity.clone(),
                        provider.events(),
                    ));
                    registry.chains.push(ChainEntry {
                        identity: identity.clone(),
                        name: name.clone(),
                        provider: provider.clone(),
                        refcount: 1,
                        release_epoch: 0,
                        watcher,
                    });
                    (provider, true)
                }
            }
        };

        if let Err(e) = provider.connect().await {
            warn!("App {app} failed to attach to {name}: {e}");
            self.release(&identity).await;
            return Err(e);
        }

        let relay = AppRelay::new(format!("{}::{}", app.name, name), provider.clone(), outbound.clone());
        let registered = {
            let mut registry = self.registry.write();
            let current = registry
                .chain(&identity)
                .is_some_and(|entry| Arc::ptr_eq(&entry.provider, &provider));
            if current && !self.destroyed.load(Ordering::SeqCst) {
                registry.push_attachment(
                    app,
                    Attachment {
                        identity: identity.clone(),
                        chain_name: name.clone(),
                        relay,
                        outbound,
                    },
                );
            }
            current
        };
        if !registered {
            // The chain was evicted or the manager shut down while connecting
            return Err(if self.destroyed.load(Ordering::SeqCst) {
                MuxError::ManagerDestroyed
            } else {
                MuxError::Disconnected
            });
        }

        if created {
            info!("App {app} attached to {name} (new chain)");
        } else {
            info!("App {app} attached to {name}");
        }
        self.emit_state();
        Ok(identity)
    }

    /// Detach `app` from one chain; the chain is released with its last app.
    pub async fn detach(self: &Arc<Self>, app: &AppId, identity: &ChainIdentity) -> Result<(), MuxError> {
        self.ensure_alive()?;
        let result = self.detach_locked(app, identity).await;
        self.forget_idle_lock(app);
        result
    }

    async fn detach_locked(self: &Arc<Self>, app: &AppId, identity: &ChainIdentity) -> Result<(), MuxError> {
        let lock = self.app_lock(app);
        let _guard = lock.lock().await;

        let attachment = self.registry.write().remove_attachment(app, identity);
        let Some(attachment) = attachment else {
            return Err(MuxError::NotAttached {
                app: app.name.clone(),
                chain: identity.to_string(),
            });
        };
        self.finish_detach(app, attachment).await;
        Ok(())
    }

    /// Detach `app` from every chain it holds. Emits one state change per chain.
    pub async fn detach_all(self: &Arc<Self>, app: &AppId) -> Result<(), MuxError> {
        self.ensure_alive()?;
        self.detach_all_locked(app).await;
        self.forget_idle_lock(app);
        Ok(())
    }

    async fn detach_all_locked(self: &Arc<Self>, app: &AppId) {
        let lock = self.app_lock(app);
        let _guard = lock.lock().await;

        loop {
            let attachment = {
                let mut registry = self.registry.write();
                let identity = registry
                    .app(app)
                    .and_then(|entry| entry.attachments.first())
                    .map(|a| a.identity.clone());
                identity.and_then(|identity| registry.remove_attachment(app, &identity))
            };
            match attachment {
                Some(attachment) => self.finish_detach(app, attachment).await,
                None => break,
            }
        }
    }

    /// Detach every app living in `tab_id`.
    pub async fn detach_tab(self: &Arc<Self>, tab_id: u64) -> Result<(), MuxError> {
        self.ensure_alive()?;
        let apps: Vec<AppId> = self
            .registry
            .read()
            .apps
            .iter()
            .filter(|a| a.id.tab_id == tab_id)
            .map(|a| a.id.clone())
            .collect();
        for app in apps {
            self.detach_all(&app).await?;
        }
        Ok(())
    }

    /// Detach every app.
    pub async fn disconnect_all(self: &Arc<Self>) -> Result<(), MuxError> {
        self.ensure_alive()?;
        let apps: Vec<AppId> = self.registry.read().apps.iter().map(|a| a.id.clone()).collect();
        for app in apps {
            self.detach_all(&app).await?;
        }
        Ok(())
    }

    async fn finish_detach(self: &Arc<Self>, app: &AppId, attachment: Attachment) {
        attachment.relay.close().await;
        self.release(&attachment.identity).await;
        info!("App {app} detached from {}", attachment.chain_name);
        self.emit_state();
    }

    // ── Routing ─────────────────────────────────────────────────────────

    /// Hand one JSON-RPC payload from `app` to its relay for `identity`.
    pub fn send_rpc(&self, app: &AppId, identity: &ChainIdentity, payload: String) -> Result<(), MuxError> {
        self.ensure_alive()?;
        let relay = self
            .registry
            .read()
            .attachment(app, identity)
            .map(|a| a.relay.clone())
            .ok_or_else(|| MuxError::NotAttached {
                app: app.name.clone(),
                chain: identity.to_string(),
            })?;
        relay.handle(payload);
        Ok(())
    }

    /// Deliver raw engine output to the provider owning `identity`.
    pub fn route_inbound(&self, identity: &ChainIdentity, raw: &str) -> Result<(), MuxError> {
        self.ensure_alive()?;
        let provider = self
            .registry
            .read()
            .chain(identity)
            .map(|c| c.provider.clone())
            .ok_or_else(|| MuxError::UnknownChain(identity.to_string()))?;
        provider.route_inbound(raw);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Current snapshot.
    pub fn state(&self) -> ManagerState {
        let registry = self.registry.read();
        ManagerState {
            apps: registry
                .apps
                .iter()
                .map(|app| AppState {
                    name: app.id.name.clone(),
                    tab_id: app.id.tab_id,
                    chains: app
                        .attachments
                        .iter()
                        .map(|a| ChainRef {
                            name: a.chain_name.clone(),
                        })
                        .collect(),
                })
                .collect(),
            chains: registry
                .chains
                .iter()
                .map(|chain| {
                    let health = chain.provider.last_health();
                    ChainState {
                        name: chain.name.clone(),
                        healthy: chain.provider.is_connected(),
                        peers: health.map(|h| h.peers),
                        is_syncing: health.map(|h| h.is_syncing),
                        ref_count: chain.refcount,
                    }
                })
                .collect(),
        }
    }

    /// Every attachment as `<app>::<chain>`.
    pub fn registered_apps(&self) -> Vec<String> {
        self.registry
            .read()
            .apps
            .iter()
            .flat_map(|app| {
                app.attachments
                    .iter()
                    .map(move |a| format!("{}::{}", app.id.name, a.chain_name))
            })
            .collect()
    }

    /// Names of live chains, in creation order.
    pub fn registered_chains(&self) -> Vec<String> {
        self.registry.read().chains.iter().map(|c| c.name.clone()).collect()
    }

    pub fn app_count(&self) -> usize {
        self.registry.read().apps.len()
    }

    pub fn chain_count(&self) -> usize {
        self.registry.read().chains.len()
    }

    /// Refcount of a chain, if it exists.
    pub fn ref_count(&self, identity: &ChainIdentity) -> Option<usize> {
        self.registry.read().chain(identity).map(|c| c.refcount)
    }

    /// The provider serving a chain, if it exists.
    pub fn provider(&self, identity: &ChainIdentity) -> Option<Arc<Provider>> {
        self.registry.read().chain(identity).map(|c| c.provider.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Release every chain and forget every app. Every later operation
    /// fails with `ManagerDestroyed`.
    pub async fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (chains, apps) = {
            let mut registry = self.registry.write();
            (std::mem::take(&mut registry.chains), std::mem::take(&mut registry.apps))
        };

        for app in apps {
            for attachment in app.attachments {
                attachment.relay.close().await;
            }
        }
        for chain in chains {
            info!("Shutting down chain: {}", chain.name);
            chain.watcher.abort();
            chain.provider.close().await;
        }
        self.app_locks.clear();
        self.emit_state();
    }

    // ── Internal ────────────────────────────────────────────────────────

    fn ensure_alive(&self) -> Result<(), MuxError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(MuxError::ManagerDestroyed)
        } else {
            Ok(())
        }
    }

    fn app_lock(&self, app: &AppId) -> Arc<AsyncMutex<()>> {
        self.app_locks.entry(app.clone()).or_default().clone()
    }

    /// Drop the lock of an app that holds nothing and that nobody is waiting on.
    fn forget_idle_lock(&self, app: &AppId) {
        if self.registry.read().app(app).is_none() {
            self.app_locks.remove_if(app, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.app_locks.len()
    }

    /// Identity, display name, spec text and relay-chain names for a request.
    fn resolve(&self, request: AttachRequest) -> Result<(ChainIdentity, String, String, Vec<String>), MuxError> {
        match request {
            AttachRequest::WellKnown(name) => {
                let spec = self
                    .well_known
                    .get(&name)
                    .ok_or_else(|| MuxError::UnknownChain(name.clone()))?;
                Ok((ChainIdentity::WellKnown(name.clone()), name, spec.to_string(), Vec::new()))
            }
            AttachRequest::Custom {
                chain_spec,
                potential_relay_chain_ids,
            } => {
                let info = ChainSpecInfo::parse(&chain_spec).map_err(translate)?;
                Ok((
                    ChainIdentity::Custom(spec_digest(&chain_spec)),
                    info.name,
                    chain_spec,
                    potential_relay_chain_ids,
                ))
            }
        }
    }

    /// Drop one reference to a chain, releasing it when none remain.
    async fn release(self: &Arc<Self>, identity: &ChainIdentity) {
        let grace = self.config.teardown_grace;
        let to_close = {
            let mut registry = self.registry.write();
            let Some(entry) = registry.chain_mut(identity) else {
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                debug!("Chain {} refcount decremented (refcount: {})", entry.name, entry.refcount);
                return;
            }
            if grace.is_zero() {
                registry.remove_chain(identity)
            } else {
                entry.release_epoch += 1;
                let epoch = entry.release_epoch;
                let manager = Arc::downgrade(self);
                let identity = identity.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(manager) = manager.upgrade() {
                        manager.reap(&identity, epoch).await;
                    }
                });
                None
            }
        };
        if let Some(entry) = to_close {
            close_chain(entry).await;
        }
    }

    /// Release a chain whose delayed teardown came due, unless it was re-attached.
    async fn reap(&self, identity: &ChainIdentity, epoch: u64) {
        let entry = {
            let mut registry = self.registry.write();
            let due = registry
                .chain(identity)
                .is_some_and(|c| c.refcount == 0 && c.release_epoch == epoch);
            if !due {
                return;
            }
            registry.remove_chain(identity)
        };
        if let Some(entry) = entry {
            close_chain(entry).await;
            self.emit_state();
        }
    }

    /// The chain died: tell every attached app and evict it.
    async fn chain_crashed(&self, identity: &ChainIdentity, error: MuxError) {
        let (entry, detached) = {
            let mut registry = self.registry.write();
            let Some(entry) = registry.remove_chain(identity) else {
                return;
            };
            let mut detached = Vec::new();
            let apps: Vec<AppId> = registry.apps.iter().map(|a| a.id.clone()).collect();
            for app in apps {
                if let Some(attachment) = registry.remove_attachment(&app, identity) {
                    detached.push((app, attachment));
                }
            }
            (entry, detached)
        };

        warn!("Chain {} crashed: {error}", entry.name);
        for (app, attachment) in detached {
            let _ = attachment.outbound.send(ToApp::CrashError(error.to_string()));
            attachment.relay.close().await;
            self.forget_idle_lock(&app);
        }
        // Runs on the chain's own watcher, which exits afterwards
        entry.provider.close().await;
        self.emit_state();
    }

    fn emit_state(&self) {
        let _ = self.state_tx.send(self.state());
    }
}

async fn close_chain(entry: ChainEntry) {
    entry.watcher.abort();
    entry.provider.close().await;
    info!("Chain {} released", entry.name);
}

/// Engine ids of the chains `app` holds whose names are listed.
fn resolve_relay_chains(registry: &Registry, app: &AppId, names: &[String]) -> Vec<EngineChainId> {
    let Some(entry) = registry.app(app) else {
        return Vec::new();
    };
    entry
        .attachments
        .iter()
        .filter(|a| names.contains(&a.chain_name))
        .filter_map(|a| registry.chain(&a.identity))
        .filter_map(|c| c.provider.engine_chain_id())
        .collect()
}

/// Reacts to one chain's provider events for as long as the chain lives.
async fn watch_chain(
    manager: Weak<ConnectionManager>,
    identity: ChainIdentity,
    mut events: broadcast::Receiver<ProviderEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Chain {identity} watcher skipped {skipped} events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event {
            ProviderEvent::Health(_) => manager.emit_state(),
            ProviderEvent::ChainLost(error) => {
                manager.chain_crashed(&identity, error).await;
                break;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainmux_engine::memory::MemoryEngine;

    fn manager(engine: &MemoryEngine) -> Arc<ConnectionManager> {
        let mut well_known = WellKnownChains::new();
        well_known
            .insert("westend", r#"{"name":"Westend","id":"westend2"}"#)
            .unwrap();
        ConnectionManager::new(
            Arc::new(engine.clone()),
            well_known,
            ManagerConfig {
                provider: ProviderConfig {
                    health_interval: Duration::from_secs(3600),
                },
                ..ManagerConfig::default()
            },
        )
    }

    fn westend() -> AttachRequest {
        AttachRequest::WellKnown("westend".into())
    }

    #[tokio::test]
    async fn app_locks_go_with_their_app() {
        let engine = MemoryEngine::new();
        let manager = manager(&engine);

        for tab in 0..50 {
            let app = AppId::new("tab", tab);
            let identity = manager.attach(&app, westend(), mpsc::unbounded_channel().0).await.unwrap();
            assert_eq!(manager.lock_count(), 1);
            manager.detach(&app, &identity).await.unwrap();
        }
        assert_eq!(manager.lock_count(), 0);

        let app = AppId::new("tab", 99);
        manager.attach(&app, westend(), mpsc::unbounded_channel().0).await.unwrap();
        manager.detach_all(&app).await.unwrap();
        assert_eq!(manager.lock_count(), 0);

        let unknown = manager
            .attach(&app, AttachRequest::WellKnown("nowhere".into()), mpsc::unbounded_channel().0)
            .await;
        assert!(unknown.is_err());
        assert_eq!(manager.lock_count(), 0);
    }

    #[tokio::test]
    async fn crashed_chain_drops_app_locks() {
        let engine = MemoryEngine::new();
        let manager = manager(&engine);
        manager
            .attach(&AppId::new("a", 1), westend(), mpsc::unbounded_channel().0)
            .await
            .unwrap();
        assert_eq!(manager.lock_count(), 1);

        engine.last_chain().unwrap().crash();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.app_count() > 0 || manager.lock_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
