use super::config::DhtConfig;
use super::dispatch::{self, MessageDispatch};
use super::error::DhtError;
use super::listener::{InboundHandler, Listener, ListenerStatus, UdpListener};
use super::lookup::{IterativeLookup, LookupKind, LookupResult};
use super::main_loop::{MainLoop, TimeoutHandle};
use super::node::{Node, NodeId};
use super::peer_store::PeerStore;
use super::routing::{InsertOutcome, RoutingTable};
use super::task::{self, AnnounceReport};
use super::token::TokenManager;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtState {
    NotReady,
    Initialising,
    Ready,
}

/// Everything the scheduler serializes access to.
pub(crate) struct EngineState {
    pub(crate) table: RoutingTable,
    pub(crate) dispatch: MessageDispatch,
    pub(crate) tokens: TokenManager,
    pub(crate) peers: PeerStore,
}

pub(crate) struct Core {
    pub(crate) config: DhtConfig,
    pub(crate) local_id: NodeId,
    pub(crate) main_loop: MainLoop,
    pub(crate) listener: Arc<dyn Listener>,
    // Only ever locked from main loop jobs, so it is never contended.
    state: Mutex<EngineState>,
    status: watch::Sender<DhtState>,
    timers: Mutex<Vec<TimeoutHandle>>,
}

impl Core {
    /// Runs `f` against the engine state. Callers must be on the main loop.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        debug_assert!(self.main_loop.is_worker(), "engine state touched off the main loop");
        f(&mut self.state.lock())
    }

    /// Runs `f` on the main loop and waits for its result.
    pub(crate) async fn exec<F, R>(self: &Arc<Self>, f: F) -> Result<R, DhtError>
    where
        F: FnOnce(&Arc<Core>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let core = self.clone();
        self.main_loop.queue_wait(move || f(&core)).await
    }

    pub(crate) fn set_state(&self, state: DhtState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!("DHT state {:?} -> {:?}", previous, state);
        }
    }
}

/// A DHT node: routing table, query dispatch and lookups driven by a
/// single [`MainLoop`].
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::{DhtConfig, DhtEngine, NodeId};
///
/// # async fn example() -> Result<(), rdht::dht::DhtError> {
/// let dht = DhtEngine::bind(DhtConfig::default()).await?;
/// dht.start()?;
/// dht.bootstrap_default().await?;
///
/// let info_hash = NodeId([0u8; 20]);
/// let peers = dht.find_peers(info_hash).await?;
/// println!("found {} peers", peers.len());
///
/// dht.announce(info_hash, 6881).await?;
/// # Ok(())
/// # }
/// ```
pub struct DhtEngine {
    core: Arc<Core>,
}

impl DhtEngine {
    /// Creates an engine with a random id over `listener`. Must be called
    /// inside a tokio runtime.
    pub fn new(config: DhtConfig, listener: Arc<dyn Listener>) -> Result<Self, DhtError> {
        Self::with_id(config, listener, NodeId::generate())
    }

    pub fn with_id(
        config: DhtConfig,
        listener: Arc<dyn Listener>,
        local_id: NodeId,
    ) -> Result<Self, DhtError> {
        let handle = Handle::try_current()
            .map_err(|e| DhtError::Scheduler(format!("no tokio runtime: {}", e)))?;
        let main_loop = MainLoop::with_handle("dht-main-loop", handle, config.scheduler_pool)?;

        let state = EngineState {
            table: RoutingTable::with_config(local_id, &config),
            dispatch: MessageDispatch::new(config.max_pending_queries),
            tokens: TokenManager::new(),
            peers: PeerStore::new(config.peer_lifetime, config.max_peers_per_hash),
        };
        let (status, _) = watch::channel(DhtState::NotReady);

        info!("DHT engine created with id {}", local_id);

        Ok(Self {
            core: Arc::new(Core {
                config,
                local_id,
                main_loop,
                listener,
                state: Mutex::new(state),
                status,
                timers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Creates an engine listening on UDP `config.port` on all interfaces.
    pub async fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let listener = UdpListener::bind(addr).await?;
        Self::new(config, Arc::new(listener))
    }

    /// Starts receiving datagrams and the background timers.
    pub fn start(&self) -> Result<(), DhtError> {
        let weak = Arc::downgrade(&self.core);
        let handler: InboundHandler = Arc::new(move |data: Bytes, from: SocketAddr| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let job_core = core.clone();
            if let Err(e) = core
                .main_loop
                .queue(move || dispatch::handle_datagram(&job_core, &data, from))
            {
                trace!("dropping datagram from {}: {}", from, e);
            }
        });
        self.core.listener.start(handler)?;
        self.watch_listener();

        let mut timers = self.core.timers.lock();
        for timer in timers.drain(..) {
            timer.cancel();
        }

        let weak = Arc::downgrade(&self.core);
        timers.push(
            self.core
                .main_loop
                .queue_timeout(self.core.config.token_rotation, move || {
                    let Some(core) = weak.upgrade() else {
                        return false;
                    };
                    core.with_state(|state| {
                        state.tokens.rotate();
                        state.peers.expire();
                        trace!("holding peers for {} info-hashes", state.peers.hash_count());
                    });
                    true
                }),
        );

        if let Some(period) = self.core.config.bucket_refresh {
            let weak = Arc::downgrade(&self.core);
            timers.push(self.core.main_loop.queue_timeout(period, move || {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                tokio::spawn(async move {
                    if let Err(e) = task::refresh(&core).await {
                        debug!("bucket refresh stopped: {}", e);
                    }
                });
                true
            }));
        }

        info!("DHT engine {} started", self.core.local_id);
        Ok(())
    }

    /// Follows listener status until the engine goes away. A failed
    /// listener leaves the engine `NotReady`.
    fn watch_listener(&self) {
        let weak = Arc::downgrade(&self.core);
        let mut status = self.core.listener.subscribe_status();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                let Some(core) = weak.upgrade() else {
                    break;
                };
                match current {
                    ListenerStatus::Error => {
                        warn!("DHT listener failed");
                        core.set_state(DhtState::NotReady);
                    }
                    ListenerStatus::NotListening => {
                        debug!("DHT listener stopped listening");
                        break;
                    }
                    ListenerStatus::Listening => trace!("DHT listener listening"),
                }
            }
        });
    }

    /// Stops the listener and timers and fails every outstanding query.
    pub fn stop(&self) {
        self.core.listener.stop();
        for timer in self.core.timers.lock().drain(..) {
            timer.cancel();
        }

        let core = self.core.clone();
        let drained = self.core.main_loop.queue(move || {
            core.with_state(|state| {
                for id in state.dispatch.fail_all(|| DhtError::Shutdown) {
                    state.table.query_finished(&id);
                }
            });
        });
        if let Err(e) = drained {
            trace!("pending queries not drained: {}", e);
        }

        self.core.set_state(DhtState::NotReady);
        info!("DHT engine {} stopped", self.core.local_id);
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn local_id(&self) -> NodeId {
        self.core.local_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.listener.local_addr()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.core.config
    }

    pub fn state(&self) -> DhtState {
        *self.core.status.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DhtState> {
        self.core.status.subscribe()
    }

    /// Fills the routing table from `seeds`. Returns the resulting node count.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize, DhtError> {
        task::bootstrap(&self.core, seeds).await
    }

    /// Bootstraps from the host names in `config.bootstrap_nodes`.
    pub async fn bootstrap_default(&self) -> Result<usize, DhtError> {
        let mut seeds = Vec::new();
        for host in &self.core.config.bootstrap_nodes {
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(addrs) => seeds.extend(addrs.filter(SocketAddr::is_ipv4).take(1)),
                Err(e) => warn!("failed to resolve bootstrap node {}: {}", host, e),
            }
        }

        if seeds.is_empty() {
            return Err(DhtError::Exhausted("no bootstrap node resolved".into()));
        }
        self.bootstrap(&seeds).await
    }

    /// Runs an iterative lookup for `target` and returns its full outcome.
    pub async fn lookup(&self, target: NodeId, kind: LookupKind) -> Result<LookupResult, DhtError> {
        IterativeLookup::new(self.core.clone(), target, kind)
            .run()
            .await
    }

    /// The responding nodes nearest `target`, nearest first.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Node>, DhtError> {
        Ok(self.lookup(target, LookupKind::FindNode).await?.closest)
    }

    /// Peers other nodes hold for `info_hash`.
    pub async fn find_peers(&self, info_hash: NodeId) -> Result<Vec<SocketAddr>, DhtError> {
        let lookup = self.lookup(info_hash, LookupKind::GetPeers).await?;
        info!(
            "found {} peers for {} after querying {} nodes",
            lookup.peers.len(),
            info_hash,
            lookup.queried
        );
        Ok(lookup.peers)
    }

    pub async fn announce(&self, info_hash: NodeId, port: u16) -> Result<AnnounceReport, DhtError> {
        task::announce(&self.core, info_hash, port).await
    }

    /// Pings `addr` and returns its node id.
    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        task::ping(&self.core, addr).await
    }

    pub async fn add_node(&self, node: Node) -> Result<InsertOutcome, DhtError> {
        self.core
            .exec(move |core| core.with_state(|state| state.table.insert(node)))
            .await
    }

    pub async fn node(&self, id: NodeId) -> Result<Option<Node>, DhtError> {
        self.core
            .exec(move |core| core.with_state(|state| state.table.get(&id).cloned()))
            .await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>, DhtError> {
        self.core
            .exec(|core| core.with_state(|state| state.table.all_nodes()))
            .await
    }

    pub async fn node_count(&self) -> Result<usize, DhtError> {
        self.core
            .exec(|core| core.with_state(|state| state.table.len()))
            .await
    }

    /// Bucket ranges as `(min, end)`; `None` marks the top of the keyspace.
    pub async fn bucket_ranges(&self) -> Result<Vec<(NodeId, Option<NodeId>)>, DhtError> {
        self.core
            .exec(|core| {
                core.with_state(|state| state.table.buckets().iter().map(|b| b.range()).collect())
            })
            .await
    }
}

impl Drop for DhtEngine {
    fn drop(&mut self) {
        self.stop();
        self.core.main_loop.shutdown();
    }
}
