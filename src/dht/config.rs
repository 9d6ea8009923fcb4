use std::time::Duration;

/// Maximum active nodes per bucket (K).
pub const DEFAULT_BUCKET_SIZE: usize = 8;
/// Nodes queried in parallel per lookup round (α).
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_QUERY_RETRIES: usize = 2;
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_FAILURE_THRESHOLD: u8 = 3;
pub const DEFAULT_MAX_PENDING_QUERIES: usize = 1024;
pub const DEFAULT_TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BUCKET_REFRESH: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_PEER_LIFETIME: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_PEERS_PER_HASH: usize = 1000;
pub const DEFAULT_SCHEDULER_POOL: usize = 64;
pub const DEFAULT_PORT: u16 = 6881;

pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Tuning knobs for a [`DhtEngine`](super::DhtEngine).
///
/// The defaults follow common mainline DHT deployments. Tests usually shrink
/// `query_timeout` and raise `alpha` to make lookups deterministic.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// UDP port used by [`DhtEngine::bind`](super::DhtEngine::bind).
    pub port: u16,
    pub bucket_size: usize,
    pub alpha: usize,
    /// Capacity of each bucket's replacement cache.
    pub replacement_cache_size: usize,
    /// Extra prefix bits beyond the local id's bucket that may still split.
    /// Zero splits only the bucket covering the local id.
    pub split_horizon: u32,
    /// Failed exchanges after which a node becomes evictable.
    pub failure_threshold: u8,
    pub query_timeout: Duration,
    /// Retransmissions after the first send before a query reports timeout.
    pub query_retries: usize,
    /// Round ceiling for iterative lookups.
    pub max_iterations: usize,
    pub max_pending_queries: usize,
    pub token_rotation: Duration,
    /// `None` disables background refresh of idle buckets.
    pub bucket_refresh: Option<Duration>,
    pub peer_lifetime: Duration,
    pub max_peers_per_hash: usize,
    /// Work-item containers kept by the scheduler; zero disables pooling.
    pub scheduler_pool: usize,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            replacement_cache_size: DEFAULT_BUCKET_SIZE,
            split_horizon: 0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            query_retries: DEFAULT_QUERY_RETRIES,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_pending_queries: DEFAULT_MAX_PENDING_QUERIES,
            token_rotation: DEFAULT_TOKEN_ROTATION,
            bucket_refresh: Some(DEFAULT_BUCKET_REFRESH),
            peer_lifetime: DEFAULT_PEER_LIFETIME,
            max_peers_per_hash: DEFAULT_MAX_PEERS_PER_HASH,
            scheduler_pool: DEFAULT_SCHEDULER_POOL,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
        }
    }
}
