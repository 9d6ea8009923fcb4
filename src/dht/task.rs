use super::dispatch;
use super::engine::{Core, DhtState};
use super::error::DhtError;
use super::lookup::{IterativeLookup, LookupKind};
use super::message::{DhtQuery, DhtResponse};
use super::node::{Node, NodeId};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Sends one query, retransmitting up to `retries` times on timeout.
///
/// When every attempt times out, the node's failure counter goes up by
/// exactly one and the call reports [`DhtError::Timeout`]. Remote errors
/// and malformed answers are returned as they are, without a retry.
pub(crate) async fn send_query(
    core: &Arc<Core>,
    node_id: Option<NodeId>,
    addr: SocketAddr,
    query: DhtQuery,
    retries: usize,
) -> Result<DhtResponse, DhtError> {
    for attempt in 0..=retries {
        let query = query.clone();
        let rx = core
            .exec(move |core| dispatch::send_query(core, node_id, addr, query))
            .await??;

        match rx.await {
            Ok(Err(DhtError::Timeout)) => {
                trace!("query to {} timed out (attempt {})", addr, attempt + 1);
            }
            Ok(result) => return result,
            Err(_) => return Err(DhtError::Shutdown),
        }
    }

    if let Some(id) = node_id {
        let failures = core
            .exec(move |core| core.with_state(|state| state.table.failed(&id)))
            .await?;
        debug!(
            "{} did not answer after {} attempts ({:?} failures)",
            addr,
            retries + 1,
            failures
        );
    }
    Err(DhtError::Timeout)
}

/// Single ping round-trip; resolves with the responder's id.
pub(crate) async fn ping(core: &Arc<Core>, addr: SocketAddr) -> Result<NodeId, DhtError> {
    let known = core
        .exec(move |core| {
            core.with_state(|state| {
                state
                    .table
                    .all_nodes()
                    .into_iter()
                    .find(|n| n.addr == addr)
                    .map(|n| n.id)
            })
        })
        .await?;

    let response = send_query(core, known, addr, DhtQuery::Ping, 0).await?;
    Ok(response.id())
}

/// Per-node results of an announce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceReport {
    /// Nodes that acknowledged the announce.
    pub announced: usize,
    /// Nodes that held a token but did not acknowledge.
    pub failed: usize,
    /// Responding nodes that issued no token.
    pub skipped: usize,
    /// Peers already known for the info-hash.
    pub peers: Vec<SocketAddr>,
}

/// Announces `port` for `info_hash` to the nearest nodes that issued a token.
pub(crate) async fn announce(
    core: &Arc<Core>,
    info_hash: NodeId,
    port: u16,
) -> Result<AnnounceReport, DhtError> {
    let lookup = IterativeLookup::new(core.clone(), info_hash, LookupKind::GetPeers)
        .run()
        .await?;

    let (holders, tokenless): (Vec<Node>, Vec<Node>) = lookup
        .closest
        .into_iter()
        .partition(|n| n.token.is_some());

    if holders.is_empty() {
        return Err(DhtError::Exhausted("no node issued an announce token".into()));
    }

    let retries = core.config.query_retries;
    let results = join_all(holders.iter().map(|node| {
        let query = DhtQuery::AnnouncePeer {
            info_hash,
            port,
            token: node.token.clone().unwrap_or_default(),
            implied_port: false,
        };
        send_query(core, Some(node.id), node.addr, query, retries)
    }))
    .await;

    let mut report = AnnounceReport {
        skipped: tokenless.len(),
        peers: lookup.peers,
        ..AnnounceReport::default()
    };
    for (node, result) in holders.iter().zip(results) {
        match result {
            Ok(_) => report.announced += 1,
            Err(e) => {
                debug!("announce to {} failed: {}", node.addr, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "announced {} on port {} to {} nodes ({} failed, {} skipped)",
        info_hash, port, report.announced, report.failed, report.skipped
    );

    if report.announced == 0 {
        return Err(DhtError::Exhausted("every announce failed".into()));
    }
    Ok(report)
}

/// Seeds the routing table from `seeds`, then looks up the local id.
///
/// Fails only when no seed answered and the table is still empty.
pub(crate) async fn bootstrap(core: &Arc<Core>, seeds: &[SocketAddr]) -> Result<usize, DhtError> {
    core.set_state(DhtState::Initialising);
    info!("bootstrapping DHT from {} seeds", seeds.len());

    let target = core.local_id;
    let retries = core.config.query_retries;
    let results = join_all(seeds.iter().map(|addr| {
        send_query(core, None, *addr, DhtQuery::FindNode { target }, retries)
    }))
    .await;

    let mut learned = Vec::new();
    let mut answered = 0;
    for (addr, result) in seeds.iter().zip(results) {
        match result {
            Ok(DhtResponse::FindNode { nodes, .. }) => {
                answered += 1;
                learned.extend(nodes);
            }
            Ok(_) => answered += 1,
            Err(e) => warn!("bootstrap node {} failed: {}", addr, e),
        }
    }

    let count = core
        .exec(move |core| {
            core.with_state(|state| {
                for node in learned {
                    state.table.insert(node);
                }
                state.table.len()
            })
        })
        .await?;

    if answered == 0 && count == 0 {
        core.set_state(DhtState::NotReady);
        return Err(DhtError::Exhausted("no bootstrap node answered".into()));
    }

    if let Err(e) = IterativeLookup::new(core.clone(), target, LookupKind::FindNode)
        .run()
        .await
    {
        debug!("bootstrap lookup ended early: {}", e);
    }

    let count = core.exec(|core| core.with_state(|state| state.table.len())).await?;
    core.set_state(DhtState::Ready);
    info!("DHT bootstrap complete, {} nodes in routing table", count);
    Ok(count)
}

/// Looks up a random id inside every bucket idle for `config.bucket_refresh`.
pub(crate) async fn refresh(core: &Arc<Core>) -> Result<(), DhtError> {
    let Some(age) = core.config.bucket_refresh else {
        return Ok(());
    };

    let stale = core
        .exec(move |core| core.with_state(|state| state.table.stale_buckets(age)))
        .await?;
    if stale.is_empty() {
        return Ok(());
    }

    debug!("refreshing {} stale buckets", stale.len());
    for prefix in stale {
        let target = prefix.random_id();
        if let Err(e) = IterativeLookup::new(core.clone(), target, LookupKind::FindNode)
            .run()
            .await
        {
            trace!("refresh lookup for {} failed: {}", target, e);
        }
    }
    Ok(())
}
