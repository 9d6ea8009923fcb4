use super::engine::Core;
use super::error::DhtError;
use super::message::{DhtQuery, DhtResponse};
use super::node::{Distance, Node, NodeId};
use super::task;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    GetPeers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Fresh,
    Responded,
    Failed,
}

struct Candidate {
    node: Node,
    progress: Progress,
}

/// Outcome of an [`IterativeLookup`].
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub target: NodeId,
    /// Responding nodes nearest the target, nearest first. For `get_peers`
    /// lookups each carries the announce token it issued, if any.
    pub closest: Vec<Node>,
    /// Peers collected from `get_peers` answers, first seen first.
    pub peers: Vec<SocketAddr>,
    pub queried: usize,
    pub rounds: usize,
}

/// Kademlia node lookup converging on `target`.
///
/// Each round queries up to α of the K nearest candidates not yet asked,
/// in parallel. The lookup ends when a round brings nothing strictly nearer
/// than the best candidate held before it, when no unasked candidate is
/// left, or at the iteration ceiling. A node that fails is dropped from the
/// candidate set and counted against it in the routing table.
///
/// Convergence is judged per round, so with α below K a lookup whose first
/// round brings nothing nearer stops having asked only α of its K seeds.
/// Callers that need wider coverage raise `alpha`.
pub(crate) struct IterativeLookup {
    core: Arc<Core>,
    target: NodeId,
    kind: LookupKind,
    candidates: BTreeMap<Distance, Candidate>,
    peers: Vec<SocketAddr>,
    seen_peers: HashSet<SocketAddr>,
    tokens: Vec<(NodeId, Bytes)>,
    queried: usize,
}

impl IterativeLookup {
    pub(crate) fn new(core: Arc<Core>, target: NodeId, kind: LookupKind) -> Self {
        Self {
            core,
            target,
            kind,
            candidates: BTreeMap::new(),
            peers: Vec::new(),
            seen_peers: HashSet::new(),
            tokens: Vec::new(),
            queried: 0,
        }
    }

    pub(crate) async fn run(mut self) -> Result<LookupResult, DhtError> {
        let target = self.target;
        let k = self.core.config.bucket_size;
        let seeds = self
            .core
            .exec(move |core| core.with_state(|state| state.table.closest(&target, k)))
            .await?;

        if seeds.is_empty() {
            return Err(DhtError::Exhausted("routing table is empty".into()));
        }
        self.merge(seeds);

        let mut rounds = 0;
        while rounds < self.core.config.max_iterations {
            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }
            rounds += 1;

            let best_before = self.best_distance();
            self.query_round(batch).await?;

            match (self.best_distance(), best_before) {
                (Some(now), Some(before)) if now < before => {}
                (Some(_), None) => {}
                _ => {
                    trace!("lookup for {} converged after {} rounds", target, rounds);
                    break;
                }
            }
        }

        let closest: Vec<Node> = self
            .candidates
            .into_values()
            .filter(|c| c.progress == Progress::Responded)
            .map(|c| c.node)
            .take(k)
            .collect();

        debug!(
            "{:?} lookup for {} queried {} nodes in {} rounds: {} closest, {} peers",
            self.kind,
            target,
            self.queried,
            rounds,
            closest.len(),
            self.peers.len()
        );

        if closest.is_empty() {
            return Err(DhtError::Exhausted("no node responded".into()));
        }

        Ok(LookupResult {
            target,
            closest,
            peers: self.peers,
            queried: self.queried,
            rounds,
        })
    }

    /// Up to α unasked nodes among the K nearest live candidates.
    fn next_batch(&self) -> Vec<Node> {
        self.candidates
            .values()
            .filter(|c| c.progress != Progress::Failed)
            .take(self.core.config.bucket_size)
            .filter(|c| c.progress == Progress::Fresh)
            .take(self.core.config.alpha)
            .map(|c| c.node.clone())
            .collect()
    }

    fn best_distance(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .find(|(_, c)| c.progress != Progress::Failed)
            .map(|(d, _)| *d)
    }

    fn merge(&mut self, nodes: Vec<Node>) -> Vec<Node> {
        let local_id = self.core.local_id;
        let mut learned = Vec::new();
        for node in nodes {
            if node.id == local_id {
                continue;
            }
            let distance = node.id.distance(&self.target);
            self.candidates.entry(distance).or_insert_with(|| {
                learned.push(node.clone());
                Candidate {
                    node,
                    progress: Progress::Fresh,
                }
            });
        }
        learned
    }

    async fn query_round(&mut self, batch: Vec<Node>) -> Result<(), DhtError> {
        let query = match self.kind {
            LookupKind::FindNode => DhtQuery::FindNode {
                target: self.target,
            },
            LookupKind::GetPeers => DhtQuery::GetPeers {
                info_hash: self.target,
            },
        };
        let core = self.core.clone();
        let retries = core.config.query_retries;
        self.queried += batch.len();

        let results = join_all(batch.iter().map(|node| {
            task::send_query(&core, Some(node.id), node.addr, query.clone(), retries)
        }))
        .await;

        let mut learned = Vec::new();
        for (node, result) in batch.into_iter().zip(results) {
            let distance = node.id.distance(&self.target);
            match result {
                Ok(response) => {
                    self.set_progress(&distance, Progress::Responded);
                    learned.extend(self.absorb(&distance, response));
                }
                Err(e) => {
                    trace!("lookup query to {} failed: {}", node.addr, e);
                    self.set_progress(&distance, Progress::Failed);
                }
            }
        }

        let tokens = std::mem::take(&mut self.tokens);
        if learned.is_empty() && tokens.is_empty() {
            return Ok(());
        }
        self.core
            .exec(move |core| {
                core.with_state(|state| {
                    for node in learned {
                        state.table.insert(node);
                    }
                    for (id, token) in tokens {
                        state.table.set_token(&id, token);
                    }
                })
            })
            .await
    }

    fn set_progress(&mut self, distance: &Distance, progress: Progress) {
        if let Some(candidate) = self.candidates.get_mut(distance) {
            candidate.progress = progress;
        }
    }

    fn absorb(&mut self, distance: &Distance, response: DhtResponse) -> Vec<Node> {
        match response {
            DhtResponse::FindNode { nodes, .. } => self.merge(nodes),
            DhtResponse::GetPeers {
                id,
                token,
                peers,
                nodes,
            } => {
                for peer in peers {
                    if self.seen_peers.insert(peer) {
                        self.peers.push(peer);
                    }
                }
                if let Some(token) = token {
                    if let Some(candidate) = self.candidates.get_mut(distance) {
                        candidate.node.token = Some(token.clone());
                    }
                    self.tokens.push((id, token));
                }
                self.merge(nodes)
            }
            DhtResponse::Ping { .. } | DhtResponse::AnnouncePeer { .. } => Vec::new(),
        }
    }
}
