use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::config::{DhtConfig, DEFAULT_BUCKET_SIZE, DEFAULT_FAILURE_THRESHOLD};
use super::node::{Node, NodeId, ID_LEN};

const ID_BITS: u32 = (ID_LEN * 8) as u32;

/// A contiguous slice of the keyspace: every id sharing the first `depth`
/// bits of `base`. The bits of `base` past `depth` are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    base: NodeId,
    depth: u32,
}

impl Prefix {
    pub const ALL: Prefix = Prefix {
        base: NodeId::MIN,
        depth: 0,
    };

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn covers(&self, id: &NodeId) -> bool {
        self.base.common_prefix_len(id) >= self.depth
    }

    /// Inclusive lower bound.
    pub fn min(&self) -> NodeId {
        self.base
    }

    /// Exclusive upper bound; `None` is the end of the 160-bit space.
    pub fn end(&self) -> Option<NodeId> {
        if self.depth == 0 {
            return None;
        }

        let mut end = self.base.0;
        let bit = self.depth - 1;
        let mut byte = (bit / 8) as usize;
        let mut carry = 0x80u16 >> (bit % 8);

        loop {
            let sum = end[byte] as u16 + carry;
            end[byte] = sum as u8;
            carry = sum >> 8;
            if carry == 0 {
                return Some(NodeId(end));
            }
            if byte == 0 {
                return None;
            }
            byte -= 1;
        }
    }

    fn split(&self) -> Option<(Prefix, Prefix)> {
        if self.depth >= ID_BITS {
            return None;
        }

        let mut high = self.base;
        high.0[(self.depth / 8) as usize] |= 0x80 >> (self.depth % 8);

        let depth = self.depth + 1;
        Some((
            Prefix {
                base: self.base,
                depth,
            },
            Prefix { base: high, depth },
        ))
    }

    /// A random id inside this prefix, used as a refresh target.
    pub fn random_id(&self) -> NodeId {
        let mut id = NodeId::generate();
        let full_bytes = (self.depth / 8) as usize;
        id.0[..full_bytes].copy_from_slice(&self.base.0[..full_bytes]);

        let bits = self.depth % 8;
        if bits != 0 {
            let mask = 0xffu8 << (8 - bits);
            id.0[full_bytes] = (self.base.0[full_bytes] & mask) | (id.0[full_bytes] & !mask);
        }
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// The node was already active; its record was refreshed in place.
    Refreshed,
    /// The node took the slot of an unresponsive node.
    Replaced(NodeId),
    /// The bucket was full; the node waits in the replacement cache.
    Cached,
    /// The local id is never stored.
    Ignored,
}

/// Active nodes ordered least- to most-recently seen, plus candidates that
/// did not fit.
#[derive(Debug)]
pub struct Bucket {
    prefix: Prefix,
    nodes: VecDeque<Node>,
    replacements: VecDeque<Node>,
    last_changed: Instant,
}

impl Bucket {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            nodes: VecDeque::new(),
            replacements: VecDeque::new(),
            last_changed: Instant::now(),
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    /// `[min, max)` covered by this bucket; `max = None` is the top of the space.
    pub fn range(&self) -> (NodeId, Option<NodeId>) {
        (self.prefix.min(), self.prefix.end())
    }

    pub fn covers(&self, id: &NodeId) -> bool {
        self.prefix.covers(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn replacements(&self) -> impl Iterator<Item = &Node> {
        self.replacements.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn promote_replacement(&mut self) {
        if let Some(candidate) = self.replacements.pop_back() {
            trace!("promoting replacement {} into bucket", candidate.id);
            self.nodes.push_back(candidate);
        }
    }
}

/// Kademlia routing table whose buckets partition the keyspace.
///
/// Holds no lock: the owning engine only touches it from its scheduler.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    bucket_size: usize,
    cache_size: usize,
    split_horizon: u32,
    failure_threshold: u8,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(Prefix::ALL)],
            bucket_size: DEFAULT_BUCKET_SIZE,
            cache_size: DEFAULT_BUCKET_SIZE,
            split_horizon: 0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    pub fn with_config(local_id: NodeId, config: &DhtConfig) -> Self {
        Self {
            bucket_size: config.bucket_size.max(1),
            cache_size: config.replacement_cache_size,
            split_horizon: config.split_horizon,
            failure_threshold: config.failure_threshold,
            ..Self::new(local_id)
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    fn index_of(&self, id: &NodeId) -> usize {
        // buckets are sorted by base and partition the space
        self.buckets
            .partition_point(|b| b.prefix.min() <= *id)
            .saturating_sub(1)
    }

    pub fn bucket_for(&self, id: &NodeId) -> &Bucket {
        &self.buckets[self.index_of(id)]
    }

    pub fn insert(&mut self, node: Node) -> InsertOutcome {
        if node.id == self.local_id {
            return InsertOutcome::Ignored;
        }

        loop {
            let idx = self.index_of(&node.id);
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.position(&node.id) {
                if let Some(mut existing) = bucket.nodes.remove(pos) {
                    existing.merge(node);
                    bucket.nodes.push_back(existing);
                }
                bucket.last_changed = Instant::now();
                return InsertOutcome::Refreshed;
            }

            if bucket.nodes.len() < self.bucket_size {
                bucket.replacements.retain(|n| n.id != node.id);
                bucket.nodes.push_back(node);
                bucket.last_changed = Instant::now();
                return InsertOutcome::Added;
            }

            if self.can_split(idx) {
                self.split(idx);
                continue;
            }

            return self.evict_or_cache(idx, node);
        }
    }

    fn evict_or_cache(&mut self, idx: usize, node: Node) -> InsertOutcome {
        let threshold = self.failure_threshold;
        let bucket = &mut self.buckets[idx];

        // front of the queue is the least recently seen
        let victim = bucket
            .nodes
            .iter()
            .position(|n| n.is_bad(threshold) && !n.is_awaiting_response());

        if let Some(evicted) = victim.and_then(|pos| bucket.nodes.remove(pos)) {
            debug!("evicting unresponsive node {} for {}", evicted.id, node.id);
            bucket.replacements.retain(|n| n.id != node.id);
            bucket.nodes.push_back(node);
            bucket.last_changed = Instant::now();
            return InsertOutcome::Replaced(evicted.id);
        }

        if let Some(pos) = bucket.replacements.iter().position(|n| n.id == node.id) {
            if let Some(mut existing) = bucket.replacements.remove(pos) {
                existing.merge(node);
                bucket.replacements.push_back(existing);
            }
        } else if self.cache_size > 0 {
            if bucket.replacements.len() >= self.cache_size {
                bucket.replacements.pop_front();
            }
            bucket.replacements.push_back(node);
        }

        InsertOutcome::Cached
    }

    fn can_split(&self, idx: usize) -> bool {
        let prefix = self.buckets[idx].prefix;
        if prefix.depth >= ID_BITS {
            return false;
        }
        if prefix.covers(&self.local_id) {
            return true;
        }

        let shared = prefix.min().common_prefix_len(&self.local_id);
        self.split_horizon > 0 && prefix.depth - shared <= self.split_horizon
    }

    fn split(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let Some((low_prefix, high_prefix)) = bucket.prefix.split() else {
            self.buckets.insert(idx, bucket);
            return;
        };

        let mut low = Bucket::new(low_prefix);
        let mut high = Bucket::new(high_prefix);
        low.last_changed = bucket.last_changed;
        high.last_changed = bucket.last_changed;

        for node in bucket.nodes {
            if high_prefix.covers(&node.id) {
                high.nodes.push_back(node);
            } else {
                low.nodes.push_back(node);
            }
        }
        for node in bucket.replacements {
            if high_prefix.covers(&node.id) {
                high.replacements.push_back(node);
            } else {
                low.replacements.push_back(node);
            }
        }

        for half in [&mut low, &mut high] {
            while half.nodes.len() < self.bucket_size && !half.replacements.is_empty() {
                half.promote_replacement();
            }
        }

        debug!(
            "split bucket at depth {} into {} + {} nodes",
            low_prefix.depth - 1,
            low.nodes.len(),
            high.nodes.len()
        );

        self.buckets.insert(idx, high);
        self.buckets.insert(idx, low);
    }

    /// Records a query received from `id`, inserting it if unknown.
    pub fn heard_from(&mut self, id: NodeId, addr: SocketAddr) -> InsertOutcome {
        self.insert(Node::new(id, addr))
    }

    /// Records an answer from `id`, marking it good.
    pub fn responded(&mut self, id: NodeId, addr: SocketAddr) -> InsertOutcome {
        let mut node = Node::new(id, addr);
        node.responded();
        self.insert(node)
    }

    /// Counts a failed exchange against `id`. A node that crosses the failure
    /// threshold is swapped for the freshest replacement candidate, if any.
    ///
    /// Returns the node's failure count, or `None` if it is not active.
    pub fn failed(&mut self, id: &NodeId) -> Option<u8> {
        let threshold = self.failure_threshold;
        let idx = self.index_of(id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.position(id)?;

        let node = &mut bucket.nodes[pos];
        node.fail();
        let failures = node.failures;

        if node.is_bad(threshold) && !node.is_awaiting_response() && !bucket.replacements.is_empty() {
            bucket.nodes.remove(pos);
            bucket.promote_replacement();
            debug!("dropped bad node {} after {} failures", id, failures);
        }

        Some(failures)
    }

    pub fn query_started(&mut self, id: &NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.query_started();
        }
    }

    pub fn query_finished(&mut self, id: &NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.query_finished();
        }
    }

    /// Remembers the announce token `id` issued to us.
    pub fn set_token(&mut self, id: &NodeId, token: Bytes) {
        if let Some(node) = self.get_mut(id) {
            node.token = Some(token);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.bucket_for(id).nodes.iter().find(|n| &n.id == id)
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let idx = self.index_of(id);
        self.buckets[idx].nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.index_of(id);
        let bucket = &mut self.buckets[idx];
        bucket.replacements.retain(|n| &n.id != id);

        let pos = bucket.position(id)?;
        let removed = bucket.nodes.remove(pos)?;
        bucket.promote_replacement();
        bucket.last_changed = Instant::now();
        Some(removed)
    }

    /// Up to `count` active nodes nearest to `target`, nearest first. Equal
    /// distances rank the more recently seen node first. Nodes past the
    /// failure threshold are left out.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<&Node> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_bad(self.failure_threshold))
            .collect();

        nodes.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        nodes.into_iter().take(count).cloned().collect()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buckets with no membership change for at least `age`.
    pub fn stale_buckets(&self, age: Duration) -> Vec<Prefix> {
        self.buckets
            .iter()
            .filter(|b| b.last_changed.elapsed() >= age)
            .map(|b| b.prefix)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881)
    }

    fn id_with(first: u8, last: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = first;
        id[19] = last;
        NodeId(id)
    }

    fn assert_partition(table: &RoutingTable) {
        let buckets = table.buckets();
        assert_eq!(buckets[0].range().0, NodeId::MIN);
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].range().1, Some(pair[1].range().0));
        }
        assert_eq!(buckets[buckets.len() - 1].range().1, None);
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(Prefix::ALL.end(), None);
        let (low, high) = Prefix::ALL.split().unwrap();
        assert_eq!(low.end(), Some(id_with(0x80, 0)));
        assert_eq!(high.end(), None);

        let (low, high) = low.split().unwrap();
        assert_eq!(low.end(), Some(id_with(0x40, 0)));
        assert_eq!(high.min(), id_with(0x40, 0));
        assert_eq!(high.end(), Some(id_with(0x80, 0)));
    }

    #[test]
    fn test_prefix_random_id_stays_inside() {
        let (_, high) = Prefix::ALL.split().unwrap();
        let (low, _) = high.split().unwrap();
        for _ in 0..32 {
            assert!(low.covers(&low.random_id()));
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut table = RoutingTable::new(NodeId::MIN);
        let id = id_with(0x80, 1);

        assert_eq!(table.insert(Node::new(id, addr(1))), InsertOutcome::Added);
        let first_seen = table.get(&id).unwrap().last_seen;
        assert_eq!(
            table.insert(Node::new(id, addr(2))),
            InsertOutcome::Refreshed
        );

        assert_eq!(table.len(), 1);
        let node = table.get(&id).unwrap();
        assert_eq!(node.addr, addr(2));
        assert!(node.last_seen >= first_seen);
    }

    #[test]
    fn test_local_id_is_ignored() {
        let local = NodeId::generate();
        let mut table = RoutingTable::new(local);
        assert_eq!(
            table.insert(Node::new(local, addr(1))),
            InsertOutcome::Ignored
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_split_only_local_bucket() {
        let mut table = RoutingTable::new(NodeId::MIN);

        // 8 nodes in the far half fill the single bucket
        for i in 0..8 {
            table.insert(Node::new(id_with(0x80 | i, 0), addr(i)));
        }
        assert_eq!(table.buckets().len(), 1);

        // a near node forces a split of the bucket holding our id
        assert_eq!(
            table.insert(Node::new(id_with(0x01, 0), addr(100))),
            InsertOutcome::Added
        );
        assert_eq!(table.buckets().len(), 2);
        assert_partition(&table);

        // the far bucket is full and does not cover our id: no split
        assert_eq!(
            table.insert(Node::new(id_with(0xf0, 0), addr(101))),
            InsertOutcome::Cached
        );
        assert_eq!(table.buckets().len(), 2);
        assert_eq!(table.bucket_for(&id_with(0xf0, 0)).replacements().count(), 1);
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn test_split_horizon_allows_neighbour_split() {
        let config = DhtConfig {
            split_horizon: 1,
            ..DhtConfig::default()
        };
        let mut table = RoutingTable::with_config(NodeId::MIN, &config);

        for i in 0..8 {
            table.insert(Node::new(id_with(0x80 | i, 0), addr(i)));
        }
        table.insert(Node::new(id_with(0x01, 0), addr(100)));
        assert_eq!(table.buckets().len(), 2);

        // depth 1, shares 0 bits with us: within a horizon of 1
        table.insert(Node::new(id_with(0xf0, 0), addr(101)));
        assert_eq!(table.buckets().len(), 3);
        assert_eq!(table.len(), 10);
        assert_partition(&table);
    }

    #[test]
    fn test_eviction_of_bad_node() {
        let mut table = RoutingTable::new(NodeId::MIN);
        let far: Vec<NodeId> = (0..8).map(|i| id_with(0x80 | i, 0)).collect();
        for (i, id) in far.iter().enumerate() {
            table.insert(Node::new(*id, addr(i as u8)));
        }
        table.insert(Node::new(id_with(0x01, 0), addr(100)));

        let victim = far[3];
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            table.failed(&victim);
        }

        let newcomer = id_with(0xf0, 0);
        assert_eq!(
            table.insert(Node::new(newcomer, addr(101))),
            InsertOutcome::Replaced(victim)
        );
        assert!(table.get(&victim).is_none());
        assert!(table.get(&newcomer).is_some());
    }

    #[test]
    fn test_pending_node_is_not_evicted() {
        let mut table = RoutingTable::new(NodeId::MIN);
        for i in 0..8 {
            table.insert(Node::new(id_with(0x80 | i, 0), addr(i)));
        }
        table.insert(Node::new(id_with(0x01, 0), addr(100)));

        let victim = id_with(0x80, 0);
        table.query_started(&victim);
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            table.failed(&victim);
        }

        assert_eq!(
            table.insert(Node::new(id_with(0xf0, 0), addr(101))),
            InsertOutcome::Cached
        );
        assert!(table.get(&victim).is_some());

        // once the exchange completes the node becomes evictable
        table.query_finished(&victim);
        assert_eq!(
            table.insert(Node::new(id_with(0xf1, 0), addr(102))),
            InsertOutcome::Replaced(victim)
        );
    }

    #[test]
    fn test_replacement_cache_drops_oldest() {
        let config = DhtConfig {
            replacement_cache_size: 2,
            ..DhtConfig::default()
        };
        let mut table = RoutingTable::with_config(NodeId::MIN, &config);
        for i in 0..8 {
            table.insert(Node::new(id_with(0x80 | i, 0), addr(i)));
        }
        table.insert(Node::new(id_with(0x01, 0), addr(100)));

        for i in 0..3 {
            table.insert(Node::new(id_with(0xf0, i), addr(110 + i)));
        }

        let cached: Vec<NodeId> = table
            .bucket_for(&id_with(0xf0, 0))
            .replacements()
            .map(|n| n.id)
            .collect();
        assert_eq!(cached, vec![id_with(0xf0, 1), id_with(0xf0, 2)]);
    }

    #[test]
    fn test_remove_promotes_replacement() {
        let mut table = RoutingTable::new(NodeId::MIN);
        for i in 0..8 {
            table.insert(Node::new(id_with(0x80 | i, 0), addr(i)));
        }
        table.insert(Node::new(id_with(0x01, 0), addr(100)));
        table.insert(Node::new(id_with(0xf0, 0), addr(101)));

        assert!(table.remove(&id_with(0x80, 0)).is_some());
        assert!(table.get(&id_with(0xf0, 0)).is_some());
        assert_eq!(table.bucket_for(&id_with(0xf0, 0)).len(), 8);
    }

    #[test]
    fn test_failed_counts_and_swaps() {
        let mut table = RoutingTable::new(NodeId::MIN);
        let id = id_with(0x80, 0);
        table.insert(Node::new(id, addr(1)));
        assert_eq!(table.failed(&id), Some(1));
        assert_eq!(table.failed(&NodeId([0xff; 20])), None);
    }

    #[test]
    fn test_closest_spans_buckets_and_is_sorted() {
        let local = NodeId::generate();
        let mut table = RoutingTable::new(local);
        for _ in 0..200 {
            table.insert(Node::new(NodeId::generate(), addr(1)));
        }
        assert_partition(&table);

        let target = NodeId::generate();
        let closest = table.closest(&target, 8);
        assert_eq!(closest.len(), 8);

        for pair in closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }

        let mut all = table.all_nodes();
        all.sort_by_key(|n| n.id.distance(&target));
        let expected: Vec<NodeId> = all.iter().take(8).map(|n| n.id).collect();
        let got: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_closest_never_exceeds_count() {
        let mut table = RoutingTable::new(NodeId::MIN);
        for i in 0..3 {
            table.insert(Node::new(id_with(0x80, i), addr(i)));
        }
        assert_eq!(table.closest(&NodeId::MIN, 8).len(), 3);
        assert_eq!(table.closest(&NodeId::MIN, 2).len(), 2);
        assert!(table.closest(&NodeId::MIN, 0).is_empty());
    }

    #[test]
    fn test_partition_holds_under_random_load() {
        let mut table = RoutingTable::new(NodeId::generate());
        for _ in 0..1000 {
            table.insert(Node::new(NodeId::generate(), addr(1)));
            assert_partition(&table);
        }
        for bucket in table.buckets() {
            assert!(bucket.len() <= DEFAULT_BUCKET_SIZE);
            assert!(bucket.nodes().all(|n| bucket.covers(&n.id)));
        }
    }
}
