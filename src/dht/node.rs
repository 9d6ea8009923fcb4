use super::error::DhtError;
use bytes::Bytes;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

pub const ID_LEN: usize = 20;
pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
pub const COMPACT_PEER_LEN: usize = 6;

/// Silence after which a good node degrades to questionable.
const GOOD_NODE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// A 160-bit position in the DHT keyspace. Info-hashes share this type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0; ID_LEN]);

    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        Distance(dist)
    }

    /// True when `self` is strictly closer to `target` than `other` is.
    pub fn closer_to(&self, target: &NodeId, other: &NodeId) -> bool {
        self.distance(target) < other.distance(target)
    }

    /// Number of leading bits shared with `other`.
    pub fn common_prefix_len(&self, other: &NodeId) -> u32 {
        self.distance(other).leading_zeros()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// XOR distance between two ids, ordered as an unsigned big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_LEN]);

    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            if byte != 0 {
                return zeros + byte.leading_zeros();
            }
            zeros += 8;
        }
        zeros
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never answered one of our queries.
    Unknown,
    /// Answered before, but failed since or went quiet.
    Questionable,
    /// Answered recently with no failure since.
    Good,
}

/// A remote DHT participant as seen from this node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub last_response: Option<Instant>,
    pub failures: u8,
    /// Announce token this node handed us in its last `get_peers` answer.
    pub token: Option<Bytes>,
    in_flight: u16,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            last_response: None,
            failures: 0,
            token: None,
            in_flight: 0,
        }
    }

    pub fn state(&self) -> NodeState {
        match self.last_response {
            None => NodeState::Unknown,
            Some(_) if self.failures > 0 => NodeState::Questionable,
            Some(at) if at.elapsed() >= GOOD_NODE_WINDOW => NodeState::Questionable,
            Some(_) => NodeState::Good,
        }
    }

    /// Records an answer to one of our queries.
    pub fn responded(&mut self) {
        let now = Instant::now();
        self.last_seen = now;
        self.last_response = Some(now);
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_good(&self) -> bool {
        self.state() == NodeState::Good
    }

    pub fn is_bad(&self, threshold: u8) -> bool {
        self.failures >= threshold
    }

    /// True while at least one query to this node awaits an answer.
    pub fn is_awaiting_response(&self) -> bool {
        self.in_flight > 0
    }

    pub(crate) fn query_started(&mut self) {
        self.in_flight = self.in_flight.saturating_add(1);
    }

    pub(crate) fn query_finished(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Folds a newer sighting of the same node into this record.
    pub(crate) fn merge(&mut self, other: Node) {
        self.addr = other.addr;
        self.last_seen = self.last_seen.max(other.last_seen);
        if other.last_response.is_some() {
            self.last_response = self.last_response.max(other.last_response);
            self.failures = 0;
        }
        if other.token.is_some() {
            self.token = other.token;
        }
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..ID_LEN]).ok()?;
        let addr = peer_from_compact(&data[ID_LEN..])?;
        Some(Self::new(id, addr))
    }

    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..ID_LEN].copy_from_slice(&self.id.0);
        compact[ID_LEN..].copy_from_slice(&peer_to_compact(&self.addr)?);
        Some(compact)
    }
}

/// Concatenated compact node infos, as carried in the `nodes` key.
pub fn nodes_to_compact(nodes: &[Node]) -> Bytes {
    nodes
        .iter()
        .filter_map(Node::to_compact)
        .flatten()
        .collect::<Vec<u8>>()
        .into()
}

pub fn nodes_from_compact(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(Node::from_compact)
        .collect()
}

pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn peer_to_compact(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut data = [0u8; COMPACT_PEER_LEN];
            data[..4].copy_from_slice(&v4.ip().octets());
            data[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(data)
        }
        SocketAddr::V6(_) => None,
    }
}
