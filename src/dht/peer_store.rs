use super::node::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers other nodes announced to us, keyed by info-hash.
pub struct PeerStore {
    peers: HashMap<NodeId, Vec<AnnouncedPeer>>,
    lifetime: Duration,
    max_per_hash: usize,
}

impl PeerStore {
    pub fn new(lifetime: Duration, max_per_hash: usize) -> Self {
        Self {
            peers: HashMap::new(),
            lifetime,
            max_per_hash,
        }
    }

    /// Records `addr` for `info_hash`, refreshing it if already present.
    /// New peers beyond the per-hash cap are dropped.
    pub fn add(&mut self, info_hash: NodeId, addr: SocketAddr) {
        let now = Instant::now();
        let lifetime = self.lifetime;
        let peers = self.peers.entry(info_hash).or_default();

        peers.retain(|p| now.duration_since(p.announced_at) < lifetime);

        if let Some(existing) = peers.iter_mut().find(|p| p.addr == addr) {
            existing.announced_at = now;
        } else if peers.len() < self.max_per_hash {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
    }

    pub fn get(&mut self, info_hash: &NodeId) -> Vec<SocketAddr> {
        let now = Instant::now();
        let lifetime = self.lifetime;
        match self.peers.get_mut(info_hash) {
            Some(peers) => {
                peers.retain(|p| now.duration_since(p.announced_at) < lifetime);
                peers.iter().map(|p| p.addr).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drops expired announcements and empty entries.
    pub fn expire(&mut self) {
        let now = Instant::now();
        let lifetime = self.lifetime;
        self.peers.retain(|_, peers| {
            peers.retain(|p| now.duration_since(p.announced_at) < lifetime);
            !peers.is_empty()
        });
    }

    pub fn hash_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> NodeId {
        NodeId([b; 20])
    }

    #[test]
    fn add_is_idempotent_per_addr() {
        let mut store = PeerStore::new(Duration::from_secs(60), 10);
        let peer: SocketAddr = "1.2.3.4:5000".parse().unwrap();

        store.add(hash(1), peer);
        store.add(hash(1), peer);

        assert_eq!(store.get(&hash(1)), vec![peer]);
        assert!(store.get(&hash(2)).is_empty());
    }

    #[test]
    fn cap_drops_new_peers() {
        let mut store = PeerStore::new(Duration::from_secs(60), 2);
        for port in 1..=3u16 {
            store.add(hash(1), SocketAddr::from(([10, 0, 0, 1], port)));
        }
        let peers = store.get(&hash(1));
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&SocketAddr::from(([10, 0, 0, 1], 3))));
    }

    #[test]
    fn expired_peers_disappear() {
        let mut store = PeerStore::new(Duration::ZERO, 10);
        store.add(hash(1), "1.2.3.4:5000".parse().unwrap());

        assert!(store.get(&hash(1)).is_empty());
        store.expire();
        assert_eq!(store.hash_count(), 0);
    }
}
