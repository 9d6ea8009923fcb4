use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

const TOKEN_LEN: usize = 8;

/// Issues and checks `announce_peer` write tokens.
///
/// A token is a truncated SHA-1 over a rotating secret and the requester's
/// IP. Tokens minted under the current or the previous secret are accepted,
/// so a token stays valid for at least one full rotation period.
pub struct TokenManager {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    pub fn generate(&self, addr: &SocketAddr) -> Bytes {
        token_for(&self.current, addr.ip())
    }

    pub fn validate(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        let ip = addr.ip();
        token_for(&self.current, ip) == token || token_for(&self.previous, ip) == token
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        debug!("DHT token secret rotated");
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn token_for(secret: &[u8; 16], ip: IpAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    Bytes::copy_from_slice(&digest[..TOKEN_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn token_is_bound_to_ip_not_port() {
        let tokens = TokenManager::new();
        let token = tokens.generate(&addr("10.0.0.1:1000"));

        assert_eq!(token.len(), TOKEN_LEN);
        assert!(tokens.validate(&addr("10.0.0.1:2000"), &token));
        assert!(!tokens.validate(&addr("10.0.0.2:1000"), &token));
    }

    #[test]
    fn token_survives_one_rotation() {
        let mut tokens = TokenManager::new();
        let from = addr("192.168.1.5:6881");
        let token = tokens.generate(&from);

        tokens.rotate();
        assert!(tokens.validate(&from, &token));

        tokens.rotate();
        assert!(!tokens.validate(&from, &token));
    }

    #[test]
    fn garbage_token_rejected() {
        let tokens = TokenManager::new();
        assert!(!tokens.validate(&addr("127.0.0.1:1"), b"bogus"));
        assert!(!tokens.validate(&addr("127.0.0.1:1"), b""));
    }
}
