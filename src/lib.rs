//! rdht - A Kademlia DHT engine
//!
//! This library implements a BitTorrent mainline DHT node ([BEP-5]) for
//! decentralized peer discovery: finding which peers claim to have a given
//! info-hash without a central tracker, and announcing ourselves as one.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding, the KRPC wire codec
//! - [`dht`] - BEP-5 routing table, KRPC protocol, lookups and the engine
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    AnnounceReport, DhtConfig, DhtEngine, DhtError, DhtMessage, DhtState, Listener, MainLoop,
    Node, NodeId, RoutingTable, UdpListener,
};
