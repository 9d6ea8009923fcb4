//! Kademlia Distributed Hash Table (BEP-5)
//!
//! This module implements a mainline-compatible DHT node: the XOR-metric
//! routing table, the KRPC query/response protocol, iterative lookups for
//! nodes and peers, announces, and bootstrap.
//!
//! All engine state is owned by a [`MainLoop`], a single worker thread that
//! runs submitted jobs one at a time. Inbound datagrams, timer firings and
//! API calls are all turned into jobs on that loop, so the routing table and
//! the table of outstanding queries are never touched concurrently.
//!
//! # Examples
//!
//! ```no_run
//! use rdht::dht::{DhtConfig, DhtEngine, NodeId};
//!
//! # async fn example() -> Result<(), rdht::dht::DhtError> {
//! let dht = DhtEngine::bind(DhtConfig::default()).await?;
//! dht.start()?;
//!
//! let nodes = dht.bootstrap_default().await?;
//! println!("routing table holds {} nodes", nodes);
//!
//! let peers = dht.find_peers(NodeId([0xab; 20])).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod engine;
mod error;
mod listener;
mod lookup;
mod main_loop;
mod message;
mod node;
mod peer_store;
mod routing;
mod task;
mod token;

pub use config::{DhtConfig, BOOTSTRAP_NODES};
pub use engine::{DhtEngine, DhtState};
pub use error::DhtError;
pub use listener::{InboundHandler, Listener, ListenerStatus, UdpListener};
pub use lookup::{LookupKind, LookupResult};
pub use main_loop::{MainLoop, TimeoutHandle};
pub use message::{
    error_code, DhtMessage, DhtQuery, DhtResponse, KrpcError, QueryKind, ReturnValues,
    TransactionId,
};
pub use node::{Distance, Node, NodeId, NodeState};
pub use peer_store::PeerStore;
pub use routing::{Bucket, InsertOutcome, Prefix, RoutingTable};
pub use task::AnnounceReport;
pub use token::TokenManager;
