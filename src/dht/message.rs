use super::error::DhtError;
use super::node::{
    nodes_from_compact, nodes_to_compact, peer_from_compact, peer_to_compact, Node, NodeId,
};
use crate::bencode::{decode, encode, DictBuilder, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;

pub type TransactionId = Bytes;

const KEY_TRANSACTION: &[u8] = b"t";
const KEY_TYPE: &[u8] = b"y";
const KEY_QUERY: &[u8] = b"q";
const KEY_ARGS: &[u8] = b"a";
const KEY_RETURN: &[u8] = b"r";
const KEY_ERROR: &[u8] = b"e";
const KEY_ID: &[u8] = b"id";
const KEY_TARGET: &[u8] = b"target";
const KEY_INFO_HASH: &[u8] = b"info_hash";
const KEY_PORT: &[u8] = b"port";
const KEY_TOKEN: &[u8] = b"token";
const KEY_IMPLIED_PORT: &[u8] = b"implied_port";
const KEY_NODES: &[u8] = b"nodes";
const KEY_VALUES: &[u8] = b"values";

/// KRPC error codes (BEP-5).
pub mod error_code {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::Ping => "ping",
            QueryKind::FindNode => "find_node",
            QueryKind::GetPeers => "get_peers",
            QueryKind::AnnouncePeer => "announce_peer",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(QueryKind::Ping),
            b"find_node" => Some(QueryKind::FindNode),
            b"get_peers" => Some(QueryKind::GetPeers),
            b"announce_peer" => Some(QueryKind::AnnouncePeer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl DhtQuery {
    pub fn kind(&self) -> QueryKind {
        match self {
            DhtQuery::Ping => QueryKind::Ping,
            DhtQuery::FindNode { .. } => QueryKind::FindNode,
            DhtQuery::GetPeers { .. } => QueryKind::GetPeers,
            DhtQuery::AnnouncePeer { .. } => QueryKind::AnnouncePeer,
        }
    }
}

/// Return values of a response before they are matched to a query kind.
///
/// The wire format does not say which query a response answers; the
/// dispatcher types it with [`DhtResponse::from_values`] once the
/// transaction id identifies the pending query.
#[derive(Debug, Clone)]
pub struct ReturnValues {
    pub id: NodeId,
    pub nodes: Option<Vec<Node>>,
    pub values: Option<Vec<SocketAddr>>,
    pub token: Option<Bytes>,
}

impl ReturnValues {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: None,
            values: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DhtResponse {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<Node>,
    },
    GetPeers {
        id: NodeId,
        token: Option<Bytes>,
        peers: Vec<SocketAddr>,
        nodes: Vec<Node>,
    },
    AnnouncePeer {
        id: NodeId,
    },
}

impl DhtResponse {
    pub fn id(&self) -> NodeId {
        match self {
            DhtResponse::Ping { id }
            | DhtResponse::FindNode { id, .. }
            | DhtResponse::GetPeers { id, .. }
            | DhtResponse::AnnouncePeer { id } => *id,
        }
    }

    /// Types raw return values as the answer to a `kind` query.
    pub fn from_values(kind: QueryKind, values: ReturnValues) -> Result<Self, DhtError> {
        let id = values.id;
        match kind {
            QueryKind::Ping => Ok(DhtResponse::Ping { id }),
            QueryKind::AnnouncePeer => Ok(DhtResponse::AnnouncePeer { id }),
            QueryKind::FindNode => {
                let nodes = values
                    .nodes
                    .ok_or_else(|| DhtError::protocol("find_node response without nodes"))?;
                Ok(DhtResponse::FindNode { id, nodes })
            }
            QueryKind::GetPeers => {
                if values.nodes.is_none() && values.values.is_none() {
                    return Err(DhtError::protocol(
                        "get_peers response without values or nodes",
                    ));
                }
                Ok(DhtResponse::GetPeers {
                    id,
                    token: values.token,
                    peers: values.values.unwrap_or_default(),
                    nodes: values.nodes.unwrap_or_default(),
                })
            }
        }
    }

    pub fn into_values(self) -> ReturnValues {
        match self {
            DhtResponse::Ping { id } | DhtResponse::AnnouncePeer { id } => ReturnValues::new(id),
            DhtResponse::FindNode { id, nodes } => ReturnValues {
                nodes: Some(nodes),
                ..ReturnValues::new(id)
            },
            DhtResponse::GetPeers {
                id,
                token,
                peers,
                nodes,
            } => ReturnValues {
                id,
                token,
                values: (!peers.is_empty()).then_some(peers),
                nodes: Some(nodes),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error a querier receives for a message we could not handle.
    pub fn for_error(err: &DhtError) -> Self {
        match err {
            DhtError::MethodUnknown(name) => {
                Self::new(error_code::METHOD_UNKNOWN, format!("method unknown: {}", name))
            }
            DhtError::Protocol(reason) => Self::new(error_code::PROTOCOL, reason.clone()),
            other => Self::new(error_code::SERVER, other.to_string()),
        }
    }
}

/// A KRPC message: a query, a response or an error, correlated by
/// transaction id.
#[derive(Debug, Clone)]
pub enum DhtMessage {
    Query {
        transaction_id: TransactionId,
        sender_id: NodeId,
        query: DhtQuery,
    },
    Response {
        transaction_id: TransactionId,
        values: ReturnValues,
    },
    Error {
        transaction_id: TransactionId,
        error: KrpcError,
    },
}

impl DhtMessage {
    pub fn query(transaction_id: TransactionId, our_id: &NodeId, query: DhtQuery) -> Self {
        DhtMessage::Query {
            transaction_id,
            sender_id: *our_id,
            query,
        }
    }

    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        DhtMessage::Response {
            transaction_id,
            values: response.into_values(),
        }
    }

    pub fn error(transaction_id: TransactionId, error: KrpcError) -> Self {
        DhtMessage::Error {
            transaction_id,
            error,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            DhtMessage::Query { transaction_id, .. }
            | DhtMessage::Response { transaction_id, .. }
            | DhtMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    /// Decodes and validates a datagram.
    ///
    /// Malformed bencode yields [`DhtError::Decode`]; valid bencode that
    /// breaks the message schema yields [`DhtError::Protocol`] or
    /// [`DhtError::MethodUnknown`].
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, DhtError> {
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::protocol("expected dict"))?;

        let transaction_id = dict
            .get(KEY_TRANSACTION)
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::protocol("missing transaction id"))?;

        let msg_type = dict
            .get(KEY_TYPE)
            .and_then(Value::as_bytes)
            .ok_or_else(|| DhtError::protocol("missing message type"))?;

        match msg_type.as_ref() {
            b"q" => Self::parse_query(transaction_id, dict),
            b"r" => Self::parse_response(transaction_id, dict),
            b"e" => Self::parse_error(transaction_id, dict),
            other => Err(DhtError::protocol(format!(
                "unknown message type: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// The transaction id of `value` if it is shaped like a query, so a
    /// rejected query can still be answered with an error.
    pub fn query_transaction_id(value: &Value) -> Option<TransactionId> {
        if value.get(KEY_TYPE)?.as_bytes()?.as_ref() != b"q" {
            return None;
        }
        value.get(KEY_TRANSACTION)?.as_bytes().cloned()
    }

    /// The transaction id of `value` if it is shaped like a response or an
    /// error, so a rejected answer still settles the exchange it belongs to.
    pub fn reply_transaction_id(value: &Value) -> Option<TransactionId> {
        match value.get(KEY_TYPE)?.as_bytes()?.as_ref() {
            b"r" | b"e" => value.get(KEY_TRANSACTION)?.as_bytes().cloned(),
            _ => None,
        }
    }

    fn parse_query(
        transaction_id: TransactionId,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let name = dict
            .get(KEY_QUERY)
            .and_then(Value::as_bytes)
            .ok_or_else(|| DhtError::protocol("missing query name"))?;

        let kind = QueryKind::from_name(name)
            .ok_or_else(|| DhtError::MethodUnknown(String::from_utf8_lossy(name).into_owned()))?;

        let args = dict
            .get(KEY_ARGS)
            .and_then(Value::as_dict)
            .ok_or_else(|| DhtError::protocol("missing query args"))?;

        let sender_id = required_id(args, KEY_ID)?;

        let query = match kind {
            QueryKind::Ping => DhtQuery::Ping,
            QueryKind::FindNode => DhtQuery::FindNode {
                target: required_id(args, KEY_TARGET)?,
            },
            QueryKind::GetPeers => DhtQuery::GetPeers {
                info_hash: required_id(args, KEY_INFO_HASH)?,
            },
            QueryKind::AnnouncePeer => {
                let info_hash = required_id(args, KEY_INFO_HASH)?;

                let port = args
                    .get(KEY_PORT)
                    .and_then(Value::as_integer)
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| DhtError::protocol("missing or invalid port"))?;

                let token = args
                    .get(KEY_TOKEN)
                    .and_then(Value::as_bytes)
                    .cloned()
                    .ok_or_else(|| DhtError::protocol("missing token"))?;

                let implied_port = args
                    .get(KEY_IMPLIED_PORT)
                    .and_then(Value::as_integer)
                    .is_some_and(|v| v == 1);

                DhtQuery::AnnouncePeer {
                    info_hash,
                    port,
                    token,
                    implied_port,
                }
            }
        };

        Ok(DhtMessage::Query {
            transaction_id,
            sender_id,
            query,
        })
    }

    fn parse_response(
        transaction_id: TransactionId,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let ret = dict
            .get(KEY_RETURN)
            .and_then(Value::as_dict)
            .ok_or_else(|| DhtError::protocol("missing response dict"))?;

        let id = required_id(ret, KEY_ID)?;

        let nodes = ret
            .get(KEY_NODES)
            .and_then(Value::as_bytes)
            .map(|data| nodes_from_compact(data));

        let values = ret.get(KEY_VALUES).and_then(Value::as_list).map(|list| {
            list.iter()
                .filter_map(Value::as_bytes)
                .filter_map(|b| peer_from_compact(b))
                .collect()
        });

        let token = ret.get(KEY_TOKEN).and_then(Value::as_bytes).cloned();

        Ok(DhtMessage::Response {
            transaction_id,
            values: ReturnValues {
                id,
                nodes,
                values,
                token,
            },
        })
    }

    fn parse_error(
        transaction_id: TransactionId,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let error = dict
            .get(KEY_ERROR)
            .and_then(Value::as_list)
            .ok_or_else(|| DhtError::protocol("missing error list"))?;

        let code = error
            .first()
            .and_then(Value::as_integer)
            .unwrap_or(error_code::GENERIC);

        let message = error
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();

        Ok(DhtMessage::Error {
            transaction_id,
            error: KrpcError { code, message },
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            DhtMessage::Query {
                transaction_id,
                sender_id,
                query,
            } => {
                let args = DictBuilder::new().insert(KEY_ID, id_value(sender_id));
                let args = match query {
                    DhtQuery::Ping => args,
                    DhtQuery::FindNode { target } => args.insert(KEY_TARGET, id_value(target)),
                    DhtQuery::GetPeers { info_hash } => {
                        args.insert(KEY_INFO_HASH, id_value(info_hash))
                    }
                    DhtQuery::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => args
                        .insert(KEY_INFO_HASH, id_value(info_hash))
                        .insert(KEY_PORT, Value::Integer(i64::from(*port)))
                        .insert(KEY_TOKEN, Value::bytes(token.clone()))
                        .insert_opt(KEY_IMPLIED_PORT, implied_port.then_some(Value::Integer(1))),
                };

                DictBuilder::new()
                    .insert(KEY_TRANSACTION, Value::bytes(transaction_id.clone()))
                    .insert(KEY_TYPE, Value::string("q"))
                    .insert(KEY_QUERY, Value::string(query.kind().name()))
                    .insert(KEY_ARGS, args.build())
                    .build()
            }
            DhtMessage::Response {
                transaction_id,
                values,
            } => {
                let peers = values.values.as_ref().map(|peers| {
                    Value::List(
                        peers
                            .iter()
                            .filter_map(peer_to_compact)
                            .map(|p| Value::bytes(p.to_vec()))
                            .collect(),
                    )
                });

                let ret = DictBuilder::new()
                    .insert(KEY_ID, id_value(&values.id))
                    .insert_opt(
                        KEY_NODES,
                        values.nodes.as_deref().map(|n| Value::bytes(nodes_to_compact(n))),
                    )
                    .insert_opt(KEY_VALUES, peers)
                    .insert_opt(KEY_TOKEN, values.token.clone().map(Value::bytes));

                DictBuilder::new()
                    .insert(KEY_TRANSACTION, Value::bytes(transaction_id.clone()))
                    .insert(KEY_TYPE, Value::string("r"))
                    .insert(KEY_RETURN, ret.build())
                    .build()
            }
            DhtMessage::Error {
                transaction_id,
                error,
            } => DictBuilder::new()
                .insert(KEY_TRANSACTION, Value::bytes(transaction_id.clone()))
                .insert(KEY_TYPE, Value::string("e"))
                .insert(
                    KEY_ERROR,
                    Value::List(vec![
                        Value::Integer(error.code),
                        Value::string(&error.message),
                    ]),
                )
                .build(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.to_value())
    }
}

fn id_value(id: &NodeId) -> Value {
    Value::bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn required_id(dict: &BTreeMap<Bytes, Value>, key: &[u8]) -> Result<NodeId, DhtError> {
    let bytes = dict.get(key).and_then(Value::as_bytes).ok_or_else(|| {
        DhtError::protocol(format!("missing {}", String::from_utf8_lossy(key)))
    })?;
    NodeId::from_bytes(bytes)
        .map_err(|_| DhtError::protocol(format!("invalid {}", String::from_utf8_lossy(key))))
}
