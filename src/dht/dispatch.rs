use super::engine::Core;
use super::error::DhtError;
use super::main_loop::TimeoutHandle;
use super::message::{
    error_code, DhtMessage, DhtQuery, DhtResponse, KrpcError, QueryKind, ReturnValues,
    TransactionId,
};
use super::node::NodeId;
use crate::bencode::decode;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub(crate) type QueryResult = Result<DhtResponse, DhtError>;

/// An exchange in the `Sent` state.
pub(crate) struct PendingQuery {
    node_id: Option<NodeId>,
    addr: SocketAddr,
    kind: QueryKind,
    responder: oneshot::Sender<QueryResult>,
    timer: TimeoutHandle,
}

impl PendingQuery {
    fn complete(self, result: QueryResult) {
        self.timer.cancel();
        let _ = self.responder.send(result);
    }
}

/// Outstanding exchanges keyed by transaction id.
pub struct MessageDispatch {
    pending: HashMap<TransactionId, PendingQuery>,
    next_tid: u16,
    max_pending: usize,
}

impl MessageDispatch {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            next_tid: rand::random(),
            max_pending: max_pending.clamp(1, u16::MAX as usize),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Next free 2-byte transaction id. The pending cap stays below the id
    /// space, so a free id always exists once the cap check passes.
    fn allocate_tid(&mut self) -> Result<TransactionId, DhtError> {
        if self.pending.len() >= self.max_pending {
            return Err(DhtError::RateLimited);
        }
        loop {
            let tid = Bytes::copy_from_slice(&self.next_tid.to_be_bytes());
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.pending.contains_key(&tid) {
                return Ok(tid);
            }
        }
    }

    /// Removes the exchange `tid` if it was sent to `from`.
    fn take_matching(&mut self, tid: &TransactionId, from: SocketAddr) -> Option<PendingQuery> {
        match self.pending.get(tid) {
            Some(pending) if pending.addr == from => self.pending.remove(tid),
            _ => None,
        }
    }

    /// Fails every outstanding exchange with `error`.
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> DhtError) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        for (_, pending) in self.pending.drain() {
            nodes.extend(pending.node_id);
            pending.complete(Err(error()));
        }
        nodes
    }
}

/// Sends `query` to `addr` and registers the exchange. Runs on the worker.
///
/// The receiver resolves with the typed response, the remote error, or
/// [`DhtError::Timeout`] once `query_timeout` passes without a match.
pub(crate) fn send_query(
    core: &Arc<Core>,
    node_id: Option<NodeId>,
    addr: SocketAddr,
    query: DhtQuery,
) -> Result<oneshot::Receiver<QueryResult>, DhtError> {
    let (responder, rx) = oneshot::channel();
    let kind = query.kind();

    let (tid, data) = core.with_state(|state| -> Result<_, DhtError> {
        let tid = state.dispatch.allocate_tid()?;
        let data = DhtMessage::query(tid.clone(), &core.local_id, query).encode();

        let weak = Arc::downgrade(core);
        let expired = tid.clone();
        let timer = core
            .main_loop
            .queue_timeout(core.config.query_timeout, move || {
                if let Some(core) = weak.upgrade() {
                    expire(&core, &expired);
                }
                false
            });

        state.dispatch.pending.insert(
            tid.clone(),
            PendingQuery {
                node_id,
                addr,
                kind,
                responder,
                timer,
            },
        );
        if let Some(id) = &node_id {
            state.table.query_started(id);
        }
        trace!(
            "sending {} to {} (tid {:?}, {} pending)",
            kind.name(),
            addr,
            &tid[..],
            state.dispatch.pending_count()
        );
        Ok((tid, data))
    })?;

    if let Err(e) = core.listener.send(&data, addr) {
        debug!("failed to send {} to {}: {}", kind.name(), addr, e);
        let pending = core.with_state(|state| {
            let pending = state.dispatch.pending.remove(&tid)?;
            if let Some(id) = &pending.node_id {
                state.table.query_finished(id);
            }
            Some(pending)
        });
        if let Some(pending) = pending {
            pending.timer.cancel();
        }
        return Err(e);
    }

    Ok(rx)
}

fn expire(core: &Arc<Core>, tid: &TransactionId) {
    let pending = core.with_state(|state| {
        let pending = state.dispatch.pending.remove(tid)?;
        if let Some(id) = &pending.node_id {
            state.table.query_finished(id);
        }
        Some(pending)
    });

    if let Some(pending) = pending {
        trace!("{} to {} timed out", pending.kind.name(), pending.addr);
        let _ = pending.responder.send(Err(DhtError::Timeout));
    }
}

/// Entry point for every inbound datagram. Runs on the worker.
pub(crate) fn handle_datagram(core: &Arc<Core>, data: &[u8], from: SocketAddr) {
    let value = match decode(data) {
        Ok(value) => value,
        Err(e) => {
            debug!("dropping undecodable datagram from {}: {}", from, e);
            return;
        }
    };

    match DhtMessage::from_value(&value) {
        Ok(DhtMessage::Query {
            transaction_id,
            sender_id,
            query,
        }) => handle_query(core, transaction_id, sender_id, query, from),
        Ok(DhtMessage::Response {
            transaction_id,
            values,
        }) => handle_response(core, transaction_id, values, from),
        Ok(DhtMessage::Error {
            transaction_id,
            error,
        }) => handle_error(core, transaction_id, error, from),
        Err(e) => {
            debug!("malformed message from {}: {}", from, e);
            if let Some(tid) = DhtMessage::query_transaction_id(&value) {
                reply(core, DhtMessage::error(tid, KrpcError::for_error(&e)), from);
            } else if let Some(tid) = DhtMessage::reply_transaction_id(&value) {
                match take_finished(core, &tid, from) {
                    Some(pending) => pending.complete(Err(e)),
                    None => trace!("discarding unmatched malformed answer from {}", from),
                }
            }
        }
    }
}

fn handle_query(
    core: &Arc<Core>,
    tid: TransactionId,
    sender_id: NodeId,
    query: DhtQuery,
    from: SocketAddr,
) {
    let id = core.local_id;
    let k = core.config.bucket_size;

    let answer = core.with_state(|state| {
        state.table.heard_from(sender_id, from);

        match query {
            DhtQuery::Ping => Ok(DhtResponse::Ping { id }),
            DhtQuery::FindNode { target } => {
                let nodes = match state.table.get(&target) {
                    Some(exact) => vec![exact.clone()],
                    None => state.table.closest(&target, k),
                };
                Ok(DhtResponse::FindNode { id, nodes })
            }
            DhtQuery::GetPeers { info_hash } => Ok(DhtResponse::GetPeers {
                id,
                token: Some(state.tokens.generate(&from)),
                peers: state.peers.get(&info_hash),
                nodes: state.table.closest(&info_hash, k),
            }),
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !state.tokens.validate(&from, &token) {
                    return Err(KrpcError::new(error_code::PROTOCOL, "Invalid token"));
                }
                let port = if implied_port { from.port() } else { port };
                let peer = SocketAddr::new(from.ip(), port);
                state.peers.add(info_hash, peer);
                debug!("stored announced peer {} for {}", peer, info_hash);
                Ok(DhtResponse::AnnouncePeer { id })
            }
        }
    });

    let message = match answer {
        Ok(response) => DhtMessage::response(tid, response),
        Err(error) => {
            debug!("rejecting query from {}: {}", from, error.message);
            DhtMessage::error(tid, error)
        }
    };
    reply(core, message, from);
}

/// Takes the exchange `tid` sent to `from` out of the pending table and
/// releases its node.
fn take_finished(core: &Arc<Core>, tid: &TransactionId, from: SocketAddr) -> Option<PendingQuery> {
    core.with_state(|state| {
        let pending = state.dispatch.take_matching(tid, from)?;
        if let Some(id) = &pending.node_id {
            state.table.query_finished(id);
        }
        Some(pending)
    })
}

fn handle_response(core: &Arc<Core>, tid: TransactionId, values: ReturnValues, from: SocketAddr) {
    let Some(pending) = take_finished(core, &tid, from) else {
        trace!("discarding unmatched response from {}", from);
        return;
    };

    let result = DhtResponse::from_values(pending.kind, values);
    if let Ok(response) = &result {
        core.with_state(|state| {
            state.table.responded(response.id(), from);
        });
    }

    if let Err(e) = &result {
        debug!("bad {} response from {}: {}", pending.kind.name(), from, e);
    }
    pending.complete(result);
}

fn handle_error(core: &Arc<Core>, tid: TransactionId, error: KrpcError, from: SocketAddr) {
    let Some(pending) = take_finished(core, &tid, from) else {
        trace!("discarding unmatched error from {}", from);
        return;
    };

    debug!(
        "{} to {} failed with {}: {}",
        pending.kind.name(),
        from,
        error.code,
        error.message
    );
    pending.complete(Err(DhtError::Remote {
        code: error.code,
        message: error.message,
    }));
}

fn reply(core: &Arc<Core>, message: DhtMessage, to: SocketAddr) {
    if let Err(e) = core.listener.send(&message.encode(), to) {
        warn!("failed to reply to {}: {}", to, e);
    }
}
