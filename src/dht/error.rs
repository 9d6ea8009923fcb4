use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] crate::bencode::BencodeError),

    /// A well-formed message that breaks the KRPC schema.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("method unknown: {0}")]
    MethodUnknown(String),

    /// The remote node answered with a KRPC error message.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("timeout")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    /// A lookup, announce or bootstrap could not reach any further node.
    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("engine is shut down")]
    Shutdown,

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl DhtError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        DhtError::Protocol(reason.into())
    }
}
