use crate::object::{NodeId, ObjectId};

use thiserror::Error;

use std::io;

/// Failure taxonomy of the distributed layer. What the router retries
/// and what it surfaces hangs off these variants, so callers match on
/// them rather than on strings.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("object {0} is not running here")]
    NotRunningHere(ObjectId),
    #[error("object {id} is owned by {owner}")]
    WrongOwner { id: ObjectId, owner: NodeId },
    #[error("object {0} is not registered")]
    ObjectNotRegistered(ObjectId),
    #[error("object {0} still has children")]
    ObjectStillHasChildren(ObjectId),
    #[error("request to remote node timed out")]
    RequestTimeout,
    #[error("remote node reported a timeout")]
    RemoteTimeout,
    #[error("timeout syncing to the backend")]
    SyncTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("cluster node {0} is not offline")]
    NodeNotOffline(NodeId),
    #[error("cluster node {0} is not online")]
    NodeNotOnline(NodeId),
    #[error("cannot set self offline")]
    CannotSetSelfOffline,
    #[error("cache error: {source}")]
    Cache {
        #[from]
        source: volgrid::CacheError,
    },
    #[error("backend error: {source}")]
    Backend {
        #[from]
        source: volgrid::backend::BackendError,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("{source}")]
    Other {
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    /// Retryable at the local level (engine retry loop).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Cache { source } => source.is_transient(),
            _ => false,
        }
    }

    /// Ownership-related: the router re-reads the registration and
    /// tries again.
    pub(crate) fn is_ownership_related(&self) -> bool {
        matches!(self, Error::NotRunningHere(_) | Error::WrongOwner { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
