//! Abstraction over the ZooKeeper-style coordination service consumed by
//! the epoch store.
//!
//! The epoch store never talks to a concrete client library; the embedder
//! supplies an implementation of [`ZkClient`] plus a [`ZkClientFactory`]
//! used to rebuild the session when the configured quorum changes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::Status;

/// Upper bound on cluster names embedded in node paths.
pub const MAX_CLUSTER_NAME: usize = 255;

/// Connection configuration for the coordination service, delivered
/// through a live `tokio::sync::watch` channel so quorum changes can be
/// picked up without restarting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkConfig {
    /// Comma-separated `host:port` endpoints forming the session quorum.
    pub quorum: String,
    pub session_timeout_ms: u64,
}

impl Default for ZkConfig {
    fn default() -> Self {
        ZkConfig {
            quorum: String::new(),
            session_timeout_ms: 10_000,
        }
    }
}

/// Session state as reported by the client library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Expired,
    AuthFailed,
}

/// Per-node metadata returned with reads and conditional writes. The
/// service bumps `version` atomically on every write to the node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
}

/// One create operation inside an atomic multi-op batch.
#[derive(Clone, Debug)]
pub struct CreateOp {
    pub path: String,
    pub value: Bytes,
}

impl CreateOp {
    pub fn new(path: impl Into<String>, value: Bytes) -> CreateOp {
        CreateOp {
            path: path.into(),
            value,
        }
    }
}

/// Return codes surfaced by the client library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZkError {
    /// Malformed request; indicates a bug in the caller.
    BadArguments,
    /// The session handle is unusable; the current session state says why.
    InvalidState,
    /// The service detected an internal inconsistency.
    RuntimeInconsistency,
    /// Conditional write observed a different node version.
    VersionMismatch,
    NoNode,
    NodeExists,
    NoAuth,
    ConnectionLoss,
    SessionExpired,
    /// The client is being torn down.
    Shutdown,
    Unknown(i32),
}

impl ZkError {
    /// The client library's own status mapping, used for every code the
    /// epoch store does not handle specially.
    pub fn base_status(self) -> Status {
        match self {
            ZkError::NoNode => Status::NotFound,
            ZkError::NodeExists => Status::Exists,
            ZkError::VersionMismatch => Status::Again,
            ZkError::NoAuth => Status::Access,
            ZkError::ConnectionLoss => Status::NotConn,
            ZkError::SessionExpired => Status::NotConn,
            ZkError::Shutdown => Status::Shutdown,
            ZkError::BadArguments => Status::Internal,
            ZkError::InvalidState
            | ZkError::RuntimeInconsistency
            | ZkError::Unknown(_) => Status::Failed,
        }
    }
}

impl fmt::Display for ZkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZkError::BadArguments => f.write_str("bad arguments"),
            ZkError::InvalidState => f.write_str("invalid session state"),
            ZkError::RuntimeInconsistency => f.write_str("runtime inconsistency"),
            ZkError::VersionMismatch => f.write_str("version mismatch"),
            ZkError::NoNode => f.write_str("no node"),
            ZkError::NodeExists => f.write_str("node exists"),
            ZkError::NoAuth => f.write_str("not authorized"),
            ZkError::ConnectionLoss => f.write_str("connection loss"),
            ZkError::SessionExpired => f.write_str("session expired"),
            ZkError::Shutdown => f.write_str("client shutting down"),
            ZkError::Unknown(code) => write!(f, "unknown return code {code}"),
        }
    }
}

pub type ZkResult<T> = Result<T, ZkError>;

/// Client interface to the coordination service.
///
/// All data operations are non-blocking issues whose completion is the
/// returned future; the epoch store never holds a thread across them.
/// `multi_op` commits all-or-nothing: on `Ok` every sub-operation
/// committed and its per-op result is reported, on `Err` none did.
#[async_trait]
pub trait ZkClient: Send + Sync {
    async fn get_data(&self, path: &str) -> ZkResult<(Bytes, Stat)>;

    /// Conditional write: succeeds only while the node's version still
    /// equals `expected_version`.
    async fn set_data(&self, path: &str, value: Bytes, expected_version: i32) -> ZkResult<Stat>;

    async fn multi_op(&self, ops: Vec<CreateOp>) -> ZkResult<Vec<ZkResult<()>>>;

    /// Current session state. Reflects the state *now*, which is not
    /// necessarily the state at the time an earlier error was produced.
    fn session_state(&self) -> SessionState;

    /// The quorum string this client was built against.
    fn quorum(&self) -> String;
}

/// Builds a client for the given configuration. Returning an error keeps
/// the previously installed client in place.
pub type ZkClientFactory =
    Arc<dyn Fn(&ZkConfig) -> anyhow::Result<Arc<dyn ZkClient>> + Send + Sync>;
