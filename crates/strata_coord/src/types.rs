//! Identifier and completion-status types shared by the epoch store and
//! the health monitor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Node identifier within the cluster.
pub type NodeId = u64;

/// Opaque 64-bit log identifier.
///
/// Data logs occupy `1..=LogId::MAX`. Every data log has a companion
/// metadata log whose id is the data-log id with [`LogId::METADATA_FLAG`]
/// set; the per-log node subtree always lives under the data-log id, and
/// the flag only selects which last-clean-epoch node a request addresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl LogId {
    pub const INVALID: LogId = LogId(0);
    /// Highest id usable for a data log.
    pub const MAX: LogId = LogId((1u64 << 62) - 1);
    /// Bit marking the metadata log of a data log.
    pub const METADATA_FLAG: u64 = 1u64 << 62;

    /// Id of the metadata log paired with `data_log`.
    pub fn metadata_log(data_log: LogId) -> LogId {
        LogId(data_log.0 | Self::METADATA_FLAG)
    }

    pub fn is_metadata_log(self) -> bool {
        self.0 & Self::METADATA_FLAG != 0
    }

    /// The data-log id with the metadata flag stripped.
    pub fn data_log_id(self) -> LogId {
        LogId(self.0 & !Self::METADATA_FLAG)
    }

    /// A log id is addressable when its data-log part is in `1..=MAX`.
    pub fn is_valid(self) -> bool {
        let data = self.data_log_id();
        data != Self::INVALID && data <= Self::MAX
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.0)
    }
}

/// Monotonically assigned version of a log's writer identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u32);

impl Epoch {
    pub const INVALID: Epoch = Epoch(0);

    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Tail record accompanying a last-clean-epoch commit: the highest record
/// known released at the time the epoch was cleaned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailRecord {
    pub log_id: LogId,
    pub lsn: u64,
    pub timestamp_ms: u64,
    pub flags: u32,
}

impl TailRecord {
    /// Flag marking a byte offset that is only meaningful within one
    /// epoch. Such records must be resolved to a global offset before
    /// they are durable enough to accompany an LCE commit.
    pub const OFFSET_WITHIN_EPOCH: u32 = 1 << 0;

    pub fn empty(log_id: LogId) -> TailRecord {
        TailRecord {
            log_id,
            lsn: 0,
            timestamp_ms: 0,
            flags: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.log_id != LogId::INVALID
    }

    pub fn contains_offset_within_epoch(&self) -> bool {
        self.flags & Self::OFFSET_WITHIN_EPOCH != 0
    }
}

/// Completion status delivered to epoch-store callers.
///
/// This is data handed to completion callbacks, not an error type to
/// propagate with `?`; requests always complete with exactly one of
/// these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    NotFound,
    Exists,
    /// Optimistic write lost a version race; safe to re-drive.
    Again,
    UpToDate,
    Stale,
    InvalidParam,
    Aborted,
    BadMsg,
    Empty,
    Disabled,
    TooBig,
    Failed,
    Internal,
    NotConn,
    Access,
    Shutdown,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "NOTFOUND",
            Status::Exists => "EXISTS",
            Status::Again => "AGAIN",
            Status::UpToDate => "UPTODATE",
            Status::Stale => "STALE",
            Status::InvalidParam => "INVALID_PARAM",
            Status::Aborted => "ABORTED",
            Status::BadMsg => "BADMSG",
            Status::Empty => "EMPTY",
            Status::Disabled => "DISABLED",
            Status::TooBig => "TOOBIG",
            Status::Failed => "FAILED",
            Status::Internal => "INTERNAL",
            Status::NotConn => "NOTCONN",
            Status::Access => "ACCESS",
            Status::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
