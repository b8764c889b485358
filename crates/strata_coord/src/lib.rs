//! Coordination cores for the strata distributed append-only log.
//!
//! Two subsystems live here:
//!
//! - [`epoch_store`]: the per-log epoch metadata coordinator. It runs
//!   optimistic read-modify-write cycles against a ZooKeeper-style
//!   coordination service (consumed through the [`zk::ZkClient`] trait),
//!   provisions per-log node subtrees on first use, and rebinds its
//!   client when the configured quorum changes.
//! - [`health_monitor`]: the node health monitor. A single background
//!   task classifies the node as healthy, overloaded, or unhealthy from
//!   sliding windows of per-worker stall reports, damped by a
//!   hysteresis timer.

pub mod epoch_store;
pub mod health_monitor;
pub mod requests;
pub mod state_timer;
pub mod stats;
pub mod timeseries;
pub mod types;
pub mod zk;

pub use epoch_store::{EpochStore, EpochStoreSettings, NODE_VALUE_WRITE_LIMIT};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig, NodeState, StallInfo};
pub use requests::{
    EpochStoreRequest, LceCodec, LceCompletion, MetaDataCompletion, MetaDataUpdater, NextStep,
    RequestKind, UpdateDecision, WriteNodeId, EPOCH_METADATA_NODE, LCE_DATA_LOG_NODE,
    LCE_METADATA_LOG_NODE,
};
pub use state_timer::StateTimer;
pub use stats::{CoordStats, CoordStatsSnapshot};
pub use timeseries::BucketedTimeSeries;
pub use types::{Epoch, LogId, NodeId, Status, TailRecord};
pub use zk::{
    CreateOp, SessionState, Stat, ZkClient, ZkClientFactory, ZkConfig, ZkError, ZkResult,
    MAX_CLUSTER_NAME,
};
