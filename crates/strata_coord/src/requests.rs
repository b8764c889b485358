//! Request protocol for the epoch store.
//!
//! Each request kind supplies its node path, parses the current node
//! value, decides the next step of the read-modify-write cycle, and
//! composes the replacement value. The engine in [`crate::epoch_store`]
//! owns the request for the duration of the cycle and posts its
//! completion exactly once.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::types::{Epoch, LogId, NodeId, Status, TailRecord};

/// Name of the epoch-metadata node under a log's subtree.
pub const EPOCH_METADATA_NODE: &str = "epoch_metadata";
/// Name of the data-log last-clean-epoch node.
pub const LCE_DATA_LOG_NODE: &str = "lce_data_log";
/// Name of the metadata-log last-clean-epoch node.
pub const LCE_METADATA_LOG_NODE: &str = "lce_metadata_log";

/// What the engine should do after a request has seen the current node
/// value.
#[derive(Debug)]
pub enum NextStep {
    /// The node is absent; create the log's subtree.
    Provision,
    /// Write the composed value conditionally on the observed version.
    Modify,
    /// Already satisfied; complete with the given status.
    Stop(Status),
    /// Cannot proceed; complete with the given status.
    Failed(Status),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    GetLastCleanEpoch,
    SetLastCleanEpoch,
    EpochMetadata,
}

/// Contract between the epoch store engine and one request kind.
pub trait EpochStoreRequest: Send {
    fn kind(&self) -> RequestKind;

    fn log_id(&self) -> LogId;

    /// Path of the node this request reads and conditionally writes.
    /// `log_root` is `<root_path>/<data_log_id>`.
    fn znode_path(&self, log_root: &str) -> String;

    /// Inspect the current node value (`None` when the node is absent)
    /// and decide the next step.
    fn on_value(&mut self, value: Option<&[u8]>) -> NextStep;

    /// Compose the value to write. The engine bounds-checks the result.
    fn compose_value(&self, out: &mut Vec<u8>) -> Result<(), Status>;

    /// Deliver the final status to the caller. Called at most once.
    fn post_completion(self: Box<Self>, status: Status);

    /// Shared flag observed to suppress completions while the owning
    /// store is tearing down. Deliberately not a reference to the store
    /// itself so outstanding requests cannot keep it alive.
    fn shutdown_observer(&self) -> &Arc<AtomicBool>;
}

/// Caller-supplied codec for last-clean-epoch node payloads. The epoch
/// store treats the payload as opaque bytes.
pub trait LceCodec: Send + Sync {
    /// Decode an LCE payload. An empty payload must decode to
    /// `(Epoch::INVALID, None)`: freshly provisioned LCE nodes are
    /// created empty.
    fn decode(&self, raw: &[u8]) -> Result<(Epoch, Option<TailRecord>), Status>;

    fn encode(&self, epoch: Epoch, tail: &TailRecord, out: &mut Vec<u8>) -> Result<(), Status>;
}

/// Sequencer-identity policy for a metadata update, forwarded to the
/// updater verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteNodeId {
    /// Keep whatever node id the stored metadata carries.
    KeepLast,
    /// Stamp the metadata with this node id.
    Set(NodeId),
    /// Drop the stored node id.
    Clear,
}

/// Outcome of a caller-supplied metadata updater.
#[derive(Debug)]
pub enum UpdateDecision {
    /// No metadata exists yet; `out` holds the initial value to provision.
    Provision,
    /// `out` holds the replacement value to write.
    Modify,
    /// The stored metadata is already current.
    UpToDate,
    Failed(Status),
}

/// Caller-supplied read/compose/decision hook driving
/// `create_or_update_metadata`.
pub trait MetaDataUpdater: Send + Sync {
    fn update(
        &self,
        log_id: LogId,
        current: Option<&[u8]>,
        write_node_id: WriteNodeId,
        out: &mut Vec<u8>,
    ) -> UpdateDecision;
}

pub type LceCompletion = Box<dyn FnOnce(Status, LogId, Epoch, Option<TailRecord>) + Send>;
pub type MetaDataCompletion = Box<dyn FnOnce(Status, LogId, Option<Bytes>) + Send>;

/// Picks the LCE node name for a log: metadata logs track their clean
/// epoch separately from the data log they describe.
fn lce_node_name(log_id: LogId) -> &'static str {
    if log_id.is_metadata_log() {
        LCE_METADATA_LOG_NODE
    } else {
        LCE_DATA_LOG_NODE
    }
}

pub(crate) struct GetLastCleanEpochRequest {
    log_id: LogId,
    codec: Arc<dyn LceCodec>,
    epoch: Epoch,
    tail: Option<TailRecord>,
    completion: Option<LceCompletion>,
    shutdown: Arc<AtomicBool>,
}

impl GetLastCleanEpochRequest {
    pub(crate) fn new(
        log_id: LogId,
        codec: Arc<dyn LceCodec>,
        completion: LceCompletion,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        GetLastCleanEpochRequest {
            log_id,
            codec,
            epoch: Epoch::INVALID,
            tail: None,
            completion: Some(completion),
            shutdown,
        }
    }
}

impl EpochStoreRequest for GetLastCleanEpochRequest {
    fn kind(&self) -> RequestKind {
        RequestKind::GetLastCleanEpoch
    }

    fn log_id(&self) -> LogId {
        self.log_id
    }

    fn znode_path(&self, log_root: &str) -> String {
        format!("{log_root}/{}", lce_node_name(self.log_id))
    }

    fn on_value(&mut self, value: Option<&[u8]>) -> NextStep {
        let Some(raw) = value else {
            return NextStep::Failed(Status::NotFound);
        };
        match self.codec.decode(raw) {
            Ok((epoch, tail)) => {
                self.epoch = epoch;
                self.tail = tail;
                NextStep::Stop(Status::Ok)
            }
            Err(st) => {
                warn!(log_id = %self.log_id, status = %st, "failed to decode stored LCE value");
                NextStep::Failed(st)
            }
        }
    }

    fn compose_value(&self, _out: &mut Vec<u8>) -> Result<(), Status> {
        // Reads never reach the write path.
        debug_assert!(false, "get-LCE request asked to compose a value");
        Err(Status::Internal)
    }

    fn post_completion(mut self: Box<Self>, status: Status) {
        if let Some(cf) = self.completion.take() {
            cf(status, self.log_id, self.epoch, self.tail);
        }
    }

    fn shutdown_observer(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }
}

pub(crate) struct SetLastCleanEpochRequest {
    log_id: LogId,
    new_epoch: Epoch,
    new_tail: TailRecord,
    codec: Arc<dyn LceCodec>,
    // Stored values reported back on a STALE completion.
    stored_epoch: Option<Epoch>,
    stored_tail: Option<TailRecord>,
    completion: Option<LceCompletion>,
    shutdown: Arc<AtomicBool>,
}

impl SetLastCleanEpochRequest {
    pub(crate) fn new(
        log_id: LogId,
        epoch: Epoch,
        tail: TailRecord,
        codec: Arc<dyn LceCodec>,
        completion: LceCompletion,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        SetLastCleanEpochRequest {
            log_id,
            new_epoch: epoch,
            new_tail: tail,
            codec,
            stored_epoch: None,
            stored_tail: None,
            completion: Some(completion),
            shutdown,
        }
    }
}

impl EpochStoreRequest for SetLastCleanEpochRequest {
    fn kind(&self) -> RequestKind {
        RequestKind::SetLastCleanEpoch
    }

    fn log_id(&self) -> LogId {
        self.log_id
    }

    fn znode_path(&self, log_root: &str) -> String {
        format!("{log_root}/{}", lce_node_name(self.log_id))
    }

    fn on_value(&mut self, value: Option<&[u8]>) -> NextStep {
        let Some(raw) = value else {
            // LCE nodes are provisioned together with the epoch-metadata
            // node; a missing node means the log was never provisioned.
            return NextStep::Failed(Status::NotFound);
        };
        let (stored_epoch, stored_tail) = match self.codec.decode(raw) {
            Ok(parsed) => parsed,
            Err(st) => {
                warn!(log_id = %self.log_id, status = %st, "failed to decode stored LCE value");
                return NextStep::Failed(st);
            }
        };
        if stored_epoch >= self.new_epoch {
            self.stored_epoch = Some(stored_epoch);
            self.stored_tail = stored_tail;
            return NextStep::Failed(Status::Stale);
        }
        NextStep::Modify
    }

    fn compose_value(&self, out: &mut Vec<u8>) -> Result<(), Status> {
        self.codec.encode(self.new_epoch, &self.new_tail, out)
    }

    fn post_completion(mut self: Box<Self>, status: Status) {
        if let Some(cf) = self.completion.take() {
            // On STALE the caller learns the (higher) stored LCE.
            let epoch = self.stored_epoch.unwrap_or(self.new_epoch);
            let tail = match self.stored_epoch {
                Some(_) => self.stored_tail,
                None => Some(self.new_tail),
            };
            cf(status, self.log_id, epoch, tail);
        }
    }

    fn shutdown_observer(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }
}

pub(crate) struct EpochMetadataRequest {
    log_id: LogId,
    updater: Arc<dyn MetaDataUpdater>,
    write_node_id: WriteNodeId,
    composed: Vec<u8>,
    completion: Option<MetaDataCompletion>,
    shutdown: Arc<AtomicBool>,
}

impl EpochMetadataRequest {
    pub(crate) fn new(
        log_id: LogId,
        updater: Arc<dyn MetaDataUpdater>,
        write_node_id: WriteNodeId,
        completion: MetaDataCompletion,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        EpochMetadataRequest {
            log_id,
            updater,
            write_node_id,
            composed: Vec::new(),
            completion: Some(completion),
            shutdown,
        }
    }
}

impl EpochStoreRequest for EpochMetadataRequest {
    fn kind(&self) -> RequestKind {
        RequestKind::EpochMetadata
    }

    fn log_id(&self) -> LogId {
        self.log_id
    }

    fn znode_path(&self, log_root: &str) -> String {
        format!("{log_root}/{EPOCH_METADATA_NODE}")
    }

    fn on_value(&mut self, value: Option<&[u8]>) -> NextStep {
        self.composed.clear();
        match self
            .updater
            .update(self.log_id, value, self.write_node_id, &mut self.composed)
        {
            UpdateDecision::Provision => {
                debug_assert!(
                    value.is_none(),
                    "updater asked to provision over existing metadata"
                );
                NextStep::Provision
            }
            UpdateDecision::Modify => NextStep::Modify,
            UpdateDecision::UpToDate => NextStep::Stop(Status::UpToDate),
            UpdateDecision::Failed(st) => NextStep::Failed(st),
        }
    }

    fn compose_value(&self, out: &mut Vec<u8>) -> Result<(), Status> {
        out.extend_from_slice(&self.composed);
        Ok(())
    }

    fn post_completion(mut self: Box<Self>, status: Status) {
        if let Some(cf) = self.completion.take() {
            let value = if self.composed.is_empty() {
                None
            } else {
                Some(Bytes::from(self.composed))
            };
            cf(status, self.log_id, value);
        }
    }

    fn shutdown_observer(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }
}
