//! Per-log epoch metadata store backed by the coordination service.
//!
//! Serializes concurrent metadata updates (epoch assignment,
//! last-clean-epoch commits, sequencer identity) with optimistic
//! concurrency: every cycle reads the node, decides, and conditionally
//! writes on the version observed by the read. Missing per-log subtrees
//! are provisioned
//! lazily with a single atomic multi-create, and missing ancestors of the
//! root path are created one at a time when `create_root_nodes` allows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::requests::{
    EpochMetadataRequest, EpochStoreRequest, GetLastCleanEpochRequest, LceCodec, LceCompletion,
    MetaDataCompletion, MetaDataUpdater, NextStep, RequestKind, SetLastCleanEpochRequest,
    WriteNodeId, EPOCH_METADATA_NODE, LCE_DATA_LOG_NODE, LCE_METADATA_LOG_NODE,
};
use crate::stats::CoordStats;
use crate::types::{Epoch, LogId, Status, TailRecord};
use crate::zk::{
    CreateOp, SessionState, Stat, ZkClient, ZkClientFactory, ZkConfig, ZkError, MAX_CLUSTER_NAME,
};

/// Upper bound on a composed node value accepted for writing.
pub const NODE_VALUE_WRITE_LIMIT: usize = 8 * 1024;

/// Static knobs for the epoch store.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EpochStoreSettings {
    /// When the root path's ancestors are missing, create them instead of
    /// failing the request. Disable in deployments where the node
    /// hierarchy is pre-created by tooling with tighter ACLs.
    pub create_root_nodes: bool,
}

impl Default for EpochStoreSettings {
    fn default() -> Self {
        EpochStoreSettings {
            create_root_nodes: true,
        }
    }
}

/// Epoch metadata coordinator for one cluster.
///
/// Cheap to share as `Arc<EpochStore>`; all entry points submit work to
/// the runtime and deliver results through the request's completion
/// callback, never blocking the caller.
pub struct EpochStore {
    cluster_name: String,
    root_path: String,
    settings: EpochStoreSettings,
    client: RwLock<Arc<dyn ZkClient>>,
    factory: ZkClientFactory,
    shutting_down: Arc<AtomicBool>,
    stats: Arc<CoordStats>,
}

impl EpochStore {
    /// Build the store, construct the initial client from the current
    /// configuration, and subscribe to configuration updates so quorum
    /// changes rebind the session. Must be called within a tokio
    /// runtime: the configuration watcher is spawned here.
    pub fn new(
        cluster_name: impl Into<String>,
        root_path: impl Into<String>,
        config: watch::Receiver<ZkConfig>,
        settings: EpochStoreSettings,
        factory: ZkClientFactory,
        stats: Arc<CoordStats>,
    ) -> anyhow::Result<Arc<EpochStore>> {
        let cluster_name = cluster_name.into();
        let root_path = root_path.into();
        anyhow::ensure!(
            !cluster_name.is_empty() && cluster_name.len() < MAX_CLUSTER_NAME,
            "invalid cluster name {cluster_name:?}"
        );
        anyhow::ensure!(
            root_path.len() > 1 && root_path.starts_with('/') && !root_path.ends_with('/'),
            "root path must be absolute without a trailing slash, got {root_path:?}"
        );

        let initial = factory(&config.borrow())
            .map_err(|err| anyhow::anyhow!("construct coordination client: {err}"))?;

        let store = Arc::new(EpochStore {
            cluster_name,
            root_path,
            settings,
            client: RwLock::new(initial),
            factory,
            shutting_down: Arc::new(AtomicBool::new(false)),
            stats,
        });

        store.spawn_config_watcher(config);
        Ok(store)
    }

    /// Begin tearing the store down. In-flight requests whose client
    /// reports `Shutdown` after this point complete silently: their
    /// callers are presumed gone. Dropping the last handle has the same
    /// effect.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// `"zookeeper://<quorum><root_path>"`, for diagnostics.
    pub fn identify(&self) -> String {
        format!("zookeeper://{}{}", self.client().quorum(), self.root_path)
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Path of the subtree holding all metadata nodes for `log_id`.
    pub fn znode_path_for_log(&self, log_id: LogId) -> String {
        debug_assert!(log_id.is_valid());
        format!("{}/{}", self.root_path, log_id.data_log_id())
    }

    /// Read the last clean epoch of `log_id` (the data log's or, for a
    /// metadata-log id, its companion's). Completes with `Ok` and the
    /// decoded `(epoch, tail)`, or `NotFound` when the log was never
    /// provisioned.
    pub fn get_last_clean_epoch(
        self: &Arc<Self>,
        log_id: LogId,
        codec: Arc<dyn LceCodec>,
        completion: LceCompletion,
    ) -> Result<(), Status> {
        if !log_id.is_valid() {
            return Err(Status::InvalidParam);
        }
        self.run_request(Box::new(GetLastCleanEpochRequest::new(
            log_id,
            codec,
            completion,
            Arc::clone(&self.shutting_down),
        )));
        Ok(())
    }

    /// Advance the last clean epoch of `log_id` to `lce`. Completes `Ok`
    /// only when `lce` strictly advances the stored value and the
    /// conditional write wins; a version race completes `Again` and a
    /// non-advancing epoch completes `Stale` carrying the stored value.
    pub fn set_last_clean_epoch(
        self: &Arc<Self>,
        log_id: LogId,
        lce: Epoch,
        tail: TailRecord,
        codec: Arc<dyn LceCodec>,
        completion: LceCompletion,
    ) -> Result<(), Status> {
        if !log_id.is_valid() {
            return Err(Status::InvalidParam);
        }
        if !tail.is_valid() || tail.contains_offset_within_epoch() {
            error!(
                log_id = %log_id,
                lce = %lce,
                tail_flags = tail.flags,
                "attempting to update LCE with an invalid tail record"
            );
            return Err(Status::InvalidParam);
        }
        self.run_request(Box::new(SetLastCleanEpochRequest::new(
            log_id,
            lce,
            tail,
            codec,
            completion,
            Arc::clone(&self.shutting_down),
        )));
        Ok(())
    }

    /// Read-modify-write the epoch metadata of `log_id` through a
    /// caller-supplied updater. Provisions the log's subtree when the
    /// updater decides `Provision` against an absent node.
    pub fn create_or_update_metadata(
        self: &Arc<Self>,
        log_id: LogId,
        updater: Arc<dyn MetaDataUpdater>,
        write_node_id: WriteNodeId,
        completion: MetaDataCompletion,
    ) -> Result<(), Status> {
        // Metadata-log ids never carry their own epoch metadata.
        if log_id.is_metadata_log() || !log_id.is_valid() {
            return Err(Status::InvalidParam);
        }
        self.run_request(Box::new(EpochMetadataRequest::new(
            log_id,
            updater,
            write_node_id,
            completion,
            Arc::clone(&self.shutting_down),
        )));
        Ok(())
    }

    /// Start one read-modify-write cycle for `req`. Never blocks; the
    /// request's completion is posted exactly once from the driving task.
    pub fn run_request(self: &Arc<Self>, req: Box<dyn EpochStoreRequest>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            store.drive(req).await;
        });
    }

    /// Snapshot of the currently installed client. In-flight requests
    /// keep their own snapshot, so a quorum swap never interrupts them.
    fn client(&self) -> Arc<dyn ZkClient> {
        self.client.read().unwrap().clone()
    }

    async fn drive(&self, mut req: Box<dyn EpochStoreRequest>) {
        let log_id = req.log_id();
        let log_root = self.znode_path_for_log(log_id);
        let path = req.znode_path(&log_root);

        let client = self.client();
        let (value, stat) = match client.get_data(&path).await {
            Ok((value, stat)) => (Some(value), stat),
            Err(err) => {
                let st = self.map_zk_error(err, log_id, &client);
                if st != Status::NotFound {
                    self.finish(req, st);
                    return;
                }
                (None, Stat::default())
            }
        };

        let next = req.on_value(value.as_deref());
        match next {
            NextStep::Stop(st) => {
                debug_check_terminal(req.kind(), true, st);
                self.finish(req, st);
            }
            NextStep::Failed(st) => {
                debug_check_terminal(req.kind(), false, st);
                self.finish(req, st);
            }
            NextStep::Modify | NextStep::Provision => {
                let mut composed = Vec::new();
                if let Err(st) = req.compose_value(&mut composed) {
                    self.finish(req, st);
                    return;
                }
                if composed.len() > NODE_VALUE_WRITE_LIMIT {
                    error!(
                        log_id = %log_id,
                        size = composed.len(),
                        limit = NODE_VALUE_WRITE_LIMIT,
                        "invalid composed node value size"
                    );
                    debug_assert!(false, "composed node value exceeds write limit");
                    self.finish(req, Status::Internal);
                    return;
                }
                if matches!(next, NextStep::Provision) {
                    debug_assert!(value.is_none());
                    self.provision_log_subtree(req, composed).await;
                } else {
                    // The conditional write below succeeds only while the
                    // node still has the version observed by the read
                    // above; a lost race surfaces as AGAIN.
                    let res = client
                        .set_data(&path, Bytes::from(composed), stat.version)
                        .await;
                    let st = match res {
                        Ok(_) => Status::Ok,
                        Err(err) => self.map_zk_error(err, log_id, &client),
                    };
                    self.finish(req, st);
                }
            }
        }
    }

    /// Atomically create the four-node subtree for the request's log,
    /// creating root-path ancestors first when they are missing and the
    /// settings allow it.
    async fn provision_log_subtree(&self, req: Box<dyn EpochStoreRequest>, value: Vec<u8>) {
        let log_id = req.log_id();
        let log_root = self.znode_path_for_log(log_id);
        let ops = vec![
            CreateOp::new(log_root.clone(), Bytes::new()),
            CreateOp::new(
                format!("{log_root}/{EPOCH_METADATA_NODE}"),
                Bytes::from(value),
            ),
            CreateOp::new(format!("{log_root}/{LCE_DATA_LOG_NODE}"), Bytes::new()),
            CreateOp::new(format!("{log_root}/{LCE_METADATA_LOG_NODE}"), Bytes::new()),
        ];

        loop {
            let st = self.submit_multi_op(ops.clone(), log_id).await;
            if st == Status::NotFound {
                if !self.settings.create_root_nodes {
                    error!(
                        root = %self.root_path,
                        "root node does not exist; it has to be created by external tooling \
                         when create_root_nodes is disabled"
                    );
                    self.finish(req, Status::NotFound);
                    return;
                }
                info!(root = %self.root_path, "root node does not exist, creating it");
                let st = self.create_root_nodes().await;
                if st != Status::Ok {
                    self.finish(req, st);
                    return;
                }
                // Ancestors exist now; re-drive the deferred multi-op.
                continue;
            }
            self.finish(req, st);
            return;
        }
    }

    /// Run one atomic multi-create and fold the outcome to a status.
    async fn submit_multi_op(&self, ops: Vec<CreateOp>, log_id: LogId) -> Status {
        let client = self.client();
        match client.multi_op(ops).await {
            Ok(results) => {
                // The transaction committed, so every sub-op did too.
                debug_assert!(results.iter().all(|r| r.is_ok()));
                Status::Ok
            }
            Err(err) => self.map_zk_error(err, log_id, &client),
        }
    }

    /// Create every missing ancestor of the root path, shallowest first:
    /// each step's parent must already exist by the time it runs.
    /// Creates go through the multi-op API for uniformity with the
    /// provisioning path, one node per transaction.
    async fn create_root_nodes(&self) -> Status {
        let mut to_create: Vec<String> = Vec::new();
        let mut path = self.root_path.as_str();
        while !path.is_empty() && path != "/" {
            to_create.push(path.to_string());
            path = parent_path(path);
        }

        let mut last_created: Option<String> = None;
        while let Some(current) = to_create.pop() {
            if let Some(prev) = &last_created {
                debug_assert!(
                    current.starts_with(prev.as_str()),
                    "ancestors must be created shallowest first"
                );
            }
            let st = self
                .submit_multi_op(
                    vec![CreateOp::new(current.clone(), Bytes::new())],
                    LogId::INVALID,
                )
                .await;
            match st {
                Status::Ok => info!(path = %current, "created root node"),
                Status::Exists => debug!(path = %current, "root node already exists"),
                st => {
                    error!(path = %current, status = %st, "unable to create root node");
                    return st;
                }
            }
            last_created = Some(current);
        }
        Status::Ok
    }

    /// Post the request's completion unless the client reported shutdown
    /// while this store is itself tearing down; the caller is presumed
    /// gone then. A `Shutdown` produced by a quorum-change client
    /// teardown alone still posts.
    fn finish(&self, req: Box<dyn EpochStoreRequest>, st: Status) {
        if st == Status::Shutdown && req.shutdown_observer().load(Ordering::Relaxed) {
            return;
        }
        req.post_completion(st);
    }

    /// Translate a client return code into a completion status.
    fn map_zk_error(&self, err: ZkError, log_id: LogId, client: &Arc<dyn ZkClient>) -> Status {
        match err {
            ZkError::BadArguments => {
                error!(log_id = %log_id, "coordination client reported BadArguments");
                debug_assert!(false, "BadArguments from coordination client");
                Status::Internal
            }
            ZkError::InvalidState => {
                // The session state reflects the state now, not
                // necessarily the state at the time of the error.
                match client.session_state() {
                    SessionState::Expired => Status::NotConn,
                    SessionState::AuthFailed => Status::Access,
                    state => {
                        warn!(
                            ?state,
                            "unable to recover session state at time of InvalidState error, \
                             possibly expired or auth-failed; current state may reflect a \
                             re-established session"
                        );
                        Status::Failed
                    }
                }
            }
            ZkError::RuntimeInconsistency => {
                error!(log_id = %log_id, "coordination service reported a runtime inconsistency");
                self.stats
                    .epoch_store_internal_inconsistency_errors
                    .fetch_add(1, Ordering::Relaxed);
                Status::Failed
            }
            ZkError::VersionMismatch => Status::Again,
            ZkError::Unknown(code) => {
                error!(log_id = %log_id, code, "unexpected return code from coordination client");
                debug_assert!(false, "unknown coordination client return code");
                Status::Failed
            }
            other => other.base_status(),
        }
    }

    fn spawn_config_watcher(self: &Arc<Self>, mut config: watch::Receiver<ZkConfig>) {
        let store: Weak<EpochStore> = Arc::downgrade(self);
        tokio::spawn(async move {
            while config.changed().await.is_ok() {
                let Some(store) = store.upgrade() else {
                    return;
                };
                let cfg = config.borrow().clone();
                store.on_config_update(&cfg);
            }
        });
    }

    fn on_config_update(&self, cfg: &ZkConfig) {
        if cfg.quorum.is_empty() {
            error!("coordination service configuration is empty, keeping current client");
            return;
        }
        if cfg.quorum == self.client().quorum() {
            return;
        }
        info!(quorum = %cfg.quorum, "coordination quorum changed, reconnecting");
        match (self.factory)(cfg) {
            Ok(client) => *self.client.write().unwrap() = client,
            Err(err) => {
                error!(error = ?err, "coordination client reconnect failed, keeping current client");
            }
        }
    }
}

impl Drop for EpochStore {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

/// Parent of an absolute node path; the parent of `/a` (and of `/`) is `/`.
fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Terminal statuses each request kind may legally stop or fail with.
fn debug_check_terminal(kind: RequestKind, stop: bool, st: Status) {
    if stop {
        debug_assert!(
            matches!(
                (kind, st),
                (RequestKind::GetLastCleanEpoch, Status::Ok)
                    | (RequestKind::EpochMetadata, Status::UpToDate)
            ),
            "illegal STOP status {st} for {kind:?}"
        );
        return;
    }
    let base_allowed = matches!(
        st,
        Status::Failed
            | Status::BadMsg
            | Status::NotFound
            | Status::Empty
            | Status::Exists
            | Status::Disabled
            | Status::TooBig
    );
    let allowed = base_allowed
        || match kind {
            RequestKind::EpochMetadata => {
                matches!(st, Status::InvalidParam | Status::Aborted | Status::Stale)
            }
            RequestKind::SetLastCleanEpoch => st == Status::Stale,
            RequestKind::GetLastCleanEpoch => false,
        };
    debug_assert!(allowed, "illegal FAILED status {st} for {kind:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_path_walks_to_root() {
        assert_eq!(parent_path("/ld/c1/logs"), "/ld/c1");
        assert_eq!(parent_path("/ld/c1"), "/ld");
        assert_eq!(parent_path("/ld"), "/");
        assert_eq!(parent_path("/"), "/");
    }
}
