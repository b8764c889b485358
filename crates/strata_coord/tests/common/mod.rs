//! Shared test fixtures: an in-memory coordination service with
//! versioned nodes and atomic multi-create, plus simple codecs, updaters,
//! and completion captures.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use strata_coord::{
    CreateOp, Epoch, LceCodec, LceCompletion, LogId, MetaDataCompletion, MetaDataUpdater,
    SessionState, Stat, Status, TailRecord, UpdateDecision, WriteNodeId, ZkClient,
    ZkClientFactory, ZkConfig, ZkError, ZkResult,
};

#[derive(Clone, Debug)]
pub struct NodeEntry {
    pub value: Bytes,
    pub version: i32,
}

pub type Tree = BTreeMap<String, NodeEntry>;

type GatePair = (oneshot::Sender<()>, oneshot::Receiver<()>);

/// In-memory stand-in for the coordination service. Multiple clients may
/// share one tree to model one service observed through several
/// sessions (e.g. across a quorum change).
pub struct MemoryZkClient {
    tree: Arc<Mutex<Tree>>,
    quorum: String,
    session: Mutex<SessionState>,
    get_errors: Mutex<VecDeque<ZkError>>,
    set_errors: Mutex<VecDeque<ZkError>>,
    /// Errors keyed by 1-based `multi_op` call index.
    multi_errors: Mutex<BTreeMap<u64, ZkError>>,
    get_gates: Mutex<VecDeque<GatePair>>,
    set_gates: Mutex<VecDeque<GatePair>>,
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub multis: AtomicU64,
}

impl MemoryZkClient {
    pub fn new(quorum: &str) -> Arc<MemoryZkClient> {
        Self::with_tree(quorum, Arc::new(Mutex::new(Tree::new())))
    }

    pub fn with_tree(quorum: &str, tree: Arc<Mutex<Tree>>) -> Arc<MemoryZkClient> {
        Arc::new(MemoryZkClient {
            tree,
            quorum: quorum.to_string(),
            session: Mutex::new(SessionState::Connected),
            get_errors: Mutex::new(VecDeque::new()),
            set_errors: Mutex::new(VecDeque::new()),
            multi_errors: Mutex::new(BTreeMap::new()),
            get_gates: Mutex::new(VecDeque::new()),
            set_gates: Mutex::new(VecDeque::new()),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            multis: AtomicU64::new(0),
        })
    }

    pub fn tree(&self) -> Arc<Mutex<Tree>> {
        Arc::clone(&self.tree)
    }

    pub fn insert_node(&self, path: &str, value: impl Into<Bytes>) {
        self.tree.lock().unwrap().insert(
            path.to_string(),
            NodeEntry {
                value: value.into(),
                version: 0,
            },
        );
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.tree.lock().unwrap().contains_key(path)
    }

    pub fn node_value(&self, path: &str) -> Option<Bytes> {
        self.tree
            .lock()
            .unwrap()
            .get(path)
            .map(|entry| entry.value.clone())
    }

    pub fn node_version(&self, path: &str) -> Option<i32> {
        self.tree.lock().unwrap().get(path).map(|entry| entry.version)
    }

    pub fn node_count(&self) -> usize {
        self.tree.lock().unwrap().len()
    }

    pub fn set_session_state(&self, state: SessionState) {
        *self.session.lock().unwrap() = state;
    }

    pub fn inject_get_error(&self, err: ZkError) {
        self.get_errors.lock().unwrap().push_back(err);
    }

    pub fn inject_set_error(&self, err: ZkError) {
        self.set_errors.lock().unwrap().push_back(err);
    }

    /// Fail the `nth` (1-based) `multi_op` call with `err`.
    pub fn inject_multi_error_at(&self, nth: u64, err: ZkError) {
        self.multi_errors.lock().unwrap().insert(nth, err);
    }

    /// Gate the next `get_data`: it signals arrival through the returned
    /// receiver and blocks until the returned sender fires.
    pub fn gate_next_get(&self) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        Self::push_gate(&self.get_gates)
    }

    /// Gate the next `set_data`, same protocol as [`Self::gate_next_get`].
    pub fn gate_next_set(&self) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        Self::push_gate(&self.set_gates)
    }

    fn push_gate(
        gates: &Mutex<VecDeque<GatePair>>,
    ) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        let (release_tx, release_rx) = oneshot::channel();
        let (reached_tx, reached_rx) = oneshot::channel();
        gates.lock().unwrap().push_back((reached_tx, release_rx));
        (release_tx, reached_rx)
    }

    async fn pass_gate(gates: &Mutex<VecDeque<GatePair>>) {
        let gate = gates.lock().unwrap().pop_front();
        if let Some((reached_tx, release_rx)) = gate {
            let _ = reached_tx.send(());
            let _ = release_rx.await;
        }
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }
}

#[async_trait]
impl ZkClient for MemoryZkClient {
    async fn get_data(&self, path: &str) -> ZkResult<(Bytes, Stat)> {
        Self::pass_gate(&self.get_gates).await;
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.get_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let tree = self.tree.lock().unwrap();
        let entry = tree.get(path).ok_or(ZkError::NoNode)?;
        Ok((
            entry.value.clone(),
            Stat {
                version: entry.version,
            },
        ))
    }

    async fn set_data(&self, path: &str, value: Bytes, expected_version: i32) -> ZkResult<Stat> {
        Self::pass_gate(&self.set_gates).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.set_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut tree = self.tree.lock().unwrap();
        let entry = tree.get_mut(path).ok_or(ZkError::NoNode)?;
        if expected_version >= 0 && entry.version != expected_version {
            return Err(ZkError::VersionMismatch);
        }
        entry.version += 1;
        entry.value = value;
        Ok(Stat {
            version: entry.version,
        })
    }

    async fn multi_op(&self, ops: Vec<CreateOp>) -> ZkResult<Vec<ZkResult<()>>> {
        let nth = self.multis.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(err) = self.multi_errors.lock().unwrap().remove(&nth) {
            return Err(err);
        }
        let mut tree = self.tree.lock().unwrap();
        // Stage the batch first so it commits all-or-nothing; ops later in
        // the batch see the effects of earlier ones, as the service's
        // transactions do.
        let mut staged: Vec<(String, Bytes)> = Vec::new();
        for op in &ops {
            let exists = tree.contains_key(&op.path)
                || staged.iter().any(|(path, _)| path == &op.path);
            if exists {
                return Err(ZkError::NodeExists);
            }
            let parent = Self::parent_of(&op.path);
            let parent_exists = parent == "/"
                || tree.contains_key(parent)
                || staged.iter().any(|(path, _)| path == parent);
            if !parent_exists {
                return Err(ZkError::NoNode);
            }
            staged.push((op.path.clone(), op.value.clone()));
        }
        for (path, value) in staged {
            tree.insert(path, NodeEntry { value, version: 0 });
        }
        Ok(ops.iter().map(|_| Ok(())).collect())
    }

    fn session_state(&self) -> SessionState {
        *self.session.lock().unwrap()
    }

    fn quorum(&self) -> String {
        self.quorum.clone()
    }
}

/// Factory that builds clients over one shared tree and records every
/// client it hands out, so tests can reach the live instances.
pub fn recording_factory(
    tree: Arc<Mutex<Tree>>,
    made: Arc<Mutex<Vec<Arc<MemoryZkClient>>>>,
) -> ZkClientFactory {
    Arc::new(move |cfg: &ZkConfig| {
        let client = MemoryZkClient::with_tree(&cfg.quorum, Arc::clone(&tree));
        made.lock().unwrap().push(Arc::clone(&client));
        Ok(client as Arc<dyn ZkClient>)
    })
}

/// Factory that always fails, for swap-failure tests.
pub fn failing_factory() -> ZkClientFactory {
    Arc::new(|_cfg: &ZkConfig| anyhow::bail!("injected factory failure"))
}

/// Text codec for LCE node payloads: `epoch@lsn@timestamp@flags`. An
/// empty payload decodes to `(Epoch::INVALID, None)` like a freshly
/// provisioned node.
pub struct TextLceCodec {
    pub log_id: LogId,
}

impl LceCodec for TextLceCodec {
    fn decode(&self, raw: &[u8]) -> Result<(Epoch, Option<TailRecord>), Status> {
        if raw.is_empty() {
            return Ok((Epoch::INVALID, None));
        }
        let text = std::str::from_utf8(raw).map_err(|_| Status::BadMsg)?;
        let mut parts = text.split('@');
        let epoch = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or(Status::BadMsg)?;
        let lsn = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(Status::BadMsg)?;
        let timestamp_ms = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(Status::BadMsg)?;
        let flags = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or(Status::BadMsg)?;
        Ok((
            Epoch(epoch),
            Some(TailRecord {
                log_id: self.log_id,
                lsn,
                timestamp_ms,
                flags,
            }),
        ))
    }

    fn encode(&self, epoch: Epoch, tail: &TailRecord, out: &mut Vec<u8>) -> Result<(), Status> {
        out.extend_from_slice(
            format!(
                "{}@{}@{}@{}",
                epoch.0, tail.lsn, tail.timestamp_ms, tail.flags
            )
            .as_bytes(),
        );
        Ok(())
    }
}

/// Metadata updater built from a closure.
pub struct FnUpdater<F>(pub F);

impl<F> MetaDataUpdater for FnUpdater<F>
where
    F: Fn(LogId, Option<&[u8]>, WriteNodeId, &mut Vec<u8>) -> UpdateDecision + Send + Sync,
{
    fn update(
        &self,
        log_id: LogId,
        current: Option<&[u8]>,
        write_node_id: WriteNodeId,
        out: &mut Vec<u8>,
    ) -> UpdateDecision {
        (self.0)(log_id, current, write_node_id, out)
    }
}

fn bump_epoch(
    _log_id: LogId,
    current: Option<&[u8]>,
    _write_node_id: WriteNodeId,
    out: &mut Vec<u8>,
) -> UpdateDecision {
    match current {
        None => {
            out.extend_from_slice(&1u32.to_le_bytes());
            UpdateDecision::Provision
        }
        Some(raw) => {
            let Ok(bytes) = <[u8; 4]>::try_from(raw) else {
                return UpdateDecision::Failed(Status::BadMsg);
            };
            let epoch = u32::from_le_bytes(bytes);
            out.extend_from_slice(&(epoch + 1).to_le_bytes());
            UpdateDecision::Modify
        }
    }
}

fn stop_up_to_date(
    _log_id: LogId,
    current: Option<&[u8]>,
    _write_node_id: WriteNodeId,
    _out: &mut Vec<u8>,
) -> UpdateDecision {
    assert!(current.is_some(), "up-to-date updater needs stored metadata");
    UpdateDecision::UpToDate
}

/// Updater modeling the epoch bumper: provisions epoch 1, otherwise
/// advances the stored 4-byte little-endian epoch by one.
pub fn bump_epoch_updater() -> Arc<dyn MetaDataUpdater> {
    Arc::new(FnUpdater(bump_epoch))
}

/// Updater that always declares the stored metadata current.
pub fn up_to_date_updater() -> Arc<dyn MetaDataUpdater> {
    Arc::new(FnUpdater(stop_up_to_date))
}

pub fn decode_meta_epoch(raw: &[u8]) -> u32 {
    u32::from_le_bytes(<[u8; 4]>::try_from(raw).expect("4-byte metadata payload"))
}

pub type LceOutcome = (Status, LogId, Epoch, Option<TailRecord>);
pub type MetaOutcome = (Status, LogId, Option<Bytes>);

pub fn lce_completion() -> (LceCompletion, oneshot::Receiver<LceOutcome>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |status, log_id, epoch, tail| {
            let _ = tx.send((status, log_id, epoch, tail));
        }),
        rx,
    )
}

pub fn meta_completion() -> (MetaDataCompletion, oneshot::Receiver<MetaOutcome>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |status, log_id, value| {
            let _ = tx.send((status, log_id, value));
        }),
        rx,
    )
}
