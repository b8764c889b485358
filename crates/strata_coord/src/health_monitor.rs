//! Node health monitor.
//!
//! A single spawned task periodically classifies this node as healthy,
//! overloaded, or unhealthy from sliding windows of per-worker request
//! stalls and queue stalls. Reports arrive from any thread through a
//! non-blocking channel and are folded into the window state between
//! ticks, so all mutable state stays owned by the monitor task. A
//! hysteresis timer keeps a flapping signal from oscillating the
//! published state.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::state_timer::StateTimer;
use crate::stats::CoordStats;
use crate::timeseries::BucketedTimeSeries;

/// Buckets per worker stall series.
pub const NUM_BUCKETS: usize = 12;
/// Worker stall series span `NUM_PERIODS * sleep_period`.
pub const NUM_PERIODS: u32 = 6;
/// Detection looks back over windows ending up to `PERIOD_RANGE` loops ago.
pub const PERIOD_RANGE: u32 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    /// Loop period; also the minimum and initial hysteresis-timer value.
    pub sleep_period: Duration,
    /// Average queue-stall duration above which a window is problematic.
    pub max_queue_stalls_avg: Duration,
    /// Total queue-stall time above which a window is problematic.
    pub max_queue_stall_duration: Duration,
    /// Fraction of workers with overloaded queues that overloads the node.
    pub max_overloaded_worker_percentage: f64,
    /// Average request-stall duration above which a worker is stalled.
    pub max_stalls_avg: Duration,
    /// Fraction of stalled workers that stalls the node.
    pub max_stalled_worker_percentage: f64,
    /// Tolerated loop-wakeup lateness before the monitor flags itself.
    pub max_loop_stall: Duration,
    /// Hysteresis timer ceiling.
    pub max_timer_value: Duration,
    pub timer_multiplier: f64,
    pub timer_decrease_rate: f64,
    pub timer_fuzz_factor: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        HealthMonitorConfig {
            sleep_period: Duration::from_millis(100),
            max_queue_stalls_avg: Duration::from_millis(60),
            max_queue_stall_duration: Duration::from_millis(200),
            max_overloaded_worker_percentage: 0.3,
            max_stalls_avg: Duration::from_millis(45),
            max_stalled_worker_percentage: 0.3,
            max_loop_stall: Duration::from_millis(50),
            max_timer_value: Duration::from_secs(10),
            timer_multiplier: 2.0,
            timer_decrease_rate: 0.4,
            timer_fuzz_factor: 0.1,
        }
    }
}

/// Published node health classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Healthy = 0,
    Overloaded = 1,
    Unhealthy = 2,
}

impl NodeState {
    fn from_u8(raw: u8) -> NodeState {
        match raw {
            1 => NodeState::Overloaded,
            2 => NodeState::Unhealthy,
            _ => NodeState::Healthy,
        }
    }
}

/// Per-tick stall evaluation result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StallInfo {
    /// Workers whose average stall reached a full sleep period.
    pub critically_stalled: u32,
    pub stalled: bool,
}

enum Report {
    WatchdogDelay(bool),
    StalledWorkers(usize),
    WorkerStall {
        idx: usize,
        at: Instant,
        duration: Duration,
    },
    WorkerQueueStall {
        idx: usize,
        at: Instant,
        duration: Duration,
    },
}

/// Handle to a running monitor. Cheap to share behind an `Arc`; intake
/// methods never block and may be called from any thread.
pub struct HealthMonitor {
    tx: mpsc::UnboundedSender<Report>,
    shutdown: Arc<AtomicBool>,
    node_state: Arc<AtomicU8>,
    done: watch::Receiver<bool>,
}

impl HealthMonitor {
    /// Spawn the monitor task. Must be called within a tokio runtime.
    pub fn start_up(
        config: HealthMonitorConfig,
        num_workers: usize,
        stats: Arc<CoordStats>,
    ) -> HealthMonitor {
        let mut config = config;
        config.sleep_period = config.sleep_period.max(Duration::from_millis(1));

        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done) = watch::channel(false);
        let shutdown = Arc::new(AtomicBool::new(false));
        let node_state = Arc::new(AtomicU8::new(NodeState::Healthy as u8));

        let monitor_loop = MonitorLoop::new(
            config,
            num_workers,
            stats,
            rx,
            Arc::clone(&shutdown),
            Arc::clone(&node_state),
            done_tx,
        );
        tokio::spawn(monitor_loop.run());

        HealthMonitor {
            tx,
            shutdown,
            node_state,
            done,
        }
    }

    pub fn node_state(&self) -> NodeState {
        NodeState::from_u8(self.node_state.load(Ordering::Relaxed))
    }

    /// Record whether the process watchdog observed a delay.
    pub fn report_watchdog_health(&self, delayed: bool) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.send(Report::WatchdogDelay(delayed));
    }

    /// Record the watchdog's current count of stalled workers.
    pub fn report_stalled_workers(&self, num_stalled: usize) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.send(Report::StalledWorkers(num_stalled));
    }

    /// Record one request stall on worker `idx`. Out-of-range indexes
    /// are dropped silently.
    pub fn report_worker_stall(&self, idx: usize, duration: Duration) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let at = Instant::now();
        let _ = self.tx.send(Report::WorkerStall { idx, at, duration });
    }

    /// Record one request-queue stall on worker `idx`. Out-of-range
    /// indexes are dropped silently.
    pub fn report_worker_queue_stall(&self, idx: usize, duration: Duration) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let at = Instant::now();
        let _ = self.tx.send(Report::WorkerQueueStall { idx, at, duration });
    }

    /// Stop the monitor. Resolves once the loop has observed the flag on
    /// its next wakeup; intake submitted after this call is ignored.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// State owned by the monitor task.
struct InternalInfo {
    worker_stalls: Vec<BucketedTimeSeries>,
    worker_queue_stalls: Vec<BucketedTimeSeries>,
    watchdog_delay: bool,
    total_stalled_workers: usize,
    health_monitor_delay: bool,
}

impl InternalInfo {
    fn new(num_workers: usize, sleep_period: Duration) -> InternalInfo {
        let window = sleep_period * NUM_PERIODS;
        InternalInfo {
            worker_stalls: (0..num_workers)
                .map(|_| BucketedTimeSeries::new(NUM_BUCKETS, window))
                .collect(),
            worker_queue_stalls: (0..num_workers)
                .map(|_| BucketedTimeSeries::new(NUM_BUCKETS, window))
                .collect(),
            watchdog_delay: false,
            total_stalled_workers: 0,
            health_monitor_delay: false,
        }
    }

    fn num_workers(&self) -> usize {
        self.worker_stalls.len()
    }
}

struct MonitorLoop {
    cfg: HealthMonitorConfig,
    info: InternalInfo,
    state_timer: StateTimer,
    stall_info: StallInfo,
    overloaded: bool,
    rx: mpsc::UnboundedReceiver<Report>,
    shutdown: Arc<AtomicBool>,
    node_state: Arc<AtomicU8>,
    done_tx: watch::Sender<bool>,
    stats: Arc<CoordStats>,
}

impl MonitorLoop {
    fn new(
        cfg: HealthMonitorConfig,
        num_workers: usize,
        stats: Arc<CoordStats>,
        rx: mpsc::UnboundedReceiver<Report>,
        shutdown: Arc<AtomicBool>,
        node_state: Arc<AtomicU8>,
        done_tx: watch::Sender<bool>,
    ) -> MonitorLoop {
        let state_timer = StateTimer::new(
            // The node cannot be unhealthy for less than one loop.
            cfg.sleep_period,
            cfg.sleep_period,
            cfg.max_timer_value,
            cfg.timer_multiplier,
            cfg.timer_decrease_rate,
            cfg.timer_fuzz_factor,
        );
        MonitorLoop {
            info: InternalInfo::new(num_workers, cfg.sleep_period),
            cfg,
            state_timer,
            stall_info: StallInfo::default(),
            overloaded: false,
            rx,
            shutdown,
            node_state,
            done_tx,
            stats,
        }
    }

    async fn run(mut self) {
        self.update_variables(Instant::now());
        loop {
            let last_entry = Instant::now();
            tokio::time::sleep(self.cfg.sleep_period).await;
            self.stats
                .health_monitor_num_loops
                .fetch_add(1, Ordering::Relaxed);

            if self.shutdown.load(Ordering::Relaxed) {
                let _ = self.done_tx.send(true);
                return;
            }

            let now = Instant::now();
            let loop_entry_delay = now.saturating_duration_since(last_entry);
            self.info.health_monitor_delay =
                loop_entry_delay.saturating_sub(self.cfg.sleep_period) > self.cfg.max_loop_stall;

            self.drain_reports();
            self.process_reports(now);
        }
    }

    fn drain_reports(&mut self) {
        while let Ok(report) = self.rx.try_recv() {
            self.apply(report);
        }
    }

    fn apply(&mut self, report: Report) {
        match report {
            Report::WatchdogDelay(delayed) => self.info.watchdog_delay = delayed,
            Report::StalledWorkers(num_stalled) => self.info.total_stalled_workers = num_stalled,
            Report::WorkerStall { idx, at, duration } => {
                if let Some(series) = self.info.worker_stalls.get_mut(idx) {
                    series.add(at, duration);
                }
            }
            Report::WorkerQueueStall { idx, at, duration } => {
                if let Some(series) = self.info.worker_queue_stalls.get_mut(idx) {
                    series.add(at, duration);
                }
            }
        }
    }

    fn update_variables(&mut self, now: Instant) {
        for series in &mut self.info.worker_stalls {
            series.update(now);
        }
        for series in &mut self.info.worker_queue_stalls {
            series.update(now);
        }
        self.state_timer.positive_feedback(now);
    }

    fn process_reports(&mut self, now: Instant) {
        self.update_variables(now);
        self.calculate_negative_signal(now);

        let state = if self.cfg.sleep_period < self.state_timer.current_value() {
            NodeState::Unhealthy
        } else if self.overloaded {
            NodeState::Overloaded
        } else {
            NodeState::Healthy
        };
        self.publish_state(state);
        if state == NodeState::Healthy {
            self.stats
                .health_monitor_state_indicator
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn calculate_negative_signal(&mut self, now: Instant) {
        let half_period = self.cfg.sleep_period / 2;
        self.stall_info = self.is_stalled(now, half_period);
        self.overloaded = self.is_overloaded(now, half_period);

        self.stats
            .health_monitor_stall_indicator
            .fetch_add(self.stall_info.stalled as u64, Ordering::Relaxed);
        self.stats
            .health_monitor_overload_indicator
            .fetch_add(self.overloaded as u64, Ordering::Relaxed);

        if self.info.health_monitor_delay
            || self.info.watchdog_delay
            || self.info.total_stalled_workers > 0
            || self.stall_info.stalled
        {
            self.state_timer.negative_feedback();
            self.state_timer.positive_feedback(now);
        }
        // Critical stalls are a serious concern and weigh in once more.
        if self.stall_info.critically_stalled > 0 {
            self.state_timer.negative_feedback();
            self.state_timer.positive_feedback(now);
        }
    }

    /// The node is overloaded when enough workers saw a problematic
    /// queue-stall window. Windows of one sleep period each are examined
    /// over the past `PERIOD_RANGE` loops, including spans straddling
    /// neighboring loops.
    fn is_overloaded(&self, now: Instant, half_period: Duration) -> bool {
        let overloaded_workers = self
            .info
            .worker_queue_stalls
            .iter()
            .filter(|series| {
                self.windows(now, half_period).any(|(from, to)| {
                    let sum = series.sum(from, to);
                    let count = series.count(from, to);
                    count > 0
                        && sum >= self.cfg.max_queue_stall_duration
                        && sum / count as u32 >= self.cfg.max_queue_stalls_avg
                })
            })
            .count();
        overloaded_workers as f64
            >= self.cfg.max_overloaded_worker_percentage * self.info.num_workers() as f64
    }

    /// The node is stalled when enough workers saw a problematic
    /// request-stall window; workers whose average stall reached a full
    /// sleep period count as critically stalled.
    fn is_stalled(&self, now: Instant, half_period: Duration) -> StallInfo {
        let mut info = StallInfo::default();
        let mut stalled_workers = 0usize;
        for series in &self.info.worker_stalls {
            for (from, to) in self.windows(now, half_period) {
                let count = series.count(from, to);
                if count == 0 {
                    continue;
                }
                let avg = series.sum(from, to) / count as u32;
                if avg >= self.cfg.max_stalls_avg {
                    if avg >= self.cfg.sleep_period {
                        info.critically_stalled += 1;
                    }
                    stalled_workers += 1;
                    break;
                }
            }
        }
        info.stalled = stalled_workers as f64
            >= self.cfg.max_stalled_worker_percentage * self.info.num_workers() as f64;
        info
    }

    /// Evaluation windows `[now - p*half, now - (p-2)*half]` for
    /// `p in 2..=2*PERIOD_RANGE`, each spanning one sleep period.
    fn windows(&self, now: Instant, half_period: Duration) -> impl Iterator<Item = (Instant, Instant)> {
        (2..=2 * PERIOD_RANGE).filter_map(move |p| {
            let from = now.checked_sub(half_period * p)?;
            let to = now.checked_sub(half_period * (p - 2))?;
            Some((from, to))
        })
    }

    fn publish_state(&self, state: NodeState) {
        let previous = self.node_state.swap(state as u8, Ordering::Relaxed);
        if previous != state as u8 {
            debug!(
                previous = ?NodeState::from_u8(previous),
                current = ?state,
                "node health state changed"
            );
        }
    }
}
