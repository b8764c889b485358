//! Bounded sliding-window time-series used by the health monitor.
//!
//! A fixed ring of buckets covers the trailing window; samples older than
//! the window are retired as time advances. Windowed queries interpolate
//! proportionally for buckets only partially covered by the query range,
//! which is exact in the monitor's case because its query windows align
//! with bucket boundaries.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Default)]
struct Bucket {
    sum: Duration,
    count: u64,
}

impl Bucket {
    fn clear(&mut self) {
        self.sum = Duration::ZERO;
        self.count = 0;
    }
}

/// Ring of `num_buckets` buckets spanning a fixed trailing `window`.
pub struct BucketedTimeSeries {
    origin: Instant,
    bucket_width: Duration,
    buckets: Vec<Bucket>,
    /// Absolute index (buckets since `origin`) of the newest bucket the
    /// series has advanced to. The ring holds the `num_buckets` indices
    /// ending at it.
    latest: u64,
}

impl BucketedTimeSeries {
    pub fn new(num_buckets: usize, window: Duration) -> Self {
        let num_buckets = num_buckets.max(1);
        let bucket_width = window
            .checked_div(num_buckets as u32)
            .filter(|w| !w.is_zero())
            .unwrap_or(Duration::from_millis(1));
        BucketedTimeSeries {
            origin: Instant::now(),
            bucket_width,
            buckets: vec![Bucket::default(); num_buckets],
            latest: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.bucket_width * self.buckets.len() as u32
    }

    fn bucket_index(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.origin).as_nanos();
        (elapsed / self.bucket_width.as_nanos().max(1)) as u64
    }

    /// Advance the ring to cover `now`, retiring buckets that fell out of
    /// the window.
    pub fn update(&mut self, now: Instant) {
        self.advance(self.bucket_index(now));
    }

    fn advance(&mut self, to: u64) {
        if to <= self.latest {
            return;
        }
        let len = self.buckets.len() as u64;
        if to - self.latest >= len {
            for bucket in &mut self.buckets {
                bucket.clear();
            }
        } else {
            for idx in (self.latest + 1)..=to {
                self.buckets[(idx % len) as usize].clear();
            }
        }
        self.latest = to;
    }

    /// Record one sample. Samples older than the current window are
    /// dropped.
    pub fn add(&mut self, at: Instant, value: Duration) {
        let idx = self.bucket_index(at);
        let len = self.buckets.len() as u64;
        if idx > self.latest {
            self.advance(idx);
        } else if self.latest - idx >= len {
            return;
        }
        let bucket = &mut self.buckets[(idx % len) as usize];
        bucket.sum += value;
        bucket.count += 1;
    }

    /// Total recorded duration inside `[from, to)`.
    pub fn sum(&self, from: Instant, to: Instant) -> Duration {
        let nanos = self.fold(from, to, |b| b.sum.as_nanos() as f64);
        Duration::from_nanos(nanos.round().max(0.0) as u64)
    }

    /// Number of samples inside `[from, to)`, rounded to the nearest
    /// whole sample for partially covered buckets.
    pub fn count(&self, from: Instant, to: Instant) -> u64 {
        self.fold(from, to, |b| b.count as f64).round().max(0.0) as u64
    }

    fn fold(&self, from: Instant, to: Instant, value: impl Fn(&Bucket) -> f64) -> f64 {
        if to <= from {
            return 0.0;
        }
        let width = self.bucket_width.as_nanos() as f64;
        let from = from.saturating_duration_since(self.origin).as_nanos() as f64;
        let to = to.saturating_duration_since(self.origin).as_nanos() as f64;

        let len = self.buckets.len() as u64;
        let oldest = (self.latest + 1).saturating_sub(len);
        let mut total = 0.0;
        for idx in oldest..=self.latest {
            let start = idx as f64 * width;
            let end = start + width;
            let overlap = to.min(end) - from.max(start);
            if overlap <= 0.0 {
                continue;
            }
            total += value(&self.buckets[(idx % len) as usize]) * (overlap / width).min(1.0);
        }
        total
    }
}
