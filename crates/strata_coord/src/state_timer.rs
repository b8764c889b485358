//! Hysteresis timer damping health-state transitions.

use std::time::{Duration, Instant};

use rand::Rng;

/// Bounded hysteretic counter: negative feedback multiplies the current
/// value (with a small random fuzz so fleets do not move in lockstep),
/// positive feedback decays it linearly with elapsed real time. The
/// value stays inside `[min, max]` at all times.
pub struct StateTimer {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
    /// Value-milliseconds shed per elapsed millisecond.
    decrease_rate: f64,
    fuzz_factor: f64,
    last_feedback: Option<Instant>,
}

impl StateTimer {
    pub fn new(
        min: Duration,
        initial: Duration,
        max: Duration,
        multiplier: f64,
        decrease_rate: f64,
        fuzz_factor: f64,
    ) -> Self {
        let max = max.max(min);
        StateTimer {
            current: initial.clamp(min, max),
            min,
            max,
            multiplier: multiplier.max(1.0),
            decrease_rate: decrease_rate.max(0.0),
            fuzz_factor: fuzz_factor.clamp(0.0, 1.0),
            last_feedback: None,
        }
    }

    pub fn current_value(&self) -> Duration {
        self.current
    }

    /// Multiplicative increase, clamped to `max`.
    pub fn negative_feedback(&mut self) {
        let fuzz = if self.fuzz_factor > 0.0 {
            rand::thread_rng().gen_range(-self.fuzz_factor..=self.fuzz_factor)
        } else {
            0.0
        };
        let next = self.current.as_secs_f64() * self.multiplier * (1.0 + fuzz);
        self.current = Duration::from_secs_f64(next.max(0.0)).clamp(self.min, self.max);
    }

    /// Linear decay toward `min` at `decrease_rate` per unit of elapsed
    /// time since the previous feedback of either kind.
    pub fn positive_feedback(&mut self, now: Instant) {
        let elapsed = match self.last_feedback {
            Some(prev) => now.saturating_duration_since(prev),
            None => Duration::ZERO,
        };
        self.last_feedback = Some(now);
        let shed = elapsed.as_secs_f64() * self.decrease_rate;
        let next = self.current.as_secs_f64() - shed;
        self.current = Duration::from_secs_f64(next.max(0.0)).clamp(self.min, self.max);
    }
}
