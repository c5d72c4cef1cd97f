//! Phi-accrual failure detection.
//!
//! Instead of a binary "timed out / not timed out" verdict, the detector
//! keeps a window of heartbeat inter-arrival times and reports a suspicion
//! level `phi`: the negative base-10 logarithm of the probability that a
//! heartbeat would still arrive this late given the observed distribution.
//! A phi of 1 means roughly a 10% chance of a false positive, 2 means 1%,
//! and so on. A link is available while phi stays below the threshold.
//!
//! The normal CDF is approximated with the logistic function
//! `1 / (1 + e^(-y * (1.5976 + 0.070566 * y^2)))`, accurate to about 1e-4.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::FailureDetectorSettings;

/// Sliding window of heartbeat inter-arrival times, in milliseconds.
#[derive(Debug, Clone)]
struct HeartbeatHistory {
    max_sample_size: usize,
    intervals: VecDeque<f64>,
    sum: f64,
    squared_sum: f64,
}

impl HeartbeatHistory {
    fn new(max_sample_size: usize) -> Self {
        Self {
            max_sample_size: max_sample_size.max(1),
            intervals: VecDeque::new(),
            sum: 0.0,
            squared_sum: 0.0,
        }
    }

    fn push(&mut self, interval: f64) {
        if self.intervals.len() >= self.max_sample_size {
            if let Some(dropped) = self.intervals.pop_front() {
                self.sum -= dropped;
                self.squared_sum -= dropped * dropped;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.squared_sum += interval * interval;
    }

    fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            0.0
        } else {
            self.sum / self.intervals.len() as f64
        }
    }

    fn variance(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        (self.squared_sum / self.intervals.len() as f64 - mean * mean).max(0.0)
    }

    fn std_deviation(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Phi-accrual failure detector for a single monitored link.
#[derive(Debug, Clone)]
pub struct PhiAccrualFailureDetector {
    threshold: f64,
    min_std_deviation_ms: f64,
    acceptable_pause_ms: f64,
    history: HeartbeatHistory,
    last_heartbeat: Option<Duration>,
}

impl PhiAccrualFailureDetector {
    /// Create a detector. The history is seeded with two synthetic samples
    /// around `first_heartbeat_estimate` so phi is meaningful before the
    /// first real interval is observed.
    pub fn new(settings: &FailureDetectorSettings) -> Self {
        let mut history = HeartbeatHistory::new(settings.max_sample_size);
        let mean = settings.first_heartbeat_estimate.as_secs_f64() * 1000.0;
        let std = mean / 4.0;
        history.push(mean - std);
        history.push(mean + std);
        Self {
            threshold: settings.threshold,
            min_std_deviation_ms: settings.min_std_deviation.as_secs_f64() * 1000.0,
            acceptable_pause_ms: settings.acceptable_heartbeat_pause.as_secs_f64() * 1000.0,
            history,
            last_heartbeat: None,
        }
    }

    /// Record a heartbeat arrival.
    pub fn heartbeat(&mut self, now: Duration) {
        if let Some(last) = self.last_heartbeat {
            let interval = now.saturating_sub(last).as_secs_f64() * 1000.0;
            // only intervals that did not already look like a failure feed
            // the history, so a long pause does not desensitize the detector
            if self.is_available(now) {
                self.history.push(interval);
            }
        }
        self.last_heartbeat = Some(now);
    }

    /// Whether any heartbeat has been recorded.
    pub fn is_monitoring(&self) -> bool {
        self.last_heartbeat.is_some()
    }

    /// Current suspicion level.
    pub fn phi(&self, now: Duration) -> f64 {
        let Some(last) = self.last_heartbeat else {
            return 0.0;
        };
        let elapsed = now.saturating_sub(last).as_secs_f64() * 1000.0;
        let mean = self.history.mean() + self.acceptable_pause_ms;
        let std = self.history.std_deviation().max(self.min_std_deviation_ms);
        phi(elapsed, mean, std)
    }

    /// Whether phi is below the threshold.
    pub fn is_available(&self, now: Duration) -> bool {
        self.phi(now) < self.threshold
    }
}

fn phi(elapsed: f64, mean: f64, std_deviation: f64) -> f64 {
    let y = (elapsed - mean) / std_deviation;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    if elapsed > mean {
        -(e / (1.0 + e)).log10()
    } else {
        -(1.0 - 1.0 / (1.0 + e)).log10()
    }
}
