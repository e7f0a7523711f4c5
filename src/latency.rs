//! Per-model latency statistics over a bounded sample window.
//!
//! Each model keeps a fixed-capacity ring of recent samples; once full, the
//! oldest sample is evicted. This gives a bounded, O(1) memory footprint per
//! model regardless of request volume. Samples beyond the outlier threshold
//! (a stuck connection, a retry storm) are rejected outright so they cannot
//! smear the percentiles.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

/// Default number of samples retained per model.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// Default rejection threshold for implausible latencies.
pub const DEFAULT_OUTLIER_THRESHOLD_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    latency_ms: u64,
    output_tokens: u64,
}

/// Aggregate statistics for one model's current window.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    /// Mean of per-sample `tokens / seconds`. Samples with zero tokens
    /// contribute zero; a zero-millisecond sample with tokens contributes
    /// infinity.
    pub tokens_per_second: f64,
}

/// Concurrent per-model sample windows.
pub struct LatencyTracker {
    enabled: bool,
    window_size: usize,
    outlier_threshold_ms: u64,
    samples: DashMap<String, VecDeque<LatencySample>>,
}

impl LatencyTracker {
    pub fn new(enabled: bool) -> Self {
        Self::with_window(enabled, DEFAULT_WINDOW_SIZE, DEFAULT_OUTLIER_THRESHOLD_MS)
    }

    pub fn with_window(enabled: bool, window_size: usize, outlier_threshold_ms: u64) -> Self {
        Self {
            enabled,
            window_size: window_size.max(1),
            outlier_threshold_ms,
            samples: DashMap::new(),
        }
    }

    /// Record one observation. Disabled trackers and outliers are ignored.
    pub fn record_latency(&self, model: &str, latency_ms: i64, output_tokens: u64) {
        if !self.enabled || latency_ms < 0 {
            return;
        }
        let latency_ms = latency_ms as u64;
        if latency_ms > self.outlier_threshold_ms {
            return;
        }
        let mut window = self.samples.entry(model.to_string()).or_default();
        if window.len() == self.window_size {
            window.pop_front();
        }
        window.push_back(LatencySample { latency_ms, output_tokens });
    }

    /// Stats for one model, or `None` when it has no samples.
    pub fn get_latency_stats(&self, model: &str) -> Option<LatencyStats> {
        let window = self.samples.get(model)?;
        stats_of(&window)
    }

    /// Stats for every model with at least one sample.
    pub fn get_all_latency_stats(&self) -> Vec<(String, LatencyStats)> {
        let mut all: Vec<(String, LatencyStats)> = self
            .samples
            .iter()
            .filter_map(|entry| stats_of(entry.value()).map(|stats| (entry.key().clone(), stats)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop samples for one model, or for every model when `model` is `None`.
    pub fn reset_latency(&self, model: Option<&str>) {
        match model {
            Some(m) => {
                self.samples.remove(m);
            }
            None => self.samples.clear(),
        }
    }
}

fn stats_of(window: &VecDeque<LatencySample>) -> Option<LatencyStats> {
    if window.is_empty() {
        return None;
    }

    let count = window.len();
    let sum: u64 = window.iter().map(|s| s.latency_ms).sum();
    let avg = sum as f64 / count as f64;

    let mut sorted: Vec<u64> = window.iter().map(|s| s.latency_ms).collect();
    sorted.sort_unstable();

    let tokens_per_second = window
        .iter()
        .map(|s| {
            if s.output_tokens == 0 {
                0.0
            } else {
                s.output_tokens as f64 / (s.latency_ms as f64 / 1000.0)
            }
        })
        .sum::<f64>()
        / count as f64;

    Some(LatencyStats {
        count,
        avg,
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        tokens_per_second,
    })
}

/// Rank-based percentile over a sorted slice: `rank = p/100 × n`. An exact
/// rank selects that sample; a fractional rank takes the midpoint of the two
/// straddling samples.
fn percentile(sorted: &[u64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    let rank = p / 100.0 * n as f64;
    if rank <= 1.0 {
        return sorted[0] as f64;
    }
    if rank.fract() == 0.0 {
        sorted[rank as usize - 1] as f64
    } else {
        let lo = rank.floor() as usize;
        let hi = (rank.ceil() as usize).min(n);
        (sorted[lo - 1] as f64 + sorted[hi - 1] as f64) / 2.0
    }
}
