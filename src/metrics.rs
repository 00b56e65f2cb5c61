//! Conversion metrics

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::strategy::Strategy;

/// Process-wide conversion counters
pub struct Metrics {
    pub total_conversions: AtomicU64,
    pub successful_conversions: AtomicU64,
    pub failed_conversions: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub timeouts: AtomicU64,

    // indexed by position in Strategy::ALL
    strategy_ok: [AtomicU64; 6],
    strategy_failed: [AtomicU64; 6],
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_conversion(&self, success: bool, latency_ms: u64) {
        self.total_conversions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_conversions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_conversions.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_strategy(&self, strategy: Strategy, success: bool, timed_out: bool) {
        let slot = strategy_index(strategy);
        if success {
            self.strategy_ok[slot].fetch_add(1, Ordering::Relaxed);
        } else {
            self.strategy_failed[slot].fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_conversions.load(Ordering::Relaxed);
        let successful = self.successful_conversions.load(Ordering::Relaxed);
        let failed = self.failed_conversions.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let strategies = Strategy::ALL
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (
                    s.name().to_string(),
                    StrategyCounts {
                        succeeded: self.strategy_ok[i].load(Ordering::Relaxed),
                        failed: self.strategy_failed[i].load(Ordering::Relaxed),
                    },
                )
            })
            .filter(|(_, c)| c.succeeded + c.failed > 0)
            .collect();

        MetricsSnapshot {
            total_conversions: total,
            successful_conversions: successful,
            failed_conversions: failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            timeouts: self.timeouts.load(Ordering::Relaxed),
            strategies,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            total_conversions: AtomicU64::new(0),
            successful_conversions: AtomicU64::new(0),
            failed_conversions: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            strategy_ok: Default::default(),
            strategy_failed: Default::default(),
        }
    }
}

fn strategy_index(strategy: Strategy) -> usize {
    Strategy::ALL.iter().position(|s| *s == strategy).unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_conversions: u64,
    pub successful_conversions: u64,
    pub failed_conversions: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub timeouts: u64,
    pub strategies: BTreeMap<String, StrategyCounts>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyCounts {
    pub succeeded: u64,
    pub failed: u64,
}

/// Timer for tracking operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rates() {
        let metrics = Metrics::new();
        metrics.record_conversion(true, 100);
        metrics.record_conversion(false, 300);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_conversions, 2);
        assert_eq!(snapshot.avg_latency_ms, 200);
        assert!((snapshot.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_strategy_table() {
        let metrics = Metrics::new();
        metrics.record_strategy(Strategy::ClassicDecoderDirect, false, true);
        metrics.record_strategy(Strategy::EmulationLayerHalfSize, true, false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.strategies.len(), 2);
        assert_eq!(
            snapshot.strategies["classic-direct"],
            StrategyCounts { succeeded: 0, failed: 1 }
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["strategies"]["emulation-half-size"]["succeeded"], 1);
    }
}
