//! Performance tracking for tool executions.
//!
//! Keeps a bounded sample history (10 000 entries) and a per-tool buffer
//! of the 100 most recent durations for rolling averages. Losing an
//! occasional sample under contention is acceptable; the monitor is a
//! single writer per execution with periodic snapshot reads.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Cap on retained samples.
const MAX_SAMPLES: usize = 10_000;

/// Cap on per-tool recent durations.
const MAX_RECENT_DURATIONS: usize = 100;

/// Rolling window for averages.
const ROLLING_WINDOW_HOURS: i64 = 24;

/// One recorded execution.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub tool_id: String,
    pub start: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub result_size_bytes: Option<u64>,
}

/// Aggregate stats per tool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub total_executions: u64,
    pub successful: u64,
    pub failed: u64,
    pub error_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Default)]
struct ToolCounters {
    total: u64,
    successful: u64,
    failed: u64,
    recent_durations: VecDeque<u64>,
}

/// Process-wide execution metrics.
#[derive(Default)]
pub struct PerformanceMonitor {
    inner: Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    samples: VecDeque<PerformanceSample>,
    counters: HashMap<String, ToolCounters>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one execution.
    pub fn record(
        &self,
        tool_id: &str,
        duration_ms: u64,
        success: bool,
        error: Option<String>,
        result_size_bytes: Option<u64>,
    ) {
        let Ok(mut state) = self.inner.lock() else {
            // A poisoned lock only loses this sample.
            return;
        };

        state.samples.push_back(PerformanceSample {
            tool_id: tool_id.to_string(),
            start: Utc::now(),
            duration_ms,
            success,
            error,
            result_size_bytes,
        });
        while state.samples.len() > MAX_SAMPLES {
            state.samples.pop_front();
        }

        let counters = state.counters.entry(tool_id.to_string()).or_default();
        counters.total += 1;
        if success {
            counters.successful += 1;
        } else {
            counters.failed += 1;
        }
        counters.recent_durations.push_back(duration_ms);
        while counters.recent_durations.len() > MAX_RECENT_DURATIONS {
            counters.recent_durations.pop_front();
        }
    }

    /// Aggregate stats for one tool.
    ///
    /// `total == successful + failed`; `error_rate` is 0 when no
    /// executions have been recorded.
    pub fn tool_stats(&self, tool_id: &str) -> ToolStats {
        let Ok(state) = self.inner.lock() else {
            return ToolStats::default();
        };
        let Some(counters) = state.counters.get(tool_id) else {
            return ToolStats::default();
        };

        let average = if counters.recent_durations.is_empty() {
            0.0
        } else {
            counters.recent_durations.iter().sum::<u64>() as f64
                / counters.recent_durations.len() as f64
        };

        ToolStats {
            total_executions: counters.total,
            successful: counters.successful,
            failed: counters.failed,
            error_rate: if counters.total > 0 {
                counters.failed as f64 / counters.total as f64
            } else {
                0.0
            },
            average_duration_ms: average,
        }
    }

    /// Stats for every tool with at least one recorded execution.
    pub fn all_stats(&self) -> HashMap<String, ToolStats> {
        let Ok(state) = self.inner.lock() else {
            return HashMap::new();
        };
        state
            .counters
            .keys()
            .map(|tool_id| {
                let counters = &state.counters[tool_id];
                let average = if counters.recent_durations.is_empty() {
                    0.0
                } else {
                    counters.recent_durations.iter().sum::<u64>() as f64
                        / counters.recent_durations.len() as f64
                };
                (
                    tool_id.clone(),
                    ToolStats {
                        total_executions: counters.total,
                        successful: counters.successful,
                        failed: counters.failed,
                        error_rate: if counters.total > 0 {
                            counters.failed as f64 / counters.total as f64
                        } else {
                            0.0
                        },
                        average_duration_ms: average,
                    },
                )
            })
            .collect()
    }

    /// Samples recorded within the rolling 24 h window.
    pub fn recent_samples(&self) -> Vec<PerformanceSample> {
        let cutoff = Utc::now() - chrono::Duration::hours(ROLLING_WINDOW_HOURS);
        let Ok(state) = self.inner.lock() else {
            return Vec::new();
        };
        state
            .samples
            .iter()
            .filter(|sample| sample.start >= cutoff)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_sum_invariant() {
        let monitor = PerformanceMonitor::new();
        monitor.record("t", 100, true, None, None);
        monitor.record("t", 200, false, Some("boom".to_string()), None);
        monitor.record("t", 300, true, None, Some(42));

        let stats = monitor.tool_stats("t");
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.successful + stats.failed, stats.total_executions);
        assert!((stats.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((stats.average_duration_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_tool_has_zero_stats() {
        let monitor = PerformanceMonitor::new();
        let stats = monitor.tool_stats("missing");
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.error_rate, 0.0);
    }

    #[test]
    fn test_recent_duration_buffer_capped() {
        let monitor = PerformanceMonitor::new();
        for i in 0..250 {
            monitor.record("t", i, true, None, None);
        }
        let stats = monitor.tool_stats("t");
        assert_eq!(stats.total_executions, 250);
        // Average over the last 100 samples only: 150..249.
        assert!((stats.average_duration_ms - 199.5).abs() < 1e-9);
    }

    #[test]
    fn test_sample_history_capped() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..(MAX_SAMPLES + 500) {
            monitor.record("t", 1, true, None, None);
        }
        assert!(monitor.recent_samples().len() <= MAX_SAMPLES);
    }

    #[test]
    fn test_all_stats_lists_tools() {
        let monitor = PerformanceMonitor::new();
        monitor.record("a", 10, true, None, None);
        monitor.record("b", 20, false, None, None);
        let all = monitor.all_stats();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"].failed, 1);
    }
}
