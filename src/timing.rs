// =============================================================================
// Task Timing Registry — bounded duration samples per task name
// =============================================================================
//
// Every hot path (REST call, stream ingest, indicator run) records how long
// it took.  The registry keeps a bounded window of recent samples per task
// and summarises them for the status display.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;

/// Samples retained per task name.
const WINDOW: usize = 360;

/// Aggregate statistics over the retained window of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TimingSummary {
    pub task: String,
    pub count: usize,
    pub mean_secs: f64,
    pub median_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

/// Thread-safe registry of recent task durations.
pub struct TaskTimings {
    samples: RwLock<HashMap<String, VecDeque<f64>>>,
}

impl TaskTimings {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
        }
    }

    /// Record one duration sample (seconds) for `task`, evicting the oldest
    /// sample once the window is full.
    pub fn record(&self, task: &str, secs: f64) {
        let mut map = self.samples.write();
        let ring = map
            .entry(task.to_string())
            .or_insert_with(|| VecDeque::with_capacity(WINDOW));
        ring.push_back(secs);
        while ring.len() > WINDOW {
            ring.pop_front();
        }
    }

    /// Summarise every tracked task, sorted by task name for stable display.
    pub fn summaries(&self) -> Vec<TimingSummary> {
        let map = self.samples.read();
        let mut out: Vec<TimingSummary> = map
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(name, ring)| {
                let mut sorted: Vec<f64> = ring.iter().copied().collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let count = sorted.len();
                let mean = sorted.iter().sum::<f64>() / count as f64;
                let median = if count % 2 == 1 {
                    sorted[count / 2]
                } else {
                    (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
                };
                TimingSummary {
                    task: name.clone(),
                    count,
                    mean_secs: mean,
                    median_secs: median,
                    min_secs: sorted[0],
                    max_secs: sorted[count - 1],
                }
            })
            .collect();
        out.sort_by(|a, b| a.task.cmp(&b.task));
        out
    }
}

impl Default for TaskTimings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_compute_basic_stats() {
        let timings = TaskTimings::new();
        for v in [0.1, 0.2, 0.3, 0.4] {
            timings.record("ingest_candle", v);
        }
        let summaries = timings.summaries();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.task, "ingest_candle");
        assert_eq!(s.count, 4);
        assert!((s.mean_secs - 0.25).abs() < 1e-12);
        assert!((s.median_secs - 0.25).abs() < 1e-12);
        assert!((s.min_secs - 0.1).abs() < 1e-12);
        assert!((s.max_secs - 0.4).abs() < 1e-12);
    }

    #[test]
    fn window_evicts_oldest() {
        let timings = TaskTimings::new();
        for i in 0..(WINDOW + 10) {
            timings.record("rest_call", i as f64);
        }
        let s = &timings.summaries()[0];
        assert_eq!(s.count, WINDOW);
        // The first ten samples must have been evicted.
        assert!((s.min_secs - 10.0).abs() < 1e-12);
    }

    #[test]
    fn tasks_sorted_by_name() {
        let timings = TaskTimings::new();
        timings.record("zeta", 1.0);
        timings.record("alpha", 1.0);
        let names: Vec<String> = timings.summaries().into_iter().map(|s| s.task).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
