//! Per-endpoint Performance Record ring buffer (§3, §9): a bounded history
//! of recent tool calls with derived aggregates.
//!
//! Grounded in the teacher's bounded `VecDeque<LogEntry>` log store
//! (`commands.rs::AppState::log_store`), generalized from "last N log lines"
//! to "last N tool-call outcomes".

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

const MAX_RECORDS: usize = 100;

/// `ts` is `chrono::DateTime<Utc>` rather than a bare `SystemTime`, the same
/// conversion the teacher's `connection.rs` applies before handing a
/// timestamp to anything that gets serialized or displayed.
#[derive(Debug, Clone)]
pub struct PerfRecord {
    pub tool_name: String,
    pub duration: Duration,
    pub success: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PerfAggregate {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub avg: Option<Duration>,
    pub success_rate: f64,
}

/// Bounded ring buffer of the most recent `MAX_RECORDS` tool-call outcomes.
#[derive(Debug, Default)]
pub struct PerfHistory {
    records: VecDeque<PerfRecord>,
}

impl PerfHistory {
    pub fn push(&mut self, record: PerfRecord) {
        if self.records.len() == MAX_RECORDS {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PerfRecord> {
        self.records.iter()
    }

    pub fn aggregate(&self) -> PerfAggregate {
        if self.records.is_empty() {
            return PerfAggregate::default();
        }

        let total_calls = self.records.len() as u64;
        let successes = self.records.iter().filter(|r| r.success).count() as u64;
        let failures = total_calls - successes;
        let min = self.records.iter().map(|r| r.duration).min();
        let max = self.records.iter().map(|r| r.duration).max();
        let sum: Duration = self.records.iter().map(|r| r.duration).sum();
        let avg = Some(sum / total_calls as u32);
        let success_rate = successes as f64 / total_calls as f64;

        PerfAggregate {
            total_calls,
            successes,
            failures,
            min,
            max,
            avg,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ms: u64, success: bool) -> PerfRecord {
        PerfRecord {
            tool_name: "calc__add".to_string(),
            duration: Duration::from_millis(ms),
            success,
            ts: Utc::now(),
        }
    }

    #[test]
    fn ring_buffer_caps_at_100() {
        let mut history = PerfHistory::default();
        for i in 0..150 {
            history.push(record(i, true));
        }
        assert_eq!(history.len(), 100);
    }

    #[test]
    fn aggregate_computes_min_max_avg_success_rate() {
        let mut history = PerfHistory::default();
        history.push(record(10, true));
        history.push(record(20, false));
        history.push(record(30, true));

        let agg = history.aggregate();
        assert_eq!(agg.total_calls, 3);
        assert_eq!(agg.successes, 2);
        assert_eq!(agg.failures, 1);
        assert_eq!(agg.min, Some(Duration::from_millis(10)));
        assert_eq!(agg.max, Some(Duration::from_millis(30)));
        assert_eq!(agg.avg, Some(Duration::from_millis(20)));
        assert!((agg.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_history_aggregate_is_zeroed() {
        let history = PerfHistory::default();
        let agg = history.aggregate();
        assert_eq!(agg.total_calls, 0);
        assert_eq!(agg.success_rate, 0.0);
    }
}
