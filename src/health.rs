//! Health snapshot for the external health endpoint
//!
//! Combines the queue and memory views into one serializable snapshot with a
//! derived overall level. The surrounding HTTP layer serves this verbatim.

use crate::{Config, MemoryStats, QueueStats};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub pending: usize,
    pub processing: usize,
    pub available_slots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealth {
    pub usage_percent: f64,
    pub heap_used: u64,
    pub rss: u64,
    pub max_heap: u64,
    pub monitoring: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthLevel,
    pub queue: QueueHealth,
    pub memory: MemoryHealth,
    pub timestamp: DateTime<Utc>,
}

/// Derives the overall level from the component views: critical memory wins,
/// then a saturated pending queue or warning-level memory, else healthy.
pub fn evaluate(queue: &QueueStats, memory: &MemoryStats, config: &Config) -> HealthSnapshot {
    let usage_percent = memory
        .latest
        .as_ref()
        .map(|s| s.usage_percent)
        .unwrap_or(0.0);

    let queue_pressure = queue.pending as f64 >= config.max_pending_audits as f64 * 0.8;

    let status = if usage_percent >= config.memory.critical_threshold {
        HealthLevel::Critical
    } else if usage_percent >= config.memory.warning_threshold || queue_pressure {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    };

    HealthSnapshot {
        status,
        queue: QueueHealth {
            pending: queue.pending,
            processing: queue.processing,
            available_slots: queue.available_slots,
        },
        memory: MemoryHealth {
            usage_percent,
            heap_used: memory.latest.as_ref().map(|s| s.heap_used).unwrap_or(0),
            rss: memory.latest.as_ref().map(|s| s.rss).unwrap_or(0),
            max_heap: memory.max_heap,
            monitoring: memory.monitoring,
        },
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySample;

    fn queue_stats(pending: usize) -> QueueStats {
        QueueStats {
            pending,
            processing: 1,
            available_slots: 2,
            max_concurrent: 3,
            completed: 0,
            failed: 0,
        }
    }

    fn memory_stats(usage_percent: f64) -> MemoryStats {
        MemoryStats {
            latest: Some(MemorySample {
                timestamp: Utc::now(),
                heap_used: 1024,
                heap_total: 4096,
                rss: 2048,
                usage_percent,
            }),
            monitoring: true,
            sample_count: 1,
            peak_usage_percent: usage_percent,
            average_usage_percent: usage_percent,
            max_heap: 4096,
        }
    }

    #[test]
    fn healthy_when_quiet() {
        let config = Config::default();
        let snapshot = evaluate(&queue_stats(0), &memory_stats(10.0), &config);
        assert_eq!(snapshot.status, HealthLevel::Healthy);
        assert_eq!(snapshot.queue.available_slots, 2);
    }

    #[test]
    fn warning_on_memory_pressure() {
        let config = Config::default();
        let snapshot = evaluate(&queue_stats(0), &memory_stats(80.0), &config);
        assert_eq!(snapshot.status, HealthLevel::Warning);
    }

    #[test]
    fn warning_on_deep_pending_queue() {
        let config = Config::default();
        let snapshot = evaluate(&queue_stats(90), &memory_stats(10.0), &config);
        assert_eq!(snapshot.status, HealthLevel::Warning);
    }

    #[test]
    fn critical_memory_dominates() {
        let config = Config::default();
        let snapshot = evaluate(&queue_stats(90), &memory_stats(95.0), &config);
        assert_eq!(snapshot.status, HealthLevel::Critical);
    }

    #[test]
    fn missing_samples_read_as_zero() {
        let config = Config::default();
        let memory = MemoryStats {
            latest: None,
            monitoring: false,
            sample_count: 0,
            peak_usage_percent: 0.0,
            average_usage_percent: 0.0,
            max_heap: 4096,
        };
        let snapshot = evaluate(&queue_stats(0), &memory, &config);
        assert_eq!(snapshot.status, HealthLevel::Healthy);
        assert_eq!(snapshot.memory.usage_percent, 0.0);
    }
}
