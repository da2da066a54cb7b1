use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;

pub struct Metrics {
    pub audits_completed: Counter,
    pub audits_failed: Counter,
    pub audits_deduplicated: Counter,
    pub audit_duration: Histogram,
    pub queue_depth: Gauge,
    pub active_audits: Gauge,
    pub memory_usage: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            audits_completed: Counter::noop(),
            audits_failed: Counter::noop(),
            audits_deduplicated: Counter::noop(),
            audit_duration: Histogram::noop(),
            queue_depth: Gauge::noop(),
            active_audits: Gauge::noop(),
            memory_usage: Gauge::noop(),
        }
    }

    pub fn record_audit(&self, duration: Duration, success: bool) {
        if success {
            self.audits_completed.increment(1);
        } else {
            self.audits_failed.increment(1);
        }

        self.audit_duration.record(duration.as_secs_f64());
    }

    pub fn record_dedup(&self) {
        self.audits_deduplicated.increment(1);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn set_active_audits(&self, count: usize) {
        self.active_audits.set(count as f64);
    }

    pub fn record_memory_usage(&self, bytes: u64) {
        self.memory_usage.set(bytes as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
