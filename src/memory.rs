//! Memory watchdog with pressure-triggered cleanup callbacks
//!
//! An independent periodic sampler reads process memory into a bounded ring
//! buffer. Crossing the warning threshold fires every registered cleanup
//! callback; crossing the critical threshold additionally requests a forced
//! collection, which on this runtime is a logged no-op since Rust exposes no
//! collector to invoke. Callbacks must be idempotent: sustained pressure
//! fires them on every elevated sample.

use crate::{MemorySettings, Metrics};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub heap_used: u64,
    pub heap_total: u64,
    pub rss: u64,
    pub usage_percent: f64,
}

/// Summary surfaced through the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub latest: Option<MemorySample>,
    pub monitoring: bool,
    pub sample_count: usize,
    pub peak_usage_percent: f64,
    pub average_usage_percent: f64,
    pub max_heap: u64,
}

type CleanupFn = Box<dyn Fn() + Send + Sync>;

struct MonitorShared {
    settings: MemorySettings,
    history: Mutex<VecDeque<MemorySample>>,
    cleanups: Mutex<Vec<(String, CleanupFn)>>,
    monitoring: AtomicBool,
    metrics: Arc<Metrics>,
}

pub struct MemoryMonitor {
    shared: Arc<MonitorShared>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(settings: MemorySettings, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                settings,
                history: Mutex::new(VecDeque::new()),
                cleanups: Mutex::new(Vec::new()),
                monitoring: AtomicBool::new(false),
                metrics,
            }),
            sampler: Mutex::new(None),
        }
    }

    /// Starts the periodic sampler. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock().unwrap();
        if sampler.is_some() {
            return;
        }

        let shared = self.shared.clone();
        shared.monitoring.store(true, Ordering::Relaxed);
        let interval = shared.settings.sample_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while shared.monitoring.load(Ordering::Relaxed) {
                ticker.tick().await;
                let sample = read_process_memory(shared.settings.max_heap);
                Self::ingest_into(&shared, sample);
            }
        });

        *sampler = Some(handle);
        info!("memory monitor started (interval {:?})", interval);
    }

    /// Registers a named, idempotent cleanup callback fired under pressure.
    pub fn register_cleanup<F>(&self, name: &str, cleanup: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut cleanups = self.shared.cleanups.lock().unwrap();
        cleanups.push((name.to_string(), Box::new(cleanup)));
        debug!(name, "registered memory cleanup callback");
    }

    /// Feeds one sample through the threshold logic. Public so pressure
    /// handling can be driven with synthetic samples in tests.
    pub fn ingest_sample(&self, sample: MemorySample) {
        Self::ingest_into(&self.shared, sample);
    }

    fn ingest_into(shared: &MonitorShared, sample: MemorySample) {
        shared.metrics.record_memory_usage(sample.rss);

        {
            let mut history = shared.history.lock().unwrap();
            history.push_back(sample.clone());
            while history.len() > shared.settings.history_size {
                history.pop_front();
            }
        }

        if sample.usage_percent >= shared.settings.critical_threshold {
            warn!(
                usage_percent = sample.usage_percent,
                rss = sample.rss,
                "memory critical, running cleanups and requesting collection"
            );
            Self::run_cleanups(shared);
            // No runtime hook to force a collection here; record the request
            // so operators can correlate pressure with the log stream.
            info!("forced collection requested: no-op on this runtime");
        } else if sample.usage_percent >= shared.settings.warning_threshold {
            warn!(
                usage_percent = sample.usage_percent,
                rss = sample.rss,
                "memory warning threshold crossed, running cleanups"
            );
            Self::run_cleanups(shared);
        }
    }

    fn run_cleanups(shared: &MonitorShared) {
        let cleanups = shared.cleanups.lock().unwrap();
        for (name, cleanup) in cleanups.iter() {
            debug!(name, "running memory cleanup callback");
            cleanup();
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let history = self.shared.history.lock().unwrap();
        let latest = history.back().cloned();
        let peak = history
            .iter()
            .map(|s| s.usage_percent)
            .fold(0.0_f64, f64::max);
        let average = if history.is_empty() {
            0.0
        } else {
            history.iter().map(|s| s.usage_percent).sum::<f64>() / history.len() as f64
        };

        MemoryStats {
            latest,
            monitoring: self.shared.monitoring.load(Ordering::Relaxed),
            sample_count: history.len(),
            peak_usage_percent: peak,
            average_usage_percent: average,
            max_heap: self.shared.settings.max_heap,
        }
    }

    /// Stops the sampler. Safe to call multiple times.
    pub fn shutdown(&self) {
        self.shared.monitoring.store(false, Ordering::Relaxed);
        let mut sampler = self.sampler.lock().unwrap();
        if let Some(handle) = sampler.take() {
            handle.abort();
            info!("memory monitor stopped");
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a sample from `/proc/self/status` (Linux). VmRSS approximates the
/// resident footprint and VmData the heap share; on platforms without procfs
/// both read as zero and thresholds simply never fire.
pub fn read_process_memory(max_heap: u64) -> MemorySample {
    let mut rss = 0_u64;
    let mut heap_used = 0_u64;

    if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
        for line in content.lines() {
            if let Some(kb) = parse_status_line(line, "VmRSS:") {
                rss = kb * 1024;
            } else if let Some(kb) = parse_status_line(line, "VmData:") {
                heap_used = kb * 1024;
            }
        }
    }

    let usage_percent = if max_heap > 0 {
        (rss as f64 / max_heap as f64) * 100.0
    } else {
        0.0
    };

    MemorySample {
        timestamp: Utc::now(),
        heap_used,
        heap_total: max_heap,
        rss,
        usage_percent,
    }
}

fn parse_status_line(line: &str, field: &str) -> Option<u64> {
    if !line.starts_with(field) {
        return None;
    }
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample(usage_percent: f64) -> MemorySample {
        MemorySample {
            timestamp: Utc::now(),
            heap_used: 0,
            heap_total: 100,
            rss: usage_percent as u64,
            usage_percent,
        }
    }

    fn monitor() -> MemoryMonitor {
        MemoryMonitor::new(MemorySettings::default(), Arc::new(Metrics::new()))
    }

    #[test]
    fn warning_sample_fires_every_cleanup() {
        let monitor = monitor();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        monitor.register_cleanup("first", move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = second.clone();
        monitor.register_cleanup("second", move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        monitor.ingest_sample(sample(80.0));

        assert_eq!(first.load(Ordering::Relaxed), 1);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn normal_sample_fires_nothing() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        monitor.register_cleanup("noop", move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        monitor.ingest_sample(sample(10.0));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn sustained_pressure_refires_cleanups() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        monitor.register_cleanup("sweep", move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        monitor.ingest_sample(sample(80.0));
        monitor.ingest_sample(sample(95.0));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn history_is_bounded() {
        let settings = MemorySettings {
            history_size: 4,
            ..Default::default()
        };
        let monitor = MemoryMonitor::new(settings, Arc::new(Metrics::new()));

        for i in 0..10 {
            monitor.ingest_sample(sample(i as f64));
        }

        let stats = monitor.stats();
        assert_eq!(stats.sample_count, 4);
        assert_eq!(stats.latest.unwrap().usage_percent, 9.0);
        assert_eq!(stats.peak_usage_percent, 9.0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let monitor = monitor();
        monitor.start();
        monitor.shutdown();
        monitor.shutdown();
        assert!(!monitor.stats().monitoring);
    }
}
