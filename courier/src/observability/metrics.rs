//! In-process counters and gauges fed by the reporting hook

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Simple metrics collector
#[derive(Clone)]
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, AtomicU64>>>,
    gauges: Arc<RwLock<HashMap<String, AtomicU64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn increment_counter(&self, name: &str, value: u64) {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }
        // Another writer may have created it between the two locks.
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        {
            let gauges = self.gauges.read();
            if let Some(gauge) = gauges.get(name) {
                gauge.store(value, Ordering::Relaxed);
                return;
            }
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
    }

    pub fn get_gauge(&self, name: &str) -> Option<u64> {
        self.gauges
            .read()
            .get(name)
            .map(|gauge| gauge.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauges = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot { counters, gauges }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

pub mod metric_names {
    // Consumer
    pub const CONSUME_ATTEMPTS_TOTAL: &str = "consume_attempts_total";
    pub const CONSUME_ATTEMPT_FAILURES: &str = "consume_attempt_failures";
    pub const CONSUME_SUCCEEDED: &str = "consume_succeeded";
    pub const CONSUME_GAVE_UP: &str = "consume_gave_up";
    pub const CONSUME_ABANDONED: &str = "consume_abandoned";

    // Async producer
    pub const PUBLISH_DELIVERED: &str = "publish_delivered";
    pub const PUBLISH_FAILED: &str = "publish_failed";
    pub const PUBLISH_EXPIRED: &str = "publish_expired";
    pub const PUBLISH_UNMATCHED: &str = "publish_unmatched_acks";
    pub const PUBLISH_PENDING: &str = "publish_pending";
}
