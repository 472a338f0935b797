//! Metrics collection for the hub
//!
//! In-process counters for error tracking, request accounting, and
//! operational insight. Counters are plain atomics behind maps so they
//! can be read without coordination with the hot path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::error::HubError;

/// Metrics collector for hub operations
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    /// Error counters by category
    error_counters: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
    /// Request counters by method
    request_counters: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
    /// Connection attempt counters by instance
    connection_counters: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
    /// Recovered panic count in worker callbacks
    recovered_panics: Arc<AtomicU64>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    async fn increment(map: &RwLock<HashMap<String, Arc<AtomicU64>>>, key: &str) {
        {
            let counters = map.read().await;
            if let Some(counter) = counters.get(key) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = map.write().await;
        counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error occurrence
    pub async fn record_error(&self, error: &HubError, context: &str) {
        let key = format!("errors:category={}:context={}", error.category(), context);
        Self::increment(&self.error_counters, &key).await;
        debug!(
            target: "hub_metrics",
            error_category = error.category(),
            error_context = context,
            "error recorded"
        );
    }

    /// Record a handled request by method
    pub async fn record_request(&self, method: &str) {
        let key = format!("requests:method={method}");
        Self::increment(&self.request_counters, &key).await;
    }

    /// Record a connection attempt
    pub async fn record_connection_attempt(&self, instance_id: &str, success: bool) {
        let key = format!("connections:instance={instance_id}:success={success}");
        Self::increment(&self.connection_counters, &key).await;
    }

    /// Record a panic recovered inside a worker callback
    pub fn record_recovered_panic(&self) {
        self.recovered_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of panics recovered so far
    pub fn recovered_panics(&self) -> u64 {
        self.recovered_panics.load(Ordering::Relaxed)
    }

    async fn snapshot(map: &RwLock<HashMap<String, Arc<AtomicU64>>>) -> HashMap<String, u64> {
        map.read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Snapshot of all counters
    pub async fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            errors: Self::snapshot(&self.error_counters).await,
            requests: Self::snapshot(&self.request_counters).await,
            connections: Self::snapshot(&self.connection_counters).await,
            recovered_panics: self.recovered_panics(),
        }
    }

    /// Reset all counters
    pub async fn reset(&self) {
        self.error_counters.write().await.clear();
        self.request_counters.write().await.clear();
        self.connection_counters.write().await.clear();
        self.recovered_panics.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of collected counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub errors: HashMap<String, u64>,
    pub requests: HashMap<String, u64>,
    pub connections: HashMap<String, u64>,
    pub recovered_panics: u64,
}

static GLOBAL_METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Process-wide metrics collector
pub fn global_metrics() -> &'static MetricsCollector {
    &GLOBAL_METRICS
}
