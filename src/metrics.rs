//! Heartbeat metrics sink.
//!
//! Every accepted heartbeat appends an immutable sample. The production
//! time-series store is an external collaborator behind [`MetricsSink`];
//! the in-memory sink keeps a bounded window per worker for local
//! inspection.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::registry::WorkerMetrics;

/// One heartbeat's worth of worker metrics.
#[derive(Debug, Clone)]
pub struct MetricsSample {
    pub worker_id: String,
    pub metrics: WorkerMetrics,
    pub observed_at: DateTime<Utc>,
}

/// Append-only sink for heartbeat metrics samples.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_sample(&self, sample: MetricsSample);
}

/// Keeps the most recent samples per worker in memory.
pub struct MemoryMetricsSink {
    window: usize,
    samples: RwLock<HashMap<String, VecDeque<MetricsSample>>>,
}

impl MemoryMetricsSink {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub async fn samples_for(&self, worker_id: &str) -> Vec<MetricsSample> {
        self.samples
            .read()
            .await
            .get(worker_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryMetricsSink {
    fn default() -> Self {
        Self::new(120)
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn record_sample(&self, sample: MetricsSample) {
        let mut samples = self.samples.write().await;
        let queue = samples.entry(sample.worker_id.clone()).or_default();
        if queue.len() == self.window {
            queue.pop_front();
        }
        queue.push_back(sample);
    }
}
