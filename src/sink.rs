//! Metric Sink Adapter: the single consumer of the fan-in sample channel,
//! persisting per-instance samples to the instance-metrics store.
//!
//! Per-application aggregates are appended directly by the
//! [`crate::poller::PollingAppCollector`] that computed them (see its module docs);
//! the sink only owns the `InstanceMetric` side of the channel.

use log::warn;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::metrics::{AppMetric, InstanceMetric};

#[derive(Debug, thiserror::Error)]
pub enum MetricStoreError {
    #[error("database error while {action}")]
    Database {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

#[async_trait::async_trait]
pub trait InstanceMetricStore: Send + Sync {
    async fn append(&self, metric: &InstanceMetric) -> Result<(), MetricStoreError>;
}

#[async_trait::async_trait]
pub trait AppMetricStore: Send + Sync {
    async fn append(&self, metric: &AppMetric) -> Result<(), MetricStoreError>;
}

pub struct PostgresInstanceMetricStore {
    pool: PgPool,
}

impl PostgresInstanceMetricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl InstanceMetricStore for PostgresInstanceMetricStore {
    async fn append(&self, metric: &InstanceMetric) -> Result<(), MetricStoreError> {
        sqlx::query(
            "INSERT INTO instance_metrics (app_id, instance_index, metric_name, value, unit, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&metric.app_id)
        .bind(metric.instance_index)
        .bind(&metric.metric_name)
        .bind(&metric.value)
        .bind(&metric.unit)
        .bind(metric.timestamp_ns)
        .execute(&self.pool)
        .await
        .map_err(|source| MetricStoreError::Database {
            action: "inserting instance metric",
            source,
        })?;
        Ok(())
    }
}

pub struct PostgresAppMetricStore {
    pool: PgPool,
}

impl PostgresAppMetricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AppMetricStore for PostgresAppMetricStore {
    async fn append(&self, metric: &AppMetric) -> Result<(), MetricStoreError> {
        sqlx::query(
            "INSERT INTO app_metrics (app_id, metric_name, value, unit, timestamp) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&metric.app_id)
        .bind(&metric.metric_name)
        .bind(&metric.value)
        .bind(&metric.unit)
        .bind(metric.timestamp_ns)
        .execute(&self.pool)
        .await
        .map_err(|source| MetricStoreError::Database {
            action: "inserting app metric",
            source,
        })?;
        Ok(())
    }
}

/// Drains the shared sample channel until every sender (one per live App
/// Poller) has dropped, persisting each sample as it arrives. Errors are
/// logged, never propagated — a slow or unavailable instance-metrics store
/// throttles collection via the channel's bounded buffer rather than
/// dropping data.
pub async fn run_sink<S: InstanceMetricStore>(store: S, mut samples: mpsc::Receiver<InstanceMetric>) {
    while let Some(sample) = samples.recv().await {
        if let Err(err) = store.append(&sample).await {
            warn!(
                "failed to persist instance metric for app {}: {err}",
                sample.app_id
            );
        }
    }
}
