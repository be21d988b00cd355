mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::TestDatabase;
use metricscollector::metrics::ContainerEnvelope;
use metricscollector::poller::PollingAppCollector;
use metricscollector::sink::{self, AppMetricStore, PostgresAppMetricStore, PostgresInstanceMetricStore};
use metricscollector::telemetry::{TelemetryConsumer, TelemetryError, TokenProvider};
use sqlx::migrate::Migrator;
use sqlx::Row;
use tokio::sync::mpsc;

async fn migrated_database(prefix: &str) -> Result<Option<TestDatabase>> {
    let database = match TestDatabase::create(prefix).await {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping test: failed to start postgres container ({err:?})");
            return Ok(None);
        }
    };

    let migrator = Migrator::new(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations")))
        .await
        .context("failed to load migrations")?;
    migrator
        .run(database.pool())
        .await
        .context("failed to run migrations")?;

    Ok(Some(database))
}

struct FixedTelemetry(Vec<ContainerEnvelope>);

#[async_trait::async_trait]
impl TelemetryConsumer for FixedTelemetry {
    async fn container_envelopes(
        &self,
        _app_id: &str,
        _bearer_token: &str,
    ) -> Result<Vec<ContainerEnvelope>, TelemetryError> {
        Ok(self.0.clone())
    }
}

struct StaticToken;
impl TokenProvider for StaticToken {
    fn current_token(&self) -> String {
        "tok".into()
    }
}

/// One poller tick should land matching rows in both the instance-metrics
/// and app-metrics tables, sharing the same timestamp, with the app metric
/// equal to the rounded mean of the instance values.
#[tokio::test(flavor = "multi_thread")]
async fn one_tick_persists_instance_rows_and_a_matching_app_average() -> Result<()> {
    let Some(database) = migrated_database("metrics_pipeline").await? else {
        return Ok(());
    };

    let instance_store = PostgresInstanceMetricStore::new(database.pool().clone());
    let (samples_tx, samples_rx) = mpsc::channel(16);
    let sink_join = tokio::spawn(sink::run_sink(instance_store, samples_rx));

    let app_store: Arc<dyn AppMetricStore> = Arc::new(PostgresAppMetricStore::new(database.pool().clone()));

    let telemetry = Arc::new(FixedTelemetry(vec![
        ContainerEnvelope { instance_index: 0, value: "100".into(), unit: "bytes".into() },
        ContainerEnvelope { instance_index: 1, value: "101".into(), unit: "bytes".into() },
        ContainerEnvelope { instance_index: 2, value: "102".into(), unit: "bytes".into() },
    ]));

    let poller = PollingAppCollector {
        app_id: "app-1".into(),
        collect_interval: Duration::from_secs(60),
        metric_name: "memoryused".into(),
        metric_unit: "bytes".into(),
        telemetry,
        token_provider: Arc::new(StaticToken),
        samples: samples_tx.clone(),
        app_metric_store: app_store,
    };

    // Exercise exactly one tick and drop the sender so the sink drains and closes.
    poller.tick().await;
    drop(samples_tx);
    drop(poller);
    sink_join.await.context("sink task panicked")?;

    let instance_rows = sqlx::query("SELECT instance_index, value, timestamp FROM instance_metrics WHERE app_id = $1 ORDER BY instance_index")
        .bind("app-1")
        .fetch_all(database.pool())
        .await?;
    assert_eq!(instance_rows.len(), 3);
    let instance_timestamp: i64 = instance_rows[0].get("timestamp");

    let app_row = sqlx::query("SELECT value, timestamp FROM app_metrics WHERE app_id = $1")
        .bind("app-1")
        .fetch_one(database.pool())
        .await?;
    let app_value: String = app_row.get("value");
    let app_timestamp: i64 = app_row.get("timestamp");

    assert_eq!(app_value, "101");
    assert_eq!(app_timestamp, instance_timestamp, "app metric and instance metrics share the tick timestamp");

    database.cleanup().await?;
    Ok(())
}

/// A tick with zero parseable envelopes must not write a divide-by-zero
/// average; the app metric row carries empty value/unit sentinels instead.
#[tokio::test(flavor = "multi_thread")]
async fn empty_tick_writes_sentinel_app_metric() -> Result<()> {
    let Some(database) = migrated_database("metrics_pipeline_empty").await? else {
        return Ok(());
    };

    let instance_store = PostgresInstanceMetricStore::new(database.pool().clone());
    let (samples_tx, samples_rx) = mpsc::channel(16);
    let sink_join = tokio::spawn(sink::run_sink(instance_store, samples_rx));

    let app_store: Arc<dyn AppMetricStore> = Arc::new(PostgresAppMetricStore::new(database.pool().clone()));
    let telemetry = Arc::new(FixedTelemetry(vec![]));

    let poller = PollingAppCollector {
        app_id: "app-empty".into(),
        collect_interval: Duration::from_secs(60),
        metric_name: "memoryused".into(),
        metric_unit: "bytes".into(),
        telemetry,
        token_provider: Arc::new(StaticToken),
        samples: samples_tx.clone(),
        app_metric_store: app_store,
    };

    poller.tick().await;
    drop(samples_tx);
    drop(poller);
    sink_join.await.context("sink task panicked")?;

    let app_row = sqlx::query("SELECT value, unit FROM app_metrics WHERE app_id = $1")
        .bind("app-empty")
        .fetch_one(database.pool())
        .await?;
    let value: String = app_row.get("value");
    let unit: String = app_row.get("unit");
    assert_eq!(value, "");
    assert_eq!(unit, "");

    database.cleanup().await?;
    Ok(())
}
