use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use metricscollector::{
    config::Config,
    lease::{LeaseManager, LeaseManagerConfig},
    lock::PostgresLockStore,
    metrics::InstanceMetric,
    poller::{AppCollector, PollingAppCollector},
    registry::{PostgresPolicyStore, RegistryPoller},
    sink::{self, PostgresAppMetricStore, PostgresInstanceMetricStore},
    supervisor::Supervisor,
    telemetry::{HttpTelemetryConsumer, StaticTokenProvider, TelemetryConsumer, TokenProvider},
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Sample channel capacity: large enough to absorb a burst from several
/// App Pollers ticking in the same instant without the channel filling
/// and throttling collection under normal load.
const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "metricscollector", about = "Runs the application-autoscaler memory metrics collector")]
struct Cli {}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    let _cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;

    let app_pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the metrics database")?;

    let policy_pool = if config.policy_db_url == config.database_url {
        app_pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(config.max_db_connections)
            .connect(&config.policy_db_url)
            .await
            .context("failed to connect to the policy database")?
    };

    let lock_store = Arc::new(PostgresLockStore::new(app_pool.clone()));
    let (lease_manager, mut have_lease) = LeaseManager::new(
        lock_store,
        LeaseManagerConfig {
            owner: config.lock_owner.clone(),
            ttl_seconds: config.lock_ttl.as_secs() as i32,
            renew_interval: config.lock_renew_interval,
            retry_interval: config.lock_retry_interval,
        },
    );

    let (lease_stop_tx, lease_stop_rx) = oneshot::channel();
    let mut lease_stop_tx = Some(lease_stop_tx);
    let lease_task = tokio::spawn(lease_manager.run(lease_stop_rx));

    let telemetry: Arc<dyn TelemetryConsumer> = Arc::new(HttpTelemetryConsumer::new(
        reqwest::Client::new(),
        config.telemetry_base_url.clone(),
        config.metric_name.clone(),
    ));
    let token_provider: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(config.token.clone()));

    let mut active: Option<ActiveCollection> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let Some(tx) = lease_stop_tx.take() {
                    let _ = tx.send(());
                }
            }

            changed = have_lease.changed() => {
                if changed.is_err() {
                    break;
                }
                let has_lease = *have_lease.borrow();
                if has_lease && active.is_none() {
                    active = Some(start_collection(&config, policy_pool.clone(), app_pool.clone(), telemetry.clone(), token_provider.clone()));
                    info!("metricscollector.started");
                } else if !has_lease {
                    if let Some(collection) = active.take() {
                        collection.shutdown().await;
                    }
                }
            }
        }
    }

    if let Some(collection) = active.take() {
        collection.shutdown().await;
    }

    match lease_task.await.context("lease manager task panicked")? {
        Ok(()) => Ok(()),
        Err(lost) => {
            error!("exiting after losing a held lease: {lost}");
            std::process::exit(1);
        }
    }
}

/// Everything spawned while the lease is held: the registry poller, the
/// supervisor and the sink adapter. Torn down in the order spec'd for
/// loss-of-lease / interrupt: supervisor (and every app poller) first,
/// then the registry poller, then the sink drains and closes.
struct ActiveCollection {
    registry_stop: oneshot::Sender<()>,
    registry_join: JoinHandle<()>,
    supervisor_stop: oneshot::Sender<()>,
    supervisor_join: JoinHandle<()>,
    sink_join: JoinHandle<()>,
}

impl ActiveCollection {
    async fn shutdown(self) {
        let _ = self.supervisor_stop.send(());
        let _ = self.supervisor_join.await;
        let _ = self.registry_stop.send(());
        let _ = self.registry_join.await;
        let _ = self.sink_join.await;
    }
}

fn start_collection(
    config: &Config,
    policy_pool: sqlx::PgPool,
    metrics_pool: sqlx::PgPool,
    telemetry: Arc<dyn TelemetryConsumer>,
    token_provider: Arc<dyn TokenProvider>,
) -> ActiveCollection {
    let (samples_tx, samples_rx) = mpsc::channel::<InstanceMetric>(SAMPLE_CHANNEL_CAPACITY);

    let instance_store = PostgresInstanceMetricStore::new(metrics_pool.clone());
    let sink_join = tokio::spawn(sink::run_sink(instance_store, samples_rx));

    let app_metric_store: Arc<dyn metricscollector::sink::AppMetricStore> =
        Arc::new(PostgresAppMetricStore::new(metrics_pool));

    let collect_interval = config.app_collect_interval;
    let metric_name = config.metric_name.clone();
    let metric_unit = config.metric_unit.clone();

    let factory: metricscollector::supervisor::CollectorFactory = Box::new(move |app_id: &str| {
        let collector = PollingAppCollector {
            app_id: app_id.to_string(),
            collect_interval,
            metric_name: metric_name.clone(),
            metric_unit: metric_unit.clone(),
            telemetry: telemetry.clone(),
            token_provider: token_provider.clone(),
            samples: samples_tx.clone(),
            app_metric_store: app_metric_store.clone(),
        };
        Box::new(collector) as Box<dyn AppCollector>
    });

    let supervisor = Supervisor::new(factory);
    let (supervisor_events_tx, supervisor_events_rx) = mpsc::channel(64);
    let (supervisor_stop, supervisor_stop_rx) = oneshot::channel();
    let supervisor_join = tokio::spawn(supervisor.run(supervisor_events_rx, supervisor_stop_rx));

    let policy_store = PostgresPolicyStore::new(policy_pool);
    let registry_poller = RegistryPoller::new(
        policy_store,
        config.registry_refresh_interval,
        supervisor_events_tx,
    );
    let (registry_stop, registry_stop_rx) = oneshot::channel();
    let registry_join = tokio::spawn(registry_poller.run(registry_stop_rx));

    ActiveCollection {
        registry_stop,
        registry_join,
        supervisor_stop,
        supervisor_join,
        sink_join,
    }
}
