//! App Poller: one instance per application, polling container envelopes on
//! a fixed cadence and emitting both per-instance samples and a
//! per-application aggregate.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::metrics::{now_ns, rounded_mean, AppMetric, InstanceMetric};
use crate::sink::AppMetricStore;
use crate::telemetry::{TelemetryConsumer, TokenProvider};

const FETCH_ATTEMPTS: u32 = 3;

/// Capability boundary for "how this app's instances get collected". The
/// polling implementation below is the only one specified here; a future
/// streaming implementation can share the same sample channel and stop
/// protocol by implementing this trait.
pub trait AppCollector: Send {
    fn spawn(self: Box<Self>) -> PollerHandle;
}

pub struct PollerHandle {
    pub(crate) stop_tx: oneshot::Sender<()>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

impl PollerHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.join.await;
    }
}

pub struct PollingAppCollector {
    pub app_id: String,
    pub collect_interval: Duration,
    pub metric_name: String,
    /// Fallback unit used when an envelope doesn't report one of its own;
    /// configured once per process (see [`crate::config::Config::metric_unit`]).
    pub metric_unit: String,
    pub telemetry: Arc<dyn TelemetryConsumer>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub samples: mpsc::Sender<InstanceMetric>,
    pub app_metric_store: Arc<dyn AppMetricStore>,
}

impl AppCollector for PollingAppCollector {
    fn spawn(self: Box<Self>) -> PollerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(stop_rx));
        PollerHandle { stop_tx, join }
    }
}

impl PollingAppCollector {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        loop {
            if stop.try_recv().is_ok() {
                return;
            }
            self.tick().await;

            tokio::select! {
                biased;
                _ = &mut stop => return,
                _ = sleep(self.collect_interval) => {}
            }
        }
    }

    pub async fn tick(&self) {
        let timestamp_ns = now_ns();

        let envelopes = match self.fetch_with_retries().await {
            Some(envelopes) => envelopes,
            None => {
                error!(
                    "telemetry fetch failed {FETCH_ATTEMPTS} times for app {}; skipping tick",
                    self.app_id
                );
                return;
            }
        };

        let mut numeric_values = Vec::with_capacity(envelopes.len());
        let mut unit = String::new();

        for envelope in &envelopes {
            let envelope_unit = if envelope.unit.is_empty() {
                self.metric_unit.clone()
            } else {
                envelope.unit.clone()
            };
            if unit.is_empty() {
                unit = envelope_unit.clone();
            }

            let sample = InstanceMetric {
                app_id: self.app_id.clone(),
                instance_index: envelope.instance_index,
                metric_name: self.metric_name.clone(),
                value: envelope.value.clone(),
                unit: envelope_unit,
                timestamp_ns,
            };
            if self.samples.send(sample).await.is_err() {
                warn!("sample channel closed while publishing for app {}", self.app_id);
                return;
            }

            match envelope.value.parse::<i64>() {
                Ok(value) => numeric_values.push(value as f64),
                Err(_) => warn!(
                    "envelope for app {} instance {} failed to parse as an integer: {:?}",
                    self.app_id, envelope.instance_index, envelope.value
                ),
            }
        }

        let app_metric = match rounded_mean(&numeric_values) {
            Some(mean) => AppMetric {
                app_id: self.app_id.clone(),
                metric_name: self.metric_name.clone(),
                value: mean.to_string(),
                unit,
                timestamp_ns,
            },
            None => AppMetric::empty(self.app_id.clone(), self.metric_name.clone(), timestamp_ns),
        };

        if let Err(err) = self.app_metric_store.append(&app_metric).await {
            warn!("failed to persist app metric for {}: {err}", self.app_id);
        }
    }

    async fn fetch_with_retries(&self) -> Option<Vec<crate::metrics::ContainerEnvelope>> {
        let token = self.token_provider.current_token();
        let bearer = format!("Bearer {token}");
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.telemetry.container_envelopes(&self.app_id, &bearer).await {
                Ok(envelopes) => return Some(envelopes),
                Err(err) => {
                    warn!(
                        "telemetry fetch attempt {attempt}/{FETCH_ATTEMPTS} failed for app {}: {err}",
                        self.app_id
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ContainerEnvelope;
    use crate::sink::MetricStoreError;
    use crate::telemetry::TelemetryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedTelemetry {
        envelopes: Vec<ContainerEnvelope>,
        fail_times: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TelemetryConsumer for FixedTelemetry {
        async fn container_envelopes(
            &self,
            _app_id: &str,
            _bearer_token: &str,
        ) -> Result<Vec<ContainerEnvelope>, TelemetryError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(TelemetryError::Status(reqwest::StatusCode::BAD_GATEWAY));
            }
            Ok(self.envelopes.clone())
        }
    }

    struct StaticToken;
    impl TokenProvider for StaticToken {
        fn current_token(&self) -> String {
            "tok".into()
        }
    }

    struct RecordingAppStore {
        last: Mutex<Option<AppMetric>>,
    }

    #[async_trait::async_trait]
    impl AppMetricStore for RecordingAppStore {
        async fn append(&self, metric: &AppMetric) -> Result<(), MetricStoreError> {
            *self.last.lock().unwrap() = Some(metric.clone());
            Ok(())
        }
    }

    fn envelope(idx: i32, value: &str) -> ContainerEnvelope {
        ContainerEnvelope {
            instance_index: idx,
            value: value.to_string(),
            unit: "bytes".to_string(),
        }
    }

    #[tokio::test]
    async fn tick_computes_rounded_mean_and_publishes_samples() {
        let telemetry = Arc::new(FixedTelemetry {
            envelopes: vec![envelope(0, "100"), envelope(1, "101"), envelope(2, "102")],
            fail_times: AtomicUsize::new(0),
        });
        let app_store = Arc::new(RecordingAppStore { last: Mutex::new(None) });
        let (tx, mut rx) = mpsc::channel(16);

        let poller = PollingAppCollector {
            app_id: "app-1".into(),
            collect_interval: Duration::from_secs(60),
            metric_name: "memoryused".into(),
            metric_unit: "bytes".into(),
            telemetry,
            token_provider: Arc::new(StaticToken),
            samples: tx,
            app_metric_store: app_store.clone(),
        };

        poller.tick().await;

        let mut received = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            received.push(sample);
        }
        assert_eq!(received.len(), 3);

        let persisted = app_store.last.lock().unwrap().clone().unwrap();
        assert_eq!(persisted.value, "101");
        assert_eq!(persisted.unit, "bytes");
    }

    #[tokio::test]
    async fn partial_parse_failure_excludes_sample_from_mean_but_still_publishes_it() {
        let telemetry = Arc::new(FixedTelemetry {
            envelopes: vec![envelope(0, "100"), envelope(1, "not-a-number"), envelope(2, "102")],
            fail_times: AtomicUsize::new(0),
        });
        let app_store = Arc::new(RecordingAppStore { last: Mutex::new(None) });
        let (tx, mut rx) = mpsc::channel(16);

        let poller = PollingAppCollector {
            app_id: "app-1".into(),
            collect_interval: Duration::from_secs(60),
            metric_name: "memoryused".into(),
            metric_unit: "bytes".into(),
            telemetry,
            token_provider: Arc::new(StaticToken),
            samples: tx,
            app_metric_store: app_store.clone(),
        };

        poller.tick().await;

        let mut received = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            received.push(sample);
        }
        assert_eq!(received.len(), 3, "malformed envelope is still published");

        let persisted = app_store.last.lock().unwrap().clone().unwrap();
        assert_eq!(persisted.value, "101", "mean of just 100 and 102");
    }

    #[tokio::test]
    async fn all_envelopes_unparseable_yields_empty_app_metric() {
        let telemetry = Arc::new(FixedTelemetry {
            envelopes: vec![envelope(0, "nope"), envelope(1, "also-nope")],
            fail_times: AtomicUsize::new(0),
        });
        let app_store = Arc::new(RecordingAppStore { last: Mutex::new(None) });
        let (tx, _rx) = mpsc::channel(16);

        let poller = PollingAppCollector {
            app_id: "app-1".into(),
            collect_interval: Duration::from_secs(60),
            metric_name: "memoryused".into(),
            metric_unit: "bytes".into(),
            telemetry,
            token_provider: Arc::new(StaticToken),
            samples: tx,
            app_metric_store: app_store.clone(),
        };

        poller.tick().await;

        let persisted = app_store.last.lock().unwrap().clone().unwrap();
        assert_eq!(persisted.value, "");
        assert_eq!(persisted.unit, "");
    }

    #[tokio::test]
    async fn telemetry_failure_exhausts_retries_and_skips_tick() {
        let telemetry = Arc::new(FixedTelemetry {
            envelopes: vec![envelope(0, "100")],
            fail_times: AtomicUsize::new(FETCH_ATTEMPTS as usize),
        });
        let app_store = Arc::new(RecordingAppStore { last: Mutex::new(None) });
        let (tx, _rx) = mpsc::channel(16);

        let poller = PollingAppCollector {
            app_id: "app-1".into(),
            collect_interval: Duration::from_secs(60),
            metric_name: "memoryused".into(),
            metric_unit: "bytes".into(),
            telemetry,
            token_provider: Arc::new(StaticToken),
            samples: tx,
            app_metric_store: app_store.clone(),
        };

        poller.tick().await;

        assert!(app_store.last.lock().unwrap().is_none());
    }
}
