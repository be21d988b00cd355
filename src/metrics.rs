//! Data model shared by the registry poller, app pollers and the metric sink.

use std::time::{SystemTime, UNIX_EPOCH};

/// An application id tracked by the [`crate::supervisor::Supervisor`].
///
/// The supervisor's working set is kept eventually equal to the set of
/// `app_id`s present in the policy store; see [`crate::registry::RegistryPoller`].
pub type AppId = String;

/// One raw telemetry record for one container instance at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEnvelope {
    pub instance_index: i32,
    /// Raw numeric payload as reported by the telemetry consumer. Kept as a
    /// string because a single malformed envelope must not abort the whole
    /// tick (see the partial-parse-failure edge case).
    pub value: String,
    pub unit: String,
}

/// A single-instance sample produced by an [`crate::poller::PollingAppCollector`] tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetric {
    pub app_id: String,
    pub instance_index: i32,
    pub metric_name: String,
    pub value: String,
    pub unit: String,
    pub timestamp_ns: i64,
}

/// The per-application aggregate produced once per tick.
///
/// `value` and `unit` are empty strings when the tick produced no
/// parseable samples — this is a sentinel for "no data this tick", not an
/// error; see the Open Question in the spec about the divide-by-zero
/// branch this replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetric {
    pub app_id: String,
    pub metric_name: String,
    pub value: String,
    pub unit: String,
    pub timestamp_ns: i64,
}

impl AppMetric {
    pub fn empty(app_id: impl Into<String>, metric_name: impl Into<String>, timestamp_ns: i64) -> Self {
        Self {
            app_id: app_id.into(),
            metric_name: metric_name.into(),
            value: String::new(),
            unit: String::new(),
            timestamp_ns,
        }
    }
}

/// Current wall-clock time in nanoseconds since the epoch, shared by every
/// [`InstanceMetric`] and the [`AppMetric`] produced in the same tick.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as i64
}

/// Compute the arithmetic mean of `values`, rounded half-up to the nearest
/// integer. Returns `None` if `values` is empty — callers must early-return
/// the empty [`AppMetric`] sentinel in that case rather than dividing by
/// zero.
pub fn rounded_mean(values: &[f64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let mean = sum / values.len() as f64;
    Some((mean + 0.5).floor() as i64)
}
