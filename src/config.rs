//! Process configuration: environment-variable driven, the same
//! `envy` + `.env` shape the teacher's `IndexerConfig`/`EnvSettings` pair
//! uses.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

const DEFAULT_LOCK_TTL_SECS: u64 = 15;
const DEFAULT_REGISTRY_REFRESH_SECS: u64 = 60;
const DEFAULT_APP_COLLECT_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOCK_RETRY_SECS: u64 = 5;
const DEFAULT_METRIC_NAME: &str = "memoryused";
const DEFAULT_METRIC_UNIT: &str = "bytes";
const DEFAULT_MAX_DB_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub policy_db_url: String,
    pub lock_owner: String,
    pub lock_ttl: Duration,
    pub lock_renew_interval: Duration,
    pub lock_retry_interval: Duration,
    pub registry_refresh_interval: Duration,
    pub app_collect_interval: Duration,
    pub metric_name: String,
    pub metric_unit: String,
    pub telemetry_base_url: String,
    pub token: String,
    pub max_db_connections: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = EnvSettings::from_env()?;

        let lock_ttl_secs = env.lock_ttl_secs.unwrap_or(DEFAULT_LOCK_TTL_SECS);
        if lock_ttl_secs == 0 {
            return Err(anyhow::anyhow!("LOCK_TTL_SECS must be greater than zero"));
        }
        let lock_renew_interval_secs = env
            .lock_renew_interval_secs
            .unwrap_or_else(|| (lock_ttl_secs / 3).max(1));

        Ok(Self {
            database_url: env.database_url.clone(),
            policy_db_url: env.policy_db_url.unwrap_or(env.database_url),
            lock_owner: env.lock_owner.unwrap_or_else(|| Uuid::new_v4().to_string()),
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            lock_renew_interval: Duration::from_secs(lock_renew_interval_secs),
            lock_retry_interval: Duration::from_secs(
                env.lock_retry_interval_secs.unwrap_or(DEFAULT_LOCK_RETRY_SECS),
            ),
            registry_refresh_interval: Duration::from_secs(
                env.registry_refresh_interval_secs.unwrap_or(DEFAULT_REGISTRY_REFRESH_SECS),
            ),
            app_collect_interval: Duration::from_secs(
                env.app_collect_interval_secs.unwrap_or(DEFAULT_APP_COLLECT_INTERVAL_SECS),
            ),
            metric_name: env.metric_name.unwrap_or_else(|| DEFAULT_METRIC_NAME.to_string()),
            metric_unit: env.metric_unit.unwrap_or_else(|| DEFAULT_METRIC_UNIT.to_string()),
            telemetry_base_url: env.telemetry_base_url,
            token: env.token,
            max_db_connections: env.max_db_connections.unwrap_or(DEFAULT_MAX_DB_CONNECTIONS),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EnvSettings {
    database_url: String,
    #[serde(default)]
    policy_db_url: Option<String>,
    #[serde(default)]
    lock_owner: Option<String>,
    #[serde(default)]
    lock_ttl_secs: Option<u64>,
    #[serde(default)]
    lock_renew_interval_secs: Option<u64>,
    #[serde(default)]
    lock_retry_interval_secs: Option<u64>,
    #[serde(default)]
    registry_refresh_interval_secs: Option<u64>,
    #[serde(default)]
    app_collect_interval_secs: Option<u64>,
    #[serde(default)]
    metric_name: Option<String>,
    #[serde(default)]
    metric_unit: Option<String>,
    telemetry_base_url: String,
    token: String,
    #[serde(default)]
    max_db_connections: Option<u32>,
}

impl EnvSettings {
    fn from_env() -> Result<Self> {
        envy::from_env::<Self>().context("failed to load metricscollector environment settings")
    }
}
