//! Application Registry Poller: tracks the set of application ids that
//! have scaling policies and emits add/remove events for the
//! [`crate::supervisor::Supervisor`] to act on.

use std::collections::HashSet;
use std::time::Duration;

use log::warn;
use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::metrics::AppId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(AppId),
    Removed(AppId),
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyStoreError {
    #[error("database error while {action}")]
    Database {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Read-only projection of the policy store: only the set of `app_id`s is
/// ever consumed by the core.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    async fn app_ids(&self) -> Result<HashSet<AppId>, PolicyStoreError>;
}

pub struct PostgresPolicyStore {
    pool: PgPool,
}

impl PostgresPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PolicyStore for PostgresPolicyStore {
    async fn app_ids(&self) -> Result<HashSet<AppId>, PolicyStoreError> {
        let rows = sqlx::query("SELECT DISTINCT app_id FROM policy_json")
            .fetch_all(&self.pool)
            .await
            .map_err(|source| PolicyStoreError::Database {
                action: "reading policy app ids",
                source,
            })?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>("app_id")).collect())
    }
}

pub struct RegistryPoller<S: PolicyStore> {
    store: S,
    refresh_interval: Duration,
    events: mpsc::Sender<RegistryEvent>,
}

impl<S: PolicyStore> RegistryPoller<S> {
    pub fn new(store: S, refresh_interval: Duration, events: mpsc::Sender<RegistryEvent>) -> Self {
        Self {
            store,
            refresh_interval,
            events,
        }
    }

    /// Runs until `stop` fires. Transient policy-store errors are logged
    /// and skipped — the previously observed set is retained so no
    /// spurious removals are emitted.
    pub async fn run(self, mut stop: oneshot::Receiver<()>) {
        let mut known: HashSet<AppId> = HashSet::new();

        loop {
            tokio::select! {
                biased;

                _ = &mut stop => return,

                _ = sleep(self.refresh_interval) => {
                    match self.store.app_ids().await {
                        Ok(current) => {
                            for added in current.difference(&known) {
                                if self.events.send(RegistryEvent::Added(added.clone())).await.is_err() {
                                    return;
                                }
                            }
                            for removed in known.difference(&current) {
                                if self.events.send(RegistryEvent::Removed(removed.clone())).await.is_err() {
                                    return;
                                }
                            }
                            known = current;
                        }
                        Err(err) => {
                            warn!("policy store read failed, retaining previous app set: {err}");
                        }
                    }
                }
            }
        }
    }
}
