//! Polling Supervisor: owns the mapping from application id to live App
//! Poller, tracking the working set fed to it by the
//! [`crate::registry::RegistryPoller`].

use std::collections::HashMap;

use log::info;
use tokio::sync::oneshot;

use crate::metrics::AppId;
use crate::poller::{AppCollector, PollerHandle};
use crate::registry::RegistryEvent;

/// Builds one [`AppCollector`] per application id. Boxed so the supervisor
/// does not need to know about telemetry consumers, token providers or
/// store handles — those are captured by the closure at construction.
pub type CollectorFactory = Box<dyn Fn(&str) -> Box<dyn AppCollector> + Send + Sync>;

pub struct Supervisor {
    pollers: HashMap<AppId, PollerHandle>,
    factory: CollectorFactory,
}

impl Supervisor {
    pub fn new(factory: CollectorFactory) -> Self {
        Self {
            pollers: HashMap::new(),
            factory,
        }
    }

    /// Idempotent: instantiates and starts an App Poller only if one isn't
    /// already running for `app_id`.
    pub fn on_add(&mut self, app_id: AppId) {
        if self.pollers.contains_key(&app_id) {
            return;
        }
        let collector = (self.factory)(&app_id);
        let handle = collector.spawn();
        info!("started app poller for {app_id}");
        self.pollers.insert(app_id, handle);
    }

    /// Stops the poller for `app_id`, waiting for its stop acknowledgement,
    /// if one is currently running.
    pub async fn on_remove(&mut self, app_id: &str) {
        if let Some(handle) = self.pollers.remove(app_id) {
            handle.stop().await;
            info!("stopped app poller for {app_id}");
        }
    }

    /// Broadcasts stop to every live poller and awaits each acknowledgement
    /// before returning, so no in-flight sample can race the sink
    /// channel's close.
    pub async fn shutdown(&mut self) {
        let handles: Vec<PollerHandle> = self.pollers.drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Consumes registry events until `stop` fires (or the registry poller
    /// exits), tearing down all pollers before returning.
    pub async fn run(mut self, mut events: tokio::sync::mpsc::Receiver<RegistryEvent>, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;

                _ = &mut stop => {
                    self.shutdown().await;
                    return;
                }

                event = events.recv() => {
                    match event {
                        Some(RegistryEvent::Added(app_id)) => self.on_add(app_id),
                        Some(RegistryEvent::Removed(app_id)) => self.on_remove(&app_id).await,
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}
