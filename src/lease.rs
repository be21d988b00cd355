//! Lease Manager: the state machine that repeatedly drives the Lock Store
//! to acquire, hold and gracefully release the singleton lease, and exposes
//! the "have-lease" signal the rest of the process is gated behind.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;

use crate::lock::{now_secs, Lease, LockStore};

const RELEASE_RETRY_ATTEMPTS: u32 = 3;

/// Lease lost after having been held — the only coordination failure that
/// is fatal to the process (configuration errors are the other one).
#[derive(Debug, thiserror::Error)]
#[error("lease for owner {owner} was lost after being held")]
pub struct LeaseLost {
    pub owner: String,
}

pub struct LeaseManagerConfig {
    pub owner: String,
    pub ttl_seconds: i32,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

/// Drives [`LockStore`] through the acquire / renew / release protocol
/// described in the spec's Lease Manager section. One instance per process.
pub struct LeaseManager {
    store: Arc<dyn LockStore>,
    config: LeaseManagerConfig,
    have_lease_tx: watch::Sender<bool>,
}

enum AcquireOutcome {
    Acquired,
    NotYet,
}

enum HoldOutcome {
    ShutdownRequested,
    Lost(LeaseLost),
    RenewalErrorReturnToIdle,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LockStore>, config: LeaseManagerConfig) -> (Self, watch::Receiver<bool>) {
        let (have_lease_tx, have_lease_rx) = watch::channel(false);
        (
            Self {
                store,
                config,
                have_lease_tx,
            },
            have_lease_rx,
        )
    }

    /// Runs the acquire/renew loop until `shutdown` fires. Returns `Ok(())`
    /// on a clean, requested shutdown; `Err(LeaseLost)` if a previously held
    /// lease could not be renewed because another replica now owns it —
    /// callers must treat that as fatal and exit nonzero.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), LeaseLost> {
        let mut attempts_since_idle: u32 = 0;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("received interrupt signal");
                    self.shutdown_from_idle().await;
                    return Ok(());
                }

                outcome = self.attempt_acquire(attempts_since_idle) => {
                    match outcome {
                        Ok(AcquireOutcome::Acquired) => {
                            let _ = self.have_lease_tx.send(true);
                            attempts_since_idle = 0;
                            match self.hold_until_lost_or_shutdown(&mut shutdown).await {
                                HoldOutcome::ShutdownRequested => return Ok(()),
                                HoldOutcome::Lost(lost) => return Err(lost),
                                HoldOutcome::RenewalErrorReturnToIdle => continue,
                            }
                        }
                        Ok(AcquireOutcome::NotYet) => {
                            attempts_since_idle += 1;
                            sleep(self.config.retry_interval).await;
                        }
                        Err(err) => {
                            warn!("lock store error during acquire attempt: {err}");
                            attempts_since_idle += 1;
                            sleep(self.config.retry_interval).await;
                        }
                    }
                }
            }
        }
    }

    /// Holds the lease, renewing on schedule, until either shutdown is
    /// requested or renewal definitively fails.
    async fn hold_until_lost_or_shutdown(
        &mut self,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> HoldOutcome {
        loop {
            tokio::select! {
                biased;

                _ = &mut *shutdown => {
                    info!("received interrupt signal");
                    self.release_with_retries().await;
                    let _ = self.have_lease_tx.send(false);
                    return HoldOutcome::ShutdownRequested;
                }

                _ = sleep(self.config.renew_interval) => {
                    match self.store.renew(&self.config.owner, now_secs()).await {
                        Ok(true) => continue,
                        Ok(false) => {
                            warn!("lease for owner {} no longer present on renewal", self.config.owner);
                            let _ = self.have_lease_tx.send(false);
                            return HoldOutcome::Lost(LeaseLost { owner: self.config.owner.clone() });
                        }
                        Err(err) => {
                            warn!("transient lock store error renewing lease: {err}; returning to acquire loop");
                            let _ = self.have_lease_tx.send(false);
                            return HoldOutcome::RenewalErrorReturnToIdle;
                        }
                    }
                }
            }
        }
    }

    /// Called when shutdown is requested while still in the acquire loop
    /// (never having held the lease). Nothing to release here — the
    /// `Acquired` branch's own shutdown handling in
    /// `hold_until_lost_or_shutdown` covers the held case.
    async fn shutdown_from_idle(&mut self) {
        let _ = self.have_lease_tx.send(false);
    }

    async fn release_with_retries(&mut self) {
        for attempt in 1..=RELEASE_RETRY_ATTEMPTS {
            match self.store.release(&self.config.owner).await {
                Ok(()) => {
                    info!("successfully released lock");
                    return;
                }
                Err(err) => {
                    warn!(
                        "release attempt {attempt}/{RELEASE_RETRY_ATTEMPTS} failed: {err}"
                    );
                    if attempt < RELEASE_RETRY_ATTEMPTS {
                        sleep(self.config.retry_interval).await;
                    }
                }
            }
        }
    }

    /// Implements the acquire protocol of a single attempt: fetch, then
    /// branch on absent / self-owned / foreign-and-expired / foreign-and-live.
    async fn attempt_acquire(
        &self,
        attempts_since_idle: u32,
    ) -> crate::lock::Result<AcquireOutcome> {
        let now = now_secs();
        match self.store.fetch().await? {
            None => {
                let candidate = Lease::new(self.config.owner.clone(), now, self.config.ttl_seconds);
                if self.store.claim(&candidate).await? {
                    if attempts_since_idle == 0 {
                        info!("lock acquired in fisrt attempt");
                    } else {
                        info!("successfully acquired lock");
                    }
                    Ok(AcquireOutcome::Acquired)
                } else {
                    info!("retrying-acquiring-lock");
                    info!("waiting for lock");
                    Ok(AcquireOutcome::NotYet)
                }
            }
            Some(lease) if lease.owner == self.config.owner => {
                if self.store.renew(&self.config.owner, now).await? {
                    info!("successfully acquired lock");
                    Ok(AcquireOutcome::Acquired)
                } else {
                    info!("retrying-acquiring-lock");
                    info!("waiting for lock");
                    Ok(AcquireOutcome::NotYet)
                }
            }
            Some(lease) if lease.is_expired_at(now) => {
                self.store.release(&lease.owner).await?;
                let candidate = Lease::new(self.config.owner.clone(), now, self.config.ttl_seconds);
                if self.store.claim(&candidate).await? {
                    info!("successfully acquired lock");
                    Ok(AcquireOutcome::Acquired)
                } else {
                    info!("retrying-acquiring-lock");
                    info!("waiting for lock");
                    Ok(AcquireOutcome::NotYet)
                }
            }
            Some(_) => {
                info!("retrying-acquiring-lock");
                info!("waiting for lock");
                Ok(AcquireOutcome::NotYet)
            }
        }
    }
}
