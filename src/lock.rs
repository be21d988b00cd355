//! Lock Store: persists the single lease row used to arbitrate which
//! replica of the collector drives the polling fleet.
//!
//! All four primitives commit on success and roll back on any error path;
//! the row-level `SELECT ... FOR UPDATE` lock is the only concurrency
//! primitive used, no advisory locks.

use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{PgPool, Row};
use thiserror::Error;

/// Wall-clock seconds since the epoch, the unit `Lease::last_modified_timestamp` is stored in.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// A snapshot of the `locks` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub last_modified_timestamp: i64,
    pub ttl_seconds: i32,
}

impl Lease {
    pub fn new(owner: impl Into<String>, last_modified_timestamp: i64, ttl_seconds: i32) -> Self {
        Self {
            owner: owner.into(),
            last_modified_timestamp,
            ttl_seconds,
        }
    }

    pub fn expiry(&self) -> i64 {
        self.last_modified_timestamp + self.ttl_seconds as i64
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expiry()
    }
}

#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("database error while {action}")]
    Database {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl LockStoreError {
    fn database(action: &'static str, source: sqlx::Error) -> Self {
        Self::Database { action, source }
    }
}

pub type Result<T> = std::result::Result<T, LockStoreError>;

/// `23505` is Postgres's unique_violation code, raised here by the `locks`
/// table's singleton primary key (`id` defaults to `1` on every insert) when
/// two transactions race to insert a row concurrently.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|e| e.code()),
        Some(code) if code == "23505"
    )
}

/// Contract implemented by the production Postgres-backed store and any
/// fake used in [`crate::lease`] unit tests.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Returns `Ok(None)` when no lease row exists — absent is a normal
    /// status, never an error.
    async fn fetch(&self) -> Result<Option<Lease>>;

    /// Claims `lease` if and only if no row currently exists. The caller
    /// is expected to only call this after observing absent or expired
    /// state; concurrent claims serialize on the row lock.
    async fn claim(&self, lease: &Lease) -> Result<bool>;

    /// Rewrites the timestamp of the row owned by `owner` to `now`. Returns
    /// `Ok(false)` if no such row exists.
    async fn renew(&self, owner: &str, now: i64) -> Result<bool>;

    /// Deletes the row owned by `owner`. Idempotent: deleting zero rows is
    /// success.
    async fn release(&self, owner: &str) -> Result<()>;
}

pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LockStore for PostgresLockStore {
    async fn fetch(&self) -> Result<Option<Lease>> {
        let row = sqlx::query("SELECT owner, lock_timestamp, ttl FROM locks")
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| LockStoreError::database("fetching lease", source))?;

        Ok(row.map(|row| Lease {
            owner: row.get("owner"),
            last_modified_timestamp: row.get("lock_timestamp"),
            ttl_seconds: row.get("ttl"),
        }))
    }

    async fn claim(&self, lease: &Lease) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| LockStoreError::database("beginning claim transaction", source))?;

        let existing = sqlx::query("SELECT owner FROM locks FOR UPDATE")
            .fetch_optional(&mut *tx)
            .await
            .map_err(|source| LockStoreError::database("locking lease row for claim", source))?;

        if existing.is_some() {
            tx.rollback()
                .await
                .map_err(|source| LockStoreError::database("rolling back contested claim", source))?;
            return Ok(false);
        }

        let inserted = sqlx::query(
            "INSERT INTO locks (owner, lock_timestamp, ttl) VALUES ($1, $2, $3)",
        )
        .bind(&lease.owner)
        .bind(lease.last_modified_timestamp)
        .bind(lease.ttl_seconds)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit()
                    .await
                    .map_err(|source| LockStoreError::database("committing claim", source))?;
                Ok(true)
            }
            Err(source) if is_unique_violation(&source) => {
                tx.rollback().await.ok();
                Ok(false)
            }
            Err(source) => {
                tx.rollback().await.ok();
                Err(LockStoreError::database("inserting claimed lease", source))
            }
        }
    }

    async fn renew(&self, owner: &str, now: i64) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| LockStoreError::database("beginning renew transaction", source))?;

        let locked = sqlx::query("SELECT owner FROM locks WHERE owner = $1 FOR UPDATE")
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|source| LockStoreError::database("locking lease row for renew", source))?;

        if locked.is_none() {
            tx.rollback().await.ok();
            return Ok(false);
        }

        sqlx::query("UPDATE locks SET lock_timestamp = $2 WHERE owner = $1")
            .bind(owner)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|source| LockStoreError::database("renewing lease timestamp", source))?;

        tx.commit()
            .await
            .map_err(|source| LockStoreError::database("committing renewal", source))?;
        Ok(true)
    }

    async fn release(&self, owner: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| LockStoreError::database("beginning release transaction", source))?;

        sqlx::query("SELECT owner FROM locks WHERE owner = $1 FOR UPDATE")
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|source| LockStoreError::database("locking lease row for release", source))?;

        sqlx::query("DELETE FROM locks WHERE owner = $1")
            .bind(owner)
            .execute(&mut *tx)
            .await
            .map_err(|source| LockStoreError::database("deleting lease row", source))?;

        tx.commit()
            .await
            .map_err(|source| LockStoreError::database("committing release", source))?;
        Ok(())
    }
}
