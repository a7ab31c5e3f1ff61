//! Per-repository mutual exclusion across runs.
//!
//! At most one unexpired [`LockRow`] exists per `repo_id`. Acquisition never
//! waits: a held lock is reported as contention and the caller decides what
//! to do. Rows whose TTL has elapsed are treated as absent, so a crashed run
//! cannot wedge a repository.

pub mod error;
pub mod fs;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::{LockError, LockResult};
pub use fs::FsLockStore;
pub use memory::MemoryLockStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    pub run_id: String,
    pub repo_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Time to live in milliseconds.
    pub ttl_ms: u64,
}

impl LockRow {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX));
        self.acquired_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Storage backend for lock rows.
///
/// `try_insert` must be atomic with respect to other callers: check for a
/// live row and insert the new one as one step.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert `row` unless a row unexpired at `now` exists for its repo.
    async fn try_insert(&self, row: LockRow, now: DateTime<Utc>) -> LockResult<bool>;

    /// Delete the repo's row if it belongs to `run_id`.
    async fn delete_if_owner(&self, run_id: &str, repo_id: &str) -> LockResult<bool>;

    /// The repo's row, expired or not.
    async fn get(&self, repo_id: &str) -> LockResult<Option<LockRow>>;
}

#[derive(Clone)]
pub struct ExecutionLock {
    store: Arc<dyn LockStore>,
}

impl ExecutionLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Acquire the repository lock for `run_id`. Returns `false` on
    /// contention.
    pub async fn acquire(&self, run_id: &str, repo_id: &str, ttl: Duration) -> LockResult<bool> {
        self.acquire_at(run_id, repo_id, ttl, Utc::now()).await
    }

    /// [`ExecutionLock::acquire`] with an explicit clock.
    ///
    /// A zero `ttl` is refused: the row would be expired on insert.
    pub async fn acquire_at(
        &self,
        run_id: &str,
        repo_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LockResult<bool> {
        if ttl.is_zero() {
            return Err(LockError::ZeroTtl);
        }
        let row = LockRow {
            run_id: run_id.to_string(),
            repo_id: repo_id.to_string(),
            acquired_at: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let acquired = self.store.try_insert(row, now).await?;
        debug!(run_id = %run_id, repo_id = %repo_id, acquired, "execution lock acquire");
        Ok(acquired)
    }

    /// Release the lock if `run_id` holds it. Returns whether a row was
    /// deleted.
    pub async fn release(&self, run_id: &str, repo_id: &str) -> LockResult<bool> {
        self.store.delete_if_owner(run_id, repo_id).await
    }

    /// The current unexpired holder, if any.
    pub async fn holder(&self, repo_id: &str) -> LockResult<Option<LockRow>> {
        self.holder_at(repo_id, Utc::now()).await
    }

    pub async fn holder_at(
        &self,
        repo_id: &str,
        now: DateTime<Utc>,
    ) -> LockResult<Option<LockRow>> {
        Ok(self
            .store
            .get(repo_id)
            .await?
            .filter(|row| !row.is_expired(now)))
    }
}
