//! In-process lock store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LockError, LockResult, LockRow, LockStore};

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    rows: Mutex<HashMap<String, LockRow>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_insert(&self, row: LockRow, now: DateTime<Utc>) -> LockResult<bool> {
        let mut rows = self.rows.lock().map_err(|_| LockError::Poisoned)?;
        if rows
            .get(&row.repo_id)
            .is_some_and(|existing| !existing.is_expired(now))
        {
            return Ok(false);
        }
        rows.insert(row.repo_id.clone(), row);
        Ok(true)
    }

    async fn delete_if_owner(&self, run_id: &str, repo_id: &str) -> LockResult<bool> {
        let mut rows = self.rows.lock().map_err(|_| LockError::Poisoned)?;
        if rows.get(repo_id).is_some_and(|row| row.run_id == run_id) {
            rows.remove(repo_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, repo_id: &str) -> LockResult<Option<LockRow>> {
        let rows = self.rows.lock().map_err(|_| LockError::Poisoned)?;
        Ok(rows.get(repo_id).cloned())
    }
}
