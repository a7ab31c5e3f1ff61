//! Filesystem lock store.
//!
//! One JSON row file per repository under the lock directory. The
//! check-and-write in `try_insert` runs while holding an exclusive OS lock on
//! `<dir>/.guard`, so separate processes sharing the directory are
//! serialized too.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{LockError, LockResult, LockRow, LockStore};

#[derive(Debug, Clone)]
pub struct FsLockStore {
    dir: PathBuf,
}

impl FsLockStore {
    /// Create a store rooted at `dir`. Creates the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> LockResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn row_path(&self, repo_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(repo_id.as_bytes()));
        self.dir.join(format!("{}.lock.json", &digest[..32]))
    }

    fn with_guard<T>(&self, f: impl FnOnce() -> LockResult<T>) -> LockResult<T> {
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".guard"))?;
        guard.lock()?;
        let result = f();
        guard.unlock()?;
        result
    }

    fn read_row(path: &Path) -> LockResult<Option<LockRow>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_row(&self, path: &Path, row: &LockRow) -> LockResult<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(row)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> LockResult<T>
    where
        T: Send + 'static,
        F: FnOnce(FsLockStore) -> LockResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| LockError::Task(e.to_string()))?
    }
}

#[async_trait]
impl LockStore for FsLockStore {
    async fn try_insert(&self, row: LockRow, now: DateTime<Utc>) -> LockResult<bool> {
        self.blocking(move |store| {
            let path = store.row_path(&row.repo_id);
            store.with_guard(|| {
                let live = match Self::read_row(&path) {
                    Ok(existing) => existing.is_some_and(|r| !r.is_expired(now)),
                    // An unreadable row cannot prove a live holder.
                    Err(LockError::Malformed(_)) => false,
                    Err(e) => return Err(e),
                };
                if live {
                    return Ok(false);
                }
                store.write_row(&path, &row)?;
                Ok(true)
            })
        })
        .await
    }

    async fn delete_if_owner(&self, run_id: &str, repo_id: &str) -> LockResult<bool> {
        let run_id = run_id.to_string();
        let repo_id = repo_id.to_string();
        self.blocking(move |store| {
            let path = store.row_path(&repo_id);
            store.with_guard(|| match Self::read_row(&path)? {
                Some(row) if row.run_id == run_id => {
                    fs::remove_file(&path)?;
                    Ok(true)
                }
                _ => Ok(false),
            })
        })
        .await
    }

    async fn get(&self, repo_id: &str) -> LockResult<Option<LockRow>> {
        let repo_id = repo_id.to_string();
        self.blocking(move |store| Self::read_row(&store.row_path(&repo_id)))
            .await
    }
}
