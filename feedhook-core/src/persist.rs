//! Locked, atomically replaced JSON files.
//!
//! Every file feedhook shares between the scheduler and the dashboard goes
//! through [`LockedJsonFile`]. A mutation takes an exclusive advisory lock on a
//! `<name>.lock` sidecar, re-reads the file, applies the change, writes
//! `<name>.tmp`, fsyncs it and renames it over the target. Readers never take
//! the lock: a rename is atomic, so they see either the old or the new file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct LockedJsonFile {
    path: PathBuf,
    lock_timeout: Duration,
    strict: bool,
    // serializes writers inside one process; the file lock covers other processes
    local: Arc<Mutex<()>>,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockedJsonFile {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
            strict: false,
            local: Arc::new(Mutex::new(())),
        }
    }

    /// Refuse to treat an unreadable file as empty. Used for operator-edited
    /// files, where a default would overwrite or misread real data.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    pub(crate) fn tmp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    /// Reads the current contents. A missing file yields `T::default()`; a
    /// corrupt file falls back to the temp sibling, then to the default, or to
    /// [`StoreError::Corrupt`] for a strict file.
    pub async fn read<T: DeserializeOwned + Default>(&self) -> Result<T, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => Ok(value),
            Err(e) => {
                let tmp = self.tmp_path();
                warn!(error = %e, path = %self.path.display(), "failed to parse JSON, trying tmp fallback");
                let fallback = match tokio::fs::read(&tmp).await {
                    Ok(tmp_bytes) => serde_json::from_slice::<T>(&tmp_bytes).ok(),
                    Err(_) => None,
                };
                match fallback {
                    Some(value) => Ok(value),
                    None if self.strict => Err(StoreError::Corrupt {
                        path: self.path.clone(),
                        source: e,
                    }),
                    None => Ok(T::default()),
                }
            }
        }
    }

    /// Read-modify-write under the lock. The closure sees the latest on-disk
    /// state, so concurrent writers never lose each other's updates.
    pub async fn update<T, R, F>(&self, apply: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _local = self.local.lock().await;
        let _guard = self.acquire().await?;
        let mut value: T = self.read().await?;
        let out = apply(&mut value);
        let bytes = serde_json::to_vec_pretty(&value)?;
        self.write_atomic(&bytes).await?;
        Ok(out)
    }

    /// Replaces the file with raw bytes under the lock (restore from backup).
    pub async fn replace_bytes(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let _local = self.local.lock().await;
        let _guard = self.acquire().await?;
        self.write_atomic(bytes).await
    }

    /// Raw contents for backup download; empty when the file does not exist.
    pub async fn read_bytes(&self) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    async fn acquire(&self) -> Result<LockGuard, StoreError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .await
            .map_err(|e| StoreError::io(&lock_path, e))?
            .into_std()
            .await;

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(StoreError::Busy {
                            path: self.path.clone(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    debug!(path = %self.path.display(), backoff_ms = backoff.as_millis() as u64, "store locked, backing off");
                    tokio::time::sleep(backoff.min(self.lock_timeout - waited)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(StoreError::io(&lock_path, e)),
            }
        }
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs::OpenOptions;

    fn temp_path(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("feedhook_persist_{}", uuid::Uuid::new_v4()));
        dir.join(name)
    }

    #[tokio::test]
    async fn missing_file_reads_as_default() {
        let file = LockedJsonFile::new(temp_path("absent.json"), Duration::from_secs(1));
        let value: BTreeMap<String, u32> = file.read().await.unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn update_replaces_file_and_leaves_no_tmp() {
        let path = temp_path("counter.json");
        let file = LockedJsonFile::new(&path, Duration::from_secs(1));
        for _ in 0..3 {
            file.update(|map: &mut BTreeMap<String, u32>| {
                *map.entry("n".into()).or_default() += 1;
            })
            .await
            .unwrap();
        }
        let value: BTreeMap<String, u32> = file.read().await.unwrap();
        assert_eq!(value.get("n"), Some(&3));
        assert!(!file.tmp_path().exists());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn held_lock_makes_writers_busy() {
        let path = temp_path("busy.json");
        let file = LockedJsonFile::new(&path, Duration::from_millis(80));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(file.lock_path())
            .unwrap();
        holder.lock_exclusive().unwrap();

        let err = file
            .update(|map: &mut BTreeMap<String, u32>| {
                map.insert("x".into(), 1);
            })
            .await
            .unwrap_err();
        assert!(err.is_busy());

        FileExt::unlock(&holder).unwrap();
        file.update(|map: &mut BTreeMap<String, u32>| {
            map.insert("x".into(), 1);
        })
        .await
        .unwrap();
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn strict_file_rejects_corruption_instead_of_overwriting() {
        let path = temp_path("strict.json");
        let file = LockedJsonFile::new(&path, Duration::from_secs(1)).strict();
        file.update(|map: &mut BTreeMap<String, u32>| {
            map.insert("keep".into(), 7);
        })
        .await
        .unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        raw.push(b',');
        std::fs::write(&path, &raw).unwrap();

        let err = file.read::<BTreeMap<String, u32>>().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        let err = file
            .update(|map: &mut BTreeMap<String, u32>| {
                map.insert("new".into(), 1);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), raw);

        let lenient = LockedJsonFile::new(&path, Duration::from_secs(1));
        assert!(lenient.read::<BTreeMap<String, u32>>().await.unwrap().is_empty());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
