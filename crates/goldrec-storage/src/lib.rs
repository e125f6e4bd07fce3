//! Object store contract, filesystem-backed implementation, and the shared
//! retry/backoff policy used by every pipeline stage.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "goldrec-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {path}")]
    NotFound { path: String },
    #[error("reading object {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("writing object {path}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("listing objects under {prefix}")]
    List {
        prefix: String,
        #[source]
        source: io::Error,
    },
}

/// Blob storage addressed by `/`-separated paths. Paths embed sortable
/// timestamps by convention, so lexicographic listing order is chronological.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes an object, atomically replacing any previous content.
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// All object paths under `prefix`, lexicographically sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// The lexicographically greatest path under `prefix`, or `None` if the
    /// prefix is empty.
    async fn find_latest(&self, prefix: &str) -> Result<Option<String>, StorageError> {
        Ok(self.list(prefix).await?.pop())
    }
}

/// Filesystem-backed object store. Writes go through a uuid-named temp file
/// renamed into place, so readers never observe a partial object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn relative_key(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let absolute = self.absolute(path);
        let parent = absolute
            .parent()
            .ok_or_else(|| StorageError::Write {
                path: path.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "object path has no parent"),
            })?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StorageError::Write {
                path: path.to_string(),
                source,
            })?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &absolute).await
        }
        .await;

        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Write {
                path: path.to_string(),
                source,
            });
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.absolute(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    path: path.to_string(),
                })
            }
            Err(source) => Err(StorageError::Read {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let list_err = |source| StorageError::List {
            prefix: prefix.to_string(),
            source,
        };

        // Only the directory part of the prefix names a real directory; the
        // remainder filters file keys below.
        let start_dir = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        };
        match fs::metadata(&start_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(Vec::new()),
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(list_err(source)),
        }

        let mut keys = Vec::new();
        let mut pending = vec![start_dir];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(list_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
                let file_type = entry.file_type().await.map_err(list_err)?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Some(key) = self.relative_key(&entry.path()) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds or the policy's retry budget is exhausted,
/// sleeping a capped exponential delay between attempts. `op` receives the
/// 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if (attempt as usize) <= policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt as usize - 1);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_atomically_replaces_existing_objects() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        store
            .put("customers/20240101_000000/entity_data.json", b"first")
            .await
            .expect("first put");
        store
            .put("customers/20240101_000000/entity_data.json", b"second")
            .await
            .expect("second put");

        let bytes = store
            .get("customers/20240101_000000/entity_data.json")
            .await
            .expect("get");
        assert_eq!(bytes, b"second");
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        let err = store.get("customers/absent.json").await.expect_err("absent");
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_is_lexicographic_and_skips_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        store.put("runs/b.json", b"{}").await.expect("put");
        store.put("runs/a.json", b"{}").await.expect("put");
        store.put("runs/nested/c.json", b"{}").await.expect("put");
        std::fs::write(dir.path().join("runs/.leftover.tmp"), b"junk").expect("write temp");

        let keys = store.list("runs/").await.expect("list");
        assert_eq!(keys, vec!["runs/a.json", "runs/b.json", "runs/nested/c.json"]);
    }

    #[tokio::test]
    async fn find_latest_returns_greatest_timestamped_path() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        for stamp in ["20240101_120000", "20240102_080000", "20240101_230000"] {
            let key = format!("customers/{stamp}/entity_data.json");
            store.put(&key, b"{}").await.expect("put");
        }

        let latest = store.find_latest("customers/").await.expect("find_latest");
        assert_eq!(
            latest.as_deref(),
            Some("customers/20240102_080000/entity_data.json")
        );
    }

    #[tokio::test]
    async fn find_latest_on_empty_prefix_is_none() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        let latest = store.find_latest("nothing/here/").await.expect("find_latest");
        assert_eq!(latest, None);
    }

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_with_backoff(policy, "test-op", |attempt| {
            calls.store(attempt, Ordering::Relaxed);
            async move {
                if attempt < 3 {
                    Err(format!("transient failure on attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_after_max_retries_plus_one_attempts() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_with_backoff(policy, "test-op", |attempt| {
            calls.store(attempt, Ordering::Relaxed);
            async move { Err("persistent failure".to_string()) }
        })
        .await;

        assert_eq!(result, Err("persistent failure".to_string()));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
