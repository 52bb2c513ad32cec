//! The content store (§4.2): creates, reads, commits and unlinks cache
//! entries, and maintains the content-addressed dedup pool.

use crate::error::StoreError;
use crate::layout::{CacheLayout, ObjectKey};
use crate::lock::{self, EntryLockGuard, GlobalLock};
use pkg_cacher_digest::{compute_file_digest, format_digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Whether an entry is ready to serve, partway through being written, or
/// does not exist at all yet. Mirrors the `HIT`/`EXPIRED`/`MISS` precursor
/// checks the cache coordinator performs before deciding a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Body, headers and completion marker are all present.
    Complete,
    /// Some, but not all, of the three sibling paths exist — either a
    /// fetch is in progress or a previous one crashed.
    Partial,
    /// None of the three sibling paths exist.
    Missing,
}

/// The outcome of [`ContentStore::commit`]: the final, verified size and
/// digest of the body, and whether it was deduplicated against an existing
/// pool entry.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The verified (or synthesised) `Content-Length`.
    pub content_length: u64,
    /// Lowercase hex SHA-1 of the body — the suffix of the pool filename.
    pub sha1_hex: String,
    /// `true` if an existing pool entry with this basename+hash was reused
    /// instead of creating a new one.
    pub deduplicated: bool,
}

/// Operations on the on-disk cache tree: create/read/commit/unlink an
/// entry, and the content-addressed dedup pool. Every multi-path state
/// transition runs under the single [`GlobalLock`]; long-running I/O
/// (network fetch, byte streaming) never happens while that lock is held.
pub struct ContentStore {
    layout: CacheLayout,
    global_lock: GlobalLock,
}

impl ContentStore {
    /// Opens the store rooted at `layout`, creating the global lock file if
    /// it does not exist yet.
    pub fn open(layout: CacheLayout) -> Result<ContentStore, StoreError> {
        let global_lock = GlobalLock::open(layout.global_lock_path())?;
        Ok(ContentStore { layout, global_lock })
    }

    /// The cache layout this store operates on.
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Inspects the three sibling paths for `key` without taking any lock —
    /// a cheap existence check the coordinator uses before deciding whether
    /// to enter the "decision to (re)fetch" critical section at all.
    pub async fn entry_state(&self, key: &ObjectKey) -> Result<EntryState, StoreError> {
        let package_path = self.layout.package_path(key);
        let header_path = self.layout.header_path(key);
        let complete_path = self.layout.complete_path(key);

        simple_spawn_blocking::tokio::run_blocking_task(move || {
            let present = [&package_path, &header_path, &complete_path]
                .into_iter()
                .filter(|p| p.exists())
                .count();
            Ok(match present {
                3 => EntryState::Complete,
                0 => EntryState::Missing,
                _ => EntryState::Partial,
            })
        })
        .await
    }

    /// Creates a fresh, empty entry for `key` and acquires the per-entry
    /// body lock on it, per §4.2 step 1-2: directory creation and the
    /// exclusive body-file create happen under the global lock (released
    /// before the body lock is taken), so two concurrent creators race on
    /// `O_EXCL` rather than on the global lock itself staying held across
    /// the (potentially slower) body-lock acquisition.
    pub async fn create_entry(
        &self,
        key: &ObjectKey,
    ) -> Result<(File, EntryLockGuard), StoreError> {
        let package_path = self.layout.package_path(key);
        let packages_dir = self.layout.packages_dir(&key.vhost);
        let headers_dir = self.layout.headers_dir(&key.vhost);
        let private_dir = self.layout.private_dir(&key.vhost);

        let guard = self.global_lock.acquire().await?;
        let create_path = package_path.clone();
        let file = simple_spawn_blocking::tokio::run_blocking_task(move || {
            std::fs::create_dir_all(&packages_dir)
                .map_err(|e| StoreError::Io(format!("creating {}", packages_dir.display()), e))?;
            std::fs::create_dir_all(&headers_dir)
                .map_err(|e| StoreError::Io(format!("creating {}", headers_dir.display()), e))?;
            std::fs::create_dir_all(&private_dir)
                .map_err(|e| StoreError::Io(format!("creating {}", private_dir.display()), e))?;

            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&create_path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        StoreError::AlreadyExists(create_path.display().to_string())
                    } else {
                        StoreError::Io(format!("creating {}", create_path.display()), e)
                    }
                })
        })
        .await;
        drop(guard);
        let file = file?;

        let entry_lock = lock::acquire_entry_lock(&package_path).await?;
        Ok((file, entry_lock))
    }

    /// Opens the body file for reading. Takes no lock: any number of
    /// readers may hold this concurrently with an active fetcher.
    pub async fn open_for_read(&self, key: &ObjectKey) -> Result<File, StoreError> {
        let path = self.layout.package_path(key);
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            File::open(&path).map_err(|e| StoreError::Io(format!("opening {}", path.display()), e))
        })
        .await
    }

    /// Writes `header_bytes` (the raw status line plus headers) to a
    /// scratch sidecar. Call [`ContentStore::finalize_header`] once the
    /// final, non-redirect response is known to atomically publish it —
    /// readers polling `header_path` never observe an intermediate `302`.
    pub async fn write_header_scratch(
        &self,
        key: &ObjectKey,
        header_bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let scratch_path = self.layout.header_scratch_path(key);
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            if let Some(parent) = scratch_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("creating {}", parent.display()), e))?;
            }
            let mut file = File::create(&scratch_path)
                .map_err(|e| StoreError::Io(format!("creating {}", scratch_path.display()), e))?;
            file.write_all(&header_bytes)
                .map_err(|e| StoreError::Io(format!("writing {}", scratch_path.display()), e))
        })
        .await
    }

    /// Atomically publishes the scratch header sidecar as the entry's real
    /// header file.
    pub async fn finalize_header(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let scratch_path = self.layout.header_scratch_path(key);
        let header_path = self.layout.header_path(key);
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            std::fs::rename(&scratch_path, &header_path).map_err(|e| {
                StoreError::Io(
                    format!(
                        "renaming {} to {}",
                        scratch_path.display(),
                        header_path.display()
                    ),
                    e,
                )
            })
        })
        .await
    }

    /// Reads the raw header sidecar, if it exists yet.
    pub async fn read_header(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.layout.header_path(key);
        simple_spawn_blocking::tokio::run_blocking_task(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!("reading {}", path.display()), e)),
        })
        .await
    }

    /// §4.2 commit: under the global lock, verify (or synthesise) the body
    /// length against `declared_content_length`, hash the body, link it
    /// into the content-addressed dedup pool, release the lock, then write
    /// the completion marker (whose contents are `source_url`).
    pub async fn commit(
        &self,
        key: &ObjectKey,
        declared_content_length: Option<u64>,
        source_url: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let package_path = self.layout.package_path(key);
        let basename = key.basename().to_string();
        let layout = self.layout.clone();

        let guard = self.global_lock.acquire().await?;
        let package_path2 = package_path.clone();
        let outcome = simple_spawn_blocking::tokio::run_blocking_task(move || {
            let metadata = std::fs::metadata(&package_path2)
                .map_err(|e| StoreError::Io(format!("statting {}", package_path2.display()), e))?;
            let actual_len = metadata.len();
            if let Some(declared) = declared_content_length {
                if declared != actual_len {
                    tracing::warn!(
                        declared,
                        actual_len,
                        path = %package_path2.display(),
                        "Content-Length mismatch; trusting the bytes actually written"
                    );
                }
            }

            let digest = compute_file_digest::<Sha1>(&package_path2)
                .map_err(|e| StoreError::Io(format!("hashing {}", package_path2.display()), e))?;
            let sha1_hex = format_digest::<Sha1>(&digest);
            let pool_path = layout.pool_path(&basename, &sha1_hex);

            let deduplicated = if pool_path.exists() {
                std::fs::remove_file(&package_path2).map_err(|e| {
                    StoreError::Io(format!("removing {}", package_path2.display()), e)
                })?;
                std::fs::hard_link(&pool_path, &package_path2).map_err(|e| {
                    StoreError::Io(
                        format!(
                            "linking {} to pool entry {}",
                            package_path2.display(),
                            pool_path.display()
                        ),
                        e,
                    )
                })?;
                true
            } else {
                if let Some(parent) = pool_path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Io(format!("creating {}", parent.display()), e))?;
                }
                std::fs::hard_link(&package_path2, &pool_path).map_err(|e| {
                    StoreError::Io(
                        format!(
                            "linking pool entry {} to {}",
                            pool_path.display(),
                            package_path2.display()
                        ),
                        e,
                    )
                })?;
                false
            };

            Ok::<_, StoreError>(CommitOutcome {
                content_length: actual_len,
                sha1_hex,
                deduplicated,
            })
        })
        .await;
        drop(guard);
        let outcome = outcome?;

        let complete_path = self.layout.complete_path(key);
        let source_url = source_url.to_string();
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            if let Some(parent) = complete_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("creating {}", parent.display()), e))?;
            }
            std::fs::write(&complete_path, source_url.as_bytes())
                .map_err(|e| StoreError::Io(format!("writing {}", complete_path.display()), e))
        })
        .await?;

        Ok(outcome)
    }

    /// Unlinks only the body, leaving the header sidecar in place — used
    /// by terminal upstream failures (§4.3 point 3, §4.3 point 4): "the
    /// body is unlinked, a header recording the error is written, and
    /// readers see the error."
    pub async fn unlink_body_only(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let package_path = self.layout.package_path(key);
        let guard = self.global_lock.acquire().await?;
        let result =
            simple_spawn_blocking::tokio::run_blocking_task(move || remove_if_present(&package_path))
                .await;
        drop(guard);
        result
    }

    /// Unlinks the three sibling paths for `key` under the global lock —
    /// used both by freshness-driven invalidation (§3 "Lifecycle") and by
    /// the fetcher's terminal-4xx handling (§4.3 point 3).
    pub async fn unlink_entry(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let package_path = self.layout.package_path(key);
        let header_path = self.layout.header_path(key);
        let complete_path = self.layout.complete_path(key);

        let guard = self.global_lock.acquire().await?;
        let result = simple_spawn_blocking::tokio::run_blocking_task(move || {
            for path in [&package_path, &header_path, &complete_path] {
                remove_if_present(path)?;
            }
            Ok(())
        })
        .await;
        drop(guard);
        result
    }
}

fn remove_if_present(path: &PathBuf) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(format!("removing {}", path.display()), e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    fn layout() -> (tempfile::TempDir, CacheLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        (dir, layout)
    }

    #[tokio::test]
    async fn create_entry_then_read_round_trips_bytes() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout).unwrap();
        let key = ObjectKey::new("debian", "pool/x/foo_1.0.deb");

        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"package body bytes").unwrap();
        drop(file);

        let mut read = store.open_for_read(&key).await.unwrap();
        let mut buf = Vec::new();
        read.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"package body bytes");
    }

    #[tokio::test]
    async fn create_entry_twice_fails_with_already_exists() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout).unwrap();
        let key = ObjectKey::new("debian", "pool/x/foo_1.0.deb");

        let (_file, _lock) = store.create_entry(&key).await.unwrap();
        let err = store.create_entry(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn entry_state_reflects_which_siblings_exist() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout).unwrap();
        let key = ObjectKey::new("debian", "pool/x/foo_1.0.deb");

        assert_eq!(store.entry_state(&key).await.unwrap(), EntryState::Missing);

        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"body").unwrap();
        assert_eq!(store.entry_state(&key).await.unwrap(), EntryState::Partial);

        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        store
            .commit(&key, Some(4), "http://mirror/debian/pool/x/foo_1.0.deb")
            .await
            .unwrap();
        assert_eq!(store.entry_state(&key).await.unwrap(), EntryState::Complete);
    }

    #[tokio::test]
    async fn commit_links_body_into_dedup_pool() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout.clone()).unwrap();
        let key = ObjectKey::new("debian", "pool/x/foo_1.0.deb");

        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"hello").unwrap();
        drop(file);

        let outcome = store
            .commit(&key, Some(5), "http://mirror/debian/foo_1.0.deb")
            .await
            .unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(outcome.content_length, 5);

        let pool_path = layout.pool_path("foo_1.0.deb", &outcome.sha1_hex);
        assert!(pool_path.exists());

        let complete_path = layout.complete_path(&key);
        assert_eq!(
            std::fs::read_to_string(&complete_path).unwrap(),
            "http://mirror/debian/foo_1.0.deb"
        );
    }

    #[tokio::test]
    async fn second_object_with_identical_content_dedups_against_pool() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout.clone()).unwrap();

        let key_a = ObjectKey::new("debian", "pool/x/foo_1.0.deb");
        let (mut file_a, lock_a) = store.create_entry(&key_a).await.unwrap();
        file_a.write_all(b"same content").unwrap();
        drop(file_a);
        store
            .commit(&key_a, Some(12), "http://mirror/a/foo_1.0.deb")
            .await
            .unwrap();
        drop(lock_a);

        let key_b = ObjectKey::new("ubuntu", "pool/x/foo_1.0.deb");
        let (mut file_b, _lock_b) = store.create_entry(&key_b).await.unwrap();
        file_b.write_all(b"same content").unwrap();
        drop(file_b);
        let outcome_b = store
            .commit(&key_b, Some(12), "http://mirror/b/foo_1.0.deb")
            .await
            .unwrap();

        assert!(outcome_b.deduplicated);

        let meta_a = std::fs::metadata(layout.package_path(&key_a)).unwrap();
        let meta_b = std::fs::metadata(layout.package_path(&key_b)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(meta_a.ino(), meta_b.ino());
        }
        let _ = (meta_a, meta_b);
    }

    #[tokio::test]
    async fn unlink_entry_removes_all_three_sibling_paths() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout.clone()).unwrap();
        let key = ObjectKey::new("debian", "Release");

        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"release data").unwrap();
        drop(file);
        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        store
            .commit(&key, Some(12), "http://mirror/debian/Release")
            .await
            .unwrap();

        store.unlink_entry(&key).await.unwrap();

        assert!(!layout.package_path(&key).exists());
        assert!(!layout.header_path(&key).exists());
        assert!(!layout.complete_path(&key).exists());
    }

    #[tokio::test]
    async fn header_scratch_is_invisible_until_finalized() {
        let (_dir, layout) = layout();
        let store = ContentStore::open(layout.clone()).unwrap();
        let key = ObjectKey::new("debian", "Release");

        store
            .write_header_scratch(&key, b"HTTP/1.1 302 Found\r\n".to_vec())
            .await
            .unwrap();
        assert!(store.read_header(&key).await.unwrap().is_none());

        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        let header = store.read_header(&key).await.unwrap().unwrap();
        assert_eq!(header, b"HTTP/1.1 200 OK\r\n");
    }
}
