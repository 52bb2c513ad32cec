//! The cache coordinator (§4.4): decides `HIT`/`EXPIRED`/`MISS`/`OFFLINE`,
//! ensures at-most-one fetcher per object key, and hands off to whichever
//! goroutine becomes that fetcher.

use crate::error::CoordinatorError;
use crate::freshness::{self, CacheStatus, CachedMeta, FreshnessPolicy};
use crate::httpmsg;
use async_trait::async_trait;
use pkg_cacher_net::{BodySink, FetchDisposition, FetchError, Fetcher, HeaderSink};
use pkg_cacher_store::{ContentStore, EntryState, ObjectKey, StoreError};
use std::sync::Arc;
use std::time::SystemTime;
use url::Url;

/// Everything the coordinator needs to know about one request beyond the
/// object key: the ordered upstream candidates, whether this is an index
/// file (subject to revalidation) or a static one, whether the client
/// forced revalidation, and the freshness policy to apply.
#[derive(Debug, Clone)]
pub struct CoordinateRequest<'a> {
    /// Ordered mirror candidates for this object's vhost.
    pub candidates: &'a [Url],
    /// The path beneath the vhost, as passed to the fetcher.
    pub uri: &'a str,
    /// `true` for `Release`/`Packages*`/`repomd.xml`-like metadata,
    /// `false` for opaque artifacts (`.deb`/`.rpm`/...).
    pub is_index_file: bool,
    /// The client sent `Cache-Control: no-cache` or `Pragma: no-cache`.
    pub client_no_cache: bool,
    /// The freshness policy (from the live configuration).
    pub policy: FreshnessPolicy,
}

/// Couples the content store and upstream fetcher behind the §4.4
/// decision procedure.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<ContentStore>,
    fetcher: Arc<Fetcher>,
}

impl Coordinator {
    /// Builds a coordinator over an already-open store and fetcher.
    pub fn new(store: Arc<ContentStore>, fetcher: Arc<Fetcher>) -> Self {
        Coordinator { store, fetcher }
    }

    /// The content store backing this coordinator — exposed so the
    /// request handler can open the body for reading once a status has
    /// been decided.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Runs the §4.4 decision procedure and, if this call is the one that
    /// must populate the entry, performs the fetch before returning. The
    /// returned status is monotonic within a request: `HIT -> EXPIRED ->
    /// MISS`, never backwards (§3 "Cache status monotonicity").
    pub async fn coordinate(
        &self,
        key: &ObjectKey,
        request: CoordinateRequest<'_>,
    ) -> Result<CacheStatus, CoordinatorError> {
        let state = self.store.entry_state(key).await?;

        let status = if state == EntryState::Complete {
            if request.client_no_cache {
                CacheStatus::ForcedExpired
            } else if !request.is_index_file {
                CacheStatus::Hit
            } else {
                let cached = self.cached_meta(key).await?;
                freshness::evaluate(
                    request.policy,
                    &cached,
                    &self.fetcher,
                    request.candidates,
                    request.uri,
                )
                .await?
            }
        } else {
            CacheStatus::Miss
        };

        match status {
            CacheStatus::Hit | CacheStatus::Offline => Ok(status),
            CacheStatus::Expired | CacheStatus::ForcedExpired | CacheStatus::Miss => {
                if matches!(status, CacheStatus::Expired | CacheStatus::ForcedExpired) {
                    self.store.unlink_entry(key).await?;
                }
                self.become_fetcher_or_follow(key, &request).await?;
                Ok(status)
            }
        }
    }

    async fn cached_meta(&self, key: &ObjectKey) -> Result<CachedMeta, CoordinatorError> {
        let header_bytes = self.store.read_header(key).await?.unwrap_or_default();
        let parsed = httpmsg::parse(&header_bytes);
        let body_mtime = tokio::fs::metadata(self.store.layout().package_path(key))
            .await
            .map(|m| m.modified().unwrap_or(SystemTime::now()))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(CachedMeta {
            etag: parsed.as_ref().and_then(|h| h.get("ETag")).map(str::to_string),
            last_modified: parsed
                .as_ref()
                .and_then(|h| h.get("Last-Modified"))
                .map(str::to_string),
            body_mtime,
        })
    }

    /// §4.4 "Decision to (re)fetch": either we win the race to create the
    /// entry and become the fetcher, or we discover a sibling already
    /// holds the per-entry lock and simply let the streaming reader follow
    /// it, or we discover a crashed fetcher (no lock, no marker) and retry
    /// once as the fetcher ourselves.
    async fn become_fetcher_or_follow(
        &self,
        key: &ObjectKey,
        request: &CoordinateRequest<'_>,
    ) -> Result<(), CoordinatorError> {
        match self.store.create_entry(key).await {
            Ok((file, entry_lock)) => self.run_fetch(key, request, file, entry_lock).await,
            Err(StoreError::AlreadyExists(_)) => {
                let body_path = self.store.layout().package_path(key);
                if pkg_cacher_store::probe_entry_lock(&body_path).await? {
                    // A sibling request is already the fetcher; the
                    // streaming reader will follow its writes.
                    Ok(())
                } else {
                    // No one holds the lock and no completion marker
                    // exists: the previous fetcher crashed (§9, §4.5
                    // point 7's crash-recovery sentinel). Re-create and
                    // become the fetcher.
                    self.store.unlink_entry(key).await?;
                    let (file, entry_lock) = self.store.create_entry(key).await?;
                    self.run_fetch(key, request, file, entry_lock).await
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_fetch(
        &self,
        key: &ObjectKey,
        request: &CoordinateRequest<'_>,
        file: std::fs::File,
        entry_lock: pkg_cacher_store::EntryLockGuard,
    ) -> Result<(), CoordinatorError> {
        let body_path = self.store.layout().package_path(key);
        let mut tokio_file = tokio::fs::File::from_std(file);
        let header_sink = StoreHeaderSink {
            store: self.store.clone(),
            key: key.clone(),
        };
        let mut sink = BodySink {
            file: &mut tokio_file,
            body_path: &body_path,
        };

        let outcome = self
            .fetcher
            .get(
                request.candidates,
                request.uri,
                request.client_no_cache,
                &header_sink,
                &mut sink,
            )
            .await?;
        drop(sink);
        drop(tokio_file);

        match outcome.disposition {
            FetchDisposition::Success => {
                let source_url = outcome
                    .final_url
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| request.uri.to_string());
                let commit_outcome = self
                    .store
                    .commit(key, outcome.content_length, &source_url)
                    .await?;

                // Upstream used chunked encoding and never sent a
                // Content-Length: synthesise one from the verified body
                // size now that it's known, so the sidecar readers poll
                // for carries the authoritative length (§3 "Completion
                // marker implies body integrity").
                if outcome.content_length.is_none() {
                    let synced = pkg_cacher_net::headers::synthesize_content_length(
                        &outcome.raw_headers,
                        commit_outcome.content_length,
                    );
                    self.store.write_header_scratch(key, synced).await?;
                    self.store.finalize_header(key).await?;
                }
            }
            FetchDisposition::UpstreamClientError | FetchDisposition::AllCandidatesFailed => {
                self.store
                    .write_header_scratch(key, outcome.raw_headers)
                    .await?;
                self.store.finalize_header(key).await?;
                self.store.unlink_body_only(key).await?;
            }
        }

        drop(entry_lock);
        Ok(())
    }
}

/// Bridges the fetcher's [`HeaderSink`] trait to the content store's
/// scratch-then-rename header publication, so a concurrent reader sees
/// the real response header the instant it is known — before the body
/// has finished streaming.
struct StoreHeaderSink {
    store: Arc<ContentStore>,
    key: ObjectKey,
}

#[async_trait]
impl HeaderSink for StoreHeaderSink {
    async fn publish(&self, raw_headers: &[u8]) -> Result<(), FetchError> {
        self.store
            .write_header_scratch(&self.key, raw_headers.to_vec())
            .await
            .map_err(|e| FetchError::io("publishing header sidecar", io_error(e)))?;
        self.store
            .finalize_header(&self.key)
            .await
            .map_err(|e| FetchError::io("finalizing header sidecar", io_error(e)))
    }
}

fn io_error(e: StoreError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
