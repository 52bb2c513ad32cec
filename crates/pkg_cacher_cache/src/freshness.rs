//! The freshness algorithm for index files (§4.4 "Freshness algorithm"):
//! age-expiry first, then `ETag`/`Last-Modified` revalidation against a
//! HEAD, with `OFFLINE` on network failure.

use crate::error::CoordinatorError;
use chrono::{DateTime, Utc};
use pkg_cacher_net::{FetchDisposition, Fetcher};
use std::time::{Duration, SystemTime};
use url::Url;

/// One of the five statuses the coordinator can settle on for a request
/// (§4.4). `ForcedExpired` is the client `Cache-Control`/`Pragma:
/// no-cache` case, kept distinct from `Expired` only for logging —
/// both drive identical behaviour (unlink and re-fetch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served straight from the cache; no upstream call was made.
    Hit,
    /// The cached index file is stale; refetch.
    Expired,
    /// No usable cache entry exists yet.
    Miss,
    /// A revalidation HEAD failed; the stale entry is served as-is.
    Offline,
    /// The client forced revalidation via `Cache-Control`/`Pragma: no-cache`.
    ForcedExpired,
}

impl CacheStatus {
    /// The access-log token for this status (§6 "Access log format").
    pub fn as_log_token(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Expired | CacheStatus::ForcedExpired => "EXPIRED",
            CacheStatus::Miss => "MISS",
            CacheStatus::Offline => "OFFLINE",
        }
    }
}

/// The subset of the configuration record the freshness check needs.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    /// Index max-age in hours; `0` means always revalidate.
    pub expire_hours: u64,
    /// Prefer `ETag` over `Last-Modified` when both are present.
    pub use_etags: bool,
    /// Resolves the open question (§9): whether a HEAD that returns
    /// neither `ETag` nor `Last-Modified` counts as fresh.
    pub ambiguous_revalidation_is_hit: bool,
}

/// The cache-relevant metadata already on disk for an entry.
#[derive(Debug, Clone, Default)]
pub struct CachedMeta {
    /// `ETag` recorded from the last successful fetch, if any.
    pub etag: Option<String>,
    /// `Last-Modified` recorded from the last successful fetch, if any.
    pub last_modified: Option<String>,
    /// The body file's on-disk mtime.
    pub body_mtime: SystemTime,
}

/// Runs the §4.4 freshness algorithm for an index file that already has a
/// complete cache entry. Static files never call this — they are always
/// `Hit` once complete, since they are immutable by basename (§4.4 table).
pub async fn evaluate(
    policy: FreshnessPolicy,
    cached: &CachedMeta,
    fetcher: &Fetcher,
    candidates: &[Url],
    uri: &str,
) -> Result<CacheStatus, CoordinatorError> {
    if policy.expire_hours > 0 {
        let age = SystemTime::now()
            .duration_since(cached.body_mtime)
            .unwrap_or_default();
        if age > Duration::from_secs(policy.expire_hours * 3600) {
            return Ok(CacheStatus::Expired);
        }
    }

    let outcome = fetcher.head(candidates, uri, false).await?;
    match outcome.disposition {
        FetchDisposition::AllCandidatesFailed => Ok(CacheStatus::Offline),
        // The origin itself now 4xxs this object. Treat as expired so the
        // coordinator re-fetches and the real error surfaces to the
        // client, rather than silently continuing to serve stale bytes.
        FetchDisposition::UpstreamClientError => Ok(CacheStatus::Expired),
        FetchDisposition::Success => {
            if policy.use_etags {
                if let (Some(old), Some(new)) = (&cached.etag, &outcome.etag) {
                    return Ok(if old == new {
                        CacheStatus::Hit
                    } else {
                        CacheStatus::Expired
                    });
                }
            }

            if let (Some(old), Some(new)) = (&cached.last_modified, &outcome.last_modified) {
                return Ok(match (parse_http_date(old), parse_http_date(new)) {
                    (Some(old), Some(new)) if old >= new => CacheStatus::Hit,
                    (Some(_), Some(_)) => CacheStatus::Expired,
                    _ => ambiguous(policy),
                });
            }

            Ok(ambiguous(policy))
        }
    }
}

fn ambiguous(policy: FreshnessPolicy) -> CacheStatus {
    if policy.ambiguous_revalidation_is_hit {
        CacheStatus::Hit
    } else {
        CacheStatus::Expired
    }
}

/// Parses an HTTP-date (`Last-Modified`/`If-Modified-Since` format, e.g.
/// `Tue, 01 Jan 2024 00:00:00 GMT`).
pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s.trim(), "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_standard_http_date() {
        let dt = parse_http_date("Tue, 01 Jan 2024 00:00:00 GMT").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn rejects_malformed_date() {
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn cached_at_least_as_new_is_fresh() {
        let old = parse_http_date("Tue, 01 Jan 2024 00:00:00 GMT").unwrap();
        let same = parse_http_date("Tue, 01 Jan 2024 00:00:00 GMT").unwrap();
        assert!(old >= same);
    }

    #[tokio::test]
    async fn age_expiry_short_circuits_before_any_network_call() {
        let policy = FreshnessPolicy {
            expire_hours: 1,
            use_etags: true,
            ambiguous_revalidation_is_hit: true,
        };
        let cached = CachedMeta {
            etag: None,
            last_modified: None,
            body_mtime: SystemTime::now() - Duration::from_secs(3 * 3600),
        };
        let client = pkg_cacher_net::build_client(&Default::default()).unwrap();
        let fetcher = Fetcher::new(client, Duration::from_secs(1), None);
        // No candidates configured at all — if this call reached the
        // network path it would return an error, not a status.
        let status = evaluate(policy, &cached, &fetcher, &[], "Release")
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Expired);
    }
}
