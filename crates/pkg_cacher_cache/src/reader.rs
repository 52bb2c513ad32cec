//! The streaming reader (§4.5): waits for the header sidecar, sanitises it
//! for forwarding, resolves `Range`/`If-Range`/`If-Modified-Since`
//! semantics, and emits the body — following a fetcher that may still be
//! writing it.
//!
//! Headers are published atomically by the content store (scratch file,
//! rename on finalize — see §9's redesign note), so unlike the original
//! description this reader never has to poll through a transient `302`:
//! it either sees nothing yet, or the final response.

use crate::error::CoordinatorError;
use crate::freshness::parse_http_date;
use crate::httpmsg::{self, ParsedHeaders};
use pkg_cacher_store::{ContentStore, EntryState, ObjectKey};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// Body reads are chunked at 64 KiB (§4.5 point 6).
pub const READ_CHUNK: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Headers stripped before forwarding to the client — hop-by-hop fields
/// plus `Content-Length`/`Content-Range`, which the reader recomputes
/// itself for whatever body plan (full/ranged/none) it settles on.
const DROPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-range",
];

/// One inclusive byte range, already clamped to `[0, total_length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte, inclusive.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes this range covers.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range is never empty by construction (zero-length ranges are
    /// filtered out by the parser).
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// What body (if any) the caller should emit after writing the headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPlan {
    /// No body follows (4xx/5xx passthrough, `304`, `416`, `HEAD`).
    None,
    /// The full body, `total_length` bytes starting at offset 0.
    Full,
    /// A single byte range. `multipart/byteranges` is out of scope: a
    /// `Range` header naming two or more satisfiable ranges is served as a
    /// `206` for the first satisfiable one only, never as a multipart body
    /// (see `DESIGN.md`).
    Range(ByteRange),
}

/// Everything the request handler needs to write the response header and
/// then, if `body` isn't `None`, stream the body.
#[derive(Debug, Clone)]
pub struct StreamPlan {
    /// `200`, `206`, `304`, `416`, or whatever status the upstream sent.
    pub status_code: u16,
    /// The human-readable reason phrase for the status line.
    pub reason_phrase: String,
    /// Sanitised, forwardable headers, in order, including the final
    /// `Connection` header.
    pub headers: Vec<(String, String)>,
    /// What body to emit, if any.
    pub body: BodyPlan,
}

/// The request-specific inputs the streaming reader needs beyond the
/// object key: the headers the client sent that affect response shape.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Raw `Range: bytes=...` header value, if sent.
    pub range: Option<String>,
    /// Presence of `If-Range` cancels range handling entirely (§4.5 point 4).
    pub if_range: Option<String>,
    /// Raw `If-Modified-Since` header value, if sent.
    pub if_modified_since: Option<String>,
    /// Whether the connection is being kept alive (client `Connection`
    /// header plus protocol version), determining the outgoing
    /// `Connection` header.
    pub keep_alive: bool,
    /// `true` for a `HEAD` request — body plan is always forced to `None`.
    pub head_only: bool,
}

/// Builds the response plan for one request (§4.5 points 1-5), and
/// separately streams the body (§4.5 point 6) via [`stream_body`].
pub struct StreamingReader<'a> {
    store: &'a ContentStore,
    stall_timeout: Duration,
}

impl<'a> StreamingReader<'a> {
    /// Builds a reader bound to `store`, with `stall_timeout` applied both
    /// while awaiting headers and while awaiting body progress.
    pub fn new(store: &'a ContentStore, stall_timeout: Duration) -> Self {
        StreamingReader { store, stall_timeout }
    }

    /// §4.5 point 1: poll `headers/...` until it is non-empty, bounded by
    /// the stall timeout. Returns [`CoordinatorError::FetcherCrashed`] if
    /// the lock is free and the entry isn't complete — a prior fetcher
    /// died before ever writing the sidecar, and the coordinator should
    /// re-enter the decide-to-fetch path as the new fetcher.
    pub async fn await_header(&self, key: &ObjectKey) -> Result<ParsedHeaders, CoordinatorError> {
        let start = Instant::now();
        loop {
            if let Some(bytes) = self.store.read_header(key).await? {
                if let Some(parsed) = httpmsg::parse(&bytes) {
                    return Ok(parsed);
                }
            }

            let body_path = self.store.layout().package_path(key);
            if !pkg_cacher_store::probe_entry_lock(&body_path).await? {
                let state = self.store.entry_state(key).await?;
                if state != EntryState::Complete {
                    return Err(CoordinatorError::FetcherCrashed);
                }
                // Lock just released and entry is complete: the header
                // write happens before commit in this store's sequencing,
                // so the next poll will see it.
            }

            if start.elapsed() > self.stall_timeout {
                return Err(CoordinatorError::HeaderTimeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Runs §4.5 points 1-5 and returns the plan the caller should act on.
    pub async fn plan(
        &self,
        key: &ObjectKey,
        request: &StreamRequest,
    ) -> Result<StreamPlan, CoordinatorError> {
        let parsed = self.await_header(key).await?;
        let total_length = parsed.content_length().unwrap_or(0);
        let forwarded = sanitize_for_forwarding(&parsed, request.keep_alive);

        if parsed.status_code != 200 {
            let mut headers = forwarded;
            set_connection(&mut headers, false);
            if let Some(len) = parsed.content_length() {
                headers.insert(0, ("Content-Length".to_string(), len.to_string()));
            }
            return Ok(StreamPlan {
                status_code: parsed.status_code,
                reason_phrase: reason_from_status_line(&parsed.status_line, parsed.status_code),
                headers,
                body: BodyPlan::None,
            });
        }

        if let (Some(since_raw), None) = (&request.if_modified_since, &request.range) {
            if let Some(cached_lm) = parsed.get("Last-Modified") {
                if let (Some(cached), Some(since)) =
                    (parse_http_date(cached_lm), parse_http_date(since_raw))
                {
                    if cached <= since {
                        let mut headers = forwarded;
                        set_connection(&mut headers, request.keep_alive);
                        return Ok(StreamPlan {
                            status_code: 304,
                            reason_phrase: "Not Modified".to_string(),
                            headers,
                            body: BodyPlan::None,
                        });
                    }
                }
            }
        }

        if request.head_only {
            let mut headers = forwarded;
            set_connection(&mut headers, request.keep_alive);
            headers.insert(0, ("Content-Length".to_string(), total_length.to_string()));
            headers.insert(0, ("Accept-Ranges".to_string(), "bytes".to_string()));
            return Ok(StreamPlan {
                status_code: 200,
                reason_phrase: "OK".to_string(),
                headers,
                body: BodyPlan::None,
            });
        }

        // §4.5 point 4: `If-Range` being present cancels range handling.
        if let (Some(range_raw), None) = (&request.range, &request.if_range) {
            let ranges = parse_range_header(range_raw, total_length);
            match ranges.and_then(|rs| rs.into_iter().next()) {
                None => {
                    let mut headers = forwarded;
                    set_connection(&mut headers, false);
                    return Ok(StreamPlan {
                        status_code: 416,
                        reason_phrase: "Range Not Satisfiable".to_string(),
                        headers,
                        body: BodyPlan::None,
                    });
                }
                Some(range) => {
                    let mut headers = forwarded;
                    headers.insert(
                        0,
                        (
                            "Content-Range".to_string(),
                            format!("bytes {}-{}/{}", range.start, range.end, total_length),
                        ),
                    );
                    headers.insert(0, ("Content-Length".to_string(), range.len().to_string()));
                    headers.insert(0, ("Accept-Ranges".to_string(), "bytes".to_string()));
                    set_connection(&mut headers, request.keep_alive);
                    return Ok(StreamPlan {
                        status_code: 206,
                        reason_phrase: "Partial Content".to_string(),
                        headers,
                        body: BodyPlan::Range(range),
                    });
                }
            }
        }

        let mut headers = forwarded;
        headers.insert(0, ("Content-Length".to_string(), total_length.to_string()));
        headers.insert(0, ("Accept-Ranges".to_string(), "bytes".to_string()));
        set_connection(&mut headers, request.keep_alive);
        Ok(StreamPlan {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers,
            body: BodyPlan::Full,
        })
    }

    /// §4.5 point 6: streams `range` (or the whole file, for [`BodyPlan::Full`]
    /// expressed as `ByteRange { start: 0, end: total_length - 1 }`) from
    /// `file` to `writer`, following a concurrent writer past the current
    /// end-of-file and stopping only once the completion marker appears.
    pub async fn stream_body<W: AsyncWrite + Unpin>(
        &self,
        key: &ObjectKey,
        file: &mut tokio::fs::File,
        range: ByteRange,
        writer: &mut W,
    ) -> Result<u64, CoordinatorError> {
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| CoordinatorError::Io("seeking cached body".to_string(), e))?;

        let mut remaining = range.len();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut last_progress = Instant::now();
        let mut written = 0u64;

        while remaining > 0 {
            let want = remaining.min(READ_CHUNK as u64) as usize;
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| CoordinatorError::Io("reading cached body".to_string(), e))?;

            if n == 0 {
                if self.store.entry_state(key).await? == EntryState::Complete {
                    let n2 = file
                        .read(&mut buf[..want])
                        .await
                        .map_err(|e| CoordinatorError::Io("reading cached body".to_string(), e))?;
                    if n2 == 0 {
                        break;
                    }
                    writer
                        .write_all(&buf[..n2])
                        .await
                        .map_err(|e| CoordinatorError::Io("writing response body".to_string(), e))?;
                    written += n2 as u64;
                    remaining -= n2 as u64;
                    last_progress = Instant::now();
                    continue;
                }

                if last_progress.elapsed() > self.stall_timeout {
                    return Err(CoordinatorError::BodyStalled);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| CoordinatorError::Io("writing response body".to_string(), e))?;
            written += n as u64;
            remaining -= n as u64;
            last_progress = Instant::now();
        }

        writer
            .flush()
            .await
            .map_err(|e| CoordinatorError::Io("flushing response body".to_string(), e))?;
        Ok(written)
    }
}

/// Drops hop-by-hop and length-framing headers, keeping `Last-Modified`,
/// `Content-*`, `Accept-*`, `ETag`, `Age` (§4.5 point 2).
fn sanitize_for_forwarding(parsed: &ParsedHeaders, keep_alive: bool) -> Vec<(String, String)> {
    let headers = parsed
        .headers
        .iter()
        .filter(|(k, _)| !DROPPED.contains(&k.to_ascii_lowercase().as_str()))
        .cloned()
        .collect();
    let _ = keep_alive;
    headers
}

fn set_connection(headers: &mut Vec<(String, String)>, keep_alive: bool) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case("connection"));
    headers.push((
        "Connection".to_string(),
        if keep_alive { "Keep-Alive" } else { "Close" }.to_string(),
    ));
}

fn reason_from_status_line(status_line: &str, code: u16) -> String {
    let reason: String = status_line.split_whitespace().skip(2).collect::<Vec<_>>().join(" ");
    if reason.is_empty() {
        default_reason(code).to_string()
    } else {
        reason
    }
}

fn default_reason(code: u16) -> &'static str {
    match code {
        404 => "Not Found",
        403 => "Forbidden",
        410 => "Gone",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Parses a `Range: bytes=...` value into zero or more ranges, each
/// clamped to `[0, total_length)`. A suffix range (`bytes=-N`) is treated
/// strictly as "last N bytes" (§9's open question, resolved per the
/// spec's recommendation). Ranges that don't overlap `[0, total_length)`
/// at all are silently dropped rather than causing the whole header to be
/// rejected (§8 boundary behaviour: "multi-range with one fully-out-of-range
/// and one valid part emits only the valid part"). Returns `None` only if
/// the header doesn't even look like a `bytes=` range spec.
pub fn parse_range_header(value: &str, total_length: u64) -> Option<Vec<ByteRange>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if total_length == 0 {
        return Some(Vec::new());
    }

    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some(suffix) = part.strip_prefix('-') {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                continue;
            }
            let n = n.min(total_length);
            ranges.push(ByteRange {
                start: total_length - n,
                end: total_length - 1,
            });
            continue;
        }

        let (start_s, end_s) = part.split_once('-')?;
        let start: u64 = start_s.parse().ok()?;
        if start >= total_length {
            continue;
        }
        let end = if end_s.is_empty() {
            total_length - 1
        } else {
            end_s.parse::<u64>().ok()?.min(total_length - 1)
        };
        if end < start {
            continue;
        }
        ranges.push(ByteRange { start, end });
    }

    Some(ranges)
}

#[cfg(test)]
mod test {
    use super::*;
    use pkg_cacher_store::CacheLayout;
    use std::io::Write as _;

    #[test]
    fn parses_simple_range() {
        let ranges = parse_range_header("bytes=0-99", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange { start: 0, end: 99 }]);
    }

    #[test]
    fn parses_open_ended_range() {
        let ranges = parse_range_header("bytes=900-", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange { start: 900, end: 999 }]);
    }

    #[test]
    fn suffix_range_is_last_n_bytes() {
        let ranges = parse_range_header("bytes=-100", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange { start: 900, end: 999 }]);
    }

    #[test]
    fn suffix_range_larger_than_total_clamps_to_whole_body() {
        let ranges = parse_range_header("bytes=-5000", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange { start: 0, end: 999 }]);
    }

    #[test]
    fn multi_range_drops_out_of_range_part_keeps_valid_one() {
        let ranges = parse_range_header("bytes=2000-3000,0-9", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange { start: 0, end: 9 }]);
    }

    #[test]
    fn multi_range_with_two_valid_parts_keeps_both_parsed() {
        // The parser itself keeps every satisfiable range; it's `plan`
        // (below) that narrows to the first one for serving.
        let ranges = parse_range_header("bytes=0-9,20-29", 1000).unwrap();
        assert_eq!(
            ranges,
            vec![ByteRange { start: 0, end: 9 }, ByteRange { start: 20, end: 29 }]
        );
    }

    #[test]
    fn unrecognised_header_returns_none() {
        assert!(parse_range_header("items=0-9", 1000).is_none());
    }

    fn store_with_complete_entry(body: &[u8]) -> (tempfile::TempDir, ContentStore, ObjectKey) {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        let store = ContentStore::open(layout).unwrap();
        let key = ObjectKey::new("debian", "pool/x/foo_1.0.deb");
        (dir, store, key)
    }

    #[tokio::test]
    async fn plan_full_body_on_plain_get() {
        let (_dir, store, key) = store_with_complete_entry(b"hello world");
        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"hello world").unwrap();
        drop(file);
        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        store.commit(&key, Some(11), "http://mirror/foo").await.unwrap();

        let reader = StreamingReader::new(&store, Duration::from_secs(1));
        let plan = reader.plan(&key, &StreamRequest::default()).await.unwrap();
        assert_eq!(plan.status_code, 200);
        assert_eq!(plan.body, BodyPlan::Full);
    }

    #[tokio::test]
    async fn plan_satisfies_range_request() {
        let (_dir, store, key) = store_with_complete_entry(b"0123456789");
        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"0123456789").unwrap();
        drop(file);
        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        store.commit(&key, Some(10), "http://mirror/foo").await.unwrap();

        let reader = StreamingReader::new(&store, Duration::from_secs(1));
        let request = StreamRequest {
            range: Some("bytes=2-4".to_string()),
            ..Default::default()
        };
        let plan = reader.plan(&key, &request).await.unwrap();
        assert_eq!(plan.status_code, 206);
        assert_eq!(plan.body, BodyPlan::Range(ByteRange { start: 2, end: 4 }));

        let read_file = store.open_for_read(&key).await.unwrap();
        let mut tokio_file = tokio::fs::File::from_std(read_file);
        let mut out = Vec::new();
        let range = match plan.body {
            BodyPlan::Range(r) => r,
            _ => unreachable!(),
        };
        reader
            .stream_body(&key, &mut tokio_file, range, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"234");
    }

    #[tokio::test]
    async fn plan_with_two_valid_ranges_serves_only_the_first() {
        let (_dir, store, key) = store_with_complete_entry(b"0123456789");
        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"0123456789").unwrap();
        drop(file);
        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        store.commit(&key, Some(10), "http://mirror/foo").await.unwrap();

        let reader = StreamingReader::new(&store, Duration::from_secs(1));
        let request = StreamRequest {
            range: Some("bytes=0-2,6-8".to_string()),
            ..Default::default()
        };
        let plan = reader.plan(&key, &request).await.unwrap();
        assert_eq!(plan.status_code, 206);
        assert_eq!(plan.body, BodyPlan::Range(ByteRange { start: 0, end: 2 }));
        assert!(plan.headers.iter().any(|(k, v)| k == "Content-Range" && v == "bytes 0-2/10"));
    }

    #[tokio::test]
    async fn if_range_present_cancels_range_handling() {
        let (_dir, store, key) = store_with_complete_entry(b"0123456789");
        let (mut file, _lock) = store.create_entry(&key).await.unwrap();
        file.write_all(b"0123456789").unwrap();
        drop(file);
        store
            .write_header_scratch(&key, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec())
            .await
            .unwrap();
        store.finalize_header(&key).await.unwrap();
        store.commit(&key, Some(10), "http://mirror/foo").await.unwrap();

        let reader = StreamingReader::new(&store, Duration::from_secs(1));
        let request = StreamRequest {
            range: Some("bytes=2-4".to_string()),
            if_range: Some("some-etag".to_string()),
            ..Default::default()
        };
        let plan = reader.plan(&key, &request).await.unwrap();
        assert_eq!(plan.body, BodyPlan::Full);
    }

    #[tokio::test]
    async fn missing_entry_with_no_fetcher_reports_crashed() {
        let (_dir, store, key) = store_with_complete_entry(b"");
        let (file, lock) = store.create_entry(&key).await.unwrap();
        drop(file);
        drop(lock);

        let reader = StreamingReader::new(&store, Duration::from_millis(200));
        let err = reader.await_header(&key).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::FetcherCrashed));
    }
}
