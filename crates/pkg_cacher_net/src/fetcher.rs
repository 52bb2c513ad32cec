//! The upstream fetcher (§4.3): ordered candidate failover, per-candidate
//! retry/redirect budgets, and streamed body writes with a bandwidth cap
//! and stall timeout.

use crate::error::FetchError;
use crate::headers::{format_raw_headers, synthesize_error_headers};
use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Per-candidate retry budget for "no response" or HTTP 400 (§4.3 point 2).
pub const RETRY_BUDGET: u32 = 5;
/// Per-candidate redirect budget (§4.3 point 2).
pub const REDIRECT_BUDGET: u32 = 5;

/// HEAD or GET — GET additionally streams the body into a [`BodySink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Freshness-check request; no body is transferred.
    Head,
    /// Full download; the body is streamed into the provided sink.
    Get,
}

/// How the request resolved: a normal 2xx, a terminal 4xx (§4.3 point 3),
/// or exhaustion of every candidate's retry/redirect budget (§4.3 point 4).
/// All three are returned as `Ok(FetchOutcome)`, not `Err` — every one of
/// them produces a header the caller must persist; only genuine local I/O
/// failure is an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    /// Upstream answered 2xx.
    Success,
    /// Upstream answered with a 4xx other than a retried 400.
    UpstreamClientError,
    /// No candidate produced a usable response.
    AllCandidatesFailed,
}

/// The result of one `head`/`get` call: status, cache-relevant headers,
/// and the raw header bytes ready to persist to the sidecar.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// How the fetch resolved.
    pub disposition: FetchDisposition,
    /// The final HTTP status code (synthesised for `AllCandidatesFailed`).
    pub status: u16,
    /// The URL that was actually requested for a `Success`/`UpstreamClientError`
    /// disposition — the source URL recorded in the completion marker.
    pub final_url: Option<Url>,
    /// `Content-Length`, if the upstream declared one.
    pub content_length: Option<u64>,
    /// `ETag`, if present.
    pub etag: Option<String>,
    /// `Last-Modified`, if present.
    pub last_modified: Option<String>,
    /// Raw status-line + headers, ready to persist verbatim.
    pub raw_headers: Vec<u8>,
}

/// Where a GET writes its body, and the paths needed to reset it between
/// retries/redirects (§4.3 point 2: "truncate the local body file to zero
/// and delete the partial header/marker before retrying").
pub struct BodySink<'a> {
    /// The already-created, writable body file, positioned at 0.
    pub file: &'a mut tokio::fs::File,
    /// Its path, so the fetcher can truncate-and-reopen between attempts.
    pub body_path: &'a Path,
}

/// Publishes the response header sidecar the instant a successful
/// response's headers are known, *before* the body has finished
/// streaming — the mechanism that lets a second reader start following
/// the growing body file while the first fetch is still in flight (§4.5,
/// "follow-the-writer semantics"). Implemented by the cache coordinator on
/// top of the content store; this crate only depends on the trait so it
/// stays free of a `pkg_cacher_store` dependency.
#[async_trait::async_trait]
pub trait HeaderSink: Send + Sync {
    /// Persists `raw_headers` so readers waiting on the sidecar can
    /// proceed.
    async fn publish(&self, raw_headers: &[u8]) -> Result<(), FetchError>;
}

/// Performs HEAD/GET requests against an ordered candidate list with
/// failover, redirect following, retries, an egress bandwidth cap, and a
/// stall timeout.
pub struct Fetcher {
    client: Client,
    stall_timeout: Duration,
    bandwidth_limit: Option<u64>,
}

impl Fetcher {
    /// Builds a fetcher around an already-configured `reqwest::Client`
    /// (see [`crate::client::build_client`]).
    pub fn new(client: Client, stall_timeout: Duration, bandwidth_limit: Option<u64>) -> Self {
        Fetcher {
            client,
            stall_timeout,
            bandwidth_limit,
        }
    }

    /// Issues a freshness-check HEAD across `candidates` for `uri`.
    pub async fn head(
        &self,
        candidates: &[Url],
        uri: &str,
        client_no_cache: bool,
    ) -> Result<FetchOutcome, FetchError> {
        self.run(FetchMode::Head, candidates, uri, client_no_cache, None, None)
            .await
    }

    /// Performs a full GET across `candidates` for `uri`, publishing the
    /// header sidecar via `header_sink` as soon as a successful response's
    /// headers are known, then streaming the body into `sink`.
    pub async fn get(
        &self,
        candidates: &[Url],
        uri: &str,
        client_no_cache: bool,
        header_sink: &dyn HeaderSink,
        sink: &mut BodySink<'_>,
    ) -> Result<FetchOutcome, FetchError> {
        self.run(
            FetchMode::Get,
            candidates,
            uri,
            client_no_cache,
            Some(header_sink),
            Some(sink),
        )
        .await
    }

    async fn run(
        &self,
        mode: FetchMode,
        candidates: &[Url],
        uri: &str,
        client_no_cache: bool,
        header_sink: Option<&dyn HeaderSink>,
        mut sink: Option<&mut BodySink<'_>>,
    ) -> Result<FetchOutcome, FetchError> {
        if candidates.is_empty() {
            return Err(FetchError::NoCandidates);
        }

        let mut last_reason = String::from("no candidates attempted");

        for candidate in candidates {
            match self
                .try_candidate(
                    mode,
                    candidate,
                    uri,
                    client_no_cache,
                    header_sink,
                    sink.as_deref_mut(),
                )
                .await?
            {
                CandidateOutcome::Settled(outcome) => return Ok(outcome),
                CandidateOutcome::Exhausted(reason) => last_reason = reason,
            }
        }

        let raw_headers = synthesize_error_headers(502, &format!("libcurl error: {last_reason}"));
        Ok(FetchOutcome {
            disposition: FetchDisposition::AllCandidatesFailed,
            status: 502,
            final_url: None,
            content_length: None,
            etag: None,
            last_modified: None,
            raw_headers,
        })
    }

    async fn try_candidate(
        &self,
        mode: FetchMode,
        candidate: &Url,
        uri: &str,
        client_no_cache: bool,
        header_sink: Option<&dyn HeaderSink>,
        mut sink: Option<&mut BodySink<'_>>,
    ) -> Result<CandidateOutcome, FetchError> {
        let mut current_url = build_url(candidate, uri);
        let mut retries = 0u32;
        let mut redirects = 0u32;

        loop {
            if let Some(sink) = sink.as_deref_mut() {
                if mode == FetchMode::Get && (retries > 0 || redirects > 0) {
                    reset_sink(sink).await?;
                }
            }

            let response = self.send(mode, &current_url, client_no_cache).await;

            match response {
                Err(_transport_err) => {
                    retries += 1;
                    if retries > RETRY_BUDGET {
                        return Ok(CandidateOutcome::Exhausted("no response".to_string()));
                    }
                    continue;
                }
                Ok(response) => {
                    let status = response.status();

                    if status.is_redirection() {
                        redirects += 1;
                        if redirects > REDIRECT_BUDGET {
                            return Ok(CandidateOutcome::Exhausted(
                                "redirect budget exhausted".to_string(),
                            ));
                        }
                        match next_redirect_url(&response, candidate) {
                            Some(url) => {
                                current_url = url;
                                continue;
                            }
                            None => {
                                return Ok(CandidateOutcome::Exhausted(
                                    "invalid redirect location".to_string(),
                                ))
                            }
                        }
                    }

                    if status.as_u16() == 400 {
                        retries += 1;
                        if retries > RETRY_BUDGET {
                            return Ok(CandidateOutcome::Exhausted("HTTP 400".to_string()));
                        }
                        continue;
                    }

                    if status.is_success() {
                        let content_length = response.content_length();
                        let etag = header_str(&response, reqwest::header::ETAG);
                        let last_modified = header_str(&response, reqwest::header::LAST_MODIFIED);
                        let raw_headers = format_raw_headers(&response);

                        if mode == FetchMode::Get {
                            if let Some(header_sink) = header_sink {
                                header_sink.publish(&raw_headers).await?;
                            }
                            if let Some(sink) = sink.as_deref_mut() {
                                self.stream_body(response, sink.file).await?;
                            }
                        }

                        return Ok(CandidateOutcome::Settled(FetchOutcome {
                            disposition: FetchDisposition::Success,
                            status: status.as_u16(),
                            final_url: Some(current_url),
                            content_length,
                            etag,
                            last_modified,
                            raw_headers,
                        }));
                    }

                    if status.is_client_error() {
                        let raw_headers = format_raw_headers(&response);
                        return Ok(CandidateOutcome::Settled(FetchOutcome {
                            disposition: FetchDisposition::UpstreamClientError,
                            status: status.as_u16(),
                            final_url: Some(current_url),
                            content_length: response.content_length(),
                            etag: None,
                            last_modified: None,
                            raw_headers,
                        }));
                    }

                    // 5xx and anything else unspecified: treat like a
                    // transient transport failure, subject to the same
                    // retry budget as "no response".
                    retries += 1;
                    if retries > RETRY_BUDGET {
                        return Ok(CandidateOutcome::Exhausted(format!("HTTP {status}")));
                    }
                }
            }
        }
    }

    async fn send(
        &self,
        mode: FetchMode,
        url: &Url,
        client_no_cache: bool,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = match mode {
            FetchMode::Head => self.client.head(url.clone()),
            FetchMode::Get => self.client.get(url.clone()),
        };
        // §4.3: forward the client's no-cache request upstream; otherwise
        // send a suppressing empty Pragma so libcurl-alike upstream
        // libraries don't inject their own.
        builder = if client_no_cache {
            builder.header(reqwest::header::PRAGMA, "no-cache")
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
        } else {
            builder.header(reqwest::header::PRAGMA, "")
        };
        builder.send().await
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        file: &mut tokio::fs::File,
    ) -> Result<(), FetchError> {
        let mut stream = response.bytes_stream();
        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;

        loop {
            let next = tokio::time::timeout(self.stall_timeout, stream.next()).await;
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => break,
                Err(_) => {
                    return Err(FetchError::Io(
                        "stalled".to_string(),
                        std::sync::Arc::new(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "no progress within the stall timeout",
                        )),
                    ))
                }
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io("writing downloaded body", e))?;

            if let Some(limit) = self.bandwidth_limit {
                window_bytes += chunk.len() as u64;
                let elapsed = window_start.elapsed();
                let expected = Duration::from_secs_f64(window_bytes as f64 / limit as f64);
                if expected > elapsed {
                    tokio::time::sleep(expected - elapsed).await;
                }
                if elapsed > Duration::from_secs(1) {
                    window_start = Instant::now();
                    window_bytes = 0;
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::io("flushing downloaded body", e))
    }
}

enum CandidateOutcome {
    Settled(FetchOutcome),
    Exhausted(String),
}

/// Builds the full URL to request: `uri` as-is if it already carries a
/// scheme, otherwise resolved against `candidate` (§4.3 point 1).
fn build_url(candidate: &Url, uri: &str) -> Url {
    if uri.contains("://") {
        Url::parse(uri).unwrap_or_else(|_| candidate.clone())
    } else {
        candidate.join(uri).unwrap_or_else(|_| candidate.clone())
    }
}

/// Resolves a redirect `Location` header. An `ftp://` target is ignored
/// per §4.3 point 2 — the candidate is retried against its own base URL
/// instead of following the scheme we can't speak.
fn next_redirect_url(response: &reqwest::Response, candidate_base: &Url) -> Option<Url> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())?;

    if location.starts_with("ftp://") {
        return Some(candidate_base.clone());
    }

    response.url().join(location).ok()
}

async fn reset_sink(sink: &mut BodySink<'_>) -> Result<(), FetchError> {
    use tokio::io::AsyncSeekExt;
    sink.file
        .set_len(0)
        .await
        .map_err(|e| FetchError::io(format!("truncating {}", sink.body_path.display()), e))?;
    sink.file
        .seek(std::io::SeekFrom::Start(0))
        .await
        .map_err(|e| FetchError::io(format!("seeking {}", sink.body_path.display()), e))
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}
