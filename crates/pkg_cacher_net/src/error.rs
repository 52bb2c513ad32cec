//! Failure modes of the upstream fetcher (§4.3, §7 "Upstream-fault").

use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Errors raised while resolving, requesting, or writing an upstream
/// response. Every variant that wraps a `reqwest::Error` carries it
/// credential-redacted (`pkg_cacher_redact`) before it can reach a log line.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// `path_map` had no candidates configured for the requested vhost.
    #[error("no upstream candidates configured")]
    NoCandidates,

    /// Every candidate exhausted its retry/redirect budget without a
    /// usable response. Carries the last transport error seen, if any —
    /// used to synthesise the `502 libcurl error: <reason>` header §4.3
    /// point 4 describes.
    #[error("all upstream candidates failed: {0}")]
    AllCandidatesFailed(String),

    /// Transport-level failure talking to a candidate.
    #[error("upstream request failed: {0}")]
    Transport(#[source] Arc<reqwest::Error>),

    /// A redirect `Location` header was missing or not a valid URL.
    #[error("invalid redirect location from {0}")]
    InvalidRedirect(Url),

    /// Upstream returned a 4xx status — a terminal failure for the entry,
    /// not merely this candidate (§4.3 point 3).
    #[error("upstream returned {status}")]
    UpstreamClientError {
        /// The HTTP status code.
        status: u16,
    },

    /// Writing the downloaded body (or truncating it between retries)
    /// failed.
    #[error("local I/O error: {0}")]
    Io(String, #[source] Arc<std::io::Error>),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        use pkg_cacher_redact::Redact;
        FetchError::Transport(Arc::new(err.redact()))
    }
}

impl FetchError {
    /// Wraps a local filesystem error with context.
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        FetchError::Io(context.into(), Arc::new(err))
    }
}
