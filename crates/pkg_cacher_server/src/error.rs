//! The error taxonomy for one request (§7): every fault resolves to a
//! single terminal HTTP status line, and is always worth an error-log
//! line — no fault here ever aborts the process.

use thiserror::Error;

/// A fault raised anywhere along `READ_REQUEST -> AUTHORISE -> CLASSIFY ->
/// COORDINATE -> STREAM` (§4.6). Each variant knows its own HTTP status.
#[derive(Error, Debug)]
pub enum RequestError {
    /// Malformed request line or headers (§4.6 READ_REQUEST).
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// HTTP/1.1 request with no `Host` header.
    #[error("HTTP/1.1 request missing Host header")]
    MissingHost,

    /// The peer is not covered by `allowed_hosts`/not excluded by
    /// `denied_hosts` (§4.6 AUTHORISE).
    #[error("client {0} is not authorised")]
    Forbidden(std::net::IpAddr),

    /// An ACL directive could not be evaluated (should have been caught at
    /// config-load time, but re-checked here per §4.6/§7's "malformed ACL
    /// entry aborts with 500").
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The request path doesn't classify as a known vhost/basename (§4.6
    /// CLASSIFY): absolute-URL proxying, unknown vhost, or a basename that
    /// matches neither `static_files` nor `index_files`.
    #[error("refused: {0}")]
    Refused(String),

    /// The upstream (or the synthesised transport failure) resolved to a
    /// client-visible error status that isn't a cache hit path.
    #[error("upstream error: {0}")]
    Upstream(#[from] pkg_cacher_cache::CoordinatorError),

    /// `offline_mode` is on and no cached copy exists to serve instead.
    #[error("offline and no cached copy available")]
    OfflineNoCachedCopy,

    /// A local I/O failure unrelated to the cache/fetch subsystems
    /// (reading the request, writing the response).
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl RequestError {
    /// The HTTP status line to emit for this fault (§7, §6 "Status codes
    /// emitted").
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::MalformedRequest(_) => 403,
            RequestError::MissingHost => 400,
            RequestError::Forbidden(_) => 403,
            RequestError::Configuration(_) => 500,
            RequestError::Refused(_) => 403,
            RequestError::Upstream(e) => match e {
                pkg_cacher_cache::CoordinatorError::HeaderTimeout
                | pkg_cacher_cache::CoordinatorError::BodyStalled => 504,
                _ => 502,
            },
            RequestError::OfflineNoCachedCopy => 503,
            RequestError::Io(_) => 500,
        }
    }

    /// Whether the connection must be closed after this response (§7:
    /// "Client-fault ... Logged, connection closed"; every fault in this
    /// taxonomy is non-recoverable for the current request).
    pub fn closes_connection(&self) -> bool {
        true
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err)
    }
}

impl From<crate::classify::ClassifyError> for RequestError {
    fn from(err: crate::classify::ClassifyError) -> Self {
        RequestError::Refused(err.to_string())
    }
}
