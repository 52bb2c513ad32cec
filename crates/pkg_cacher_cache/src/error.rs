//! Failure modes of the cache coordinator and streaming reader.

use thiserror::Error;

/// Errors raised by [`crate::coordinator::Coordinator`] and
/// [`crate::reader::StreamingReader`].
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The content store reported a failure.
    #[error(transparent)]
    Store(#[from] pkg_cacher_store::StoreError),

    /// The upstream fetcher reported a failure.
    #[error(transparent)]
    Fetch(#[from] pkg_cacher_net::FetchError),

    /// A local I/O error outside the store/fetcher's own error domains
    /// (e.g. reading the body file while streaming a response).
    #[error("I/O error: {0}")]
    Io(String, #[source] std::io::Error),

    /// The streaming reader waited past the stall timeout for the header
    /// sidecar to appear and nothing had been sent to the client yet.
    #[error("timed out waiting for upstream response headers")]
    HeaderTimeout,

    /// The streaming reader waited past the stall timeout for body bytes
    /// it knows are still coming (completion marker absent).
    #[error("stalled waiting for more body bytes")]
    BodyStalled,

    /// The sidecar header vanished while being awaited — the fetcher that
    /// was writing it crashed. The caller should re-enter the
    /// decide-to-fetch path and become the fetcher itself (§4.5 point 7).
    #[error("previous fetcher crashed before writing headers")]
    FetcherCrashed,

    /// The requested byte range does not overlap `[0, total_length)`.
    #[error("requested range is not satisfiable")]
    RangeNotSatisfiable,
}
