#![deny(missing_docs)]

//! The upstream fetcher (§4.3): HEAD/GET across ordered mirror candidates
//! with redirect following, retries, an egress bandwidth cap, and a stall
//! timeout.

pub mod client;
pub mod error;
pub mod fetcher;
pub mod headers;

pub use client::{build_client, TransportOptions};
pub use error::FetchError;
pub use fetcher::{
    BodySink, FetchDisposition, FetchMode, FetchOutcome, Fetcher, HeaderSink, REDIRECT_BUDGET,
    RETRY_BUDGET,
};
