#![deny(missing_docs)]

//! The cache coordinator (§4.4), freshness policy (§4.4 "Freshness
//! algorithm") and streaming reader (§4.5) that sit between the content
//! store and the request handler.

pub mod coordinator;
pub mod error;
pub mod freshness;
pub mod httpmsg;
pub mod reader;

pub use coordinator::{CoordinateRequest, Coordinator};
pub use error::CoordinatorError;
pub use freshness::{CacheStatus, CachedMeta, FreshnessPolicy};
pub use httpmsg::ParsedHeaders;
pub use reader::{BodyPlan, ByteRange, StreamPlan, StreamRequest, StreamingReader};
