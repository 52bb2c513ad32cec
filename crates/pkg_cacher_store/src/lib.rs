#![deny(missing_docs)]

//! The on-disk cache layout (§6), the content store (§4.2) and the lock
//! manager (§4.1) that the cache coordinator and request handler build on.

pub mod error;
pub mod layout;
pub mod lock;
pub mod store;

pub use error::StoreError;
pub use layout::{CacheLayout, ObjectKey};
pub use lock::{acquire_entry_lock, probe_entry_lock, EntryLockGuard, GlobalLock, GlobalLockGuard};
pub use store::{CommitOutcome, ContentStore, EntryState};
