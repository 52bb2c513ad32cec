use simple_spawn_blocking::Cancelled;
use thiserror::Error;

/// Errors raised by the lock manager and content store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    /// The global lock or a per-entry body lock could not be acquired.
    /// Per the locking contract, failure to obtain the global lock is fatal
    /// for the request (`500 Configuration error` or equivalent).
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// `create_entry` found the body file already present — either a
    /// concurrent creator won the race, or a stale entry needs to be
    /// unlinked first.
    #[error("cache entry already exists for {0}")]
    AlreadyExists(String),

    /// The blocking task backing a filesystem/lock operation was cancelled.
    #[error("store operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for StoreError {
    fn from(_: Cancelled) -> Self {
        StoreError::Cancelled
    }
}
