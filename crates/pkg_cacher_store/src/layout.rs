//! Deterministic path construction for the on-disk cache tree:
//!
//! ```text
//! cache_dir/
//!   packages/<vhost>/<uri>
//!   headers/<vhost>/<uri>
//!   private/<vhost>/<uri>.complete
//!   cache/<basename>.<sha1>
//!   temp/
//!   exlock
//! ```

use std::path::{Component, Path, PathBuf};

/// Identifies a cached artifact: which upstream (`vhost`) and which path
/// beneath it (`uri`). `basename` is derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Logical upstream identifier, e.g. `debian`.
    pub vhost: String,
    /// Path beneath the vhost, e.g. `pool/x/foo_1.0.deb`.
    pub uri: String,
}

impl ObjectKey {
    /// Builds a new object key.
    pub fn new(vhost: impl Into<String>, uri: impl Into<String>) -> Self {
        ObjectKey {
            vhost: vhost.into(),
            uri: uri.into(),
        }
    }

    /// The final path segment, used for dedup pool naming and access
    /// logging.
    pub fn basename(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

/// Resolves the on-disk paths for a given cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Rooted at `root` (the configured `cache_dir`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheLayout { root: root.into() }
    }

    /// The cache root itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `packages/<vhost>/<uri>` — the body.
    pub fn package_path(&self, key: &ObjectKey) -> PathBuf {
        join_safely(&self.root.join("packages"), key)
    }

    /// Directory that `package_path` lives in (`packages/<vhost>`).
    pub fn packages_dir(&self, vhost: &str) -> PathBuf {
        self.root.join("packages").join(vhost)
    }

    /// `headers/<vhost>/<uri>` — the raw response header sidecar.
    pub fn header_path(&self, key: &ObjectKey) -> PathBuf {
        join_safely(&self.root.join("headers"), key)
    }

    /// Directory that `header_path` lives in.
    pub fn headers_dir(&self, vhost: &str) -> PathBuf {
        self.root.join("headers").join(vhost)
    }

    /// A scratch sidecar the fetcher writes headers to before it knows the
    /// final (non-redirect) response, then renames over `header_path` —
    /// so readers never observe a transient intermediate response.
    pub fn header_scratch_path(&self, key: &ObjectKey) -> PathBuf {
        let mut path = self.header_path(key);
        path.set_extension("tmp");
        path
    }

    /// `private/<vhost>/<uri>.complete` — the completion marker.
    pub fn complete_path(&self, key: &ObjectKey) -> PathBuf {
        let mut path = join_safely(&self.root.join("private"), key);
        let file_name = path
            .file_name()
            .map(|n| format!("{}.complete", n.to_string_lossy()))
            .unwrap_or_else(|| "complete".to_string());
        path.set_file_name(file_name);
        path
    }

    /// Directory that `complete_path` lives in.
    pub fn private_dir(&self, vhost: &str) -> PathBuf {
        self.root.join("private").join(vhost)
    }

    /// `cache/<basename>.<hash-hex>` — the content-addressed dedup pool
    /// entry for a given basename and digest.
    pub fn pool_path(&self, basename: &str, hash_hex: &str) -> PathBuf {
        self.root
            .join("cache")
            .join(format!("{basename}.{hash_hex}"))
    }

    /// Scratch space for in-progress operations that must not be visible
    /// under their final name until complete.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// The single named file the global lock is taken on.
    pub fn global_lock_path(&self) -> PathBuf {
        self.root.join("exlock")
    }
}

/// Joins `vhost`/`uri` onto `base`, rejecting path traversal (`..`) and
/// absolute components in `uri` — a client-controlled value that must never
/// be allowed to escape the cache tree.
fn join_safely(base: &Path, key: &ObjectKey) -> PathBuf {
    let mut path = base.join(&key.vhost);
    for component in Path::new(&key.uri).components() {
        match component {
            Component::Normal(part) => path.push(part),
            _ => continue,
        }
    }
    path
}
