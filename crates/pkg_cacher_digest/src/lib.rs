#![deny(missing_docs)]

//! Hashing helpers used to compute and parse the digests that key the
//! content-addressed dedup pool (`cache/<basename>.<sha1>`).
//!
//! Wraps the [RustCrypto/hashes](https://github.com/RustCrypto/hashes)
//! `Digest` trait so callers can pick an algorithm generically; `Sha1` is the
//! one the dedup pool actually uses, `Sha256` is kept around for header
//! sidecar checksums and tests.

pub use digest;
pub use sha1::Sha1;
pub use sha2::Sha256;

use digest::{Digest, Output};
use std::io::Write;
use std::{fs::File, path::Path};

/// A type alias for the output of a SHA-1 hash.
pub type Sha1Hash = digest::Output<Sha1>;

/// A type alias for the output of a SHA-256 hash.
pub type Sha256Hash = digest::Output<Sha256>;

/// Computes a hash of the file at the specified location.
pub fn compute_file_digest<D: Digest + Default + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = D::default();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Computes a hash of the specified bytes.
pub fn compute_bytes_digest<D: Digest + Default + Write>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Formats a digest as a lowercase hex string, the form used in pool
/// filenames (`cache/<basename>.<sha1>`).
pub fn format_digest<D: Digest>(output: &Output<D>) -> String {
    hex::encode(output)
}

/// Parses a hex digest string back into bytes, returning `None` if the
/// string is not valid hex or has the wrong length for `D`.
pub fn parse_digest_from_hex<D: Digest>(s: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    hex::decode_to_slice(s, &mut hash).ok()?;
    Some(hash)
}
