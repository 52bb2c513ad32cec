//! CLASSIFY (§4.6): turns a raw request path into an `(vhost, uri)` object
//! key plus a verdict on whether the basename is cacheable at all.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::RegexSet;
use std::collections::HashMap;
use url::Url;

/// Why a basename may not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Opaque, content-addressable payload: `.deb`, `.rpm`, `.tar.xz`, and
    /// their detached signatures — cached forever once fetched.
    Static,
    /// Mutable repository metadata: `Release`, `Packages*`, `repomd.xml` —
    /// always freshness-checked against upstream.
    Index,
}

/// The outcome of classifying one request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// The upstream identifier (first path segment).
    pub vhost: String,
    /// The path beneath the vhost, unescaped.
    pub uri: String,
    /// The final path segment.
    pub basename: String,
    /// Whether `basename` is static or index metadata.
    pub kind: FileKind,
}

/// Why a request could not be classified; always a `403` per §4.6.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    /// The path failed percent-decoding.
    #[error("malformed percent-encoding in request path")]
    BadEncoding,
    /// The client asked for an absolute-URL proxy to some other host.
    #[error("refusing to proxy an absolute URL to a foreign host")]
    AbsoluteUrlProxying,
    /// The path has no segment beyond an optional `/pkg-cacher/` prefix.
    #[error("empty request path")]
    EmptyPath,
    /// The path's first segment isn't a configured vhost.
    #[error("unknown vhost: {0}")]
    UnknownVhost(String),
    /// The basename matches neither `static_files` nor `index_files`.
    #[error("basename not servable: {0}")]
    DisallowedBasename(String),
}

/// Default static-file patterns: Debian/RPM packages, compressed tarballs,
/// and the detached signature/hash siblings that ride along with an index.
static STATIC_FILES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"\.deb$",
        r"\.udeb$",
        r"\.rpm$",
        r"\.srpm$",
        r"\.tar\.(gz|xz|bz2|zst)$",
        r"\.diff\.gz$",
        r"\.dsc$",
        r"\.changes$",
        r"\.asc$",
        r"\.gpg$",
    ])
    .expect("static STATIC_FILES patterns are valid regexes")
});

/// Default index/metadata patterns: the mutable files that must always be
/// revalidated rather than cached forever.
static INDEX_FILES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"^Release$",
        r"^InRelease$",
        r"^Release\.gpg$",
        r"^Packages(\.(gz|xz|bz2))?$",
        r"^Sources(\.(gz|xz|bz2))?$",
        r"^Contents-.*(\.(gz|xz))?$",
        r"^repomd\.xml(\.asc)?$",
        r"^.*\.(repo|mirrorlist)$",
    ])
    .expect("static INDEX_FILES patterns are valid regexes")
});

fn kind_of(basename: &str) -> Option<FileKind> {
    if INDEX_FILES.is_match(basename) {
        Some(FileKind::Index)
    } else if STATIC_FILES.is_match(basename) {
        Some(FileKind::Static)
    } else {
        None
    }
}

/// Classifies a raw request-target (the path portion of an HTTP request
/// line, already split from any query string) against the configured
/// `path_map`. `host_header` is used only to detect absolute-URL requests
/// whose authority isn't this server.
pub fn classify(
    raw_path: &str,
    host_header: Option<&str>,
    path_map: &HashMap<String, Vec<Url>>,
) -> Result<Classified, ClassifyError> {
    if let Some(authority) = absolute_url_authority(raw_path) {
        let is_self = host_header
            .map(|h| h.eq_ignore_ascii_case(&authority))
            .unwrap_or(false);
        if !is_self {
            return Err(ClassifyError::AbsoluteUrlProxying);
        }
    }

    let decoded = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| ClassifyError::BadEncoding)?;

    let trimmed = decoded
        .strip_prefix("/pkg-cacher/")
        .or_else(|| decoded.strip_prefix('/'))
        .unwrap_or(&decoded);

    let mut segments = trimmed.splitn(2, '/');
    let vhost = segments.next().filter(|s| !s.is_empty()).ok_or(ClassifyError::EmptyPath)?;
    let uri = segments.next().unwrap_or("").to_string();

    if !path_map.contains_key(vhost) {
        return Err(ClassifyError::UnknownVhost(vhost.to_string()));
    }

    let basename = uri.rsplit('/').next().unwrap_or("").to_string();
    let kind = kind_of(&basename).ok_or_else(|| ClassifyError::DisallowedBasename(basename.clone()))?;

    Ok(Classified {
        vhost: vhost.to_string(),
        uri,
        basename,
        kind,
    })
}

/// If `raw_path` parses as an absolute URL (`http://host/...`), returns its
/// authority (`host[:port]`); `None` for an ordinary origin-form path.
fn absolute_url_authority(raw_path: &str) -> Option<String> {
    let url = Url::parse(raw_path).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str().map(|host| match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn path_map() -> HashMap<String, Vec<Url>> {
        let mut map = HashMap::new();
        map.insert(
            "debian".to_string(),
            vec![Url::parse("http://ftp.us.debian.org/").unwrap()],
        );
        map
    }

    #[test]
    fn classifies_a_static_package_path() {
        let result = classify("/debian/pool/main/a/a2ps/a2ps_4.14-2.deb", None, &path_map()).unwrap();
        assert_eq!(result.vhost, "debian");
        assert_eq!(result.uri, "pool/main/a/a2ps/a2ps_4.14-2.deb");
        assert_eq!(result.basename, "a2ps_4.14-2.deb");
        assert_eq!(result.kind, FileKind::Static);
    }

    #[test]
    fn classifies_an_index_file() {
        let result = classify("/debian/dists/stable/Release", None, &path_map()).unwrap();
        assert_eq!(result.kind, FileKind::Index);
    }

    #[test]
    fn strips_pkg_cacher_prefix() {
        let result = classify("/pkg-cacher/debian/pool/foo.deb", None, &path_map()).unwrap();
        assert_eq!(result.vhost, "debian");
        assert_eq!(result.uri, "pool/foo.deb");
    }

    #[test]
    fn rejects_unknown_vhost() {
        let err = classify("/centos/pool/foo.rpm", None, &path_map()).unwrap_err();
        assert!(matches!(err, ClassifyError::UnknownVhost(v) if v == "centos"));
    }

    #[test]
    fn rejects_disallowed_basename() {
        let err = classify("/debian/pool/foo.exe", None, &path_map()).unwrap_err();
        assert!(matches!(err, ClassifyError::DisallowedBasename(_)));
    }

    #[test]
    fn rejects_absolute_url_proxying_to_a_foreign_host() {
        let err = classify("http://evil.example/debian/foo.deb", None, &path_map()).unwrap_err();
        assert!(matches!(err, ClassifyError::AbsoluteUrlProxying));
    }

    #[test]
    fn allows_absolute_url_when_authority_matches_this_server() {
        let result = classify(
            "http://cache.local/debian/pool/foo.deb",
            Some("cache.local"),
            &path_map(),
        )
        .unwrap();
        assert_eq!(result.vhost, "debian");
    }

    #[test]
    fn rejects_empty_path() {
        let err = classify("/", None, &path_map()).unwrap_err();
        assert!(matches!(err, ClassifyError::EmptyPath));
    }
}
