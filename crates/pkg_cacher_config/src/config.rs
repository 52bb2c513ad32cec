use crate::acl::{self, AclEntry};
use crate::directive::{apply_env_overrides, parse_directives};
use crate::error::{LoadError, ValidationError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// Parent-proxy settings (`http_proxy`, `https_proxy`, `use_proxy`, and the
/// matching `*_auth` keys).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyConfig {
    /// Whether to route requests through a parent proxy at all.
    pub use_proxy: bool,
    /// Proxy to use for `http://` upstreams.
    pub http_proxy: Option<Url>,
    /// Proxy to use for `https://` upstreams.
    pub https_proxy: Option<Url>,
    /// Whether `http_proxy_auth`/`https_proxy_auth` should be sent.
    pub use_proxy_auth: bool,
    /// `user:password` for the HTTP parent proxy.
    pub http_proxy_auth: Option<String>,
    /// `user:password` for the HTTPS parent proxy.
    pub https_proxy_auth: Option<String>,
}

/// The full, validated pkg-cacher configuration record.
///
/// Fields are split conceptually into *structural* (fixed at startup: bind
/// address, cache root) and *reloadable* (swapped in as a unit on `SIGHUP`,
/// per the concurrency model's field list). [`Config::merge_reloadable`]
/// encodes exactly which fields move on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // -- structural --
    /// Root of the on-disk cache tree (§6 layout).
    pub cache_dir: PathBuf,
    /// Directory holding the access/error log files.
    pub logdir: PathBuf,
    /// TCP port the listener binds.
    pub daemon_port: u16,
    /// One or more addresses the listener binds, one socket each.
    pub daemon_addr: Vec<IpAddr>,
    /// Number of attempts to retry a failed bind before giving up.
    pub retry: u32,
    /// Unprivileged user to drop to after binding (daemon lifecycle,
    /// external to this crate's responsibility — stored, not enforced).
    pub user: Option<String>,
    /// Unprivileged group to drop to (external).
    pub group: Option<String>,
    /// Directory to `chroot(2)` into (external).
    pub chroot: Option<PathBuf>,
    /// Where to write the daemon's pid (external).
    pub pidfile: Option<PathBuf>,
    /// Whether to fork into the background (external).
    pub fork: bool,

    // -- reloadable --
    /// Ordered candidate upstream hosts per vhost.
    pub path_map: HashMap<String, Vec<Url>>,
    /// IPv4 allow-list.
    pub allowed_hosts: Vec<AclEntry>,
    /// IPv4 deny-list.
    pub denied_hosts: Vec<AclEntry>,
    /// IPv6 allow-list.
    pub allowed_hosts_6: Vec<AclEntry>,
    /// IPv6 deny-list.
    pub denied_hosts_6: Vec<AclEntry>,
    /// Never issue upstream requests; serve only what is already cached.
    pub offline_mode: bool,
    /// Index max-age in hours; `0` means always revalidate.
    pub expire_hours: u64,
    /// Prefer `ETag` over `Last-Modified` for index freshness checks.
    pub use_etags: bool,
    /// Parent proxy settings.
    pub proxy: ProxyConfig,
    /// Verify upstream TLS certificates.
    pub require_valid_ssl: bool,
    /// Egress bandwidth cap in bytes/sec, if set.
    pub limit: Option<u64>,
    /// Stall timeout (no forward progress) in seconds, for both the fetcher
    /// and the streaming reader.
    pub fetch_timeout: u64,
    /// Network interface to bind outgoing connections to.
    pub use_interface: Option<String>,
    /// Verbose diagnostic logging.
    pub debug: bool,
    /// Resolves the open question in the freshness algorithm: whether a
    /// successful HEAD revalidation with neither `ETag` nor `Last-Modified`
    /// counts as `HIT` (the conservative default) or `EXPIRED`.
    pub ambiguous_revalidation_is_hit: bool,

    // -- external diagnostics / mode flags, stored but not acted on by the
    // core request pipeline --
    /// Whether the (external) report generator should run.
    pub generate_reports: bool,
    /// Whether the (external) cache-cleanup pass should run.
    pub clean_cache: bool,
    /// Advertise CGI usage in error pages.
    pub cgi_advise_to_use: bool,
}

const RELOADABLE_KEYS: &[&str] = &[
    "path_map",
    "allowed_hosts",
    "denied_hosts",
    "allowed_hosts_6",
    "denied_hosts_6",
    "offline_mode",
    "expire_hours",
    "use_etags",
    "http_proxy",
    "https_proxy",
    "use_proxy",
    "http_proxy_auth",
    "https_proxy_auth",
    "use_proxy_auth",
    "require_valid_ssl",
    "limit",
    "fetch_timeout",
    "use_interface",
    "debug",
];

const STRUCTURAL_KEYS: &[&str] = &[
    "cache_dir",
    "logdir",
    "daemon_port",
    "daemon_addr",
    "user",
    "group",
    "chroot",
    "pidfile",
    "fork",
    "retry",
    "generate_reports",
    "clean_cache",
    "cgi_advise_to_use",
];

impl Config {
    /// Loads and validates a configuration file, applying any
    /// `PKG_CACHER_<KEY>` environment overrides on top.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, LoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_directive_text(&text)
    }

    /// Parses and validates directive text directly (used by tests and by
    /// [`Config::load_from_file`]).
    pub fn from_directive_text(text: &str) -> Result<Config, LoadError> {
        let mut directives = parse_directives(text)?;
        let all_keys: Vec<&str> = STRUCTURAL_KEYS
            .iter()
            .chain(RELOADABLE_KEYS)
            .copied()
            .collect();
        apply_env_overrides(&mut directives, &all_keys);
        Ok(Self::from_directives(&directives)?)
    }

    /// Re-parses a configuration file and returns a new [`Config`] that
    /// keeps `self`'s structural fields but adopts the freshly parsed
    /// reloadable ones — the `SIGHUP` behaviour from the concurrency model.
    pub fn reloaded_from_file(&self, path: impl AsRef<Path>) -> Result<Config, LoadError> {
        let other = Config::load_from_file(path)?;
        Ok(self.merge_reloadable(other))
    }

    /// Combines `self`'s structural fields with `other`'s reloadable ones.
    pub fn merge_reloadable(&self, other: Config) -> Config {
        Config {
            path_map: other.path_map,
            allowed_hosts: other.allowed_hosts,
            denied_hosts: other.denied_hosts,
            allowed_hosts_6: other.allowed_hosts_6,
            denied_hosts_6: other.denied_hosts_6,
            offline_mode: other.offline_mode,
            expire_hours: other.expire_hours,
            use_etags: other.use_etags,
            proxy: other.proxy,
            require_valid_ssl: other.require_valid_ssl,
            limit: other.limit,
            fetch_timeout: other.fetch_timeout,
            use_interface: other.use_interface,
            debug: other.debug,
            ambiguous_revalidation_is_hit: other.ambiguous_revalidation_is_hit,
            ..self.clone()
        }
    }

    fn from_directives(d: &HashMap<String, String>) -> Result<Config, ValidationError> {
        let cache_dir = get_path(d, "cache_dir")?.ok_or(ValidationError::MissingRequiredField("cache_dir"))?;
        let logdir = get_path(d, "logdir")?.unwrap_or_else(|| PathBuf::from("/var/log/pkg-cacher"));

        Ok(Config {
            cache_dir,
            logdir,
            daemon_port: get_u16(d, "daemon_port")?.unwrap_or(8080),
            daemon_addr: get_addr_list(d, "daemon_addr")?,
            retry: get_u64(d, "retry")?.unwrap_or(3) as u32,
            user: d.get("user").cloned(),
            group: d.get("group").cloned(),
            chroot: get_path(d, "chroot")?,
            pidfile: get_path(d, "pidfile")?,
            fork: get_bool(d, "fork")?.unwrap_or(false),

            path_map: get_path_map(d)?,
            allowed_hosts: get_acl(d, "allowed_hosts")?,
            denied_hosts: get_acl(d, "denied_hosts")?,
            allowed_hosts_6: get_acl(d, "allowed_hosts_6")?,
            denied_hosts_6: get_acl(d, "denied_hosts_6")?,
            offline_mode: get_bool(d, "offline_mode")?.unwrap_or(false),
            expire_hours: get_u64(d, "expire_hours")?.unwrap_or(0),
            use_etags: get_bool(d, "use_etags")?.unwrap_or(true),
            proxy: get_proxy_config(d)?,
            require_valid_ssl: get_bool(d, "require_valid_ssl")?.unwrap_or(true),
            limit: d.get("limit").map(|s| parse_limit(s)).transpose()?,
            fetch_timeout: get_u64(d, "fetch_timeout")?.unwrap_or(300),
            use_interface: d.get("use_interface").cloned(),
            debug: get_bool(d, "debug")?.unwrap_or(false),
            ambiguous_revalidation_is_hit: get_bool(d, "ambiguous_revalidation_is_hit")?.unwrap_or(true),

            generate_reports: get_bool(d, "generate_reports")?.unwrap_or(false),
            clean_cache: get_bool(d, "clean_cache")?.unwrap_or(false),
            cgi_advise_to_use: get_bool(d, "cgi_advise_to_use")?.unwrap_or(false),
        })
    }
}

fn get_bool(d: &HashMap<String, String>, key: &'static str) -> Result<Option<bool>, ValidationError> {
    let Some(raw) = d.get(key) else { return Ok(None) };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ValidationError::InvalidBool(key, raw.clone())),
    }
}

fn get_u64(d: &HashMap<String, String>, key: &'static str) -> Result<Option<u64>, ValidationError> {
    let Some(raw) = d.get(key) else { return Ok(None) };
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| ValidationError::InvalidInt(key, raw.clone()))
}

fn get_u16(d: &HashMap<String, String>, key: &'static str) -> Result<Option<u16>, ValidationError> {
    let Some(raw) = d.get(key) else { return Ok(None) };
    raw.parse::<u16>()
        .map(Some)
        .map_err(|_| ValidationError::InvalidInt(key, raw.clone()))
}

fn get_path(d: &HashMap<String, String>, key: &'static str) -> Result<Option<PathBuf>, ValidationError> {
    Ok(d.get(key).map(PathBuf::from))
}

fn get_addr_list(d: &HashMap<String, String>, key: &'static str) -> Result<Vec<IpAddr>, ValidationError> {
    let Some(raw) = d.get(key) else {
        return Ok(vec!["0.0.0.0".parse().expect("valid literal")]);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<IpAddr>().map_err(|_| ValidationError::InvalidAddr(key, s.to_string())))
        .collect()
}

fn get_acl(d: &HashMap<String, String>, key: &'static str) -> Result<Vec<AclEntry>, ValidationError> {
    let raw = d.get(key).map(String::as_str).unwrap_or("");
    acl::parse_acl_list(key, raw)
}

fn get_url(d: &HashMap<String, String>, key: &'static str) -> Result<Option<Url>, ValidationError> {
    let Some(raw) = d.get(key) else { return Ok(None) };
    Url::parse(raw).map(Some).map_err(|_| ValidationError::InvalidUrl(key, raw.clone()))
}

fn get_proxy_config(d: &HashMap<String, String>) -> Result<ProxyConfig, ValidationError> {
    Ok(ProxyConfig {
        use_proxy: get_bool(d, "use_proxy")?.unwrap_or(false),
        http_proxy: get_url(d, "http_proxy")?,
        https_proxy: get_url(d, "https_proxy")?,
        use_proxy_auth: get_bool(d, "use_proxy_auth")?.unwrap_or(false),
        http_proxy_auth: d.get("http_proxy_auth").cloned(),
        https_proxy_auth: d.get("https_proxy_auth").cloned(),
    })
}

/// Parses `path_map`: groups separated by `;` or `,`, each group a
/// whitespace-separated `vhost host1 host2 ...` list. A host with no scheme
/// is assumed `http://`.
fn get_path_map(d: &HashMap<String, String>) -> Result<HashMap<String, Vec<Url>>, ValidationError> {
    let Some(raw) = d.get("path_map") else { return Ok(HashMap::new()) };
    let mut map = HashMap::new();

    for group in raw.split([';', ',']) {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let mut tokens = group.split_whitespace();
        let vhost = tokens
            .next()
            .ok_or_else(|| ValidationError::InvalidPathMap(group.to_string()))?;
        let mut candidates = Vec::new();
        for host in tokens {
            let url_str = if host.contains("://") {
                host.to_string()
            } else {
                format!("http://{host}")
            };
            let url = Url::parse(&url_str)
                .map_err(|_| ValidationError::InvalidPathMap(group.to_string()))?;
            candidates.push(url);
        }
        if candidates.is_empty() {
            return Err(ValidationError::InvalidPathMap(group.to_string()));
        }
        map.insert(vhost.to_string(), candidates);
    }

    Ok(map)
}

/// Parses an bandwidth limit: a bare integer (bytes/sec), or suffixed with
/// `k`/`K` (KiB/sec) or `m`/`M` (MiB/sec).
pub fn parse_limit(raw: &str) -> Result<u64, ValidationError> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('k') | Some('K') => (&raw[..raw.len() - 1], 1024),
        Some('m') | Some('M') => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| ValidationError::InvalidLimit(raw.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal() -> String {
        "cache_dir /var/cache/pkg-cacher\n".to_string()
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let config = Config::from_directive_text(&minimal()).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/pkg-cacher"));
        assert_eq!(config.daemon_port, 8080);
        assert!(config.use_etags);
        assert!(!config.offline_mode);
        assert_eq!(config.expire_hours, 0);
    }

    #[test]
    fn missing_cache_dir_is_rejected() {
        let err = Config::from_directive_text("daemon_port 8080\n").unwrap_err();
        match err {
            LoadError::Validation(ValidationError::MissingRequiredField("cache_dir")) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parses_path_map_with_multiple_vhosts_and_candidates() {
        let text = format!(
            "{}path_map debian ftp.us.debian.org http://archive.debian.org;ubuntu archive.ubuntu.com\n",
            minimal()
        );
        let config = Config::from_directive_text(&text).unwrap();
        assert_eq!(config.path_map.len(), 2);
        let debian = &config.path_map["debian"];
        assert_eq!(debian.len(), 2);
        assert_eq!(debian[0].as_str(), "http://ftp.us.debian.org/");
        assert_eq!(debian[1].as_str(), "http://archive.debian.org/");
    }

    #[test]
    fn parses_acl_lists() {
        let text = format!("{}allowed_hosts 10.0.0.0/24,192.168.1.1\ndenied_hosts *\n", minimal());
        let config = Config::from_directive_text(&text).unwrap();
        assert_eq!(config.allowed_hosts.len(), 2);
        assert_eq!(config.denied_hosts, vec![AclEntry::Any]);
    }

    #[test]
    fn parses_bandwidth_limit_suffixes() {
        assert_eq!(parse_limit("1024").unwrap(), 1024);
        assert_eq!(parse_limit("10k").unwrap(), 10 * 1024);
        assert_eq!(parse_limit("2m").unwrap(), 2 * 1024 * 1024);
        assert!(parse_limit("nope").is_err());
    }

    #[test]
    fn reload_keeps_structural_fields_and_swaps_reloadable_ones() {
        let original = Config::from_directive_text(&format!("{}expire_hours 4\n", minimal())).unwrap();
        let reloaded_text = format!(
            "cache_dir /somewhere/else\ndaemon_port 9090\nexpire_hours 8\noffline_mode 1\n"
        );
        let reloaded = Config::from_directive_text(&reloaded_text).unwrap();
        let merged = original.merge_reloadable(reloaded);

        // structural fields stay put
        assert_eq!(merged.cache_dir, original.cache_dir);
        assert_eq!(merged.daemon_port, original.daemon_port);
        // reloadable fields come from the new file
        assert_eq!(merged.expire_hours, 8);
        assert!(merged.offline_mode);
    }

    #[test]
    fn env_override_beats_file_value() {
        std::env::set_var("PKG_CACHER_EXPIRE_HOURS", "99");
        let config = Config::from_directive_text(&format!("{}expire_hours 4\n", minimal())).unwrap();
        std::env::remove_var("PKG_CACHER_EXPIRE_HOURS");
        assert_eq!(config.expire_hours, 99);
    }
}
