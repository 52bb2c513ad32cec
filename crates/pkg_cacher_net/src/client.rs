//! Builds the `reqwest::Client` the fetcher sends requests through,
//! honouring the configurable parent proxy, TLS verification and egress
//! interface (§4.3 "Optional behaviours").

use std::net::IpAddr;
use std::time::Duration;
use url::Url;

/// The subset of the configuration record the fetcher's transport needs.
/// Kept as a plain struct (rather than depending on `pkg_cacher_config`
/// directly) so this crate stays testable without pulling in the
/// directive-file parser.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Route requests through a parent HTTP proxy.
    pub http_proxy: Option<Url>,
    /// Route requests through a parent HTTPS proxy.
    pub https_proxy: Option<Url>,
    /// `user:password` to authenticate to `http_proxy` with.
    pub http_proxy_auth: Option<String>,
    /// `user:password` to authenticate to `https_proxy` with.
    pub https_proxy_auth: Option<String>,
    /// Verify upstream TLS certificates.
    pub require_valid_ssl: bool,
    /// Bind egress connections to this local address/interface.
    pub use_interface: Option<String>,
    /// Connect timeout; fixed per §5 ("Upstream connect timeout: fixed
    /// short budget (≈10s)").
    pub connect_timeout: Duration,
}

/// Builds a `reqwest::Client` configured per `opts`. Redirects are always
/// disabled at the transport layer (`redirect::Policy::none()`) because
/// the fetcher implements its own per-candidate redirect budget and
/// `ftp://` rejection (§4.3 point 2) rather than delegating to reqwest.
pub fn build_client(opts: &TransportOptions) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(!opts.require_valid_ssl)
        .connect_timeout(opts.connect_timeout);

    if let Some(proxy_url) = &opts.http_proxy {
        let mut proxy = reqwest::Proxy::http(with_auth(proxy_url, opts.http_proxy_auth.as_deref()))?;
        if let Some(auth) = &opts.http_proxy_auth {
            if let Some((user, pass)) = auth.split_once(':') {
                proxy = proxy.basic_auth(user, pass);
            }
        }
        builder = builder.proxy(proxy);
    }
    if let Some(proxy_url) = &opts.https_proxy {
        let mut proxy = reqwest::Proxy::https(with_auth(proxy_url, opts.https_proxy_auth.as_deref()))?;
        if let Some(auth) = &opts.https_proxy_auth {
            if let Some((user, pass)) = auth.split_once(':') {
                proxy = proxy.basic_auth(user, pass);
            }
        }
        builder = builder.proxy(proxy);
    }

    if let Some(interface) = &opts.use_interface {
        match interface.parse::<IpAddr>() {
            Ok(addr) => builder = builder.local_address(addr),
            Err(_) => tracing::warn!(
                interface,
                "use_interface names a network interface, not an address; \
                 binding by interface name is not supported, egress will use the default route"
            ),
        }
    }

    builder.build()
}

fn with_auth(url: &Url, _auth: Option<&str>) -> Url {
    // Authentication is attached via `Proxy::basic_auth` rather than
    // embedded in the URL, so the URL itself is passed through unchanged.
    url.clone()
}
