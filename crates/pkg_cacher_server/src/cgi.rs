//! CGI mode (§4.7, §6 "Environment (CGI mode)"): the request arrives as
//! environment variables set by the web server, not as wire bytes, and the
//! response's first line is `Status: <code> <reason>` rather than an HTTP
//! status line — the web server supplies the rest of the response framing.

use crate::accesslog::AccessLog;
use crate::handler::{self, HandlerContext, Method, ParsedRequest, ResponseStyle};
use std::net::IpAddr;
use tokio::io::{self, AsyncWrite};

/// Errors building a request out of the CGI environment.
#[derive(Debug, thiserror::Error)]
pub enum CgiError {
    /// A required environment variable was absent or empty.
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),
    /// `REQUEST_METHOD` named something other than `GET`/`HEAD`.
    #[error("unsupported request method {0}")]
    UnsupportedMethod(String),
    /// `REMOTE_ADDR` did not parse as an IP address.
    #[error("invalid REMOTE_ADDR {0}")]
    InvalidRemoteAddr(String),
}

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Builds a [`ParsedRequest`] and the client's address from the CGI
/// environment. Always forces the connection closed (§4.7 "`Connection:
/// Close` forced") since CGI is a one-shot invocation per request.
pub fn request_from_env() -> Result<(ParsedRequest, IpAddr), CgiError> {
    let method = match env_var("REQUEST_METHOD").as_deref() {
        Some("GET") => Method::Get,
        Some("HEAD") => Method::Head,
        Some(other) => return Err(CgiError::UnsupportedMethod(other.to_string())),
        None => return Err(CgiError::MissingVar("REQUEST_METHOD")),
    };

    let http_11 = env_var("SERVER_PROTOCOL").as_deref() == Some("HTTP/1.1");

    let mut target = env_var("PATH_INFO").unwrap_or_default();
    if let Some(query) = env_var("QUERY_STRING") {
        target.push('?');
        target.push_str(&query);
    }
    if target.is_empty() {
        target.push('/');
    }

    let host = env_var("HTTP_HOST").or_else(|| env_var("SERVER_NAME"));

    let client_no_cache = env_var("HTTP_PRAGMA").is_some_and(|v| v.eq_ignore_ascii_case("no-cache"))
        || env_var("HTTP_CACHE_CONTROL").is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"));

    let remote_addr = env_var("REMOTE_ADDR").ok_or(CgiError::MissingVar("REMOTE_ADDR"))?;
    let peer: IpAddr = remote_addr.parse().map_err(|_| CgiError::InvalidRemoteAddr(remote_addr))?;

    let request = ParsedRequest {
        method,
        target,
        http_11,
        host,
        range: env_var("HTTP_RANGE"),
        if_range: env_var("HTTP_IF_RANGE"),
        if_modified_since: env_var("HTTP_IF_MODIFIED_SINCE"),
        client_no_cache,
        keep_alive: false,
    };

    Ok((request, peer))
}

/// Serves the single request described by the CGI environment, writing the
/// response to `writer` (ordinarily `stdout`).
pub async fn serve_one<W: AsyncWrite + Unpin>(
    ctx: &HandlerContext,
    access_log: &AccessLog,
    writer: &mut W,
) -> io::Result<()> {
    let (request, peer) = match request_from_env() {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "malformed CGI environment");
            let body = e.to_string();
            let out = format!(
                "Status: 400 Bad Request\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
                body.len(),
                body
            );
            return tokio::io::AsyncWriteExt::write_all(writer, out.as_bytes()).await;
        }
    };

    match handler::handle_request_with_style(ctx, &request, peer, writer, ResponseStyle::Cgi).await {
        Ok(served) => {
            if let Err(e) = access_log.record(peer, served.status_token, served.bytes_sent, &served.basename) {
                tracing::warn!(error = %e, "failed to write access log entry");
            }
        }
        Err(e) => {
            tracing::warn!(status = e.status_code(), error = %e, "CGI request failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_missing_request_method() {
        std::env::remove_var("REQUEST_METHOD");
        assert!(matches!(request_from_env(), Err(CgiError::MissingVar("REQUEST_METHOD"))));
    }

    #[test]
    fn builds_a_request_from_a_typical_environment() {
        std::env::set_var("REQUEST_METHOD", "GET");
        std::env::set_var("SERVER_PROTOCOL", "HTTP/1.1");
        std::env::set_var("PATH_INFO", "/debian/pool/x/foo.deb");
        std::env::remove_var("QUERY_STRING");
        std::env::set_var("HTTP_HOST", "cache.local");
        std::env::set_var("REMOTE_ADDR", "192.0.2.1");
        std::env::set_var("HTTP_RANGE", "bytes=0-99");

        let (request, peer) = request_from_env().unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.target, "/debian/pool/x/foo.deb");
        assert!(request.http_11);
        assert!(!request.keep_alive);
        assert_eq!(request.host.as_deref(), Some("cache.local"));
        assert_eq!(request.range.as_deref(), Some("bytes=0-99"));
        assert_eq!(peer, "192.0.2.1".parse::<IpAddr>().unwrap());

        std::env::remove_var("REQUEST_METHOD");
        std::env::remove_var("SERVER_PROTOCOL");
        std::env::remove_var("PATH_INFO");
        std::env::remove_var("HTTP_HOST");
        std::env::remove_var("REMOTE_ADDR");
        std::env::remove_var("HTTP_RANGE");
    }

    #[test]
    fn rejects_unsupported_methods() {
        std::env::set_var("REQUEST_METHOD", "POST");
        assert!(matches!(request_from_env(), Err(CgiError::UnsupportedMethod(_))));
        std::env::remove_var("REQUEST_METHOD");
    }
}
