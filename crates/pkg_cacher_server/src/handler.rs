//! The per-connection request pipeline (§4.6):
//! `READ_REQUEST -> AUTHORISE -> CLASSIFY -> COORDINATE -> STREAM`.

use crate::acl;
use crate::classify::{self, FileKind};
use crate::error::RequestError;
use pkg_cacher_cache::{
    BodyPlan, ByteRange, CacheStatus, CoordinateRequest, Coordinator, CoordinatorError,
    FreshnessPolicy, StreamRequest, StreamingReader,
};
use pkg_cacher_config::{Config, SharedConfig};
use pkg_cacher_store::{EntryState, ObjectKey};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// `GET` or `HEAD` — the two methods this server understands (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Fetches the body.
    Get,
    /// Fetches only the would-be headers.
    Head,
}

/// One parsed request line plus the subset of headers the pipeline acts on
/// (§4.6 READ_REQUEST: "headers consumed: `Host`, `Range`, `If-Range`,
/// `If-Modified-Since`, `Pragma`, `Cache-Control`, `Connection`").
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// `GET` or `HEAD`.
    pub method: Method,
    /// The raw request-target, exactly as sent (not yet percent-decoded).
    pub target: String,
    /// `true` for HTTP/1.1, `false` for HTTP/1.0.
    pub http_11: bool,
    /// `Host` header value, if sent.
    pub host: Option<String>,
    /// Raw `Range` header value, if sent.
    pub range: Option<String>,
    /// Raw `If-Range` header value, if sent.
    pub if_range: Option<String>,
    /// Raw `If-Modified-Since` header value, if sent.
    pub if_modified_since: Option<String>,
    /// `Cache-Control: no-cache` or `Pragma: no-cache` was sent.
    pub client_no_cache: bool,
    /// Whether this connection should stay open after the response.
    pub keep_alive: bool,
}

impl ParsedRequest {
    fn version_string(&self) -> &'static str {
        if self.http_11 {
            "HTTP/1.1"
        } else {
            "HTTP/1.0"
        }
    }
}

/// How the first response line is framed (§4.7): standalone and inetd modes
/// write a normal HTTP status line, CGI mode writes `Status: <code> <reason>`
/// and leaves the web server in front of it to supply the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStyle {
    /// `HTTP/1.x <code> <reason>`.
    Http,
    /// `Status: <code> <reason>`.
    Cgi,
}

impl ResponseStyle {
    fn first_line(&self, version: &str, status_code: u16, reason_phrase: &str) -> String {
        match self {
            ResponseStyle::Http => format!("{version} {status_code} {reason_phrase}\r\n"),
            ResponseStyle::Cgi => format!("Status: {status_code} {reason_phrase}\r\n"),
        }
    }
}

/// Reads one HTTP request-line-plus-headers from `reader`. Tolerates a
/// single leading blank line before the request line (§4.6). Returns
/// `Ok(None)` if the connection was closed before any bytes of a new
/// request arrived — the normal way a keep-alive loop ends.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ParsedRequest>, RequestError> {
    let mut line = String::new();
    let mut tolerated_blank = false;

    let request_line = loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| RequestError::Io(e))?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() && !tolerated_blank {
            tolerated_blank = true;
            continue;
        }
        break trimmed.to_string();
    };

    let mut parts = request_line.split_whitespace();
    let method = match parts.next() {
        Some("GET") => Method::Get,
        Some("HEAD") => Method::Head,
        _ => return Err(RequestError::MalformedRequest(request_line.clone())),
    };
    let target = parts
        .next()
        .ok_or_else(|| RequestError::MalformedRequest(request_line.clone()))?
        .to_string();
    let http_11 = match parts.next() {
        Some("HTTP/1.1") => true,
        Some("HTTP/1.0") | None => false,
        Some(_) => return Err(RequestError::MalformedRequest(request_line.clone())),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| RequestError::Io(e))?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let get = |name: &str| -> Option<String> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let host = get("Host");
    if http_11 && host.is_none() {
        return Err(RequestError::MissingHost);
    }

    let client_no_cache = get("Pragma").is_some_and(|v| v.eq_ignore_ascii_case("no-cache"))
        || get("Cache-Control").is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"));

    let connection = get("Connection");
    let keep_alive = match connection.as_deref() {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => http_11,
    };

    Ok(Some(ParsedRequest {
        method,
        target,
        http_11,
        host,
        range: get("Range"),
        if_range: get("If-Range"),
        if_modified_since: get("If-Modified-Since"),
        client_no_cache,
        keep_alive,
    }))
}

/// Everything a handler needs that lives for the whole server lifetime.
#[derive(Clone)]
pub struct HandlerContext {
    /// The live, hot-reloadable configuration.
    pub config: SharedConfig,
    /// The cache coordinator.
    pub coordinator: Arc<Coordinator>,
}

/// What a served (non-error) request logged, for the access log.
#[derive(Debug, Clone)]
pub struct ServedRequest {
    /// `HIT`, `MISS`, `EXPIRED`, or `OFFLINE`.
    pub status_token: &'static str,
    /// Bytes of body actually written to the client.
    pub bytes_sent: u64,
    /// The object's basename, for the access log.
    pub basename: String,
    /// Whether the connection should remain open.
    pub keep_alive: bool,
}

/// Runs one request end to end: authorise, classify, coordinate, stream the
/// response to `writer`. Always writes a complete response (error or
/// success) before returning. `Ok` carries what the access log needs to
/// record; `Err` means a fault response was written and the connection
/// must close (§7: every client/config/upstream fault closes the
/// connection).
pub async fn handle_request<W: AsyncWrite + Unpin>(
    ctx: &HandlerContext,
    request: &ParsedRequest,
    peer: IpAddr,
    writer: &mut W,
) -> Result<ServedRequest, RequestError> {
    handle_request_with_style(ctx, request, peer, writer, ResponseStyle::Http).await
}

/// Same pipeline as [`handle_request`], but lets the caller choose how the
/// first response line is framed (§4.7 CGI mode).
pub async fn handle_request_with_style<W: AsyncWrite + Unpin>(
    ctx: &HandlerContext,
    request: &ParsedRequest,
    peer: IpAddr,
    writer: &mut W,
    style: ResponseStyle,
) -> Result<ServedRequest, RequestError> {
    let config = ctx.config.current();

    if !acl::is_authorised(
        peer,
        &config.allowed_hosts,
        &config.denied_hosts,
        &config.allowed_hosts_6,
        &config.denied_hosts_6,
    ) {
        let err = RequestError::Forbidden(peer);
        write_error_response(writer, request.version_string(), &err, style).await?;
        return Err(err);
    }

    let classified = match classify::classify(&request.target, request.host.as_deref(), &config.path_map) {
        Ok(c) => c,
        Err(e) => {
            let err = RequestError::from(e);
            write_error_response(writer, request.version_string(), &err, style).await?;
            return Err(err);
        }
    };

    let key = ObjectKey::new(classified.vhost.clone(), classified.uri.clone());
    let candidates = &config.path_map[&classified.vhost];

    if config.offline_mode {
        let state = ctx
            .coordinator
            .store()
            .entry_state(&key)
            .await
            .map_err(CoordinatorError::from)
            .map_err(RequestError::from)?;
        if state != EntryState::Complete {
            let err = RequestError::OfflineNoCachedCopy;
            write_error_response(writer, request.version_string(), &err, style).await?;
            return Err(err);
        }
    }

    let policy = FreshnessPolicy {
        expire_hours: config.expire_hours,
        use_etags: config.use_etags,
        ambiguous_revalidation_is_hit: config.ambiguous_revalidation_is_hit,
    };

    let coordinate_request = CoordinateRequest {
        candidates,
        uri: &classified.uri,
        is_index_file: matches!(classified.kind, FileKind::Index),
        client_no_cache: request.client_no_cache,
        policy,
    };

    let status = if config.offline_mode {
        CacheStatus::Hit
    } else {
        match ctx.coordinator.coordinate(&key, coordinate_request).await {
            Ok(status) => status,
            Err(e) => {
                let err = RequestError::from(e);
                write_error_response(writer, request.version_string(), &err, style).await?;
                return Err(err);
            }
        }
    };

    let reader = StreamingReader::new(ctx.coordinator.store(), stall_timeout(&config));
    let stream_request = StreamRequest {
        range: request.range.clone(),
        if_range: request.if_range.clone(),
        if_modified_since: request.if_modified_since.clone(),
        keep_alive: request.keep_alive,
        head_only: request.method == Method::Head,
    };

    let plan = match reader.plan(&key, &stream_request).await {
        Ok(plan) => plan,
        Err(e) => {
            let err = RequestError::from(e);
            write_error_response(writer, request.version_string(), &err, style).await?;
            return Err(err);
        }
    };

    write_status_and_headers(
        writer,
        request.version_string(),
        plan.status_code,
        &plan.reason_phrase,
        &plan.headers,
        style,
    )
    .await
    .map_err(RequestError::from)?;

    let bytes_sent = match plan.body {
        BodyPlan::None => 0,
        BodyPlan::Full => {
            let total = plan
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
                .and_then(|(_, v)| v.parse::<u64>().ok())
                .unwrap_or(0);
            let range = ByteRange { start: 0, end: total.saturating_sub(1) };
            stream_plan_body(ctx, &key, &reader, range, writer).await?
        }
        BodyPlan::Range(range) => stream_plan_body(ctx, &key, &reader, range, writer).await?,
    };

    writer.flush().await.map_err(RequestError::from)?;

    let keep_alive = request.keep_alive && plan.status_code < 400;
    Ok(ServedRequest {
        status_token: status.as_log_token(),
        bytes_sent,
        basename: classified.basename,
        keep_alive,
    })
}

async fn stream_plan_body<W: AsyncWrite + Unpin>(
    ctx: &HandlerContext,
    key: &ObjectKey,
    reader: &StreamingReader<'_>,
    range: ByteRange,
    writer: &mut W,
) -> Result<u64, RequestError> {
    let file = ctx
        .coordinator
        .store()
        .open_for_read(key)
        .await
        .map_err(CoordinatorError::from)
        .map_err(RequestError::from)?;
    let mut tokio_file = tokio::fs::File::from_std(file);
    reader
        .stream_body(key, &mut tokio_file, range, writer)
        .await
        .map_err(RequestError::from)
}

fn stall_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.fetch_timeout)
}

async fn write_status_and_headers<W: AsyncWrite + Unpin>(
    writer: &mut W,
    version: &str,
    status_code: u16,
    reason_phrase: &str,
    headers: &[(String, String)],
    style: ResponseStyle,
) -> std::io::Result<()> {
    let mut out = style.first_line(version, status_code, reason_phrase);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await
}

/// Best-guess protocol version for a fault raised before a full request
/// could be parsed (`read_request` failures): `HTTP/1.1` only when the
/// fault itself proves the client claimed 1.1 (`MissingHost`), `HTTP/1.0`
/// otherwise, since the request line may not even have been readable.
pub(crate) fn read_error_version(err: &RequestError) -> &'static str {
    match err {
        RequestError::MissingHost => "HTTP/1.1",
        _ => "HTTP/1.0",
    }
}

pub(crate) async fn write_error_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    version: &str,
    err: &RequestError,
    style: ResponseStyle,
) -> Result<(), RequestError> {
    let status = err.status_code();
    let reason = reason_phrase(status);
    let body = err.to_string();
    let mut out = style.first_line(version, status, reason);
    out.push_str(&format!(
        "Connection: close\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
        body.len(),
        body
    ));
    writer.write_all(out.as_bytes()).await.map_err(RequestError::from)?;
    writer.flush().await.map_err(RequestError::from)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}
