//! Formats an HTTP response as the raw status-line + header bytes the
//! content store persists to `headers/<vhost>/<uri>` (§3 "Cache entry").

use reqwest::Response;

/// Serialises `response`'s status line and headers exactly as a client
/// would see them on the wire, CRLF-terminated, ending with a blank line.
pub fn format_raw_headers(response: &Response) -> Vec<u8> {
    let mut out = Vec::new();
    let version = match response.version() {
        reqwest::Version::HTTP_10 => "HTTP/1.0",
        reqwest::Version::HTTP_11 => "HTTP/1.1",
        _ => "HTTP/1.1",
    };
    let status = response.status();
    out.extend_from_slice(
        format!(
            "{version} {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Synthesises a status line + `Content-Length` header for upstreams that
/// used chunked transfer encoding and therefore never sent one (§3
/// "Completion marker implies body integrity": "its length matches the
/// Content-Length header (which is synthesised if the upstream used
/// chunked encoding)").
pub fn synthesize_content_length(raw_headers: &[u8], actual_len: u64) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw_headers);
    if text.lines().any(|l| l.to_ascii_lowercase().starts_with("content-length:")) {
        return raw_headers.to_vec();
    }
    let mut out = Vec::with_capacity(raw_headers.len() + 32);
    let mut lines = text.lines();
    if let Some(status_line) = lines.next() {
        out.extend_from_slice(status_line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {actual_len}\r\n").as_bytes());
    for line in lines {
        if line.is_empty() {
            continue;
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Builds a synthesised raw header block for a transport failure that
/// leaves no real upstream response to persist (§4.3 point 4: "a
/// synthesised `502 libcurl error: <reason>`").
pub fn synthesize_error_headers(status: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status} {reason}\r\n\r\n").into_bytes()
}
