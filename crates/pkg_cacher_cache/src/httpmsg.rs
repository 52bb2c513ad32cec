//! Parses the raw status-line + header bytes persisted to
//! `headers/<vhost>/<uri>` back into a structured form, used both by the
//! coordinator (reading cached `ETag`/`Last-Modified` for revalidation)
//! and the streaming reader (sanitising headers for forwarding, §4.5
//! point 2).

/// A parsed response header sidecar.
#[derive(Debug, Clone)]
pub struct ParsedHeaders {
    /// The raw first line, e.g. `HTTP/1.1 200 OK`.
    pub status_line: String,
    /// The numeric status code extracted from the status line.
    pub status_code: u16,
    /// Header name/value pairs in the order they appeared. Names are kept
    /// as received (not lower-cased) but lookups via [`ParsedHeaders::get`]
    /// are case-insensitive per HTTP semantics.
    pub headers: Vec<(String, String)>,
}

impl ParsedHeaders {
    /// Case-insensitive lookup of a header's first value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The authoritative total body length, per §4.5 point 2 ("Extract
    /// `Content-Length` separately as the authoritative total length").
    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }
}

/// Parses `bytes` (CRLF- or LF-terminated) into a [`ParsedHeaders`].
/// Returns `None` if the first line isn't a recognisable status line.
pub fn parse(bytes: &[u8]) -> Option<ParsedHeaders> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));

    let status_line = lines.next()?.trim_end().to_string();
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())?;

    let headers = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Some(ParsedHeaders {
        status_line,
        status_code,
        headers,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_status_line_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nETag: \"abc\"\r\nLast-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 10\r\n\r\n";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.status_code, 200);
        assert_eq!(parsed.get("etag"), Some("\"abc\""));
        assert_eq!(parsed.content_length(), Some(10));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\n";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn rejects_bytes_with_no_status_line() {
        assert!(parse(b"not a status line at all").is_none());
    }
}
