//! Request-head parsing.
//!
//! `httparse` does the token-level work on the happy path. When it rejects
//! a head, [`diagnose`] walks the bytes once more against the grammar to
//! pin down the position, the previous byte and the offending byte, and to
//! classify the failure (request line vs. header vs. HTTP version).

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri, Version};

use crate::error::Parse;
use crate::{Error, Result};

pub(crate) const MAX_HEADERS: usize = 100;

#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    /// Wire length of the head, including the terminating CRLF.
    pub(crate) head_len: usize,
}

/// Tries to parse a complete request head from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. On success the head bytes are
/// consumed from `buf`.
pub(crate) fn parse_head(buf: &mut BytesMut, max_size: usize) -> Result<Option<Head>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let (method, uri, version, map, len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let status = match req.parse(buf) {
            Ok(status) => status,
            Err(e) => return Err(diagnose(buf, e)),
        };

        let len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > max_size {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                return Ok(None);
            }
        };

        if len > max_size {
            return Err(Error::new_parse(Parse::TooLarge));
        }

        let method = Method::from_bytes(req.method.expect("complete head").as_bytes())
            .map_err(|_| request_line_error(buf, 0, "invalid method token"))?;

        let version = match req.version.expect("complete head") {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let path = req.path.expect("complete head");
        let target_at = target_position(buf);
        let uri = parse_target(&method, path)
            .ok_or_else(|| request_line_error(buf, target_at, "invalid request target"))?;

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| header_error(buf, 0, "invalid header name"))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| header_error(buf, 0, "invalid header value"))?;
            map.append(name, value);
        }

        (method, uri, version, map, len)
    };

    let _ = buf.split_to(len);

    Ok(Some(Head {
        method,
        uri,
        version,
        headers: map,
        head_len: len,
    }))
}

/// Validates the request target form and produces a `Uri`.
///
/// Origin-form is required, with two exceptions: `*` (OPTIONS) and
/// authority-form for CONNECT.
fn parse_target(method: &Method, path: &str) -> Option<Uri> {
    if path.is_empty() {
        return None;
    }
    if *method == Method::CONNECT {
        if path.starts_with('/') {
            return None;
        }
    } else if !path.starts_with('/') && path != "*" {
        return None;
    }
    path.parse::<Uri>().ok()
}

fn target_position(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == b' ').map_or(0, |i| i + 1)
}

fn request_line_error(buf: &[u8], at: usize, msg: &'static str) -> Error {
    Error::new_parse(Parse::RequestLine {
        at,
        prev: at.checked_sub(1).and_then(|i| buf.get(i)).copied(),
        byte: buf.get(at).copied(),
        msg,
    })
}

fn header_error(buf: &[u8], at: usize, msg: &'static str) -> Error {
    Error::new_parse(Parse::Header {
        at,
        prev: at.checked_sub(1).and_then(|i| buf.get(i)).copied(),
        byte: buf.get(at).copied(),
        msg,
    })
}

// ===== error diagnosis =====

struct Scan<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Scan<'a> {
    fn cur(&self) -> Option<u8> {
        self.buf.get(self.at).copied()
    }

    fn prev(&self) -> Option<u8> {
        self.at.checked_sub(1).and_then(|i| self.buf.get(i)).copied()
    }

    fn bump(&mut self) {
        self.at += 1;
    }

    fn request_line(&mut self, msg: &'static str) -> Error {
        Error::new_parse(Parse::RequestLine {
            at: self.at,
            prev: self.prev(),
            byte: self.cur(),
            msg,
        })
    }

    fn header(&mut self, msg: &'static str) -> Error {
        Error::new_parse(Parse::Header {
            at: self.at,
            prev: self.prev(),
            byte: self.cur(),
            msg,
        })
    }

    fn version(&mut self, msg: &'static str) -> Error {
        Error::new_parse(Parse::Version {
            at: self.at,
            prev: self.prev(),
            byte: self.cur(),
            msg,
        })
    }
}

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Re-walks a rejected head to classify the failure with byte context.
///
/// The walk is intentionally stricter than necessary; whatever it cannot
/// pin down falls back to a coarse classification of the httparse error.
fn diagnose(buf: &[u8], fallback: httparse::Error) -> Error {
    let mut s = Scan { buf, at: 0 };

    // method token
    while let Some(b) = s.cur() {
        if is_tchar(b) {
            s.bump();
        } else {
            break;
        }
    }
    if s.at == 0 {
        return s.request_line("empty method token");
    }
    match s.cur() {
        Some(b' ') => s.bump(),
        Some(b'\t') => return s.request_line("whitespace other than a single space"),
        _ => return s.request_line("invalid byte in method token"),
    }

    // request target, up to the next space
    loop {
        match s.cur() {
            Some(b' ') => {
                s.bump();
                break;
            }
            Some(b'\r') | Some(b'\n') => {
                return s.request_line("missing HTTP version");
            }
            Some(_) => s.bump(),
            None => return s.request_line("unterminated request line"),
        }
    }

    // HTTP-version: HTTP "/" DIGIT "." DIGIT
    for expected in b"HTTP" {
        match s.cur() {
            Some(b) if b == *expected => s.bump(),
            Some(b' ') | Some(b'\t') => return s.version("whitespace inside HTTP version"),
            _ => return s.version("malformed protocol name"),
        }
    }
    match s.cur() {
        Some(b'/') => s.bump(),
        Some(b' ') | Some(b'\t') => return s.version("whitespace inside HTTP version"),
        _ => return s.version("missing forward slash in HTTP version"),
    }
    let major = match s.cur() {
        Some(b @ b'0'..=b'9') => {
            s.bump();
            b - b'0'
        }
        Some(b' ') | Some(b'\t') => return s.version("whitespace inside HTTP version"),
        _ => return s.version("invalid major version digit"),
    };
    match s.cur() {
        Some(b'.') => s.bump(),
        Some(b' ') | Some(b'\t') => return s.version("whitespace inside HTTP version"),
        _ => return s.version("missing dot in HTTP version"),
    }
    match s.cur() {
        Some(b'0'..=b'9') => s.bump(),
        Some(b' ') | Some(b'\t') => return s.version("whitespace inside HTTP version"),
        _ => return s.version("invalid minor version digit"),
    }
    if major >= 2 {
        return Error::new_parse(Parse::VersionTooNew);
    }
    if major == 0 {
        return Error::new_parse(Parse::VersionTooOld);
    }
    match s.cur() {
        Some(b'\r') => s.bump(),
        Some(b' ') | Some(b'\t') => return s.version("whitespace inside HTTP version"),
        _ => return s.version("request line not terminated by CRLF"),
    }
    match s.cur() {
        Some(b'\n') => s.bump(),
        _ => return s.version("request line not terminated by CRLF"),
    }

    // header lines
    loop {
        match s.cur() {
            Some(b'\r') | None => break,
            Some(b' ') | Some(b'\t') => return s.header("folded header line"),
            _ => {}
        }
        // field name
        let name_start = s.at;
        loop {
            match s.cur() {
                Some(b':') => {
                    if s.at == name_start {
                        return s.header("no header name before colon");
                    }
                    s.bump();
                    break;
                }
                Some(b' ') | Some(b'\t') => {
                    return s.header("whitespace in header name or before colon");
                }
                Some(b) if is_tchar(b) => s.bump(),
                Some(_) => return s.header("invalid byte in header name"),
                None => return s.header("unterminated header line"),
            }
        }
        // field value, up to CRLF
        loop {
            match s.cur() {
                Some(b'\r') => {
                    s.bump();
                    match s.cur() {
                        Some(b'\n') => {
                            s.bump();
                            break;
                        }
                        _ => return s.header("bare CR in header value"),
                    }
                }
                Some(b'\n') => return s.header("bare LF in header value"),
                Some(_) => s.bump(),
                None => return s.header("unterminated header line"),
            }
        }
    }

    // The walk found nothing wrong; classify coarsely from httparse.
    let mut s = Scan { buf, at: 0 };
    match fallback {
        httparse::Error::Version => s.version("invalid HTTP version"),
        httparse::Error::HeaderName | httparse::Error::HeaderValue => {
            s.header("invalid header field")
        }
        httparse::Error::TooManyHeaders => s.header("too many headers"),
        _ => s.request_line("malformed request line"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    fn parse(raw: &str) -> Result<Option<Head>> {
        let mut buf = BytesMut::from(raw.as_bytes());
        parse_head(&mut buf, 8192)
    }

    fn parse_err(raw: &str) -> Error {
        parse(raw).expect_err(raw)
    }

    #[test]
    fn parses_a_simple_request() {
        let mut buf = BytesMut::from(&b"GET /echo?x=1 HTTP/1.1\r\nHost: quay.rs\r\n\r\n"[..]);
        let len = buf.len();
        let head = parse_head(&mut buf, 8192).unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri.path(), "/echo");
        assert_eq!(head.uri.query(), Some("x=1"));
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "quay.rs");
        assert_eq!(head.head_len, len);
        assert!(buf.is_empty(), "head bytes are consumed");
    }

    #[test]
    fn preserves_header_order_and_duplicates() {
        let head = parse("GET / HTTP/1.1\r\nX-A: 1\r\nX-A: 2\r\nX-B: 3\r\n\r\n")
            .unwrap()
            .unwrap();
        let all: Vec<_> = head.headers.get_all("x-a").into_iter().collect();
        assert_eq!(all, [&"1", &"2"]);
        assert_eq!(head.headers.len(), 3);
    }

    #[test]
    fn partial_returns_none() {
        assert!(parse("GET / HTTP/1.1\r\nHost:").unwrap().is_none());
        assert!(parse("").unwrap().is_none());
    }

    #[test]
    fn partial_over_max_is_too_large() {
        let mut buf = BytesMut::from(&b"GET /aa"[..]);
        let err = parse_head(&mut buf, 1).unwrap_err();
        assert!(matches!(err.kind(), Kind::Parse(Parse::TooLarge)));
        assert_eq!(err.status(), Some(http::StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[test]
    fn missing_version_slash() {
        let err = parse_err("GET / HTTP1.1\r\n\r\n");
        assert!(
            matches!(err.kind(), Kind::Parse(Parse::Version { .. })),
            "{:?}",
            err
        );
        assert!(err.to_string().contains("forward slash"), "{}", err);
    }

    #[test]
    fn whitespace_inside_version() {
        let err = parse_err("GET / HTTP/1 .1\r\n\r\n");
        assert!(matches!(err.kind(), Kind::Parse(Parse::Version { .. })));
    }

    #[test]
    fn version_two_is_too_new() {
        let err = parse_err("GET / HTTP/2.0\r\n\r\n");
        assert!(matches!(err.kind(), Kind::Parse(Parse::VersionTooNew)));
        assert_eq!(
            err.status(),
            Some(http::StatusCode::HTTP_VERSION_NOT_SUPPORTED)
        );
    }

    #[test]
    fn version_zero_is_too_old() {
        let err = parse_err("GET / HTTP/0.9\r\n\r\n");
        assert!(matches!(err.kind(), Kind::Parse(Parse::VersionTooOld)));
        assert_eq!(err.status(), Some(http::StatusCode::UPGRADE_REQUIRED));
    }

    #[test]
    fn whitespace_before_colon_is_rejected() {
        let err = parse_err("GET / HTTP/1.1\r\nHost : x\r\n\r\n");
        assert!(matches!(err.kind(), Kind::Parse(Parse::Header { .. })));
        assert!(err.to_string().contains("whitespace"), "{}", err);
    }

    #[test]
    fn folded_header_is_rejected() {
        let err = parse_err("GET / HTTP/1.1\r\nHost: a\r\n b\r\n\r\n");
        assert!(matches!(err.kind(), Kind::Parse(Parse::Header { .. })));
    }

    #[test]
    fn connect_takes_authority_form() {
        let head = parse("CONNECT quay.rs:443 HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.uri.to_string(), "quay.rs:443");
    }

    #[test]
    fn asterisk_form_options() {
        let head = parse("OPTIONS * HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.method, Method::OPTIONS);
    }

    #[test]
    fn error_position_points_at_the_offending_byte() {
        // the space before the colon, position 20
        let raw = "GET / HTTP/1.1\r\nHost : x\r\n\r\n";
        let err = parse_err(raw);
        match err.kind() {
            Kind::Parse(Parse::Header { at, byte, .. }) => {
                assert_eq!(raw.as_bytes()[*at], b' ');
                assert_eq!(*byte, Some(b' '));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
