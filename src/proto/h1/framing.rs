//! Response framing: deciding and validating how a response body goes on
//! the wire, before any byte of it is emitted.

use std::collections::HashSet;

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRAILER, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};

use super::encode::Encoder;
use crate::error::User;
use crate::headers;
use crate::{Error, Result};

#[derive(Debug)]
pub(crate) struct FramingPlan {
    pub(crate) encoder: Encoder,
    /// Body bytes must not reach the wire (HEAD, 204, 304, ...).
    pub(crate) suppress_body: bool,
    /// The framing alone forces the connection closed afterwards.
    pub(crate) force_close: bool,
}

/// Decides the framing for a response, enforcing the protocol rules that
/// must hold before emission. Violations discard the response with an
/// internal error (500).
pub(crate) fn plan(
    req_method: &Method,
    req_version: Version,
    status: StatusCode,
    headers: &mut HeaderMap,
    body_len: Option<u64>,
) -> Result<FramingPlan> {
    let declared = headers::content_length_parse(headers)
        .map_err(|()| Error::new_user(User::UnexpectedFraming("invalid Content-Length on response")))?;
    let cl_present = headers.contains_key(CONTENT_LENGTH);
    let te_present = headers::transfer_encoding_present(headers);
    let te_chunked = headers::transfer_encoding_is_chunked(headers);

    if cl_present && te_present {
        return Err(Error::new_user(User::UnexpectedFraming(
            "response carries both Content-Length and Transfer-Encoding",
        )));
    }
    if te_present && !te_chunked {
        return Err(Error::new_user(User::UnexpectedFraming(
            "response transfer coding other than a final chunked",
        )));
    }

    let empty = |suppress_body: bool| FramingPlan {
        encoder: Encoder::length(0),
        suppress_body,
        force_close: false,
    };

    if status.is_informational() || status == StatusCode::NO_CONTENT {
        if cl_present || te_present {
            return Err(Error::new_user(User::UnexpectedFraming(
                "framing headers on a bodiless status",
            )));
        }
        if body_len != Some(0) {
            return Err(Error::new_user(User::UnexpectedBody(
                "response body on a bodiless status",
            )));
        }
        return Ok(empty(true));
    }

    if status == StatusCode::NOT_MODIFIED {
        // length metadata may stay in the headers; the body must be empty
        if body_len != Some(0) {
            return Err(Error::new_user(User::UnexpectedBody(
                "response body on 304 Not Modified",
            )));
        }
        return Ok(empty(true));
    }

    if *req_method == Method::CONNECT && status.is_success() {
        if cl_present || te_present {
            return Err(Error::new_user(User::UnexpectedFraming(
                "framing headers on a 2xx CONNECT response",
            )));
        }
        if body_len != Some(0) {
            return Err(Error::new_user(User::UnexpectedBody(
                "response body on a 2xx CONNECT response",
            )));
        }
        return Ok(empty(true));
    }

    if *req_method == Method::HEAD {
        // declared length metadata stays; the body must be empty
        if body_len != Some(0) {
            return Err(Error::new_user(User::UnexpectedBody(
                "response body on a HEAD request",
            )));
        }
        return Ok(empty(true));
    }

    match body_len {
        Some(len) => {
            if let Some(declared) = declared {
                if declared != len {
                    return Err(Error::new_user(User::LengthMismatch {
                        declared,
                        actual: len,
                    }));
                }
            }
            if te_chunked {
                return Ok(FramingPlan {
                    encoder: chunked_encoder(headers),
                    suppress_body: false,
                    force_close: false,
                });
            }
            if !cl_present {
                let mut buf = itoa::Buffer::new();
                headers.insert(
                    CONTENT_LENGTH,
                    HeaderValue::from_str(buf.format(len)).expect("integer is a valid value"),
                );
            }
            Ok(FramingPlan {
                encoder: Encoder::length(len),
                suppress_body: false,
                force_close: false,
            })
        }
        None => {
            if let Some(declared) = declared {
                // the stream promises to produce exactly the declared bytes
                return Ok(FramingPlan {
                    encoder: Encoder::length(declared),
                    suppress_body: false,
                    force_close: false,
                });
            }
            if req_version == Version::HTTP_10 {
                // chunked cannot be offered to a 1.0 peer
                headers.remove(TRANSFER_ENCODING);
                return Ok(FramingPlan {
                    encoder: Encoder::close_delimited(),
                    suppress_body: false,
                    force_close: true,
                });
            }
            if !te_chunked {
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            Ok(FramingPlan {
                encoder: chunked_encoder(headers),
                suppress_body: false,
                force_close: false,
            })
        }
    }
}

fn chunked_encoder(headers: &HeaderMap) -> Encoder {
    let mut allowed: HashSet<String> = HashSet::new();
    for value in headers.get_all(TRAILER) {
        if let Ok(s) = value.to_str() {
            for name in s.split(',') {
                let name = name.trim();
                if !name.is_empty() {
                    allowed.insert(name.to_ascii_lowercase());
                }
            }
        }
    }
    if allowed.is_empty() {
        Encoder::chunked()
    } else {
        Encoder::chunked().with_allowed_trailers(allowed)
    }
}

/// Serializes `HTTP/1.1 <code> <reason>` plus the header block.
///
/// Responses are always advertised as HTTP/1.1, whatever the request
/// version was.
pub(crate) fn write_head(status: StatusCode, headers: &HeaderMap, dst: &mut BytesMut) {
    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.extend_from_slice(b"\r\n");
    write_headers(headers, dst);
    dst.extend_from_slice(b"\r\n");
}

/// Writes header lines, names title-cased on emit.
pub(crate) fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers.iter() {
        title_case(name.as_str().as_bytes(), dst);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

fn title_case(name: &[u8], dst: &mut BytesMut) {
    let mut upcase_next = true;
    for &b in name {
        if upcase_next {
            dst.extend_from_slice(&[b.to_ascii_uppercase()]);
            upcase_next = false;
        } else {
            dst.extend_from_slice(&[b]);
        }
        if b == b'-' {
            upcase_next = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn known_length_sets_content_length() {
        let mut map = HeaderMap::new();
        let plan = plan(
            &Method::GET,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            Some(2),
        )
        .unwrap();
        assert!(!plan.suppress_body);
        assert_eq!(map.get(CONTENT_LENGTH).unwrap(), "2");
    }

    #[test]
    fn unknown_length_gets_chunked() {
        let mut map = HeaderMap::new();
        let plan = plan(
            &Method::GET,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            None,
        )
        .unwrap();
        assert!(plan.encoder.is_chunked());
        assert_eq!(map.get(TRANSFER_ENCODING).unwrap(), "chunked");
    }

    #[test]
    fn unknown_length_to_http10_is_close_delimited() {
        let mut map = HeaderMap::new();
        let plan = plan(
            &Method::GET,
            Version::HTTP_10,
            StatusCode::OK,
            &mut map,
            None,
        )
        .unwrap();
        assert!(plan.encoder.is_close_delimited());
        assert!(plan.force_close);
        assert!(!map.contains_key(TRANSFER_ENCODING));
    }

    #[test]
    fn both_framing_headers_is_an_error() {
        let mut map = headers(&[("content-length", "5"), ("transfer-encoding", "chunked")]);
        let err = plan(
            &Method::GET,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            Some(5),
        )
        .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn declared_length_must_match_actual() {
        let mut map = headers(&[("content-length", "10")]);
        let err = plan(
            &Method::GET,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            Some(7),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Discrepancy between Content-Length=10 and actual body length 7"
        );
    }

    #[test]
    fn bodiless_statuses_reject_framing_headers() {
        for status in [StatusCode::NO_CONTENT, StatusCode::CONTINUE] {
            let mut map = headers(&[("content-length", "0")]);
            let err = plan(
                &Method::GET,
                Version::HTTP_11,
                status,
                &mut map,
                Some(0),
            )
            .unwrap_err();
            assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        }
    }

    #[test]
    fn bodiless_statuses_reject_bodies() {
        let mut map = HeaderMap::new();
        let err = plan(
            &Method::GET,
            Version::HTTP_11,
            StatusCode::NO_CONTENT,
            &mut map,
            Some(3),
        )
        .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn connect_2xx_rejects_framing_headers() {
        let mut map = headers(&[("content-length", "0")]);
        let err = plan(
            &Method::CONNECT,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            Some(0),
        )
        .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn head_suppresses_body_but_keeps_length_metadata() {
        let mut map = headers(&[("content-length", "123")]);
        let plan = plan(
            &Method::HEAD,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            Some(0),
        )
        .unwrap();
        assert!(plan.suppress_body);
        assert_eq!(map.get(CONTENT_LENGTH).unwrap(), "123");
    }

    #[test]
    fn head_with_body_is_an_error() {
        let mut map = HeaderMap::new();
        let err = plan(
            &Method::HEAD,
            Version::HTTP_11,
            StatusCode::OK,
            &mut map,
            Some(5),
        )
        .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn head_serialization_is_title_cased() {
        let map = headers(&[
            ("content-type", "text/plain; charset=utf-8"),
            ("content-length", "2"),
        ]);
        let mut dst = BytesMut::new();
        write_head(StatusCode::OK, &map, &mut dst);
        assert_eq!(
            &dst[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: 2\r\n\r\n"
                .as_ref()
        );
    }

    #[test]
    fn interim_head_serialization() {
        let mut dst = BytesMut::new();
        write_head(StatusCode::CONTINUE, &HeaderMap::new(), &mut dst);
        assert_eq!(&dst[..], b"HTTP/1.1 100 Continue\r\n\r\n".as_ref());
    }
}
