//! Encoders for the response body framings.

use std::collections::HashSet;
use std::fmt;

use bytes::BytesMut;
use http::header::HeaderMap;

use super::framing::write_headers;
use crate::error::User;
use crate::{Error, Result};

/// Encoders to handle the different response framings.
#[derive(Debug, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
    trailers_sent: bool,
}

#[derive(Debug, PartialEq)]
enum Kind {
    /// An encoder for when `Content-Length` is set.
    ///
    /// Enforces that the body is exactly as long as declared.
    Length { declared: u64, remaining: u64 },
    /// An encoder applying `Transfer-Encoding: chunked`.
    ///
    /// Carries the trailer names declared by the response, when any.
    Chunked(Option<HashSet<String>>),
    /// No framing; the body runs until the connection closes.
    ///
    /// Used for unknown-length bodies sent to an HTTP/1.0 client, which
    /// cannot be offered chunked coding.
    CloseDelimited,
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length {
                declared: len,
                remaining: len,
            },
            trailers_sent: false,
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked(None),
            trailers_sent: false,
        }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
            trailers_sent: false,
        }
    }

    pub(crate) fn with_allowed_trailers(mut self, names: HashSet<String>) -> Encoder {
        if let Kind::Chunked(ref mut allowed) = self.kind {
            *allowed = Some(names);
        }
        self
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Kind::CloseDelimited)
    }

    /// Frames one body buffer into `dst`.
    pub(crate) fn encode(&mut self, msg: &[u8], dst: &mut BytesMut) -> Result<()> {
        debug_assert!(!msg.is_empty(), "encode() called with empty buf");

        match self.kind {
            Kind::Chunked(_) => {
                tracing::trace!("encoding chunked {}B", msg.len());
                extend_chunk_size(dst, msg.len());
                dst.extend_from_slice(msg);
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            Kind::Length {
                declared,
                ref mut remaining,
            } => {
                tracing::trace!("sized write, len = {}", msg.len());
                let len = msg.len() as u64;
                if len > *remaining {
                    let actual = declared - *remaining + len;
                    return Err(Error::new_user(User::LengthMismatch { declared, actual }));
                }
                *remaining -= len;
                dst.extend_from_slice(msg);
                Ok(())
            }
            Kind::CloseDelimited => {
                tracing::trace!("close delimited write {}B", msg.len());
                dst.extend_from_slice(msg);
                Ok(())
            }
        }
    }

    /// Emits the trailer section, replacing the chunked terminator.
    ///
    /// Trailers are only written when the response declared them via a
    /// `Trailer` header; anything undeclared or forbidden is dropped.
    pub(crate) fn encode_trailers(&mut self, trailers: &HeaderMap, dst: &mut BytesMut) {
        let allowed = match self.kind {
            Kind::Chunked(Some(ref allowed)) => allowed,
            Kind::Chunked(None) => {
                tracing::debug!("response carried trailers but declared none; dropping");
                return;
            }
            _ => {
                tracing::debug!("trailers on a non-chunked response; dropping");
                return;
            }
        };

        let mut filtered = HeaderMap::new();
        for (name, value) in trailers.iter() {
            if !allowed.contains(name.as_str()) {
                tracing::debug!("trailer {} not declared; dropping", name);
                continue;
            }
            if !is_valid_trailer_field(name.as_str()) {
                tracing::debug!("trailer {} is not a valid trailer field; dropping", name);
                continue;
            }
            filtered.append(name.clone(), value.clone());
        }

        if filtered.is_empty() {
            return;
        }

        dst.extend_from_slice(b"0\r\n");
        write_headers(&filtered, dst);
        dst.extend_from_slice(b"\r\n");
        self.trailers_sent = true;
    }

    /// Finishes the body, validating the declared length.
    pub(crate) fn end(&self, dst: &mut BytesMut) -> Result<()> {
        match self.kind {
            Kind::Length {
                declared,
                remaining,
            } => {
                if remaining != 0 {
                    return Err(Error::new_user(User::LengthMismatch {
                        declared,
                        actual: declared - remaining,
                    }));
                }
                Ok(())
            }
            Kind::Chunked(_) => {
                if !self.trailers_sent {
                    dst.extend_from_slice(b"0\r\n\r\n");
                }
                Ok(())
            }
            Kind::CloseDelimited => Ok(()),
        }
    }
}

fn is_valid_trailer_field(name: &str) -> bool {
    !matches!(
        name,
        "authorization"
            | "cache-control"
            | "content-encoding"
            | "content-length"
            | "content-range"
            | "content-type"
            | "host"
            | "max-forwards"
            | "set-cookie"
            | "te"
            | "trailer"
            | "transfer-encoding"
    )
}

/// Appends `{len:X}\r\n` without allocating.
fn extend_chunk_size(dst: &mut BytesMut, len: usize) {
    use fmt::Write;

    struct Writer<'a>(&'a mut BytesMut);

    impl fmt::Write for Writer<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.0.extend_from_slice(s.as_bytes());
            Ok(())
        }
    }

    write!(Writer(dst), "{:X}\r\n", len).expect("hex of usize always fits");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    #[test]
    fn chunked() {
        let mut encoder = Encoder::chunked();
        let mut dst = BytesMut::new();

        encoder.encode(b"foo bar", &mut dst).unwrap();
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\n");

        encoder.encode(b"baz quux herp", &mut dst).unwrap();
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n");

        encoder.end(&mut dst).unwrap();
        assert_eq!(
            &dst[..],
            b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n0\r\n\r\n".as_ref()
        );
    }

    #[test]
    fn length() {
        let mut encoder = Encoder::length(8);
        let mut dst = BytesMut::new();

        encoder.encode(b"foo bar", &mut dst).unwrap();
        assert_eq!(&dst[..], b"foo bar");
        encoder.end(&mut dst).unwrap_err();

        encoder.encode(b"b", &mut dst).unwrap();
        assert_eq!(&dst[..], b"foo barb");
        encoder.end(&mut dst).unwrap();
    }

    #[test]
    fn length_overflow_reports_discrepancy() {
        let mut encoder = Encoder::length(4);
        let mut dst = BytesMut::new();
        let err = encoder.encode(b"too long", &mut dst).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Discrepancy between Content-Length=4 and actual body length 8"
        );
    }

    #[test]
    fn close_delimited_is_raw() {
        let mut encoder = Encoder::close_delimited();
        let mut dst = BytesMut::new();
        encoder.encode(b"foo bar", &mut dst).unwrap();
        encoder.encode(b"baz", &mut dst).unwrap();
        encoder.end(&mut dst).unwrap();
        assert_eq!(&dst[..], b"foo barbaz");
    }

    #[test]
    fn declared_trailers_are_emitted() {
        let mut encoder = Encoder::chunked()
            .with_allowed_trailers(["chunky-trailer".to_string()].into_iter().collect());
        let mut dst = BytesMut::new();
        encoder.encode(b"hi", &mut dst).unwrap();

        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static("chunky-trailer"),
            HeaderValue::from_static("header data"),
        );
        trailers.insert(
            HeaderName::from_static("should-not-be-included"),
            HeaderValue::from_static("oops"),
        );
        encoder.encode_trailers(&trailers, &mut dst);
        encoder.end(&mut dst).unwrap();

        assert_eq!(
            &dst[..],
            b"2\r\nhi\r\n0\r\nChunky-Trailer: header data\r\n\r\n".as_ref()
        );
    }

    #[test]
    fn forbidden_trailer_fields_are_dropped() {
        let mut encoder = Encoder::chunked().with_allowed_trailers(
            ["content-length".to_string(), "host".to_string()]
                .into_iter()
                .collect(),
        );
        let mut dst = BytesMut::new();

        let mut trailers = HeaderMap::new();
        trailers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("10"),
        );
        trailers.insert(http::header::HOST, HeaderValue::from_static("quay.rs"));
        encoder.encode_trailers(&trailers, &mut dst);
        encoder.end(&mut dst).unwrap();

        // nothing but the plain terminator
        assert_eq!(&dst[..], b"0\r\n\r\n");
    }

    #[test]
    fn undeclared_trailers_leave_plain_terminator() {
        let mut encoder = Encoder::chunked();
        let mut dst = BytesMut::new();
        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static("x-late"),
            HeaderValue::from_static("1"),
        );
        encoder.encode_trailers(&trailers, &mut dst);
        encoder.end(&mut dst).unwrap();
        assert_eq!(&dst[..], b"0\r\n\r\n");
    }
}
