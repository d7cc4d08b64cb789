//! Decoders for the two request body framings.
//!
//! A decoder turns transport bytes into body [`Frame`]s. The end of a body
//! is announced as an empty data frame; trailers, when present and declared,
//! arrive as a trailers frame right before the end.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use http_body::Frame;

use super::io::Buffered;
use super::parse::MAX_HEADERS;
use crate::error::BodyKind;
use crate::headers;
use crate::{Error, Result};

/// Maximum bytes of chunk extensions tolerated across the whole body.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Maximum bytes of the trailer block.
const TRAILER_LIMIT: usize = 1024 * 16;

/// Decoders to handle the different request framings.
#[derive(Debug)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// A reader for bodies declared by `Content-Length`.
    Length(u64),
    /// A reader for `Transfer-Encoding: chunked` bodies.
    Chunked {
        phase: Phase,
        extensions_cnt: u64,
        wants_trailers: bool,
        trailers: Option<HeaderMap>,
    },
}

#[derive(Debug, PartialEq)]
enum Phase {
    Size,
    Data(u64),
    Done,
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked(wants_trailers: bool) -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                phase: Phase::Size,
                extensions_cnt: 0,
                wants_trailers,
                trailers: None,
            },
        }
    }

    /// Picks the decoder for a parsed request head.
    ///
    /// The selection order is fixed: conflicting framing headers are a bad
    /// request, a non-final `chunked` coding is unsupported, a lone
    /// `Content-Length` sizes the body, and nothing at all means empty.
    pub(crate) fn for_request(
        method: &Method,
        _version: Version,
        map: &HeaderMap,
    ) -> Result<Decoder> {
        let te_present = headers::transfer_encoding_present(map);
        let cl_present = map.contains_key(http::header::CONTENT_LENGTH);

        if *method == Method::TRACE && (te_present || cl_present) {
            return Err(Error::new_body(BodyKind::IllegalRequestBody));
        }
        if te_present && cl_present {
            return Err(Error::new_body(BodyKind::ConflictingFraming));
        }
        if te_present {
            return if headers::transfer_encoding_is_chunked(map) {
                Ok(Decoder::chunked(headers::declares_trailers(map)))
            } else {
                Err(Error::new_body(BodyKind::UnsupportedTransferCoding))
            };
        }
        match headers::content_length_parse(map) {
            Ok(Some(len)) => Ok(Decoder::length(len)),
            Ok(None) => Ok(Decoder::length(0)),
            Err(()) => Err(Error::new_body(BodyKind::BadContentLength)),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        match self.kind {
            Kind::Length(0) => true,
            Kind::Length(_) => false,
            Kind::Chunked { ref phase, .. } => *phase == Phase::Done,
        }
    }

    /// Bytes left, when the framing knows it.
    pub(crate) fn remaining(&self) -> Option<u64> {
        match self.kind {
            Kind::Length(n) => Some(n),
            Kind::Chunked { .. } => None,
        }
    }

    /// Trailers received after a chunked body, when declared and present.
    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self.kind {
            Kind::Chunked {
                ref mut trailers, ..
            } => trailers.take(),
            _ => None,
        }
    }

    /// Decodes the next frame. An empty data frame means the body is done.
    pub(crate) async fn decode(&mut self, io: &mut Buffered) -> Result<Frame<Bytes>> {
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Frame::data(Bytes::new()));
                }
                let to_read = usize::try_from(*remaining).unwrap_or(usize::MAX);
                let buf = io.read_mem(to_read).await.map_err(Error::new_io)?;
                if buf.is_empty() {
                    return Err(Error::new_body(BodyKind::Eof));
                }
                *remaining -= buf.len() as u64;
                Ok(Frame::data(buf))
            }
            Kind::Chunked {
                ref mut phase,
                ref mut extensions_cnt,
                wants_trailers,
                ref mut trailers,
            } => loop {
                match *phase {
                    Phase::Size => {
                        let size = read_chunk_size(io, extensions_cnt).await?;
                        tracing::trace!("incoming chunk header: {0:#X} ({0} bytes)", size);
                        if size == 0 {
                            let parsed = read_trailers(io).await?;
                            *phase = Phase::Done;
                            match parsed {
                                Some(map) if wants_trailers => {
                                    *trailers = Some(map.clone());
                                    return Ok(Frame::trailers(map));
                                }
                                Some(_) => {
                                    tracing::debug!("discarding undeclared trailers");
                                    return Ok(Frame::data(Bytes::new()));
                                }
                                None => return Ok(Frame::data(Bytes::new())),
                            }
                        }
                        *phase = Phase::Data(size);
                    }
                    Phase::Data(remaining) => {
                        let to_read = usize::try_from(remaining).unwrap_or(usize::MAX);
                        let buf = io.read_mem(to_read).await.map_err(Error::new_io)?;
                        if buf.is_empty() {
                            return Err(Error::new_body(BodyKind::Eof));
                        }
                        let left = remaining - buf.len() as u64;
                        *phase = if left == 0 {
                            expect_crlf(io, "invalid chunk body CRLF").await?;
                            Phase::Size
                        } else {
                            Phase::Data(left)
                        };
                        return Ok(Frame::data(buf));
                    }
                    Phase::Done => return Ok(Frame::data(Bytes::new())),
                }
            },
        }
    }
}

async fn next_byte(io: &mut Buffered) -> Result<u8> {
    match io.read_byte().await.map_err(Error::new_io)? {
        Some(b) => Ok(b),
        None => Err(Error::new_body(BodyKind::Eof)),
    }
}

fn hex_digit(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u64),
        b'a'..=b'f' => Some((b + 10 - b'a') as u64),
        b'A'..=b'F' => Some((b + 10 - b'A') as u64),
        _ => None,
    }
}

/// Reads `SIZE [;ext] CRLF`, the size in hexadecimal.
async fn read_chunk_size(io: &mut Buffered, extensions_cnt: &mut u64) -> Result<u64> {
    const RADIX: u64 = 16;

    let first = next_byte(io).await?;
    let mut size = match hex_digit(first) {
        Some(d) => d,
        None => {
            return Err(Error::new_body(BodyKind::Chunk {
                byte: Some(first),
                msg: "invalid chunk size line: missing size digit",
            }));
        }
    };

    enum After {
        Lws,
        Extension,
    }

    let after = loop {
        let b = next_byte(io).await?;
        if let Some(d) = hex_digit(b) {
            size = size
                .checked_mul(RADIX)
                .and_then(|s| s.checked_add(d))
                .ok_or_else(|| {
                    Error::new_body(BodyKind::Chunk {
                        byte: None,
                        msg: "invalid chunk size: overflow",
                    })
                })?;
            continue;
        }
        match b {
            b'\t' | b' ' => break Some(After::Lws),
            b';' => break Some(After::Extension),
            b'\r' => break None,
            _ => {
                return Err(Error::new_body(BodyKind::Chunk {
                    byte: Some(b),
                    msg: "invalid chunk size digit",
                }));
            }
        }
    };

    let mut after = after;
    while let Some(state) = after {
        match state {
            // LWS may follow the size, but no more digits can come.
            After::Lws => loop {
                match next_byte(io).await? {
                    b'\t' | b' ' => continue,
                    b';' => {
                        after = Some(After::Extension);
                        break;
                    }
                    b'\r' => {
                        after = None;
                        break;
                    }
                    b => {
                        return Err(Error::new_body(BodyKind::Chunk {
                            byte: Some(b),
                            msg: "invalid chunk size linear white space",
                        }));
                    }
                }
            },
            // Extensions are ignored; they end at CRLF. A bare LF is
            // rejected to protect sloppy peers from themselves.
            After::Extension => loop {
                match next_byte(io).await? {
                    b'\r' => {
                        after = None;
                        break;
                    }
                    b'\n' => {
                        return Err(Error::new_body(BodyKind::Chunk {
                            byte: Some(b'\n'),
                            msg: "invalid chunk extension contains newline",
                        }));
                    }
                    _ => {
                        *extensions_cnt += 1;
                        if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                            return Err(Error::new_body(BodyKind::Chunk {
                                byte: None,
                                msg: "chunk extensions over limit",
                            }));
                        }
                    }
                }
            },
        }
    }

    match next_byte(io).await? {
        b'\n' => Ok(size),
        b => Err(Error::new_body(BodyKind::Chunk {
            byte: Some(b),
            msg: "invalid chunk size LF",
        })),
    }
}

async fn expect_crlf(io: &mut Buffered, msg: &'static str) -> Result<()> {
    let cr = next_byte(io).await?;
    if cr != b'\r' {
        return Err(Error::new_body(BodyKind::Chunk {
            byte: Some(cr),
            msg,
        }));
    }
    let lf = next_byte(io).await?;
    if lf != b'\n' {
        return Err(Error::new_body(BodyKind::Chunk {
            byte: Some(lf),
            msg,
        }));
    }
    Ok(())
}

/// Reads the optional trailer block after the last chunk, including the
/// final empty line.
async fn read_trailers(io: &mut Buffered) -> Result<Option<HeaderMap>> {
    let first = next_byte(io).await?;
    if first == b'\r' {
        let lf = next_byte(io).await?;
        if lf != b'\n' {
            return Err(Error::new_body(BodyKind::Trailer));
        }
        return Ok(None);
    }

    // 64 fits a single short trailer without reallocating
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(first);
    loop {
        let b = next_byte(io).await?;
        buf.put_u8(b);
        if buf.len() > TRAILER_LIMIT {
            return Err(Error::new_body(BodyKind::Chunk {
                byte: None,
                msg: "chunk trailers bytes over limit",
            }));
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    decode_trailers(&buf).map(Some)
}

fn decode_trailers(buf: &[u8]) -> Result<HeaderMap> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(buf, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            let mut map = HeaderMap::with_capacity(parsed.len());
            for header in parsed {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| Error::new_body(BodyKind::Trailer))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| Error::new_body(BodyKind::Trailer))?;
                map.append(name, value);
            }
            Ok(map)
        }
        Ok(httparse::Status::Partial) => Err(Error::new_body(BodyKind::Trailer)),
        Err(e) => Err(Error::new_body(BodyKind::Trailer).with(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind as ErrorKind;
    use tokio::io::AsyncWriteExt;

    async fn buffered(raw: &[u8]) -> Buffered {
        let (server, mut client) = tokio::io::duplex(raw.len() + 64);
        client.write_all(raw).await.unwrap();
        drop(client);
        Buffered::new(Box::new(server))
    }

    async fn collect(decoder: &mut Decoder, io: &mut Buffered) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let frame = decoder.decode(io).await.expect("decode");
            match frame.into_data() {
                Ok(data) => {
                    if data.is_empty() {
                        return out;
                    }
                    out.extend_from_slice(&data);
                }
                Err(_) => continue, // trailers
            }
        }
    }

    #[tokio::test]
    async fn sized_body_is_delivered_exactly() {
        let mut io = buffered(b"Hi, and some pipelined junk").await;
        let mut decoder = Decoder::length(2);
        assert_eq!(collect(&mut decoder, &mut io).await, b"Hi");
        assert!(decoder.is_eof());
        // the rest stays buffered for the next head
        assert_eq!(io.read_buf(), b", and some pipelined junk");
    }

    #[tokio::test]
    async fn sized_early_eof_errors() {
        let mut io = buffered(b"foo bar").await;
        let mut decoder = Decoder::length(10);
        let frame = decoder.decode(&mut io).await.unwrap();
        assert_eq!(frame.into_data().unwrap().len(), 7);
        let err = decoder.decode(&mut io).await.unwrap_err();
        assert!(err.is_incomplete_message(), "{:?}", err);
    }

    #[tokio::test]
    async fn chunked_decodes_and_concatenates() {
        let mut io = buffered(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n").await;
        let mut decoder = Decoder::chunked(false);
        assert_eq!(collect(&mut decoder, &mut io).await, b"foobar");
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn chunked_early_eof_errors() {
        let mut io = buffered(b"9\r\nfoo bar").await;
        let mut decoder = Decoder::chunked(false);
        let frame = decoder.decode(&mut io).await.unwrap();
        assert_eq!(frame.into_data().unwrap().len(), 7);
        let err = decoder.decode(&mut io).await.unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[tokio::test]
    async fn chunk_sizes_parse_as_hex() {
        for (raw, expect) in [
            (&b"1\r\nX\r\n0\r\n\r\n"[..], &b"X"[..]),
            (b"A\r\nabcdefghij\r\n0\r\n\r\n", b"abcdefghij"),
            (b"a\r\nabcdefghij\r\n0\r\n\r\n", b"abcdefghij"),
            (b"01\r\nY\r\n0\r\n\r\n", b"Y"),
            (b"1;ext name=value\r\nZ\r\n0\r\n\r\n", b"Z"),
            (b"1  ;  \r\nZ\r\n0\r\n\r\n", b"Z"),
        ] {
            let mut io = buffered(raw).await;
            let mut decoder = Decoder::chunked(false);
            assert_eq!(collect(&mut decoder, &mut io).await, expect, "{:?}", raw);
        }
    }

    #[tokio::test]
    async fn non_hex_size_byte_is_rejected() {
        for raw in [&b"X\r\n\r\n"[..], b"1X\r\n\r\n", b"-1\r\n\r\n", b"\r\n\r\n"] {
            let mut io = buffered(raw).await;
            let mut decoder = Decoder::chunked(false);
            let err = decoder.decode(&mut io).await.unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::Body(BodyKind::Chunk { .. })),
                "{:?}: {:?}",
                raw,
                err
            );
        }
    }

    #[tokio::test]
    async fn size_overflow_is_rejected() {
        let mut io = buffered(b"f0000000000000003\r\n\r\n").await;
        let mut decoder = Decoder::chunked(false);
        let err = decoder.decode(&mut io).await.unwrap_err();
        assert!(err.to_string().contains("overflow"), "{}", err);
    }

    #[tokio::test]
    async fn missing_zero_terminator_is_rejected() {
        let mut io = buffered(b"1\r\nZ\r\n\r\n\r\n").await;
        let mut decoder = Decoder::chunked(false);
        let frame = decoder.decode(&mut io).await.unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"Z");
        let err = decoder.decode(&mut io).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Body(BodyKind::Chunk { .. })));
    }

    #[tokio::test]
    async fn declared_trailers_are_surfaced() {
        let raw = b"3\r\nfoo\r\n0\r\nExpires: never\r\nX-Tail: 1\r\n\r\n";
        let mut io = buffered(raw).await;
        let mut decoder = Decoder::chunked(true);

        let data = decoder.decode(&mut io).await.unwrap();
        assert_eq!(&data.into_data().unwrap()[..], b"foo");

        let frame = decoder.decode(&mut io).await.unwrap();
        assert!(frame.is_trailers());
        let trailers = frame.into_trailers().unwrap();
        assert_eq!(trailers.get("expires").unwrap(), "never");
        assert_eq!(trailers.get("x-tail").unwrap(), "1");
        assert!(decoder.take_trailers().is_some());
    }

    #[tokio::test]
    async fn undeclared_trailers_are_discarded() {
        let raw = b"3\r\nfoo\r\n0\r\nX-Tail: 1\r\n\r\n";
        let mut io = buffered(raw).await;
        let mut decoder = Decoder::chunked(false);
        assert_eq!(collect(&mut decoder, &mut io).await, b"foo");
        assert!(decoder.take_trailers().is_none());
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn selection_rejects_conflicting_framing() {
        let mut map = HeaderMap::new();
        map.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        map.insert("content-length", HeaderValue::from_static("123"));
        let err = Decoder::for_request(&Method::GET, Version::HTTP_11, &map).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Content-Length and Transfer-Encoding are both present."
        );
    }

    #[tokio::test]
    async fn selection_rejects_unknown_codings() {
        let mut map = HeaderMap::new();
        map.insert("transfer-encoding", HeaderValue::from_static("gzip"));
        let err = Decoder::for_request(&Method::POST, Version::HTTP_11, &map).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::NOT_IMPLEMENTED));
    }

    #[tokio::test]
    async fn selection_rejects_trace_with_body() {
        for (name, value) in [("content-length", "1"), ("transfer-encoding", "chunked")] {
            let mut map = HeaderMap::new();
            map.insert(name, HeaderValue::from_static(value));
            let err = Decoder::for_request(&Method::TRACE, Version::HTTP_11, &map).unwrap_err();
            assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
        }
    }

    #[tokio::test]
    async fn decodes_across_split_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"3\r\nfo")
            .read(b"o\r\n3\r")
            .read(b"\nbar\r\n0\r\n\r\n")
            .build();
        let mut io = Buffered::new(Box::new(mock));
        let mut decoder = Decoder::chunked(false);
        assert_eq!(collect(&mut decoder, &mut io).await, b"foobar");
    }

    #[tokio::test]
    async fn chunk_encoding_round_trips_through_the_decoder() {
        use crate::proto::h1::encode::Encoder;

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut wire = BytesMut::new();
        let mut encoder = Encoder::chunked();
        for chunk in payload.chunks(4096) {
            encoder.encode(chunk, &mut wire).unwrap();
        }
        encoder.end(&mut wire).unwrap();

        let mut io = buffered(&wire).await;
        let mut decoder = Decoder::chunked(false);
        assert_eq!(collect(&mut decoder, &mut io).await, payload);
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn selection_without_framing_is_empty() {
        let decoder =
            Decoder::for_request(&Method::GET, Version::HTTP_11, &HeaderMap::new()).unwrap();
        assert!(decoder.is_eof());
    }
}
