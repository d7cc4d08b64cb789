//! Request and response body types.

mod incoming;

pub use self::incoming::Incoming;
pub(crate) use self::incoming::DrainResult;

use std::error::Error as StdError;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::HeaderMap;
use http_body::{Body as HttpBody, Frame, SizeHint};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::User;
use crate::{Error, Result};

type BoxError = Box<dyn StdError + Send + Sync>;
type BoxStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, BoxError>> + Send>>;

const FILE_CHUNK: usize = 8192;

/// An outgoing response body.
///
/// A body is a byte buffer (known length), a file region (known length,
/// streamed), or an arbitrary stream (unknown length, chunk-encoded on the
/// wire). Optional trailers ride after the data when the response declares
/// them in a `Trailer` header.
pub struct Body {
    kind: Kind,
    trailers: Option<HeaderMap>,
}

enum Kind {
    Empty,
    Full(Bytes),
    File(FileBody),
    Stream(BoxStream),
}

struct FileBody {
    file: tokio::fs::File,
    remaining: u64,
    scratch: BytesMut,
}

impl Body {
    /// An empty body, `Content-Length: 0` on the wire.
    pub fn empty() -> Body {
        Body {
            kind: Kind::Empty,
            trailers: None,
        }
    }

    /// A body streamed out of an open file; `len` bytes are promised.
    pub fn file(file: tokio::fs::File, len: u64) -> Body {
        Body {
            kind: Kind::File(FileBody {
                file,
                remaining: len,
                scratch: BytesMut::new(),
            }),
            trailers: None,
        }
    }

    /// An unknown-length body; it is chunk-encoded on the wire.
    pub fn stream<S, D, E>(stream: S) -> Body
    where
        S: Stream<Item = std::result::Result<D, E>> + Send + 'static,
        D: Into<Bytes>,
        E: Into<BoxError>,
    {
        Body {
            kind: Kind::Stream(Box::pin(
                stream.map(|item| item.map(Into::into).map_err(Into::into)),
            )),
            trailers: None,
        }
    }

    /// Attaches trailers, sent after the data when the response declares
    /// their names in a `Trailer` header.
    pub fn with_trailers(mut self, trailers: HeaderMap) -> Body {
        self.trailers = Some(trailers);
        self
    }

    /// The exact body length, when the framing can know it upfront.
    pub(crate) fn exact_len(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty => Some(0),
            Kind::Full(ref bytes) => Some(bytes.len() as u64),
            Kind::File(ref f) => Some(f.remaining),
            Kind::Stream(_) => None,
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Error>>> {
        let this = self.get_mut();
        loop {
            match this.kind {
                Kind::Empty => {
                    return Poll::Ready(match this.trailers.take() {
                        Some(map) => Some(Ok(Frame::trailers(map))),
                        None => None,
                    });
                }
                Kind::Full(ref mut bytes) => {
                    let data = std::mem::take(bytes);
                    this.kind = Kind::Empty;
                    if data.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Kind::File(ref mut f) => {
                    if f.remaining == 0 {
                        this.kind = Kind::Empty;
                        continue;
                    }
                    let want = std::cmp::min(f.remaining, FILE_CHUNK as u64) as usize;
                    f.scratch.clear();
                    f.scratch.resize(want, 0);
                    let mut read_buf = ReadBuf::new(&mut f.scratch[..]);
                    match Pin::new(&mut f.file).poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            return Poll::Ready(Some(Err(Error::new_io(e))));
                        }
                        Poll::Ready(Ok(())) => {}
                    }
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Some(Err(Error::new_user(User::BodyWrite).with(
                            std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "file ended before the promised length",
                            ),
                        ))));
                    }
                    f.remaining -= n as u64;
                    let data = Bytes::copy_from_slice(&f.scratch[..n]);
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Kind::Stream(ref mut stream) => {
                    return match stream.as_mut().poll_next(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(Some(Ok(data))) => {
                            if data.is_empty() {
                                continue;
                            }
                            Poll::Ready(Some(Ok(Frame::data(data))))
                        }
                        Poll::Ready(Some(Err(e))) => {
                            Poll::Ready(Some(Err(Error::new_user(User::BodyWrite).with(e))))
                        }
                        Poll::Ready(None) => {
                            this.kind = Kind::Empty;
                            continue;
                        }
                    };
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.kind, Kind::Empty) && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.exact_len() {
            Some(len) => SizeHint::with_exact(len),
            None => SizeHint::default(),
        }
    }
}

/// Pulls the next frame out of an outgoing body.
pub(crate) async fn next_frame(body: &mut Body) -> Option<Result<Frame<Bytes>>> {
    futures_util::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Kind::Empty => "Empty",
            Kind::Full(_) => "Full",
            Kind::File(_) => "File",
            Kind::Stream(_) => "Stream",
        };
        f.debug_struct("Body").field("kind", &kind).finish()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            kind: Kind::Full(bytes),
            trailers: None,
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Bytes::from(vec).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Bytes::from_static(slice).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Bytes::from(s.into_bytes()).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Bytes::from_static(s.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(body: &mut Body) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(frame) = next_frame(body).await {
            if let Ok(data) = frame.unwrap().into_data() {
                out.extend_from_slice(&data);
            }
        }
        out
    }

    #[tokio::test]
    async fn full_yields_once() {
        let mut body = Body::from("hello");
        assert_eq!(body.exact_len(), Some(5));
        assert_eq!(collect(&mut body).await, b"hello");
        assert!(http_body::Body::is_end_stream(&body));
    }

    #[tokio::test]
    async fn empty_is_end_immediately() {
        let mut body = Body::empty();
        assert_eq!(body.exact_len(), Some(0));
        assert!(next_frame(&mut body).await.is_none());
    }

    #[tokio::test]
    async fn stream_is_unknown_length() {
        let chunks: Vec<std::result::Result<&'static str, std::convert::Infallible>> =
            vec![Ok("foo"), Ok("bar")];
        let mut body = Body::stream(futures_util::stream::iter(chunks));
        assert_eq!(body.exact_len(), None);
        assert_eq!(collect(&mut body).await, b"foobar");
    }

    #[tokio::test]
    async fn works_with_body_combinators() {
        use http_body_util::BodyExt;

        let body = Body::from("combine");
        let collected = body.collect().await.unwrap();
        assert_eq!(&collected.to_bytes()[..], b"combine");
    }

    #[tokio::test]
    async fn trailers_come_after_data() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", http::HeaderValue::from_static("abc"));
        let mut body = Body::from("data").with_trailers(trailers);

        let first = next_frame(&mut body).await.unwrap().unwrap();
        assert!(first.is_data());
        let second = next_frame(&mut body).await.unwrap().unwrap();
        assert!(second.is_trailers());
        assert!(next_frame(&mut body).await.is_none());
    }
}
