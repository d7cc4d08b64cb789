//! The request body handle.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::HeaderMap;

use crate::error::BodyKind;
use crate::proto::h1::decode::Decoder;
use crate::proto::h1::exchange::ExchangeShared;
use crate::proto::h1::io::SharedIo;
use crate::{Error, Result};

/// An incoming request body.
///
/// The body is lazy, finite and once-consumable: chunks are pulled off the
/// connection on demand, and what the handler does not consume is drained
/// by the exchange afterwards. Reading past the end keeps returning `None`.
pub struct Incoming {
    inner: Arc<Inner>,
}

struct Inner {
    io: SharedIo,
    st: tokio::sync::Mutex<BodyState>,
    shared: Arc<ExchangeShared>,
    cap: usize,
    known_len: Option<u64>,
}

struct BodyState {
    decoder: Decoder,
    done: bool,
}

#[derive(Debug, PartialEq)]
pub(crate) enum DrainResult {
    /// The whole body was read off the wire.
    Done,
    /// The body was read, but its trailer block was malformed; the read
    /// half has been shut down.
    TrailerError,
    /// More than the configured cap was pending; the body stays unread.
    Overflow,
    /// The transport failed mid-body.
    Failed,
}

impl Incoming {
    /// Returns two handles over the same body: one for the handler, one
    /// kept by the exchange for draining.
    pub(crate) fn pair(
        io: SharedIo,
        decoder: Decoder,
        shared: Arc<ExchangeShared>,
        cap: usize,
    ) -> (Incoming, Incoming) {
        let known_len = decoder.remaining();
        let inner = Arc::new(Inner {
            io,
            st: tokio::sync::Mutex::new(BodyState {
                decoder,
                done: false,
            }),
            shared,
            cap,
            known_len,
        });
        (
            Incoming {
                inner: Arc::clone(&inner),
            },
            Incoming { inner },
        )
    }

    /// The declared body length; `None` for chunked bodies.
    pub fn known_length(&self) -> Option<u64> {
        self.inner.known_len
    }

    /// Pulls the next chunk of body data. `None` means the body is done.
    ///
    /// The first pull emits a deferred `100 Continue` when the request
    /// expected one and the configuration did not send it eagerly.
    pub async fn data(&mut self) -> Option<Result<Bytes>> {
        self.maybe_send_continue().await;

        let mut st = self.inner.st.lock().await;
        if st.done {
            return None;
        }
        let mut io = self.inner.io.lock().await;
        match st.decoder.decode(&mut io).await {
            Ok(frame) => match frame.into_data() {
                Ok(data) => {
                    if data.is_empty() {
                        st.done = true;
                        None
                    } else {
                        Some(Ok(data))
                    }
                }
                // trailers terminate the data
                Err(_trailers) => {
                    st.done = true;
                    None
                }
            },
            Err(e) => {
                st.done = true;
                io.shutdown_read();
                Some(Err(e))
            }
        }
    }

    /// Materializes the remaining body into one buffer.
    ///
    /// Growing past the configured `max_request_body_buffer_size` fails
    /// with a `413`-mapped error.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut acc = BytesMut::new();
        while let Some(chunk) = self.data().await {
            let chunk = chunk?;
            if acc.len() + chunk.len() > self.inner.cap {
                return Err(Error::new_body(BodyKind::TooLarge));
            }
            acc.extend_from_slice(&chunk);
        }
        Ok(acc.freeze())
    }

    /// Trailers received after a chunked body.
    ///
    /// Present only once the body is fully consumed, and only when the
    /// request declared them via a `Trailer` header.
    pub async fn trailers(&self) -> Option<HeaderMap> {
        let mut st = self.inner.st.lock().await;
        st.decoder.take_trailers()
    }

    pub(crate) async fn is_consumed(&self) -> bool {
        let st = self.inner.st.lock().await;
        st.done || st.decoder.is_eof()
    }

    /// Silently reads the rest of the body off the wire, up to `cap` bytes.
    pub(crate) async fn drain(&self, cap: usize) -> DrainResult {
        let mut st = self.inner.st.lock().await;
        if st.done || st.decoder.is_eof() {
            return DrainResult::Done;
        }
        let mut io = self.inner.io.lock().await;
        let mut count: usize = 0;
        loop {
            match st.decoder.decode(&mut io).await {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => {
                        if data.is_empty() {
                            st.done = true;
                            return DrainResult::Done;
                        }
                        count += data.len();
                        if count > cap {
                            tracing::debug!(
                                "abandoned request body larger than {} bytes; not draining",
                                cap
                            );
                            return DrainResult::Overflow;
                        }
                    }
                    Err(_trailers) => {}
                },
                Err(e) => {
                    st.done = true;
                    io.shutdown_read();
                    return if matches!(e.kind(), crate::error::Kind::Body(BodyKind::Trailer)) {
                        tracing::debug!("trailer parse failed while draining: {}", e);
                        DrainResult::TrailerError
                    } else {
                        tracing::debug!("drain failed: {}", e);
                        DrainResult::Failed
                    };
                }
            }
        }
    }

    async fn maybe_send_continue(&self) {
        use std::sync::atomic::Ordering;

        let shared = &self.inner.shared;
        if shared.continue_pending.swap(false, Ordering::SeqCst)
            && !shared.continue_sent.swap(true, Ordering::SeqCst)
        {
            tracing::debug!("sending deferred 100 Continue before first body read");
            let mut io = self.inner.io.lock().await;
            io.buffer_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
            // a failure here surfaces on the next read anyway
            let _ = io.flush().await;
        }
    }
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("known_length", &self.inner.known_len)
            .finish()
    }
}
