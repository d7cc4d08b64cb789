//! Buffered duplex I/O for one connection.
//!
//! One `Buffered` exists per connection, owned behind [`SharedIo`]. The
//! exchange, the request-body handle and the scoped client channel all run
//! on the connection's worker task and serialize their access through it,
//! so the lock is never contended; it only expresses the shared ownership.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub(crate) type SharedIo = Arc<tokio::sync::Mutex<Buffered>>;

pub(crate) fn shared(io: Box<dyn IoStream>) -> SharedIo {
    Arc::new(tokio::sync::Mutex::new(Buffered::new(io)))
}

pub(crate) struct Buffered {
    io: Box<dyn IoStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_eof: bool,
    write_closed: bool,
}

impl Buffered {
    pub(crate) fn new(io: Box<dyn IoStream>) -> Buffered {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(0),
            write_buf: BytesMut::with_capacity(0),
            read_eof: false,
            write_closed: false,
        }
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Whether the peer has half-closed its write side.
    pub(crate) fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    /// Stops reading from the transport; later reads report end of stream.
    pub(crate) fn shutdown_read(&mut self) {
        self.read_eof = true;
        self.read_buf.clear();
    }

    pub(crate) fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Reads more bytes from the transport into the read buffer.
    ///
    /// Returns the number of bytes read; `0` announces end of stream, which
    /// is latched: every later call reports `0` without touching the
    /// transport.
    pub(crate) async fn read_more(&mut self) -> io::Result<usize> {
        if self.read_eof {
            return Ok(0);
        }
        if self.read_buf.capacity() - self.read_buf.len() < INIT_BUFFER_SIZE {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }
        let n = self.io.read_buf(&mut self.read_buf).await?;
        tracing::trace!("read {} bytes", n);
        if n == 0 {
            self.read_eof = true;
        }
        Ok(n)
    }

    /// Takes up to `len` buffered bytes, reading from the transport when
    /// the buffer is empty. An empty result means end of stream.
    pub(crate) async fn read_mem(&mut self, len: usize) -> io::Result<Bytes> {
        if self.read_buf.is_empty() {
            let n = self.read_more().await?;
            if n == 0 {
                return Ok(Bytes::new());
            }
        }
        let n = std::cmp::min(len, self.read_buf.len());
        Ok(self.read_buf.split_to(n).freeze())
    }

    /// Reads a single byte; `None` means end of stream.
    pub(crate) async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let b = self.read_mem(1).await?;
        Ok(b.first().copied())
    }

    /// Appends raw bytes to the write buffer.
    pub(crate) fn buffer_slice(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Appends a `Buf` to the write buffer.
    pub(crate) fn buffer<B: Buf>(&mut self, buf: B) {
        self.write_buf.put(buf);
    }

    pub(crate) fn write_buffered(&self) -> usize {
        self.write_buf.len()
    }

    /// Flushes the write buffer to the transport.
    ///
    /// A broken-pipe class failure latches the write half closed; no
    /// further write is attempted on this connection.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if self.write_closed {
            self.write_buf.clear();
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if !self.write_buf.is_empty() {
            let buf = self.write_buf.split();
            if let Err(e) = self.io.write_all(&buf).await {
                if is_broken_pipe(&e) {
                    tracing::debug!("write half closed by peer: {}", e);
                    self.write_closed = true;
                }
                return Err(e);
            }
            tracing::trace!("flushed {} bytes", buf.len());
        }
        match self.io.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_broken_pipe(&e) {
                    self.write_closed = true;
                }
                Err(e)
            }
        }
    }

    /// Signals half-close to the peer after flushing what is pending.
    pub(crate) async fn shutdown_write(&mut self) {
        if !self.write_closed {
            let _ = self.flush().await;
            let _ = self.io.shutdown().await;
            self.write_closed = true;
        }
    }
}

fn is_broken_pipe(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
