use std::io::{self, Read, Write};

use crate::replay::ReplayBuffer;

/// Stream wrapper that replays detection bytes in front of the inner
/// transport.
///
/// During detection the adapter reads up to the classification window from
/// the transport. Those bytes belong to the application (or to the TLS
/// engine, when the peer turned out to speak TLS), so the wrapper holds them
/// in a [`ReplayBuffer`] and serves them from there before any further
/// transport I/O. Concatenating the replayed bytes with the transport's
/// remaining stream reproduces exactly what the peer sent.
///
/// Writes are unaffected by detection and pass straight through.
///
/// # Examples
///
/// ```
/// use std::io::{Cursor, Read};
/// use portmux_transport::{ReplayBuffer, ReplayStream};
///
/// let replay = ReplayBuffer::preloaded(b"GET /").expect("fits the window");
/// let mut stream = ReplayStream::with_replay(Cursor::new(b" HTTP/1.1\r\n".to_vec()), replay);
///
/// let mut line = String::new();
/// stream.read_to_string(&mut line).expect("replay then inner bytes");
/// assert_eq!(line, "GET / HTTP/1.1\r\n");
/// ```
#[derive(Debug)]
pub struct ReplayStream<T> {
    inner: T,
    replay: ReplayBuffer,
}

impl<T> ReplayStream<T> {
    /// Wraps a transport with no bytes pending replay.
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            replay: ReplayBuffer::new(),
        }
    }

    /// Wraps a transport together with bytes already read from it.
    #[must_use]
    pub fn with_replay(inner: T, replay: ReplayBuffer) -> Self {
        Self { inner, replay }
    }

    /// Returns the number of bytes still pending replay.
    #[must_use]
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Reports whether any bytes are still pending replay.
    #[must_use]
    pub fn has_replay(&self) -> bool {
        !self.replay.is_empty()
    }

    /// Returns a shared reference to the inner transport.
    #[must_use]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Returns a mutable reference to the inner transport.
    ///
    /// Reading from the transport directly skips the replay buffer; callers
    /// that do so are responsible for the bytes it still holds.
    #[must_use]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Releases the wrapper, dropping any bytes still pending replay.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Decomposes the wrapper into the transport and the replay buffer.
    #[must_use]
    pub fn into_parts(self) -> (T, ReplayBuffer) {
        (self.inner, self.replay)
    }
}

impl<T: Read> Read for ReplayStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let copied = self.replay.copy_into(buf);
        if copied > 0 {
            return Ok(copied);
        }

        self.inner.read(buf)
    }
}

impl<T: Write> Write for ReplayStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(feature = "async")]
mod async_impls {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::ReplayStream;

    impl<T: AsyncRead + Unpin> AsyncRead for ReplayStream<T> {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();

            if this.replay.len() > 0 {
                let pending = this.replay.data();
                let to_copy = pending.len().min(buf.remaining());
                buf.put_slice(&pending[..to_copy]);
                this.replay.consume(to_copy);
                return Poll::Ready(Ok(()));
            }

            Pin::new(&mut this.inner).poll_read(cx, buf)
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for ReplayStream<T> {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }
}
