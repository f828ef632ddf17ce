//! Async variant of the multiplexing adapter.
//!
//! Mirrors the blocking [`MultiStream`](crate::MultiStream) on tokio's
//! [`AsyncRead`]/[`AsyncWrite`] traits: the same policy, the same
//! read-into-replay detection, the same uniform surface afterwards, with the
//! TLS engine supplied by `tokio-rustls`. Cancellation is explicit here: a
//! [`CancellationToken`] aborts an in-flight handshake with
//! [`HandshakeError::Cancelled`] without ever exposing a partially ready
//! stream.

use core::fmt;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use portmux_protocol::{
    HandshakeAction, HandshakeRole, StreamOptions, StreamPrologue, StreamPrologueDetector,
    detected_handshake_action, initial_handshake_action,
};

use crate::error::{HandshakeError, UsageError};
use crate::replay::ReplayBuffer;
use crate::stream::ReplayStream;
use crate::tls::TlsContext;

enum AsyncActiveStream<T> {
    Plaintext(ReplayStream<T>),
    Tls(Box<tokio_rustls::TlsStream<ReplayStream<T>>>),
}

enum AsyncState<T> {
    Fresh(T),
    Ready {
        active: AsyncActiveStream<T>,
        shut_down: bool,
    },
    // Holds the transport together with any bytes detection had already
    // consumed from it, so recovery loses nothing. None only when the TLS
    // engine consumed the stream.
    Failed(Option<ReplayStream<T>>),
    Closed,
}

/// Protocol-multiplexing stream adapter over tokio I/O.
///
/// Owns one transport and decides, on [`handshake`](Self::handshake), whether
/// the peer speaks cleartext, TLS, or a (refused) PROXY v1 preamble. After a
/// successful handshake the adapter is itself an [`AsyncRead`] +
/// [`AsyncWrite`], with detection bytes replayed ahead of fresh transport
/// reads.
///
/// Operations take `&mut self` and are awaited to completion, so a stream
/// never has more than one operation in flight and completions are observed
/// in submission order.
pub struct AsyncMultiStream<T> {
    options: StreamOptions,
    context: TlsContext,
    state: AsyncState<T>,
    role: Option<HandshakeRole>,
    detected: Option<StreamPrologue>,
    cancellation: CancellationToken,
}

impl<T> AsyncMultiStream<T> {
    /// Wraps a transport that has not exchanged any bytes yet.
    #[must_use]
    pub fn new(transport: T, options: StreamOptions, context: TlsContext) -> Self {
        Self {
            options,
            context,
            state: AsyncState::Fresh(transport),
            role: None,
            detected: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Returns the options the stream was constructed with.
    #[must_use]
    pub const fn options(&self) -> StreamOptions {
        self.options
    }

    /// Returns the role passed to the handshake, once one ran.
    #[must_use]
    pub const fn role(&self) -> Option<HandshakeRole> {
        self.role
    }

    /// Returns the classification produced by detection, when the handshake
    /// took the detect path.
    #[must_use]
    pub const fn detected_prologue(&self) -> Option<StreamPrologue> {
        self.detected
    }

    /// Reports whether a handshake completed successfully.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, AsyncState::Ready { .. })
    }

    /// Reports whether the active stream is TLS-wrapped.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(
            self.state,
            AsyncState::Ready {
                active: AsyncActiveStream::Tls(_),
                ..
            }
        )
    }

    /// Reports whether the handshake failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, AsyncState::Failed(_))
    }

    /// Reports whether [`shutdown`](Self::shutdown) already ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        matches!(
            self.state,
            AsyncState::Ready {
                shut_down: true,
                ..
            }
        )
    }

    /// Returns a token that aborts this stream's handshake when cancelled.
    ///
    /// The token may be cloned into another task; cancelling it there has
    /// the same effect as [`cancel`](Self::cancel) here.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Requests cancellation of the in-flight handshake.
    ///
    /// The suspended operation completes with [`HandshakeError::Cancelled`];
    /// no partially ready state is exposed. Reads and writes issued after a
    /// successful handshake are cancelled the tokio way, by dropping their
    /// futures.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Consumes the stream and returns the replaying transport, when any
    /// state still holds it.
    ///
    /// After a failed handshake this recovers the connection together with
    /// any bytes detection had already consumed: reading the returned
    /// [`ReplayStream`] yields the peer's byte stream exactly as it was
    /// sent. `None` after [`close`](Self::close) and after a TLS engine
    /// failure (the engine consumes the stream it was handed).
    #[must_use]
    pub fn into_stream(self) -> Option<ReplayStream<T>> {
        match self.state {
            AsyncState::Fresh(transport) => Some(ReplayStream::new(transport)),
            AsyncState::Ready { active, .. } => Some(match active {
                AsyncActiveStream::Plaintext(stream) => stream,
                AsyncActiveStream::Tls(stream) => match *stream {
                    tokio_rustls::TlsStream::Client(tls) => tls.into_inner().0,
                    tokio_rustls::TlsStream::Server(tls) => tls.into_inner().0,
                },
            }),
            AsyncState::Failed(stream) => stream,
            AsyncState::Closed => None,
        }
    }

    /// Closes the stream by dropping the transport it owns.
    pub fn close(&mut self) {
        self.state = AsyncState::Closed;
    }

    fn state_usage_error(&self) -> UsageError {
        match self.state {
            AsyncState::Fresh(_) => UsageError::NotHandshaken,
            AsyncState::Ready { .. } => UsageError::AlreadyHandshaken,
            AsyncState::Failed(_) => UsageError::HandshakeFailed,
            AsyncState::Closed => UsageError::Closed,
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncMultiStream<T> {
    /// Negotiates the stream's disposition.
    ///
    /// Equivalent to [`handshake_buffered`](Self::handshake_buffered) with no
    /// preloaded bytes.
    ///
    /// # Errors
    ///
    /// See [`HandshakeError`]; failure is terminal for the stream.
    pub async fn handshake(&mut self, role: HandshakeRole) -> Result<(), HandshakeError> {
        self.handshake_buffered(role, &[]).await
    }

    /// Negotiates the stream's disposition, seeding it with bytes the caller
    /// already read from the transport.
    ///
    /// The plaintext path refuses a non-empty preload; the TLS and detect
    /// paths accept up to the detection window, seeded through the replay
    /// stream so the engine (or the application) sees them first.
    ///
    /// # Errors
    ///
    /// See [`HandshakeError`]; failure is terminal for the stream.
    pub async fn handshake_buffered(
        &mut self,
        role: HandshakeRole,
        preloaded: &[u8],
    ) -> Result<(), HandshakeError> {
        let transport = match mem::replace(&mut self.state, AsyncState::Closed) {
            AsyncState::Fresh(transport) => transport,
            other => {
                self.state = other;
                return Err(HandshakeError::InvalidUsage(self.state_usage_error()));
            }
        };

        self.role = Some(role);

        match self.drive_handshake(role, preloaded, transport).await {
            Ok(active) => {
                debug!(
                    role = role.as_str(),
                    tls = matches!(&active, AsyncActiveStream::Tls(_)),
                    "handshake complete"
                );
                self.state = AsyncState::Ready {
                    active,
                    shut_down: false,
                };
                Ok(())
            }
            Err((error, stream)) => {
                debug!(role = role.as_str(), error = %error, "handshake failed");
                self.state = AsyncState::Failed(stream);
                Err(error)
            }
        }
    }

    async fn drive_handshake(
        &mut self,
        role: HandshakeRole,
        preloaded: &[u8],
        transport: T,
    ) -> Result<AsyncActiveStream<T>, (HandshakeError, Option<ReplayStream<T>>)> {
        let action = initial_handshake_action(role, self.options);
        trace!(role = role.as_str(), action = action.as_str(), "initial policy decision");

        match action {
            HandshakeAction::Plaintext => {
                if !preloaded.is_empty() {
                    return Err((
                        HandshakeError::InvalidUsage(UsageError::PreloadNotEmpty),
                        Some(ReplayStream::new(transport)),
                    ));
                }
                Ok(AsyncActiveStream::Plaintext(ReplayStream::new(transport)))
            }

            HandshakeAction::Tls => {
                let replay = match ReplayBuffer::preloaded(preloaded) {
                    Ok(replay) => replay,
                    Err(_) => {
                        return Err((
                            HandshakeError::InvalidUsage(UsageError::PreloadTooLarge),
                            Some(ReplayStream::new(transport)),
                        ));
                    }
                };
                self.tls_handshake(role, ReplayStream::with_replay(transport, replay))
                    .await
            }

            HandshakeAction::Detect => {
                let mut replay = ReplayBuffer::new();
                if replay.preload(preloaded).is_err() {
                    return Err((
                        HandshakeError::InvalidUsage(UsageError::PreloadTooLarge),
                        Some(ReplayStream::new(transport)),
                    ));
                }

                let mut transport = transport;
                let cancellation = self.cancellation.clone();
                let prologue =
                    match sniff(&mut transport, &mut replay, &cancellation).await {
                        Ok(prologue) => prologue,
                        Err(error) => {
                            return Err((
                                error,
                                Some(ReplayStream::with_replay(transport, replay)),
                            ));
                        }
                    };
                self.detected = Some(prologue);

                let action = detected_handshake_action(self.options, prologue);
                debug!(
                    prologue = prologue.as_str(),
                    action = action.as_str(),
                    buffered = replay.len(),
                    "detected connection preamble"
                );

                match action {
                    HandshakeAction::Plaintext => Ok(AsyncActiveStream::Plaintext(
                        ReplayStream::with_replay(transport, replay),
                    )),
                    HandshakeAction::Tls => {
                        self.tls_handshake(role, ReplayStream::with_replay(transport, replay))
                            .await
                    }
                    HandshakeAction::Reject(rejection) => Err((
                        HandshakeError::PolicyRejected(rejection),
                        Some(ReplayStream::with_replay(transport, replay)),
                    )),
                    // detected_handshake_action never asks for detection.
                    HandshakeAction::Detect => Err((
                        HandshakeError::NeedMoreData,
                        Some(ReplayStream::with_replay(transport, replay)),
                    )),
                }
            }

            // initial_handshake_action never rejects.
            HandshakeAction::Reject(rejection) => Err((
                HandshakeError::PolicyRejected(rejection),
                Some(ReplayStream::new(transport)),
            )),
        }
    }

    async fn tls_handshake(
        &mut self,
        role: HandshakeRole,
        io: ReplayStream<T>,
    ) -> Result<AsyncActiveStream<T>, (HandshakeError, Option<ReplayStream<T>>)> {
        let cancellation = self.cancellation.clone();

        let outcome = match role {
            HandshakeRole::Server => {
                let config = match self.context.server_config() {
                    Some(config) => Arc::clone(config),
                    None => {
                        return Err((
                            HandshakeError::InvalidUsage(UsageError::ServerTlsConfigMissing),
                            Some(io),
                        ));
                    }
                };
                let acceptor = TlsAcceptor::from(config);
                tokio::select! {
                    () = cancellation.cancelled() => Err(HandshakeError::Cancelled),
                    accepted = acceptor.accept(io) => accepted
                        .map(tokio_rustls::TlsStream::from)
                        .map_err(classify_tls_failure),
                }
            }
            HandshakeRole::Client => {
                let (config, server_name) = match self.context.client_config() {
                    Some((config, server_name)) => (Arc::clone(config), server_name.clone()),
                    None => {
                        return Err((
                            HandshakeError::InvalidUsage(UsageError::ClientTlsConfigMissing),
                            Some(io),
                        ));
                    }
                };
                let connector = TlsConnector::from(config);
                tokio::select! {
                    () = cancellation.cancelled() => Err(HandshakeError::Cancelled),
                    connected = connector.connect(server_name, io) => connected
                        .map(tokio_rustls::TlsStream::from)
                        .map_err(classify_tls_failure),
                }
            }
        };

        match outcome {
            Ok(stream) => Ok(AsyncActiveStream::Tls(Box::new(stream))),
            // The engine owned the stream when it failed or was cancelled,
            // so the transport cannot be recovered on this path.
            Err(error) => Err((error, None)),
        }
    }

    /// Shuts the stream down.
    ///
    /// TLS streams run the close_notify exchange; plaintext streams shut the
    /// transport's write half down. A second call is a no-op that reports
    /// success without touching the transport.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::InvalidUsage`] outside the ready state;
    /// [`HandshakeError::Transport`] when the teardown I/O fails.
    pub async fn shutdown(&mut self) -> Result<(), HandshakeError> {
        match &mut self.state {
            AsyncState::Ready { active, shut_down } => {
                if *shut_down {
                    return Ok(());
                }

                match active {
                    AsyncActiveStream::Plaintext(stream) => {
                        stream.shutdown().await.map_err(HandshakeError::Transport)?;
                    }
                    AsyncActiveStream::Tls(stream) => {
                        stream.shutdown().await.map_err(HandshakeError::Transport)?;
                    }
                }

                *shut_down = true;
                Ok(())
            }
            _ => Err(HandshakeError::InvalidUsage(self.state_usage_error())),
        }
    }
}

/// Reads the classification window into the replay buffer.
///
/// The async twin of the blocking sniff loop: read, never peek, with every
/// byte retained for replay. Suspends on the transport read and on the
/// cancellation token, whichever resolves first.
async fn sniff<T: AsyncRead + Unpin>(
    transport: &mut T,
    replay: &mut ReplayBuffer,
    cancellation: &CancellationToken,
) -> Result<StreamPrologue, HandshakeError> {
    let mut detector = StreamPrologueDetector::new();
    let mut decision = detector.observe(replay.data());

    while !decision.is_decided() {
        let missing = detector.missing();
        if missing == 0 {
            return Err(HandshakeError::NeedMoreData);
        }

        let space = replay.prepare(missing);
        if space.is_empty() {
            return Err(HandshakeError::NeedMoreData);
        }

        let read = tokio::select! {
            () = cancellation.cancelled() => return Err(HandshakeError::Cancelled),
            result = transport.read(space) => result.map_err(HandshakeError::Transport)?,
        };
        if read == 0 {
            return Err(HandshakeError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the preamble was classified",
            )));
        }

        let committed = replay.len();
        replay.commit(read);
        decision = detector.observe(&replay.data()[committed..]);
    }

    trace!(
        prologue = decision.as_str(),
        window = replay.len(),
        "classified preamble"
    );
    Ok(decision)
}

/// Splits a tokio-rustls handshake failure into TLS and transport causes.
fn classify_tls_failure(error: io::Error) -> HandshakeError {
    let kind = error.kind();
    match error.into_inner() {
        Some(inner) => match inner.downcast::<rustls::Error>() {
            Ok(tls) => HandshakeError::Tls(*tls),
            Err(other) => HandshakeError::Transport(io::Error::new(kind, other)),
        },
        None => HandshakeError::Transport(io::Error::from(kind)),
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncRead for AsyncMultiStream<T> {
    /// Reads application bytes from the active stream, replayed detection
    /// bytes first.
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            AsyncState::Ready { active, .. } => match active {
                AsyncActiveStream::Plaintext(stream) => Pin::new(stream).poll_read(cx, buf),
                AsyncActiveStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            },
            _ => Poll::Ready(Err(
                HandshakeError::InvalidUsage(this.state_usage_error()).into()
            )),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for AsyncMultiStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.state {
            AsyncState::Ready { active, .. } => match active {
                AsyncActiveStream::Plaintext(stream) => Pin::new(stream).poll_write(cx, buf),
                AsyncActiveStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            },
            _ => Poll::Ready(Err(
                HandshakeError::InvalidUsage(this.state_usage_error()).into()
            )),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            AsyncState::Ready { active, .. } => match active {
                AsyncActiveStream::Plaintext(stream) => Pin::new(stream).poll_flush(cx),
                AsyncActiveStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            },
            _ => Poll::Ready(Err(
                HandshakeError::InvalidUsage(this.state_usage_error()).into()
            )),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            AsyncState::Ready { active, .. } => match active {
                AsyncActiveStream::Plaintext(stream) => Pin::new(stream).poll_shutdown(cx),
                AsyncActiveStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            },
            _ => Poll::Ready(Err(
                HandshakeError::InvalidUsage(this.state_usage_error()).into()
            )),
        }
    }
}

impl<T> fmt::Debug for AsyncMultiStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            AsyncState::Fresh(_) => "fresh",
            AsyncState::Ready {
                active: AsyncActiveStream::Plaintext(_),
                shut_down: false,
            } => "ready-plaintext",
            AsyncState::Ready {
                active: AsyncActiveStream::Tls(_),
                shut_down: false,
            } => "ready-tls",
            AsyncState::Ready { shut_down: true, .. } => "shut-down",
            AsyncState::Failed(_) => "failed",
            AsyncState::Closed => "closed",
        };

        f.debug_struct("AsyncMultiStream")
            .field("state", &state)
            .field("role", &self.role)
            .field("detected", &self.detected)
            .field("options", &self.options)
            .finish()
    }
}
