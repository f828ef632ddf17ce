use core::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::Shutdown;

use tracing::{debug, trace};

use portmux_protocol::{
    HandshakeAction, HandshakeRole, StreamOptions, StreamPrologue, StreamPrologueDetector,
    detected_handshake_action, initial_handshake_action,
};

use crate::error::{HandshakeError, UsageError};
use crate::replay::ReplayBuffer;
use crate::stream::ReplayStream;
use crate::tls::{TlsContext, TlsSession};
use crate::transport::Transport;

/// The stream selected by a completed handshake.
///
/// Exactly one variant is ever constructed per connection; the choice is
/// fixed when the handshake resolves and never changes afterwards.
enum ActiveStream<T> {
    Plaintext(ReplayStream<T>),
    Tls(TlsSession<T>),
}

enum StreamState<T> {
    Fresh(T),
    Ready {
        active: ActiveStream<T>,
        shut_down: bool,
    },
    // Holds the transport together with any bytes detection had already
    // consumed from it, so recovery loses nothing. None only when the TLS
    // engine consumed the stream.
    Failed(Option<ReplayStream<T>>),
    Closed,
}

/// Protocol-multiplexing stream adapter.
///
/// A `MultiStream` owns one accepted (or dialed) transport and, on
/// [`handshake`](Self::handshake), decides how the peer wants to talk:
/// straight cleartext, TLS, or a HAProxy PROXY v1 preamble (detected, then
/// refused). Detection reads at most the five-byte classification window and
/// retains every byte for replay, so the stream delivered to the application
/// (or to the TLS engine) is byte-for-byte what the peer sent. After the
/// handshake the adapter exposes one uniform [`Read`]/[`Write`]/
/// [`shutdown`](Self::shutdown) surface regardless of which path was taken.
///
/// A stream performs at most one handshake. Failure is terminal but does not
/// close the transport: the caller chooses between [`close`](Self::close)
/// and recovering the connection via [`into_stream`](Self::into_stream).
///
/// Instances are single-owner and operations take `&mut self`, so at most
/// one operation is ever in flight per stream and results are observed in
/// call order.
///
/// # Examples
///
/// ```no_run
/// use std::io::Read;
/// use std::net::TcpListener;
/// use portmux_protocol::{HandshakeRole, StreamOptions};
/// use portmux_transport::{MultiStream, TlsContext};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("127.0.0.1:0")?;
/// let (socket, _peer) = listener.accept()?;
///
/// let mut stream = MultiStream::new(socket, StreamOptions::permissive(), TlsContext::none());
/// stream.handshake(HandshakeRole::Server)?;
///
/// let mut request = [0u8; 512];
/// let received = stream.read(&mut request)?;
/// # let _ = received;
/// # Ok(())
/// # }
/// ```
pub struct MultiStream<T> {
    options: StreamOptions,
    context: TlsContext,
    state: StreamState<T>,
    role: Option<HandshakeRole>,
    detected: Option<StreamPrologue>,
    cancelled: bool,
}

impl<T> MultiStream<T> {
    /// Wraps a transport that has not exchanged any bytes yet.
    #[must_use]
    pub fn new(transport: T, options: StreamOptions, context: TlsContext) -> Self {
        Self {
            options,
            context,
            state: StreamState::Fresh(transport),
            role: None,
            detected: None,
            cancelled: false,
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
        matches!(self.state, StreamState::Ready { .. })
    }

    /// Reports whether the active stream is TLS-wrapped.
    ///
    /// `false` both for plaintext streams and before the handshake resolved.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(
            self.state,
            StreamState::Ready {
                active: ActiveStream::Tls(_),
                ..
            }
        )
    }

    /// Reports whether the handshake failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, StreamState::Failed(_))
    }

    /// Reports whether [`shutdown`](Self::shutdown) already ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        matches!(
            self.state,
            StreamState::Ready {
                shut_down: true,
                ..
            }
        )
    }

    /// Returns a shared reference to the transport, in the states that still
    /// own it directly or through a wrapper.
    #[must_use]
    pub fn transport(&self) -> Option<&T> {
        match &self.state {
            StreamState::Fresh(transport) => Some(transport),
            StreamState::Ready { active, .. } => Some(match active {
                ActiveStream::Plaintext(stream) => stream.get_ref(),
                ActiveStream::Tls(session) => session.get_ref().get_ref(),
            }),
            StreamState::Failed(stream) => stream.as_ref().map(ReplayStream::get_ref),
            StreamState::Closed => None,
        }
    }

    /// Returns a mutable reference to the transport.
    ///
    /// Direct I/O through this reference bypasses the replay buffer and, for
    /// TLS streams, the record layer; it exists for socket metadata and
    /// options, not data transfer.
    #[must_use]
    pub fn transport_mut(&mut self) -> Option<&mut T> {
        match &mut self.state {
            StreamState::Fresh(transport) => Some(transport),
            StreamState::Ready { active, .. } => Some(match active {
                ActiveStream::Plaintext(stream) => stream.get_mut(),
                ActiveStream::Tls(session) => session.get_mut().get_mut(),
            }),
            StreamState::Failed(stream) => stream.as_mut().map(ReplayStream::get_mut),
            StreamState::Closed => None,
        }
    }

    /// Consumes the stream and returns the replaying transport, when any
    /// state still holds it.
    ///
    /// After a failed handshake this recovers the connection the adapter
    /// deliberately left open, together with any bytes detection had already
    /// consumed: reading the returned [`ReplayStream`] yields the peer's
    /// byte stream exactly as it was sent. `None` after
    /// [`close`](Self::close) and after a TLS engine failure that consumed
    /// the transport.
    #[must_use]
    pub fn into_stream(self) -> Option<ReplayStream<T>> {
        match self.state {
            StreamState::Fresh(transport) => Some(ReplayStream::new(transport)),
            StreamState::Ready { active, .. } => Some(match active {
                ActiveStream::Plaintext(stream) => stream,
                ActiveStream::Tls(session) => session.into_inner(),
            }),
            StreamState::Failed(stream) => stream,
            StreamState::Closed => None,
        }
    }

    /// Closes the stream by dropping the transport it owns.
    ///
    /// Valid in every state, including after failure; further operations
    /// report the stream as closed.
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    fn state_usage_error(&self) -> UsageError {
        match self.state {
            StreamState::Fresh(_) => UsageError::NotHandshaken,
            StreamState::Ready { .. } => UsageError::AlreadyHandshaken,
            StreamState::Failed(_) => UsageError::HandshakeFailed,
            StreamState::Closed => UsageError::Closed,
        }
    }
}

impl<T: Transport> MultiStream<T> {
    /// Negotiates the stream's disposition with blocking transport I/O.
    ///
    /// Equivalent to [`handshake_buffered`](Self::handshake_buffered) with no
    /// preloaded bytes.
    ///
    /// # Errors
    ///
    /// See [`HandshakeError`]; any failure leaves the stream failed and the
    /// transport open.
    pub fn handshake(&mut self, role: HandshakeRole) -> Result<(), HandshakeError> {
        self.handshake_buffered(role, &[])
    }

    /// Negotiates the stream's disposition, seeding it with bytes the caller
    /// already read from the transport.
    ///
    /// The plaintext path refuses a non-empty preload: there is no replay
    /// channel on a path that never reads ahead. The TLS path forwards the
    /// bytes to the engine as initial handshake data. The detect path
    /// installs them into the replay window (so they are classified and
    /// later replayed) and only then reads more from the transport.
    ///
    /// # Errors
    ///
    /// See [`HandshakeError`]; any failure leaves the stream failed and the
    /// transport open.
    pub fn handshake_buffered(
        &mut self,
        role: HandshakeRole,
        preloaded: &[u8],
    ) -> Result<(), HandshakeError> {
        let transport = match mem::replace(&mut self.state, StreamState::Closed) {
            StreamState::Fresh(transport) => transport,
            other => {
                self.state = other;
                return Err(HandshakeError::InvalidUsage(self.state_usage_error()));
            }
        };

        self.role = Some(role);

        match self.drive_handshake(role, preloaded, transport) {
            Ok(active) => {
                debug!(
                    role = role.as_str(),
                    tls = matches!(&active, ActiveStream::Tls(_)),
                    "handshake complete"
                );
                self.state = StreamState::Ready {
                    active,
                    shut_down: false,
                };
                Ok(())
            }
            Err((error, stream)) => {
                debug!(role = role.as_str(), error = %error, "handshake failed");
                self.state = StreamState::Failed(stream);
                Err(error)
            }
        }
    }

    fn drive_handshake(
        &mut self,
        role: HandshakeRole,
        preloaded: &[u8],
        transport: T,
    ) -> Result<ActiveStream<T>, (HandshakeError, Option<ReplayStream<T>>)> {
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
                Ok(ActiveStream::Plaintext(ReplayStream::new(transport)))
            }

            HandshakeAction::Tls => {
                self.tls_handshake(role, preloaded, ReplayStream::new(transport))
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
                let prologue = match self.sniff(&mut transport, &mut replay) {
                    Ok(prologue) => prologue,
                    Err(error) => {
                        return Err((error, Some(ReplayStream::with_replay(transport, replay))));
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
                    HandshakeAction::Plaintext => Ok(ActiveStream::Plaintext(
                        ReplayStream::with_replay(transport, replay),
                    )),
                    HandshakeAction::Tls => {
                        self.tls_handshake(role, &[], ReplayStream::with_replay(transport, replay))
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

    /// Reads the classification window into the replay buffer.
    ///
    /// Bytes are read, never peeked: everything consumed here stays in the
    /// replay buffer for the application (or the TLS engine) to re-read, so
    /// no byte observed during detection is lost. EOF before a decision is a
    /// transport error.
    fn sniff(
        &mut self,
        transport: &mut T,
        replay: &mut ReplayBuffer,
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

            let read = match transport.read(space) {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.transport_error(err)),
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

    fn tls_handshake(
        &mut self,
        role: HandshakeRole,
        initial: &[u8],
        io: ReplayStream<T>,
    ) -> Result<ActiveStream<T>, (HandshakeError, Option<ReplayStream<T>>)> {
        let conn = match role {
            HandshakeRole::Server => self.context.new_server_connection().map(Into::into),
            HandshakeRole::Client => self.context.new_client_connection().map(Into::into),
        };

        let conn = match conn {
            Ok(conn) => conn,
            Err(error) => return Err((error, Some(io))),
        };

        let mut session = TlsSession::new(conn, io);
        match session.handshake(initial) {
            Ok(()) => Ok(ActiveStream::Tls(session)),
            Err(error) => {
                let error = match error {
                    HandshakeError::Transport(err) => self.transport_error(err),
                    other => other,
                };
                // The session hands back the replaying stream whole, so any
                // sniffed bytes the engine had not yet consumed survive.
                Err((error, Some(session.into_inner())))
            }
        }
    }

    fn transport_error(&self, err: io::Error) -> HandshakeError {
        if self.cancelled {
            HandshakeError::Cancelled
        } else {
            HandshakeError::Transport(err)
        }
    }

    /// Shuts the stream down.
    ///
    /// TLS streams perform the close_notify exchange through the session;
    /// plaintext streams shut the transport down in both directions. A
    /// second call is a no-op that reports success without touching the
    /// transport.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::InvalidUsage`] outside the ready state;
    /// [`HandshakeError::Transport`] when the teardown I/O fails.
    pub fn shutdown(&mut self) -> Result<(), HandshakeError> {
        match &mut self.state {
            StreamState::Ready { active, shut_down } => {
                if *shut_down {
                    return Ok(());
                }

                match active {
                    ActiveStream::Plaintext(stream) => stream
                        .get_mut()
                        .shutdown(Shutdown::Both)
                        .map_err(HandshakeError::Transport)?,
                    ActiveStream::Tls(session) => {
                        session.shutdown().map_err(HandshakeError::Transport)?;
                    }
                }

                *shut_down = true;
                Ok(())
            }
            _ => Err(HandshakeError::InvalidUsage(self.state_usage_error())),
        }
    }

    /// Requests cancellation of in-flight transport I/O.
    ///
    /// The request is forwarded to the transport (which by default shuts
    /// both directions down) and the stream is marked, so an operation
    /// interrupted by it reports [`HandshakeError::Cancelled`] instead of a
    /// bare transport error.
    pub fn cancel(&mut self) -> Result<(), HandshakeError> {
        self.cancelled = true;
        match self.transport_mut() {
            Some(transport) => transport.cancel().map_err(HandshakeError::Transport),
            None => Ok(()),
        }
    }
}

impl<T: Transport> Read for MultiStream<T> {
    /// Reads application bytes from the active stream.
    ///
    /// Replayed detection bytes are returned first, without transport I/O.
    /// Before a successful handshake the call fails with
    /// [`io::ErrorKind::NotConnected`].
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Ready { active, .. } => match active {
                ActiveStream::Plaintext(stream) => stream.read(buf),
                ActiveStream::Tls(session) => session.read(buf),
            },
            _ => Err(HandshakeError::InvalidUsage(self.state_usage_error()).into()),
        }
    }
}

impl<T: Transport> Write for MultiStream<T> {
    /// Writes application bytes through the active stream.
    ///
    /// The replay buffer is never involved on the write side.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Ready { active, .. } => match active {
                ActiveStream::Plaintext(stream) => stream.write(buf),
                ActiveStream::Tls(session) => session.write(buf),
            },
            _ => Err(HandshakeError::InvalidUsage(self.state_usage_error()).into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            StreamState::Ready { active, .. } => match active {
                ActiveStream::Plaintext(stream) => stream.flush(),
                ActiveStream::Tls(session) => session.flush(),
            },
            _ => Err(HandshakeError::InvalidUsage(self.state_usage_error()).into()),
        }
    }
}

impl<T> fmt::Debug for MultiStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            StreamState::Fresh(_) => "fresh",
            StreamState::Ready {
                active: ActiveStream::Plaintext(_),
                shut_down: false,
            } => "ready-plaintext",
            StreamState::Ready {
                active: ActiveStream::Tls(_),
                shut_down: false,
            } => "ready-tls",
            StreamState::Ready { shut_down: true, .. } => "shut-down",
            StreamState::Failed(_) => "failed",
            StreamState::Closed => "closed",
        };

        f.debug_struct("MultiStream")
            .field("state", &state)
            .field("role", &self.role)
            .field("detected", &self.detected)
            .field("options", &self.options)
            .finish()
    }
}
