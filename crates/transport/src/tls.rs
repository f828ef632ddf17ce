use core::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::error::{HandshakeError, UsageError};
use crate::stream::ReplayStream;

/// Shared TLS material for one or both handshake roles.
///
/// The context owns reference-counted `rustls` configurations and is cheap to
/// clone; a listener typically builds one context and hands a clone to every
/// accepted stream. Both halves are optional: a stream only fails when the
/// handshake actually selects a role whose half is missing. The context is
/// immutable after construction, which is what makes sharing it across
/// streams sound.
#[derive(Clone, Default)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<ClientHalf>,
}

#[derive(Clone)]
struct ClientHalf {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Creates a context with no TLS material.
    ///
    /// Streams using this context can only ever negotiate plaintext; any
    /// handshake that selects TLS fails with a configuration error.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a context for the server role.
    #[must_use]
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(config),
            client: None,
        }
    }

    /// Creates a context for the client role.
    ///
    /// `server_name` is the name presented for certificate verification when
    /// connecting.
    #[must_use]
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            server: None,
            client: Some(ClientHalf {
                config,
                server_name,
            }),
        }
    }

    /// Adds a server half to an existing context.
    #[must_use]
    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Adds a client half to an existing context.
    #[must_use]
    pub fn with_client(
        mut self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        self.client = Some(ClientHalf {
            config,
            server_name,
        });
        self
    }

    /// Returns the server configuration, if one was provided.
    #[must_use]
    pub fn server_config(&self) -> Option<&Arc<ServerConfig>> {
        self.server.as_ref()
    }

    /// Returns the client configuration and target name, if provided.
    #[must_use]
    pub fn client_config(&self) -> Option<(&Arc<ClientConfig>, &ServerName<'static>)> {
        self.client
            .as_ref()
            .map(|half| (&half.config, &half.server_name))
    }

    pub(crate) fn new_server_connection(&self) -> Result<ServerConnection, HandshakeError> {
        let config = self
            .server
            .as_ref()
            .ok_or(HandshakeError::InvalidUsage(
                UsageError::ServerTlsConfigMissing,
            ))?;
        ServerConnection::new(Arc::clone(config)).map_err(HandshakeError::Tls)
    }

    pub(crate) fn new_client_connection(&self) -> Result<ClientConnection, HandshakeError> {
        let half = self.client.as_ref().ok_or(HandshakeError::InvalidUsage(
            UsageError::ClientTlsConfigMissing,
        ))?;
        ClientConnection::new(Arc::clone(&half.config), half.server_name.clone())
            .map_err(HandshakeError::Tls)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server", &self.server.as_ref().map(|_| ".."))
            .field(
                "client",
                &self.client.as_ref().map(|half| &half.server_name),
            )
            .finish()
    }
}

/// TLS session bound to a replaying transport.
///
/// The session owns the `rustls` connection state together with the
/// [`ReplayStream`] it exchanges records over, so detection bytes that were
/// part of the peer's ClientHello are fed back to the engine before any new
/// transport reads. Reads and writes speak plaintext; the record pump below
/// translates them to and from transport I/O.
pub struct TlsSession<T> {
    conn: Connection,
    io: ReplayStream<T>,
}

impl<T> TlsSession<T> {
    pub(crate) fn new(conn: Connection, io: ReplayStream<T>) -> Self {
        Self { conn, io }
    }

    /// Reports whether the session negotiated as a server.
    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self.conn, Connection::Server(_))
    }

    /// Returns a shared reference to the replaying transport.
    #[must_use]
    pub fn get_ref(&self) -> &ReplayStream<T> {
        &self.io
    }

    /// Returns a mutable reference to the replaying transport.
    ///
    /// Bytes read directly from the transport bypass the record layer and
    /// will desynchronize the session; the accessor exists for connection
    /// metadata (peer address, socket options), not for I/O.
    #[must_use]
    pub fn get_mut(&mut self) -> &mut ReplayStream<T> {
        &mut self.io
    }

    /// Releases the session and returns the replaying transport.
    #[must_use]
    pub fn into_inner(self) -> ReplayStream<T> {
        self.io
    }
}

impl<T: Read + Write> TlsSession<T> {
    /// Drives the TLS handshake to completion.
    ///
    /// `initial` carries handshake bytes the caller already read from the
    /// transport (the buffered-handshake variant); they are fed to the
    /// engine before the first transport read. Sniffed detection bytes need
    /// no such treatment: they sit in the replay stream and reach the engine
    /// through the ordinary record reads.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Tls`] when the engine rejects the exchange,
    /// [`HandshakeError::Transport`] when the transport fails or reaches EOF
    /// mid-handshake.
    pub fn handshake(&mut self, initial: &[u8]) -> Result<(), HandshakeError> {
        if !initial.is_empty() {
            let mut pending: &[u8] = initial;
            while !pending.is_empty() {
                let consumed = self
                    .conn
                    .read_tls(&mut pending)
                    .map_err(HandshakeError::Transport)?;
                if consumed == 0 {
                    break;
                }
                self.process_packets()?;
            }
        }

        while self.conn.is_handshaking() {
            self.flush_records().map_err(HandshakeError::Transport)?;

            if !self.conn.is_handshaking() {
                break;
            }

            if self.conn.wants_read() {
                let read = self
                    .conn
                    .read_tls(&mut self.io)
                    .map_err(HandshakeError::Transport)?;
                if read == 0 {
                    return Err(HandshakeError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transport closed during TLS handshake",
                    )));
                }
                self.process_packets()?;
            }
        }

        // Deliver any handshake tail (e.g. the final flight queued while the
        // engine flipped out of the handshaking state).
        self.flush_records().map_err(HandshakeError::Transport)?;
        Ok(())
    }

    /// Reads decrypted plaintext, pumping TLS records from the transport as
    /// needed.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }

            self.flush_records()?;

            let read = self.conn.read_tls(&mut self.io)?;
            self.conn
                .process_new_packets()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

            if read == 0 {
                // Transport EOF. One more reader pass picks up any plaintext
                // that was already decrypted; an empty session here means the
                // peer vanished without close_notify.
                return match self.conn.reader().read(buf) {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "transport closed without close_notify",
                        ))
                    }
                    other => other,
                };
            }
        }
    }

    /// Encrypts plaintext and pushes the resulting records to the transport.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.conn.writer().write(buf)?;
        self.flush_records()?;
        Ok(written)
    }

    /// Flushes buffered plaintext and pending records through the transport.
    pub fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        self.flush_records()?;
        self.io.flush()
    }

    /// Performs the TLS closure exchange.
    ///
    /// Sends close_notify, flushes it, then drains the transport until the
    /// peer's close_notify (or EOF) arrives. A peer that drops the
    /// connection without the closing alert is tolerated: truncation at this
    /// point cannot lose application data the caller has not already read.
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        self.flush_records()?;
        self.io.flush()?;

        let mut discard = [0u8; 128];
        loop {
            match self.conn.reader().read(&mut discard) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let read = self.conn.read_tls(&mut self.io)?;
                    if read == 0 {
                        return Ok(());
                    }
                    if self.conn.process_new_packets().is_err() {
                        return Ok(());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn flush_records(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.io)?;
        }
        self.io.flush()
    }

    fn process_packets(&mut self) -> Result<(), HandshakeError> {
        match self.conn.process_new_packets() {
            Ok(_) => Ok(()),
            Err(err) => {
                // Push the queued alert out before reporting, so the peer
                // learns why the handshake died.
                let _ = self.flush_records();
                Err(HandshakeError::Tls(err))
            }
        }
    }
}

impl<T> fmt::Debug for TlsSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("server", &self.is_server())
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}
