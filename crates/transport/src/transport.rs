use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

/// Byte-stream transport a [`MultiStream`](crate::MultiStream) can adapt.
///
/// The trait extends [`Read`] + [`Write`] with the connection-level controls
/// the façade forwards: half/full shutdown for the plain teardown path and a
/// best-effort cancel for aborting in-flight I/O. Detection never requires a
/// native peek; bytes read while classifying are retained by the replay
/// machinery, so any blocking byte stream qualifies.
pub trait Transport: Read + Write {
    /// Shuts down one or both directions of the connection.
    fn shutdown(&mut self, how: Shutdown) -> std::io::Result<()>;

    /// Requests that in-flight operations on the transport abort.
    ///
    /// The default implementation shuts down both directions, which unblocks
    /// a thread parked in a socket read. Transports with a real cancellation
    /// primitive should override this.
    fn cancel(&mut self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Transport for TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> std::io::Result<()> {
        TcpStream::shutdown(self, how)
    }
}
