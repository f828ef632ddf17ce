#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `portmux_transport` is a protocol-multiplexing stream adapter: one
//! accepted connection, auto-detected as cleartext, TLS, or a HAProxy PROXY
//! v1 preamble, presented behind a single read/write/shutdown surface. It
//! exists so a listener can serve heterogeneous client types on one port
//! while the code above it sees a uniform stream.
//!
//! The decision logic (classification and policy) lives in
//! `portmux_protocol`; this crate supplies everything that touches bytes.
//!
//! # Design
//!
//! - [`ReplayBuffer`] holds the bytes detection read ahead of the
//!   application; [`ReplayStream`] replays them in front of the inner
//!   transport so nothing the peer sent is lost or reordered.
//! - [`MultiStream`] is the blocking façade: policy, detection over the
//!   five-byte window, then a plaintext or TLS active stream, selected once
//!   and fixed for the connection's lifetime.
//! - [`TlsContext`] and [`TlsSession`] adapt `rustls`: the context shares
//!   immutable configuration across streams, the session pumps TLS records
//!   over the replaying transport.
//! - `AsyncMultiStream` (behind the `async` feature) mirrors the façade on
//!   tokio traits with `tokio-rustls` as the engine and explicit
//!   cancellation.
//!
//! # Invariants
//!
//! - Detection reads, never peeks, and every byte it reads is replayed
//!   exactly once before fresh transport reads.
//! - A stream performs at most one handshake; once it resolves, the active
//!   variant never changes.
//! - A failed handshake does not close the transport; the caller decides.
//! - `shutdown` is idempotent: the second call succeeds without I/O.
//!
//! # Errors
//!
//! [`HandshakeError`] classifies failures (policy refusal, transport I/O,
//! TLS, misuse, cancellation) and converts into [`std::io::Error`] with
//! stable kinds for the trait-based surfaces.
//!
//! # Examples
//!
//! Replay semantics, the heart of the adapter:
//!
//! ```
//! use std::io::{Cursor, Read};
//! use portmux_transport::{ReplayBuffer, ReplayStream};
//!
//! let replay = ReplayBuffer::preloaded(b"GET /").expect("fits the window");
//! let mut stream = ReplayStream::with_replay(Cursor::new(b" HTTP/1.1\r\n".to_vec()), replay);
//!
//! let mut line = String::new();
//! stream.read_to_string(&mut line).expect("replayed bytes come first");
//! assert_eq!(line, "GET / HTTP/1.1\r\n");
//! ```
//!
//! Accepting either cleartext or TLS on one port:
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::sync::Arc;
//! use portmux_protocol::{HandshakeRole, StreamOptions};
//! use portmux_transport::{MultiStream, TlsContext};
//!
//! # fn server_config() -> Arc<rustls::ServerConfig> { unimplemented!() }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("0.0.0.0:5005")?;
//! let options = StreamOptions::permissive().enable_server_tls(true);
//! let context = TlsContext::server(server_config());
//!
//! let (socket, _peer) = listener.accept()?;
//! let mut stream = MultiStream::new(socket, options, context.clone());
//! stream.handshake(HandshakeRole::Server)?;
//!
//! assert!(stream.is_ready());
//! # Ok(())
//! # }
//! ```

mod error;
mod multistream;
mod replay;
mod stream;
mod tls;
mod transport;

#[cfg(feature = "async")]
mod async_io;

pub use error::{HandshakeError, UsageError};
pub use multistream::MultiStream;
pub use replay::{ReplayBuffer, ReplayCapacityExceeded};
pub use stream::ReplayStream;
pub use tls::{TlsContext, TlsSession};
pub use transport::Transport;

#[cfg(feature = "async")]
pub use async_io::AsyncMultiStream;
