#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `portmux_protocol` implements the pure decision logic behind the portmux
//! stream adapter: classifying the first bytes of an accepted connection as
//! cleartext, TLS, or a HAProxy PROXY v1 preamble, and combining that
//! classification with the endpoint's role and configured requirements to
//! select a handshake action. Everything in this crate is I/O-free and
//! deterministic; the transport crate supplies the streams, buffers, and TLS
//! engine that act on these decisions.
//!
//! # Design
//!
//! - [`preamble`] exposes [`detect_stream_prologue`], the stateless
//!   classifier over the 5-byte detection window, together with the
//!   [`StreamPrologue`] disposition type.
//! - [`detector`] provides [`StreamPrologueDetector`], an incremental,
//!   sticky form of the same classification for transports that deliver the
//!   opening bytes in bursts.
//! - [`policy`] holds [`StreamOptions`], [`HandshakeRole`], and the two
//!   decision functions [`initial_handshake_action`] and
//!   [`detected_handshake_action`].
//!
//! # Invariants
//!
//! - Classification is monotone: observing more bytes never flips one decided
//!   [`StreamPrologue`] into another, and five bytes always decide.
//! - The decision functions are total over their input space;
//!   [`initial_handshake_action`] never rejects and
//!   [`detected_handshake_action`] never asks for detection again.
//! - No function here performs I/O or allocates.
//!
//! # Errors
//!
//! Refusals are data, not panics: [`PolicyRejection`] captures why a
//! combination was disallowed and converts into [`std::io::Error`] for
//! callers living at the transport boundary. Parsing a prologue identifier
//! from text fails with [`ParseStreamPrologueError`].
//!
//! # Examples
//!
//! Classify an observed preamble and turn it into a handshake action:
//!
//! ```
//! use portmux_protocol::{
//!     detect_stream_prologue, detected_handshake_action, HandshakeAction, StreamOptions,
//! };
//!
//! let options = StreamOptions::permissive().enable_server_tls(true);
//! let prologue = detect_stream_prologue(&[0x16, 0x03, 0x01, 0x00, 0xa5]);
//! assert_eq!(detected_handshake_action(options, prologue), HandshakeAction::Tls);
//! ```
//!
//! A cleartext peer is refused once TLS is mandatory:
//!
//! ```
//! use portmux_protocol::{
//!     detect_stream_prologue, detected_handshake_action, HandshakeAction, PolicyRejection,
//!     StreamOptions,
//! };
//!
//! let options = StreamOptions::permissive().require_server_tls(true);
//! let prologue = detect_stream_prologue(b"GET / HTTP/1.1\r\n");
//! assert_eq!(
//!     detected_handshake_action(options, prologue),
//!     HandshakeAction::Reject(PolicyRejection::PlaintextDisallowed)
//! );
//! ```

/// Stream prologue detection.
pub mod detector;
/// Handshake policy decisions.
pub mod policy;
/// Stream preamble parsing and classification.
pub mod preamble;

pub use detector::StreamPrologueDetector;
pub use policy::{
    HandshakeAction, HandshakeRole, PolicyRejection, StreamOptions, detected_handshake_action,
    initial_handshake_action,
};
pub use preamble::{
    DETECT_WINDOW_LEN, PROXY_V1_SIGNATURE, ParseStreamPrologueError,
    ParseStreamPrologueErrorKind, StreamPrologue, detect_stream_prologue, is_preamble_printable,
};
