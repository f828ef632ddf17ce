use core::fmt;
use std::io;

use portmux_protocol::PolicyRejection;

/// Operation attempted in a state that does not permit it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// Read, write, or shutdown was attempted before a successful handshake.
    NotHandshaken,
    /// A second handshake was attempted on the same stream.
    AlreadyHandshaken,
    /// The stream is in the terminal failed state; only closing it or
    /// recovering the transport remains possible.
    HandshakeFailed,
    /// The stream was closed; no further operations are possible.
    Closed,
    /// A buffered plaintext handshake was given preloaded bytes.
    PreloadNotEmpty,
    /// Preloaded bytes exceed the detection window and cannot be replayed.
    PreloadTooLarge,
    /// The TLS context has no server half but the handshake selected server
    /// TLS.
    ServerTlsConfigMissing,
    /// The TLS context has no client half but the handshake selected client
    /// TLS.
    ClientTlsConfigMissing,
}

impl UsageError {
    /// Returns the [`io::ErrorKind`] this usage error maps onto.
    #[must_use]
    pub const fn io_kind(self) -> io::ErrorKind {
        match self {
            Self::NotHandshaken | Self::HandshakeFailed | Self::Closed => {
                io::ErrorKind::NotConnected
            }
            Self::AlreadyHandshaken
            | Self::PreloadNotEmpty
            | Self::PreloadTooLarge
            | Self::ServerTlsConfigMissing
            | Self::ClientTlsConfigMissing => io::ErrorKind::InvalidInput,
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHandshaken => f.write_str("stream has not completed a handshake"),
            Self::AlreadyHandshaken => f.write_str("stream already performed its handshake"),
            Self::HandshakeFailed => f.write_str("stream handshake previously failed"),
            Self::Closed => f.write_str("stream is closed"),
            Self::PreloadNotEmpty => {
                f.write_str("plaintext handshake does not accept preloaded bytes")
            }
            Self::PreloadTooLarge => {
                f.write_str("preloaded bytes exceed the detection window")
            }
            Self::ServerTlsConfigMissing => {
                f.write_str("TLS context has no server configuration")
            }
            Self::ClientTlsConfigMissing => {
                f.write_str("TLS context has no client configuration")
            }
        }
    }
}

impl std::error::Error for UsageError {}

/// Errors surfaced by the multiplexing stream adapter.
///
/// Every failure reaches the caller at the operation boundary; nothing is
/// retried internally. A failed handshake parks the stream in its terminal
/// failed state without closing the transport, so the caller decides whether
/// to tear the connection down or recover it via
/// [`MultiStream::into_stream`](crate::MultiStream::into_stream), which also
/// returns any bytes detection had consumed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The detected disposition and the configured options disallow the
    /// connection.
    #[error("handshake rejected by policy: {0}")]
    PolicyRejected(PolicyRejection),

    /// Classification finished without a decision. Five buffered bytes
    /// always decide, so this indicates a detection-loop defect.
    #[error("preamble classification did not reach a decision")]
    NeedMoreData,

    /// The underlying transport failed.
    #[error("transport I/O failed")]
    Transport(#[source] io::Error),

    /// The TLS engine rejected the handshake.
    #[error("TLS handshake failed")]
    Tls(#[source] rustls::Error),

    /// The operation is not valid in the stream's current state.
    #[error("invalid usage: {0}")]
    InvalidUsage(UsageError),

    /// The operation was aborted by [`cancel`](crate::MultiStream::cancel).
    #[error("operation cancelled")]
    Cancelled,
}

impl HandshakeError {
    /// Returns `true` when the error is a policy refusal.
    #[must_use]
    pub const fn is_policy_rejection(&self) -> bool {
        matches!(self, Self::PolicyRejected(_))
    }

    /// Returns `true` when the error reports misuse of the API rather than a
    /// peer or transport failure.
    #[must_use]
    pub const fn is_invalid_usage(&self) -> bool {
        matches!(self, Self::InvalidUsage(_))
    }

    /// Returns the usage classification when the error is
    /// [`HandshakeError::InvalidUsage`].
    #[must_use]
    pub const fn usage(&self) -> Option<UsageError> {
        match self {
            Self::InvalidUsage(usage) => Some(*usage),
            _ => None,
        }
    }
}

impl From<PolicyRejection> for HandshakeError {
    fn from(rejection: PolicyRejection) -> Self {
        Self::PolicyRejected(rejection)
    }
}

impl From<UsageError> for HandshakeError {
    fn from(usage: UsageError) -> Self {
        Self::InvalidUsage(usage)
    }
}

impl From<HandshakeError> for io::Error {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Transport(io) => io,
            HandshakeError::PolicyRejected(rejection) => rejection.into(),
            HandshakeError::NeedMoreData => {
                io::Error::new(io::ErrorKind::InvalidData, HandshakeError::NeedMoreData)
            }
            HandshakeError::Tls(tls) => io::Error::new(io::ErrorKind::InvalidData, tls),
            HandshakeError::InvalidUsage(usage) => io::Error::new(usage.io_kind(), usage),
            HandshakeError::Cancelled => {
                io::Error::new(io::ErrorKind::Interrupted, HandshakeError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_rejections_map_to_connection_refused() {
        let err: io::Error = HandshakeError::from(PolicyRejection::PlaintextDisallowed).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn usage_errors_map_to_stable_kinds() {
        let err: io::Error = HandshakeError::from(UsageError::NotHandshaken).into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let err: io::Error = HandshakeError::from(UsageError::PreloadNotEmpty).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn transport_errors_preserve_their_origin() {
        let origin = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err: io::Error = HandshakeError::Transport(origin).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn cancelled_maps_to_interrupted() {
        let err: io::Error = HandshakeError::Cancelled.into();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn usage_accessor_exposes_the_classification() {
        let err = HandshakeError::from(UsageError::AlreadyHandshaken);
        assert!(err.is_invalid_usage());
        assert_eq!(err.usage(), Some(UsageError::AlreadyHandshaken));
        assert_eq!(HandshakeError::Cancelled.usage(), None);
    }
}
