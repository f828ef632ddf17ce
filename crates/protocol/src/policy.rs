use core::fmt;
use std::io;

use crate::preamble::StreamPrologue;

/// Side of the connection the handshake is performed for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HandshakeRole {
    /// The local endpoint initiated the connection.
    Client,
    /// The local endpoint accepted the connection.
    Server,
}

impl HandshakeRole {
    /// Returns the concise identifier used in diagnostics for this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    /// Returns `true` for the client role.
    #[must_use]
    #[inline]
    pub const fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    /// Returns `true` for the server role.
    #[must_use]
    #[inline]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security requirements applied when negotiating a multiplexed stream.
///
/// The four flags are fixed at construction and combine with the
/// [`HandshakeRole`] and the detected [`StreamPrologue`] to select the
/// handshake action. The default (all flags off) accepts cleartext peers
/// only.
///
/// # Examples
///
/// A server that accepts both cleartext and TLS peers on the same port:
///
/// ```
/// use portmux_protocol::StreamOptions;
///
/// let options = StreamOptions::permissive().enable_server_tls(true);
/// assert!(options.enable_server_tls);
/// assert!(!options.require_server_tls);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct StreamOptions {
    /// Accept TLS from connecting peers when acting as a server.
    pub enable_server_tls: bool,
    /// Reject peers that do not negotiate TLS when acting as a server.
    pub require_server_tls: bool,
    /// Require the HAProxy PROXY v1 preamble when acting as a server.
    pub require_server_proxy: bool,
    /// Negotiate TLS when acting as a client.
    pub use_client_tls: bool,
}

impl StreamOptions {
    /// Returns options with every requirement disabled.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            enable_server_tls: false,
            require_server_tls: false,
            require_server_proxy: false,
            use_client_tls: false,
        }
    }

    /// Sets whether TLS peers are accepted in the server role.
    #[must_use]
    pub const fn enable_server_tls(mut self, enabled: bool) -> Self {
        self.enable_server_tls = enabled;
        self
    }

    /// Sets whether TLS is mandatory in the server role.
    #[must_use]
    pub const fn require_server_tls(mut self, required: bool) -> Self {
        self.require_server_tls = required;
        self
    }

    /// Sets whether the PROXY v1 preamble is mandatory in the server role.
    #[must_use]
    pub const fn require_server_proxy(mut self, required: bool) -> Self {
        self.require_server_proxy = required;
        self
    }

    /// Sets whether TLS is negotiated in the client role.
    #[must_use]
    pub const fn use_client_tls(mut self, enabled: bool) -> Self {
        self.use_client_tls = enabled;
        self
    }
}

/// Reason a handshake was refused by policy.
///
/// Each variant captures the combination of detected disposition and
/// configured requirements that disallowed the connection, so diagnostics can
/// state what arrived and what was demanded.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PolicyRejection {
    /// A cleartext peer arrived but the options demand TLS or a PROXY
    /// preamble.
    PlaintextDisallowed,
    /// A TLS peer arrived but TLS is not enabled for the server role, or a
    /// PROXY preamble was demanded first.
    TlsDisallowed,
    /// The peer opened with a PROXY v1 preamble, which this adapter detects
    /// but does not consume.
    ProxyUnsupported,
    /// Classification finished without a decided disposition. This indicates
    /// a defect in the detection loop rather than peer behavior.
    Undecided,
}

impl PolicyRejection {
    /// Returns the concise identifier used in diagnostics for this
    /// rejection.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlaintextDisallowed => "plaintext-disallowed",
            Self::TlsDisallowed => "tls-disallowed",
            Self::ProxyUnsupported => "proxy-unsupported",
            Self::Undecided => "undecided",
        }
    }
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlaintextDisallowed => {
                f.write_str("cleartext peer rejected: options require TLS or a PROXY preamble")
            }
            Self::TlsDisallowed => {
                f.write_str("TLS peer rejected: server TLS is not enabled by the options")
            }
            Self::ProxyUnsupported => {
                f.write_str("PROXY v1 preamble detected but not supported")
            }
            Self::Undecided => {
                f.write_str("preamble classification finished without a decision")
            }
        }
    }
}

impl std::error::Error for PolicyRejection {}

impl From<PolicyRejection> for io::Error {
    fn from(rejection: PolicyRejection) -> Self {
        io::Error::new(io::ErrorKind::ConnectionRefused, rejection)
    }
}

/// Action selected for a handshake by combining role, options, and (after
/// detection) the classified prologue.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HandshakeAction {
    /// Expose the raw transport as the active stream.
    Plaintext,
    /// Wrap the transport in a TLS session before exposing it.
    Tls,
    /// Classify the connection preamble, then decide again.
    Detect,
    /// Refuse the connection for the recorded reason.
    Reject(PolicyRejection),
}

impl HandshakeAction {
    /// Returns the concise identifier used in diagnostics for this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Tls => "tls",
            Self::Detect => "detect",
            Self::Reject(_) => "reject",
        }
    }
}

impl fmt::Display for HandshakeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects the handshake action before any bytes have been observed.
///
/// Clients never detect: they either negotiate TLS or stay cleartext as the
/// options direct. Servers go straight to a plain or TLS stream when the
/// options leave no ambiguity, and fall back to [`HandshakeAction::Detect`]
/// whenever the peer's opening bytes are needed to decide.
///
/// The function is total and deterministic over every (role, options)
/// combination and never returns [`HandshakeAction::Reject`].
#[must_use]
pub const fn initial_handshake_action(
    role: HandshakeRole,
    options: StreamOptions,
) -> HandshakeAction {
    match role {
        HandshakeRole::Client => {
            if options.use_client_tls {
                HandshakeAction::Tls
            } else {
                HandshakeAction::Plaintext
            }
        }
        HandshakeRole::Server => {
            if !options.enable_server_tls
                && !options.require_server_tls
                && !options.require_server_proxy
            {
                HandshakeAction::Plaintext
            } else if options.require_server_tls && !options.require_server_proxy {
                HandshakeAction::Tls
            } else {
                HandshakeAction::Detect
            }
        }
    }
}

/// Selects the handshake action after the connection preamble has been
/// classified.
///
/// The function is total and deterministic over every (options, prologue)
/// combination and never returns [`HandshakeAction::Detect`]. A
/// [`StreamPrologue::NeedMoreData`] input is rejected as
/// [`PolicyRejection::Undecided`]: detection must not consult the policy
/// until it has a decided classification.
#[must_use]
pub const fn detected_handshake_action(
    options: StreamOptions,
    prologue: StreamPrologue,
) -> HandshakeAction {
    match prologue {
        StreamPrologue::Plaintext => {
            if !options.require_server_tls && !options.require_server_proxy {
                HandshakeAction::Plaintext
            } else {
                HandshakeAction::Reject(PolicyRejection::PlaintextDisallowed)
            }
        }
        StreamPrologue::Tls => {
            if !options.require_server_proxy
                && (options.enable_server_tls || options.require_server_tls)
            {
                HandshakeAction::Tls
            } else {
                HandshakeAction::Reject(PolicyRejection::TlsDisallowed)
            }
        }
        // Detected but never consumed. Parsing the preamble and re-entering
        // detection for a TLS exchange behind the proxy header is a future
        // extension.
        StreamPrologue::ProxyV1 => HandshakeAction::Reject(PolicyRejection::ProxyUnsupported),
        StreamPrologue::NeedMoreData => HandshakeAction::Reject(PolicyRejection::Undecided),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_option_combinations() -> impl Iterator<Item = StreamOptions> {
        (0u8..16).map(|bits| StreamOptions {
            enable_server_tls: bits & 1 != 0,
            require_server_tls: bits & 2 != 0,
            require_server_proxy: bits & 4 != 0,
            use_client_tls: bits & 8 != 0,
        })
    }

    #[test]
    fn client_action_depends_only_on_use_client_tls() {
        for options in all_option_combinations() {
            let expected = if options.use_client_tls {
                HandshakeAction::Tls
            } else {
                HandshakeAction::Plaintext
            };
            assert_eq!(
                initial_handshake_action(HandshakeRole::Client, options),
                expected
            );
        }
    }

    #[test]
    fn permissive_server_goes_straight_to_plaintext() {
        assert_eq!(
            initial_handshake_action(HandshakeRole::Server, StreamOptions::permissive()),
            HandshakeAction::Plaintext
        );
    }

    #[test]
    fn required_tls_without_proxy_skips_detection() {
        let options = StreamOptions::permissive().require_server_tls(true);
        assert_eq!(
            initial_handshake_action(HandshakeRole::Server, options),
            HandshakeAction::Tls
        );
    }

    #[test]
    fn ambiguous_server_options_detect() {
        let enabled = StreamOptions::permissive().enable_server_tls(true);
        assert_eq!(
            initial_handshake_action(HandshakeRole::Server, enabled),
            HandshakeAction::Detect
        );

        let proxied = StreamOptions::permissive()
            .require_server_tls(true)
            .require_server_proxy(true);
        assert_eq!(
            initial_handshake_action(HandshakeRole::Server, proxied),
            HandshakeAction::Detect
        );
    }

    #[test]
    fn detected_plaintext_follows_the_requirement_flags() {
        assert_eq!(
            detected_handshake_action(StreamOptions::permissive(), StreamPrologue::Plaintext),
            HandshakeAction::Plaintext
        );
        assert_eq!(
            detected_handshake_action(
                StreamOptions::permissive().require_server_tls(true),
                StreamPrologue::Plaintext
            ),
            HandshakeAction::Reject(PolicyRejection::PlaintextDisallowed)
        );
        assert_eq!(
            detected_handshake_action(
                StreamOptions::permissive().require_server_proxy(true),
                StreamPrologue::Plaintext
            ),
            HandshakeAction::Reject(PolicyRejection::PlaintextDisallowed)
        );
    }

    #[test]
    fn detected_tls_requires_an_enabled_server_side() {
        assert_eq!(
            detected_handshake_action(
                StreamOptions::permissive().enable_server_tls(true),
                StreamPrologue::Tls
            ),
            HandshakeAction::Tls
        );
        assert_eq!(
            detected_handshake_action(StreamOptions::permissive(), StreamPrologue::Tls),
            HandshakeAction::Reject(PolicyRejection::TlsDisallowed)
        );
        assert_eq!(
            detected_handshake_action(
                StreamOptions::permissive()
                    .enable_server_tls(true)
                    .require_server_proxy(true),
                StreamPrologue::Tls
            ),
            HandshakeAction::Reject(PolicyRejection::TlsDisallowed)
        );
    }

    #[test]
    fn proxy_preambles_are_always_rejected() {
        for options in all_option_combinations() {
            assert_eq!(
                detected_handshake_action(options, StreamPrologue::ProxyV1),
                HandshakeAction::Reject(PolicyRejection::ProxyUnsupported)
            );
        }
    }

    #[test]
    fn decision_functions_are_total_and_deterministic() {
        let prologues = [
            StreamPrologue::NeedMoreData,
            StreamPrologue::Plaintext,
            StreamPrologue::ProxyV1,
            StreamPrologue::Tls,
        ];

        for options in all_option_combinations() {
            for role in [HandshakeRole::Client, HandshakeRole::Server] {
                let first = initial_handshake_action(role, options);
                assert_eq!(first, initial_handshake_action(role, options));
                assert!(!matches!(first, HandshakeAction::Reject(_)));
            }

            for prologue in prologues {
                let decided = detected_handshake_action(options, prologue);
                assert_eq!(decided, detected_handshake_action(options, prologue));
                assert_ne!(decided, HandshakeAction::Detect);
            }
        }
    }
}
