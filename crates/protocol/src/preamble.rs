use core::fmt;
use core::str::FromStr;

/// Number of bytes examined while classifying a connection preamble.
///
/// Five bytes are sufficient for every disposition the adapter recognizes:
/// the PROXY v1 signature is exactly the five octets `PROXY`, a TLS record
/// begins with a ContentType octet (0x14-0x17) that fails the printable test
/// on the very first byte, and no legal TLS record starts with five printable
/// ASCII octets.
pub const DETECT_WINDOW_LEN: usize = 5;

/// Signature that opens a HAProxy PROXY protocol v1 preamble.
pub const PROXY_V1_SIGNATURE: &[u8; DETECT_WINDOW_LEN] = b"PROXY";

/// Reports whether `byte` falls in the printable ASCII range used by the
/// preamble classifier.
///
/// The range is exclusive on both ends (`31 < byte < 127`): space (0x20)
/// through tilde (0x7E) are printable, control characters and DEL are not.
/// TLS ContentType octets are all below 0x20, which is what makes the first
/// byte of a ClientHello decisive on its own.
#[must_use]
#[inline]
pub const fn is_preamble_printable(byte: u8) -> bool {
    byte > 31 && byte < 127
}

/// Error category produced when parsing a [`StreamPrologue`] from text fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseStreamPrologueErrorKind {
    /// The provided string was empty after trimming ASCII whitespace.
    Empty,
    /// The provided string did not match a known prologue identifier.
    Invalid,
}

/// Error returned when parsing a [`StreamPrologue`] from text fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParseStreamPrologueError {
    kind: ParseStreamPrologueErrorKind,
}

impl ParseStreamPrologueError {
    const fn new(kind: ParseStreamPrologueErrorKind) -> Self {
        Self { kind }
    }

    /// Returns the classification describing why parsing failed.
    #[must_use]
    pub const fn kind(self) -> ParseStreamPrologueErrorKind {
        self.kind
    }
}

impl fmt::Display for ParseStreamPrologueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ParseStreamPrologueErrorKind::Empty => {
                f.write_str("stream prologue identifier is empty")
            }
            ParseStreamPrologueErrorKind::Invalid => f.write_str(
                "unrecognized stream prologue identifier (expected need-more-data, \
                 plaintext, proxy-v1, or tls)",
            ),
        }
    }
}

impl std::error::Error for ParseStreamPrologueError {}

/// Classification of the first bytes received on an accepted connection.
///
/// A single listening port may be contacted by three kinds of peers:
///
/// * Cleartext application clients, whose request lines open with printable
///   ASCII (`GET /`, banner text, and so on).
/// * TLS clients, whose ClientHello opens with the record-layer ContentType
///   octet 0x16.
/// * Proxies emitting the HAProxy PROXY protocol v1 preamble, which opens
///   with the literal `PROXY`.
///
/// [`detect_stream_prologue`] maps an observed prefix onto one of these
/// dispositions, reporting [`StreamPrologue::NeedMoreData`] while the prefix
/// is still ambiguous.
///
/// # Examples
///
/// Parse the textual identifier produced by [`StreamPrologue::as_str`] back
/// into the corresponding variant.
///
/// ```
/// use std::str::FromStr;
/// use portmux_protocol::{ParseStreamPrologueError, StreamPrologue};
///
/// let tls = StreamPrologue::from_str(" tls ")?;
/// assert!(tls.is_tls());
/// # Ok::<_, ParseStreamPrologueError>(())
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StreamPrologue {
    /// The observed prefix does not yet determine the peer's disposition.
    NeedMoreData,
    /// The peer is speaking a cleartext application protocol.
    Plaintext,
    /// The peer opened with the HAProxy PROXY protocol v1 signature.
    ProxyV1,
    /// The peer is opening a TLS exchange.
    Tls,
}

impl StreamPrologue {
    /// Returns the concise identifier used in diagnostics for this prologue.
    ///
    /// Logging call sites can embed the value directly instead of
    /// re-implementing the mapping from variants to textual tags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NeedMoreData => "need-more-data",
            Self::Plaintext => "plaintext",
            Self::ProxyV1 => "proxy-v1",
            Self::Tls => "tls",
        }
    }

    /// Returns `true` when the peer's disposition has been determined.
    #[must_use = "check whether the prologue has been determined"]
    #[inline]
    pub const fn is_decided(self) -> bool {
        !matches!(self, Self::NeedMoreData)
    }

    /// Reports whether additional bytes must be observed before the
    /// disposition is known.
    #[must_use = "determine if additional preamble bytes must be read"]
    #[inline]
    pub const fn requires_more_data(self) -> bool {
        matches!(self, Self::NeedMoreData)
    }

    /// Returns `true` when the peer was classified as cleartext.
    #[must_use = "check whether the peer was classified as cleartext"]
    #[inline]
    pub const fn is_plaintext(self) -> bool {
        matches!(self, Self::Plaintext)
    }

    /// Returns `true` when the peer opened with a PROXY v1 preamble.
    #[must_use = "check whether the peer opened with a PROXY v1 preamble"]
    #[inline]
    pub const fn is_proxy_v1(self) -> bool {
        matches!(self, Self::ProxyV1)
    }

    /// Returns `true` when the peer is opening a TLS exchange.
    #[must_use = "check whether the peer is opening a TLS exchange"]
    #[inline]
    pub const fn is_tls(self) -> bool {
        matches!(self, Self::Tls)
    }
}

impl From<StreamPrologue> for &'static str {
    fn from(prologue: StreamPrologue) -> Self {
        prologue.as_str()
    }
}

impl Default for StreamPrologue {
    /// Returns [`StreamPrologue::NeedMoreData`], the undecided state before
    /// the first byte is observed.
    fn default() -> Self {
        Self::NeedMoreData
    }
}

impl fmt::Display for StreamPrologue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamPrologue {
    type Err = ParseStreamPrologueError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return Err(ParseStreamPrologueError::new(
                ParseStreamPrologueErrorKind::Empty,
            ));
        }

        match trimmed {
            "need-more-data" => Ok(Self::NeedMoreData),
            "plaintext" => Ok(Self::Plaintext),
            "proxy-v1" => Ok(Self::ProxyV1),
            "tls" => Ok(Self::Tls),
            _ => Err(ParseStreamPrologueError::new(
                ParseStreamPrologueErrorKind::Invalid,
            )),
        }
    }
}

/// Classifies a connection preamble from the bytes observed so far.
///
/// The caller provides the initial bytes read (or peeked) from the transport,
/// in order, without consuming them from the application's view. Bytes beyond
/// the [`DETECT_WINDOW_LEN`] window are ignored. The classification is
/// monotone in information: extending the observed prefix either leaves the
/// result unchanged or promotes [`StreamPrologue::NeedMoreData`] to a decided
/// value, never flips one decided value to another. Concretely:
///
/// * A non-printable byte anywhere in the window decides
///   [`StreamPrologue::Tls`] immediately; a TLS ClientHello is recognized
///   from its very first octet.
/// * An all-printable window of five bytes decides
///   [`StreamPrologue::ProxyV1`] when it equals `PROXY` and
///   [`StreamPrologue::Plaintext`] otherwise.
/// * A shorter all-printable prefix stays
///   [`StreamPrologue::NeedMoreData`], because a later byte in the window
///   could still select TLS or the PROXY signature.
///
/// # Examples
///
/// ```
/// use portmux_protocol::{detect_stream_prologue, StreamPrologue};
///
/// assert_eq!(
///     detect_stream_prologue(b"GET / HTTP/1.1\r\n"),
///     StreamPrologue::Plaintext
/// );
/// assert_eq!(
///     detect_stream_prologue(&[0x16, 0x03, 0x01, 0x00, 0xa5]),
///     StreamPrologue::Tls
/// );
/// assert_eq!(
///     detect_stream_prologue(b"PROXY TCP4 1.2.3.4 5.6.7.8 11111 443\r\n"),
///     StreamPrologue::ProxyV1
/// );
/// assert_eq!(detect_stream_prologue(b"GET"), StreamPrologue::NeedMoreData);
/// ```
#[must_use]
pub fn detect_stream_prologue(bytes: &[u8]) -> StreamPrologue {
    if bytes.is_empty() {
        return StreamPrologue::NeedMoreData;
    }

    let window = &bytes[..bytes.len().min(DETECT_WINDOW_LEN)];

    if window.iter().any(|&byte| !is_preamble_printable(byte)) {
        return StreamPrologue::Tls;
    }

    if window.len() < DETECT_WINDOW_LEN {
        return StreamPrologue::NeedMoreData;
    }

    if window == PROXY_V1_SIGNATURE {
        StreamPrologue::ProxyV1
    } else {
        StreamPrologue::Plaintext
    }
}
