use core::slice;

use crate::preamble::{
    DETECT_WINDOW_LEN, PROXY_V1_SIGNATURE, StreamPrologue, is_preamble_printable,
};

/// Incremental classifier for the connection preamble.
///
/// [`detect_stream_prologue`](crate::detect_stream_prologue) wants the whole
/// observed prefix in one slice, but real transports deliver the opening
/// bytes in bursts of unpredictable size. The detector accepts those chunks
/// as they arrive and reports the classification reached so far, becoming
/// sticky on the first decided answer. It keeps no copy of the bytes: the
/// caller's replay machinery owns them, and the detector only tracks how far
/// into the window it has looked and whether the prefix still matches the
/// PROXY v1 signature.
///
/// For any chunking of an input, the detector's decision matches
/// `detect_stream_prologue` applied to the first
/// [`DETECT_WINDOW_LEN`] bytes of the concatenated input.
#[derive(Clone, Debug)]
pub struct StreamPrologueDetector {
    observed: usize,
    matches_proxy: bool,
    decided: Option<StreamPrologue>,
}

impl StreamPrologueDetector {
    /// Creates a fresh detector that has not yet observed any bytes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            observed: 0,
            matches_proxy: true,
            decided: None,
        }
    }

    /// Observes the next chunk of preamble bytes and reports the
    /// classification chosen so far.
    ///
    /// Once a decided classification is returned, subsequent calls keep
    /// producing the same value without inspecting further input.
    #[must_use]
    pub fn observe(&mut self, chunk: &[u8]) -> StreamPrologue {
        if let Some(decided) = self.decided {
            return decided;
        }

        for &byte in chunk {
            if !is_preamble_printable(byte) {
                return self.decide(StreamPrologue::Tls);
            }

            if byte != PROXY_V1_SIGNATURE[self.observed] {
                self.matches_proxy = false;
            }
            self.observed += 1;

            if self.observed == DETECT_WINDOW_LEN {
                let decision = if self.matches_proxy {
                    StreamPrologue::ProxyV1
                } else {
                    StreamPrologue::Plaintext
                };
                return self.decide(decision);
            }
        }

        StreamPrologue::NeedMoreData
    }

    /// Observes a single byte, for call sites that read the transport one
    /// octet at a time.
    #[must_use]
    #[inline]
    pub fn observe_byte(&mut self, byte: u8) -> StreamPrologue {
        self.observe(slice::from_ref(&byte))
    }

    /// Reports the finalized classification, if one has been established.
    #[must_use]
    pub const fn decision(&self) -> Option<StreamPrologue> {
        self.decided
    }

    /// Reports whether the classification has been determined.
    #[must_use]
    pub const fn is_decided(&self) -> bool {
        self.decided.is_some()
    }

    /// Reports whether additional bytes must be observed before the
    /// classification is known.
    #[must_use]
    pub const fn requires_more_data(&self) -> bool {
        self.decided.is_none()
    }

    /// Returns the number of window bytes examined so far.
    ///
    /// The count stops advancing once a decision is reached, so it also
    /// bounds how many bytes a caller must have buffered for replay.
    #[must_use]
    pub const fn observed_len(&self) -> usize {
        self.observed
    }

    /// Returns how many additional bytes could still be required before the
    /// detector reaches a decision.
    ///
    /// A decided detector needs zero further bytes. An undecided one needs at
    /// most the remainder of the [`DETECT_WINDOW_LEN`] window, which is the
    /// upper bound a caller should request from the transport in one read.
    #[must_use]
    pub const fn missing(&self) -> usize {
        if self.decided.is_some() {
            0
        } else {
            DETECT_WINDOW_LEN - self.observed
        }
    }

    /// Resets the detector to its initial state so it can be reused for a
    /// new connection attempt.
    pub fn reset(&mut self) {
        self.observed = 0;
        self.matches_proxy = true;
        self.decided = None;
    }

    fn decide(&mut self, decision: StreamPrologue) -> StreamPrologue {
        self.decided = Some(decision);
        decision
    }
}

impl Default for StreamPrologueDetector {
    /// Creates a detector that has not yet observed any bytes.
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
