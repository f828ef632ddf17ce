use core::fmt;
use std::io;

use portmux_protocol::DETECT_WINDOW_LEN;

/// Error returned when a preload does not fit in the replay buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplayCapacityExceeded {
    required: usize,
    capacity: usize,
}

impl ReplayCapacityExceeded {
    pub(crate) const fn new(required: usize, capacity: usize) -> Self {
        Self { required, capacity }
    }

    /// Returns the number of bytes the caller attempted to store.
    #[must_use]
    pub const fn required(self) -> usize {
        self.required
    }

    /// Returns the buffer capacity, which equals the detection window.
    #[must_use]
    pub const fn capacity(self) -> usize {
        self.capacity
    }
}

impl fmt::Display for ReplayCapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes do not fit in the {}-byte replay buffer",
            self.required, self.capacity
        )
    }
}

impl std::error::Error for ReplayCapacityExceeded {}

impl From<ReplayCapacityExceeded> for io::Error {
    fn from(err: ReplayCapacityExceeded) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// Bounded queue for bytes consumed during detection but not yet delivered
/// to the application.
///
/// Detection reads at most [`DETECT_WINDOW_LEN`] bytes ahead of the
/// application, so the buffer is a fixed window with two cursors: `prepare`
/// hands out writable space, `commit` marks it valid, and reads drain the
/// committed region through [`data`](Self::data)/[`consume`](Self::consume)
/// (or [`copy_into`](Self::copy_into)) before the transport is touched
/// again. The buffer is non-empty only between a classification and the
/// first application read that follows it.
#[derive(Clone, Debug)]
pub struct ReplayBuffer {
    bytes: [u8; DETECT_WINDOW_LEN],
    committed: usize,
    consumed: usize,
}

impl ReplayBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0; DETECT_WINDOW_LEN],
            committed: 0,
            consumed: 0,
        }
    }

    /// Creates a buffer pre-filled with bytes the caller already read from
    /// the transport.
    ///
    /// # Errors
    ///
    /// Fails with [`ReplayCapacityExceeded`] when the preload is longer than
    /// the detection window.
    pub fn preloaded(bytes: &[u8]) -> Result<Self, ReplayCapacityExceeded> {
        let mut buffer = Self::new();
        buffer.preload(bytes)?;
        Ok(buffer)
    }

    /// Installs caller-supplied bytes into an empty buffer.
    ///
    /// # Errors
    ///
    /// Fails with [`ReplayCapacityExceeded`] when the preload is longer than
    /// the detection window.
    pub fn preload(&mut self, bytes: &[u8]) -> Result<(), ReplayCapacityExceeded> {
        debug_assert!(self.is_empty(), "preload requires an empty buffer");

        if bytes.len() > DETECT_WINDOW_LEN {
            return Err(ReplayCapacityExceeded::new(bytes.len(), DETECT_WINDOW_LEN));
        }

        self.bytes[..bytes.len()].copy_from_slice(bytes);
        self.committed = bytes.len();
        self.consumed = 0;
        Ok(())
    }

    /// Reserves up to `len` bytes of writable space past the committed
    /// region.
    ///
    /// The returned slice may be shorter than requested when the window is
    /// nearly full; it is empty once the window is exhausted.
    #[must_use = "prepared space must be filled and committed"]
    pub fn prepare(&mut self, len: usize) -> &mut [u8] {
        let end = (self.committed + len).min(DETECT_WINDOW_LEN);
        &mut self.bytes[self.committed..end]
    }

    /// Marks `len` prepared bytes as valid for replay.
    pub fn commit(&mut self, len: usize) {
        self.committed = (self.committed + len).min(DETECT_WINDOW_LEN);
    }

    /// Returns the committed bytes that have not been consumed yet.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.consumed..self.committed]
    }

    /// Advances the read cursor past `len` consumed bytes.
    pub fn consume(&mut self, len: usize) {
        self.consumed = (self.consumed + len).min(self.committed);
    }

    /// Returns the number of committed, unconsumed bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.committed - self.consumed
    }

    /// Reports whether every committed byte has been consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the fixed capacity of the buffer.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        DETECT_WINDOW_LEN
    }

    /// Drops all buffered bytes and both cursors.
    pub fn clear(&mut self) {
        self.committed = 0;
        self.consumed = 0;
    }

    /// Copies buffered bytes into `target`, consuming what was copied.
    ///
    /// Returns the number of bytes copied, zero when either the buffer or
    /// `target` is empty.
    pub fn copy_into(&mut self, target: &mut [u8]) -> usize {
        if target.is_empty() || self.is_empty() {
            return 0;
        }

        let available = self.data();
        let to_copy = available.len().min(target.len());
        target[..to_copy].copy_from_slice(&available[..to_copy]);
        self.consumed += to_copy;
        to_copy
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}
