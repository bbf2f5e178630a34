//! Fixed-capacity byte FIFO for stream reassembly.
//!
//! `CircularFifo` stores a byte stream in a backing array of `N` bytes.
//! Head and tail pointers are 16 bits wide and wrap modulo `2·N`, so the
//! extra bit distinguishes a full buffer from an empty one; the maximum
//! legal `N` is `2^15 - 1`.
//!
//! The distinguishing operation is [`rewind`](CircularFifo::rewind), which
//! relocates any unread data so it starts at offset 0 of the backing array
//! and hands back a contiguous mutable slice over it.  Protocol parsers use
//! this to reassemble framed messages (SSH packets, SFTP packets) that may
//! arrive split across many TCP segments, and to decrypt packets in place.
//!
//! This type has no interior locking; it is owned by exactly one connection
//! state entry and accessed from a single execution context.

/// Byte FIFO with arbitrary-length reads, writes, and in-place rewind.
pub struct CircularFifo<const N: usize> {
    data: [u8; N],
    /// Read pointer, wraps modulo `2·N`.
    head: u16,
    /// Write pointer, wraps modulo `2·N`.
    tail: u16,
}

impl<const N: usize> CircularFifo<N> {
    pub const fn new() -> Self {
        Self {
            data: [0; N],
            head: 0,
            tail: 0,
        }
    }

    /// Clears the FIFO to an empty state.
    #[inline]
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn read_size(&self) -> usize {
        (self.tail.wrapping_sub(self.head) as usize) % (2 * N)
    }

    /// Number of bytes of free buffer space.
    #[inline]
    pub fn write_size(&self) -> usize {
        N - self.read_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    fn advance(ptr: u16) -> u16 {
        ((ptr as usize + 1) % (2 * N)) as u16
    }

    /// Pushes a single byte.  Returns `false` if the FIFO is full.
    pub fn push_byte(&mut self, c: u8) -> bool {
        if self.write_size() == 0 {
            return false;
        }
        self.data[self.tail as usize % N] = c;
        self.tail = Self::advance(self.tail);
        true
    }

    /// Pushes a slice of data.
    ///
    /// Writes are all-or-nothing: if `src` does not fit in the free space
    /// the FIFO is left unmodified and `false` is returned.
    pub fn push(&mut self, src: &[u8]) -> bool {
        if src.len() > self.write_size() {
            return false;
        }
        for &c in src {
            self.data[self.tail as usize % N] = c;
            self.tail = Self::advance(self.tail);
        }
        true
    }

    /// Discards up to `len` bytes from the read side.
    ///
    /// Requests larger than the unread length are clamped.
    pub fn pop(&mut self, len: usize) {
        let len = len.min(self.read_size());
        self.head = ((self.head as usize + len) % (2 * N)) as u16;
        // Park the pointers at zero when drained so the common case never
        // needs a rotate on the next rewind.
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Relocates unread data to offset 0 and returns a contiguous mutable
    /// slice over it.
    ///
    /// After this call the read pointer is 0 and the write pointer equals
    /// the unread length.  The returned slice aliases the backing array, so
    /// callers may parse or decrypt in place before popping.
    pub fn rewind(&mut self) -> &mut [u8] {
        let nbytes = self.read_size();
        let offset = self.head as usize % N;

        if offset != 0 && nbytes != 0 {
            if offset + nbytes <= N {
                // Unwrapped: slide the region left in place.
                self.data.copy_within(offset..offset + nbytes, 0);
            } else {
                // Wrapped past the end: a left rotation by the read offset
                // puts the two pieces back in stream order at the front.
                self.data.rotate_left(offset);
            }
        }

        self.head = 0;
        self.tail = nbytes as u16;
        &mut self.data[..nbytes]
    }
}

impl<const N: usize> Default for CircularFifo<N> {
    fn default() -> Self {
        Self::new()
    }
}
