//! Ciphertext scratch buffer shared by the awaitable state machines.
//!
//! A [`CipherBuf`] holds ciphertext drained from the engine's outbound queue
//! (or read from the socket) together with a cursor over the bytes a partial
//! raw send has not yet pushed out. Capacity starts at one maximum TLS record
//! and doubles on demand up to the per-drain ceiling; it never shrinks over a
//! connection's lifetime, so steady-state transfers stop allocating after the
//! first few drains.

/// Minimum scratch capacity: one maximum-size TLS record.
pub(crate) const MIN_CHUNK: usize = 16 * 1024;

/// Ceiling on how much ciphertext a single drain may stage.
pub(crate) const MAX_CHUNK: usize = 64 * 1024;

/// Growable ciphertext scratch with a send cursor.
#[derive(Debug, Default)]
pub(crate) struct CipherBuf {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl CipherBuf {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bytes staged but not yet pushed to the socket.
    pub(crate) fn unsent(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Marks `n` leading bytes as sent after a raw write.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Stages a fresh chunk by letting `fill` write into the spare capacity.
    ///
    /// The closure receives a slice of at least [`MIN_CHUNK`] and at most
    /// [`MAX_CHUNK`] bytes and returns how many it produced. Any previously
    /// staged bytes must have been drained first.
    pub(crate) fn refill<F>(&mut self, want: usize, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        debug_assert!(self.is_empty());
        let want = want.clamp(MIN_CHUNK, MAX_CHUNK);
        if self.buf.len() < want {
            let mut cap = self.buf.len().max(MIN_CHUNK);
            while cap < want {
                cap *= 2;
            }
            self.buf.resize(cap.min(MAX_CHUNK), 0);
        }
        let n = fill(&mut self.buf[..want]);
        debug_assert!(n <= want);
        self.start = 0;
        self.end = n;
        n
    }

    /// Current allocated capacity; monotonically non-decreasing.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_record_and_doubles_to_the_ceiling() {
        let mut buf = CipherBuf::new();
        buf.refill(1, |chunk| {
            assert_eq!(chunk.len(), MIN_CHUNK);
            0
        });
        assert_eq!(buf.capacity(), MIN_CHUNK);

        buf.refill(MIN_CHUNK + 1, |chunk| chunk.len());
        assert_eq!(buf.capacity(), 2 * MIN_CHUNK);

        buf.advance(MIN_CHUNK + 1);
        buf.refill(MAX_CHUNK, |chunk| {
            assert_eq!(chunk.len(), MAX_CHUNK);
            chunk.len()
        });
        assert_eq!(buf.capacity(), MAX_CHUNK);

        // Requests beyond the ceiling are clamped, and capacity never shrinks.
        buf.advance(MAX_CHUNK);
        buf.refill(10 * MAX_CHUNK, |chunk| {
            assert_eq!(chunk.len(), MAX_CHUNK);
            0
        });
        assert_eq!(buf.capacity(), MAX_CHUNK);
    }

    #[test]
    fn cursor_tracks_partial_sends() {
        let mut buf = CipherBuf::new();
        buf.refill(1, |chunk| {
            chunk[..5].copy_from_slice(b"abcde");
            5
        });
        assert_eq!(buf.unsent(), b"abcde");

        buf.advance(2);
        assert_eq!(buf.unsent(), b"cde");
        assert!(!buf.is_empty());

        buf.advance(3);
        assert!(buf.is_empty());
        assert_eq!(buf.unsent(), b"");
    }
}
