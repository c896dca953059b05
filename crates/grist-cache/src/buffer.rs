//! Aligned page buffers handed to the direct-I/O layer.

use std::fmt;
use std::ops::Range;

/// Owned page buffer whose visible bytes start on an alignment boundary.
///
/// Direct I/O against SSD arrays rejects unaligned buffers, but safe code
/// cannot dictate where the allocator places a byte vector. Each buffer is
/// therefore allocated with just enough slack to slide a window of `len`
/// bytes onto the requested boundary, and only that window is ever
/// exposed. Cache pages use [`AlignedBuf::page`], which aligns the window
/// to the page size itself.
pub struct AlignedBuf {
    raw: Box<[u8]>,
    window: Range<usize>,
    alignment: usize,
}

impl AlignedBuf {
    /// Allocate a zeroed page buffer aligned to its own size.
    #[must_use]
    pub fn page(page_size: usize) -> Self {
        Self::with_alignment(page_size, page_size)
    }

    /// Allocate a zeroed buffer of `len` bytes starting on an `alignment`
    /// boundary. Non-power-of-two alignments are rounded up.
    #[must_use]
    pub fn with_alignment(len: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1).next_power_of_two();
        if len == 0 {
            return Self {
                raw: Box::default(),
                window: 0..0,
                alignment,
            };
        }

        let raw = vec![0_u8; len + (alignment - 1)].into_boxed_slice();
        let base = raw.as_ptr() as usize;
        let lead = base.next_multiple_of(alignment) - base;
        debug_assert!(lead + len <= raw.len());
        Self {
            raw,
            window: lead..lead + len,
            alignment,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.raw[self.window.clone()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.window.clone()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Zero the buffer contents.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AlignedBuf {{ len: {}, alignment: {} }}",
            self.len(),
            self.alignment
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_buffer_starts_on_its_own_boundary() {
        for page_size in [512_usize, 4096, 65536] {
            let buf = AlignedBuf::page(page_size);
            assert_eq!(buf.len(), page_size);
            assert_eq!((buf.as_slice().as_ptr() as usize) % page_size, 0);
        }
    }

    #[test]
    fn window_covers_exactly_the_requested_bytes() {
        let mut buf = AlignedBuf::with_alignment(100, 64);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_mut_slice().len(), 100);
        assert_eq!((buf.as_slice().as_ptr() as usize) % 64, 0);
    }

    #[test]
    fn alignment_rounds_up_to_a_power_of_two() {
        let buf = AlignedBuf::with_alignment(64, 6);
        assert_eq!(buf.alignment(), 8);
        assert_eq!((buf.as_slice().as_ptr() as usize) % 8, 0);
    }

    #[test]
    fn zero_length_buffer_is_empty() {
        let buf = AlignedBuf::with_alignment(0, 4096);
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice().len(), 0);
    }

    #[test]
    fn clear_zeroes_contents() {
        let mut buf = AlignedBuf::page(64);
        buf.as_mut_slice().fill(0xAB);
        buf.clear();
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }
}
