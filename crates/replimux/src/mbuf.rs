//! See [`Mbuf`] and [`MbufPool`].

/// Fixed-capacity byte segment holding a contiguous run of wire data.
///
/// The writable data region is `[0, end)`, followed by a trailing *extra*
/// region `[end, end_extra)` reserved for cipher overhead when a segment
/// receives an encrypted payload block. Two cursors track progress:
///
/// - `pos`: next byte to be consumed by the send path,
/// - `last`: one past the last written byte.
///
/// Both cursors stay within `[0, end_extra)`. Capacities are fixed when the
/// owning [`MbufPool`] is created, so every segment of one pool is
/// interchangeable.
#[derive(Debug)]
pub struct Mbuf {
    data: Box<[u8]>,
    end: usize,
    pos: usize,
    last: usize,
    read_flip: bool,
}

impl Mbuf {
    fn new(len: usize, extra: usize) -> Self {
        Self {
            data: vec![0; len + extra].into_boxed_slice(),
            end: len,
            pos: 0,
            last: 0,
            read_flip: false,
        }
    }

    /// Number of bytes written into this segment.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.last
    }

    /// Whether all written bytes have been consumed (`pos == last`).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos == self.last
    }

    /// Whether the normal data region is exhausted (`last >= end`).
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.last >= self.end
    }

    /// Capacity of the normal data region.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.end
    }

    /// Capacity including the trailing extra region.
    #[must_use]
    pub const fn capacity_extra(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn pos(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub const fn last(&self) -> usize {
        self.last
    }

    /// Writable window of the normal data region.
    pub fn writable(&mut self) -> &mut [u8] {
        let last = self.last.min(self.end);
        &mut self.data[last..self.end]
    }

    /// Writable window extending through the extra region.
    pub fn writable_extra(&mut self) -> &mut [u8] {
        &mut self.data[self.last..]
    }

    /// Marks `n` more bytes as written.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.last + n <= self.data.len());
        self.last += n;
    }

    /// Written bytes not yet consumed by the send path.
    #[must_use]
    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..self.last]
    }

    /// All written bytes, regardless of consumption.
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.data[..self.last]
    }

    /// Marks `n` bytes as consumed by the send path.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.last);
        self.pos += n;
    }

    /// Copies `src` into the segment, advancing the write cursor.
    ///
    /// # Panics
    ///
    /// Panics if `src` does not fit in the remaining capacity.
    pub fn copy_in(&mut self, src: &[u8]) {
        assert!(src.len() <= self.data.len() - self.last, "mbuf overflow");
        self.data[self.last..self.last + src.len()].copy_from_slice(src);
        self.last += src.len();
    }

    /// Truncates written content to `len` bytes, pulling cursors back as
    /// needed.
    pub fn truncate_to(&mut self, len: usize) {
        debug_assert!(len <= self.last);
        self.last = len;
        self.pos = self.pos.min(len);
    }

    pub fn set_read_flip(&mut self) {
        self.read_flip = true;
    }

    /// Takes the flip flag, resetting the consume cursor to the segment
    /// start if it was set.
    pub fn take_read_flip(&mut self) -> bool {
        if self.read_flip {
            self.read_flip = false;
            self.pos = 0;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.last = 0;
        self.read_flip = false;
    }
}

/// Free-list of recyclable [`Mbuf`] segments with capacities fixed at
/// creation.
///
/// Release is LIFO so a recently drained segment is reused while its pages
/// are still warm.
#[derive(Debug)]
pub struct MbufPool {
    free: Vec<Mbuf>,
    len: usize,
    extra: usize,
    allocated: usize,
}

impl MbufPool {
    /// Creates a pool handing out segments with a `len`-byte data region and
    /// an `extra`-byte trailing region.
    ///
    /// # Panics
    ///
    /// Panics if `len` is 0.
    #[must_use]
    pub fn new(len: usize, extra: usize) -> Self {
        assert!(len > 0);
        Self {
            free: Vec::new(),
            len,
            extra,
            allocated: 0,
        }
    }

    /// Segment data-region capacity for this pool.
    #[must_use]
    pub const fn seg_len(&self) -> usize {
        self.len
    }

    /// Total segments handed out and not yet dropped.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Takes a clean segment from the free-list, allocating if it is empty.
    pub fn acquire(&mut self) -> Mbuf {
        self.free.pop().unwrap_or_else(|| {
            self.allocated += 1;
            Mbuf::new(self.len, self.extra)
        })
    }

    /// Returns a segment to the free-list head.
    pub fn release(&mut self, mut mbuf: Mbuf) {
        mbuf.reset();
        self.free.push(mbuf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors() {
        let mut pool = MbufPool::new(8, 4);
        let mut m = pool.acquire();
        assert!(m.is_empty());
        assert!(!m.is_full());
        assert_eq!(m.capacity(), 8);
        assert_eq!(m.capacity_extra(), 12);

        m.copy_in(b"abcd");
        assert_eq!(m.len(), 4);
        assert_eq!(m.unread(), b"abcd");
        m.consume(2);
        assert_eq!(m.unread(), b"cd");
        assert!(!m.is_empty());
        m.consume(2);
        assert!(m.is_empty());
    }

    #[test]
    fn extra_region() {
        let mut pool = MbufPool::new(4, 4);
        let mut m = pool.acquire();
        m.copy_in(b"abcd");
        assert!(m.is_full());
        assert_eq!(m.writable().len(), 0);
        assert_eq!(m.writable_extra().len(), 4);
        m.writable_extra()[..2].copy_from_slice(b"ef");
        m.advance_write(2);
        assert_eq!(m.written(), b"abcdef");
    }

    #[test]
    fn read_flip_rewinds() {
        let mut pool = MbufPool::new(8, 0);
        let mut m = pool.acquire();
        m.copy_in(b"abcd");
        m.consume(3);
        m.set_read_flip();
        assert!(m.take_read_flip());
        assert_eq!(m.unread(), b"abcd");
        assert!(!m.take_read_flip());
    }

    #[test]
    fn pool_recycles() {
        let mut pool = MbufPool::new(8, 0);
        let mut m = pool.acquire();
        m.copy_in(b"junk");
        pool.release(m);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.free_count(), 1);

        let m = pool.acquire();
        assert!(m.is_empty());
        assert_eq!(m.len(), 0);
        assert_eq!(pool.allocated(), 1);
    }
}
