use core::cmp;

/// Byte counters for an allocator's region.
///
/// `used` counts the bytes of every outstanding block at its granted size,
/// which is the request rounded up to the block size. `peak` is the largest
/// value `used` has reached since the last reset; it never decreases between
/// resets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    total: usize,
    used: usize,
    peak: usize,
}

impl Usage {
    pub(crate) const fn new(total: usize) -> Usage {
        Usage {
            total,
            used: 0,
            peak: 0,
        }
    }

    /// The size of the managed region in bytes.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes currently handed out.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// The most bytes ever handed out at once since the last reset.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Bytes not currently handed out.
    ///
    /// These bytes are not necessarily contiguous.
    #[inline]
    pub fn available(&self) -> usize {
        self.total - self.used
    }

    pub(crate) fn grant(&mut self, bytes: usize) {
        self.used = self
            .used
            .checked_add(bytes)
            .filter(|&used| used <= self.total)
            .expect("granted more bytes than the region holds");
        self.peak = cmp::max(self.peak, self.used);
    }

    pub(crate) fn release(&mut self, bytes: usize) {
        self.used = self
            .used
            .checked_sub(bytes)
            .expect("released more bytes than were granted");
    }

    pub(crate) fn clear(&mut self) {
        self.used = 0;
        self.peak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_never_decreases() {
        let mut u = Usage::new(1024);

        u.grant(256);
        u.grant(128);
        assert_eq!(u.used(), 384);
        assert_eq!(u.peak(), 384);
        assert_eq!(u.available(), 640);

        u.release(256);
        assert_eq!(u.used(), 128);
        assert_eq!(u.peak(), 384);

        u.grant(64);
        assert_eq!(u.peak(), 384);

        u.release(192);
        assert_eq!(u.used(), 0);
        assert_eq!(u.peak(), 384);

        u.clear();
        assert_eq!(u, Usage::new(1024));
    }

    #[test]
    #[should_panic]
    fn over_release_panics() {
        let mut u = Usage::new(64);
        u.grant(16);
        u.release(32);
    }
}
