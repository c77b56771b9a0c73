use core::{
    alloc::{Layout, LayoutError},
    mem,
    ptr::NonNull,
};

/// A fixed-length bitmap stored in memory owned by someone else.
///
/// The allocator keeps its node bitmap inside the metadata prefix of the
/// backing allocation, so the bitmap only borrows a pointer to its words.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u64>,
}

impl Bitmap {
    pub fn map_layout(num_bits: usize) -> Result<Layout, LayoutError> {
        Layout::array::<u64>(Self::num_words(num_bits))
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits are cleared.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::num_words(num_bits)` words, and it must be properly
    ///   aligned.
    /// - No other pointer may be used to access that memory while the
    ///   returned `Bitmap` exists.
    pub unsafe fn new(num_bits: usize, map: NonNull<u64>) -> Bitmap {
        assert!(num_bits > 0);
        assert_eq!(map.as_ptr().align_offset(mem::align_of::<u64>()), 0);

        let mut bitmap = Bitmap { num_bits, map };
        bitmap.clear();
        bitmap
    }

    #[inline]
    pub fn num_words(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        // SAFETY: `word_idx < num_words(num_bits)`, which `new` guarantees is
        // in bounds of the map.
        unsafe { (self.map.as_ptr().add(word_idx).read() & mask) != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let word_ptr = self.map.as_ptr().add(word_idx);
            let word = word_ptr.read();
            word_ptr.write(if value { word | mask } else { word & !mask });
        }
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        let num_words = Self::num_words(self.num_bits);

        // SAFETY: the map is valid for `num_words` words.
        unsafe { self.map.as_ptr().write_bytes(0, num_words) };
    }

    /// Returns the number of set bits.
    #[cfg(test)]
    pub fn count_ones(&self) -> usize {
        (0..Self::num_words(self.num_bits))
            .map(|i| unsafe { self.map.as_ptr().add(i).read() }.count_ones() as usize)
            .sum()
    }
}

/// The set of levels whose free lists are non-empty.
///
/// Bit `i` is set iff level `i` has at least one free block.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct LevelMask(u64);

impl LevelMask {
    pub const EMPTY: LevelMask = LevelMask(0);

    /// The mask containing only the root level.
    pub const ROOT: LevelMask = LevelMask(1);

    #[inline]
    pub fn insert(&mut self, level: usize) {
        self.0 |= 1 << level;
    }

    #[inline]
    pub fn remove(&mut self, level: usize) {
        self.0 &= !(1 << level);
    }

    #[inline]
    pub fn contains(self, level: usize) -> bool {
        (self.0 & (1 << level)) != 0
    }

    /// Returns the deepest level at or above `target` (i.e. with a level
    /// number `<= target`) that has a free block.
    #[inline]
    pub fn nearest_at_or_above(self, target: usize) -> Option<usize> {
        let below_or_at = if target + 1 >= u64::BITS as usize {
            self.0
        } else {
            self.0 & ((1 << (target + 1)) - 1)
        };

        (below_or_at != 0).then(|| (u64::BITS - 1 - below_or_at.leading_zeros()) as usize)
    }
}
