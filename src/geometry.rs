//! Level geometry: how a region of `total_size` bytes divides into levels of
//! power-of-two blocks.

use core::cmp;

use crate::ConfigError;

/// The minimum block size used when none is given.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 16;

/// The smallest permitted minimum block size.
///
/// Every free block stores two address-sized links inside itself.
pub const MIN_BLOCK_SIZE_FLOOR: usize = 16;

/// The largest alignment of the managed region.
///
/// The region is aligned to `min(total_size, MAX_REGION_ALIGN)`.
pub const MAX_REGION_ALIGN: usize = 4096;

/// Returns `log2(n)` for a power of two `n`.
#[inline]
pub fn log2_exact(n: usize) -> u32 {
    debug_assert!(n.is_power_of_two());

    n.trailing_zeros()
}

/// The validated shape of a buddy tree.
///
/// Level 0 is the whole region; level `levels - 1` holds blocks of
/// `min_block_size` bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    total_size: usize,
    min_block_size: usize,
    levels: usize,
}

impl Geometry {
    pub fn new(total_size: usize, min_block_size: usize) -> Result<Geometry, ConfigError> {
        if !total_size.is_power_of_two() || !min_block_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo);
        }

        if min_block_size < MIN_BLOCK_SIZE_FLOOR {
            return Err(ConfigError::MinBlockTooSmall);
        }

        if total_size <= min_block_size {
            return Err(ConfigError::RegionTooSmall);
        }

        let levels = (log2_exact(total_size) - log2_exact(min_block_size) + 1) as usize;

        Ok(Geometry {
            total_size,
            min_block_size,
            levels,
        })
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    #[inline]
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// The alignment of the managed region.
    #[inline]
    pub fn region_align(&self) -> usize {
        cmp::min(self.total_size, MAX_REGION_ALIGN)
    }

    /// The size of each block at `level`.
    #[inline]
    pub fn block_size(&self, level: usize) -> usize {
        assert!(level < self.levels);

        self.total_size >> level
    }

    /// Returns the level whose blocks are the smallest that can hold `size`
    /// bytes, or `None` if `size` exceeds the region.
    pub fn level_for(&self, size: usize) -> Option<usize> {
        if size > self.total_size {
            return None;
        }

        if size <= self.min_block_size {
            return Some(self.levels - 1);
        }

        let alloc_size = size.checked_next_power_of_two()?;

        Some((log2_exact(self.total_size) - log2_exact(alloc_size)) as usize)
    }

    /// The number of nodes in the whole tree.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        (1 << self.levels) - 1
    }

    /// The number of minimum-size slots in the region.
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.total_size / self.min_block_size
    }

    /// The slot containing the first byte at `offset`.
    #[inline]
    pub fn slot_of(&self, offset: usize) -> usize {
        offset / self.min_block_size
    }

    /// The tree-wide index of the node starting at `offset` on `level`.
    ///
    /// Level `k` occupies indices `2^k - 1 .. 2^(k+1) - 1`.
    #[inline]
    pub fn node_index(&self, offset: usize, level: usize) -> usize {
        let block_size = self.block_size(level);
        assert_eq!(offset % block_size, 0);

        (1 << level) - 1 + offset / block_size
    }

    /// The offset of the buddy of the block at `offset` on `level`.
    #[inline]
    pub fn buddy_of(&self, offset: usize, level: usize) -> usize {
        assert!(level > 0, "the root block has no buddy");

        offset ^ self.block_size(level)
    }
}
