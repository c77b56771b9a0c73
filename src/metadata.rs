//! The metadata prefix of the backing allocation.
//!
//! The prefix holds, in order:
//! - the node bitmap, one bit per tree node, set while the node is allocated
//!   or split;
//! - one free-list head per level;
//! - the block-level table, one byte per minimum-size slot, recording the level
//!   of the block that starts at that slot.
//!
//! The managed region follows the prefix in the same allocation.

use core::{
    alloc::{Layout, LayoutError},
    mem,
    num::NonZeroUsize,
    ptr::NonNull,
};

use crate::{bitmap::Bitmap, geometry::Geometry, ConfigError};

/// Where each piece of the backing allocation lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BackingLayout {
    /// Layout of the whole backing allocation.
    pub layout: Layout,
    /// Layout of the metadata prefix.
    pub metadata: Layout,
    /// Offset of the free-list heads within the prefix.
    pub heads_offset: usize,
    /// Offset of the block-level table within the prefix.
    pub levels_offset: usize,
    /// Offset of the managed region within the allocation.
    pub region_offset: usize,
}

impl BackingLayout {
    pub fn new(geometry: &Geometry) -> Result<BackingLayout, ConfigError> {
        Self::try_new(geometry).map_err(|_| ConfigError::RegionTooLarge)
    }

    fn try_new(geometry: &Geometry) -> Result<BackingLayout, LayoutError> {
        let nodes = Bitmap::map_layout(geometry.num_nodes())?;
        let heads = Layout::array::<Option<NonZeroUsize>>(geometry.levels())?;
        let levels = Layout::array::<u8>(geometry.num_slots())?;

        let (metadata, heads_offset) = nodes.extend(heads)?;
        let (metadata, levels_offset) = metadata.extend(levels)?;
        let metadata = metadata.align_to(mem::align_of::<usize>())?.pad_to_align();

        let region = Layout::from_size_align(geometry.total_size(), geometry.region_align())?;
        let (layout, region_offset) = metadata.extend(region)?;

        Ok(BackingLayout {
            layout,
            metadata,
            heads_offset,
            levels_offset,
            region_offset,
        })
    }
}

/// A view of the metadata prefix.
pub struct Metadata {
    nodes: Bitmap,
    heads: NonNull<Option<NonZeroUsize>>,
    num_levels: usize,
    block_levels: NonNull<u8>,
    num_slots: usize,
}

impl Metadata {
    /// Creates a view of the metadata prefix starting at `base` and clears it.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `base` must satisfy `layout.metadata` and be valid for reads and
    ///   writes for `layout.metadata.size()` bytes.
    /// - `layout` must have been computed from `geometry`.
    /// - No other pointer may be used to access that memory while the
    ///   returned `Metadata` exists.
    pub unsafe fn new(base: NonNull<u8>, layout: &BackingLayout, geometry: &Geometry) -> Metadata {
        let (nodes, heads, block_levels) = unsafe {
            (
                Bitmap::new(geometry.num_nodes(), base.cast()),
                base.add(layout.heads_offset).cast(),
                base.add(layout.levels_offset),
            )
        };

        let mut meta = Metadata {
            nodes,
            heads,
            num_levels: geometry.levels(),
            block_levels,
            num_slots: geometry.num_slots(),
        };
        meta.reset();
        meta
    }

    /// Empties every free list and clears the node bitmap and the block-level
    /// table.
    pub fn reset(&mut self) {
        self.nodes.clear();

        for level in 0..self.num_levels {
            self.set_head(level, None);
        }

        unsafe { self.block_levels.as_ptr().write_bytes(0, self.num_slots) };
    }

    #[inline]
    pub fn head(&self, level: usize) -> Option<NonZeroUsize> {
        assert!(level < self.num_levels);

        unsafe { self.heads.as_ptr().add(level).read() }
    }

    #[inline]
    pub fn set_head(&mut self, level: usize, head: Option<NonZeroUsize>) {
        assert!(level < self.num_levels);

        unsafe { self.heads.as_ptr().add(level).write(head) };
    }

    /// Returns whether the node at `index` is allocated or split.
    #[inline]
    pub fn node(&self, index: usize) -> bool {
        self.nodes.get(index)
    }

    #[inline]
    pub fn set_node(&mut self, index: usize, taken: bool) {
        self.nodes.set(index, taken);
    }

    #[inline]
    pub fn block_level(&self, slot: usize) -> usize {
        assert!(slot < self.num_slots);

        unsafe { self.block_levels.as_ptr().add(slot).read().into() }
    }

    #[inline]
    pub fn set_block_level(&mut self, slot: usize, level: usize) {
        assert!(slot < self.num_slots);

        let level: u8 = level.try_into().expect("level does not fit in a byte");
        unsafe { self.block_levels.as_ptr().add(slot).write(level) };
    }

    /// Returns the number of nodes currently allocated or split.
    #[cfg(test)]
    pub fn taken_nodes(&self) -> usize {
        self.nodes.count_ones()
    }
}
