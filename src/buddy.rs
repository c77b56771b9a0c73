//! Binary-buddy allocation.
//!
//! A buddy allocator views its region as a complete binary tree of blocks.
//! The root (level 0) spans the whole region, and each deeper level halves
//! the block size, down to the minimum block size. A request is rounded up to
//! the nearest block size; if no block of that size is free, the nearest
//! larger free block is split in half repeatedly until one is. When a block
//! is freed and its buddy (the other half of the same parent) is also free,
//! the two are merged, and merging continues up the tree.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(levels)  |
//! | Free                     | O(1)      | O(levels)  |
//! | Reset                    | O(size)   | O(size)    |
//!
//! Finding the nearest non-empty level is a single bit scan.
//!
//! #### Fragmentation
//!
//! Every request is rounded up to a power of two, so internal fragmentation
//! is at most half of each block. External fragmentation is limited by
//! coalescing, but a single live block keeps its buddy from merging.
//!
//! ## Memory layout
//!
//! One backing allocation holds a metadata prefix followed by the region.
//! Free blocks store their free-list links in their own first bytes, so the
//! only per-block bookkeeping outside the region is one bit per tree node and
//! one byte per minimum-size slot.

use core::{cmp, fmt, ptr::NonNull, slice};

use log::{debug, trace, warn};

use crate::{
    bitmap::LevelMask,
    geometry::{Geometry, DEFAULT_MIN_BLOCK_SIZE},
    metadata::{BackingLayout, Metadata},
    usage::Usage,
    AllocError, AllocInitError, BackingAllocator, BasePtr, BlockLink, Global,
};

/// A block handed out by a [`BuddyAllocator`].
///
/// A `Block` names its memory by offset from the start of the region. It is
/// neither `Clone` nor `Copy`, so each allocation has exactly one handle,
/// which is consumed by [`BuddyAllocator::free`]. Dropping a `Block` without
/// freeing it leaks the block until the next [`BuddyAllocator::reset`].
#[must_use = "dropping a `Block` leaks it until the allocator is reset"]
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    offset: usize,
    level: usize,
    size: usize,
}

impl Block {
    /// The offset of the block from the start of the region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The level of the block; level 0 is the whole region.
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    /// The size of the block in bytes.
    ///
    /// This is the request rounded up to a block size, and may be larger than
    /// what was requested.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The backing memory of an initialized allocator and the free lists threaded
/// through it.
struct Region {
    /// Start of the backing allocation.
    raw: NonNull<u8>,
    base: BasePtr,
    meta: Metadata,
    free_levels: LevelMask,
    geometry: Geometry,
}

impl Region {
    /// # Safety
    ///
    /// `raw` must point to an allocation that satisfies `layout.layout`, is
    /// valid for reads and writes for its whole size, and is not accessed by
    /// any other means while the returned `Region` exists.
    unsafe fn new(raw: NonNull<u8>, layout: &BackingLayout, geometry: Geometry) -> Region {
        let meta = unsafe { Metadata::new(raw, layout, &geometry) };
        let region_ptr = unsafe { raw.add(layout.region_offset) };

        let mut region = Region {
            raw,
            base: BasePtr::new(region_ptr, geometry.total_size()),
            meta,
            free_levels: LevelMask::EMPTY,
            geometry,
        };
        region.reset();
        region
    }

    /// Returns the region to a single free root block.
    fn reset(&mut self) {
        self.meta.reset();
        self.free_levels = LevelMask::EMPTY;
        self.put_block(0, 0);

        debug_assert_eq!(self.free_levels, LevelMask::ROOT);
    }

    /// Pops the head of `level`'s free list and marks it taken.
    fn get_block(&mut self, level: usize) -> usize {
        let head = self
            .meta
            .head(level)
            .expect("get_block called on an empty free list");

        // SAFETY: `head` is on the free list, so it holds an initialized link.
        let next = unsafe { self.base.link_mut(head).next };

        if let Some(n) = next {
            // SAFETY: `n` is on the same free list.
            unsafe { self.base.link_mut(n).prev = None };
        }

        self.meta.set_head(level, next);
        if next.is_none() {
            self.free_levels.remove(level);
        }

        let offset = self.base.offset_to(head);
        self.meta
            .set_node(self.geometry.node_index(offset, level), true);

        offset
    }

    /// Pushes the block at `offset` onto `level`'s free list.
    fn put_block(&mut self, offset: usize, level: usize) {
        let block = self.base.addr_at(offset);
        let old_head = self.meta.head(level);

        if let Some(old) = old_head {
            // SAFETY: `old` is on the free list.
            unsafe { self.base.link_mut(old).prev = Some(block) };
        }

        // SAFETY: `block` starts a block of at least the minimum block size
        // that no one else owns, and is aligned to the minimum block size.
        unsafe {
            self.base.init_link_at(
                block,
                BlockLink {
                    prev: None,
                    next: old_head,
                },
            )
        };

        self.meta.set_head(level, Some(block));
        self.free_levels.insert(level);
        self.meta
            .set_node(self.geometry.node_index(offset, level), false);
        self.meta
            .set_block_level(self.geometry.slot_of(offset), level);
    }

    /// Unlinks the block at `offset` from `level`'s free list.
    ///
    /// The block may be anywhere in the list.
    fn erase_block(&mut self, offset: usize, level: usize) {
        let block = self.base.addr_at(offset);

        let (prev, next) = {
            // SAFETY: the caller found `block` free on `level`.
            let removed = unsafe { self.base.link_mut(block) };
            (removed.prev, removed.next)
        };

        match prev {
            // Link `prev` forward to `next`.
            Some(p) => unsafe { self.base.link_mut(p).next = next },

            // If there's no previous block, then `block` is the head of the
            // free list.
            None => self.meta.set_head(level, next),
        }

        if let Some(n) = next {
            // Link `next` back to `prev`.
            unsafe { self.base.link_mut(n).prev = prev };
        }

        if self.meta.head(level).is_none() {
            self.free_levels.remove(level);
        }
    }

    /// Splits a free block on `from` until a block on `to` is produced, then
    /// takes that block.
    fn split_down(&mut self, from: usize, to: usize) -> usize {
        let mut level = from;

        while level != to {
            let offset = self.get_block(level);
            level += 1;

            // Push the back half first so the front half is taken next.
            let back = self.geometry.buddy_of(offset, level);
            self.put_block(back, level);
            self.put_block(offset, level);

            trace!("split block at {offset:#x} into level {level}");
        }

        self.get_block(to)
    }

    /// Merges the taken block at `offset` on `level` with free buddies for as
    /// long as possible.
    ///
    /// Returns the offset and level of the merged block, which is not yet on
    /// any free list.
    fn coalesce(&mut self, mut offset: usize, mut level: usize) -> (usize, usize) {
        while level > 0 {
            let buddy = self.geometry.buddy_of(offset, level);
            let buddy_taken = self.meta.node(self.geometry.node_index(buddy, level));

            if buddy_taken {
                break;
            }

            self.erase_block(buddy, level);

            // The node at `offset` no longer exists on its own.
            self.meta
                .set_node(self.geometry.node_index(offset, level), false);

            offset = cmp::min(offset, buddy);
            level -= 1;
            self.meta
                .set_block_level(self.geometry.slot_of(offset), level);

            trace!("merged buddies at {offset:#x} into level {level}");
        }

        (offset, level)
    }

    /// Returns whether a block on `level` starting at `offset` is currently
    /// handed out.
    fn is_live(&self, offset: usize, level: usize) -> bool {
        level < self.geometry.levels()
            && offset < self.geometry.total_size()
            && offset % self.geometry.block_size(level) == 0
            && self.meta.node(self.geometry.node_index(offset, level))
            && self.meta.block_level(self.geometry.slot_of(offset)) == level
    }

    fn free_list_len(&self, level: usize) -> usize {
        let mut len = 0;
        let mut cur = self.meta.head(level);

        while let Some(c) = cur {
            len += 1;
            // SAFETY: `c` is on the free list.
            cur = unsafe { self.base.link_mut(c).next };
        }

        len
    }

    #[cfg(test)]
    fn metadata_bytes(&self, layout: &BackingLayout) -> &[u8] {
        // The backing memory starts out zeroed and the prefix is only written
        // with plain integers, so every byte is initialized.
        unsafe { slice::from_raw_parts(self.raw.as_ptr(), layout.metadata.size()) }
    }
}

/// A binary-buddy allocator over a single region.
///
/// The region holds `total_size` bytes and is split into blocks of at least
/// `min_block_size` bytes; both must be powers of two, with
/// `total_size > min_block_size >= 16`.
///
/// Constructing the allocator only validates and computes its geometry. The
/// backing memory is acquired from the [`BackingAllocator`] by the first call
/// to [`init`], and released when the allocator is dropped.
///
/// ```
/// use buddy_region::BuddyAllocator;
///
/// let mut buddy = BuddyAllocator::try_new(1024)?;
/// buddy.init()?;
///
/// let block = buddy.allocate(100, 0).expect("a fresh region has room");
/// assert_eq!(block.size(), 128);
///
/// buddy.bytes_mut(&block).fill(0xAB);
/// buddy.free(block);
///
/// assert_eq!(buddy.usage().used(), 0);
/// assert_eq!(buddy.allocate(1024, 0).map(|b| b.offset()), Ok(0));
/// # Ok::<(), buddy_region::AllocInitError>(())
/// ```
///
/// [`init`]: BuddyAllocator::init
pub struct BuddyAllocator<A: BackingAllocator = Global> {
    geometry: Geometry,
    layout: BackingLayout,
    region: Option<Region>,
    usage: Usage,
    backing_allocator: A,
}

impl BuddyAllocator<Global> {
    /// Constructs a new `BuddyAllocator` over `total_size` bytes with the
    /// default minimum block size, backed by the global allocator.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. See [`try_new`] for a
    /// non-panicking version.
    ///
    /// [`try_new`]: BuddyAllocator::try_new
    pub fn new(total_size: usize) -> BuddyAllocator<Global> {
        Self::try_new(total_size).unwrap_or_else(|e| panic!("buddy allocator: {e}"))
    }

    /// Constructs a new `BuddyAllocator` over `total_size` bytes with the
    /// default minimum block size, backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig(_))` if `total_size` is not
    /// a power of two larger than the default minimum block size.
    pub fn try_new(total_size: usize) -> Result<BuddyAllocator<Global>, AllocInitError> {
        Self::try_with_min_block_size(total_size, DEFAULT_MIN_BLOCK_SIZE)
    }

    /// Constructs a new `BuddyAllocator` over `total_size` bytes whose
    /// smallest blocks hold `min_block_size` bytes, backed by the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig(_))` if either size is not a
    /// power of two, `min_block_size` is below [`MIN_BLOCK_SIZE_FLOOR`], or
    /// `total_size <= min_block_size`.
    ///
    /// [`MIN_BLOCK_SIZE_FLOOR`]: crate::MIN_BLOCK_SIZE_FLOOR
    pub fn try_with_min_block_size(
        total_size: usize,
        min_block_size: usize,
    ) -> Result<BuddyAllocator<Global>, AllocInitError> {
        Self::try_new_in(total_size, min_block_size, Global)
    }
}

impl<A: BackingAllocator> BuddyAllocator<A> {
    /// Constructs a new `BuddyAllocator` whose backing memory will come from
    /// `backing_allocator`.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig(_))` under the same
    /// conditions as [`try_with_min_block_size`].
    ///
    /// [`try_with_min_block_size`]: BuddyAllocator::try_with_min_block_size
    pub fn try_new_in(
        total_size: usize,
        min_block_size: usize,
        backing_allocator: A,
    ) -> Result<BuddyAllocator<A>, AllocInitError> {
        let geometry = Geometry::new(total_size, min_block_size)?;
        let layout = BackingLayout::new(&geometry)?;

        Ok(BuddyAllocator {
            geometry,
            layout,
            region: None,
            usage: Usage::new(total_size),
            backing_allocator,
        })
    }

    /// Acquires the backing memory if necessary and resets the allocator.
    ///
    /// The first call allocates the metadata and the region in one block.
    /// Later calls only [`reset`], discarding every outstanding allocation.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::AllocFailed(layout))` if the backing
    /// allocator cannot provide the memory.
    ///
    /// [`reset`]: BuddyAllocator::reset
    pub fn init(&mut self) -> Result<(), AllocInitError> {
        if self.region.is_none() {
            let layout = self.layout.layout;
            let raw = self.backing_allocator.allocate_zeroed(layout).ok_or_else(|| {
                warn!(
                    "failed to acquire {} bytes for a {}-byte buddy region",
                    layout.size(),
                    self.geometry.total_size()
                );
                AllocInitError::AllocFailed(layout)
            })?;

            debug!(
                "acquired {} bytes ({} of metadata) for {} levels over {} bytes",
                layout.size(),
                self.layout.metadata.size(),
                self.geometry.levels(),
                self.geometry.total_size()
            );

            // SAFETY: `raw` was just allocated with `self.layout.layout` and is
            // owned by this allocator until drop.
            self.region = Some(unsafe { Region::new(raw, &self.layout, self.geometry) });
        }

        self.reset();
        Ok(())
    }

    /// Returns the whole region to a single free block.
    ///
    /// Every outstanding [`Block`] is invalidated; freeing or accessing one
    /// afterwards panics unless an equal block has been allocated since. The
    /// backing memory is kept. Does nothing before [`init`].
    ///
    /// [`init`]: BuddyAllocator::init
    pub fn reset(&mut self) {
        if let Some(region) = self.region.as_mut() {
            region.reset();
            debug!("reset buddy region of {} bytes", self.geometry.total_size());
        }

        self.usage.clear();
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// `align` is the required alignment of the block's address; `0` means no
    /// requirement. Raising the request to at least `align` bytes is enough
    /// to align it, since every block is aligned to its own size up to the
    /// region's alignment.
    ///
    /// The contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError)` if:
    /// - `size` is zero,
    /// - `align` is not zero or a power of two, or exceeds the region's
    ///   alignment,
    /// - `size` exceeds the region, or
    /// - no free block is large enough, including when the allocator has not
    ///   been initialized.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Block, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let align = cmp::max(align, 1);
        if !align.is_power_of_two() || align > self.geometry.region_align() {
            return Err(AllocError);
        }

        let target = self
            .geometry
            .level_for(cmp::max(size, align))
            .ok_or(AllocError)?;

        let region = self.region.as_mut().ok_or(AllocError)?;
        let found = region
            .free_levels
            .nearest_at_or_above(target)
            .ok_or(AllocError)?;

        let block_size = self.geometry.block_size(target);
        self.usage.grant(block_size);

        let offset = region.split_down(found, target);
        trace!("allocated {block_size} bytes at {offset:#x} for a request of {size}");

        Ok(Block {
            offset,
            level: target,
            size: block_size,
        })
    }

    /// Frees `block`, merging it with free buddies.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name a block currently allocated by this
    /// allocator.
    pub fn free(&mut self, block: Block) {
        let Block { offset, level, size } = block;

        let region = self.region.as_mut().expect("free on an uninitialized allocator");
        assert!(
            region.is_live(offset, level),
            "free of a block that is not allocated"
        );

        let level = region.meta.block_level(self.geometry.slot_of(offset));
        self.usage.release(self.geometry.block_size(level));

        let (merged, merged_level) = region.coalesce(offset, level);
        region.put_block(merged, merged_level);

        trace!("freed {size} bytes at {offset:#x}, now free on level {merged_level}");
    }

    /// Returns a pointer to the memory of `block`.
    ///
    /// The pointer is valid until `block` is freed, the allocator is reset,
    /// or the allocator is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name a block currently allocated by this
    /// allocator.
    pub fn block_ptr(&self, block: &Block) -> NonNull<[u8]> {
        let region = self.live_region(block);

        region.base.slice_at(block.offset, block.size)
    }

    /// Returns the memory of `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name a block currently allocated by this
    /// allocator.
    pub fn bytes(&self, block: &Block) -> &[u8] {
        let ptr = self.block_ptr(block);

        // SAFETY: the block is live, so no link lives in it; its bytes are
        // initialized because the backing memory was zeroed and only ever
        // written with plain integers. `&self` prevents concurrent writes.
        unsafe { slice::from_raw_parts(ptr.cast::<u8>().as_ptr(), ptr.len()) }
    }

    /// Returns the memory of `block` mutably.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name a block currently allocated by this
    /// allocator.
    pub fn bytes_mut(&mut self, block: &Block) -> &mut [u8] {
        let ptr = self.block_ptr(block);

        // SAFETY: as in `bytes`; `&mut self` makes this the only access.
        unsafe { slice::from_raw_parts_mut(ptr.cast::<u8>().as_ptr(), ptr.len()) }
    }

    fn live_region(&self, block: &Block) -> &Region {
        let region = self
            .region
            .as_ref()
            .expect("block access on an uninitialized allocator");
        assert!(
            region.is_live(block.offset, block.level),
            "access to a block that is not allocated"
        );

        region
    }

    /// Returns the byte counters of the region.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The size of the managed region in bytes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.geometry.total_size()
    }

    /// The size of the smallest blocks in bytes.
    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.geometry.min_block_size()
    }

    /// The number of levels, from the whole region down to the smallest
    /// blocks.
    #[inline]
    pub fn levels(&self) -> usize {
        self.geometry.levels()
    }

    /// The size of the blocks on `level`, or `None` if there is no such level.
    pub fn block_size(&self, level: usize) -> Option<usize> {
        (level < self.geometry.levels()).then(|| self.geometry.block_size(level))
    }

    /// The size of the metadata prefix in bytes.
    #[inline]
    pub fn metadata_size(&self) -> usize {
        self.layout.metadata.size()
    }

    /// Whether the backing memory has been acquired.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// The number of free blocks on `level`.
    ///
    /// This walks the level's free list.
    pub fn free_blocks(&self, level: usize) -> usize {
        match self.region.as_ref() {
            Some(r) if level < self.geometry.levels() && r.free_levels.contains(level) => {
                r.free_list_len(level)
            }
            _ => 0,
        }
    }
}

impl<A: BackingAllocator> Drop for BuddyAllocator<A> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            unsafe {
                self.backing_allocator
                    .deallocate(region.raw, self.layout.layout)
            };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("BuddyAllocator");
        s.field("total_size", &self.geometry.total_size())
            .field("min_block_size", &self.geometry.min_block_size())
            .field("levels", &self.geometry.levels())
            .field("usage", &self.usage);

        match self.region.as_ref() {
            Some(r) => s.field("free_levels", &r.free_levels),
            None => s.field("free_levels", &LevelMask::EMPTY),
        };

        s.finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::{alloc::Layout, cell::Cell};
    use std::prelude::rust_2021::*;

    use super::*;
    use crate::ConfigError;

    fn buddy(total_size: usize, min_block_size: usize) -> BuddyAllocator {
        let mut b = BuddyAllocator::try_with_min_block_size(total_size, min_block_size).unwrap();
        b.init().unwrap();
        b
    }

    fn recorded_level(b: &BuddyAllocator, offset: usize) -> usize {
        let region = b.region.as_ref().unwrap();
        region.meta.block_level(b.geometry.slot_of(offset))
    }

    #[test]
    fn invalid_configs_are_errors() {
        for (t, m, e) in [
            (1000, 16, ConfigError::NotPowerOfTwo),
            (1024, 8, ConfigError::MinBlockTooSmall),
            (16, 16, ConfigError::RegionTooSmall),
        ] {
            assert_eq!(
                BuddyAllocator::try_with_min_block_size(t, m).unwrap_err(),
                AllocInitError::InvalidConfig(e)
            );
        }
    }

    #[test]
    #[should_panic]
    fn new_panics_on_invalid_config() {
        let _ = BuddyAllocator::new(100);
    }

    #[test]
    fn whole_region_then_nothing() {
        for log_t in 5..=16 {
            for log_m in 4..log_t {
                let t = 1 << log_t;
                let m = 1 << log_m;
                let mut b = buddy(t, m);

                let whole = b.allocate(t, 0).unwrap();
                assert_eq!(whole.offset(), 0);
                assert_eq!(whole.level(), 0);
                assert_eq!(b.allocate(1, 0), Err(AllocError));

                b.free(whole);
                assert_eq!(b.allocate(1, 0).unwrap().size(), m);
            }
        }
    }

    #[test]
    fn uninitialized_allocator_refuses() {
        let mut b = BuddyAllocator::new(1024);
        assert!(!b.is_initialized());
        assert_eq!(b.allocate(16, 0), Err(AllocError));
        assert_eq!(b.free_blocks(0), 0);

        b.reset();
        assert!(!b.is_initialized());
        assert_eq!(b.usage().used(), 0);
    }

    #[test]
    fn reverse_free_restores_root() {
        let mut b = buddy(1024, 16);

        let blocks: Vec<Block> = (0..4).map(|_| b.allocate(256, 0).unwrap()).collect();
        let mut offsets: Vec<usize> = blocks.iter().map(Block::offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, [0, 256, 512, 768]);
        assert_eq!(b.allocate(16, 0), Err(AllocError));

        for block in blocks.into_iter().rev() {
            b.free(block);
        }

        assert_eq!(b.free_blocks(0), 1);
        assert_eq!(b.region.as_ref().unwrap().meta.taken_nodes(), 0);
        let whole = b.allocate(1024, 0).unwrap();
        assert_eq!(whole.offset(), 0);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut b = buddy(512, 16);
        let _leaked = b.allocate(48, 0).unwrap();
        let _also_leaked = b.allocate(16, 0).unwrap();

        b.reset();
        let once: Vec<u8> = {
            let r = b.region.as_ref().unwrap();
            r.metadata_bytes(&b.layout).to_vec()
        };
        let mask_once = b.region.as_ref().unwrap().free_levels;

        b.reset();
        let r = b.region.as_ref().unwrap();
        assert_eq!(r.metadata_bytes(&b.layout), &once[..]);
        assert_eq!(r.free_levels, mask_once);
        assert_eq!(r.free_levels, LevelMask::ROOT);
        assert_eq!(b.usage(), Usage::new(512));
    }

    #[test]
    fn init_twice_keeps_memory() {
        let mut b = buddy(256, 16);
        let raw = b.region.as_ref().unwrap().raw;

        let _leaked = b.allocate(64, 0).unwrap();
        b.init().unwrap();

        assert_eq!(b.region.as_ref().unwrap().raw, raw);
        assert_eq!(b.usage().used(), 0);
        assert_eq!(b.allocate(256, 0).unwrap().offset(), 0);
    }

    #[test]
    fn boundaries() {
        let mut b = buddy(1024, 16);

        assert_eq!(b.allocate(0, 0), Err(AllocError));
        assert_eq!(b.usage().used(), 0);
        assert_eq!(b.usage().peak(), 0);

        assert_eq!(b.allocate(1025, 0), Err(AllocError));
        assert_eq!(b.allocate(usize::MAX, 0), Err(AllocError));

        // Every minimum-size block can be handed out.
        let mut blocks = Vec::new();
        for _ in 0..64 {
            blocks.push(b.allocate(16, 0).unwrap());
        }
        assert_eq!(b.allocate(16, 0), Err(AllocError));
        assert_eq!(b.usage().used(), 1024);

        let last = blocks.pop().unwrap();
        b.free(last);
        assert!(b.allocate(16, 0).is_ok());
    }

    #[test]
    fn split_children_are_buddies() {
        let mut b = buddy(1024, 16);

        // Splits the root into two 512-byte children and takes the front one.
        let front = b.allocate(512, 0).unwrap();
        assert_eq!(front.level(), 1);
        assert_eq!(b.free_blocks(1), 1);

        let back = b.allocate(512, 0).unwrap();
        assert_eq!(front.offset() ^ back.offset(), 512);
        assert_eq!((front.offset() ^ back.offset()).count_ones(), 1);
        assert_eq!(recorded_level(&b, front.offset()), 1);
        assert_eq!(recorded_level(&b, back.offset()), 1);

        b.free(front);
        b.free(back);

        // Deeper splits: every level records its child level.
        let small = b.allocate(64, 0).unwrap();
        for level in 1..=small.level() {
            let size = b.block_size(level).unwrap();
            let sibling = small.offset() ^ size;
            assert_eq!(recorded_level(&b, sibling), level);
            assert_eq!(b.free_blocks(level), 1);
        }
        assert_eq!(recorded_level(&b, small.offset()), small.level());
    }

    #[test]
    fn peak_tracks_the_high_water_mark() {
        let mut b = buddy(1024, 16);

        let a = b.allocate(100, 0).unwrap();
        let c = b.allocate(300, 0).unwrap();
        assert_eq!(b.usage().used(), 128 + 512);

        b.free(a);
        b.free(c);
        assert_eq!(b.usage().used(), 0);
        assert_eq!(b.usage().peak(), 640);

        let d = b.allocate(16, 0).unwrap();
        assert_eq!(b.usage().peak(), 640);
        b.free(d);
        assert_eq!(b.usage().peak(), 640);
    }

    #[test]
    fn coalescing_scenario() {
        // T = 256, m = 16: five levels.
        let mut b = buddy(256, 16);
        assert_eq!(b.levels(), 5);

        let a = b.allocate(16, 0).unwrap();
        let c = b.allocate(16, 0).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(c.offset(), 16);

        // 16 is still allocated, so 0 stays a lone 16-byte block.
        b.free(a);
        assert_eq!(b.free_blocks(4), 1);
        assert_eq!(b.free_blocks(3), 1);

        // The 32-byte request cannot use 0..32; it takes the untouched 32..64.
        let d = b.allocate(32, 0).unwrap();
        assert_eq!(d.offset(), 32);
        b.free(d);

        b.free(c);
        assert_eq!(b.free_blocks(0), 1);
        for level in 1..5 {
            assert_eq!(b.free_blocks(level), 0);
        }

        let e = b.allocate(32, 0).unwrap();
        assert_eq!(e.offset(), 0);
    }

    #[test]
    fn half_freed_pair_does_not_coalesce() {
        let mut b = buddy(256, 16);

        // Fill the region with 16-byte blocks.
        let mut blocks: Vec<Block> = (0..16).map(|_| b.allocate(16, 0).unwrap()).collect();
        blocks.sort_by_key(Block::offset);

        let rest = blocks.split_off(2);
        let mut first_pair = blocks.into_iter();
        let at_0 = first_pair.next().unwrap();
        let at_16 = first_pair.next().unwrap();

        b.free(at_0);
        assert_eq!(b.allocate(32, 0), Err(AllocError));

        b.free(at_16);
        assert_eq!(b.allocate(32, 0).unwrap().offset(), 0);

        drop(rest);
    }

    #[test]
    fn nearest_level_is_split() {
        let mut b = buddy(1024, 16);

        // Leaves free blocks of 512, 256, 128 and 64 bytes.
        let _small = b.allocate(64, 0).unwrap();

        // A 100-byte request should take the 128-byte block without touching
        // the larger ones.
        let mid = b.allocate(100, 0).unwrap();
        assert_eq!(mid.size(), 128);
        assert_eq!(mid.offset(), 128);
        assert_eq!(b.free_blocks(1), 1);
        assert_eq!(b.free_blocks(2), 1);
    }

    #[test]
    fn alignment_is_honored() {
        let mut b = buddy(4096, 16);

        let _pad = b.allocate(16, 0).unwrap();
        let aligned = b.allocate(16, 256).unwrap();
        assert_eq!(aligned.size(), 256);
        assert_eq!(aligned.offset() % 256, 0);

        let ptr = b.block_ptr(&aligned).cast::<u8>();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);

        assert_eq!(b.allocate(16, 3), Err(AllocError));
        assert_eq!(b.allocate(16, 8192), Err(AllocError));
    }

    #[test]
    fn block_memory_is_usable() {
        let mut b = buddy(1024, 16);

        let x = b.allocate(40, 0).unwrap();
        let y = b.allocate(40, 0).unwrap();
        b.bytes_mut(&x).fill(0x11);
        b.bytes_mut(&y).fill(0x22);

        assert_eq!(b.bytes(&x).len(), 64);
        assert!(b.bytes(&x).iter().all(|&v| v == 0x11));
        assert!(b.bytes(&y).iter().all(|&v| v == 0x22));

        b.free(x);
        let z = b.allocate(16, 0).unwrap();
        b.bytes_mut(&z).fill(0x33);
        assert!(b.bytes(&y).iter().all(|&v| v == 0x22));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_panics() {
        let mut b = buddy(256, 16);
        let a = b.allocate(16, 0).unwrap();
        let forged = Block {
            offset: a.offset(),
            level: a.level(),
            size: a.size(),
        };

        b.free(a);
        b.free(forged);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn stale_block_after_reset_panics() {
        let mut b = buddy(256, 16);
        let a = b.allocate(32, 0).unwrap();

        b.reset();
        let _ = b.bytes(&a);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn merged_away_block_is_not_live() {
        let mut b = buddy(256, 16);
        let a = b.allocate(16, 0).unwrap();
        let forged = Block {
            offset: 16,
            level: 4,
            size: 16,
        };

        // Everything merges back into the root; the node at 16 is gone.
        b.free(a);
        b.free(forged);
    }

    #[test]
    fn split_parents_are_not_live() {
        let mut b = buddy(256, 16);
        let _a = b.allocate(16, 0).unwrap();

        let region = b.region.as_ref().unwrap();
        for level in 0..4 {
            assert!(!region.is_live(0, level));
        }
        assert!(region.is_live(0, 4));
        assert!(!region.is_live(16, 4));
        assert!(!region.is_live(256, 0));
    }

    /// Counts live backing allocations and can refuse to allocate.
    struct CountingBacking<'a> {
        live: &'a Cell<isize>,
        fail: bool,
    }

    unsafe impl BackingAllocator for CountingBacking<'_> {
        fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
            if self.fail {
                return None;
            }

            self.live.set(self.live.get() + 1);
            Global.allocate_zeroed(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.set(self.live.get() - 1);
            unsafe { Global.deallocate(ptr, layout) };
        }
    }

    #[test]
    fn backing_memory_is_acquired_once_and_released_once() {
        let live = Cell::new(0);

        {
            let backing = CountingBacking {
                live: &live,
                fail: false,
            };
            let mut b = BuddyAllocator::try_new_in(1024, 16, backing).unwrap();
            assert_eq!(live.get(), 0);

            b.init().unwrap();
            b.init().unwrap();
            b.reset();
            assert_eq!(live.get(), 1);
        }
        assert_eq!(live.get(), 0);

        {
            let backing = CountingBacking {
                live: &live,
                fail: false,
            };
            let _never_initialized = BuddyAllocator::try_new_in(1024, 16, backing).unwrap();
        }
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn backing_failure_is_reported() {
        let live = Cell::new(0);
        let backing = CountingBacking {
            live: &live,
            fail: true,
        };
        let mut b = BuddyAllocator::try_new_in(1024, 16, backing).unwrap();

        match b.init() {
            Err(AllocInitError::AllocFailed(layout)) => {
                assert_eq!(layout, b.layout.layout);
                assert!(layout.size() >= b.metadata_size() + 1024);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!b.is_initialized());
        assert_eq!(b.allocate(16, 0), Err(AllocError));
    }
}
