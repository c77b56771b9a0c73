//! A binary-buddy allocator over a single, resettable region.
//!
//! [`BuddyAllocator`] manages one contiguous region of `total_size` bytes,
//! where `total_size` is a power of two. Requests are served by halving
//! blocks until a block of the right power-of-two size is produced, and freed
//! blocks are merged with their buddy whenever the buddy is free as well.
//!
//! The allocator acquires its backing memory lazily, on the first call to
//! [`BuddyAllocator::init`], and [`BuddyAllocator::reset`] returns the whole
//! region to a single free block without touching the backing allocation.
//! This makes it suitable for per-frame or per-arena reuse.
//!
//! Allocations are handed out as [`Block`] handles rather than raw pointers.
//! Memory is reached through the allocator, which checks that the handle
//! still names a live allocation.

#![doc(html_root_url = "https://docs.rs/buddy_region/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod bitmap;
pub mod buddy;
mod geometry;
mod metadata;
mod usage;


use core::{
    alloc::Layout,
    error::Error,
    fmt, mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

pub use crate::{
    buddy::{Block, BuddyAllocator},
    geometry::{DEFAULT_MIN_BLOCK_SIZE, MAX_REGION_ALIGN, MIN_BLOCK_SIZE_FLOOR},
    usage::Usage,
};

/// The error type for allocator constructors and [`BuddyAllocator::init`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when the backing memory for the metadata and
    /// the managed region could not be acquired.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig(ConfigError),
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes of backing memory (align {})",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl Error for AllocInitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AllocInitError::AllocFailed(_) => None,
            AllocInitError::InvalidConfig(e) => Some(e),
        }
    }
}

impl From<ConfigError> for AllocInitError {
    fn from(e: ConfigError) -> Self {
        AllocInitError::InvalidConfig(e)
    }
}

/// The reason an allocator configuration was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The total size or the minimum block size is not a power of two.
    NotPowerOfTwo,
    /// The minimum block size is smaller than [`MIN_BLOCK_SIZE_FLOOR`].
    MinBlockTooSmall,
    /// The total size is not larger than the minimum block size.
    RegionTooSmall,
    /// The region and its metadata cannot be described by a [`Layout`].
    RegionTooLarge,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::NotPowerOfTwo => "sizes must be powers of two",
            ConfigError::MinBlockTooSmall => "minimum block size must be at least 16 bytes",
            ConfigError::RegionTooSmall => "total size must be larger than the minimum block size",
            ConfigError::RegionTooLarge => "region is too large to allocate",
        };

        f.write_str(msg)
    }
}

impl Error for ConfigError {}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free block can satisfy the request")
    }
}

impl Error for AllocError {}

/// Types which provide the memory that backs an allocator.
///
/// # Safety
///
/// Implementors must uphold the following invariants:
/// - A pointer returned by `allocate_zeroed(layout)` must refer to a block of
///   memory that satisfies `layout`, whose bytes are all zero, and which stays
///   valid for reads and writes until it is passed to `deallocate`.
/// - `deallocate` must accept any pointer previously returned by
///   `allocate_zeroed` together with the same layout.
pub unsafe trait BackingAllocator {
    /// Allocates zeroed memory described by `layout`.
    ///
    /// `layout` always has a non-zero size. Returns `None` on failure.
    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this
    ///   allocator, and
    /// * `layout` must be the layout that block was allocated with.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global memory allocator.
#[derive(Clone, Debug, Default)]
pub struct Global;

// SAFETY: `alloc_zeroed` returns zeroed memory fitting `layout`, which stays
// valid until it is passed to `dealloc` with the same layout.
unsafe impl BackingAllocator for Global {
    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);

        // SAFETY: `layout` has a non-zero size.
        NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// A pointer to the base of the region of memory managed by an allocator.
#[derive(Copy, Clone, Debug)]
struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    #[inline]
    fn contains_addr(self, addr: NonZeroUsize) -> bool {
        let base = self.ptr.addr().get();
        base <= addr.get() && addr.get() - base < self.extent
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    fn offset_to(self, block: NonZeroUsize) -> usize {
        block.get().checked_sub(self.ptr.addr().get()).unwrap()
    }

    /// Returns the address `offset` bytes past the base.
    #[inline]
    fn addr_at(self, offset: usize) -> NonZeroUsize {
        assert!(offset < self.extent, "offset out of region");

        // Cannot overflow: `new` checked that `base + extent` fits.
        NonZeroUsize::new(self.ptr.addr().get() + offset).unwrap()
    }

    /// Creates a pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    fn with_offset(self, offset: usize) -> NonNull<u8> {
        self.ptr.with_addr(self.addr_at(offset))
    }

    /// Initializes a `BlockLink` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - The memory at `addr` must be unallocated by the associated allocator.
    #[inline]
    unsafe fn init_link_at(self, addr: NonZeroUsize, link: BlockLink) {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(
            link.next.is_none_or(|next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.is_none_or(|prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        unsafe {
            self.ptr
                .with_addr(addr)
                .cast::<BlockLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a mutable reference to the `BlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `link` must contain a properly initialized `BlockLink` value.
    /// - The memory at `link` must be within the provenance of `self` and
    ///   unallocated by the associated allocator.
    /// - No other reference to the same `BlockLink` may be live.
    #[inline]
    unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut BlockLink {
        debug_assert!(self.contains_addr(link));

        unsafe { self.ptr.with_addr(link).cast::<BlockLink>().as_mut() }
    }

    /// Returns a pointer to the `len` bytes starting `offset` bytes past the
    /// base.
    #[inline]
    fn slice_at(self, offset: usize, len: usize) -> NonNull<[u8]> {
        assert!(len <= self.extent - offset, "slice out of region");

        NonNull::new(ptr::slice_from_raw_parts_mut(
            self.with_offset(offset).as_ptr(),
            len,
        ))
        .unwrap()
    }
}

/// A link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// linked list.
#[repr(C)]
struct BlockLink {
    // Rather than using pointers, store only the addresses of the previous and
    // next links.  This avoids accidentally violating stacked borrows; the
    // links "point to" other blocks, but by forgoing actual pointers, no borrow
    // is implied.
    //
    // NOTE: Using this method, any actual pointer to a block must be acquired
    // via the allocator base pointer, and NOT by casting these addresses
    // directly!
    prev: Option<NonZeroUsize>,
    next: Option<NonZeroUsize>,
}

// Every free block must be able to hold its own link.
const _: () = assert!(mem::size_of::<BlockLink>() <= MIN_BLOCK_SIZE_FLOOR);
