//! Shared-memory regions and the windows peers use to access them.
//!
//! A [`SharedRegion`] is one aligned, contiguous allocation that stands in for
//! a segment's memory. Native builds prefer anonymous `mmap` pages and fall
//! back to the heap when the mapping is not aligned well enough. Every access
//! from the rest of the workspace goes through a [`Window`]: a bounds-checked
//! view over part of a region that can be cloned and handed to the remote side
//! of a connection.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Alignment required for the 64-bit words (frame headers, cursors, handshake
/// fields) stored in a region.
pub const WORD_ALIGN: usize = 8;

/// Specifies how memory in a [`SharedRegion`] should be initialised.
#[derive(Clone, Copy, Debug)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Leave the region uninitialised.
    Uninitialized,
}

#[cfg(not(target_arch = "wasm32"))]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native(#[allow(dead_code)] NativeMap),
    Owned { layout: Layout },
}

/// Backing memory for segments, rings and registered regions.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    base: NonNull<u8>,
    backing: Backing,
}

// SAFETY: the region is plain bytes that are only touched through raw-pointer
// copies and atomics; ownership of the backing allocation never moves.
unsafe impl Send for SharedRegion {}
// SAFETY: see above. Concurrent byte copies are coordinated by the protocols
// layered on top (frame headers and cursors use acquire/release atomics).
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new region of `len` bytes aligned to `alignment`.
    ///
    /// On native builds we first try to satisfy the request via `mmap`. If the
    /// returned pointer is not suitably aligned, we transparently fall back to
    /// the heap implementation.
    pub fn new_aligned(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(region) = Self::mmap_backed(len, alignment, init)? {
                return Ok(region);
            }
        }

        Self::heap_backed(len, alignment, init)
    }

    /// Allocates a zeroed region aligned for 64-bit words.
    pub fn zeroed(len: usize) -> TransportResult<Self> {
        Self::new_aligned(len, WORD_ALIGN.max(64), RegionInit::Zeroed)
    }

    fn heap_backed(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        let ptr = unsafe {
            // SAFETY: `layout` has a non-zero size (checked in `new_aligned`).
            match init {
                RegionInit::Zeroed => alloc_zeroed(layout),
                RegionInit::Uninitialized => alloc(layout),
            }
        };

        let base = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            base,
            backing: Backing::Owned { layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(
        len: usize,
        alignment: usize,
        init: RegionInit,
    ) -> Result<Option<Self>, TransportError> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        if matches!(init, RegionInit::Zeroed) {
            unsafe {
                // SAFETY: the anonymous mapping exposes `len` bytes that can be zeroed here.
                ptr::write_bytes(ptr, 0, len)
            };
        }

        let Some(base) = NonNull::new(ptr) else {
            return Ok(None);
        };
        Ok(Some(Self {
            len,
            alignment,
            base,
            backing: Backing::Native(map),
        }))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Wraps the region so it can be shared as [`Window`]s.
    pub fn into_window(self) -> Window {
        Window::new(Arc::new(self))
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe {
            // SAFETY: callers only pass offsets within `0..=len`.
            self.base.as_ptr().add(offset)
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { layout } = &self.backing {
            unsafe {
                // SAFETY: `base` was returned by `alloc`/`alloc_zeroed` with this layout.
                dealloc(self.base.as_ptr(), *layout);
            }
        }
    }
}

/// Cloneable, bounds-checked view over part of a [`SharedRegion`].
///
/// Windows keep the region alive, so a peer that still holds a mapping can
/// never observe freed memory even if the owner already released its segment.
/// Byte accessors panic on out-of-range offsets the same way slice indexing
/// does; use [`Window::sub`] to validate untrusted ranges first.
#[derive(Clone, Debug)]
pub struct Window {
    region: Arc<SharedRegion>,
    offset: usize,
    len: usize,
}

impl Window {
    /// Creates a window spanning the entire region.
    pub fn new(region: Arc<SharedRegion>) -> Self {
        let len = region.len();
        Self {
            region,
            offset: 0,
            len,
        }
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the window covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this window inside its backing region.
    pub fn region_offset(&self) -> usize {
        self.offset
    }

    /// Returns true when both windows view the same backing region.
    pub fn same_region(&self, other: &Window) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Narrows the window to `offset..offset + len`.
    pub fn sub(&self, offset: usize, len: usize) -> TransportResult<Window> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(Window {
                region: Arc::clone(&self.region),
                offset: self.offset + offset,
                len,
            }),
            _ => Err(TransportError::OutOfBounds {
                offset,
                len,
                window: self.len,
            }),
        }
    }

    /// Splits the window into `..mid` and `mid..`.
    pub fn split_at(&self, mid: usize) -> TransportResult<(Window, Window)> {
        let head = self.sub(0, mid)?;
        let tail = self.sub(mid, self.len - mid)?;
        Ok((head, tail))
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the window.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let src = self.checked_ptr(offset, dst.len());
        unsafe {
            // SAFETY: `checked_ptr` validated the range; `dst` is a distinct
            // Rust allocation so the ranges cannot overlap.
            ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copies `src` into the window starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let dst = self.checked_ptr(offset, src.len());
        unsafe {
            // SAFETY: `checked_ptr` validated the range; `src` is a distinct
            // Rust allocation so the ranges cannot overlap.
            ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
    }

    /// Sets `len` bytes starting at `offset` to `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        let dst = self.checked_ptr(offset, len);
        unsafe {
            // SAFETY: range validated by `checked_ptr`.
            ptr::write_bytes(dst, byte, len);
        }
    }

    /// Copies the window into a freshly allocated vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read(0, &mut out);
        out
    }

    /// Borrows the 64-bit word at `offset` as an atomic.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not 8-byte aligned in the backing region or the
    /// word does not fit in the window.
    pub fn word(&self, offset: usize) -> &AtomicU64 {
        let ptr = self.checked_ptr(offset, WORD_ALIGN);
        assert!(
            ptr as usize % WORD_ALIGN == 0,
            "word at offset {offset} is not 8-byte aligned"
        );
        unsafe {
            // SAFETY: the pointer is aligned, in bounds and the region outlives
            // `&self`. `AtomicU64` has the same layout as `u64`.
            &*(ptr as *const AtomicU64)
        }
    }

    fn checked_ptr(&self, offset: usize, len: usize) -> *mut u8 {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "range {offset}+{len} exceeds window of {} bytes",
            self.len
        );
        self.region.ptr_at(self.offset + offset)
    }
}
