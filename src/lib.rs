#![allow(clippy::missing_safety_doc)]

//! Thread-caching allocator.
//!
//! Small requests are served from per-thread slot caches that refill from and
//! drain to a central heap of 64 KiB spans. Every thread's cache is flushed
//! exactly once when it exits, whether or not the thread was created through
//! this crate. Large requests map their own regions.
//!
//! Use [`Allocator`] as a `#[global_allocator]`, call the [`api`] functions
//! directly, or build with `--features c_api` to export the C malloc family
//! and `pthread_create`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};

#[macro_use]
mod log;

pub mod api;
mod central;
pub mod config;
mod directory;
pub mod error;
pub mod lifecycle;
mod platform;
pub mod size_class;
mod span;
pub mod stats;
mod sync;
pub mod thread_cache;

pub use error::AllocError;
pub use lifecycle::{NativeSpawner, SpawnedThread, ThreadSpawner};
pub use stats::{HeapStats, class_free_slots, class_outstanding, snapshot};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SIZE: usize = 4096;

pub const SPAN_SIZE_BITS: usize = 16;
pub const SPAN_SIZE: usize = 1 << SPAN_SIZE_BITS; // 64KB

/// Alignment of every block the allocator hands out.
pub const MIN_ALIGN: usize = 16;

const _: () = assert!(SPAN_SIZE.is_power_of_two());
const _: () = assert!(SPAN_SIZE % PAGE_SIZE == 0);
const _: () = assert!(size_class::class_to_size(0) == MIN_ALIGN);
const _: () = assert!(size_class::CLASSES_MAX_SIZE <= SPAN_SIZE / 2);

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    api::allocate(layout.size(), layout.align()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { api::free(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return unsafe { api::realloc(ptr, new_size) };
    }

    let Ok(fresh) = api::allocate(new_size, layout.align()) else {
      return null_mut();
    };
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), layout.size().min(new_size));
      api::free(ptr);
    }
    fresh.as_ptr()
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return api::calloc(1, layout.size());
    }
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
