//! The malloc family.
//!
//! Small requests go through the calling thread's cache, everything above the
//! top size class maps its own region. Frees and size queries find the owning
//! span through the address directory, so no header precedes any block.
//!
//! These functions follow the C contracts (null on exhaustion, errno-style
//! status codes) but are plain Rust symbols; the `c_api` feature exports them
//! under their C names.

use core::ffi::c_int;
use core::ptr::{self, NonNull, null_mut};

use crate::MIN_ALIGN;
use crate::central::CENTRAL;
use crate::directory::DIRECTORY;
use crate::error::{AllocError, Result};
use crate::size_class::{CLASSES_COUNT, CLASSES_MAX_SIZE, class_for_alignment, size_to_class};
use crate::span::{SPAN_MAGIC, Span, SpanKind};
use crate::thread_cache::{alloc_small, free_small, slot_is_cached};

// =============================================================================
// Internals
// =============================================================================

/// Allocate `size` bytes aligned to `align` (a power of two).
pub(crate) fn allocate(size: usize, align: usize) -> Result<NonNull<u8>> {
  let class = if align <= MIN_ALIGN {
    size_to_class(size)
  } else {
    class_for_alignment(size, align)
  };

  if class < CLASSES_COUNT {
    alloc_small(class)
  } else {
    CENTRAL.allocate_large(size.max(1), align)
  }
}

/// Span owning the block that starts at `ptr`.
pub(crate) fn owner(ptr: *const u8) -> Result<NonNull<Span>> {
  let addr = ptr as usize;
  DIRECTORY
    .resolve(addr)
    .filter(|span| {
      let s = unsafe { span.as_ref() };
      s.magic == SPAN_MAGIC && s.is_block_start(addr)
    })
    .ok_or(AllocError::Misuse { addr })
}

/// Misuse checks run in debug builds and with `debug-checks`.
const CHECKED: bool = cfg!(any(debug_assertions, feature = "debug-checks"));

/// Foreign or interior pointers are a caller bug. Checked builds stop here;
/// release builds leave the memory alone.
#[inline]
fn report(err: AllocError) {
  if CHECKED {
    misuse!("{}", err);
  }
}

/// A small block already in this thread's cache or back on its span.
/// Slots parked in other threads' caches go unnoticed.
fn already_free(ptr: NonNull<u8>, span: NonNull<Span>) -> bool {
  let s = unsafe { span.as_ref() };
  s.kind == SpanKind::Small
    && (slot_is_cached(s.class as usize, ptr) || CENTRAL.slot_is_free(span, ptr.as_ptr() as usize))
}

#[inline]
fn set_errno(err: AllocError) {
  unsafe { *libc::__errno_location() = err.errno() };
}

unsafe fn release(ptr: NonNull<u8>, span: NonNull<Span>) {
  let s = unsafe { span.as_ref() };
  match s.kind {
    SpanKind::Small => unsafe { free_small(s.class as usize, ptr) },
    SpanKind::Large => unsafe { CENTRAL.free_large(span) },
  }
}

// =============================================================================
// Allocation
// =============================================================================

/// Zero bytes still yields a unique pointer from the smallest class.
pub fn malloc(size: usize) -> *mut u8 {
  match allocate(size, MIN_ALIGN) {
    Ok(p) => p.as_ptr(),
    Err(err) => {
      set_errno(err);
      null_mut()
    }
  }
}

pub fn calloc(count: usize, size: usize) -> *mut u8 {
  let Some(total) = count.checked_mul(size) else {
    set_errno(AllocError::Exhausted { bytes: usize::MAX });
    return null_mut();
  };

  let p = malloc(total);
  // Large regions are fresh mappings and already zero.
  if !p.is_null() && total <= CLASSES_MAX_SIZE {
    unsafe { ptr::write_bytes(p, 0, total) };
  }
  p
}

/// Returns 0, `EINVAL` for a bad alignment (leaving `*out` untouched) or
/// `ENOMEM`.
pub unsafe fn posix_memalign(out: *mut *mut u8, align: usize, size: usize) -> c_int {
  if !align.is_power_of_two() || align % size_of::<*mut u8>() != 0 {
    return AllocError::InvalidAlignment { align }.errno();
  }
  match allocate(size, align) {
    Ok(p) => {
      unsafe { *out = p.as_ptr() };
      0
    }
    Err(err) => err.errno(),
  }
}

pub fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
  if !align.is_power_of_two() {
    set_errno(AllocError::InvalidAlignment { align });
    return null_mut();
  }
  match allocate(size, align) {
    Ok(p) => p.as_ptr(),
    Err(err) => {
      set_errno(err);
      null_mut()
    }
  }
}

// =============================================================================
// Free / realloc / usable size
// =============================================================================

pub unsafe fn free(ptr: *mut u8) {
  let Some(p) = NonNull::new(ptr) else {
    return;
  };
  match owner(ptr) {
    Ok(span) if CHECKED && already_free(p, span) => report(AllocError::DoubleFree {
      addr: ptr as usize,
    }),
    Ok(span) => unsafe { release(p, span) },
    Err(err) => report(err),
  }
}

pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(old) = NonNull::new(ptr) else {
    return malloc(size);
  };
  if size == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }

  let span = match owner(ptr) {
    Ok(span) => span,
    Err(err) => {
      report(err);
      return null_mut();
    }
  };
  let s = unsafe { span.as_ref() };
  let usable = s.usable_size(ptr);

  let fits_in_place = match s.kind {
    SpanKind::Small => size_to_class(size) == s.class as usize,
    SpanKind::Large => size > CLASSES_MAX_SIZE && size <= usable,
  };
  if fits_in_place {
    return ptr;
  }

  let fresh = malloc(size);
  if fresh.is_null() {
    return null_mut();
  }
  unsafe {
    ptr::copy_nonoverlapping(ptr, fresh, usable.min(size));
    release(old, span);
  }
  fresh
}

/// Bytes usable at `ptr`: the slot size, or the rest of a large region.
pub unsafe fn malloc_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  match owner(ptr) {
    Ok(span) => unsafe { span.as_ref().usable_size(ptr) },
    Err(err) => {
      report(err);
      0
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod exports {
  use core::ffi::{c_int, c_void};

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    super::malloc(size).cast()
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { super::free(ptr.cast()) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    super::calloc(count, size).cast()
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { super::realloc(ptr.cast(), size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
  ) -> c_int {
    unsafe { super::posix_memalign(memptr.cast(), alignment, size) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    super::aligned_alloc(alignment, size).cast()
  }

  // glibc rounds odd alignments up instead of failing.
  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    super::aligned_alloc(alignment.max(1).next_power_of_two(), size).cast()
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    unsafe { super::malloc_usable_size(ptr.cast()) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::SPAN_SIZE;

  #[test]
  fn zero_size_gives_distinct_freeable_pointers() {
    let a = malloc(0);
    let b = malloc(0);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);
    assert_eq!(unsafe { malloc_usable_size(a) }, MIN_ALIGN);
    unsafe {
      free(a);
      free(b);
    }
  }

  #[test]
  fn usable_size_covers_the_request() {
    for size in [1, 15, 16, 17, 100, 1000, 4097, 32 * 1024, 32 * 1024 + 1, 300_000] {
      let p = malloc(size);
      assert!(!p.is_null());
      assert!(unsafe { malloc_usable_size(p) } >= size, "size {size}");
      unsafe { ptr::write_bytes(p, 0xAB, size) };
      unsafe { free(p) };
    }
  }

  #[test]
  fn calloc_overflow_is_null() {
    assert!(calloc(usize::MAX, 2).is_null());
    assert!(calloc(1 << 40, 1 << 40).is_null());
  }

  #[test]
  fn calloc_zeroes_a_recycled_slot() {
    let p = malloc(96);
    unsafe { ptr::write_bytes(p, 0xFF, 96) };
    unsafe { free(p) };
    let q = calloc(12, 8);
    let bytes = unsafe { core::slice::from_raw_parts(q, 96) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { free(q) };
  }

  #[test]
  fn posix_memalign_rejects_bad_alignment() {
    let mut out = 0xdead as *mut u8;
    for align in [0, 3, 4, 24] {
      assert_eq!(unsafe { posix_memalign(&mut out, align, 64) }, libc::EINVAL);
      assert_eq!(out as usize, 0xdead);
    }
  }

  #[test]
  fn posix_memalign_alignments() {
    for align in [8, 16, 64, 512, 4096, SPAN_SIZE, 4 * SPAN_SIZE] {
      for size in [0, 1, 1600, 50_000] {
        let mut p = null_mut();
        assert_eq!(unsafe { posix_memalign(&mut p, align, size) }, 0);
        assert_eq!(p as usize % align, 0, "align {align} size {size}");
        assert!(unsafe { malloc_usable_size(p) } >= size);
        unsafe { free(p) };
      }
    }
  }

  #[test]
  fn aligned_alloc_requires_power_of_two() {
    assert!(aligned_alloc(48, 100).is_null());
    let p = aligned_alloc(256, 100);
    assert_eq!(p as usize % 256, 0);
    unsafe { free(p) };
  }

  #[test]
  fn realloc_null_and_zero() {
    let p = unsafe { realloc(null_mut(), 40) };
    assert!(!p.is_null());
    assert!(unsafe { realloc(p, 0) }.is_null());
  }

  #[test]
  fn realloc_within_class_keeps_pointer() {
    let p = malloc(100);
    assert_eq!(unsafe { realloc(p, 110) }, p);
    unsafe { free(p) };

    let big = malloc(200_000);
    assert_eq!(unsafe { realloc(big, 150_000) }, big);
    unsafe { free(big) };
  }

  #[test]
  fn realloc_across_paths_preserves_prefix() {
    let mut p = malloc(24);
    for (i, b) in unsafe { core::slice::from_raw_parts_mut(p, 24) }.iter_mut().enumerate() {
      *b = i as u8;
    }
    for size in [500, 40_000, 100, 24] {
      p = unsafe { realloc(p, size) };
      assert!(!p.is_null());
      let bytes = unsafe { core::slice::from_raw_parts(p, 24) };
      assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8), "size {size}");
    }
    unsafe { free(p) };
  }

  fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
  }

  #[test]
  fn exhaustion_sets_enomem() {
    unsafe { *libc::__errno_location() = 0 };
    assert!(malloc(usize::MAX).is_null());
    assert_eq!(errno(), libc::ENOMEM);

    unsafe { *libc::__errno_location() = 0 };
    assert!(malloc(1 << 62).is_null());
    assert_eq!(errno(), libc::ENOMEM);

    let mut out = 0xbeef as *mut u8;
    assert_eq!(unsafe { posix_memalign(&mut out, 64, usize::MAX - 10) }, libc::ENOMEM);
    assert_eq!(out as usize, 0xbeef);
  }

  #[test]
  fn failed_realloc_keeps_the_old_block() {
    for size in [40, 200_000] {
      let p = malloc(size);
      unsafe { ptr::write_bytes(p, 0x5A, size) };
      let usable = unsafe { malloc_usable_size(p) };

      unsafe { *libc::__errno_location() = 0 };
      assert!(unsafe { realloc(p, usize::MAX) }.is_null());
      assert_eq!(errno(), libc::ENOMEM);

      assert_eq!(unsafe { malloc_usable_size(p) }, usable);
      let bytes = unsafe { core::slice::from_raw_parts(p, size) };
      assert!(bytes.iter().all(|&b| b == 0x5A), "size {size}");
      unsafe { free(p) };
    }
  }

  #[test]
  fn huge_alignment_does_not_inflate_the_block() {
    let align = 1 << 36;
    let mut p = null_mut();
    assert_eq!(unsafe { posix_memalign(&mut p, align, 16) }, 0);
    assert_eq!(p as usize % align, 0);
    assert_eq!(unsafe { malloc_usable_size(p) }, SPAN_SIZE);
    assert_eq!(unsafe { owner(p).unwrap().as_ref().len }, SPAN_SIZE);
    unsafe { free(p) };
  }

  #[test]
  fn freed_blocks_are_recognised_as_free() {
    std::thread::spawn(|| {
      // Freed into this thread's cache.
      let p = NonNull::new(malloc(6500)).unwrap();
      let span = owner(p.as_ptr()).unwrap();
      assert!(!already_free(p, span));
      unsafe { free(p.as_ptr()) };
      assert!(already_free(p, span));
      let q = NonNull::new(malloc(6500)).unwrap();
      assert_eq!(q, p);
      assert!(!already_free(q, span));
      unsafe { free(q.as_ptr()) };
    })
    .join()
    .unwrap();

    // Returned straight to its span.
    let class = size_to_class(10_000);
    let chain = CENTRAL.refill(class, 2).unwrap();
    assert_eq!(chain.len, 2);
    let first = NonNull::new(chain.head.cast::<u8>()).unwrap();
    let second = NonNull::new(unsafe { (*chain.head).next }.cast::<u8>()).unwrap();
    let span = owner(second.as_ptr()).unwrap();

    unsafe {
      (*chain.head).next = null_mut();
      CENTRAL.drain(class, crate::central::SlotChain { head: chain.head, len: 1 });
    }
    assert!(already_free(first, span));
    assert!(!already_free(second, span));

    let large = NonNull::new(malloc(100_000)).unwrap();
    assert!(!already_free(large, owner(large.as_ptr()).unwrap()));
    unsafe {
      free(large.as_ptr());
      free(second.as_ptr());
    }
  }

  #[test]
  fn foreign_pointers_are_not_owned() {
    let local = [0u8; 32];
    assert_eq!(
      owner(local.as_ptr()),
      Err(AllocError::Misuse {
        addr: local.as_ptr() as usize
      })
    );

    let p = malloc(64);
    assert!(owner(p).is_ok());
    assert!(owner(unsafe { p.add(8) }).is_err());
    unsafe { free(p) };
  }
}
