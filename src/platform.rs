//! OS address-space reservation.

use core::ptr::null_mut;

use crate::align_up;

pub unsafe fn os_map(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

/// Map `size` bytes starting at a multiple of `align` (a power of two).
///
/// Over-reserves by `align` and hands the unaligned head and tail back.
pub unsafe fn os_map_aligned(size: usize, align: usize) -> *mut u8 {
  debug_assert!(align.is_power_of_two());
  let Some(total) = size.checked_add(align) else {
    return null_mut();
  };
  let raw = unsafe { os_map(total) };
  if raw.is_null() {
    return null_mut();
  }

  let aligned = align_up(raw as usize, align);
  let head = aligned - raw as usize;
  let tail = total - head - size;
  unsafe {
    if head > 0 {
      os_unmap(raw, head);
    }
    if tail > 0 {
      os_unmap((aligned + size) as *mut u8, tail);
    }
  }
  aligned as *mut u8
}

pub unsafe fn os_unmap(ptr: *mut u8, size: usize) {
  let ret = unsafe { libc::munmap(ptr.cast(), size) };
  debug_assert_eq!(ret, 0, "munmap({ptr:p}, {size}) failed");
}

/// Drop the physical pages behind a range while keeping it reserved.
#[cfg(feature = "release-mem")]
pub unsafe fn os_release(ptr: *mut u8, size: usize) {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
}

#[cfg(not(feature = "release-mem"))]
pub unsafe fn os_release(_ptr: *mut u8, _size: usize) {}
