//! Address directory: any address inside a registered span → its descriptor.
//!
//! Two-level radix over 48-bit addresses keyed on the span-aligned prefix
//! (`addr >> 16`). The root is static; leaves are mapped on first use and
//! installed with a CAS. Lookups are two acquire loads and never lock;
//! `register` publishes an already-initialised descriptor, so a reader sees
//! either the whole span or nothing.

use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::SPAN_SIZE_BITS;
use crate::error::{AllocError, Result};
use crate::platform::{os_map, os_unmap};
use crate::span::Span;

const ADDRESS_BITS: usize = 48;
const KEY_BITS: usize = ADDRESS_BITS - SPAN_SIZE_BITS;
const LEAF_BITS: usize = KEY_BITS / 2;
const ROOT_BITS: usize = KEY_BITS - LEAF_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

const _: () = assert!(ROOT_BITS + LEAF_BITS + SPAN_SIZE_BITS == ADDRESS_BITS);

type Leaf = [AtomicPtr<Span>; LEAF_LEN];

pub struct Directory {
  root: [AtomicPtr<Leaf>; ROOT_LEN],
}

pub static DIRECTORY: Directory = Directory::new();

impl Directory {
  const fn new() -> Self {
    Self {
      root: [const { AtomicPtr::new(null_mut()) }; ROOT_LEN],
    }
  }

  #[inline]
  fn split(addr: usize) -> Option<(usize, usize)> {
    if addr >> ADDRESS_BITS != 0 {
      return None;
    }
    let key = addr >> SPAN_SIZE_BITS;
    Some((key >> LEAF_BITS, key & (LEAF_LEN - 1)))
  }

  /// Span owning `addr`, if `addr` falls inside a registered span.
  #[inline]
  pub fn resolve(&self, addr: usize) -> Option<NonNull<Span>> {
    let (hi, lo) = Self::split(addr)?;
    let leaf = self.root[hi].load(Ordering::Acquire);
    if leaf.is_null() {
      return None;
    }
    let span = unsafe { (*leaf)[lo].load(Ordering::Acquire) };
    NonNull::new(span)
  }

  fn leaf_for(&self, hi: usize) -> Result<&Leaf> {
    let slot = &self.root[hi];
    let existing = slot.load(Ordering::Acquire);
    if !existing.is_null() {
      return Ok(unsafe { &*existing });
    }

    // Fresh anonymous memory is zero, i.e. every entry null.
    let fresh = unsafe { os_map(size_of::<Leaf>()) } as *mut Leaf;
    if fresh.is_null() {
      return Err(AllocError::Exhausted {
        bytes: size_of::<Leaf>(),
      });
    }
    match slot.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => Ok(unsafe { &*fresh }),
      Err(winner) => {
        unsafe { os_unmap(fresh.cast(), size_of::<Leaf>()) };
        Ok(unsafe { &*winner })
      }
    }
  }

  /// Map every span-sized chunk of `[base, base + len)` to `span`.
  pub fn register(&self, span: NonNull<Span>) -> Result<()> {
    let (base, len) = unsafe { ((*span.as_ptr()).base as usize, (*span.as_ptr()).len) };
    self.store_range(base, len, span.as_ptr())
  }

  /// Drop the mapping for `span`'s range.
  pub fn unregister(&self, span: NonNull<Span>) {
    let (base, len) = unsafe { ((*span.as_ptr()).base as usize, (*span.as_ptr()).len) };
    // Leaves for a registered range exist already, so this cannot fail.
    let _ = self.store_range(base, len, null_mut());
  }

  fn store_range(&self, base: usize, len: usize, value: *mut Span) -> Result<()> {
    let mut addr = base;
    while addr < base + len {
      let (hi, lo) = Self::split(addr).ok_or(AllocError::Misuse { addr })?;
      let leaf = self.leaf_for(hi)?;
      leaf[lo].store(value, Ordering::Release);
      addr += 1 << SPAN_SIZE_BITS;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::SPAN_SIZE;
  use crate::size_class::size_to_class;
  use crate::span::{acquire_span, map_large, release_span, unmap_large};

  #[test]
  fn every_byte_of_a_span_resolves() {
    let span = acquire_span(size_to_class(100)).unwrap();
    DIRECTORY.register(span).unwrap();
    let base = unsafe { (*span.as_ptr()).base } as usize;
    for addr in [base, base + 1, base + SPAN_SIZE / 2, base + SPAN_SIZE - 1] {
      assert_eq!(DIRECTORY.resolve(addr), Some(span));
    }
    assert_ne!(DIRECTORY.resolve(base + SPAN_SIZE), Some(span));

    DIRECTORY.unregister(span);
    assert_eq!(DIRECTORY.resolve(base), None);
    unsafe { release_span(span) };
  }

  #[test]
  fn large_regions_cover_every_chunk() {
    let span = map_large(5 * SPAN_SIZE + 10, 16).unwrap();
    DIRECTORY.register(span).unwrap();
    let (base, len) = unsafe { ((*span.as_ptr()).base as usize, (*span.as_ptr()).len) };
    assert_eq!(len, 6 * SPAN_SIZE);
    for chunk in 0..6 {
      assert_eq!(DIRECTORY.resolve(base + chunk * SPAN_SIZE + 8), Some(span));
    }
    DIRECTORY.unregister(span);
    assert_eq!(DIRECTORY.resolve(base + 3 * SPAN_SIZE), None);
    unsafe { unmap_large(span) };
  }

  #[test]
  fn foreign_and_out_of_range_addresses() {
    let on_stack = 0u64;
    assert_eq!(DIRECTORY.resolve(&on_stack as *const u64 as usize), None);
    assert_eq!(DIRECTORY.resolve(usize::MAX), None);
    assert_eq!(DIRECTORY.resolve(1 << 48), None);
  }

  #[test]
  fn concurrent_readers_see_whole_spans() {
    let span = acquire_span(0).unwrap();
    let base = unsafe { (*span.as_ptr()).base } as usize;
    let addr = base + 16;
    std::thread::scope(|s| {
      for _ in 0..4 {
        s.spawn(|| {
          for _ in 0..10_000 {
            if let Some(found) = DIRECTORY.resolve(addr) {
              let found = unsafe { &*found.as_ptr() };
              assert_eq!(found.base as usize, base);
              assert_eq!(found.magic, crate::span::SPAN_MAGIC);
            }
          }
        });
      }
      for _ in 0..1_000 {
        DIRECTORY.register(span).unwrap();
        DIRECTORY.unregister(span);
      }
    });
    unsafe { release_span(span) };
  }
}
