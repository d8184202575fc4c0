//! Central heap: the one place threads contend.
//!
//! Per class, a spin-locked list of partially free spans feeds thread-cache
//! refills and absorbs drained slots. Spans that become fully free leave the
//! directory and park in a shared pool, where any class may reformat them.
//! Large allocations bypass all of this and map a dedicated region.

use core::ptr::NonNull;

use crate::config::tunables;
use crate::directory::DIRECTORY;
use crate::error::Result;
use crate::platform::os_release;
use crate::size_class::CLASSES_COUNT;
use crate::span::{FreeSlot, Span, SpanList, acquire_span, map_large, release_span, unmap_large};
use crate::stats::{self, COUNTERS};
use crate::sync::SpinMutex;

/// Null-terminated chain of free slots of one class.
#[derive(Debug)]
pub struct SlotChain {
  pub head: *mut FreeSlot,
  pub len: usize,
}

pub struct CentralHeap {
  /// Spans with at least one free slot, per class.
  partial: [SpinMutex<SpanList>; CLASSES_COUNT],
  /// Fully free spans, any class.
  pool: SpinMutex<SpanList>,
}

pub static CENTRAL: CentralHeap = CentralHeap::new();

impl CentralHeap {
  const fn new() -> Self {
    Self {
      partial: [const { SpinMutex::new(SpanList::new()) }; CLASSES_COUNT],
      pool: SpinMutex::new(SpanList::new()),
    }
  }

  /// Hand out up to `count` (at least one) free slots of `class`.
  pub fn refill(&self, class: usize, count: usize) -> Result<SlotChain> {
    debug_assert!(class < CLASSES_COUNT && count > 0);
    let mut partial = self.partial[class].lock();

    let span = match NonNull::new(partial.head()) {
      Some(span) => span,
      None => {
        let span = self.fresh_span(class)?;
        unsafe {
          partial.push_front(span.as_ptr());
          (*span.as_ptr()).in_partial = true;
        }
        span
      }
    };

    let s = unsafe { &mut *span.as_ptr() };
    let (head, len) = unsafe { s.take_slots(count) };
    debug_assert!(len > 0);
    if s.free_count == 0 {
      unsafe { partial.remove(span.as_ptr()) };
      s.in_partial = false;
    }
    drop(partial);

    stats::add(&COUNTERS.outstanding[class], len);
    log_debug!("refill class {} with {} slots from {:p}", class, len, s.base);
    Ok(SlotChain { head, len })
  }

  /// Take back a chain of `class` slots, returning each to its span.
  pub unsafe fn drain(&self, class: usize, chain: SlotChain) {
    let mut partial = self.partial[class].lock();
    let mut cursor = chain.head;
    let mut drained = 0;

    while !cursor.is_null() {
      let next = unsafe { (*cursor).next };
      let Some(span) = DIRECTORY.resolve(cursor as usize) else {
        debug_assert!(false, "drained slot {cursor:p} has no span");
        cursor = next;
        continue;
      };
      let s = unsafe { &mut *span.as_ptr() };
      debug_assert!(s.contains(cursor as usize) && s.class as usize == class);
      unsafe { s.put_slot(cursor) };
      drained += 1;

      if s.is_fully_free() {
        if s.in_partial {
          unsafe { partial.remove(span.as_ptr()) };
          s.in_partial = false;
        }
        self.retire_span(span);
      } else if !s.in_partial {
        unsafe { partial.push_front(span.as_ptr()) };
        s.in_partial = true;
      }
      cursor = next;
    }
    drop(partial);

    debug_assert_eq!(drained, chain.len);
    stats::sub(&COUNTERS.outstanding[class], drained);
    log_debug!("drained {} slots of class {}", drained, class);
  }

  /// A registered span formatted for `class`: pooled if possible, else newly mapped.
  fn fresh_span(&self, class: usize) -> Result<NonNull<Span>> {
    let pooled = unsafe { self.pool.lock().pop_front() };
    let span = match pooled {
      Some(span) => {
        stats::sub(&COUNTERS.spans_pooled, 1);
        unsafe { (*span.as_ptr()).format(class) };
        span
      }
      None => acquire_span(class)?,
    };

    if let Err(err) = DIRECTORY.register(span) {
      unsafe { release_span(span) };
      return Err(err);
    }
    Ok(span)
  }

  /// Unregister a fully free span and park it, or unmap it when the pool is full.
  fn retire_span(&self, span: NonNull<Span>) {
    DIRECTORY.unregister(span);

    let mut pool = self.pool.lock();
    if pool.len() < tunables().pool_spans {
      unsafe {
        let s = &*span.as_ptr();
        os_release(s.base, s.len);
        pool.push_front(span.as_ptr());
      }
      stats::inc(&COUNTERS.spans_pooled);
      return;
    }
    drop(pool);
    unsafe { release_span(span) };
  }

  /// Map a dedicated, directory-tracked region for one allocation.
  pub fn allocate_large(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
    let span = map_large(size, align)?;
    if let Err(err) = DIRECTORY.register(span) {
      unsafe { unmap_large(span) };
      return Err(err);
    }

    let s = unsafe { &*span.as_ptr() };
    stats::inc(&COUNTERS.large_live);
    stats::add(&COUNTERS.large_bytes, s.len);
    log_debug!("large {} bytes at {:p}", size, s.user);
    Ok(unsafe { NonNull::new_unchecked(s.user) })
  }

  pub unsafe fn free_large(&self, span: NonNull<Span>) {
    let len = unsafe { (*span.as_ptr()).len };
    DIRECTORY.unregister(span);
    unsafe { unmap_large(span) };
    stats::sub(&COUNTERS.large_live, 1);
    stats::sub(&COUNTERS.large_bytes, len);
  }

  /// Whether the slot at `addr` of a small `span` is already back on its span.
  pub fn slot_is_free(&self, span: NonNull<Span>, addr: usize) -> bool {
    let s = unsafe { &*span.as_ptr() };
    let _bin = self.partial[s.class as usize].lock();
    s.holds_free(addr)
  }

  /// Free slots of `class` held centrally (walks the partial list).
  pub fn free_slots(&self, class: usize) -> usize {
    let partial = self.partial[class].lock();
    let mut total = 0;
    let mut span = partial.head();
    while !span.is_null() {
      unsafe {
        total += (*span).free_count as usize;
        span = (*span).next;
      }
    }
    total
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::size_class::{size_class, size_to_class};

  // Each test uses its own class so parallel tests do not share bins.

  #[test]
  fn refill_then_drain_restores_capacity() {
    let class = size_to_class(3000);
    let batch = 8;
    let first = CENTRAL.refill(class, batch).unwrap();
    assert_eq!(first.len, batch);
    let keep = CENTRAL.refill(class, 1).unwrap();
    let free_mid = CENTRAL.free_slots(class);

    let mut cursor = first.head;
    while !cursor.is_null() {
      assert!(DIRECTORY.resolve(cursor as usize).is_some());
      cursor = unsafe { (*cursor).next };
    }

    unsafe { CENTRAL.drain(class, first) };
    assert_eq!(CENTRAL.free_slots(class), free_mid + batch);
    unsafe { CENTRAL.drain(class, keep) };
    assert_eq!(CENTRAL.free_slots(class), 0);
  }

  #[test]
  fn draining_everything_retires_the_span() {
    let class = size_to_class(20_000);
    let per_span = size_class(class).slots_per_span;
    let chain = CENTRAL.refill(class, per_span).unwrap();
    assert_eq!(chain.len, per_span);
    let addr = chain.head as usize;
    assert!(DIRECTORY.resolve(addr).is_some());
    assert_eq!(CENTRAL.free_slots(class), 0);

    unsafe { CENTRAL.drain(class, chain) };
    // The span may already be reused by another class from the pool.
    let now = DIRECTORY.resolve(addr);
    assert!(now.is_none_or(|span| unsafe { span.as_ref() }.class as usize != class));
    assert_eq!(CENTRAL.free_slots(class), 0);
  }

  #[test]
  fn pooled_span_is_reformatted_for_another_class() {
    let a = size_to_class(12_000);
    let b = size_to_class(7_000);
    let chain = CENTRAL.refill(a, size_class(a).slots_per_span).unwrap();
    unsafe { CENTRAL.drain(a, chain) };

    let reused = CENTRAL.refill(b, 1).unwrap();
    let span = DIRECTORY.resolve(reused.head as usize).unwrap();
    let s = unsafe { &*span.as_ptr() };
    assert_eq!(s.class as usize, b);
    assert_eq!(s.slot_size, size_class(b).slot_size);
    assert!(s.is_block_start(reused.head as usize));
    unsafe { CENTRAL.drain(b, reused) };
  }

  #[test]
  fn large_round_trip() {
    let before = stats::snapshot().large_live;
    let ptr = CENTRAL.allocate_large(1 << 20, 16).unwrap();
    let span = DIRECTORY.resolve(ptr.as_ptr() as usize).unwrap();
    let s = unsafe { &*span.as_ptr() };
    assert!(s.usable_size(ptr.as_ptr()) >= 1 << 20);
    assert!(stats::snapshot().large_live >= before + 1);
    unsafe { CENTRAL.free_large(span) };
  }
}
