//! Allocator counters.
//!
//! Relaxed atomics: advisory figures for tests and diagnostics, never used to
//! synchronise anything.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::central::CENTRAL;
use crate::size_class::CLASSES_COUNT;

pub(crate) struct Counters {
  pub spans_mapped: AtomicUsize,
  pub spans_released: AtomicUsize,
  pub spans_pooled: AtomicUsize,
  pub large_live: AtomicUsize,
  pub large_bytes: AtomicUsize,
  pub threads_finalized: AtomicUsize,
  pub staging_overruns: AtomicUsize,
  /// Slots handed out by the central heap and not yet drained back,
  /// i.e. sitting in thread caches or live in the application.
  pub outstanding: [AtomicUsize; CLASSES_COUNT],
}

impl Counters {
  const fn new() -> Self {
    Self {
      spans_mapped: AtomicUsize::new(0),
      spans_released: AtomicUsize::new(0),
      spans_pooled: AtomicUsize::new(0),
      large_live: AtomicUsize::new(0),
      large_bytes: AtomicUsize::new(0),
      threads_finalized: AtomicUsize::new(0),
      staging_overruns: AtomicUsize::new(0),
      outstanding: [const { AtomicUsize::new(0) }; CLASSES_COUNT],
    }
  }
}

pub(crate) static COUNTERS: Counters = Counters::new();

#[inline]
pub(crate) fn inc(counter: &AtomicUsize) {
  counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicUsize, n: usize) {
  counter.fetch_add(n, Ordering::Relaxed);
}

#[inline]
pub(crate) fn sub(counter: &AtomicUsize, n: usize) {
  counter.fetch_sub(n, Ordering::Relaxed);
}

/// Point-in-time copy of the process-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
  /// Small spans ever mapped from the OS.
  pub spans_mapped: usize,
  /// Small spans unmapped after overflowing the free-span pool.
  pub spans_released: usize,
  /// Fully free spans currently waiting in the pool.
  pub spans_pooled: usize,
  /// Large regions currently mapped.
  pub large_live: usize,
  /// Bytes mapped for live large regions.
  pub large_bytes: usize,
  /// Thread caches drained by the thread-exit finalizer.
  pub threads_finalized: usize,
  /// Thread creations refused because the staging ring was full.
  pub staging_overruns: usize,
}

pub fn snapshot() -> HeapStats {
  let c = &COUNTERS;
  HeapStats {
    spans_mapped: c.spans_mapped.load(Ordering::Relaxed),
    spans_released: c.spans_released.load(Ordering::Relaxed),
    spans_pooled: c.spans_pooled.load(Ordering::Relaxed),
    large_live: c.large_live.load(Ordering::Relaxed),
    large_bytes: c.large_bytes.load(Ordering::Relaxed),
    threads_finalized: c.threads_finalized.load(Ordering::Relaxed),
    staging_overruns: c.staging_overruns.load(Ordering::Relaxed),
  }
}

/// Slots of `class` currently outside the central heap.
pub fn class_outstanding(class: usize) -> usize {
  COUNTERS
    .outstanding
    .get(class)
    .map_or(0, |c| c.load(Ordering::Relaxed))
}

/// Free slots of `class` sitting in the central heap's partially used spans.
pub fn class_free_slots(class: usize) -> usize {
  if class >= CLASSES_COUNT {
    return 0;
  }
  CENTRAL.free_slots(class)
}
