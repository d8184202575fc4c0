//! Per-thread slot cache.
//!
//! Each thread keeps one LIFO stack of free slots per size class. Misses pull a
//! batch from the central heap; a stack that grows past the high-water mark
//! gives a batch back. Nothing here locks.
//!
//! Batch and high-water mark adapt per bin. Back-to-back refills mean the
//! thread allocates faster than a batch covers, so the batch doubles;
//! back-to-back drains mean it frees more than it reuses, so the batch and
//! the mark it scales halve. Both stay within [`SizeClass::batch_bounds`].
//!
//! The cache is a const-initialised thread local without `Drop`, so it stays
//! addressable for the whole life of the thread, including while pthread key
//! destructors run. Draining at thread exit is done by the finalizer armed in
//! [`crate::lifecycle`], not by the TLS machinery.

use core::cell::{Cell, UnsafeCell};
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::central::{CENTRAL, SlotChain};
use crate::config::{Tunables, tunables};
use crate::error::Result;
use crate::lifecycle::arm_finalizer;
use crate::size_class::{CLASSES_COUNT, SizeClass, size_class};
use crate::span::FreeSlot;
use crate::stats::{self, COUNTERS};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheState {
  /// Never used on this thread.
  Lazy,
  /// Serving requests; the finalizer is armed.
  Active,
  /// Drained at thread exit. The next request re-activates it.
  Finalized,
}

/// Refills (or drains) in a row that move a bin's batch one step.
const STREAK: u32 = 2;

struct Bin {
  head: *mut FreeSlot,
  len: usize,
  /// Slots moved per refill or drain; 0 until first needed.
  batch: usize,
  /// Refills since the last drain.
  misses: u32,
  /// Drains since the last refill.
  overflows: u32,
}

impl Bin {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      batch: 0,
      misses: 0,
      overflows: 0,
    }
  }

  fn batch(&mut self, sc: &SizeClass, t: &Tunables) -> usize {
    if self.batch == 0 {
      self.batch = sc.refill_batch(t);
    }
    self.batch
  }

  fn limit(&mut self, sc: &SizeClass, t: &Tunables) -> usize {
    let batch = self.batch(sc, t);
    sc.high_water_for(batch, t)
  }

  /// The bin ran dry. Returns how many slots to refill.
  fn on_miss(&mut self, sc: &SizeClass, t: &Tunables) -> usize {
    let batch = self.batch(sc, t);
    self.overflows = 0;
    self.misses += 1;
    if self.misses >= STREAK {
      self.misses = 0;
      self.batch = (batch * 2).min(sc.batch_bounds(t).1);
      if self.batch != batch {
        log_debug!("class {} batch {} -> {}", sc.id, batch, self.batch);
      }
    }
    self.batch
  }

  /// The bin passed its high-water mark. Returns how many slots to drain so
  /// that it ends at or below the (possibly lowered) mark.
  fn on_overflow(&mut self, sc: &SizeClass, t: &Tunables) -> usize {
    let batch = self.batch(sc, t);
    self.misses = 0;
    self.overflows += 1;
    if self.overflows >= STREAK {
      self.overflows = 0;
      self.batch = (batch / 2).max(sc.batch_bounds(t).0);
      if self.batch != batch {
        log_debug!("class {} batch {} -> {}", sc.id, batch, self.batch);
      }
    }
    let limit = sc.high_water_for(self.batch, t);
    self.batch.max(self.len.saturating_sub(limit))
  }

  fn contains(&self, slot: *mut FreeSlot) -> bool {
    let mut cursor = self.head;
    while !cursor.is_null() {
      if cursor == slot {
        return true;
      }
      cursor = unsafe { (*cursor).next };
    }
    false
  }

  /// Detach the top `count` slots.
  unsafe fn split_off(&mut self, count: usize) -> SlotChain {
    let head = self.head;
    let mut tail = head;
    for _ in 1..count {
      tail = unsafe { (*tail).next };
    }
    self.head = unsafe { (*tail).next };
    unsafe { (*tail).next = null_mut() };
    self.len -= count;
    SlotChain { head, len: count }
  }

  fn take_all(&mut self) -> SlotChain {
    let chain = SlotChain {
      head: self.head,
      len: self.len,
    };
    *self = Self::new();
    chain
  }
}

pub struct ThreadCache {
  bins: [Bin; CLASSES_COUNT],
  tid: u32,
  state: CacheState,
}

impl ThreadCache {
  const fn new() -> Self {
    Self {
      bins: [const { Bin::new() }; CLASSES_COUNT],
      tid: 0,
      state: CacheState::Lazy,
    }
  }

  /// Move to `Active`, arming the finalizer on the way. Returns false when the
  /// finalizer cannot be armed, in which case the cache must not hold slots.
  fn activate(&mut self) -> bool {
    if self.state == CacheState::Active {
      return true;
    }
    if !arm_finalizer() {
      return false;
    }
    if self.tid == 0 {
      self.tid = next_thread_id();
    }
    log_debug!("thread {} cache active (was {:?})", self.tid, self.state);
    self.state = CacheState::Active;
    true
  }

  pub fn alloc(&mut self, class: usize) -> Result<NonNull<u8>> {
    let bin = &mut self.bins[class];
    if bin.head.is_null() {
      let batch = bin.on_miss(&size_class(class), tunables());
      let chain = CENTRAL.refill(class, batch)?;
      bin.head = chain.head;
      bin.len = chain.len;
    }

    let slot = bin.head;
    bin.head = unsafe { (*slot).next };
    bin.len -= 1;
    Ok(unsafe { NonNull::new_unchecked(slot.cast()) })
  }

  pub unsafe fn free(&mut self, class: usize, ptr: NonNull<u8>) {
    let slot = ptr.as_ptr() as *mut FreeSlot;
    let bin = &mut self.bins[class];
    unsafe { (*slot).next = bin.head };
    bin.head = slot;
    bin.len += 1;

    let sc = size_class(class);
    let t = tunables();
    if bin.len > bin.limit(&sc, t) {
      let count = bin.on_overflow(&sc, t);
      let chain = unsafe { bin.split_off(count) };
      unsafe { CENTRAL.drain(class, chain) };
    }
  }

  /// Return every cached slot to the central heap.
  pub fn flush(&mut self) {
    for (class, bin) in self.bins.iter_mut().enumerate() {
      if bin.len > 0 {
        let chain = bin.take_all();
        unsafe { CENTRAL.drain(class, chain) };
      }
    }
  }

  pub fn cached(&self, class: usize) -> usize {
    self.bins[class].len
  }
}

// Each thread gets a different ID
fn next_thread_id() -> u32 {
  static CTR: AtomicU32 = AtomicU32::new(1);
  CTR.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
  static BUSY: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` on this thread's active cache.
///
/// Returns `None` when the cache is unusable: re-entered (e.g. from inside
/// `pthread_setspecific`), TLS already gone, or the finalizer could not be
/// armed. Callers then go to the central heap directly.
fn with_cache<R, F: FnOnce(&mut ThreadCache) -> R>(f: F) -> Option<R> {
  BUSY
    .try_with(|busy| {
      if busy.get() {
        return None;
      }
      busy.set(true);
      let result = CACHE
        .try_with(|c| {
          let cache = unsafe { &mut *c.get() };
          cache.activate().then(|| f(cache))
        })
        .ok()
        .flatten();
      busy.set(false);
      result
    })
    .ok()
    .flatten()
}

/// Drain this thread's cache and mark it finalized. Called once per thread
/// exit from the pthread key destructor.
pub fn finalize_current() {
  let _ = BUSY.try_with(|busy| {
    let was_busy = busy.replace(true);
    let _ = CACHE.try_with(|c| {
      let cache = unsafe { &mut *c.get() };
      if cache.state != CacheState::Active {
        return;
      }
      cache.flush();
      cache.state = CacheState::Finalized;
      stats::inc(&COUNTERS.threads_finalized);
      log_debug!("thread {} cache finalized", cache.tid);
    });
    busy.set(was_busy);
  });
}

pub fn current_state() -> CacheState {
  CACHE
    .try_with(|c| unsafe { (*c.get()).state })
    .unwrap_or(CacheState::Finalized)
}

/// Whether `ptr` sits in the calling thread's bin for `class`. Walks the bin.
pub fn slot_is_cached(class: usize, ptr: NonNull<u8>) -> bool {
  BUSY
    .try_with(|busy| {
      !busy.get()
        && CACHE
          .try_with(|c| unsafe { (*c.get()).bins[class].contains(ptr.as_ptr().cast()) })
          .unwrap_or(false)
    })
    .unwrap_or(false)
}

/// Slots of `class` cached by the calling thread.
pub fn cached_slots(class: usize) -> usize {
  CACHE
    .try_with(|c| unsafe { (*c.get()).cached(class) })
    .unwrap_or(0)
}

// =============================================================================
// Small allocation / free
// =============================================================================

pub fn alloc_small(class: usize) -> Result<NonNull<u8>> {
  with_cache(|cache| cache.alloc(class)).unwrap_or_else(|| central_alloc(class))
}

pub unsafe fn free_small(class: usize, ptr: NonNull<u8>) {
  let cached = with_cache(|cache| unsafe { cache.free(class, ptr) });
  if cached.is_none() {
    unsafe { central_free(class, ptr) };
  }
}

fn central_alloc(class: usize) -> Result<NonNull<u8>> {
  let chain = CENTRAL.refill(class, 1)?;
  Ok(unsafe { NonNull::new_unchecked(chain.head.cast()) })
}

unsafe fn central_free(class: usize, ptr: NonNull<u8>) {
  let slot = ptr.as_ptr() as *mut FreeSlot;
  unsafe { (*slot).next = null_mut() };
  unsafe { CENTRAL.drain(class, SlotChain { head: slot, len: 1 }) };
}
