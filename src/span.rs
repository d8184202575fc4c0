//! Spans and their out-of-line descriptors.
//!
//! A span is a [`SPAN_SIZE`]-aligned region carved into equal slots of one
//! size class; slot 0 sits at the span base. The descriptor lives in a separate
//! arena so span memory carries no header and alignment falls out of the slot
//! size alone.

use core::ptr::{NonNull, null_mut};

use crate::error::{AllocError, Result};
use crate::platform::{os_map, os_map_aligned, os_unmap};
use crate::size_class::size_class;
use crate::stats::{self, COUNTERS};
use crate::sync::SpinMutex;
use crate::{SPAN_SIZE, align_up};

/// Magic number to identify valid span descriptors.
pub const SPAN_MAGIC: u64 = 0x5445_5353_4552_4121; // "TESSERA!"

/// Descriptors are carved from mappings of this size.
const DESCRIPTOR_CHUNK: usize = 64 * 1024;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanKind {
  Small = 0,
  Large = 1,
}

#[repr(C)]
pub struct FreeSlot {
  pub next: *mut FreeSlot,
}

/// Span descriptor.
#[repr(C, align(64))]
pub struct Span {
  /// Start of the mapping.
  pub base: *mut u8,
  /// Mapping length.
  pub len: usize,
  /// First byte handed to the caller (large spans only; equals `base` otherwise).
  pub user: *mut u8,
  pub slot_size: usize,
  pub class: u8,
  pub kind: SpanKind,
  /// Set while linked into a central partial list.
  pub in_partial: bool,
  pub capacity: u32,
  pub free_count: u32,
  /// Returned slots held by the central heap.
  pub free: *mut FreeSlot,
  /// First slot never handed out. Slots at and past it are untouched memory.
  pub bump: *mut u8,
  /// Intrusive links for central lists and the descriptor free list.
  pub prev: *mut Span,
  pub next: *mut Span,
  pub magic: u64,
}

impl Span {
  /// Set the span up for slots of `class`, all free. Slot memory is left
  /// alone; slots are carved from `bump` as they are first handed out.
  pub fn format(&mut self, class: usize) {
    let sc = size_class(class);
    debug_assert!(sc.slots_per_span * sc.slot_size <= self.len);

    self.user = self.base;
    self.slot_size = sc.slot_size;
    self.class = class as u8;
    self.kind = SpanKind::Small;
    self.in_partial = false;
    self.capacity = sc.slots_per_span as u32;
    self.free_count = sc.slots_per_span as u32;
    self.free = null_mut();
    self.bump = self.base;
    self.prev = null_mut();
    self.next = null_mut();
    self.magic = SPAN_MAGIC;
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    let base = self.base as usize;
    addr >= base && addr < base + self.len
  }

  /// Whether `addr` is the first byte of a slot (or the large user pointer).
  pub fn is_block_start(&self, addr: usize) -> bool {
    match self.kind {
      SpanKind::Small => {
        let offset = addr.wrapping_sub(self.base as usize);
        offset < self.capacity as usize * self.slot_size && offset % self.slot_size == 0
      }
      SpanKind::Large => addr == self.user as usize,
    }
  }

  /// Bytes the caller may use from `ptr`.
  pub fn usable_size(&self, ptr: *const u8) -> usize {
    match self.kind {
      SpanKind::Small => self.slot_size,
      SpanKind::Large => self.base as usize + self.len - ptr as usize,
    }
  }

  #[inline]
  pub fn is_fully_free(&self) -> bool {
    self.free_count == self.capacity
  }

  /// Detach up to `max` free slots as a null-terminated chain: returned slots
  /// first, then fresh ones carved from the bump cursor.
  pub unsafe fn take_slots(&mut self, max: usize) -> (*mut FreeSlot, usize) {
    let mut head = self.free;
    let mut taken = 0;
    let mut tail: *mut FreeSlot = null_mut();
    let mut cursor = head;
    while taken < max && !cursor.is_null() {
      tail = cursor;
      cursor = unsafe { (*cursor).next };
      taken += 1;
    }
    self.free = cursor;

    let end = self.base as usize + self.capacity as usize * self.slot_size;
    while taken < max && (self.bump as usize) < end {
      let slot = self.bump as *mut FreeSlot;
      self.bump = unsafe { self.bump.add(self.slot_size) };
      if tail.is_null() {
        head = slot;
      } else {
        unsafe { (*tail).next = slot };
      }
      tail = slot;
      taken += 1;
    }

    if tail.is_null() {
      head = null_mut();
    } else {
      unsafe { (*tail).next = null_mut() };
    }
    self.free_count -= taken as u32;
    (head, taken)
  }

  /// Whether the block at `addr` is already free: never carved, or sitting on
  /// the central free list. Walks the list, so checked builds only.
  pub fn holds_free(&self, addr: usize) -> bool {
    if self.kind == SpanKind::Large {
      return false;
    }
    if addr >= self.bump as usize {
      return true;
    }
    let mut cursor = self.free;
    while !cursor.is_null() {
      if cursor as usize == addr {
        return true;
      }
      cursor = unsafe { (*cursor).next };
    }
    false
  }

  #[inline]
  pub unsafe fn put_slot(&mut self, slot: *mut FreeSlot) {
    debug_assert!(self.free_count < self.capacity, "span slot count overflow");
    unsafe { (*slot).next = self.free };
    self.free = slot;
    self.free_count += 1;
  }
}

/// Intrusive doubly-linked list of spans.
pub struct SpanList {
  head: *mut Span,
  len: usize,
}

unsafe impl Send for SpanList {}

impl SpanList {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn head(&self) -> *mut Span {
    self.head
  }

  pub unsafe fn push_front(&mut self, span: *mut Span) {
    unsafe {
      (*span).prev = null_mut();
      (*span).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = span;
      }
    }
    self.head = span;
    self.len += 1;
  }

  pub unsafe fn remove(&mut self, span: *mut Span) {
    unsafe {
      let prev = (*span).prev;
      let next = (*span).next;
      if prev.is_null() {
        debug_assert_eq!(self.head, span);
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*span).prev = null_mut();
      (*span).next = null_mut();
    }
    self.len -= 1;
  }

  pub unsafe fn pop_front(&mut self) -> Option<NonNull<Span>> {
    let span = NonNull::new(self.head)?;
    unsafe { self.remove(span.as_ptr()) };
    Some(span)
  }
}

// =============================================================================
// Descriptor arena
// =============================================================================

/// Bootstrap storage for descriptors. Never unmapped: a racing directory reader
/// may still dereference a recycled descriptor.
struct DescriptorArena {
  free: *mut Span,
  bump: usize,
  end: usize,
}

unsafe impl Send for DescriptorArena {}

static DESCRIPTORS: SpinMutex<DescriptorArena> = SpinMutex::new(DescriptorArena {
  free: null_mut(),
  bump: 0,
  end: 0,
});

fn alloc_descriptor() -> Result<NonNull<Span>> {
  let mut arena = DESCRIPTORS.lock();
  if let Some(span) = NonNull::new(arena.free) {
    arena.free = unsafe { (*span.as_ptr()).next };
    return Ok(span);
  }

  let size = size_of::<Span>();
  if arena.bump + size > arena.end {
    let chunk = unsafe { os_map(DESCRIPTOR_CHUNK) };
    if chunk.is_null() {
      return Err(AllocError::Exhausted {
        bytes: DESCRIPTOR_CHUNK,
      });
    }
    arena.bump = align_up(chunk as usize, align_of::<Span>());
    arena.end = chunk as usize + DESCRIPTOR_CHUNK;
  }

  let span = arena.bump as *mut Span;
  arena.bump += size;
  Ok(unsafe { NonNull::new_unchecked(span) })
}

fn recycle_descriptor(span: *mut Span) {
  let mut arena = DESCRIPTORS.lock();
  unsafe {
    (*span).magic = 0;
    (*span).next = arena.free;
  }
  arena.free = span;
}

// =============================================================================
// Span allocator
// =============================================================================

/// Reserve a fresh span formatted for `class`, every slot free.
pub fn acquire_span(class: usize) -> Result<NonNull<Span>> {
  let desc = alloc_descriptor()?;
  let base = unsafe { os_map_aligned(SPAN_SIZE, SPAN_SIZE) };
  if base.is_null() {
    recycle_descriptor(desc.as_ptr());
    return Err(AllocError::Exhausted { bytes: SPAN_SIZE });
  }

  unsafe {
    let span = &mut *desc.as_ptr();
    span.base = base;
    span.len = SPAN_SIZE;
    span.format(class);
  }
  stats::inc(&COUNTERS.spans_mapped);
  log_debug!("mapped span {:p} for class {}", base, class);
  Ok(desc)
}

/// Hand a span's range back to the OS. The span must be unregistered.
pub unsafe fn release_span(span: NonNull<Span>) {
  let (base, len) = unsafe { ((*span.as_ptr()).base, (*span.as_ptr()).len) };
  unsafe { os_unmap(base, len) };
  recycle_descriptor(span.as_ptr());
  stats::inc(&COUNTERS.spans_released);
  log_debug!("released span {:p}", base);
}

/// Map a region for one large allocation of `size` bytes at `align`.
///
/// The region is a whole number of spans aligned to at least [`SPAN_SIZE`], and
/// the block starts at its base. Only the rounded-up request stays mapped,
/// whatever the alignment.
pub fn map_large(size: usize, align: usize) -> Result<NonNull<Span>> {
  let exhausted = AllocError::Exhausted { bytes: size };
  let len = size
    .checked_add(SPAN_SIZE - 1)
    .map(|v| v & !(SPAN_SIZE - 1))
    .ok_or(exhausted)?;

  let desc = alloc_descriptor()?;
  let base = unsafe { os_map_aligned(len, align.max(SPAN_SIZE)) };
  if base.is_null() {
    recycle_descriptor(desc.as_ptr());
    return Err(exhausted);
  }

  unsafe {
    let span = &mut *desc.as_ptr();
    span.base = base;
    span.len = len;
    span.user = base;
    span.slot_size = 0;
    span.class = 0;
    span.kind = SpanKind::Large;
    span.in_partial = false;
    span.capacity = 1;
    span.free_count = 0;
    span.free = null_mut();
    span.bump = null_mut();
    span.prev = null_mut();
    span.next = null_mut();
    span.magic = SPAN_MAGIC;
  }
  Ok(desc)
}

/// Unmap a large region. The span must be unregistered.
pub unsafe fn unmap_large(span: NonNull<Span>) {
  let (base, len) = unsafe { ((*span.as_ptr()).base, (*span.as_ptr()).len) };
  unsafe { os_unmap(base, len) };
  recycle_descriptor(span.as_ptr());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::size_class::{class_to_size, size_to_class};

  #[test]
  fn fresh_span_is_fully_free_and_slots_are_in_bounds() {
    let class = size_to_class(48);
    let span = acquire_span(class).unwrap();
    let s = unsafe { &mut *span.as_ptr() };
    assert_eq!(s.base as usize % SPAN_SIZE, 0);
    assert!(s.is_fully_free());
    assert_eq!(s.slot_size, class_to_size(class));
    assert!(s.free.is_null());
    assert_eq!(s.bump, s.base);

    let (head, n) = unsafe { s.take_slots(10) };
    assert_eq!(n, 10);
    assert_eq!(s.free_count, s.capacity - 10);
    assert_eq!(s.bump as usize, s.base as usize + 10 * s.slot_size);

    let mut cursor = head;
    let mut seen = 0;
    while !cursor.is_null() {
      assert!(s.contains(cursor as usize));
      assert!(s.is_block_start(cursor as usize));
      let next = unsafe { (*cursor).next };
      unsafe { s.put_slot(cursor) };
      cursor = next;
      seen += 1;
    }
    assert_eq!(seen, 10);
    assert!(s.is_fully_free());

    // Returned slots are reused before anything new is carved.
    let bump = s.bump;
    let (_, n) = unsafe { s.take_slots(12) };
    assert_eq!(n, 12);
    assert_eq!(s.bump as usize, bump as usize + 2 * s.slot_size);
    unsafe { release_span(span) };
  }

  fn resident_pages(base: *mut u8, len: usize) -> usize {
    let mut vec = vec![0u8; len / crate::PAGE_SIZE];
    assert_eq!(unsafe { libc::mincore(base.cast(), len, vec.as_mut_ptr()) }, 0);
    vec.iter().filter(|&&v| v & 1 != 0).count()
  }

  #[test]
  fn formatting_leaves_slot_memory_untouched() {
    let span = acquire_span(size_to_class(32)).unwrap();
    let s = unsafe { &mut *span.as_ptr() };
    assert_eq!(resident_pages(s.base, s.len), 0);

    let (head, n) = unsafe { s.take_slots(4) };
    assert_eq!(n, 4);
    assert_eq!(head as usize, s.base as usize);
    assert_eq!(resident_pages(s.base, s.len), 1);
    unsafe { release_span(span) };
  }

  #[test]
  fn carved_and_returned_slots_are_known_free() {
    let span = acquire_span(size_to_class(256)).unwrap();
    let s = unsafe { &mut *span.as_ptr() };
    let (head, n) = unsafe { s.take_slots(2) };
    assert_eq!(n, 2);
    let first = head as usize;
    let second = unsafe { (*head).next } as usize;

    assert!(!s.holds_free(first));
    assert!(!s.holds_free(second));
    assert!(s.holds_free(s.bump as usize));

    unsafe { s.put_slot(first as *mut FreeSlot) };
    assert!(s.holds_free(first));
    assert!(!s.holds_free(second));
    unsafe { release_span(span) };
  }

  #[test]
  fn take_more_than_available() {
    let class = size_to_class(32 * 1024);
    let span = acquire_span(class).unwrap();
    let s = unsafe { &mut *span.as_ptr() };
    let (_, n) = unsafe { s.take_slots(100) };
    assert_eq!(n, 2);
    assert!(s.free.is_null());
    assert_eq!(s.bump as usize, s.base as usize + SPAN_SIZE);
    let (head, n) = unsafe { s.take_slots(1) };
    assert!(head.is_null());
    assert_eq!(n, 0);
    unsafe { release_span(span) };
  }

  #[test]
  fn interior_pointer_is_not_block_start() {
    let span = acquire_span(size_to_class(64)).unwrap();
    let s = unsafe { &*span.as_ptr() };
    assert!(s.is_block_start(s.base as usize + 64));
    assert!(!s.is_block_start(s.base as usize + 65));
    assert!(!s.is_block_start(s.base as usize - 64));
    unsafe { release_span(span) };
  }

  #[test]
  fn large_region_honors_alignment() {
    let align = 4 * SPAN_SIZE;
    let span = map_large(100_000, align).unwrap();
    let s = unsafe { &*span.as_ptr() };
    assert_eq!(s.user as usize % align, 0);
    assert_eq!(s.user, s.base);
    assert_eq!(s.len, 2 * SPAN_SIZE);
    assert!(s.usable_size(s.user) >= 100_000);
    assert!(s.is_block_start(s.user as usize));
    unsafe { unmap_large(span) };
  }

  #[test]
  fn huge_alignment_maps_only_the_request() {
    let align = 1 << 36;
    let span = map_large(16, align).unwrap();
    let s = unsafe { &*span.as_ptr() };
    assert_eq!(s.base as usize % align, 0);
    assert_eq!(s.len, SPAN_SIZE);
    assert_eq!(s.usable_size(s.user), SPAN_SIZE);
    unsafe { unmap_large(span) };
  }

  #[test]
  fn oversized_large_request_is_exhausted() {
    assert_eq!(
      map_large(usize::MAX - 10, 64).unwrap_err(),
      AllocError::Exhausted {
        bytes: usize::MAX - 10
      }
    );
  }

  #[test]
  fn list_push_remove() {
    let a = acquire_span(0).unwrap().as_ptr();
    let b = acquire_span(0).unwrap().as_ptr();
    let mut list = SpanList::new();
    unsafe {
      list.push_front(a);
      list.push_front(b);
      assert_eq!(list.len(), 2);
      list.remove(a);
      assert_eq!(list.head(), b);
      assert_eq!(list.pop_front().map(NonNull::as_ptr), Some(b));
      assert!(list.pop_front().is_none());
      release_span(NonNull::new_unchecked(a));
      release_span(NonNull::new_unchecked(b));
    }
  }
}
