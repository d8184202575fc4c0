//! Size classes for small allocations.
//!
//! 16..=128 in 16-byte steps, then four classes per doubling up to
//! [`CLASSES_MAX_SIZE`]. Pure `const` arithmetic: safe to call before anything
//! else in the allocator exists.

use crate::config::Tunables;
use crate::{MIN_ALIGN, SPAN_SIZE, align_up};

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Largest slot size served from spans; anything bigger takes the large path.
pub const CLASSES_MAX_SIZE: usize = SPAN_SIZE / 2;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

const fn count_size_classes() -> usize {
  let mut class = 0;
  while class_to_size(class) < CLASSES_MAX_SIZE {
    class += 1;
  }
  class + 1
}

/// Total number of size classes for small allocations.
pub const CLASSES_COUNT: usize = count_size_classes();

/// Sentinel returned by the classifiers for requests that bypass size classes.
pub const LARGE_CLASS: usize = CLASSES_COUNT;

const _: () = assert!(class_to_size(0) == 16);
const _: () = assert!(class_to_size(CLASSES_COUNT - 1) == CLASSES_MAX_SIZE);
const _: () = assert!(CLASSES_COUNT <= u8::MAX as usize);

/// Immutable descriptor of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
  pub id: usize,
  pub slot_size: usize,
  pub slots_per_span: usize,
}

impl SizeClass {
  /// Slots moved per central refill (never more than a span holds).
  pub fn refill_batch(&self, t: &Tunables) -> usize {
    t.refill_batch.clamp(1, self.slots_per_span)
  }

  /// Cached slots tolerated before the thread cache drains a batch.
  ///
  /// Capped at two spans' worth so big classes do not pin megabytes per thread.
  pub fn high_water(&self, t: &Tunables) -> usize {
    t.high_water
      .min(2 * self.slots_per_span)
      .max(self.refill_batch(t))
  }

  /// Range a thread bin's adaptive batch moves in: a quarter to four times
  /// the configured batch, never past one span.
  pub fn batch_bounds(&self, t: &Tunables) -> (usize, usize) {
    let base = self.refill_batch(t);
    ((base / 4).max(1), (base * 4).min(self.slots_per_span))
  }

  /// High-water mark for a bin running at `batch`, scaled from the configured
  /// one.
  pub fn high_water_for(&self, batch: usize, t: &Tunables) -> usize {
    (self.high_water(t) * batch / self.refill_batch(t)).clamp(batch, 2 * self.slots_per_span)
  }
}

/// Descriptor for `class`. `class` must be below [`CLASSES_COUNT`].
pub const fn size_class(class: usize) -> SizeClass {
  let slot_size = class_to_size(class);
  SizeClass {
    id: class,
    slot_size,
    slots_per_span: SPAN_SIZE / slot_size,
  }
}

/// Convert class index to slot size (inverse of [`size_to_class`]).
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = 128 << order;
    let size = align_up((base * GEO_MULTIPLIERS[sub]) / 16, MIN_ALIGN);

    if size > CLASSES_MAX_SIZE {
      CLASSES_MAX_SIZE
    } else {
      size
    }
  }
}

/// Smallest class whose slot holds `size` bytes, or [`LARGE_CLASS`].
#[inline(always)]
pub fn size_to_class(size: usize) -> usize {
  if size <= CLASSES_LINEAR_STEP {
    return 0;
  }
  if size > CLASSES_MAX_SIZE {
    return LARGE_CLASS;
  }

  // Linear range: ceil(size / 16) - 1
  if size <= 128 {
    return (size - 1) / CLASSES_LINEAR_STEP;
  }

  // Geometric range: find order via log2, then sub-class via thresholds
  let log2 = (usize::BITS as usize - 1) - size.leading_zeros() as usize;
  let order = log2 - 7;
  let base = 128usize << order;

  let t1 = align_up((base * GEO_MULTIPLIERS[1]) >> 4, MIN_ALIGN);
  let t2 = align_up((base * GEO_MULTIPLIERS[2]) >> 4, MIN_ALIGN);
  let t3 = align_up((base * GEO_MULTIPLIERS[3]) >> 4, MIN_ALIGN);

  let exceeded =
    (size > base) as usize + (size > t1) as usize + (size > t2) as usize + (size > t3) as usize;

  // Past the last threshold rolls over into the next doubling.
  let geo_index = (order + (exceeded >> 2)) * CLASSES_PER_DOUBLING + (exceeded & 3);
  CLASSES_LINEAR + geo_index - 1
}

/// Smallest class serving `size` bytes at `align`, or [`LARGE_CLASS`].
///
/// Slots start at a span base aligned to [`SPAN_SIZE`], so any class whose slot
/// size is a multiple of `align` hands out `align`-aligned slots.
pub fn class_for_alignment(size: usize, align: usize) -> usize {
  debug_assert!(align.is_power_of_two());
  if align <= MIN_ALIGN {
    return size_to_class(size);
  }
  let mut class = size_to_class(size.max(align));
  while class < CLASSES_COUNT && class_to_size(class) % align != 0 {
    class += 1;
  }
  class
}
