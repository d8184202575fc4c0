//! Run-time tunables.
//!
//! Read once from the environment on first use and cached:
//! - `TESSERA_REFILL_BATCH`: slots moved from the central heap per refill (default 64).
//! - `TESSERA_HIGH_WATER`: cached slots per class before a batch is drained back
//!   (default twice the refill batch).
//! - `TESSERA_POOL_SPANS`: fully free spans kept for reuse before they are
//!   unmapped (default 64).
//!
//! The lookup goes through `libc::getenv` because `std::env::var` allocates,
//! and this runs inside the first `malloc` of the process.

use std::ffi::CStr;
use std::sync::OnceLock;

pub const DEFAULT_REFILL_BATCH: usize = 64;
pub const DEFAULT_POOL_SPANS: usize = 64;

/// Upper bound on any batch, keeps a single drain bounded.
const MAX_BATCH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
  pub refill_batch: usize,
  pub high_water: usize,
  pub pool_spans: usize,
}

impl Default for Tunables {
  fn default() -> Self {
    Self {
      refill_batch: DEFAULT_REFILL_BATCH,
      high_water: DEFAULT_REFILL_BATCH * 2,
      pool_spans: DEFAULT_POOL_SPANS,
    }
  }
}

impl Tunables {
  /// Build from raw values; anything missing or unparsable keeps its default.
  pub fn from_values(batch: Option<&[u8]>, high_water: Option<&[u8]>, pool: Option<&[u8]>) -> Self {
    let mut t = Self::default();
    if let Some(b) = batch.and_then(parse_usize).filter(|&b| b > 0) {
      t.refill_batch = b.min(MAX_BATCH);
      t.high_water = t.refill_batch * 2;
    }
    if let Some(h) = high_water.and_then(parse_usize) {
      // Draining a batch must leave the bin non-negative.
      t.high_water = h.clamp(t.refill_batch, MAX_BATCH * 2);
    }
    if let Some(p) = pool.and_then(parse_usize) {
      t.pool_spans = p;
    }
    t
  }

  fn from_env() -> Self {
    Self::from_values(
      getenv(c"TESSERA_REFILL_BATCH"),
      getenv(c"TESSERA_HIGH_WATER"),
      getenv(c"TESSERA_POOL_SPANS"),
    )
  }
}

static TUNABLES: OnceLock<Tunables> = OnceLock::new();

/// Process-wide tunables (reads the environment on first call).
pub fn tunables() -> &'static Tunables {
  TUNABLES.get_or_init(Tunables::from_env)
}

fn getenv(name: &CStr) -> Option<&'static [u8]> {
  let value = unsafe { libc::getenv(name.as_ptr()) };
  if value.is_null() {
    None
  } else {
    Some(unsafe { CStr::from_ptr(value) }.to_bytes())
  }
}

/// Decimal `usize` parser over raw bytes.
fn parse_usize(raw: &[u8]) -> Option<usize> {
  let trimmed = raw.trim_ascii();
  if trimmed.is_empty() {
    return None;
  }
  trimmed.iter().try_fold(0usize, |acc, &b| {
    if !b.is_ascii_digit() {
      return None;
    }
    acc.checked_mul(10)?.checked_add((b - b'0') as usize)
  })
}
