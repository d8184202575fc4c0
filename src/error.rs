use thiserror::Error;

/// Failures surfaced by the allocator's internal layers.
///
/// The public ABI never propagates these as values: [`AllocError::errno`]
/// turns them into the status code (or null result) the platform contract
/// expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The OS refused to hand out more address space.
  #[error("out of memory while reserving {bytes} bytes")]
  Exhausted { bytes: usize },
  /// Alignment is zero, not a power of two, or smaller than a pointer.
  #[error("invalid alignment {align}")]
  InvalidAlignment { align: usize },
  /// Address is not a live allocation of this allocator.
  #[error("address {addr:#x} is not owned by the allocator")]
  Misuse { addr: usize },
  /// Block is already free: sitting in a cache or on its span's free list.
  #[error("double free of {addr:#x}")]
  DoubleFree { addr: usize },
  /// Every thread-start staging record is claimed by an in-flight creation.
  #[error("thread staging ring exhausted ({capacity} records in flight)")]
  StagingFull { capacity: usize },
}

impl AllocError {
  /// Status code reported through the C ABI.
  pub const fn errno(self) -> i32 {
    match self {
      Self::Exhausted { .. } => libc::ENOMEM,
      Self::InvalidAlignment { .. } | Self::Misuse { .. } | Self::DoubleFree { .. } => {
        libc::EINVAL
      }
      Self::StagingFull { .. } => libc::EAGAIN,
    }
  }
}

pub type Result<T> = core::result::Result<T, AllocError>;
