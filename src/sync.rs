//! Spin lock used by the central tier.
//!
//! The allocator cannot sit on a lock that may itself allocate or park through
//! a global table, so contention is handled by spinning on one atomic.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  pub fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Value guarded by a [`SpinLock`].
pub struct SpinMutex<T> {
  lock: SpinLock,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
  pub const fn new(value: T) -> Self {
    Self {
      lock: SpinLock::new(),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinGuard<'_, T> {
    self.lock.lock();
    SpinGuard { mutex: self }
  }
}

pub struct SpinGuard<'a, T> {
  mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.mutex.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  fn drop(&mut self) {
    self.mutex.lock.unlock();
  }
}
