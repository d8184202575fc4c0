//! Thread creation and exit.
//!
//! Every thread that touches its cache gets a pthread key whose destructor
//! drains that cache once at exit. Threads created through [`NativeSpawner`]
//! (and, with the `c_api` feature, every caller of `pthread_create`) start in
//! a trampoline that arms the key before user code runs.
//!
//! The real start routine and argument travel through a static staging ring,
//! so interception never calls the allocator it is part of.

use core::cell::UnsafeCell;
use core::ffi::{c_int, c_void};
use core::ptr::{NonNull, null, null_mut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(feature = "c_api")]
use core::sync::atomic::AtomicPtr;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use libc::{pthread_attr_t, pthread_key_t, pthread_t};

use crate::error::{AllocError, Result};
use crate::stats::{self, COUNTERS};
use crate::thread_cache::finalize_current;

pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

type PthreadCreateFn =
  unsafe extern "C" fn(*mut pthread_t, *const pthread_attr_t, StartRoutine, *mut c_void) -> c_int;

pub const STAGING_CAPACITY: usize = 10_000;

// =============================================================================
// Staging ring
// =============================================================================

struct StartRecord {
  claimed: AtomicBool,
  routine: UnsafeCell<Option<StartRoutine>>,
  arg: UnsafeCell<*mut c_void>,
}

impl StartRecord {
  const fn new() -> Self {
    Self {
      claimed: AtomicBool::new(false),
      routine: UnsafeCell::new(None),
      arg: UnsafeCell::new(null_mut()),
    }
  }

  /// Read the staged pair and hand the record back to the ring.
  unsafe fn consume(&self) -> (Option<StartRoutine>, *mut c_void) {
    let staged = unsafe { ((*self.routine.get()).take(), *self.arg.get()) };
    self.claimed.store(false, Ordering::Release);
    staged
  }
}

/// Fixed ring of start records. A record is owned by whoever set its claim
/// flag until [`StartRecord::consume`] clears it; full rings refuse rather
/// than overwrite.
struct StagingRing<const N: usize> {
  records: [StartRecord; N],
  cursor: AtomicUsize,
}

unsafe impl<const N: usize> Sync for StagingRing<N> {}

impl<const N: usize> StagingRing<N> {
  const fn new() -> Self {
    Self {
      records: [const { StartRecord::new() }; N],
      cursor: AtomicUsize::new(0),
    }
  }

  fn stage(&self, routine: StartRoutine, arg: *mut c_void) -> Result<NonNull<StartRecord>> {
    for _ in 0..N {
      let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % N;
      let record = &self.records[idx];
      if record
        .claimed
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        unsafe {
          *record.routine.get() = Some(routine);
          *record.arg.get() = arg;
        }
        return Ok(NonNull::from(record));
      }
    }
    Err(AllocError::StagingFull { capacity: N })
  }
}

static STAGING: StagingRing<STAGING_CAPACITY> = StagingRing::new();

// =============================================================================
// Finalizer
// =============================================================================

static FINALIZER_KEY: OnceLock<Option<pthread_key_t>> = OnceLock::new();

/// Non-null value stored under the key; only its presence matters.
static ARMED: u8 = 1;

unsafe extern "C" fn thread_finalizer(_value: *mut c_void) {
  finalize_current();
}

fn finalizer_key() -> Option<pthread_key_t> {
  *FINALIZER_KEY.get_or_init(|| {
    let mut key: pthread_key_t = 0;
    let rc = unsafe { libc::pthread_key_create(&mut key, Some(thread_finalizer)) };
    if rc != 0 {
      log_err!("pthread_key_create failed ({}), thread caches disabled", rc);
      return None;
    }
    Some(key)
  })
}

/// Make sure the calling thread runs the finalizer when it exits. Idempotent;
/// after the finalizer has run (the key value is cleared by then) this arms
/// it again for the next destructor round.
pub fn arm_finalizer() -> bool {
  let Some(key) = finalizer_key() else {
    return false;
  };
  unsafe {
    if !libc::pthread_getspecific(key).is_null() {
      return true;
    }
    libc::pthread_setspecific(key, (&raw const ARMED).cast()) == 0
  }
}

extern "C" fn thread_trampoline(arg: *mut c_void) -> *mut c_void {
  let record = unsafe { &*(arg as *const StartRecord) };
  let (routine, arg) = unsafe { record.consume() };
  arm_finalizer();
  match routine {
    Some(routine) => routine(arg),
    None => {
      log_err!("thread started from an empty staging record");
      null_mut()
    }
  }
}

// =============================================================================
// Native pthread_create
// =============================================================================

/// The platform `pthread_create`, looked up past this library so the exported
/// interposer does not find itself.
#[cfg(feature = "c_api")]
fn real_pthread_create() -> Option<PthreadCreateFn> {
  static REAL_CREATE: AtomicPtr<c_void> = AtomicPtr::new(null_mut());

  let mut sym = REAL_CREATE.load(Ordering::Acquire);
  if sym.is_null() {
    sym = unsafe { libc::dlsym(libc::RTLD_NEXT, c"pthread_create".as_ptr()) };
    if sym.is_null() {
      log_err!("cannot resolve the next pthread_create");
      return None;
    }
    REAL_CREATE.store(sym, Ordering::Release);
  }
  Some(unsafe { core::mem::transmute::<*mut c_void, PthreadCreateFn>(sym) })
}

#[cfg(not(feature = "c_api"))]
fn real_pthread_create() -> Option<PthreadCreateFn> {
  Some(libc::pthread_create)
}

// =============================================================================
// Spawners
// =============================================================================

/// Creates threads whose caches are finalized at exit.
pub trait ThreadSpawner {
  /// Same contract as `pthread_create`: returns 0 or an errno value.
  unsafe fn spawn_raw(
    &self,
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
  ) -> c_int;
}

/// Spawner backed by the platform's `pthread_create`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeSpawner;

impl ThreadSpawner for NativeSpawner {
  unsafe fn spawn_raw(
    &self,
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
  ) -> c_int {
    let record = match STAGING.stage(start, arg) {
      Ok(record) => record,
      Err(err) => {
        stats::inc(&COUNTERS.staging_overruns);
        log_err!("refusing to create thread: {}", err);
        return err.errno();
      }
    };

    let Some(create) = real_pthread_create() else {
      unsafe { record.as_ref().consume() };
      return libc::EAGAIN;
    };

    let rc = unsafe { create(thread, attr, thread_trampoline, record.as_ptr().cast()) };
    if rc != 0 {
      unsafe { record.as_ref().consume() };
    }
    rc
  }
}

/// Returned by [`NativeSpawner::spawn`]; must be joined.
#[derive(Debug)]
#[must_use]
pub struct SpawnedThread {
  thread: pthread_t,
}

/// Exit value of a closure thread that panicked.
const PANICKED: *mut c_void = core::ptr::without_provenance_mut(1);

extern "C" fn run_boxed<F: FnOnce() + Send + 'static>(arg: *mut c_void) -> *mut c_void {
  let f = unsafe { Box::from_raw(arg as *mut F) };
  match panic::catch_unwind(AssertUnwindSafe(f)) {
    Ok(()) => null_mut(),
    Err(_) => PANICKED,
  }
}

impl NativeSpawner {
  /// Run `f` on a new thread.
  pub fn spawn<F>(&self, f: F) -> io::Result<SpawnedThread>
  where
    F: FnOnce() + Send + 'static,
  {
    let payload = Box::into_raw(Box::new(f));
    let mut thread: pthread_t = 0;
    let rc = unsafe { self.spawn_raw(&mut thread, null(), run_boxed::<F>, payload.cast()) };
    if rc != 0 {
      drop(unsafe { Box::from_raw(payload) });
      return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(SpawnedThread { thread })
  }
}

impl SpawnedThread {
  /// Wait for the thread. Its cache has been finalized when this returns.
  pub fn join(self) -> io::Result<()> {
    let mut ret: *mut c_void = null_mut();
    let rc = unsafe { libc::pthread_join(self.thread, &mut ret) };
    if rc != 0 {
      return Err(io::Error::from_raw_os_error(rc));
    }
    if ret == PANICKED {
      return Err(io::Error::other("spawned thread panicked"));
    }
    Ok(())
  }
}

/// Interposed `pthread_create`: every thread in the process goes through the
/// trampoline.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_create(
  thread: *mut pthread_t,
  attr: *const pthread_attr_t,
  start: StartRoutine,
  arg: *mut c_void,
) -> c_int {
  unsafe { NativeSpawner.spawn_raw(thread, attr, start, arg) }
}
