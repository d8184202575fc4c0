//! Non-allocating diagnostics.
//!
//! Everything here formats on the stack and writes straight to fd 2 through
//! `libc-print`, so it is safe to call from inside `malloc` while the
//! allocator itself is the process allocator.

/// Always-on error line: `tessera: file:line message`.
macro_rules! log_err {
  ($($arg:tt)*) => {{
    ::libc_print::libc_eprint!("tessera: {}:{} ", core::file!(), core::line!());
    ::libc_print::libc_eprintln!($($arg)*);
  }};
}

/// Span/cache traffic tracing, compiled in only with `debug-log`.
#[cfg(feature = "debug-log")]
macro_rules! log_debug {
  ($($arg:tt)*) => {{
    ::libc_print::libc_eprint!("tessera[debug]: {}:{} ", core::file!(), core::line!());
    ::libc_print::libc_eprintln!($($arg)*);
  }};
}

#[cfg(not(feature = "debug-log"))]
macro_rules! log_debug {
  ($($arg:tt)*) => {{
    if false {
      ::libc_print::libc_eprintln!($($arg)*);
    }
  }};
}

/// Report a contract violation and stop the process.
///
/// Only reached when misuse checks are compiled in.
macro_rules! misuse {
  ($($arg:tt)*) => {{
    log_err!($($arg)*);
    unsafe { ::libc::abort() }
  }};
}
