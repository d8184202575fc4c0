//! Runs alone in its binary: it asserts process-wide counters.

use std::thread;

use tessera::api::{free, malloc};
use tessera::size_class::size_to_class;
use tessera::{class_outstanding, snapshot};

#[test]
fn exited_threads_return_every_cached_slot() {
  let class = size_to_class(40);
  let baseline = class_outstanding(class);
  let finalized = snapshot().threads_finalized;

  let handles: Vec<_> = (0..4)
    .map(|_| {
      thread::spawn(move || {
        for _ in 0..10 {
          let blocks: Vec<_> = (0..10).map(|_| malloc(40)).collect();
          for p in blocks {
            assert!(!p.is_null());
            unsafe { free(p) };
          }
        }
        // Slots are still parked in this thread's cache.
        assert!(class_outstanding(class) > baseline);
      })
    })
    .collect();
  for h in handles {
    h.join().unwrap();
  }

  assert_eq!(class_outstanding(class), baseline);
  assert_eq!(snapshot().threads_finalized, finalized + 4);
}
