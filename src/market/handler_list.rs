//! RCU-style callback registry.
//!
//! The price hot path iterates handlers at >10 Hz while registration only
//! happens at session startup, so readers take an ArcSwap snapshot with no
//! contention and writers clone-and-store under a short mutex.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct HandlerList<E> {
    slice: ArcSwap<Vec<Handler<E>>>,
    write_lock: Mutex<()>,
}

impl<E> Default for HandlerList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> HandlerList<E> {
    pub fn new() -> Self {
        Self {
            slice: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Append a handler. Clone-and-store keeps in-flight snapshots valid.
    pub fn add(&self, handler: Handler<E>) {
        let _guard = self.write_lock.lock();
        let mut next: Vec<Handler<E>> = self.slice.load().as_ref().clone();
        next.push(handler);
        self.slice.store(Arc::new(next));
    }

    /// Remove by Arc pointer identity. No-op when absent.
    pub fn remove(&self, handler: &Handler<E>) {
        let _guard = self.write_lock.lock();
        let next: Vec<Handler<E>> = self
            .slice
            .load()
            .iter()
            .filter(|h| !Arc::ptr_eq(h, handler))
            .cloned()
            .collect();
        self.slice.store(Arc::new(next));
    }

    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.slice.store(Arc::new(Vec::new()));
    }

    /// Single atomic load; the returned slice is safe to iterate lock-free.
    pub fn snapshot(&self) -> Arc<Vec<Handler<E>>> {
        self.slice.load_full()
    }

    pub fn len(&self) -> usize {
        self.slice.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.load().is_empty()
    }

    /// Invoke every handler present at snapshot time, serially, in
    /// registration order. A panicking handler is logged and skipped; it
    /// must not abort the emission for the rest of the list.
    pub fn emit(&self, event: &E) {
        let snapshot = self.snapshot();
        for (idx, handler) in snapshot.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                warn!(handler_idx = idx, panic = %msg, "handler_panicked");
            }
        }
    }
}
