//! Generic bounded object pool.
//!
//! `acquire` hands out an idle item or builds a fresh overflow item via the
//! factory; running out of pooled items is never an error. `release` stores
//! the item back if the capacity allows and discards it otherwise. Live
//! counts are kept for the watchdog and for log lines.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    active: AtomicUsize,
}

impl<T> Pool<T> {
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
            active: AtomicUsize::new(0),
        }
    }

    /// Fill the pool up to capacity ahead of traffic.
    pub fn prefill(&self) {
        let mut items = self.items.lock();
        while items.len() < self.capacity {
            items.push((self.factory)());
        }
    }

    /// Take an idle item, or build an overflow item on miss.
    pub fn acquire(&self) -> T {
        self.active.fetch_add(1, Ordering::Relaxed);
        if let Some(item) = self.items.lock().pop() {
            return item;
        }
        (self.factory)()
    }

    /// Return an item. True when it was stored, false when the pool was at
    /// capacity and the item was discarded.
    pub fn release(&self, item: T) -> bool {
        self.forget();
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
            true
        } else {
            false
        }
    }

    /// Account for an acquired item that will never come back (consumed,
    /// torn down, or dead).
    pub fn forget(&self) {
        // Saturating: the count must never go negative.
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Drop every idle item.
    pub fn drain(&self) {
        self.items.lock().clear();
    }

    pub fn idle(&self) -> usize {
        self.items.lock().len()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
