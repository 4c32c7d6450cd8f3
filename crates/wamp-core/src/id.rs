//! Session-scoped request id generation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::messages::{Id, MAX_ID};

/// Monotonic request id counter.
///
/// Ids start at 1 and wrap back to 1 after [`MAX_ID`]. Safe to share between
/// threads: concurrent callers never observe the same id.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose first id is `first` (clamped into `[1, MAX_ID]`).
    pub fn starting_at(first: Id) -> Self {
        Self {
            next: AtomicU64::new(first.clamp(1, MAX_ID)),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> Id {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current >= MAX_ID { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
