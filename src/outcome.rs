//! Single-assignment outcome cell.
//!
//! Workers race to publish the terminal outcome of a run; the first write
//! wins and later writes are rejected. Readers block until the cell is set.

use std::sync::{Condvar, Mutex, PoisonError};

pub struct Outcome<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Outcome<T> {
    pub fn new() -> Self {
        Outcome {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Publishes a value. Returns `None` if this call won the assignment;
    /// a losing value is handed back so the caller can dispose of it.
    pub fn set(&self, value: T) -> Option<T> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Some(value);
        }
        *slot = Some(value);
        self.cond.notify_all();
        return None;
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Blocks until the cell is set, leaving the value in place.
    pub fn wait(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        while slot.is_none() {
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the cell is set, then moves the value out.
    pub fn wait_take(&self) -> T {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Outcome::new()
    }
}
