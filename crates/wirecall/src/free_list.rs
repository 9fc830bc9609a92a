//! Reusable pools of header objects.
//!
//! Each connection draws a request header per frame and a response header per
//! reply. Pools hand out [`Pooled`] guards that reset the value on acquisition
//! and give it back when dropped, whichever path the call takes.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Values that can be returned to their zero state before reuse.
pub trait Reset {
    /// Clears every field.
    fn reset(&mut self);
}

/// Idle values kept when no capacity is given.
pub const DEFAULT_IDLE_CAPACITY: usize = 64;

/// Mutex-guarded stack of idle values.
#[derive(Debug)]
pub struct FreeList<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Reset + Default> FreeList<T> {
    /// Creates a pool keeping at most [`DEFAULT_IDLE_CAPACITY`] idle values.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_IDLE_CAPACITY)
    }

    /// Creates a pool keeping at most `capacity` idle values.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Takes an idle value, or a fresh one when the pool is empty.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .pop();
        let mut value = recycled.unwrap_or_default();
        value.reset();
        Pooled {
            value,
            pool: Arc::clone(self),
        }
    }

    /// Number of values currently waiting for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    fn release(&self, value: T) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if idle.len() < self.capacity {
            idle.push(value);
        }
    }
}

impl<T: Reset + Default> Default for FreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Value on loan from a [`FreeList`].
#[derive(Debug)]
pub struct Pooled<T: Reset + Default> {
    value: T,
    pool: Arc<FreeList<T>>,
}

impl<T: Reset + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Reset + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Reset + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.value));
    }
}
