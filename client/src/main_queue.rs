//! Hand-off from the receive thread to the thread that owns the world

use std::mem;
use std::sync::{Mutex, PoisonError};

/// FIFO of work posted from other threads and run by the owner. The lock is
/// held only for a push or a swap, never while jobs run.
#[derive(Debug)]
pub struct MainThreadQueue<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> Default for MainThreadQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<T> MainThreadQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, item: T) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    /// Takes everything posted so far, oldest first.
    pub fn drain(&self) -> Vec<T> {
        mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
