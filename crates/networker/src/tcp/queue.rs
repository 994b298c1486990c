//! Thread-safe FIFO buffer for received messages.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// An ordered, internally synchronized queue of received units.
///
/// Cloning a `MessageQueue` yields another handle to the same buffer, so the
/// receive loop can push while callers poll from other tasks or threads.
pub struct MessageQueue<T> {
    items: Arc<Mutex<VecDeque<T>>>,
}

impl<T> MessageQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append a unit at the back.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Remove and return the oldest unit, or `None` if the queue is empty.
    pub fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Remove and return every buffered unit, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Number of buffered units.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether no units are buffered.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Discard every buffered unit.
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl<T: Clone> MessageQueue<T> {
    /// Copy of the buffered units, oldest first. The queue is left untouched.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }

    /// Copy of the oldest unit without removing it.
    pub fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .finish()
    }
}
