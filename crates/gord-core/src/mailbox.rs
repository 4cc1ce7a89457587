//! One-slot mailbox.
//!
//! Holds at most one pending value. Posting replaces whatever was pending;
//! taking drains it. Used to defer chain edits to the next loop boundary.

use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store `value`, returning the pending value it replaced.
    pub fn post(&self, value: T) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
    }

    /// Drain the pending value.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_post_wins() {
        let mb = Mailbox::new();
        assert_eq!(mb.post(1), None);
        assert_eq!(mb.post(2), Some(1));
        assert!(mb.is_pending());
        assert_eq!(mb.take(), Some(2));
        assert_eq!(mb.take(), None);
        assert!(!mb.is_pending());
    }
}
