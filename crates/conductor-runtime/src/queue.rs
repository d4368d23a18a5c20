//! Ordered set of service names awaiting reconciliation.

use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Default)]
pub struct RegenerationQueue {
    names: Mutex<VecDeque<String>>,
}

impl RegenerationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `name` unless already queued. Returns whether it was added.
    pub fn push(&self, name: &str) -> bool {
        let mut names = self.names.lock();
        if names.iter().any(|n| n == name) {
            return false;
        }
        names.push_back(name.to_string());
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut names = self.names.lock();
        match names.iter().position(|n| n == name) {
            Some(idx) => {
                names.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().iter().any(|n| n == name)
    }

    /// Queued names in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.names.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}
