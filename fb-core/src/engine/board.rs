//! Shared fan snapshot
//!
//! Readers always see a complete list: updates build a new list and swap
//! the pointer.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::smc::FanDescriptor;

#[derive(Debug, Clone)]
pub struct FanBoard {
    inner: Arc<RwLock<Arc<[FanDescriptor]>>>,
}

impl Default for FanBoard {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::from(Vec::new()))),
        }
    }
}

impl FanBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<[FanDescriptor]> {
        self.inner.read().clone()
    }

    pub fn replace(&self, fans: Vec<FanDescriptor>) {
        *self.inner.write() = Arc::from(fans);
    }

    /// Copy the current list, edit the copy, publish it
    pub fn update(&self, f: impl FnOnce(&mut Vec<FanDescriptor>)) {
        let mut next = self.snapshot().to_vec();
        f(&mut next);
        self.replace(next);
    }

    pub fn get(&self, index: u32) -> Option<FanDescriptor> {
        self.snapshot().iter().find(|f| f.index == index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
