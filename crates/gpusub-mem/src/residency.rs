use std::collections::HashSet;
use std::sync::Arc;

use crate::GraphicsAllocation;

/// Ordered set of allocations that must be resident for a submission.
#[derive(Debug, Default, Clone)]
pub struct ResidencyContainer {
    allocations: Vec<Arc<GraphicsAllocation>>,
    ids: HashSet<u64>,
}

impl ResidencyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the allocation was already present.
    pub fn push(&mut self, alloc: Arc<GraphicsAllocation>) -> bool {
        if !self.ids.insert(alloc.id()) {
            return false;
        }
        self.allocations.push(alloc);
        true
    }

    pub fn extend<'a>(&mut self, allocs: impl IntoIterator<Item = &'a Arc<GraphicsAllocation>>) {
        for alloc in allocs {
            self.push(alloc.clone());
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        self.allocations.iter()
    }

    pub fn clear(&mut self) {
        self.allocations.clear();
        self.ids.clear();
    }
}

impl<'a> IntoIterator for &'a ResidencyContainer {
    type Item = &'a Arc<GraphicsAllocation>;
    type IntoIter = std::slice::Iter<'a, Arc<GraphicsAllocation>>;

    fn into_iter(self) -> Self::IntoIter {
        self.allocations.iter()
    }
}
