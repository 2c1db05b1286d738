use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{ContextId, GraphicsAllocation, ResidencyContainer, UsageSnapshot};

/// Registry of unified-memory allocations that kernels may reach without naming them.
#[derive(Debug, Default)]
pub struct IndirectAllocations {
    inner: Mutex<BTreeMap<u64, Arc<GraphicsAllocation>>>,
    residency_passes: AtomicU64,
}

impl IndirectAllocations {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<GraphicsAllocation>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, alloc: Arc<GraphicsAllocation>) {
        self.lock().insert(alloc.id(), alloc);
    }

    pub fn unregister(&self, id: u64) -> Option<Arc<GraphicsAllocation>> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of residency passes performed so far.
    pub fn residency_passes(&self) -> u64 {
        self.residency_passes.load(Ordering::Relaxed)
    }

    /// Stamp every tracked allocation with `task_count` and add it to `residency`.
    ///
    /// Returns each allocation with the stamp and residency it had before the pass so a
    /// failed submission can roll back. The registry lock is held for the whole pass.
    pub fn make_indirect_allocations_resident(
        &self,
        ctx: ContextId,
        task_count: u64,
        residency: &mut ResidencyContainer,
    ) -> Vec<(Arc<GraphicsAllocation>, UsageSnapshot)> {
        let guard = self.lock();
        self.residency_passes.fetch_add(1, Ordering::Relaxed);
        let mut previous = Vec::with_capacity(guard.len());
        for alloc in guard.values() {
            previous.push((alloc.clone(), alloc.usage(ctx)));
            alloc.update_task_count(task_count, ctx);
            alloc.set_resident(ctx, true);
            residency.push(alloc.clone());
        }
        previous
    }
}
