use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::va::GpuVaArena;
use crate::{
    AllocationProperties, ContextId, GraphicsAllocation, IndirectAllocations, MemoryError, MemoryPool,
};

/// Start of the GPU virtual-address range handed out by [`MemoryManager`].
pub const GPU_VA_BASE: u64 = 0x0001_0000_0000;
const GPU_VA_SIZE: u64 = 1 << 40;

#[derive(Debug)]
struct ReuseEntry {
    alloc: Arc<GraphicsAllocation>,
    ctx: ContextId,
    task_count: u64,
}

#[derive(Debug)]
struct Inner {
    va: GpuVaArena,
    next_id: u64,
    /// Keyed by GPU base address.
    live: BTreeMap<u64, Arc<GraphicsAllocation>>,
    local_budget: Option<u64>,
    local_in_use: u64,
    failures_to_inject: u32,
    /// Requests let through before injected failures start.
    failures_skip: u32,
    reuse: Vec<ReuseEntry>,
}

/// Owns every [`GraphicsAllocation`] and resolves GPU addresses back to backing bytes.
#[derive(Debug)]
pub struct MemoryManager {
    inner: Mutex<Inner>,
    indirect: IndirectAllocations,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                va: GpuVaArena::new(GPU_VA_BASE, GPU_VA_SIZE),
                next_id: 1,
                live: BTreeMap::new(),
                local_budget: None,
                local_in_use: 0,
                failures_to_inject: 0,
                failures_skip: 0,
                reuse: Vec::new(),
            }),
            indirect: IndirectAllocations::default(),
        }
    }

    /// Limit the bytes of local-memory allocations that may be live at once.
    pub fn with_local_memory_budget(self, bytes: u64) -> Self {
        self.lock().local_budget = Some(bytes);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the next `count` allocation requests fail.
    pub fn inject_allocation_failures(&self, count: u32) {
        self.inject_allocation_failures_after(0, count);
    }

    /// Let `skip` allocation requests through, then fail the following `count`.
    pub fn inject_allocation_failures_after(&self, skip: u32, count: u32) {
        let mut inner = self.lock();
        inner.failures_skip = skip;
        inner.failures_to_inject = count;
    }

    pub fn indirect_allocations(&self) -> &IndirectAllocations {
        &self.indirect
    }

    /// Returns `None` when the request cannot be satisfied.
    pub fn allocate_graphics_memory_with_properties(
        &self,
        props: &AllocationProperties,
    ) -> Option<Arc<GraphicsAllocation>> {
        let mut inner = self.lock();
        if inner.failures_to_inject > 0 && inner.failures_skip > 0 {
            inner.failures_skip -= 1;
        } else if inner.failures_to_inject > 0 {
            inner.failures_to_inject -= 1;
            debug!(size = props.size, alloc_type = ?props.alloc_type, "injected allocation failure");
            return None;
        }
        if props.size == 0 {
            return None;
        }
        if props.pool == MemoryPool::Local {
            if let Some(budget) = inner.local_budget {
                if inner.local_in_use.saturating_add(props.size) > budget {
                    warn!(
                        size = props.size,
                        in_use = inner.local_in_use,
                        budget,
                        "local memory budget exhausted"
                    );
                    return None;
                }
            }
        }

        let gpu_address = inner.va.alloc(props.size, props.alignment)?;
        let id = inner.next_id;
        inner.next_id += 1;
        if props.pool == MemoryPool::Local {
            inner.local_in_use += props.size;
        }

        let alloc = Arc::new(GraphicsAllocation::new(id, gpu_address, props));
        inner.live.insert(gpu_address, alloc.clone());
        Some(alloc)
    }

    pub fn free(&self, alloc: &Arc<GraphicsAllocation>) {
        let mut inner = self.lock();
        Self::free_locked(&mut inner, alloc);
        drop(inner);
        self.indirect.unregister(alloc.id());
    }

    fn free_locked(inner: &mut Inner, alloc: &Arc<GraphicsAllocation>) {
        if inner.live.remove(&alloc.gpu_address()).is_some() && alloc.pool() == MemoryPool::Local {
            inner.local_in_use = inner.local_in_use.saturating_sub(alloc.size());
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn local_memory_in_use(&self) -> u64 {
        self.lock().local_in_use
    }

    /// Find the live allocation containing `gpu_address` and the offset inside it.
    pub fn find_by_gpu_address(&self, gpu_address: u64) -> Option<(Arc<GraphicsAllocation>, u64)> {
        let inner = self.lock();
        let (_, alloc) = inner.live.range(..=gpu_address).next_back()?;
        if alloc.contains(gpu_address) {
            Some((alloc.clone(), gpu_address - alloc.gpu_address()))
        } else {
            None
        }
    }

    fn resolve(&self, gpu_address: u64, len: usize) -> Result<(Arc<GraphicsAllocation>, u64), MemoryError> {
        self.find_by_gpu_address(gpu_address)
            .ok_or(MemoryError::BadGpuAddress {
                address: gpu_address,
                len,
            })
    }

    pub fn read(&self, gpu_address: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let (alloc, offset) = self.resolve(gpu_address, out.len())?;
        alloc.read(offset, out)
    }

    pub fn write(&self, gpu_address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let (alloc, offset) = self.resolve(gpu_address, data.len())?;
        alloc.write(offset, data)
    }

    pub fn read_u64(&self, gpu_address: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(gpu_address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, gpu_address: u64, value: u64) -> Result<(), MemoryError> {
        self.write(gpu_address, &value.to_le_bytes())
    }

    pub fn write_u32(&self, gpu_address: u64, value: u32) -> Result<(), MemoryError> {
        self.write(gpu_address, &value.to_le_bytes())
    }

    /// Park `alloc` until `ctx` has completed `task_count`.
    pub fn store_for_reuse(&self, alloc: Arc<GraphicsAllocation>, ctx: ContextId, task_count: u64) {
        alloc.set_resident(ctx, false);
        self.lock().reuse.push(ReuseEntry {
            alloc,
            ctx,
            task_count,
        });
    }

    pub fn reusable_count(&self) -> usize {
        self.lock().reuse.len()
    }

    /// Release parked allocations whose last use on `ctx` has completed.
    pub fn reclaim_completed(&self, ctx: ContextId, completed_task_count: u64) -> usize {
        let mut inner = self.lock();
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.reuse)
            .into_iter()
            .partition(|e| e.ctx == ctx && e.task_count <= completed_task_count);
        inner.reuse = pending;
        for entry in &done {
            Self::free_locked(&mut inner, &entry.alloc);
        }
        if !done.is_empty() {
            debug!(ctx, completed_task_count, freed = done.len(), "reclaimed parked allocations");
        }
        done.len()
    }
}
