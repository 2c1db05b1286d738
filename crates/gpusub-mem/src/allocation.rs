use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::MemoryError;

/// Identifies the OS/engine context a task count belongs to.
pub type ContextId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    System,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationType {
    Buffer,
    CommandBuffer,
    RingBuffer,
    LinearStream,
    InternalHeap,
    Scratch,
    PrivateScratch,
    TagBuffer,
    PreemptionCsr,
    PrintfSurface,
    SyncBuffer,
    SvmGpu,
    SvmCpu,
    Image,
    KernelIsa,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationProperties {
    pub size: u64,
    pub alloc_type: AllocationType,
    pub pool: MemoryPool,
    pub alignment: u64,
}

impl AllocationProperties {
    pub const DEFAULT_ALIGNMENT: u64 = 4096;

    pub fn new(size: u64, alloc_type: AllocationType, pool: MemoryPool) -> Self {
        Self {
            size,
            alloc_type,
            pool,
            alignment: Self::DEFAULT_ALIGNMENT,
        }
    }
}

#[derive(Debug, Default)]
struct Usage {
    task_counts: HashMap<ContextId, u64>,
    resident: HashSet<ContextId>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A GPU-visible memory region with CPU-visible backing bytes.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: u64,
    gpu_address: u64,
    size: u64,
    pool: MemoryPool,
    alloc_type: AllocationType,
    storage: Mutex<Vec<u8>>,
    usage: Mutex<Usage>,
}

impl GraphicsAllocation {
    pub(crate) fn new(id: u64, gpu_address: u64, props: &AllocationProperties) -> Self {
        Self {
            id,
            gpu_address,
            size: props.size,
            pool: props.pool,
            alloc_type: props.alloc_type,
            storage: Mutex::new(vec![0u8; props.size as usize]),
            usage: Mutex::new(Usage::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.alloc_type
    }

    pub fn is_in_system_memory(&self) -> bool {
        self.pool == MemoryPool::System
    }

    pub fn contains(&self, gpu_address: u64) -> bool {
        gpu_address >= self.gpu_address && gpu_address - self.gpu_address < self.size
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                address: self.gpu_address.wrapping_add(offset),
                len,
            }),
        }
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(offset, out.len())?;
        let storage = lock(&self.storage);
        let start = offset as usize;
        out.copy_from_slice(&storage[start..start + out.len()]);
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check_range(offset, data.len())?;
        let mut storage = lock(&self.storage);
        let start = offset as usize;
        storage[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: u64, len: usize, value: u8) -> Result<(), MemoryError> {
        self.check_range(offset, len)?;
        let mut storage = lock(&self.storage);
        let start = offset as usize;
        storage[start..start + len].fill(value);
        Ok(())
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<(), MemoryError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Copy of `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// Run `f` over the whole backing store.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut storage = lock(&self.storage);
        f(&mut storage)
    }

    /// Last task count on `ctx` that referenced this allocation, if any.
    pub fn task_count(&self, ctx: ContextId) -> Option<u64> {
        lock(&self.usage).task_counts.get(&ctx).copied()
    }

    pub fn update_task_count(&self, value: u64, ctx: ContextId) {
        lock(&self.usage).task_counts.insert(ctx, value);
    }

    /// Put back a stamp captured before a submission that did not reach the GPU.
    pub fn restore_task_count(&self, previous: Option<u64>, ctx: ContextId) {
        let mut usage = lock(&self.usage);
        match previous {
            Some(v) => {
                usage.task_counts.insert(ctx, v);
            }
            None => {
                usage.task_counts.remove(&ctx);
            }
        }
    }

    /// Stamp and residency on `ctx`, captured before a submission so a failure can undo both.
    pub fn usage(&self, ctx: ContextId) -> UsageSnapshot {
        let usage = lock(&self.usage);
        UsageSnapshot {
            task_count: usage.task_counts.get(&ctx).copied(),
            resident: usage.resident.contains(&ctx),
        }
    }

    pub fn restore_usage(&self, snapshot: UsageSnapshot, ctx: ContextId) {
        self.restore_task_count(snapshot.task_count, ctx);
        self.set_resident(ctx, snapshot.resident);
    }

    pub fn is_resident(&self, ctx: ContextId) -> bool {
        lock(&self.usage).resident.contains(&ctx)
    }

    pub fn set_resident(&self, ctx: ContextId, resident: bool) {
        let mut usage = lock(&self.usage);
        if resident {
            usage.resident.insert(ctx);
        } else {
            usage.resident.remove(&ctx);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub task_count: Option<u64>,
    pub resident: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(size: u64) -> GraphicsAllocation {
        GraphicsAllocation::new(
            1,
            0x10_0000,
            &AllocationProperties::new(size, AllocationType::Buffer, MemoryPool::Local),
        )
    }

    #[test]
    fn stamps_are_per_context_and_restorable() {
        let a = alloc(64);
        assert_eq!(a.task_count(0), None);
        a.update_task_count(5, 0);
        a.update_task_count(9, 1);
        assert_eq!(a.task_count(0), Some(5));
        assert_eq!(a.task_count(1), Some(9));

        a.update_task_count(6, 0);
        a.restore_task_count(Some(5), 0);
        assert_eq!(a.task_count(0), Some(5));
        a.restore_task_count(None, 1);
        assert_eq!(a.task_count(1), None);
    }

    #[test]
    fn usage_snapshot_restores_stamp_and_residency() {
        let a = alloc(64);
        let before = a.usage(0);
        assert_eq!(before, UsageSnapshot { task_count: None, resident: false });
        a.update_task_count(3, 0);
        a.set_resident(0, true);
        a.restore_usage(before, 0);
        assert_eq!(a.task_count(0), None);
        assert!(!a.is_resident(0));
    }

    #[test]
    fn access_outside_allocation_is_rejected() {
        let a = alloc(16);
        a.write_u64(8, 0xAA).unwrap();
        assert_eq!(a.read_u64(8).unwrap(), 0xAA);
        assert!(matches!(a.write_u64(9, 1), Err(MemoryError::OutOfBounds { .. })));
        assert!(a.contains(0x10_000F));
        assert!(!a.contains(0x10_0010));
    }
}
