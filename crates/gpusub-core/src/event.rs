//! Events and fences.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gpusub_hw::HwCaps;
use gpusub_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool};

use crate::backend::{WaitParams, WaitStatus};
use crate::csr::CommandStreamReceiver;
use crate::error::{Result, SubmitError};

pub const EVENT_STATE_CLEARED: u64 = 0;
pub const EVENT_STATE_SIGNALED: u64 = 1;

/// GPU-visible completion flag with one slot per partition.
#[derive(Debug)]
pub struct Event {
    mem: Arc<MemoryManager>,
    alloc: Arc<GraphicsAllocation>,
    stride: u64,
    max_partitions: u32,
    used_partitions: AtomicU32,
}

impl Event {
    pub fn new(mem: Arc<MemoryManager>, caps: &HwCaps) -> Result<Self> {
        let stride = u64::from(caps.post_sync_stride.max(8));
        let max_partitions = caps.tile_count.max(1);
        let alloc = mem
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                stride * u64::from(max_partitions),
                AllocationType::TagBuffer,
                MemoryPool::System,
            ))
            .ok_or(SubmitError::OutOfHostMemory)?;
        Ok(Self {
            mem,
            alloc,
            stride,
            max_partitions,
            used_partitions: AtomicU32::new(1),
        })
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.alloc
    }

    pub fn gpu_address(&self) -> u64 {
        self.alloc.gpu_address()
    }

    pub fn partition_address(&self, partition: u32) -> u64 {
        self.gpu_address() + u64::from(partition) * self.stride
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn used_partitions(&self) -> u32 {
        self.used_partitions.load(Ordering::Acquire)
    }

    /// Called when a signal is recorded by a list spanning `partitions` tiles.
    pub fn set_used_partitions(&self, partitions: u32) {
        self.used_partitions
            .store(partitions.clamp(1, self.max_partitions), Ordering::Release);
    }

    pub fn host_signal(&self) -> Result<()> {
        for partition in 0..self.used_partitions() {
            self.mem
                .write_u64(self.partition_address(partition), EVENT_STATE_SIGNALED)?;
        }
        Ok(())
    }

    pub fn is_signaled(&self) -> bool {
        (0..self.used_partitions()).all(|p| {
            self.mem
                .read_u64(self.partition_address(p))
                .is_ok_and(|v| v == EVENT_STATE_SIGNALED)
        })
    }

    pub fn query_status(&self) -> Result<()> {
        if self.is_signaled() {
            Ok(())
        } else {
            Err(SubmitError::NotReady)
        }
    }

    /// Spin on the event memory; `u64::MAX` waits forever.
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        let params = WaitParams::from_timeout_ns(timeout_ns);
        let start = Instant::now();
        loop {
            if self.is_signaled() {
                return Ok(());
            }
            if params.enable_timeout && start.elapsed() >= params.timeout {
                return Err(SubmitError::NotReady);
            }
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    pub fn reset(&self) -> Result<()> {
        self.alloc.fill(0, self.alloc.size() as usize, 0)?;
        self.used_partitions.store(1, Ordering::Release);
        Ok(())
    }
}

/// Completion of one queue submission, tracked by task count.
#[derive(Debug)]
pub struct Fence {
    csr: Arc<CommandStreamReceiver>,
    /// Zero until the fence rides along with a submission.
    task_count: AtomicU64,
}

impl Fence {
    pub(crate) fn new(csr: Arc<CommandStreamReceiver>) -> Self {
        Self {
            csr,
            task_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.csr
    }

    pub(crate) fn assign(&self, task_count: u64) {
        self.task_count.store(task_count, Ordering::Release);
    }

    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn query_status(&self) -> Result<()> {
        let task_count = self.task_count();
        if task_count == 0 || self.csr.completed_task_count() < task_count {
            return Err(SubmitError::NotReady);
        }
        Ok(())
    }

    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        let task_count = self.task_count();
        if task_count == 0 {
            return Err(SubmitError::NotReady);
        }
        match self
            .csr
            .wait_for_task_count(task_count, WaitParams::from_timeout_ns(timeout_ns))
        {
            WaitStatus::Ready => Ok(()),
            WaitStatus::NotReady => Err(SubmitError::NotReady),
            WaitStatus::GpuHang => Err(SubmitError::DeviceLost),
        }
    }

    pub fn reset(&self) {
        self.task_count.store(0, Ordering::Release);
    }
}
