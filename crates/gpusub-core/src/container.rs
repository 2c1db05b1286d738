//! Command buffer chunks, heaps and residency backing one command list.

use std::sync::Arc;

use gpusub_hw::{encode_cmd, HwCommand, MiBatchBufferEnd, MiBatchBufferStart};
use gpusub_mem::{
    AllocationProperties, AllocationType, ContextId, GraphicsAllocation, MemoryManager, MemoryPool,
    ResidencyContainer,
};
use tracing::debug;

use crate::error::{Result, SubmitError};
use crate::heap::{lock_heaps, HeapSet, SharedHeaps};
use crate::patch::PatchDestination;

/// Bytes kept free at the end of every chunk for the chaining jump.
const CHAIN_RESERVE: u64 = MiBatchBufferStart::SIZE_BYTES as u64;

#[derive(Debug)]
pub struct CommandContainer {
    mem: Arc<MemoryManager>,
    chunk_size: u64,
    /// Chunks in execution order; the last one is being recorded into.
    buffers: Vec<Arc<GraphicsAllocation>>,
    used: u64,
    heaps: SharedHeaps,
    owns_heaps: bool,
    residency: ResidencyContainer,
}

fn allocate_command_buffer(mem: &MemoryManager, size: u64) -> Result<Arc<GraphicsAllocation>> {
    mem.allocate_graphics_memory_with_properties(&AllocationProperties::new(
        size,
        AllocationType::CommandBuffer,
        MemoryPool::System,
    ))
    .ok_or(SubmitError::OutOfHostMemory)
}

/// Park `alloc` behind its last use on `ctx`, or free it if it was never submitted.
pub(crate) fn release_allocation(mem: &MemoryManager, alloc: Arc<GraphicsAllocation>, ctx: ContextId) {
    match alloc.task_count(ctx) {
        Some(task_count) => mem.store_for_reuse(alloc, ctx, task_count),
        None => mem.free(&alloc),
    }
}

impl CommandContainer {
    /// Container with its own heaps, or recording into `shared_heaps` when given.
    pub fn new(
        mem: Arc<MemoryManager>,
        chunk_size: u64,
        heap_size: u64,
        surface_state_size: u32,
        shared_heaps: Option<SharedHeaps>,
    ) -> Result<Self> {
        let chunk_size = chunk_size.max(4096);
        let first = allocate_command_buffer(&mem, chunk_size)?;
        let (heaps, owns_heaps) = match shared_heaps {
            Some(heaps) => (heaps, false),
            None => (HeapSet::new(mem.clone(), heap_size, surface_state_size)?.shared(), true),
        };
        Ok(Self {
            mem,
            chunk_size,
            buffers: vec![first],
            used: 0,
            heaps,
            owns_heaps,
            residency: ResidencyContainer::new(),
        })
    }

    pub fn heaps(&self) -> &SharedHeaps {
        &self.heaps
    }

    pub fn owns_heaps(&self) -> bool {
        self.owns_heaps
    }

    pub fn residency(&self) -> &ResidencyContainer {
        &self.residency
    }

    pub fn add_to_residency(&mut self, alloc: Arc<GraphicsAllocation>) {
        self.residency.push(alloc);
    }

    pub fn command_buffers(&self) -> &[Arc<GraphicsAllocation>] {
        &self.buffers
    }

    /// Address execution starts at.
    pub fn start_address(&self) -> u64 {
        self.buffers[0].gpu_address()
    }

    /// Bytes used in the chunk currently recorded into.
    pub fn used(&self) -> u64 {
        self.used
    }

    fn current(&self) -> &Arc<GraphicsAllocation> {
        // Never empty: construction and reset keep at least one chunk.
        &self.buffers[self.buffers.len() - 1]
    }

    /// Make room for `size` bytes, chaining to a fresh chunk when the current one is full.
    fn ensure_space(&mut self, size: u64) -> Result<()> {
        if self.used + size + CHAIN_RESERVE <= self.current().size() {
            return Ok(());
        }
        let next = allocate_command_buffer(&self.mem, self.chunk_size.max(size + CHAIN_RESERVE))?;
        let jump = encode_cmd(&MiBatchBufferStart {
            address: next.gpu_address(),
            second_level: false,
            ppgtt: true,
        });
        self.current().write(self.used, &jump)?;
        debug!(
            chunk = self.buffers.len(),
            size = next.size(),
            gpu_address = next.gpu_address(),
            "command buffer chained to new chunk"
        );
        self.buffers.push(next);
        self.used = 0;
        Ok(())
    }

    /// Encode `cmd` at the end of the stream and return where it landed.
    pub fn append<T: HwCommand>(&mut self, cmd: &T) -> Result<PatchDestination> {
        self.append_bytes(&encode_cmd(cmd))
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<PatchDestination> {
        self.ensure_space(bytes.len() as u64)?;
        let alloc = self.current().clone();
        let offset = self.used;
        alloc.write(offset, bytes)?;
        self.used += bytes.len() as u64;
        Ok(PatchDestination::new(alloc, offset))
    }

    /// Terminate the stream. The chaining reserve guarantees the END fits.
    pub fn close(&mut self) -> Result<PatchDestination> {
        let alloc = self.current().clone();
        let offset = self.used;
        alloc.write(offset, &encode_cmd(&MiBatchBufferEnd))?;
        self.used += MiBatchBufferEnd::SIZE_BYTES as u64;
        Ok(PatchDestination::new(alloc, offset))
    }

    fn release(&self, alloc: Arc<GraphicsAllocation>, ctx: ContextId) {
        release_allocation(&self.mem, alloc, ctx);
    }

    /// Rewind the command stream only: the first chunk is reused, the rest are released.
    pub fn rewind_commands(&mut self, ctx: ContextId) -> Result<()> {
        let extra: Vec<_> = self.buffers.drain(1..).collect();
        for alloc in extra {
            self.release(alloc, ctx);
        }
        let first = self.current().clone();
        first.fill(0, first.size() as usize, 0)?;
        self.used = 0;
        self.residency.clear();
        Ok(())
    }

    /// Rewind for re-recording, including owned heaps.
    pub fn reset(&mut self, ctx: ContextId) -> Result<()> {
        self.rewind_commands(ctx)?;
        if self.owns_heaps {
            let retired = lock_heaps(&self.heaps).reset();
            for alloc in retired {
                self.release(alloc, ctx);
            }
        }
        Ok(())
    }

    /// Hand every chunk to the in-flight submission `task_count` and start a fresh one.
    ///
    /// Used by immediate lists, whose buffers are still executing when the next append records.
    pub fn retire_command_buffers(&mut self, ctx: ContextId, task_count: u64) -> Result<()> {
        let fresh = allocate_command_buffer(&self.mem, self.chunk_size)?;
        for alloc in std::mem::replace(&mut self.buffers, vec![fresh]) {
            self.mem.store_for_reuse(alloc, ctx, task_count);
        }
        self.used = 0;
        self.residency.clear();
        Ok(())
    }

    /// Every byte recorded so far, chunk by chunk, up to the current write position.
    pub fn recorded_bytes(&self) -> Vec<Vec<u8>> {
        let last = self.buffers.len() - 1;
        self.buffers
            .iter()
            .enumerate()
            .map(|(i, alloc)| {
                let len = if i == last { self.used } else { alloc.size() };
                alloc.bytes(0, len as usize).unwrap_or_default()
            })
            .collect()
    }
}
