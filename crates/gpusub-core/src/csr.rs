//! Command stream receiver: the engine-facing end of submission.
//!
//! Everything that several queues on one engine share lives in [`CsrState`] behind a single
//! mutex. Queue operations take it once and pass `&mut CsrState` down.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use gpusub_hw::{write_cmd_at, HwCaps, HwCommand, MiBatchBufferEnd, MiBatchBufferStart, PreemptionMode};
use gpusub_mem::{
    AllocationProperties, AllocationType, ContextId, GraphicsAllocation, MemoryManager, MemoryPool,
    ResidencyContainer,
};
use tracing::{debug, warn};

use crate::backend::{Submission, SubmissionBackend, SubmissionStatus, WaitContext, WaitParams, WaitStatus};
use crate::cmdlist::EngineGroup;
use crate::config::SubmitConfig;
use crate::error::{Result, SubmitError};
use crate::heap::{HeapSet, SharedHeaps};
use crate::host_function::HostFunctionStreamer;
use crate::scratch::ScratchSpaceController;
use crate::stream_properties::StreamProperties;

const RING_SLOT_SIZE: u64 = 32;
const RING_SLOTS: u64 = 64;
const PREEMPTION_CSR_SIZE: u64 = 64 * 1024;

static NEXT_CSR_UID: AtomicU64 = AtomicU64::new(1);

/// Ring the engine is parked on under direct submission. Each slot jumps to one batch and
/// holds the END the batch jumps back to.
#[derive(Debug)]
struct DirectSubmissionRing {
    alloc: Arc<GraphicsAllocation>,
    next_slot: u64,
}

impl DirectSubmissionRing {
    fn slot_address(&self) -> u64 {
        self.alloc.gpu_address() + self.next_slot * RING_SLOT_SIZE
    }

    fn return_address(&self) -> u64 {
        self.slot_address() + MiBatchBufferStart::SIZE_BYTES as u64
    }

    fn write_slot(&self, batch_address: u64) -> Result<u64> {
        let mut slot = vec![0u8; RING_SLOT_SIZE as usize];
        write_cmd_at(
            &mut slot,
            0,
            &MiBatchBufferStart {
                address: batch_address,
                second_level: false,
                ppgtt: true,
            },
        );
        write_cmd_at(&mut slot, MiBatchBufferStart::SIZE_BYTES, &MiBatchBufferEnd);
        self.alloc.write(self.next_slot * RING_SLOT_SIZE, &slot)?;
        Ok(self.slot_address())
    }

    fn advance(&mut self) {
        self.next_slot = (self.next_slot + 1) % RING_SLOTS;
    }
}

/// A batch ready for [`CommandStreamReceiver::flush`].
#[derive(Clone, Copy, Debug)]
pub struct BatchBuffer<'a> {
    pub start_address: u64,
    pub ending_address: u64,
    pub residency: &'a ResidencyContainer,
    pub partition_count: u32,
    pub is_cooperative: bool,
}

#[derive(Debug)]
pub struct CsrState {
    pub task_count: u64,
    pub latest_flushed_task_count: u64,
    /// Hardware state as of the end of the last flushed batch.
    pub stream_properties: StreamProperties,
    pub preemption_mode: Option<PreemptionMode>,
    pub scratch: ScratchSpaceController,
    shared_heaps: Option<SharedHeaps>,
    temporary_allocations: Vec<(Arc<GraphicsAllocation>, u64)>,
    direct_ring: Option<DirectSubmissionRing>,
    preemption_allocation: Option<Arc<GraphicsAllocation>>,
}

impl CsrState {
    /// Park `alloc` until `task_count` completes.
    pub fn make_temporary(&mut self, alloc: Arc<GraphicsAllocation>, task_count: u64) {
        self.temporary_allocations.push((alloc, task_count));
    }

    pub fn temporary_allocation_count(&self) -> usize {
        self.temporary_allocations.len()
    }
}

pub struct CommandStreamReceiver {
    uid: u64,
    context_id: ContextId,
    engine: EngineGroup,
    caps: HwCaps,
    config: SubmitConfig,
    mem: Arc<MemoryManager>,
    tag: Arc<GraphicsAllocation>,
    host_functions: HostFunctionStreamer,
    active_partitions: AtomicU32,
    state: Mutex<CsrState>,
    backend: Mutex<Box<dyn SubmissionBackend>>,
}

impl std::fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("context_id", &self.context_id)
            .field("engine", &self.engine)
            .field("tag", &format_args!("{:#x}", self.tag.gpu_address()))
            .finish_non_exhaustive()
    }
}

impl CommandStreamReceiver {
    pub fn new(
        context_id: ContextId,
        engine: EngineGroup,
        caps: &HwCaps,
        config: &SubmitConfig,
        mem: Arc<MemoryManager>,
        backend: Box<dyn SubmissionBackend>,
    ) -> Result<Self> {
        let system = |size: u64, alloc_type: AllocationType| {
            mem.allocate_graphics_memory_with_properties(&AllocationProperties::new(
                size,
                alloc_type,
                MemoryPool::System,
            ))
            .ok_or(SubmitError::OutOfHostMemory)
        };
        let tag = system(
            u64::from(caps.post_sync_stride.max(8)) * u64::from(caps.tile_count.max(1)),
            AllocationType::TagBuffer,
        )?;
        let direct_ring = if config.direct_submission {
            Some(DirectSubmissionRing {
                alloc: system(RING_SLOT_SIZE * RING_SLOTS, AllocationType::RingBuffer)?,
                next_slot: 0,
            })
        } else {
            None
        };
        let host_functions = HostFunctionStreamer::new(&mem)?;

        Ok(Self {
            uid: NEXT_CSR_UID.fetch_add(1, Ordering::Relaxed),
            context_id,
            engine,
            caps: caps.clone(),
            config: config.clone(),
            tag,
            host_functions,
            active_partitions: AtomicU32::new(1),
            state: Mutex::new(CsrState {
                task_count: 0,
                latest_flushed_task_count: 0,
                stream_properties: StreamProperties::default(),
                preemption_mode: None,
                scratch: ScratchSpaceController::new(caps),
                shared_heaps: None,
                temporary_allocations: Vec::new(),
                direct_ring,
                preemption_allocation: None,
            }),
            backend: Mutex::new(backend),
            mem,
        })
    }

    /// Process-unique identity; lists remember which receiver's scratch they were patched for.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn engine(&self) -> EngineGroup {
        self.engine
    }

    pub fn caps(&self) -> &HwCaps {
        &self.caps
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.mem
    }

    pub fn tag_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.tag
    }

    pub fn tag_address(&self) -> u64 {
        self.tag.gpu_address()
    }

    pub fn host_functions(&self) -> &HostFunctionStreamer {
        &self.host_functions
    }

    pub fn lock_state(&self) -> MutexGuard<'_, CsrState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_backend(&self) -> MutexGuard<'_, Box<dyn SubmissionBackend>> {
        match self.backend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn task_count(&self) -> u64 {
        self.lock_state().task_count
    }

    pub fn latest_flushed_task_count(&self) -> u64 {
        self.lock_state().latest_flushed_task_count
    }

    pub fn committed_state(&self) -> StreamProperties {
        self.lock_state().stream_properties
    }

    pub fn preemption_mode(&self) -> Option<PreemptionMode> {
        self.lock_state().preemption_mode
    }

    pub fn active_partitions(&self) -> u32 {
        self.active_partitions.load(Ordering::Acquire)
    }

    pub fn post_sync_stride(&self) -> u64 {
        u64::from(self.caps.post_sync_stride.max(8))
    }

    /// One tag slot per active partition.
    pub fn tag_addresses(&self) -> Vec<u64> {
        (0..u64::from(self.active_partitions()))
            .map(|p| self.tag_address() + p * self.post_sync_stride())
            .collect()
    }

    /// Heaps immediate lists on this engine record into.
    pub fn shared_heaps(&self, state: &mut CsrState) -> Result<SharedHeaps> {
        if let Some(heaps) = &state.shared_heaps {
            return Ok(heaps.clone());
        }
        let heaps = HeapSet::new(self.mem.clone(), self.config.heap_size, self.caps.surface_state_size)?.shared();
        state.shared_heaps = Some(heaps.clone());
        Ok(heaps)
    }

    /// Context save area the preemption CSR base address points at.
    pub fn preemption_allocation(&self, state: &mut CsrState) -> Result<Arc<GraphicsAllocation>> {
        if let Some(alloc) = &state.preemption_allocation {
            return Ok(alloc.clone());
        }
        let alloc = self
            .mem
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                PREEMPTION_CSR_SIZE,
                AllocationType::PreemptionCsr,
                MemoryPool::Local,
            ))
            .ok_or(SubmitError::OutOfDeviceMemory)?;
        state.preemption_allocation = Some(alloc.clone());
        Ok(alloc)
    }

    /// Where a batch ending in a direct-submission jump must return to, if enabled.
    pub fn direct_submission_return_address(&self, state: &CsrState) -> Option<u64> {
        state.direct_ring.as_ref().map(DirectSubmissionRing::return_address)
    }

    /// Allocations every batch on this engine touches.
    pub fn add_own_allocations(&self, state: &CsrState, residency: &mut ResidencyContainer) {
        residency.push(self.tag.clone());
        residency.push(self.host_functions.allocation().clone());
        if let Some(ring) = &state.direct_ring {
            residency.push(ring.alloc.clone());
        }
        if let Some(alloc) = &state.preemption_allocation {
            residency.push(alloc.clone());
        }
    }

    pub fn set_active_partitions(&self, partitions: u32) {
        self.active_partitions
            .store(partitions.clamp(1, self.caps.tile_count.max(1)), Ordering::Release);
    }

    /// Hand `batch` to the backend. The task count advances exactly once, on success.
    pub fn flush(&self, state: &mut CsrState, batch: &BatchBuffer<'_>) -> SubmissionStatus {
        let task_count = state.task_count + 1;
        let start_address = match &state.direct_ring {
            Some(ring) => match ring.write_slot(batch.start_address) {
                Ok(address) => address,
                Err(err) => {
                    warn!(error = %err, "failed to write direct submission slot");
                    return SubmissionStatus::Failed;
                }
            },
            None => batch.start_address,
        };

        let submission = Submission {
            batch_address: start_address,
            ending_address: batch.ending_address,
            residency: batch.residency,
            task_count,
            partition_count: batch.partition_count,
            post_sync_stride: self.post_sync_stride(),
            is_cooperative: batch.is_cooperative,
            direct_submission: state.direct_ring.is_some(),
            context_id: self.context_id,
        };
        let status = self.lock_backend().submit_batch_buffer(&self.mem, &submission);
        if status != SubmissionStatus::Success {
            return status;
        }

        state.task_count = task_count;
        state.latest_flushed_task_count = task_count;
        if let Some(ring) = state.direct_ring.as_mut() {
            ring.advance();
        }
        for alloc in batch.residency {
            alloc.set_resident(self.context_id, true);
        }
        self.set_active_partitions(batch.partition_count);
        debug!(
            ctx = self.context_id,
            task_count,
            batch = format_args!("{:#x}", batch.start_address),
            residency = batch.residency.len(),
            "flushed batch"
        );
        status
    }

    /// Wait on every active partition's tag slot.
    ///
    /// Takes neither the state lock nor, between polling steps, the backend lock, so other
    /// threads can submit and poll while this waits.
    pub fn wait_for_task_count(&self, task_count: u64, params: WaitParams) -> WaitStatus {
        let tags = self.tag_addresses();
        let ctx = WaitContext {
            mem: &self.mem,
            tag_addresses: &tags,
            host_functions: Some(&self.host_functions),
        };
        let start = Instant::now();
        let status = loop {
            let status = self.lock_backend().wait_for_task_count(&ctx, task_count, params);
            if status != WaitStatus::NotReady {
                break status;
            }
            if params.enable_timeout && start.elapsed() >= params.timeout {
                break WaitStatus::NotReady;
            }
            std::thread::yield_now();
        };
        if status == WaitStatus::GpuHang {
            warn!(ctx = self.context_id, task_count, "gpu hang detected");
        }
        status
    }

    /// Lowest task count every active partition has written back.
    pub fn completed_task_count(&self) -> u64 {
        self.lock_backend().poll(&self.mem);
        self.tag_addresses()
            .iter()
            .map(|&address| self.mem.read_u64(address).unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    pub fn is_gpu_hang_detected(&self) -> bool {
        self.lock_backend().is_gpu_hang_detected()
    }

    /// Release temporaries and parked allocations whose last use has completed.
    pub fn clean_completed_allocations(&self, state: &mut CsrState, completed: u64) {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.temporary_allocations)
            .into_iter()
            .partition(|(_, task_count)| *task_count <= completed);
        state.temporary_allocations = pending;
        for (alloc, _) in &done {
            self.mem.free(alloc);
        }
        self.mem.reclaim_completed(self.context_id, completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crate::backend::{CompletionMode, SoftwareEngine};
    use gpusub_hw::{CmdStreamWriter, PipeControl, PipeControlFlags, PostSyncOp};

    fn csr_with(engine: SoftwareEngine, caps: &HwCaps, config: &SubmitConfig) -> (Arc<MemoryManager>, CommandStreamReceiver) {
        let mem = Arc::new(MemoryManager::new());
        let csr = CommandStreamReceiver::new(0, EngineGroup::Compute, caps, config, mem.clone(), Box::new(engine)).unwrap();
        (mem, csr)
    }

    fn tag_batch(mem: &MemoryManager, csr: &CommandStreamReceiver, task_count: u64, ending: Option<u64>) -> Arc<GraphicsAllocation> {
        let alloc = mem
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                4096,
                AllocationType::CommandBuffer,
                MemoryPool::System,
            ))
            .unwrap();
        let mut w = CmdStreamWriter::new();
        w.append(&PipeControl {
            flags: PipeControlFlags::CS_STALL | PipeControlFlags::WORKLOAD_PARTITION_OFFSET,
            post_sync: PostSyncOp::WriteImmediateData,
            address: csr.tag_address(),
            immediate_data: task_count,
        });
        match ending {
            Some(address) => w.append(&MiBatchBufferStart {
                address,
                second_level: false,
                ppgtt: true,
            }),
            None => w.append(&MiBatchBufferEnd),
        };
        alloc.write(0, w.as_bytes()).unwrap();
        alloc
    }

    #[test]
    fn failed_flush_does_not_advance_the_task_count() {
        let engine = SoftwareEngine::new(CompletionMode::Immediate);
        let (mem, csr) = csr_with(engine.clone(), &HwCaps::vfe_single_tile(), &SubmitConfig::default());
        let batch = tag_batch(&mem, &csr, 1, None);
        let residency = ResidencyContainer::new();
        let bb = BatchBuffer {
            start_address: batch.gpu_address(),
            ending_address: batch.gpu_address(),
            residency: &residency,
            partition_count: 1,
            is_cooperative: false,
        };

        engine.inject_submit_failure(SubmissionStatus::Failed);
        let mut state = csr.lock_state();
        assert_eq!(csr.flush(&mut state, &bb), SubmissionStatus::Failed);
        assert_eq!(state.task_count, 0);
        assert_eq!(state.latest_flushed_task_count, 0);

        assert_eq!(csr.flush(&mut state, &bb), SubmissionStatus::Success);
        assert_eq!(state.task_count, 1);
        drop(state);
        assert_eq!(csr.wait_for_task_count(1, WaitParams::infinite()), WaitStatus::Ready);
    }

    #[test]
    fn multi_partition_wait_watches_every_slot() {
        let engine = SoftwareEngine::new(CompletionMode::Deferred);
        let caps = HwCaps::cfe_multi_tile();
        let (mem, csr) = csr_with(engine.clone(), &caps, &SubmitConfig::default());
        let batch = tag_batch(&mem, &csr, 1, None);
        let residency = ResidencyContainer::new();
        let mut state = csr.lock_state();
        csr.flush(
            &mut state,
            &BatchBuffer {
                start_address: batch.gpu_address(),
                ending_address: batch.gpu_address(),
                residency: &residency,
                partition_count: 2,
                is_cooperative: false,
            },
        );
        drop(state);
        assert_eq!(csr.tag_addresses().len(), 2);

        // Only partition 0 reports completion.
        mem.write_u64(csr.tag_address(), 1).unwrap();
        assert_eq!(
            csr.wait_for_task_count(1, WaitParams::from_timeout_ns(1_000_000)),
            WaitStatus::NotReady
        );
        engine.complete_pending(&mem);
        assert_eq!(csr.wait_for_task_count(1, WaitParams::infinite()), WaitStatus::Ready);
        assert_eq!(csr.completed_task_count(), 1);
    }

    #[test]
    fn infinite_wait_leaves_the_backend_free_for_other_threads() {
        let engine = SoftwareEngine::new(CompletionMode::Deferred);
        let (mem, csr) = csr_with(engine.clone(), &HwCaps::vfe_single_tile(), &SubmitConfig::default());
        let batch = tag_batch(&mem, &csr, 1, None);
        let residency = ResidencyContainer::new();
        let mut state = csr.lock_state();
        assert_eq!(
            csr.flush(
                &mut state,
                &BatchBuffer {
                    start_address: batch.gpu_address(),
                    ending_address: batch.gpu_address(),
                    residency: &residency,
                    partition_count: 1,
                    is_cooperative: false,
                },
            ),
            SubmissionStatus::Success
        );
        drop(state);

        let waiting = AtomicBool::new(false);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                waiting.store(true, Ordering::SeqCst);
                csr.wait_for_task_count(1, WaitParams::infinite())
            });
            while !waiting.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            std::thread::sleep(std::time::Duration::from_millis(5));

            // Both go through the backend lock the waiter polls under.
            assert_eq!(csr.completed_task_count(), 0);
            assert!(!csr.is_gpu_hang_detected());

            assert_eq!(engine.complete_pending(&mem), 1);
            assert_eq!(waiter.join().unwrap(), WaitStatus::Ready);
        });
        assert_eq!(csr.completed_task_count(), 1);
    }

    #[test]
    fn direct_submission_returns_into_the_ring() {
        let engine = SoftwareEngine::new(CompletionMode::Immediate);
        let config = SubmitConfig {
            direct_submission: true,
            ..SubmitConfig::default()
        };
        let (mem, csr) = csr_with(engine.clone(), &HwCaps::vfe_single_tile(), &config);
        let residency = ResidencyContainer::new();

        for task_count in 1..=3 {
            let mut state = csr.lock_state();
            let ret = csr.direct_submission_return_address(&state).unwrap();
            let batch = tag_batch(&mem, &csr, task_count, Some(ret));
            let status = csr.flush(
                &mut state,
                &BatchBuffer {
                    start_address: batch.gpu_address(),
                    ending_address: batch.gpu_address(),
                    residency: &residency,
                    partition_count: 1,
                    is_cooperative: false,
                },
            );
            assert_eq!(status, SubmissionStatus::Success);
            assert_ne!(csr.direct_submission_return_address(&state), Some(ret));
        }
        assert_eq!(csr.completed_task_count(), 3);
        assert!(!engine.is_gpu_hang_detected());
    }
}
