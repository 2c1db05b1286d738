//! Command queues: turning closed lists into batches the receiver can flush.
//!
//! A submission locks the queue, then the receiver state, and holds both until the batch is
//! flushed or rolled back. The batch carries everything the lists assumed but did not program
//! themselves: scratch, the preemption mode, state reconciliation against what the engine last
//! committed, event waits and signals, and the task-count write the host waits on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use gpusub_hw::{
    decode_cmds, CmdStreamWriter, FlushDwFlags, GpgpuCsrBaseAddress, HwCmd, MiBatchBufferEnd,
    MiBatchBufferStart, MiFlushDw, MiLoadRegisterImm, MiSemaphoreWait, PipeControl,
    PipeControlFlags, PostSyncOp, PreemptionMode, SemaphoreCompare, StateSip,
    FRONT_END_SCRATCH_OFFSET, PREEMPTION_CONTROL_REGISTER, SEMAPHORE_WAIT_ADDRESS_OFFSET,
    SEMAPHORE_WAIT_DATA_OFFSET, STORE_DATA_IMM_ADDRESS_OFFSET, STORE_DATA_IMM_DATA_OFFSET,
};
use gpusub_mem::{
    align_up, AllocationProperties, AllocationType, GraphicsAllocation, MemoryPool, ResidencyContainer,
};
use tracing::{debug, error};

use crate::backend::{SubmissionStatus, WaitParams, WaitStatus};
use crate::cmdlist::{CommandList, EngineGroup};
use crate::container::release_allocation;
use crate::csr::{BatchBuffer, CommandStreamReceiver, CsrState};
use crate::device::{Device, DeviceShared};
use crate::error::{Result, SubmitError};
use crate::event::{Event, Fence, EVENT_STATE_SIGNALED};
use crate::heap::lock_heaps;
use crate::host_function::HostFunctionBinding;
use crate::patch::{truncated_le_bytes, CommandToPatch, PatchDestination, ScratchPatch};
use crate::printf::{PrintfBuffer, PrintfSink, TracingPrintfSink};
use crate::scratch::ScratchUpdate;
use crate::state_cmds::{self, FrontEndCmd};
use crate::stream_properties::{StateLeaves, StreamProperties};

/// Batches start on this boundary inside the queue's command buffers.
const BATCH_ALIGNMENT: u64 = 64;
const FRONT_END_PER_THREAD_SCRATCH_OFFSET: u64 = FRONT_END_SCRATCH_OFFSET as u64 + 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueMode {
    #[default]
    Asynchronous,
    /// Every execute waits for its batch to complete.
    Synchronous,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandQueueDesc {
    pub engine: EngineGroup,
    pub mode: QueueMode,
}

#[derive(Debug)]
struct RingBuffer {
    alloc: Arc<GraphicsAllocation>,
    /// Newest submission recorded into this buffer.
    task_count: u64,
}

#[derive(Debug)]
struct QueueState {
    buffers: Vec<RingBuffer>,
    current: usize,
    used: u64,
    sip_programmed: bool,
    last_submitted_task_count: u64,
    pending_printf: Vec<PrintfBuffer>,
    last_batch: Vec<u8>,
}

pub struct CommandQueue {
    device: Arc<DeviceShared>,
    csr: Arc<CommandStreamReceiver>,
    desc: CommandQueueDesc,
    state: Mutex<QueueState>,
    printf_sink: Arc<dyn PrintfSink>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("desc", &self.desc)
            .field("csr", &self.csr)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    pub fn create(device: &Device, desc: &CommandQueueDesc) -> Result<Self> {
        let shared = device.shared().clone();
        let mut buffers = Vec::with_capacity(shared.config.command_queue_buffer_count);
        for _ in 0..shared.config.command_queue_buffer_count {
            let alloc = shared
                .mem
                .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                    shared.config.command_queue_buffer_size,
                    AllocationType::CommandBuffer,
                    MemoryPool::System,
                ))
                .ok_or(SubmitError::OutOfHostMemory)?;
            buffers.push(RingBuffer { alloc, task_count: 0 });
        }
        Ok(Self {
            csr: device.csr(desc.engine).clone(),
            device: shared,
            desc: *desc,
            state: Mutex::new(QueueState {
                buffers,
                current: 0,
                used: 0,
                sip_programmed: false,
                last_submitted_task_count: 0,
                pending_printf: Vec::new(),
                last_batch: Vec::new(),
            }),
            printf_sink: Arc::new(TracingPrintfSink),
        })
    }

    /// Route drained kernel printf output to `sink` instead of the log.
    pub fn with_printf_sink(mut self, sink: Arc<dyn PrintfSink>) -> Self {
        self.printf_sink = sink;
        self
    }

    pub fn desc(&self) -> &CommandQueueDesc {
        &self.desc
    }

    pub fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.csr
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create_fence(&self) -> Fence {
        Fence::new(self.csr.clone())
    }

    pub fn last_submitted_task_count(&self) -> u64 {
        self.lock_state().last_submitted_task_count
    }

    /// The most recent batch as recorded, ending included.
    pub fn last_batch_commands(&self) -> Result<Vec<HwCmd>> {
        let state = self.lock_state();
        let cmds = decode_cmds(&state.last_batch).map_err(|err| SubmitError::Unknown(err.to_string()))?;
        Ok(cmds.into_iter().map(|(_, cmd)| cmd).collect())
    }

    /// GPU address with `size` free bytes in the queue's command buffers.
    ///
    /// Moving to the next buffer first waits until the engine is done with it.
    pub fn reserve_linear_stream_size(&self, size: u64) -> Result<u64> {
        let mut state = self.lock_state();
        let (alloc, offset) = self.reserve_in_ring(&mut state, size)?;
        Ok(alloc.gpu_address() + offset)
    }

    fn reserve_in_ring(&self, state: &mut QueueState, size: u64) -> Result<(Arc<GraphicsAllocation>, u64)> {
        let buffer_size = state.buffers[state.current].alloc.size();
        if size > buffer_size {
            return Err(SubmitError::InvalidArgument("batch exceeds the queue command buffer size"));
        }
        if state.used + size > buffer_size {
            let next = (state.current + 1) % state.buffers.len();
            let task_count = state.buffers[next].task_count;
            if task_count > 0 {
                match self.csr.wait_for_task_count(task_count, WaitParams::infinite()) {
                    WaitStatus::Ready => {}
                    WaitStatus::NotReady => return Err(SubmitError::NotReady),
                    WaitStatus::GpuHang => return Err(SubmitError::DeviceLost),
                }
            }
            debug!(buffer = next, waited_for = task_count, "queue switched command buffer");
            state.current = next;
            state.used = 0;
        }
        let offset = state.used;
        state.used = align_up(offset + size, BATCH_ALIGNMENT);
        Ok((state.buffers[state.current].alloc.clone(), offset))
    }

    pub fn execute_command_lists(
        &self,
        lists: &[&CommandList],
        fence: Option<&Fence>,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        if lists.is_empty() {
            return Err(SubmitError::InvalidArgument("no command lists to execute"));
        }
        for list in lists {
            if !list.is_closed() {
                return Err(SubmitError::InvalidArgument("command list is not closed"));
            }
            if list.engine() != self.desc.engine {
                return Err(SubmitError::InvalidArgument("command list engine does not match the queue"));
            }
        }
        if let Some(fence) = fence {
            if !Arc::ptr_eq(fence.csr(), &self.csr) {
                return Err(SubmitError::InvalidArgument("fence belongs to another engine"));
            }
        }

        let result = {
            let mut queue = self.lock_state();
            let mut csr = self.csr.lock_state();
            let saved_properties = csr.stream_properties;
            let saved_preemption = csr.preemption_mode;
            let result = self.submit(&mut queue, &mut csr, lists, fence, signal_event, wait_events);
            if result.is_err() {
                csr.stream_properties = saved_properties;
                csr.preemption_mode = saved_preemption;
            }
            result
        };
        result?;

        if self.desc.mode == QueueMode::Synchronous {
            self.synchronize(u64::MAX)?;
        }
        Ok(())
    }

    fn submit(
        &self,
        queue: &mut QueueState,
        csr: &mut CsrState,
        lists: &[&CommandList],
        fence: Option<&Fence>,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        let caps = &self.device.caps;
        let ctx = self.csr.context_id();
        let compute = self.desc.engine == EngineGroup::Compute;
        let next_task = csr.task_count + 1;

        let scratch_slot0 = lists.iter().map(|l| l.per_thread_scratch()[0]).max().unwrap_or(0);
        let scratch_slot1 = lists.iter().map(|l| l.per_thread_scratch()[1]).max().unwrap_or(0);
        let partitions = lists.iter().map(|l| l.partition_count()).max().unwrap_or(1);
        let is_cooperative = lists.iter().any(|l| l.is_cooperative());

        let mut residency = ResidencyContainer::new();
        let scratch_update = if compute {
            self.handle_scratch_space(csr, lists, scratch_slot0, scratch_slot1, &mut residency)?
        } else {
            ScratchUpdate::default()
        };

        let mut w = CmdStreamWriter::with_capacity(1024);
        let wants_sip = lists.iter().any(|l| l.preemption_mode() == PreemptionMode::MidThread);
        if compute && caps.mid_thread_preemption && wants_sip && !queue.sip_programmed {
            let context_save = self.csr.preemption_allocation(csr)?;
            w.append(&StateSip {
                sip_address: caps.sip_address,
            });
            w.append(&GpgpuCsrBaseAddress {
                address: context_save.gpu_address(),
            });
        }

        for event in wait_events {
            for partition in 0..event.used_partitions() {
                w.append(&MiSemaphoreWait {
                    address: event.partition_address(partition),
                    data: EVENT_STATE_SIGNALED,
                    compare: SemaphoreCompare::Equal,
                });
            }
            residency.push(event.allocation().clone());
        }

        let scratch_address = csr.scratch.scratch_patch_address();
        let scratch_field = csr.scratch.per_thread_scratch_field();
        let has_scratch = csr.scratch.scratch_allocation().is_some();

        for (i, list) in lists.iter().enumerate() {
            if compute {
                let mode = list.preemption_mode();
                if csr.preemption_mode != Some(mode) {
                    if self.device.config.preemption_cmd_sync_programming {
                        w.append(&PipeControl {
                            flags: PipeControlFlags::CS_STALL,
                            ..PipeControl::default()
                        });
                    }
                    w.append(&MiLoadRegisterImm {
                        register: PREEMPTION_CONTROL_REGISTER,
                        data: mode.register_value(),
                    });
                    debug!(from = ?csr.preemption_mode, to = ?mode, "preemption mode switched");
                    csr.preemption_mode = Some(mode);
                }

                let mut required = *list.required_state();
                if has_scratch {
                    required.front_end.scratch_offset.set_value(scratch_address);
                    required.front_end.per_thread_scratch_size.set_value(scratch_field);
                }
                let mut forced = StateLeaves::empty();
                if i == 0 {
                    if scratch_update.fe_dirty {
                        forced |= StateLeaves::FRONT_END;
                    }
                    if scratch_update.sba_dirty && !caps.heapless {
                        forced |= StateLeaves::STATE_BASE_ADDRESS;
                    }
                }
                let delta = (csr.stream_properties.compute_delta(&required, caps) | forced).groups();
                self.program_state(&mut w, &required, &csr.stream_properties, delta);
                csr.stream_properties.commit(&required, delta);
            }

            let scratch_controller_changed = list.swap_patched_for(self.csr.uid()) != self.csr.uid();
            self.patch_commands(list, scratch_address, scratch_field, scratch_controller_changed)?;
            w.append(&MiBatchBufferStart {
                address: list.container().start_address(),
                second_level: true,
                ppgtt: true,
            });
            self.collect_list_residency(list, &mut residency);

            if compute {
                let final_state = *list.final_state();
                csr.stream_properties.commit(&final_state, final_state.set_leaves());
            }
        }

        if let Some(event) = signal_event {
            event.set_used_partitions(partitions);
            self.append_post_sync(&mut w, event.gpu_address(), EVENT_STATE_SIGNALED, partitions);
            residency.push(event.allocation().clone());
        }
        self.append_post_sync(&mut w, self.csr.tag_address(), next_task, partitions);

        let ending_offset = w.len() as u64;
        match self.csr.direct_submission_return_address(csr) {
            Some(address) => w.append(&MiBatchBufferStart {
                address,
                second_level: false,
                ppgtt: true,
            }),
            None => w.append(&MiBatchBufferEnd),
        };
        let batch = w.finish();

        let (ring, offset) = self.reserve_in_ring(queue, batch.len() as u64)?;
        ring.write(offset, &batch)?;
        residency.push(ring.clone());
        self.csr.add_own_allocations(csr, &mut residency);

        let mut previous_usage: Vec<_> = residency.iter().map(|a| (a.clone(), a.usage(ctx))).collect();
        if lists.iter().any(|l| l.has_indirect_access()) {
            previous_usage.extend(
                self.device
                    .mem
                    .indirect_allocations()
                    .make_indirect_allocations_resident(ctx, next_task, &mut residency),
            );
        }
        for alloc in &residency {
            alloc.update_task_count(next_task, ctx);
        }

        let start_address = ring.gpu_address() + offset;
        let status = self.csr.flush(
            csr,
            &BatchBuffer {
                start_address,
                ending_address: start_address + ending_offset,
                residency: &residency,
                partition_count: partitions,
                is_cooperative,
            },
        );
        if status != SubmissionStatus::Success {
            for (alloc, usage) in previous_usage.into_iter().rev() {
                alloc.restore_usage(usage, ctx);
            }
            error!(ctx, task_count = next_task, ?status, "batch submission failed");
            return Err(match status {
                SubmissionStatus::OutOfMemory => SubmitError::OutOfDeviceMemory,
                SubmissionStatus::OutOfHostMemory => SubmitError::OutOfHostMemory,
                _ => SubmitError::Unknown(format!("batch submission failed: {status:?}")),
            });
        }

        queue.buffers[queue.current].task_count = next_task;
        queue.last_submitted_task_count = next_task;
        if compute && caps.mid_thread_preemption && wants_sip {
            queue.sip_programmed = true;
        }
        for buffer in lists.iter().flat_map(|l| l.printf_buffers().iter()) {
            let id = buffer.allocation().id();
            if !queue.pending_printf.iter().any(|p| p.allocation().id() == id) {
                queue.pending_printf.push(buffer.clone());
            }
        }
        queue.last_batch = batch;
        if let Some(fence) = fence {
            fence.assign(next_task);
        }
        debug!(
            ctx,
            task_count = next_task,
            lists = lists.len(),
            partitions,
            residency = residency.len(),
            "command lists executed"
        );
        Ok(())
    }

    /// Grow scratch to what `lists` need and point every list heap at it.
    fn handle_scratch_space(
        &self,
        csr: &mut CsrState,
        lists: &[&CommandList],
        slot0: u32,
        slot1: u32,
        residency: &mut ResidencyContainer,
    ) -> Result<ScratchUpdate> {
        let last_task_count = csr.task_count;
        let mut update = csr.scratch.set_required_scratch_space(
            &self.device.mem,
            slot0,
            slot1,
            last_task_count,
            self.csr.context_id(),
        )?;
        for list in lists {
            let mut heaps = lock_heaps(list.container().heaps());
            update = update | csr.scratch.program_heaps(&mut heaps)?;
        }
        if let Some(scratch) = csr.scratch.scratch_allocation() {
            residency.push(scratch.clone());
        }
        if let Some(private) = csr.scratch.private_scratch_allocation() {
            residency.push(private.clone());
        }
        Ok(update)
    }

    fn program_state(
        &self,
        w: &mut CmdStreamWriter,
        required: &StreamProperties,
        committed: &StreamProperties,
        groups: StateLeaves,
    ) {
        let caps = &self.device.caps;
        if groups.contains(StateLeaves::PIPELINE_SELECT) {
            w.append(&state_cmds::pipeline_select(
                &required.pipeline_select,
                &committed.pipeline_select,
            ));
        }
        if groups.contains(StateLeaves::STATE_COMPUTE_MODE) {
            w.append(&state_cmds::state_compute_mode(
                &required.state_compute_mode,
                &committed.state_compute_mode,
            ));
        }
        if groups.contains(StateLeaves::STATE_BASE_ADDRESS) && !caps.heapless {
            w.append(&PipeControl {
                flags: PipeControlFlags::CS_STALL
                    | PipeControlFlags::DC_FLUSH
                    | PipeControlFlags::TEXTURE_CACHE_INVALIDATE,
                ..PipeControl::default()
            });
            w.append(&state_cmds::state_base_address(
                &required.state_base_address,
                &committed.state_base_address,
            ));
        }
        if groups.contains(StateLeaves::FRONT_END) {
            match state_cmds::front_end(caps, &required.front_end, &committed.front_end) {
                FrontEndCmd::Vfe(cmd) => w.append(&cmd),
                FrontEndCmd::Cfe(cmd) => w.append(&cmd),
            };
        }
    }

    fn append_post_sync(&self, w: &mut CmdStreamWriter, address: u64, value: u64, partitions: u32) {
        match self.desc.engine {
            EngineGroup::Compute => {
                let mut flags = PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH;
                if partitions > 1 {
                    flags |= PipeControlFlags::WORKLOAD_PARTITION_OFFSET;
                }
                w.append(&PipeControl {
                    flags,
                    post_sync: PostSyncOp::WriteImmediateData,
                    address,
                    immediate_data: value,
                });
            }
            EngineGroup::Copy => {
                w.append(&MiFlushDw {
                    post_sync: PostSyncOp::WriteImmediateData,
                    flags: FlushDwFlags::STORE_QWORD,
                    address,
                    immediate_data: value,
                });
            }
        }
    }

    fn collect_list_residency(&self, list: &CommandList, residency: &mut ResidencyContainer) {
        let container = list.container();
        residency.extend(container.command_buffers());
        residency.extend(container.residency());
        residency.extend(lock_heaps(container.heaps()).allocations());
        residency.extend(list.printf_buffers().iter().map(PrintfBuffer::allocation));
        residency.extend(list.sync_buffers());
    }

    /// Resolve every deferred patch `list` recorded.
    ///
    /// Scratch patches already holding `scratch_address` are skipped unless the scratch
    /// controller changed since they were written. Host-function packets are rebound to this
    /// queue's receiver on every call.
    ///
    /// # Panics
    ///
    /// On an `Invalid` patch, or a scratch patch kind the hardware cannot take.
    pub fn patch_commands(
        &self,
        list: &CommandList,
        scratch_address: u64,
        per_thread_scratch_field: u32,
        scratch_controller_changed: bool,
    ) -> Result<()> {
        let caps = &self.device.caps;
        let streamer = self.csr.host_functions();
        let mut bindings: HashMap<usize, HostFunctionBinding> = HashMap::new();
        let mut bind = |index: usize| -> Result<HostFunctionBinding> {
            if let Some(binding) = bindings.get(&index) {
                return Ok(*binding);
            }
            let function = list
                .host_functions()
                .get(index)
                .ok_or(SubmitError::InvalidState("host function patch without a recorded function"))?;
            let binding = streamer.bind(function);
            bindings.insert(index, binding);
            Ok(binding)
        };

        let mut patches = list.commands_to_patch();
        for patch in patches.iter_mut() {
            match patch {
                CommandToPatch::FrontEndState(fe) => {
                    let dest = &fe.destination;
                    dest.alloc
                        .write_u64(dest.offset + FRONT_END_SCRATCH_OFFSET as u64, scratch_address)?;
                    dest.alloc.write(
                        dest.offset + FRONT_END_PER_THREAD_SCRATCH_OFFSET,
                        &per_thread_scratch_field.to_le_bytes(),
                    )?;
                }
                CommandToPatch::ComputeWalkerInlineDataScratch(p) => {
                    assert!(
                        caps.supports_inline_data_scratch_patch(),
                        "inline-data scratch patch on hardware without heapless dispatch"
                    );
                    patch_scratch(p, scratch_address, scratch_controller_changed)?;
                }
                CommandToPatch::ComputeWalkerImplicitArgsScratch(p) => {
                    assert!(
                        caps.supports_implicit_args_scratch_patch(),
                        "implicit-args scratch patch on hardware without heapless dispatch"
                    );
                    patch_scratch(p, scratch_address, scratch_controller_changed)?;
                }
                CommandToPatch::HostFunctionEntry(h) => {
                    let binding = bind(h.host_function)?;
                    write_address_and_data(&h.destination, streamer.entry_address(), binding.id, true)?;
                }
                CommandToPatch::HostFunctionUserData(h) => {
                    let user_data = list
                        .host_functions()
                        .get(h.host_function)
                        .map(|f| f.user_data)
                        .ok_or(SubmitError::InvalidState("host function patch without a recorded function"))?;
                    write_address_and_data(&h.destination, streamer.user_data_address(), user_data, true)?;
                }
                CommandToPatch::HostFunctionSignalInternalTag(h) => {
                    let binding = bind(h.host_function)?;
                    write_address_and_data(&h.destination, streamer.pending_tag_address(), binding.tag, true)?;
                }
                CommandToPatch::HostFunctionWaitInternalTag(h) => {
                    let binding = bind(h.host_function)?;
                    write_address_and_data(
                        &h.destination,
                        streamer.completed_tag_address(),
                        binding.tag,
                        false,
                    )?;
                }
                CommandToPatch::NoopSpace(noop) => {
                    if let (Some(dest), Some(size)) = (&noop.destination, noop.patch_size) {
                        dest.alloc.fill(dest.offset, size as usize, 0)?;
                    }
                }
                CommandToPatch::Invalid => panic!("invalid command patch descriptor"),
            }
        }
        Ok(())
    }

    /// Wait for the newest submission, then drain printf and release completed allocations.
    pub fn synchronize(&self, timeout_ns: u64) -> Result<()> {
        let task_count = self.lock_state().last_submitted_task_count;
        if task_count == 0 {
            return Ok(());
        }
        match self
            .csr
            .wait_for_task_count(task_count, WaitParams::from_timeout_ns(timeout_ns))
        {
            WaitStatus::NotReady => return Err(SubmitError::NotReady),
            WaitStatus::GpuHang => {
                self.drain_printf(true);
                return Err(SubmitError::DeviceLost);
            }
            WaitStatus::Ready => self.drain_printf(false),
        }
        let completed = self.csr.completed_task_count();
        let mut state = self.csr.lock_state();
        self.csr.clean_completed_allocations(&mut state, completed);
        Ok(())
    }

    fn drain_printf(&self, incomplete_due_to_hang: bool) {
        let pending = std::mem::take(&mut self.lock_state().pending_printf);
        for buffer in &pending {
            buffer.drain_to(self.printf_sink.as_ref(), incomplete_due_to_hang);
        }
    }

    /// Wait for outstanding work and give the queue's command buffers back.
    pub fn destroy(self) -> Result<()> {
        let result = self.synchronize(u64::MAX);
        let ctx = self.csr.context_id();
        let state = match self.state.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for buffer in state.buffers {
            release_allocation(&self.device.mem, buffer.alloc, ctx);
        }
        result
    }
}

fn patch_scratch(patch: &mut ScratchPatch, scratch_address: u64, controller_changed: bool) -> Result<()> {
    let (Some(dest), Some(offset), Some(size)) = (&patch.destination, patch.offset, patch.patch_size) else {
        return Ok(());
    };
    if patch.scratch_address_after_patch == scratch_address && !controller_changed {
        return Ok(());
    }
    let value = patch.base_address + scratch_address;
    dest.alloc
        .write(dest.offset + offset, &truncated_le_bytes(value, size))?;
    patch.scratch_address_after_patch = scratch_address;
    Ok(())
}

/// Fill in the address and data of a recorded store or semaphore packet.
fn write_address_and_data(
    dest: &PatchDestination,
    address: u64,
    data: u64,
    store: bool,
) -> Result<()> {
    let (address_offset, data_offset) = if store {
        (STORE_DATA_IMM_ADDRESS_OFFSET, STORE_DATA_IMM_DATA_OFFSET)
    } else {
        (SEMAPHORE_WAIT_ADDRESS_OFFSET, SEMAPHORE_WAIT_DATA_OFFSET)
    };
    dest.alloc.write_u64(dest.offset + address_offset as u64, address)?;
    dest.alloc.write_u64(dest.offset + data_offset as u64, data)?;
    Ok(())
}
