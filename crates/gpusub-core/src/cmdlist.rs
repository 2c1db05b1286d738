//! Command lists: recording dispatches, copies, fills and synchronization into a container.
//!
//! A list tracks two property snapshots. `required_state` is what the first dispatch needs
//! from whatever ran before the list; `final_state` is what the last dispatch left behind.
//! State changes between dispatches are programmed inline, and the queue reconciles the
//! engine's committed state against `required_state` at submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use gpusub_hw::{
    decode_cmds, ComputeWalker, HwCmd, HwCommand, MiFlushDw, MiSemaphoreWait, MiStoreDataImm,
    PipeControl, PipeControlFlags, FlushDwFlags, PostSyncOp, PreemptionMode, SemaphoreCompare,
    StatePrefetch, XyColorBlt, XyCopyBlt, COMPUTE_WALKER_INLINE_DATA_OFFSET, COMPUTE_WALKER_INLINE_DATA_SIZE,
    MAX_FILL_PATTERN_SIZE, PIPELINE_SELECT_GPGPU,
};
use gpusub_mem::{
    align_up, AllocationProperties, AllocationType, GraphicsAllocation, MemoryPool,
};
use tracing::{debug, trace};

use crate::container::{release_allocation, CommandContainer};
use crate::device::{context_id, Device, DeviceShared};
use crate::error::{Result, SubmitError};
use crate::event::{Event, EVENT_STATE_SIGNALED};
use crate::heap::{lock_heaps, HeapKind, SharedHeaps};
use crate::host_function::HostFunction;
use crate::kernel::{BuiltinArgs, BuiltinKernel, CopyRegion, Image, Kernel};
use crate::patch::{
    CommandToPatch, FrontEndPatch, HostFunctionPatch, NoopSpacePatch, PatchDestination, ScratchPatch,
};
use crate::printf::PrintfBuffer;
use crate::queue::{CommandQueue, CommandQueueDesc, QueueMode};
use crate::state_cmds::{self, FrontEndCmd};
use crate::stream_properties::{StateLeaves, StreamProperties};

/// Copies and fills at or beyond this size use the stateless built-ins.
const STATELESS_THRESHOLD: u64 = 4 << 30;
/// Destination alignment the middle copy kernel requires.
const COPY_MIDDLE_ALIGNMENT: u64 = 16;
/// Bytes the middle copy and fill kernels move per work item.
const MIDDLE_ELEMENT_SIZE: u64 = 16;
const INDIRECT_DATA_ALIGNMENT: u64 = 64;
const DYNAMIC_STATE_ALIGNMENT: u64 = 64;
const IMPLICIT_ARGS_SIZE: u64 = 64;
const IMPLICIT_ARGS_PRINTF_OFFSET: u64 = 0;
const IMPLICIT_ARGS_SCRATCH_OFFSET: u64 = 8;
const IMPLICIT_ARGS_GROUP_COUNT_OFFSET: u64 = 16;
const INLINE_ARGS_POINTER: usize = 0;
const INLINE_SCRATCH_POINTER: usize = 8;
const INLINE_SYNC_BUFFER_POINTER: usize = 16;
const QWORD: u32 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EngineGroup {
    #[default]
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandListDesc {
    pub engine: EngineGroup,
    /// Driver-internal lists run on a single partition.
    pub internal: bool,
}

/// Properties of the most recent append.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaunchFlags {
    pub is_builtin_kernel: bool,
    pub is_destination_allocation_in_system_memory: bool,
    pub is_kernel_split_operation: bool,
}

/// A pitched byte surface and the box to copy within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub address: u64,
    pub region: CopyRegion,
    pub row_pitch: u64,
    pub slice_pitch: u64,
}

impl MemoryRegion {
    fn origin(&self) -> u64 {
        self.address + self.region.origin_offset(self.row_pitch, self.slice_pitch)
    }

    fn end(&self) -> u64 {
        self.address + self.region.end_offset(self.row_pitch, self.slice_pitch)
    }
}

/// Bytes of synchronization memory a region barrier needs for `workgroups` groups.
pub fn region_barrier_sync_buffer_size(workgroups: u64, region_size: u64, cache_line_size: u64) -> u64 {
    let region_size = region_size.max(1);
    let regions = workgroups.div_ceil(region_size);
    align_up(regions * (region_size + 1) * 2 * 4, cache_line_size.max(1))
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub struct CommandList {
    device: Arc<DeviceShared>,
    desc: CommandListDesc,
    immediate: bool,
    container: CommandContainer,
    closed: bool,
    partition_count: u32,
    required_state: StreamProperties,
    final_state: StreamProperties,
    has_dispatch: bool,
    preemption_mode: PreemptionMode,
    barrier_count: u32,
    last_flags: LaunchFlags,
    commands_to_patch: Mutex<Vec<CommandToPatch>>,
    /// Receiver whose scratch the recorded patches currently point at; 0 before the first submit.
    patched_for: AtomicU64,
    per_thread_scratch: [u32; 2],
    has_indirect_access: bool,
    is_cooperative: bool,
    printf_buffers: Vec<PrintfBuffer>,
    host_functions: Vec<HostFunction>,
    sync_buffers: Vec<Arc<GraphicsAllocation>>,
    sync_buffer_used: u64,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("desc", &self.desc)
            .field("immediate", &self.immediate)
            .field("closed", &self.closed)
            .field("partition_count", &self.partition_count)
            .field("preemption_mode", &self.preemption_mode)
            .finish_non_exhaustive()
    }
}

impl CommandList {
    pub fn create(device: &Device, desc: &CommandListDesc) -> Result<Self> {
        Self::new(device.shared().clone(), *desc, false, None)
    }

    /// An immediate list: every append is submitted to its own queue right away.
    pub fn create_immediate(device: &Device, desc: &CommandListDesc, mode: QueueMode) -> Result<ImmediateCommandList> {
        let queue = CommandQueue::create(
            device,
            &CommandQueueDesc {
                engine: desc.engine,
                mode,
            },
        )?;
        let shared_heaps = if device.caps().shared_immediate_heaps && desc.engine == EngineGroup::Compute {
            let csr = queue.csr();
            let mut state = csr.lock_state();
            Some(csr.shared_heaps(&mut state)?)
        } else {
            None
        };
        let list = Self::new(device.shared().clone(), *desc, true, shared_heaps)?;
        Ok(ImmediateCommandList { list, queue })
    }

    fn new(
        device: Arc<DeviceShared>,
        desc: CommandListDesc,
        immediate: bool,
        shared_heaps: Option<SharedHeaps>,
    ) -> Result<Self> {
        let container = CommandContainer::new(
            device.mem.clone(),
            device.config.command_list_buffer_size,
            device.config.heap_size,
            device.caps.surface_state_size,
            shared_heaps,
        )?;
        let partition_count = if desc.internal || desc.engine == EngineGroup::Copy {
            1
        } else {
            device.caps.tile_count.max(1)
        };
        let preemption_mode = Self::default_preemption_mode(&device);
        Ok(Self {
            device,
            desc,
            immediate,
            container,
            closed: false,
            partition_count,
            required_state: StreamProperties::default(),
            final_state: StreamProperties::default(),
            has_dispatch: false,
            preemption_mode,
            barrier_count: 0,
            last_flags: LaunchFlags::default(),
            commands_to_patch: Mutex::new(Vec::new()),
            patched_for: AtomicU64::new(0),
            per_thread_scratch: [0, 0],
            has_indirect_access: false,
            is_cooperative: false,
            printf_buffers: Vec::new(),
            host_functions: Vec::new(),
            sync_buffers: Vec::new(),
            sync_buffer_used: 0,
        })
    }

    fn default_preemption_mode(device: &DeviceShared) -> PreemptionMode {
        let mode = device
            .config
            .force_preemption_mode
            .unwrap_or(device.caps.default_preemption_mode);
        if mode == PreemptionMode::MidThread && !device.caps.mid_thread_preemption {
            PreemptionMode::ThreadGroup
        } else {
            mode
        }
    }

    pub fn desc(&self) -> &CommandListDesc {
        &self.desc
    }

    pub fn engine(&self) -> EngineGroup {
        self.desc.engine
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn required_state(&self) -> &StreamProperties {
        &self.required_state
    }

    pub fn final_state(&self) -> &StreamProperties {
        &self.final_state
    }

    pub fn preemption_mode(&self) -> PreemptionMode {
        self.preemption_mode
    }

    /// Barriers recorded so far, including those implied by event waits.
    pub fn barrier_count(&self) -> u32 {
        self.barrier_count
    }

    pub fn last_launch_flags(&self) -> LaunchFlags {
        self.last_flags
    }

    pub fn per_thread_scratch(&self) -> [u32; 2] {
        self.per_thread_scratch
    }

    pub fn has_indirect_access(&self) -> bool {
        self.has_indirect_access
    }

    pub fn is_cooperative(&self) -> bool {
        self.is_cooperative
    }

    pub fn container(&self) -> &CommandContainer {
        &self.container
    }

    pub fn printf_buffers(&self) -> &[PrintfBuffer] {
        &self.printf_buffers
    }

    pub fn host_functions(&self) -> &[HostFunction] {
        &self.host_functions
    }

    pub fn sync_buffers(&self) -> &[Arc<GraphicsAllocation>] {
        &self.sync_buffers
    }

    pub fn commands_to_patch(&self) -> MutexGuard<'_, Vec<CommandToPatch>> {
        match self.commands_to_patch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_command_to_patch(&self, patch: CommandToPatch) {
        self.commands_to_patch().push(patch);
    }

    /// Record which receiver's scratch the patches now target and return the previous one.
    pub(crate) fn swap_patched_for(&self, csr_uid: u64) -> u64 {
        self.patched_for.swap(csr_uid, Ordering::AcqRel)
    }

    /// Every packet recorded so far, in stream order across chunks.
    pub fn recorded_commands(&self) -> Result<Vec<HwCmd>> {
        let mut cmds = Vec::new();
        for chunk in self.container.recorded_bytes() {
            let decoded = decode_cmds(&chunk).map_err(|err| SubmitError::Unknown(err.to_string()))?;
            cmds.extend(decoded.into_iter().map(|(_, cmd)| cmd));
        }
        Ok(cmds)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SubmitError::InvalidState("command list is closed"));
        }
        Ok(())
    }

    /// Allocation backing `[address, address + len)`.
    fn lookup_allocation(&self, address: u64, len: u64) -> Result<Arc<GraphicsAllocation>> {
        let (alloc, offset) = self
            .device
            .mem
            .find_by_gpu_address(address)
            .ok_or(SubmitError::InvalidArgument("address is not backed by a device allocation"))?;
        if offset + len > alloc.size() {
            return Err(SubmitError::InvalidArgument("range runs past the end of its allocation"));
        }
        Ok(alloc)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.container.close()?;
        self.closed = true;
        Ok(())
    }

    /// Drop everything recorded and reopen. Engine and partition count are kept.
    pub fn reset(&mut self) -> Result<()> {
        let ctx = context_id(self.desc.engine);
        self.container.reset(ctx)?;
        let mut sync_buffers = std::mem::take(&mut self.sync_buffers).into_iter();
        if let Some(first) = sync_buffers.next() {
            for alloc in sync_buffers {
                release_allocation(&self.device.mem, alloc, ctx);
            }
            self.sync_buffers.push(first);
        }
        for printf in std::mem::take(&mut self.printf_buffers) {
            release_allocation(&self.device.mem, printf.allocation().clone(), ctx);
        }
        self.clear_recorded_state();
        self.barrier_count = 0;
        self.last_flags = LaunchFlags::default();
        self.preemption_mode = Self::default_preemption_mode(&self.device);
        self.patched_for.store(0, Ordering::Release);
        debug!(engine = ?self.desc.engine, "command list reset");
        Ok(())
    }

    fn clear_recorded_state(&mut self) {
        self.closed = false;
        self.required_state = StreamProperties::default();
        self.final_state = StreamProperties::default();
        self.has_dispatch = false;
        self.commands_to_patch().clear();
        self.per_thread_scratch = [0, 0];
        self.has_indirect_access = false;
        self.is_cooperative = false;
        self.host_functions.clear();
        self.sync_buffer_used = 0;
    }

    /// Start the next immediate append on a fresh command buffer; heaps keep their contents.
    fn begin_immediate_append(&mut self) -> Result<()> {
        self.container.rewind_commands(context_id(self.desc.engine))?;
        self.printf_buffers.clear();
        self.clear_recorded_state();
        Ok(())
    }

    fn reserve_sync_buffer(&mut self, size: u64) -> Result<u64> {
        let current = match self.sync_buffers.last() {
            Some(alloc) if self.sync_buffer_used + size <= alloc.size() => alloc.clone(),
            _ => {
                let alloc = self
                    .device
                    .mem
                    .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                        self.device.config.sync_buffer_size.max(size),
                        AllocationType::SyncBuffer,
                        MemoryPool::Local,
                    ))
                    .ok_or(SubmitError::OutOfDeviceMemory)?;
                self.sync_buffers.push(alloc.clone());
                self.sync_buffer_used = 0;
                alloc
            }
        };
        let offset = self.sync_buffer_used;
        current.fill(offset, size as usize, 0)?;
        self.sync_buffer_used += size;
        self.container.add_to_residency(current.clone());
        Ok(current.gpu_address() + offset)
    }

    fn append_semaphores(&mut self, events: &[&Event]) -> Result<()> {
        for event in events {
            for partition in 0..event.used_partitions() {
                self.container.append(&MiSemaphoreWait {
                    address: event.partition_address(partition),
                    data: EVENT_STATE_SIGNALED,
                    compare: SemaphoreCompare::Equal,
                })?;
            }
            self.container.add_to_residency(event.allocation().clone());
        }
        Ok(())
    }

    fn append_stalling_barrier(&mut self) -> Result<()> {
        match self.desc.engine {
            EngineGroup::Compute => {
                self.container.append(&PipeControl {
                    flags: PipeControlFlags::CS_STALL | PipeControlFlags::HDC_PIPELINE_FLUSH,
                    ..PipeControl::default()
                })?;
            }
            EngineGroup::Copy => {
                self.container.append(&MiFlushDw::default())?;
            }
        }
        self.barrier_count += 1;
        Ok(())
    }

    /// Semaphores on every used partition of every event; compute lists follow with a barrier.
    fn append_waits(&mut self, events: &[&Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.append_semaphores(events)?;
        if self.desc.engine == EngineGroup::Compute {
            self.append_stalling_barrier()?;
        }
        Ok(())
    }

    fn append_signal(&mut self, event: Option<&Event>) -> Result<()> {
        let Some(event) = event else {
            return Ok(());
        };
        event.set_used_partitions(self.partition_count);
        self.container.add_to_residency(event.allocation().clone());
        match self.desc.engine {
            EngineGroup::Compute => {
                let mut flags = PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH;
                if self.partition_count > 1 {
                    flags |= PipeControlFlags::WORKLOAD_PARTITION_OFFSET;
                }
                self.container.append(&PipeControl {
                    flags,
                    post_sync: PostSyncOp::WriteImmediateData,
                    address: event.gpu_address(),
                    immediate_data: EVENT_STATE_SIGNALED,
                })?;
            }
            EngineGroup::Copy => {
                self.container.append(&MiFlushDw {
                    post_sync: PostSyncOp::WriteImmediateData,
                    flags: FlushDwFlags::STORE_QWORD,
                    address: event.gpu_address(),
                    immediate_data: EVENT_STATE_SIGNALED,
                })?;
            }
        }
        Ok(())
    }

    pub fn append_wait_on_events(&mut self, events: &[&Event]) -> Result<()> {
        self.ensure_open()?;
        self.append_waits(events)
    }

    pub fn append_signal_event(&mut self, event: &Event) -> Result<()> {
        self.ensure_open()?;
        self.append_signal(Some(event))
    }

    pub fn append_barrier(&mut self, signal_event: Option<&Event>, wait_events: &[&Event]) -> Result<()> {
        self.ensure_open()?;
        self.append_semaphores(wait_events)?;
        self.append_stalling_barrier()?;
        self.append_signal(signal_event)
    }

    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.launch(kernel, group_count, false, signal_event, wait_events)
    }

    /// Launch with every workgroup resident at once.
    pub fn append_launch_cooperative_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.launch(kernel, group_count, true, signal_event, wait_events)
    }

    fn launch(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        cooperative: bool,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.ensure_open()?;
        if self.desc.engine == EngineGroup::Copy {
            return Err(SubmitError::InvalidArgument("kernel launch on a copy-only list"));
        }
        if group_count.contains(&0) {
            return Err(SubmitError::InvalidArgument("group count must be non-zero"));
        }
        self.append_waits(wait_events)?;
        self.dispatch(kernel, group_count, cooperative)?;
        self.last_flags = LaunchFlags {
            is_builtin_kernel: kernel.builtin.is_some(),
            ..LaunchFlags::default()
        };
        self.append_signal(signal_event)
    }

    /// Record one walker plus whatever state it needs that the previous dispatch did not set.
    fn dispatch(&mut self, kernel: &Kernel, group_count: [u32; 3], cooperative: bool) -> Result<()> {
        let device = self.device.clone();
        let caps = &device.caps;
        let args_len = align_up(kernel.arguments.len().max(8) as u64, 8);

        let (args, implicit_args, mut required, heap_allocations) = {
            let mut heaps = lock_heaps(self.container.heaps());
            if !caps.heapless {
                if kernel.binding_table_entries > 0 {
                    let ss_size = u64::from(caps.surface_state_size);
                    heaps.allocate(
                        HeapKind::SurfaceState,
                        u64::from(kernel.binding_table_entries) * ss_size,
                        ss_size,
                    )?;
                }
                if kernel.dynamic_state_size > 0 {
                    heaps.allocate(
                        HeapKind::DynamicState,
                        u64::from(kernel.dynamic_state_size),
                        DYNAMIC_STATE_ALIGNMENT,
                    )?;
                }
            }
            let args = heaps.allocate(HeapKind::IndirectObject, args_len, INDIRECT_DATA_ALIGNMENT)?;
            let implicit_args = if kernel.uses_implicit_args {
                Some(heaps.allocate(HeapKind::IndirectObject, IMPLICIT_ARGS_SIZE, INDIRECT_DATA_ALIGNMENT)?)
            } else {
                None
            };
            let mut required = StreamProperties::default();
            if !caps.heapless {
                heaps.program_state_base_address(&mut required.state_base_address)?;
            }
            let allocations: Vec<_> = heaps.allocations().cloned().collect();
            (args, implicit_args, required, allocations)
        };
        args.alloc.write(args.offset, &kernel.arguments)?;

        required.front_end.disable_eu_fusion.set_value(kernel.disable_eu_fusion);
        required.front_end.disable_overdispatch.set_value(kernel.disable_overdispatch);
        required.front_end.compute_dispatch_all_walker.set_value(cooperative);
        required
            .state_compute_mode
            .is_coherency_required
            .set_value(kernel.requires_coherency);
        required.state_compute_mode.large_grf_mode.set_value(kernel.large_grf);
        required
            .state_compute_mode
            .thread_arbitration_policy
            .set_value(kernel.thread_arbitration_policy);
        required.pipeline_select.pipeline.set_value(PIPELINE_SELECT_GPGPU);
        required.pipeline_select.systolic_mode.set_value(false);

        if self.has_dispatch {
            let delta = self.final_state.compute_delta(&required, caps);
            if !delta.is_empty() {
                self.program_inline_state(&required, delta)?;
                self.final_state.commit(&required, delta);
            }
        } else {
            self.required_state = required;
            self.final_state = required;
            self.final_state.clear_dirty();
            self.has_dispatch = true;
        }

        let mut inline_data = [0u8; COMPUTE_WALKER_INLINE_DATA_SIZE];
        inline_data[INLINE_ARGS_POINTER..INLINE_ARGS_POINTER + 8]
            .copy_from_slice(&args.gpu_address().to_le_bytes());

        if kernel.uses_printf {
            let printf = PrintfBuffer::new(&device.mem, &kernel.name)?;
            if let Some(implicit) = &implicit_args {
                implicit.alloc.write_u64(
                    implicit.offset + IMPLICIT_ARGS_PRINTF_OFFSET,
                    printf.allocation().gpu_address(),
                )?;
            }
            self.container.add_to_residency(printf.allocation().clone());
            self.printf_buffers.push(printf);
        }

        if let Some(region) = kernel.region_barrier_size {
            let workgroups: u64 = group_count.iter().map(|&c| u64::from(c)).product();
            let size = region_barrier_sync_buffer_size(
                workgroups,
                u64::from(region),
                u64::from(caps.cache_line_size),
            );
            let address = self.reserve_sync_buffer(size)?;
            inline_data[INLINE_SYNC_BUFFER_POINTER..INLINE_SYNC_BUFFER_POINTER + 8]
                .copy_from_slice(&address.to_le_bytes());
        }

        if let Some(implicit) = &implicit_args {
            let mut counts = Vec::with_capacity(12);
            for count in group_count {
                counts.extend_from_slice(&count.to_le_bytes());
            }
            implicit
                .alloc
                .write(implicit.offset + IMPLICIT_ARGS_GROUP_COUNT_OFFSET, &counts)?;
        }

        let walker = self.container.append(&ComputeWalker {
            kernel_start_address: kernel.isa_address,
            indirect_data_offset: clamp_u32(args.offset),
            indirect_data_length: clamp_u32(args_len),
            thread_group_count: group_count,
            partition_count: self.partition_count,
            inline_data,
        })?;

        if kernel.needs_scratch() {
            let mut patches = self.commands_to_patch();
            if caps.supports_inline_data_scratch_patch() {
                patches.push(CommandToPatch::ComputeWalkerInlineDataScratch(ScratchPatch {
                    destination: Some(walker),
                    offset: Some((COMPUTE_WALKER_INLINE_DATA_OFFSET + INLINE_SCRATCH_POINTER) as u64),
                    patch_size: Some(QWORD),
                    ..ScratchPatch::default()
                }));
            }
            if let Some(implicit) = &implicit_args {
                if caps.supports_implicit_args_scratch_patch() {
                    patches.push(CommandToPatch::ComputeWalkerImplicitArgsScratch(ScratchPatch {
                        destination: Some(PatchDestination::new(implicit.alloc.clone(), implicit.offset)),
                        offset: Some(IMPLICIT_ARGS_SCRATCH_OFFSET),
                        patch_size: Some(QWORD),
                        ..ScratchPatch::default()
                    }));
                }
            }
        }

        for alloc in heap_allocations {
            self.container.add_to_residency(alloc);
        }
        for alloc in &kernel.resources {
            self.container.add_to_residency(alloc.clone());
        }

        self.per_thread_scratch[0] = self.per_thread_scratch[0].max(kernel.per_thread_scratch[0]);
        self.per_thread_scratch[1] = self.per_thread_scratch[1].max(kernel.per_thread_scratch[1]);
        self.has_indirect_access |= kernel.has_indirect_access;
        self.is_cooperative |= cooperative;
        if kernel.disable_mid_thread_preemption {
            self.preemption_mode = self.preemption_mode.min(PreemptionMode::ThreadGroup);
        }
        trace!(kernel = %kernel.name, groups = ?group_count, partitions = self.partition_count, "kernel dispatched");
        Ok(())
    }

    fn program_inline_state(&mut self, required: &StreamProperties, delta: StateLeaves) -> Result<()> {
        let device = self.device.clone();
        let caps = &device.caps;
        let groups = delta.groups();
        let committed = self.final_state;

        if groups.contains(StateLeaves::PIPELINE_SELECT) {
            self.container.append(&state_cmds::pipeline_select(
                &required.pipeline_select,
                &committed.pipeline_select,
            ))?;
        }
        if groups.contains(StateLeaves::STATE_COMPUTE_MODE) {
            self.container.append(&state_cmds::state_compute_mode(
                &required.state_compute_mode,
                &committed.state_compute_mode,
            ))?;
        }
        if groups.contains(StateLeaves::STATE_BASE_ADDRESS) && !caps.heapless {
            self.container.append(&PipeControl {
                flags: PipeControlFlags::CS_STALL
                    | PipeControlFlags::DC_FLUSH
                    | PipeControlFlags::TEXTURE_CACHE_INVALIDATE,
                ..PipeControl::default()
            })?;
            self.container.append(&state_cmds::state_base_address(
                &required.state_base_address,
                &committed.state_base_address,
            ))?;
        }
        if groups.contains(StateLeaves::FRONT_END) {
            let destination = match state_cmds::front_end(caps, &required.front_end, &committed.front_end) {
                FrontEndCmd::Vfe(cmd) => self.container.append(&cmd)?,
                FrontEndCmd::Cfe(cmd) => self.container.append(&cmd)?,
            };
            self.add_command_to_patch(CommandToPatch::FrontEndState(FrontEndPatch { destination }));
        }
        debug!(groups = ?groups, "inline state programmed between dispatches");
        Ok(())
    }

    fn blit_copy(&mut self, dst: u64, src: u64, size: u64) -> Result<()> {
        let max_width = u64::from(self.device.caps.max_blit_width.max(1));
        let max_height = u64::from(self.device.caps.max_blit_height.max(1));
        let mut offset = 0;
        while offset < size {
            let remaining = size - offset;
            let (width, height) = if remaining >= max_width {
                (max_width, (remaining / max_width).min(max_height))
            } else {
                (remaining, 1)
            };
            self.container.append(&XyCopyBlt {
                src: src + offset,
                dst: dst + offset,
                width: clamp_u32(width),
                height: clamp_u32(height),
                src_pitch: clamp_u32(width),
                dst_pitch: clamp_u32(width),
            })?;
            offset += width * height;
        }
        Ok(())
    }

    pub fn append_memory_copy(
        &mut self,
        dst: u64,
        src: u64,
        size: u64,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.ensure_open()?;
        let dst_alloc = self.lookup_allocation(dst, size)?;
        let src_alloc = self.lookup_allocation(src, size)?;
        self.append_waits(wait_events)?;
        self.container.add_to_residency(dst_alloc.clone());
        self.container.add_to_residency(src_alloc);

        let mut flags = LaunchFlags {
            is_destination_allocation_in_system_memory: dst_alloc.is_in_system_memory(),
            ..LaunchFlags::default()
        };
        match self.desc.engine {
            EngineGroup::Copy => self.blit_copy(dst, src, size)?,
            EngineGroup::Compute => {
                let stateless = size >= STATELESS_THRESHOLD || self.device.caps.heapless;
                let (side, middle) = if stateless {
                    (
                        BuiltinKernel::CopyBufferToBufferSideStateless,
                        BuiltinKernel::CopyBufferToBufferMiddleStateless,
                    )
                } else {
                    (
                        BuiltinKernel::CopyBufferToBufferSide,
                        BuiltinKernel::CopyBufferToBufferMiddle,
                    )
                };
                let left = ((COPY_MIDDLE_ALIGNMENT - dst % COPY_MIDDLE_ALIGNMENT) % COPY_MIDDLE_ALIGNMENT).min(size);
                let middle_size = (size - left) / MIDDLE_ELEMENT_SIZE * MIDDLE_ELEMENT_SIZE;
                let right = size - left - middle_size;

                let mut launches = 0;
                for (kind, offset, len) in [
                    (side, 0, left),
                    (middle, left, middle_size),
                    (side, left + middle_size, right),
                ] {
                    if len == 0 {
                        continue;
                    }
                    let kernel = Kernel::builtin(
                        kind,
                        &BuiltinArgs::Copy {
                            dst: dst + offset,
                            src: src + offset,
                            size: len,
                        },
                    );
                    let items = if kind == middle { len / MIDDLE_ELEMENT_SIZE } else { len };
                    self.dispatch(&kernel, [clamp_u32(items), 1, 1], false)?;
                    launches += 1;
                }
                flags.is_builtin_kernel = true;
                flags.is_kernel_split_operation = launches > 1;
            }
        }
        self.last_flags = flags;
        self.append_signal(signal_event)
    }

    pub fn append_memory_copy_region(
        &mut self,
        dst: &MemoryRegion,
        src: &MemoryRegion,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.ensure_open()?;
        self.region_copy(dst, src, false, signal_event, wait_events)
    }

    pub fn append_image_copy_region(
        &mut self,
        dst: &Image,
        src: &Image,
        dst_region: &CopyRegion,
        src_region: &CopyRegion,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.ensure_open()?;
        if dst.bytes_per_pixel != src.bytes_per_pixel {
            return Err(SubmitError::InvalidArgument("image formats differ in pixel size"));
        }
        let to_memory = |image: &Image, region: &CopyRegion| MemoryRegion {
            address: image.alloc.gpu_address(),
            region: image.byte_region(region),
            row_pitch: image.row_pitch,
            slice_pitch: image.slice_pitch,
        };
        self.region_copy(
            &to_memory(dst, dst_region),
            &to_memory(src, src_region),
            true,
            signal_event,
            wait_events,
        )
    }

    pub fn append_image_copy(
        &mut self,
        dst: &Image,
        src: &Image,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        if (dst.width, dst.height, dst.depth) != (src.width, src.height, src.depth) {
            return Err(SubmitError::InvalidArgument("image extents differ"));
        }
        self.append_image_copy_region(
            dst,
            src,
            &dst.full_region(),
            &src.full_region(),
            signal_event,
            wait_events,
        )
    }

    fn region_copy(
        &mut self,
        dst: &MemoryRegion,
        src: &MemoryRegion,
        image: bool,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        let (d, s) = (&dst.region, &src.region);
        if (d.width, d.height, d.depth) != (s.width, s.height, s.depth) {
            return Err(SubmitError::InvalidArgument("copy regions differ in extent"));
        }
        let dst_alloc = self.lookup_allocation(dst.origin(), dst.end() - dst.origin())?;
        let src_alloc = self.lookup_allocation(src.origin(), src.end() - src.origin())?;
        self.append_waits(wait_events)?;
        self.container.add_to_residency(dst_alloc.clone());
        self.container.add_to_residency(src_alloc);

        let mut flags = LaunchFlags {
            is_destination_allocation_in_system_memory: dst_alloc.is_in_system_memory(),
            ..LaunchFlags::default()
        };
        match self.desc.engine {
            EngineGroup::Copy => {
                if d.width > u64::from(self.device.caps.max_blit_width) {
                    return Err(SubmitError::InvalidArgument("region row exceeds the blitter width"));
                }
                let max_height = u64::from(self.device.caps.max_blit_height.max(1));
                for z in 0..d.depth {
                    let mut row = 0;
                    while row < d.height {
                        let rows = (d.height - row).min(max_height);
                        self.container.append(&XyCopyBlt {
                            src: src.origin() + z * src.slice_pitch + row * src.row_pitch,
                            dst: dst.origin() + z * dst.slice_pitch + row * dst.row_pitch,
                            width: clamp_u32(d.width),
                            height: clamp_u32(rows),
                            src_pitch: clamp_u32(src.row_pitch),
                            dst_pitch: clamp_u32(dst.row_pitch),
                        })?;
                        row += rows;
                    }
                }
            }
            EngineGroup::Compute => {
                let three_d = d.depth > 1;
                let stateless = self.device.caps.heapless
                    || dst.end() - dst.address >= STATELESS_THRESHOLD
                    || src.end() - src.address >= STATELESS_THRESHOLD;
                let kind = match (image, three_d, stateless) {
                    (true, false, _) => BuiltinKernel::CopyImageRegion2d,
                    (true, true, _) => BuiltinKernel::CopyImageRegion3d,
                    (false, false, false) => BuiltinKernel::CopyBufferRectBytes2d,
                    (false, true, false) => BuiltinKernel::CopyBufferRectBytes3d,
                    (false, false, true) => BuiltinKernel::CopyBufferRectBytes2dStateless,
                    (false, true, true) => BuiltinKernel::CopyBufferRectBytes3dStateless,
                };
                let kernel = Kernel::builtin(
                    kind,
                    &BuiltinArgs::Rect {
                        dst: dst.origin(),
                        src: src.origin(),
                        width: d.width,
                        height: d.height,
                        depth: d.depth,
                        src_row_pitch: src.row_pitch,
                        src_slice_pitch: src.slice_pitch,
                        dst_row_pitch: dst.row_pitch,
                        dst_slice_pitch: dst.slice_pitch,
                    },
                );
                self.dispatch(
                    &kernel,
                    [clamp_u32(d.width.max(1)), clamp_u32(d.height.max(1)), clamp_u32(d.depth.max(1))],
                    false,
                )?;
                flags.is_builtin_kernel = true;
            }
        }
        self.last_flags = flags;
        self.append_signal(signal_event)
    }

    /// Fill `size` bytes at `dst` with a repeating `pattern` of 1 to 16 bytes.
    pub fn append_memory_fill(
        &mut self,
        dst: u64,
        pattern: &[u8],
        size: u64,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.ensure_open()?;
        if pattern.is_empty() || pattern.len() > MAX_FILL_PATTERN_SIZE {
            return Err(SubmitError::InvalidArgument("fill pattern must be 1 to 16 bytes"));
        }
        let dst_alloc = self.lookup_allocation(dst, size)?;
        self.append_waits(wait_events)?;
        self.container.add_to_residency(dst_alloc.clone());

        let pattern_size = pattern.len() as u64;
        let mut padded = [0u8; MAX_FILL_PATTERN_SIZE];
        padded[..pattern.len()].copy_from_slice(pattern);

        let mut flags = LaunchFlags {
            is_destination_allocation_in_system_memory: dst_alloc.is_in_system_memory(),
            ..LaunchFlags::default()
        };
        match self.desc.engine {
            EngineGroup::Copy => {
                // Whole patterns per blit keep every blit starting at pattern byte 0.
                let max_width = u64::from(self.device.caps.max_blit_width).max(pattern_size);
                let chunk = max_width - max_width % pattern_size;
                let mut offset = 0;
                while offset < size {
                    let width = (size - offset).min(chunk);
                    self.container.append(&XyColorBlt {
                        dst: dst + offset,
                        width: clamp_u32(width),
                        height: 1,
                        pitch: clamp_u32(width),
                        pattern_size: pattern.len() as u32,
                        pattern: padded,
                    })?;
                    offset += width;
                }
            }
            EngineGroup::Compute => {
                let stateless = size >= STATELESS_THRESHOLD || self.device.caps.heapless;
                let (middle, left_over) = if stateless {
                    (
                        BuiltinKernel::FillBufferImmediateStateless,
                        BuiltinKernel::FillBufferImmediateLeftOverStateless,
                    )
                } else {
                    (
                        BuiltinKernel::FillBufferImmediate,
                        BuiltinKernel::FillBufferImmediateLeftOver,
                    )
                };
                let middle_size = size / MIDDLE_ELEMENT_SIZE * MIDDLE_ELEMENT_SIZE;
                let max_dispatch = (self.device.caps.max_fill_dispatch_bytes / MIDDLE_ELEMENT_SIZE
                    * MIDDLE_ELEMENT_SIZE)
                    .max(MIDDLE_ELEMENT_SIZE);

                let mut launches = 0;
                let mut offset = 0;
                while offset < middle_size {
                    let len = (middle_size - offset).min(max_dispatch);
                    let kernel = Kernel::builtin(
                        middle,
                        &BuiltinArgs::Fill {
                            dst: dst + offset,
                            size: len,
                            phase: offset % pattern_size,
                            pattern_size,
                            pattern: padded,
                        },
                    );
                    self.dispatch(&kernel, [clamp_u32(len / MIDDLE_ELEMENT_SIZE), 1, 1], false)?;
                    launches += 1;
                    offset += len;
                }
                if size > middle_size {
                    let len = size - middle_size;
                    let kernel = Kernel::builtin(
                        left_over,
                        &BuiltinArgs::Fill {
                            dst: dst + middle_size,
                            size: len,
                            phase: middle_size % pattern_size,
                            pattern_size,
                            pattern: padded,
                        },
                    );
                    self.dispatch(&kernel, [clamp_u32(len), 1, 1], false)?;
                    launches += 1;
                }
                flags.is_builtin_kernel = true;
                flags.is_kernel_split_operation = launches > 1;
            }
        }
        self.last_flags = flags;
        self.append_signal(signal_event)
    }

    /// Run `function` on the host when the engine reaches this point; the engine waits for it.
    ///
    /// The four packets are recorded with placeholder addresses and bound to the queue's
    /// host-function slot at submission.
    pub fn append_host_function(
        &mut self,
        function: HostFunction,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.ensure_open()?;
        self.append_waits(wait_events)?;
        let index = self.host_functions.len();
        self.host_functions.push(function);

        let store = MiStoreDataImm {
            address: 0,
            data: 0,
            store_qword: true,
            workload_partition_offset: false,
        };
        let entry = self.container.append(&store)?;
        let user_data = self.container.append(&store)?;
        let signal = self.container.append(&store)?;
        let wait = self.container.append(&MiSemaphoreWait {
            address: 0,
            data: 0,
            compare: SemaphoreCompare::GreaterOrEqual,
        })?;

        let patch = |destination: PatchDestination| HostFunctionPatch {
            destination,
            host_function: index,
        };
        {
            let mut patches = self.commands_to_patch();
            patches.push(CommandToPatch::HostFunctionEntry(patch(entry)));
            patches.push(CommandToPatch::HostFunctionUserData(patch(user_data)));
            patches.push(CommandToPatch::HostFunctionSignalInternalTag(patch(signal)));
            patches.push(CommandToPatch::HostFunctionWaitInternalTag(patch(wait)));
        }
        self.append_signal(signal_event)
    }

    pub fn append_memory_prefetch(&mut self, address: u64, size: u64) -> Result<()> {
        self.ensure_open()?;
        let alloc = self.lookup_allocation(address, size)?;
        self.container.add_to_residency(alloc);
        let destination = self.container.append(&StatePrefetch {
            address,
            size: clamp_u32(size),
        })?;
        if self.device.config.noop_memory_prefetch {
            self.add_command_to_patch(CommandToPatch::NoopSpace(NoopSpacePatch {
                destination: Some(destination),
                patch_size: Some(StatePrefetch::SIZE_BYTES as u32),
            }));
        }
        Ok(())
    }
}

/// A command list bound to a private queue; each append executes immediately.
#[derive(Debug)]
pub struct ImmediateCommandList {
    list: CommandList,
    queue: CommandQueue,
}

impl ImmediateCommandList {
    pub fn list(&self) -> &CommandList {
        &self.list
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    fn execute(&mut self, record: impl FnOnce(&mut CommandList) -> Result<()>) -> Result<()> {
        self.list.begin_immediate_append()?;
        record(&mut self.list)?;
        self.list.close()?;
        let result = self.queue.execute_command_lists(&[&self.list], None, None, &[]);
        let task_count = self.queue.csr().task_count();
        self.list
            .container
            .retire_command_buffers(context_id(self.list.desc.engine), task_count)?;
        result
    }

    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_launch_kernel(kernel, group_count, signal_event, wait_events))
    }

    pub fn append_launch_cooperative_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_launch_cooperative_kernel(kernel, group_count, signal_event, wait_events))
    }

    pub fn append_memory_copy(
        &mut self,
        dst: u64,
        src: u64,
        size: u64,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_memory_copy(dst, src, size, signal_event, wait_events))
    }

    pub fn append_memory_copy_region(
        &mut self,
        dst: &MemoryRegion,
        src: &MemoryRegion,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_memory_copy_region(dst, src, signal_event, wait_events))
    }

    pub fn append_memory_fill(
        &mut self,
        dst: u64,
        pattern: &[u8],
        size: u64,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_memory_fill(dst, pattern, size, signal_event, wait_events))
    }

    pub fn append_image_copy(
        &mut self,
        dst: &Image,
        src: &Image,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_image_copy(dst, src, signal_event, wait_events))
    }

    pub fn append_barrier(&mut self, signal_event: Option<&Event>, wait_events: &[&Event]) -> Result<()> {
        self.execute(|list| list.append_barrier(signal_event, wait_events))
    }

    pub fn append_host_function(
        &mut self,
        function: HostFunction,
        signal_event: Option<&Event>,
        wait_events: &[&Event],
    ) -> Result<()> {
        self.execute(|list| list.append_host_function(function, signal_event, wait_events))
    }

    pub fn append_signal_event(&mut self, event: &Event) -> Result<()> {
        self.execute(|list| list.append_signal_event(event))
    }

    /// Wait for everything appended so far.
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        self.queue.synchronize(timeout_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_barrier_buffer_covers_every_region() {
        // 10 groups in regions of 4: three regions of five counters, doubled, as dwords, in whole cache lines.
        assert_eq!(region_barrier_sync_buffer_size(10, 4, 64), 128);
        assert_eq!(region_barrier_sync_buffer_size(1, 1, 64), 64);
        assert_eq!(region_barrier_sync_buffer_size(0, 8, 64), 0);
    }
}
