use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gpusub_hw::{
    CmdStreamIter, FlushDwFlags, HwCmd, MiFlushDw, PipeControl, PipeControlFlags, PostSyncOp,
    XyColorBlt, XyCopyBlt,
};
use gpusub_mem::{ContextId, MemoryManager, ResidencyContainer};
use tracing::{debug, warn};

use crate::host_function::HostFunctionStreamer;
use crate::kernel::{BuiltinArgs, BuiltinKernel};

/// Outcome of handing a batch to the submission layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionStatus {
    Success,
    Failed,
    OutOfMemory,
    OutOfHostMemory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitParams {
    /// When false the wait only ends on completion or hang.
    pub enable_timeout: bool,
    pub timeout: Duration,
}

impl WaitParams {
    pub fn infinite() -> Self {
        Self {
            enable_timeout: false,
            timeout: Duration::ZERO,
        }
    }

    /// `u64::MAX` disables the timeout instead of being taken literally.
    pub fn from_timeout_ns(timeout_ns: u64) -> Self {
        if timeout_ns == u64::MAX {
            Self::infinite()
        } else {
            Self {
                enable_timeout: true,
                timeout: Duration::from_nanos(timeout_ns),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}

/// One batch as handed to [`SubmissionBackend::submit_batch_buffer`].
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub batch_address: u64,
    /// GPU address of the packet that ends the batch.
    pub ending_address: u64,
    pub residency: &'a ResidencyContainer,
    /// Task count the batch's post-sync write carries.
    pub task_count: u64,
    pub partition_count: u32,
    pub post_sync_stride: u64,
    pub is_cooperative: bool,
    pub direct_submission: bool,
    pub context_id: ContextId,
}

/// What a completion wait watches.
#[derive(Clone, Copy, Debug)]
pub struct WaitContext<'a> {
    pub mem: &'a MemoryManager,
    /// One tag slot per active partition.
    pub tag_addresses: &'a [u64],
    pub host_functions: Option<&'a HostFunctionStreamer>,
}

impl WaitContext<'_> {
    pub fn tags_reached(&self, task_count: u64) -> bool {
        self.tag_addresses
            .iter()
            .all(|&address| self.mem.read_u64(address).is_ok_and(|tag| tag >= task_count))
    }
}

/// Boundary between the CSR and whatever executes batches.
///
/// Implementations may execute during `submit_batch_buffer` or later from `poll`.
pub trait SubmissionBackend: Send {
    fn submit_batch_buffer(&mut self, mem: &MemoryManager, submission: &Submission<'_>) -> SubmissionStatus;

    /// Make forward progress on queued work.
    fn poll(&mut self, mem: &MemoryManager);

    fn is_gpu_hang_detected(&self) -> bool;

    /// One step of a completion wait: make progress, then report where `task_count` stands.
    ///
    /// The receiver calls this repeatedly, releasing the backend between calls, until it
    /// returns `Ready` or `GpuHang` or the deadline in `params` passes. Backends that can
    /// block natively may wait up to `params` before returning `NotReady`.
    fn wait_for_task_count(&mut self, ctx: &WaitContext<'_>, task_count: u64, _params: WaitParams) -> WaitStatus {
        if let Some(host_functions) = ctx.host_functions {
            host_functions.process();
        }
        self.poll(ctx.mem);
        if ctx.tags_reached(task_count) {
            WaitStatus::Ready
        } else if self.is_gpu_hang_detected() {
            WaitStatus::GpuHang
        } else {
            WaitStatus::NotReady
        }
    }
}

/// Accepts every batch and never executes anything.
#[derive(Debug, Default)]
pub struct NullBackend;

impl SubmissionBackend for NullBackend {
    fn submit_batch_buffer(&mut self, _mem: &MemoryManager, _submission: &Submission<'_>) -> SubmissionStatus {
        SubmissionStatus::Success
    }

    fn poll(&mut self, _mem: &MemoryManager) {}

    fn is_gpu_hang_detected(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// Batches run inside `submit_batch_buffer`.
    #[default]
    Immediate,
    /// Batches stay queued until [`SoftwareEngine::complete_pending`].
    Deferred,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submissions: u64,
    pub batches_completed: u64,
    pub walkers: u64,
    pub blits: u64,
}

/// Bound on packets executed for one batch; exceeding it is treated as a hang.
const MAX_PACKETS_PER_BATCH: usize = 1 << 20;

#[derive(Debug)]
struct ExecState {
    pc: u64,
    return_stack: Vec<u64>,
    partition_count: u32,
    post_sync_stride: u64,
    task_count: u64,
}

enum RunOutcome {
    Completed,
    Stalled,
    Faulted(String),
}

#[derive(Debug, Default)]
struct EngineInner {
    mode: CompletionMode,
    pending: VecDeque<ExecState>,
    hang: bool,
    submit_failures: VecDeque<SubmissionStatus>,
    trace: Option<Vec<HwCmd>>,
    stats: EngineStats,
    timestamp: u64,
}

/// Executes command streams on the CPU against [`MemoryManager`] backing bytes.
///
/// Cloning yields another handle to the same engine, so a test can keep one after the CSR takes
/// ownership of the boxed backend.
#[derive(Clone, Debug, Default)]
pub struct SoftwareEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl SoftwareEngine {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                mode,
                ..Default::default()
            })),
        }
    }

    /// Record every executed packet.
    pub fn with_trace(self) -> Self {
        self.lock().trace = Some(Vec::new());
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stop executing and report a hang from now on.
    pub fn inject_hang(&self) {
        self.lock().hang = true;
    }

    /// The next submission returns `status` without executing.
    pub fn inject_submit_failure(&self, status: SubmissionStatus) {
        self.lock().submit_failures.push_back(status);
    }

    pub fn pending_batches(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.lock().stats
    }

    pub fn take_trace(&self) -> Vec<HwCmd> {
        self.lock().trace.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Run queued batches regardless of completion mode. Returns how many finished.
    pub fn complete_pending(&self, mem: &MemoryManager) -> usize {
        let mut inner = self.lock();
        drain(&mut inner, mem)
    }
}

impl SubmissionBackend for SoftwareEngine {
    fn submit_batch_buffer(&mut self, mem: &MemoryManager, submission: &Submission<'_>) -> SubmissionStatus {
        let mut inner = self.lock();
        if let Some(status) = inner.submit_failures.pop_front() {
            debug!(?status, task_count = submission.task_count, "injected submission failure");
            return status;
        }
        inner.stats.submissions += 1;
        inner.pending.push_back(ExecState {
            pc: submission.batch_address,
            return_stack: Vec::new(),
            partition_count: submission.partition_count.max(1),
            post_sync_stride: submission.post_sync_stride,
            task_count: submission.task_count,
        });
        if inner.mode == CompletionMode::Immediate {
            drain(&mut inner, mem);
        }
        SubmissionStatus::Success
    }

    fn poll(&mut self, mem: &MemoryManager) {
        let mut inner = self.lock();
        if inner.mode == CompletionMode::Immediate {
            drain(&mut inner, mem);
        }
    }

    fn is_gpu_hang_detected(&self) -> bool {
        self.lock().hang
    }
}

fn drain(inner: &mut EngineInner, mem: &MemoryManager) -> usize {
    let mut completed = 0;
    while !inner.hang {
        let Some(mut state) = inner.pending.pop_front() else {
            break;
        };
        match run(&mut state, mem, inner) {
            RunOutcome::Completed => {
                inner.stats.batches_completed += 1;
                completed += 1;
            }
            RunOutcome::Stalled => {
                inner.pending.push_front(state);
                break;
            }
            RunOutcome::Faulted(reason) => {
                warn!(task_count = state.task_count, %reason, "engine hang");
                inner.hang = true;
                inner.pending.push_front(state);
            }
        }
    }
    completed
}

fn run(state: &mut ExecState, mem: &MemoryManager, inner: &mut EngineInner) -> RunOutcome {
    let mut budget = MAX_PACKETS_PER_BATCH;
    'fetch: loop {
        let Some((alloc, offset)) = mem.find_by_gpu_address(state.pc) else {
            return RunOutcome::Faulted(format!("command address {:#x} is not mapped", state.pc));
        };
        let bytes = match alloc.bytes(0, alloc.size() as usize) {
            Ok(bytes) => bytes,
            Err(err) => return RunOutcome::Faulted(err.to_string()),
        };

        for packet in CmdStreamIter::starting_at(&bytes, offset as usize) {
            budget -= 1;
            if budget == 0 {
                return RunOutcome::Faulted("packet budget exhausted".to_owned());
            }
            let packet = match packet {
                Ok(packet) => packet,
                Err(err) => return RunOutcome::Faulted(err.to_string()),
            };
            let cmd = match packet.decode() {
                Ok(HwCmd::Noop) => continue,
                Ok(cmd) => cmd,
                Err(err) => return RunOutcome::Faulted(err.to_string()),
            };
            let here = alloc.gpu_address() + packet.offset as u64;
            let next = here + packet.bytes.len() as u64;

            if let HwCmd::MiSemaphoreWait(wait) = cmd {
                let value = mem.read_u64(wait.address).unwrap_or(0);
                if !wait.compare.is_satisfied(value, wait.data) {
                    state.pc = here;
                    return RunOutcome::Stalled;
                }
            }
            if let Some(trace) = inner.trace.as_mut() {
                trace.push(cmd);
            }

            let result = match cmd {
                HwCmd::MiBatchBufferStart(bb) => {
                    if bb.second_level {
                        state.return_stack.push(next);
                    }
                    state.pc = bb.address;
                    continue 'fetch;
                }
                HwCmd::MiBatchBufferEnd => match state.return_stack.pop() {
                    Some(ret) => {
                        state.pc = ret;
                        continue 'fetch;
                    }
                    None => return RunOutcome::Completed,
                },
                HwCmd::PipeControl(pc) => pipe_control(mem, state, inner, &pc),
                HwCmd::MiFlushDw(flush) => flush_dw(mem, state, inner, &flush),
                HwCmd::MiStoreDataImm(sdi) => {
                    let partitions = if sdi.workload_partition_offset {
                        state.partition_count
                    } else {
                        1
                    };
                    write_per_partition(mem, state, sdi.address, partitions, |mem, address| {
                        if sdi.store_qword {
                            mem.write_u64(address, sdi.data)
                        } else {
                            mem.write_u32(address, sdi.data as u32)
                        }
                    })
                }
                HwCmd::ComputeWalker(walker) => {
                    inner.stats.walkers += 1;
                    execute_builtin(mem, walker.kernel_start_address, &walker.inline_data)
                }
                HwCmd::XyCopyBlt(blt) => {
                    inner.stats.blits += 1;
                    copy_blt(mem, &blt)
                }
                HwCmd::XyColorBlt(blt) => {
                    inner.stats.blits += 1;
                    color_blt(mem, &blt)
                }
                _ => Ok(()),
            };
            if let Err(reason) = result {
                return RunOutcome::Faulted(reason);
            }
        }
        return RunOutcome::Faulted(format!("ran past the end of command buffer {:#x}", alloc.gpu_address()));
    }
}

fn write_per_partition(
    mem: &MemoryManager,
    state: &ExecState,
    address: u64,
    partitions: u32,
    write: impl Fn(&MemoryManager, u64) -> Result<(), gpusub_mem::MemoryError>,
) -> Result<(), String> {
    for partition in 0..u64::from(partitions) {
        write(mem, address + partition * state.post_sync_stride).map_err(|err| err.to_string())?;
    }
    Ok(())
}

fn post_sync_value(inner: &mut EngineInner, op: PostSyncOp, immediate: u64) -> Option<u64> {
    match op {
        PostSyncOp::None => None,
        PostSyncOp::WriteImmediateData => Some(immediate),
        PostSyncOp::WriteTimestamp => {
            inner.timestamp += 1;
            Some(inner.timestamp)
        }
    }
}

fn pipe_control(mem: &MemoryManager, state: &ExecState, inner: &mut EngineInner, pc: &PipeControl) -> Result<(), String> {
    let Some(value) = post_sync_value(inner, pc.post_sync, pc.immediate_data) else {
        return Ok(());
    };
    let partitions = if pc.flags.contains(PipeControlFlags::WORKLOAD_PARTITION_OFFSET) {
        state.partition_count
    } else {
        1
    };
    write_per_partition(mem, state, pc.address, partitions, |mem, address| mem.write_u64(address, value))
}

fn flush_dw(mem: &MemoryManager, state: &ExecState, inner: &mut EngineInner, flush: &MiFlushDw) -> Result<(), String> {
    let Some(value) = post_sync_value(inner, flush.post_sync, flush.immediate_data) else {
        return Ok(());
    };
    let partitions = if flush.flags.contains(FlushDwFlags::WORKLOAD_PARTITION_OFFSET) {
        state.partition_count
    } else {
        1
    };
    let qword = flush.flags.contains(FlushDwFlags::STORE_QWORD);
    write_per_partition(mem, state, flush.address, partitions, |mem, address| {
        if qword {
            mem.write_u64(address, value)
        } else {
            mem.write_u32(address, value as u32)
        }
    })
}

fn copy_bytes(mem: &MemoryManager, dst: u64, src: u64, len: u64) -> Result<(), String> {
    if len == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; len as usize];
    mem.read(src, &mut buf).map_err(|err| err.to_string())?;
    mem.write(dst, &buf).map_err(|err| err.to_string())
}

fn fill_bytes(mem: &MemoryManager, dst: u64, len: u64, pattern: &[u8], phase: u64) -> Result<(), String> {
    if len == 0 || pattern.is_empty() {
        return Ok(());
    }
    let n = pattern.len() as u64;
    let buf: Vec<u8> = (0..len).map(|i| pattern[((phase + i) % n) as usize]).collect();
    mem.write(dst, &buf).map_err(|err| err.to_string())
}

/// Built-in kernels have their effect applied directly; other walkers only count.
fn execute_builtin(mem: &MemoryManager, isa_address: u64, inline_data: &[u8]) -> Result<(), String> {
    let Some(kind) = BuiltinKernel::from_isa_address(isa_address) else {
        return Ok(());
    };
    let args_address = u64::from_le_bytes(inline_data[0..8].try_into().unwrap_or_default());
    let mut raw = vec![0u8; BuiltinArgs::encoded_len(kind)];
    mem.read(args_address, &mut raw)
        .map_err(|err| format!("{}: {err}", kind.name()))?;
    let args = BuiltinArgs::decode(kind, &raw).ok_or_else(|| format!("{}: short arguments", kind.name()))?;

    match args {
        BuiltinArgs::Copy { dst, src, size } => copy_bytes(mem, dst, src, size),
        BuiltinArgs::Rect {
            dst,
            src,
            width,
            height,
            depth,
            src_row_pitch,
            src_slice_pitch,
            dst_row_pitch,
            dst_slice_pitch,
        } => {
            for z in 0..depth {
                for y in 0..height {
                    copy_bytes(
                        mem,
                        dst + z * dst_slice_pitch + y * dst_row_pitch,
                        src + z * src_slice_pitch + y * src_row_pitch,
                        width,
                    )?;
                }
            }
            Ok(())
        }
        BuiltinArgs::Fill {
            dst,
            size,
            phase,
            pattern_size,
            pattern,
        } => {
            let pattern_size = (pattern_size as usize).min(pattern.len());
            fill_bytes(mem, dst, size, &pattern[..pattern_size], phase)
        }
    }
}

fn copy_blt(mem: &MemoryManager, blt: &XyCopyBlt) -> Result<(), String> {
    for row in 0..u64::from(blt.height) {
        copy_bytes(
            mem,
            blt.dst + row * u64::from(blt.dst_pitch),
            blt.src + row * u64::from(blt.src_pitch),
            u64::from(blt.width),
        )?;
    }
    Ok(())
}

fn color_blt(mem: &MemoryManager, blt: &XyColorBlt) -> Result<(), String> {
    let pattern_size = (blt.pattern_size as usize).clamp(1, blt.pattern.len());
    let pattern = &blt.pattern[..pattern_size];
    for row in 0..u64::from(blt.height) {
        let start = row * u64::from(blt.pitch);
        fill_bytes(mem, blt.dst + start, u64::from(blt.width), pattern, start)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusub_hw::{CmdStreamWriter, MiBatchBufferEnd, MiBatchBufferStart, MiSemaphoreWait, SemaphoreCompare};
    use gpusub_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryPool};

    fn alloc(mem: &MemoryManager, size: u64) -> Arc<GraphicsAllocation> {
        mem.allocate_graphics_memory_with_properties(&AllocationProperties::new(
            size,
            AllocationType::CommandBuffer,
            MemoryPool::System,
        ))
        .unwrap()
    }

    fn submit(engine: &mut SoftwareEngine, mem: &MemoryManager, batch: u64, task_count: u64, partitions: u32) -> SubmissionStatus {
        let residency = ResidencyContainer::new();
        engine.submit_batch_buffer(
            mem,
            &Submission {
                batch_address: batch,
                ending_address: batch,
                residency: &residency,
                task_count,
                partition_count: partitions,
                post_sync_stride: 16,
                is_cooperative: false,
                direct_submission: false,
                context_id: 0,
            },
        )
    }

    fn tag_write(tag: u64, value: u64, partitions: bool) -> PipeControl {
        let mut flags = PipeControlFlags::CS_STALL;
        if partitions {
            flags |= PipeControlFlags::WORKLOAD_PARTITION_OFFSET;
        }
        PipeControl {
            flags,
            post_sync: PostSyncOp::WriteImmediateData,
            address: tag,
            immediate_data: value,
        }
    }

    #[test]
    fn second_level_batches_return_to_the_caller() {
        let mem = MemoryManager::new();
        let tag = alloc(&mem, 64);
        let child = alloc(&mem, 4096);
        let parent = alloc(&mem, 4096);

        let mut w = CmdStreamWriter::new();
        w.append(&tag_write(tag.gpu_address() + 8, 7, false));
        w.append(&MiBatchBufferEnd);
        child.write(0, w.as_bytes()).unwrap();

        let mut w = CmdStreamWriter::new();
        w.append(&MiBatchBufferStart {
            address: child.gpu_address(),
            second_level: true,
            ppgtt: true,
        });
        w.append(&tag_write(tag.gpu_address(), 1, false));
        w.append(&MiBatchBufferEnd);
        parent.write(0, w.as_bytes()).unwrap();

        let mut engine = SoftwareEngine::new(CompletionMode::Immediate).with_trace();
        assert_eq!(submit(&mut engine, &mem, parent.gpu_address(), 1, 1), SubmissionStatus::Success);
        assert_eq!(tag.read_u64(0).unwrap(), 1);
        assert_eq!(tag.read_u64(8).unwrap(), 7);
        assert_eq!(engine.take_trace().len(), 5);
        assert!(!engine.is_gpu_hang_detected());
    }

    #[test]
    fn partition_offset_writes_every_slot() {
        let mem = MemoryManager::new();
        let tag = alloc(&mem, 64);
        let batch = alloc(&mem, 4096);
        let mut w = CmdStreamWriter::new();
        w.append(&tag_write(tag.gpu_address(), 3, true));
        w.append(&MiBatchBufferEnd);
        batch.write(0, w.as_bytes()).unwrap();

        let mut engine = SoftwareEngine::new(CompletionMode::Immediate);
        submit(&mut engine, &mem, batch.gpu_address(), 3, 2);
        assert_eq!(tag.read_u64(0).unwrap(), 3);
        assert_eq!(tag.read_u64(16).unwrap(), 3);
    }

    #[test]
    fn semaphore_stalls_until_memory_satisfies_it() {
        let mem = MemoryManager::new();
        let tag = alloc(&mem, 64);
        let batch = alloc(&mem, 4096);
        let mut w = CmdStreamWriter::new();
        w.append(&MiSemaphoreWait {
            address: tag.gpu_address() + 32,
            data: 1,
            compare: SemaphoreCompare::Equal,
        });
        w.append(&tag_write(tag.gpu_address(), 1, false));
        w.append(&MiBatchBufferEnd);
        batch.write(0, w.as_bytes()).unwrap();

        let mut engine = SoftwareEngine::new(CompletionMode::Immediate);
        submit(&mut engine, &mem, batch.gpu_address(), 1, 1);
        assert_eq!(engine.pending_batches(), 1);
        assert_eq!(tag.read_u64(0).unwrap(), 0);

        tag.write_u64(32, 1).unwrap();
        engine.poll(&mem);
        assert_eq!(engine.pending_batches(), 0);
        assert_eq!(tag.read_u64(0).unwrap(), 1);
    }

    #[test]
    fn deferred_mode_waits_for_explicit_completion() {
        let mem = MemoryManager::new();
        let tag = alloc(&mem, 64);
        let batch = alloc(&mem, 4096);
        let mut w = CmdStreamWriter::new();
        w.append(&tag_write(tag.gpu_address(), 5, false));
        w.append(&MiBatchBufferEnd);
        batch.write(0, w.as_bytes()).unwrap();

        let mut engine = SoftwareEngine::new(CompletionMode::Deferred);
        submit(&mut engine, &mem, batch.gpu_address(), 5, 1);
        let tags = [tag.gpu_address()];
        let ctx = WaitContext {
            mem: &mem,
            tag_addresses: &tags,
            host_functions: None,
        };
        assert_eq!(
            engine.wait_for_task_count(&ctx, 5, WaitParams::from_timeout_ns(1_000_000)),
            WaitStatus::NotReady
        );
        assert_eq!(engine.complete_pending(&mem), 1);
        assert_eq!(engine.wait_for_task_count(&ctx, 5, WaitParams::infinite()), WaitStatus::Ready);
    }

    #[test]
    fn unterminated_batch_is_a_hang() {
        let mem = MemoryManager::new();
        let batch = alloc(&mem, 64);
        let mut engine = SoftwareEngine::new(CompletionMode::Immediate);
        submit(&mut engine, &mem, batch.gpu_address(), 1, 1);
        assert!(engine.is_gpu_hang_detected());
    }

    #[test]
    fn injected_failure_skips_execution_once() {
        let mem = MemoryManager::new();
        let mut engine = SoftwareEngine::new(CompletionMode::Immediate);
        engine.inject_submit_failure(SubmissionStatus::OutOfHostMemory);
        assert_eq!(submit(&mut engine, &mem, 0, 1, 1), SubmissionStatus::OutOfHostMemory);
        assert_eq!(engine.stats().submissions, 0);
    }
}
