#![allow(dead_code)]

use std::sync::{Arc, Once};

use gpusub_core::{
    CommandList, CommandListDesc, CommandQueue, CommandQueueDesc, CompletionMode, Device, EngineGroup,
    Kernel, QueueMode, SoftwareEngine, SubmitConfig,
};
use gpusub_hw::{HwCaps, HwCmd};
use gpusub_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool};

/// ISA address no built-in kernel lives at; walkers pointing here only count.
pub const USER_ISA: u64 = 0x0010_0000;

static TRACING: Once = Once::new();

/// Honour `RUST_LOG` for the submission path's `tracing` output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub device: Device,
    pub compute: SoftwareEngine,
    pub copy: SoftwareEngine,
}

pub fn harness(caps: HwCaps) -> Harness {
    harness_with_config(caps, SubmitConfig::default())
}

pub fn harness_with_config(caps: HwCaps, config: SubmitConfig) -> Harness {
    init_tracing();
    let compute = SoftwareEngine::new(CompletionMode::Immediate);
    let copy = SoftwareEngine::new(CompletionMode::Immediate);
    let device = Device::with_backends(
        caps,
        config,
        MemoryManager::new(),
        Box::new(compute.clone()),
        Box::new(copy.clone()),
    )
    .unwrap();
    Harness { device, compute, copy }
}

pub fn queue(device: &Device, engine: EngineGroup, mode: QueueMode) -> CommandQueue {
    device
        .create_command_queue(&CommandQueueDesc { engine, mode })
        .unwrap()
}

pub fn list(device: &Device, engine: EngineGroup) -> CommandList {
    CommandList::create(
        device,
        &CommandListDesc {
            engine,
            ..CommandListDesc::default()
        },
    )
    .unwrap()
}

pub fn buffer(device: &Device, size: u64) -> Arc<GraphicsAllocation> {
    device
        .memory_manager()
        .allocate_graphics_memory_with_properties(&AllocationProperties::new(
            size,
            AllocationType::Buffer,
            MemoryPool::Local,
        ))
        .unwrap()
}

pub fn kernel(name: &str) -> Kernel {
    Kernel::new(name, USER_ISA)
}

pub fn count(cmds: &[HwCmd], pred: impl Fn(&HwCmd) -> bool) -> usize {
    cmds.iter().filter(|c| pred(c)).count()
}

pub fn front_end_count(cmds: &[HwCmd]) -> usize {
    count(cmds, HwCmd::is_front_end)
}

pub fn sba_count(cmds: &[HwCmd]) -> usize {
    count(cmds, |c| matches!(c, HwCmd::StateBaseAddress(_)))
}

/// Packets that program engine state, in recorded order.
pub fn state_programming(cmds: &[HwCmd]) -> Vec<HwCmd> {
    cmds.iter()
        .filter(|c| {
            matches!(
                c,
                HwCmd::StateBaseAddress(_)
                    | HwCmd::MediaVfeState(_)
                    | HwCmd::CfeState(_)
                    | HwCmd::StateComputeMode(_)
                    | HwCmd::PipelineSelect(_)
            )
        })
        .copied()
        .collect()
}
