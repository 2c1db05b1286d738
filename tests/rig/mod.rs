#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use gpusub_core::{
    CommandList, CommandListDesc, CommandQueue, CommandQueueDesc, CompletionMode, Device, EngineGroup,
    QueueMode, SoftwareEngine, SubmitConfig,
};
use gpusub_hw::HwCaps;
use gpusub_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test writer so it shows up under `--nocapture`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub struct Rig {
    pub device: Device,
    pub compute: SoftwareEngine,
    pub copy: SoftwareEngine,
}

impl Rig {
    pub fn new(caps: HwCaps, config: SubmitConfig, compute: CompletionMode, copy: CompletionMode) -> Result<Self> {
        init_tracing();
        let compute = SoftwareEngine::new(compute);
        let copy = SoftwareEngine::new(copy);
        let device = Device::with_backends(
            caps,
            config,
            MemoryManager::new(),
            Box::new(compute.clone()),
            Box::new(copy.clone()),
        )
        .context("create device")?;
        Ok(Self { device, compute, copy })
    }

    pub fn immediate(caps: HwCaps) -> Result<Self> {
        Self::new(caps, SubmitConfig::default(), CompletionMode::Immediate, CompletionMode::Immediate)
    }

    pub fn queue(&self, engine: EngineGroup, mode: QueueMode) -> Result<CommandQueue> {
        Ok(self
            .device
            .create_command_queue(&CommandQueueDesc { engine, mode })?)
    }

    pub fn list(&self, engine: EngineGroup) -> Result<CommandList> {
        Ok(CommandList::create(
            &self.device,
            &CommandListDesc {
                engine,
                ..CommandListDesc::default()
            },
        )?)
    }

    pub fn buffer(&self, size: u64) -> Result<Arc<GraphicsAllocation>> {
        self.device
            .memory_manager()
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                size,
                AllocationType::Buffer,
                MemoryPool::Local,
            ))
            .context("allocate buffer")
    }
}
