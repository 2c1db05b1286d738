//! Device: capabilities, configuration, memory and one receiver per engine group.

use std::sync::Arc;

use gpusub_hw::HwCaps;
use gpusub_mem::{ContextId, MemoryManager};
use tracing::{debug, warn};

use crate::backend::{CompletionMode, SoftwareEngine, SubmissionBackend};
use crate::cmdlist::EngineGroup;
use crate::config::SubmitConfig;
use crate::csr::CommandStreamReceiver;
use crate::error::{Result, SubmitError};
use crate::event::Event;
use crate::queue::{CommandQueue, CommandQueueDesc};

pub const COMPUTE_CONTEXT_ID: ContextId = 0;
pub const COPY_CONTEXT_ID: ContextId = 1;

pub(crate) fn context_id(engine: EngineGroup) -> ContextId {
    match engine {
        EngineGroup::Compute => COMPUTE_CONTEXT_ID,
        EngineGroup::Copy => COPY_CONTEXT_ID,
    }
}

/// What lists and queues need from their device without holding the device itself.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) caps: HwCaps,
    pub(crate) config: SubmitConfig,
    pub(crate) mem: Arc<MemoryManager>,
}

#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
    compute: Arc<CommandStreamReceiver>,
    copy: Arc<CommandStreamReceiver>,
}

impl Device {
    /// Device backed by software engines that complete work at submission.
    pub fn new(caps: HwCaps, config: SubmitConfig) -> Result<Self> {
        Self::with_backends(
            caps,
            config,
            MemoryManager::new(),
            Box::new(SoftwareEngine::new(CompletionMode::Immediate)),
            Box::new(SoftwareEngine::new(CompletionMode::Immediate)),
        )
    }

    pub fn with_backends(
        caps: HwCaps,
        config: SubmitConfig,
        mem: MemoryManager,
        compute: Box<dyn SubmissionBackend>,
        copy: Box<dyn SubmissionBackend>,
    ) -> Result<Self> {
        if let Err(err) = config.validate() {
            warn!(error = %err, "rejected submission config");
            return Err(SubmitError::InvalidArgument("invalid submission config"));
        }
        let mem = Arc::new(mem);
        let compute = CommandStreamReceiver::new(
            COMPUTE_CONTEXT_ID,
            EngineGroup::Compute,
            &caps,
            &config,
            mem.clone(),
            compute,
        )?;
        let copy = CommandStreamReceiver::new(COPY_CONTEXT_ID, EngineGroup::Copy, &caps, &config, mem.clone(), copy)?;
        debug!(
            front_end = ?caps.front_end,
            heapless = caps.heapless,
            tiles = caps.tile_count,
            direct_submission = config.direct_submission,
            "device created"
        );
        Ok(Self {
            shared: Arc::new(DeviceShared { caps, config, mem }),
            compute: Arc::new(compute),
            copy: Arc::new(copy),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn caps(&self) -> &HwCaps {
        &self.shared.caps
    }

    pub fn config(&self) -> &SubmitConfig {
        &self.shared.config
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.shared.mem
    }

    pub fn csr(&self, engine: EngineGroup) -> &Arc<CommandStreamReceiver> {
        match engine {
            EngineGroup::Compute => &self.compute,
            EngineGroup::Copy => &self.copy,
        }
    }

    pub fn create_event(&self) -> Result<Event> {
        Event::new(self.shared.mem.clone(), &self.shared.caps)
    }

    pub fn create_command_queue(&self, desc: &CommandQueueDesc) -> Result<CommandQueue> {
        CommandQueue::create(self, desc)
    }
}
