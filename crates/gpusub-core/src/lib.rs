//! Command-submission core for the gpusub stack.
//!
//! Command lists record dispatches, copies and synchronization into chained command buffers.
//! A command queue reconciles each list's state requirements with what its engine last
//! committed, resolves deferred patches, and hands one batch per execute to the command
//! stream receiver, which tracks completion through monotonically increasing task counts.

pub mod backend;
pub mod cmdlist;
pub mod config;
pub mod container;
pub mod csr;
pub mod device;
pub mod error;
pub mod event;
pub mod heap;
pub mod host_function;
pub mod kernel;
pub mod patch;
pub mod printf;
pub mod queue;
pub mod scratch;
mod state_cmds;
pub mod stream_properties;

pub use backend::{
    CompletionMode, EngineStats, NullBackend, SoftwareEngine, Submission, SubmissionBackend,
    SubmissionStatus, WaitContext, WaitParams, WaitStatus,
};
pub use cmdlist::{
    region_barrier_sync_buffer_size, CommandList, CommandListDesc, EngineGroup, ImmediateCommandList,
    LaunchFlags, MemoryRegion,
};
pub use config::SubmitConfig;
pub use csr::{BatchBuffer, CommandStreamReceiver, CsrState};
pub use device::{Device, COMPUTE_CONTEXT_ID, COPY_CONTEXT_ID};
pub use error::{ze_result_of, ConfigError, Result, SubmitError, ZeResult};
pub use event::{Event, Fence, EVENT_STATE_CLEARED, EVENT_STATE_SIGNALED};
pub use host_function::{HostFunction, HostFunctionCallback, HostFunctionStreamer};
pub use kernel::{BuiltinArgs, BuiltinKernel, CopyRegion, Image, Kernel};
pub use patch::CommandToPatch;
pub use printf::{PrintfBuffer, PrintfSink, TracingPrintfSink};
pub use queue::{CommandQueue, CommandQueueDesc, QueueMode};
pub use scratch::ScratchSpaceController;
pub use stream_properties::{StateLeaves, StreamProperties};
