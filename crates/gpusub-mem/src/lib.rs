//! GPU memory model for the gpusub submission core.
//!
//! Allocations carry CPU-visible backing bytes so that a software engine can execute command
//! buffers and post-sync writes against them.

mod allocation;
mod indirect;
mod manager;
mod residency;
pub mod va;

pub use allocation::{
    AllocationProperties, AllocationType, ContextId, GraphicsAllocation, MemoryPool, UsageSnapshot,
};
pub use indirect::IndirectAllocations;
pub use manager::{MemoryManager, GPU_VA_BASE};
pub use residency::ResidencyContainer;
pub use va::align_up;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("GPU address {address:#x} ({len} bytes) is not backed by a live allocation")]
    BadGpuAddress { address: u64, len: usize },
    #[error("access at {address:#x} ({len} bytes) runs past the end of its allocation")]
    OutOfBounds { address: u64, len: usize },
}
