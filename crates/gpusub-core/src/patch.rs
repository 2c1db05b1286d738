//! Deferred fixups applied to already-encoded command buffers at submission time.

use std::sync::Arc;

use gpusub_mem::GraphicsAllocation;

/// Where a patch writes: a packet (or raw range) inside a command buffer or heap.
#[derive(Clone, Debug)]
pub struct PatchDestination {
    pub alloc: Arc<GraphicsAllocation>,
    pub offset: u64,
}

impl PatchDestination {
    pub fn new(alloc: Arc<GraphicsAllocation>, offset: u64) -> Self {
        Self { alloc, offset }
    }

    pub fn gpu_address(&self) -> u64 {
        self.alloc.gpu_address() + self.offset
    }
}

/// Front-end packet recorded inside a list whose scratch fields are filled in per submission.
#[derive(Clone, Debug)]
pub struct FrontEndPatch {
    pub destination: PatchDestination,
}

/// Scratch pointer carried in walker inline data or in the implicit-args block.
#[derive(Clone, Debug, Default)]
pub struct ScratchPatch {
    pub destination: Option<PatchDestination>,
    /// Added to the scratch address before it is written.
    pub base_address: u64,
    /// Byte offset of the field from `destination`.
    pub offset: Option<u64>,
    /// Bytes written, at most 8.
    pub patch_size: Option<u32>,
    /// Scratch address written by the previous patch pass.
    pub scratch_address_after_patch: u64,
}

/// One packet of a recorded host-function call.
#[derive(Clone, Debug)]
pub struct HostFunctionPatch {
    pub destination: PatchDestination,
    /// Index into the list's recorded host functions.
    pub host_function: usize,
}

/// Range zero-filled at submission so the engine walks it as no-ops.
#[derive(Clone, Debug, Default)]
pub struct NoopSpacePatch {
    pub destination: Option<PatchDestination>,
    pub patch_size: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub enum CommandToPatch {
    FrontEndState(FrontEndPatch),
    ComputeWalkerInlineDataScratch(ScratchPatch),
    ComputeWalkerImplicitArgsScratch(ScratchPatch),
    HostFunctionEntry(HostFunctionPatch),
    HostFunctionUserData(HostFunctionPatch),
    HostFunctionSignalInternalTag(HostFunctionPatch),
    HostFunctionWaitInternalTag(HostFunctionPatch),
    NoopSpace(NoopSpacePatch),
    /// Never legitimately recorded; applying it is a caller bug.
    #[default]
    Invalid,
}

/// Little-endian `value` truncated to `size` bytes.
pub(crate) fn truncated_le_bytes(value: u64, size: u32) -> Vec<u8> {
    assert!(size <= 8, "patch size {size} exceeds a qword");
    value.to_le_bytes()[..size as usize].to_vec()
}
