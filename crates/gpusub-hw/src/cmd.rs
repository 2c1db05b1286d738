//! Hardware command packet layouts.
//!
//! Every packet starts with an 8-byte `{opcode, size_bytes}` header (little-endian). `size_bytes`
//! covers the header and is always a multiple of 4. A single zero dword decodes as a 4-byte
//! `MI_NOOP`, so zero-filled regions inside a command buffer walk as no-ops.
//!
//! Field offsets that deferred patches rewrite are exported as `*_OFFSET` constants relative to
//! the start of the packet.

use bitflags::bitflags;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdOpcode {
    Noop = 0,
    MiStoreDataImm = 0x0020,
    MiLoadRegisterImm = 0x0022,
    MiFlushDw = 0x0026,
    MiSemaphoreWait = 0x001C,
    MiBatchBufferEnd = 0x000A,
    MiBatchBufferStart = 0x0031,
    XyColorBlt = 0x5000,
    XyCopyBlt = 0x5300,
    StateBaseAddress = 0x6101,
    StateSip = 0x6102,
    StatePrefetch = 0x6103,
    GpgpuCsrBaseAddress = 0x6104,
    StateComputeMode = 0x6105,
    PipelineSelect = 0x6904,
    MediaVfeState = 0x7000,
    CfeState = 0x7200,
    ComputeWalker = 0x7202,
    PipeControl = 0x7A00,
}

impl CmdOpcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Noop),
            0x0020 => Some(Self::MiStoreDataImm),
            0x0022 => Some(Self::MiLoadRegisterImm),
            0x0026 => Some(Self::MiFlushDw),
            0x001C => Some(Self::MiSemaphoreWait),
            0x000A => Some(Self::MiBatchBufferEnd),
            0x0031 => Some(Self::MiBatchBufferStart),
            0x5000 => Some(Self::XyColorBlt),
            0x5300 => Some(Self::XyCopyBlt),
            0x6101 => Some(Self::StateBaseAddress),
            0x6102 => Some(Self::StateSip),
            0x6103 => Some(Self::StatePrefetch),
            0x6104 => Some(Self::GpgpuCsrBaseAddress),
            0x6105 => Some(Self::StateComputeMode),
            0x6904 => Some(Self::PipelineSelect),
            0x7000 => Some(Self::MediaVfeState),
            0x7200 => Some(Self::CfeState),
            0x7202 => Some(Self::ComputeWalker),
            0x7A00 => Some(Self::PipeControl),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHdr {
    pub opcode: u32,
    pub size_bytes: u32,
}

impl CmdHdr {
    pub const SIZE_BYTES: usize = 8;
}

/// Size of a bare `MI_NOOP` dword.
pub const NOOP_SIZE_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CmdDecodeError {
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("bad packet size {found}")]
    BadSizeBytes { found: u32 },
    #[error("packet size {found} is not dword aligned")]
    SizeNotAligned { found: u32 },
    #[error("packet at offset {offset} ({packet_size_bytes} bytes) overruns stream of {stream_size_bytes} bytes")]
    PacketOverrunsStream {
        offset: usize,
        packet_size_bytes: u32,
        stream_size_bytes: usize,
    },
    #[error("unknown opcode 0x{found:04X} at offset {offset}")]
    UnknownOpcode { found: u32, offset: usize },
    #[error("packet {opcode:?} has size {found}, expected {expected}")]
    PayloadSizeMismatch {
        opcode: CmdOpcode,
        expected: usize,
        found: usize,
    },
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

/// Implemented by every fixed-size packet type.
pub trait HwCommand: Sized {
    const OPCODE: CmdOpcode;
    const SIZE_BYTES: usize;

    /// Encode the payload into `out`, which is exactly `SIZE_BYTES` long. The header has already
    /// been written.
    fn encode_payload(&self, out: &mut [u8]);

    /// Decode from a full packet (header included).
    fn decode_payload(packet: &[u8]) -> Self;
}

/* ------------------------------ State commands ----------------------------- */

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateBaseAddress {
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub binding_table_pool_base: u64,
    pub surface_state_size: u32,
    pub dynamic_state_size: u32,
    pub indirect_object_size: u32,
    pub binding_table_pool_size: u32,
    pub stateless_mocs: u32,
}

impl HwCommand for StateBaseAddress {
    const OPCODE: CmdOpcode = CmdOpcode::StateBaseAddress;
    const SIZE_BYTES: usize = 72;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.general_state_base);
        write_u64(out, 16, self.surface_state_base);
        write_u64(out, 24, self.dynamic_state_base);
        write_u64(out, 32, self.indirect_object_base);
        write_u64(out, 40, self.binding_table_pool_base);
        write_u32(out, 48, self.surface_state_size);
        write_u32(out, 52, self.dynamic_state_size);
        write_u32(out, 56, self.indirect_object_size);
        write_u32(out, 60, self.binding_table_pool_size);
        write_u32(out, 64, self.stateless_mocs);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            general_state_base: read_u64(p, 8),
            surface_state_base: read_u64(p, 16),
            dynamic_state_base: read_u64(p, 24),
            indirect_object_base: read_u64(p, 32),
            binding_table_pool_base: read_u64(p, 40),
            surface_state_size: read_u32(p, 48),
            dynamic_state_size: read_u32(p, 52),
            indirect_object_size: read_u32(p, 56),
            binding_table_pool_size: read_u32(p, 60),
            stateless_mocs: read_u32(p, 64),
        }
    }
}

/// Offset of the scratch pointer inside both front-end packet flavours.
pub const FRONT_END_SCRATCH_OFFSET: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediaVfeState {
    pub scratch_space_pointer: u64,
    pub per_thread_scratch_space: u32,
    pub per_thread_scratch_space_slot1: u32,
    pub maximum_number_of_threads: u32,
}

impl HwCommand for MediaVfeState {
    const OPCODE: CmdOpcode = CmdOpcode::MediaVfeState;
    const SIZE_BYTES: usize = 32;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, FRONT_END_SCRATCH_OFFSET, self.scratch_space_pointer);
        write_u32(out, 16, self.per_thread_scratch_space);
        write_u32(out, 20, self.per_thread_scratch_space_slot1);
        write_u32(out, 24, self.maximum_number_of_threads);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            scratch_space_pointer: read_u64(p, FRONT_END_SCRATCH_OFFSET),
            per_thread_scratch_space: read_u32(p, 16),
            per_thread_scratch_space_slot1: read_u32(p, 20),
            maximum_number_of_threads: read_u32(p, 24),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FrontEndFlags: u32 {
        const COMPUTE_DISPATCH_ALL_WALKER = 1 << 0;
        const DISABLE_OVERDISPATCH = 1 << 1;
        const DISABLE_EU_FUSION = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CfeState {
    /// Surface-state offset (heapful) or GPU address (heapless) of the scratch buffer.
    pub scratch_space_buffer: u64,
    pub per_thread_scratch_space: u32,
    pub maximum_number_of_threads: u32,
    pub flags: FrontEndFlags,
}

impl HwCommand for CfeState {
    const OPCODE: CmdOpcode = CmdOpcode::CfeState;
    const SIZE_BYTES: usize = 32;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, FRONT_END_SCRATCH_OFFSET, self.scratch_space_buffer);
        write_u32(out, 16, self.per_thread_scratch_space);
        write_u32(out, 20, self.maximum_number_of_threads);
        write_u32(out, 24, self.flags.bits());
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            scratch_space_buffer: read_u64(p, FRONT_END_SCRATCH_OFFSET),
            per_thread_scratch_space: read_u32(p, 16),
            maximum_number_of_threads: read_u32(p, 20),
            flags: FrontEndFlags::from_bits_truncate(read_u32(p, 24)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateComputeMode {
    pub coherency_required: bool,
    pub large_grf_mode: bool,
    pub thread_arbitration_policy: u32,
}

impl HwCommand for StateComputeMode {
    const OPCODE: CmdOpcode = CmdOpcode::StateComputeMode;
    const SIZE_BYTES: usize = 16;

    fn encode_payload(&self, out: &mut [u8]) {
        let flags = u32::from(self.coherency_required) | (u32::from(self.large_grf_mode) << 1);
        write_u32(out, 8, flags);
        write_u32(out, 12, self.thread_arbitration_policy);
    }

    fn decode_payload(p: &[u8]) -> Self {
        let flags = read_u32(p, 8);
        Self {
            coherency_required: flags & 1 != 0,
            large_grf_mode: flags & 2 != 0,
            thread_arbitration_policy: read_u32(p, 12),
        }
    }
}

pub const PIPELINE_SELECT_3D: u32 = 0;
pub const PIPELINE_SELECT_GPGPU: u32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineSelect {
    pub pipeline: u32,
    pub systolic_mode: bool,
}

impl HwCommand for PipelineSelect {
    const OPCODE: CmdOpcode = CmdOpcode::PipelineSelect;
    const SIZE_BYTES: usize = 16;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u32(out, 8, self.pipeline);
        write_u32(out, 12, u32::from(self.systolic_mode));
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            pipeline: read_u32(p, 8),
            systolic_mode: read_u32(p, 12) != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateSip {
    pub sip_address: u64,
}

impl HwCommand for StateSip {
    const OPCODE: CmdOpcode = CmdOpcode::StateSip;
    const SIZE_BYTES: usize = 16;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.sip_address);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            sip_address: read_u64(p, 8),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpgpuCsrBaseAddress {
    pub address: u64,
}

impl HwCommand for GpgpuCsrBaseAddress {
    const OPCODE: CmdOpcode = CmdOpcode::GpgpuCsrBaseAddress;
    const SIZE_BYTES: usize = 16;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.address);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            address: read_u64(p, 8),
        }
    }
}

/* ------------------------------ Flush / sync ------------------------------- */

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PostSyncOp {
    #[default]
    None = 0,
    WriteImmediateData = 1,
    WriteTimestamp = 3,
}

impl PostSyncOp {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::WriteImmediateData,
            3 => Self::WriteTimestamp,
            _ => Self::None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PipeControlFlags: u32 {
        const CS_STALL = 1 << 0;
        const DC_FLUSH = 1 << 1;
        const HDC_PIPELINE_FLUSH = 1 << 2;
        const TEXTURE_CACHE_INVALIDATE = 1 << 3;
        const NOTIFY_ENABLE = 1 << 4;
        /// Each partition writes its post-sync at `address + partition * stride`.
        const WORKLOAD_PARTITION_OFFSET = 1 << 5;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeControl {
    pub flags: PipeControlFlags,
    pub post_sync: PostSyncOp,
    pub address: u64,
    pub immediate_data: u64,
}

impl HwCommand for PipeControl {
    const OPCODE: CmdOpcode = CmdOpcode::PipeControl;
    const SIZE_BYTES: usize = 32;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u32(out, 8, self.flags.bits());
        write_u32(out, 12, self.post_sync as u32);
        write_u64(out, 16, self.address);
        write_u64(out, 24, self.immediate_data);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            flags: PipeControlFlags::from_bits_truncate(read_u32(p, 8)),
            post_sync: PostSyncOp::from_u32(read_u32(p, 12)),
            address: read_u64(p, 16),
            immediate_data: read_u64(p, 24),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FlushDwFlags: u32 {
        const NOTIFY_ENABLE = 1 << 0;
        const STORE_QWORD = 1 << 1;
        const WORKLOAD_PARTITION_OFFSET = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MiFlushDw {
    pub post_sync: PostSyncOp,
    pub flags: FlushDwFlags,
    pub address: u64,
    pub immediate_data: u64,
}

impl HwCommand for MiFlushDw {
    const OPCODE: CmdOpcode = CmdOpcode::MiFlushDw;
    const SIZE_BYTES: usize = 32;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u32(out, 8, self.post_sync as u32);
        write_u32(out, 12, self.flags.bits());
        write_u64(out, 16, self.address);
        write_u64(out, 24, self.immediate_data);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            post_sync: PostSyncOp::from_u32(read_u32(p, 8)),
            flags: FlushDwFlags::from_bits_truncate(read_u32(p, 12)),
            address: read_u64(p, 16),
            immediate_data: read_u64(p, 24),
        }
    }
}

pub const STORE_DATA_IMM_ADDRESS_OFFSET: usize = 8;
pub const STORE_DATA_IMM_DATA_OFFSET: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MiStoreDataImm {
    pub address: u64,
    pub data: u64,
    pub store_qword: bool,
    pub workload_partition_offset: bool,
}

impl HwCommand for MiStoreDataImm {
    const OPCODE: CmdOpcode = CmdOpcode::MiStoreDataImm;
    const SIZE_BYTES: usize = 32;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, STORE_DATA_IMM_ADDRESS_OFFSET, self.address);
        write_u64(out, STORE_DATA_IMM_DATA_OFFSET, self.data);
        let flags =
            u32::from(self.store_qword) | (u32::from(self.workload_partition_offset) << 1);
        write_u32(out, 24, flags);
    }

    fn decode_payload(p: &[u8]) -> Self {
        let flags = read_u32(p, 24);
        Self {
            address: read_u64(p, STORE_DATA_IMM_ADDRESS_OFFSET),
            data: read_u64(p, STORE_DATA_IMM_DATA_OFFSET),
            store_qword: flags & 1 != 0,
            workload_partition_offset: flags & 2 != 0,
        }
    }
}

pub const SEMAPHORE_WAIT_ADDRESS_OFFSET: usize = 8;
pub const SEMAPHORE_WAIT_DATA_OFFSET: usize = 16;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SemaphoreCompare {
    /// Memory value >= semaphore data.
    #[default]
    GreaterOrEqual = 0,
    Equal = 1,
    NotEqual = 2,
}

impl SemaphoreCompare {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Equal,
            2 => Self::NotEqual,
            _ => Self::GreaterOrEqual,
        }
    }

    pub fn is_satisfied(self, memory_value: u64, data: u64) -> bool {
        match self {
            Self::GreaterOrEqual => memory_value >= data,
            Self::Equal => memory_value == data,
            Self::NotEqual => memory_value != data,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MiSemaphoreWait {
    pub address: u64,
    pub data: u64,
    pub compare: SemaphoreCompare,
}

impl HwCommand for MiSemaphoreWait {
    const OPCODE: CmdOpcode = CmdOpcode::MiSemaphoreWait;
    const SIZE_BYTES: usize = 32;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, SEMAPHORE_WAIT_ADDRESS_OFFSET, self.address);
        write_u64(out, SEMAPHORE_WAIT_DATA_OFFSET, self.data);
        write_u32(out, 24, self.compare as u32);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            address: read_u64(p, SEMAPHORE_WAIT_ADDRESS_OFFSET),
            data: read_u64(p, SEMAPHORE_WAIT_DATA_OFFSET),
            compare: SemaphoreCompare::from_u32(read_u32(p, 24)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MiLoadRegisterImm {
    pub register: u32,
    pub data: u32,
}

impl HwCommand for MiLoadRegisterImm {
    const OPCODE: CmdOpcode = CmdOpcode::MiLoadRegisterImm;
    const SIZE_BYTES: usize = 16;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u32(out, 8, self.register);
        write_u32(out, 12, self.data);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            register: read_u32(p, 8),
            data: read_u32(p, 12),
        }
    }
}

/* ----------------------------- Batch chaining ------------------------------ */

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MiBatchBufferStart {
    pub address: u64,
    pub second_level: bool,
    pub ppgtt: bool,
}

impl HwCommand for MiBatchBufferStart {
    const OPCODE: CmdOpcode = CmdOpcode::MiBatchBufferStart;
    const SIZE_BYTES: usize = 24;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.address);
        let flags = u32::from(self.second_level) | (u32::from(self.ppgtt) << 1);
        write_u32(out, 16, flags);
    }

    fn decode_payload(p: &[u8]) -> Self {
        let flags = read_u32(p, 16);
        Self {
            address: read_u64(p, 8),
            second_level: flags & 1 != 0,
            ppgtt: flags & 2 != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MiBatchBufferEnd;

impl HwCommand for MiBatchBufferEnd {
    const OPCODE: CmdOpcode = CmdOpcode::MiBatchBufferEnd;
    const SIZE_BYTES: usize = CmdHdr::SIZE_BYTES;

    fn encode_payload(&self, _out: &mut [u8]) {}

    fn decode_payload(_p: &[u8]) -> Self {
        Self
    }
}

/* ------------------------------- Dispatch ---------------------------------- */

pub const COMPUTE_WALKER_INLINE_DATA_OFFSET: usize = 48;
pub const COMPUTE_WALKER_INLINE_DATA_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComputeWalker {
    pub kernel_start_address: u64,
    pub indirect_data_offset: u32,
    pub indirect_data_length: u32,
    pub thread_group_count: [u32; 3],
    pub partition_count: u32,
    pub inline_data: [u8; COMPUTE_WALKER_INLINE_DATA_SIZE],
}

impl HwCommand for ComputeWalker {
    const OPCODE: CmdOpcode = CmdOpcode::ComputeWalker;
    const SIZE_BYTES: usize = COMPUTE_WALKER_INLINE_DATA_OFFSET + COMPUTE_WALKER_INLINE_DATA_SIZE;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.kernel_start_address);
        write_u32(out, 16, self.indirect_data_offset);
        write_u32(out, 20, self.indirect_data_length);
        write_u32(out, 24, self.thread_group_count[0]);
        write_u32(out, 28, self.thread_group_count[1]);
        write_u32(out, 32, self.thread_group_count[2]);
        write_u32(out, 36, self.partition_count);
        out[COMPUTE_WALKER_INLINE_DATA_OFFSET..Self::SIZE_BYTES].copy_from_slice(&self.inline_data);
    }

    fn decode_payload(p: &[u8]) -> Self {
        let mut inline_data = [0u8; COMPUTE_WALKER_INLINE_DATA_SIZE];
        inline_data.copy_from_slice(&p[COMPUTE_WALKER_INLINE_DATA_OFFSET..Self::SIZE_BYTES]);
        Self {
            kernel_start_address: read_u64(p, 8),
            indirect_data_offset: read_u32(p, 16),
            indirect_data_length: read_u32(p, 20),
            thread_group_count: [read_u32(p, 24), read_u32(p, 28), read_u32(p, 32)],
            partition_count: read_u32(p, 36),
            inline_data,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatePrefetch {
    pub address: u64,
    pub size: u32,
}

impl HwCommand for StatePrefetch {
    const OPCODE: CmdOpcode = CmdOpcode::StatePrefetch;
    const SIZE_BYTES: usize = 24;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.address);
        write_u32(out, 16, self.size);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            address: read_u64(p, 8),
            size: read_u32(p, 16),
        }
    }
}

/* ------------------------------- Blitter ----------------------------------- */

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XyCopyBlt {
    pub src: u64,
    pub dst: u64,
    pub width: u32,
    pub height: u32,
    pub src_pitch: u32,
    pub dst_pitch: u32,
}

impl HwCommand for XyCopyBlt {
    const OPCODE: CmdOpcode = CmdOpcode::XyCopyBlt;
    const SIZE_BYTES: usize = 40;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.src);
        write_u64(out, 16, self.dst);
        write_u32(out, 24, self.width);
        write_u32(out, 28, self.height);
        write_u32(out, 32, self.src_pitch);
        write_u32(out, 36, self.dst_pitch);
    }

    fn decode_payload(p: &[u8]) -> Self {
        Self {
            src: read_u64(p, 8),
            dst: read_u64(p, 16),
            width: read_u32(p, 24),
            height: read_u32(p, 28),
            src_pitch: read_u32(p, 32),
            dst_pitch: read_u32(p, 36),
        }
    }
}

pub const MAX_FILL_PATTERN_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XyColorBlt {
    pub dst: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub pattern_size: u32,
    pub pattern: [u8; MAX_FILL_PATTERN_SIZE],
}

impl HwCommand for XyColorBlt {
    const OPCODE: CmdOpcode = CmdOpcode::XyColorBlt;
    const SIZE_BYTES: usize = 48;

    fn encode_payload(&self, out: &mut [u8]) {
        write_u64(out, 8, self.dst);
        write_u32(out, 16, self.width);
        write_u32(out, 20, self.height);
        write_u32(out, 24, self.pitch);
        write_u32(out, 28, self.pattern_size);
        out[32..48].copy_from_slice(&self.pattern);
    }

    fn decode_payload(p: &[u8]) -> Self {
        let mut pattern = [0u8; MAX_FILL_PATTERN_SIZE];
        pattern.copy_from_slice(&p[32..48]);
        Self {
            dst: read_u64(p, 8),
            width: read_u32(p, 16),
            height: read_u32(p, 20),
            pitch: read_u32(p, 24),
            pattern_size: read_u32(p, 28),
            pattern,
        }
    }
}

/* ------------------------------ Decoded view ------------------------------- */

/// A decoded packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwCmd {
    Noop,
    StateBaseAddress(StateBaseAddress),
    MediaVfeState(MediaVfeState),
    CfeState(CfeState),
    StateComputeMode(StateComputeMode),
    PipelineSelect(PipelineSelect),
    StateSip(StateSip),
    GpgpuCsrBaseAddress(GpgpuCsrBaseAddress),
    PipeControl(PipeControl),
    MiFlushDw(MiFlushDw),
    MiStoreDataImm(MiStoreDataImm),
    MiSemaphoreWait(MiSemaphoreWait),
    MiLoadRegisterImm(MiLoadRegisterImm),
    MiBatchBufferStart(MiBatchBufferStart),
    MiBatchBufferEnd,
    ComputeWalker(ComputeWalker),
    StatePrefetch(StatePrefetch),
    XyCopyBlt(XyCopyBlt),
    XyColorBlt(XyColorBlt),
}

impl HwCmd {
    pub fn opcode(&self) -> CmdOpcode {
        match self {
            HwCmd::Noop => CmdOpcode::Noop,
            HwCmd::StateBaseAddress(_) => CmdOpcode::StateBaseAddress,
            HwCmd::MediaVfeState(_) => CmdOpcode::MediaVfeState,
            HwCmd::CfeState(_) => CmdOpcode::CfeState,
            HwCmd::StateComputeMode(_) => CmdOpcode::StateComputeMode,
            HwCmd::PipelineSelect(_) => CmdOpcode::PipelineSelect,
            HwCmd::StateSip(_) => CmdOpcode::StateSip,
            HwCmd::GpgpuCsrBaseAddress(_) => CmdOpcode::GpgpuCsrBaseAddress,
            HwCmd::PipeControl(_) => CmdOpcode::PipeControl,
            HwCmd::MiFlushDw(_) => CmdOpcode::MiFlushDw,
            HwCmd::MiStoreDataImm(_) => CmdOpcode::MiStoreDataImm,
            HwCmd::MiSemaphoreWait(_) => CmdOpcode::MiSemaphoreWait,
            HwCmd::MiLoadRegisterImm(_) => CmdOpcode::MiLoadRegisterImm,
            HwCmd::MiBatchBufferStart(_) => CmdOpcode::MiBatchBufferStart,
            HwCmd::MiBatchBufferEnd => CmdOpcode::MiBatchBufferEnd,
            HwCmd::ComputeWalker(_) => CmdOpcode::ComputeWalker,
            HwCmd::StatePrefetch(_) => CmdOpcode::StatePrefetch,
            HwCmd::XyCopyBlt(_) => CmdOpcode::XyCopyBlt,
            HwCmd::XyColorBlt(_) => CmdOpcode::XyColorBlt,
        }
    }

    /// True for the front-end packet of either hardware flavour.
    pub fn is_front_end(&self) -> bool {
        matches!(self, HwCmd::MediaVfeState(_) | HwCmd::CfeState(_))
    }
}

fn decode_fixed<T: HwCommand>(packet: &[u8]) -> Result<T, CmdDecodeError> {
    if packet.len() != T::SIZE_BYTES {
        return Err(CmdDecodeError::PayloadSizeMismatch {
            opcode: T::OPCODE,
            expected: T::SIZE_BYTES,
            found: packet.len(),
        });
    }
    Ok(T::decode_payload(packet))
}

/// A raw packet produced by [`CmdStreamIter`].
#[derive(Clone, Copy, Debug)]
pub struct CmdPacket<'a> {
    /// Byte offset of the packet inside the walked buffer.
    pub offset: usize,
    pub opcode: CmdOpcode,
    /// The whole packet, header included.
    pub bytes: &'a [u8],
}

impl<'a> CmdPacket<'a> {
    pub fn decode(&self) -> Result<HwCmd, CmdDecodeError> {
        let p = self.bytes;
        Ok(match self.opcode {
            CmdOpcode::Noop => HwCmd::Noop,
            CmdOpcode::StateBaseAddress => HwCmd::StateBaseAddress(decode_fixed(p)?),
            CmdOpcode::MediaVfeState => HwCmd::MediaVfeState(decode_fixed(p)?),
            CmdOpcode::CfeState => HwCmd::CfeState(decode_fixed(p)?),
            CmdOpcode::StateComputeMode => HwCmd::StateComputeMode(decode_fixed(p)?),
            CmdOpcode::PipelineSelect => HwCmd::PipelineSelect(decode_fixed(p)?),
            CmdOpcode::StateSip => HwCmd::StateSip(decode_fixed(p)?),
            CmdOpcode::GpgpuCsrBaseAddress => HwCmd::GpgpuCsrBaseAddress(decode_fixed(p)?),
            CmdOpcode::PipeControl => HwCmd::PipeControl(decode_fixed(p)?),
            CmdOpcode::MiFlushDw => HwCmd::MiFlushDw(decode_fixed(p)?),
            CmdOpcode::MiStoreDataImm => HwCmd::MiStoreDataImm(decode_fixed(p)?),
            CmdOpcode::MiSemaphoreWait => HwCmd::MiSemaphoreWait(decode_fixed(p)?),
            CmdOpcode::MiLoadRegisterImm => HwCmd::MiLoadRegisterImm(decode_fixed(p)?),
            CmdOpcode::MiBatchBufferStart => HwCmd::MiBatchBufferStart(decode_fixed(p)?),
            CmdOpcode::MiBatchBufferEnd => {
                decode_fixed::<MiBatchBufferEnd>(p)?;
                HwCmd::MiBatchBufferEnd
            }
            CmdOpcode::ComputeWalker => HwCmd::ComputeWalker(decode_fixed(p)?),
            CmdOpcode::StatePrefetch => HwCmd::StatePrefetch(decode_fixed(p)?),
            CmdOpcode::XyCopyBlt => HwCmd::XyCopyBlt(decode_fixed(p)?),
            CmdOpcode::XyColorBlt => HwCmd::XyColorBlt(decode_fixed(p)?),
        })
    }
}

/// Walks packets in a raw command buffer.
pub struct CmdStreamIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CmdStreamIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::starting_at(buf, 0)
    }

    pub fn starting_at(buf: &'a [u8], offset: usize) -> Self {
        Self {
            buf,
            offset,
            done: false,
        }
    }
}

impl<'a> Iterator for CmdStreamIter<'a> {
    type Item = Result<CmdPacket<'a>, CmdDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }

        let offset = self.offset;
        let rest = &self.buf[offset..];
        if rest.len() < NOOP_SIZE_BYTES {
            self.done = true;
            return Some(Err(CmdDecodeError::BufferTooSmall));
        }

        let opcode = read_u32(rest, 0);
        if opcode == CmdOpcode::Noop as u32 {
            self.offset += NOOP_SIZE_BYTES;
            return Some(Ok(CmdPacket {
                offset,
                opcode: CmdOpcode::Noop,
                bytes: &rest[..NOOP_SIZE_BYTES],
            }));
        }

        if rest.len() < CmdHdr::SIZE_BYTES {
            self.done = true;
            return Some(Err(CmdDecodeError::BufferTooSmall));
        }
        let size_bytes = read_u32(rest, 4);
        if (size_bytes as usize) < CmdHdr::SIZE_BYTES {
            self.done = true;
            return Some(Err(CmdDecodeError::BadSizeBytes { found: size_bytes }));
        }
        if size_bytes % 4 != 0 {
            self.done = true;
            return Some(Err(CmdDecodeError::SizeNotAligned { found: size_bytes }));
        }
        if size_bytes as usize > rest.len() {
            self.done = true;
            return Some(Err(CmdDecodeError::PacketOverrunsStream {
                offset,
                packet_size_bytes: size_bytes,
                stream_size_bytes: self.buf.len(),
            }));
        }
        let Some(op) = CmdOpcode::from_u32(opcode) else {
            self.done = true;
            return Some(Err(CmdDecodeError::UnknownOpcode {
                found: opcode,
                offset,
            }));
        };

        self.offset += size_bytes as usize;
        Some(Ok(CmdPacket {
            offset,
            opcode: op,
            bytes: &rest[..size_bytes as usize],
        }))
    }
}

/// Decode every packet of `buf`, skipping no-ops.
pub fn decode_cmds(buf: &[u8]) -> Result<Vec<(usize, HwCmd)>, CmdDecodeError> {
    let mut out = Vec::new();
    for packet in CmdStreamIter::new(buf) {
        let packet = packet?;
        if packet.opcode == CmdOpcode::Noop {
            continue;
        }
        out.push((packet.offset, packet.decode()?));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dwords_walk_as_noops() {
        let buf = [0u8; 12];
        let packets: Vec<_> = CmdStreamIter::new(&buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.opcode == CmdOpcode::Noop));
        assert!(decode_cmds(&buf).unwrap().is_empty());
    }

    #[test]
    fn iterator_rejects_overrunning_packet() {
        let mut buf = vec![0u8; 16];
        write_u32(&mut buf, 0, CmdOpcode::PipeControl as u32);
        write_u32(&mut buf, 4, PipeControl::SIZE_BYTES as u32);
        let err = CmdStreamIter::new(&buf).next().unwrap().unwrap_err();
        assert!(matches!(err, CmdDecodeError::PacketOverrunsStream { offset: 0, .. }));
    }

    #[test]
    fn iterator_rejects_unknown_opcode() {
        let mut buf = vec![0u8; 8];
        write_u32(&mut buf, 0, 0xFFFF);
        write_u32(&mut buf, 4, 8);
        let err = CmdStreamIter::new(&buf).next().unwrap().unwrap_err();
        assert_eq!(
            err,
            CmdDecodeError::UnknownOpcode {
                found: 0xFFFF,
                offset: 0
            }
        );
    }

    #[test]
    fn semaphore_compare_modes() {
        assert!(SemaphoreCompare::GreaterOrEqual.is_satisfied(5, 5));
        assert!(!SemaphoreCompare::GreaterOrEqual.is_satisfied(4, 5));
        assert!(SemaphoreCompare::Equal.is_satisfied(7, 7));
        assert!(SemaphoreCompare::NotEqual.is_satisfied(7, 8));
    }

    #[test]
    fn opcode_from_u32_roundtrips_known_values() {
        for op in [
            CmdOpcode::StateBaseAddress,
            CmdOpcode::MediaVfeState,
            CmdOpcode::CfeState,
            CmdOpcode::PipeControl,
            CmdOpcode::MiFlushDw,
            CmdOpcode::MiBatchBufferStart,
            CmdOpcode::MiBatchBufferEnd,
            CmdOpcode::ComputeWalker,
        ] {
            assert_eq!(CmdOpcode::from_u32(op as u32), Some(op));
        }
        assert_eq!(CmdOpcode::from_u32(0xDEAD), None);
    }
}
