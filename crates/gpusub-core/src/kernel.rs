//! Kernel descriptors and the built-in copy/fill kernels.

use std::sync::Arc;

use gpusub_hw::MAX_FILL_PATTERN_SIZE;
use gpusub_mem::GraphicsAllocation;

/// Everything a dispatch needs to know about a compiled kernel.
#[derive(Clone, Debug, Default)]
pub struct Kernel {
    pub name: String,
    pub isa_address: u64,
    /// Per-thread scratch for slot 0 and private scratch slot 1.
    pub per_thread_scratch: [u32; 2],
    pub group_size: [u32; 3],
    pub large_grf: bool,
    pub requires_coherency: bool,
    pub thread_arbitration_policy: u32,
    pub disable_eu_fusion: bool,
    pub disable_overdispatch: bool,
    pub disable_mid_thread_preemption: bool,
    pub uses_printf: bool,
    pub has_indirect_access: bool,
    pub uses_implicit_args: bool,
    /// Region size for cross-partition region barriers.
    pub region_barrier_size: Option<u32>,
    pub binding_table_entries: u32,
    pub dynamic_state_size: u32,
    /// Cross-thread data copied into the indirect object heap.
    pub arguments: Vec<u8>,
    pub resources: Vec<Arc<GraphicsAllocation>>,
    pub builtin: Option<BuiltinKernel>,
}

impl Kernel {
    pub fn new(name: impl Into<String>, isa_address: u64) -> Self {
        Self {
            name: name.into(),
            isa_address,
            group_size: [1, 1, 1],
            ..Default::default()
        }
    }

    pub fn builtin(kind: BuiltinKernel, args: &BuiltinArgs) -> Self {
        Self {
            name: kind.name().to_owned(),
            isa_address: kind.isa_address(),
            group_size: [1, 1, 1],
            arguments: args.encode(),
            builtin: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_scratch(mut self, slot0: u32, slot1: u32) -> Self {
        self.per_thread_scratch = [slot0, slot1];
        self
    }

    pub fn with_large_grf(mut self) -> Self {
        self.large_grf = true;
        self
    }

    pub fn with_coherency(mut self) -> Self {
        self.requires_coherency = true;
        self
    }

    pub fn with_printf(mut self) -> Self {
        self.uses_printf = true;
        self
    }

    pub fn with_indirect_access(mut self) -> Self {
        self.has_indirect_access = true;
        self
    }

    pub fn with_implicit_args(mut self) -> Self {
        self.uses_implicit_args = true;
        self
    }

    pub fn with_region_barrier(mut self, region_size: u32) -> Self {
        self.region_barrier_size = Some(region_size);
        self
    }

    pub fn with_disable_eu_fusion(mut self) -> Self {
        self.disable_eu_fusion = true;
        self
    }

    pub fn with_disable_mid_thread_preemption(mut self) -> Self {
        self.disable_mid_thread_preemption = true;
        self
    }

    pub fn with_binding_table_entries(mut self, entries: u32) -> Self {
        self.binding_table_entries = entries;
        self
    }

    pub fn with_dynamic_state_size(mut self, size: u32) -> Self {
        self.dynamic_state_size = size;
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<u8>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_resource(mut self, alloc: Arc<GraphicsAllocation>) -> Self {
        self.resources.push(alloc);
        self
    }

    pub fn needs_scratch(&self) -> bool {
        self.per_thread_scratch.iter().any(|&s| s > 0)
    }
}

/// Start of the (unbacked) address range reserved for built-in kernel ISA.
pub const BUILTIN_ISA_BASE: u64 = 0x0000_7F00_0000_0000;
const BUILTIN_ISA_STRIDE: u64 = 0x1000;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinKernel {
    CopyBufferToBufferSide = 0,
    CopyBufferToBufferMiddle = 1,
    CopyBufferToBufferSideStateless = 2,
    CopyBufferToBufferMiddleStateless = 3,
    CopyBufferRectBytes2d = 4,
    CopyBufferRectBytes3d = 5,
    CopyBufferRectBytes2dStateless = 6,
    CopyBufferRectBytes3dStateless = 7,
    FillBufferImmediate = 8,
    FillBufferImmediateLeftOver = 9,
    FillBufferImmediateStateless = 10,
    FillBufferImmediateLeftOverStateless = 11,
    CopyImageRegion2d = 12,
    CopyImageRegion3d = 13,
}

impl BuiltinKernel {
    const ALL: [BuiltinKernel; 14] = [
        BuiltinKernel::CopyBufferToBufferSide,
        BuiltinKernel::CopyBufferToBufferMiddle,
        BuiltinKernel::CopyBufferToBufferSideStateless,
        BuiltinKernel::CopyBufferToBufferMiddleStateless,
        BuiltinKernel::CopyBufferRectBytes2d,
        BuiltinKernel::CopyBufferRectBytes3d,
        BuiltinKernel::CopyBufferRectBytes2dStateless,
        BuiltinKernel::CopyBufferRectBytes3dStateless,
        BuiltinKernel::FillBufferImmediate,
        BuiltinKernel::FillBufferImmediateLeftOver,
        BuiltinKernel::FillBufferImmediateStateless,
        BuiltinKernel::FillBufferImmediateLeftOverStateless,
        BuiltinKernel::CopyImageRegion2d,
        BuiltinKernel::CopyImageRegion3d,
    ];

    pub fn isa_address(self) -> u64 {
        BUILTIN_ISA_BASE + self as u64 * BUILTIN_ISA_STRIDE
    }

    pub fn from_isa_address(address: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.isa_address() == address)
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinKernel::CopyBufferToBufferSide => "CopyBufferToBufferSide",
            BuiltinKernel::CopyBufferToBufferMiddle => "CopyBufferToBufferMiddle",
            BuiltinKernel::CopyBufferToBufferSideStateless => "CopyBufferToBufferSideStateless",
            BuiltinKernel::CopyBufferToBufferMiddleStateless => "CopyBufferToBufferMiddleStateless",
            BuiltinKernel::CopyBufferRectBytes2d => "CopyBufferRectBytes2d",
            BuiltinKernel::CopyBufferRectBytes3d => "CopyBufferRectBytes3d",
            BuiltinKernel::CopyBufferRectBytes2dStateless => "CopyBufferRectBytes2dStateless",
            BuiltinKernel::CopyBufferRectBytes3dStateless => "CopyBufferRectBytes3dStateless",
            BuiltinKernel::FillBufferImmediate => "FillBufferImmediate",
            BuiltinKernel::FillBufferImmediateLeftOver => "FillBufferImmediateLeftOver",
            BuiltinKernel::FillBufferImmediateStateless => "FillBufferImmediateStateless",
            BuiltinKernel::FillBufferImmediateLeftOverStateless => {
                "FillBufferImmediateLeftOverStateless"
            }
            BuiltinKernel::CopyImageRegion2d => "CopyImageRegion2d",
            BuiltinKernel::CopyImageRegion3d => "CopyImageRegion3d",
        }
    }

    pub fn is_stateless(self) -> bool {
        matches!(
            self,
            BuiltinKernel::CopyBufferToBufferSideStateless
                | BuiltinKernel::CopyBufferToBufferMiddleStateless
                | BuiltinKernel::CopyBufferRectBytes2dStateless
                | BuiltinKernel::CopyBufferRectBytes3dStateless
                | BuiltinKernel::FillBufferImmediateStateless
                | BuiltinKernel::FillBufferImmediateLeftOverStateless
        )
    }
}

/// A byte-addressed 3D box: origin plus extent (width in bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyRegion {
    pub origin_x: u64,
    pub origin_y: u64,
    pub origin_z: u64,
    pub width: u64,
    pub height: u64,
    pub depth: u64,
}

impl CopyRegion {
    pub fn new_2d(origin_x: u64, origin_y: u64, width: u64, height: u64) -> Self {
        Self {
            origin_x,
            origin_y,
            origin_z: 0,
            width,
            height,
            depth: 1,
        }
    }

    /// Offset of the region origin under the given pitches.
    pub fn origin_offset(&self, row_pitch: u64, slice_pitch: u64) -> u64 {
        self.origin_z * slice_pitch + self.origin_y * row_pitch + self.origin_x
    }

    /// Last byte touched plus one, relative to the surface start.
    pub fn end_offset(&self, row_pitch: u64, slice_pitch: u64) -> u64 {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return self.origin_offset(row_pitch, slice_pitch);
        }
        self.origin_offset(row_pitch, slice_pitch)
            + (self.depth - 1) * slice_pitch
            + (self.height - 1) * row_pitch
            + self.width
    }
}

/// Cross-thread data of the built-in kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinArgs {
    Copy {
        dst: u64,
        src: u64,
        size: u64,
    },
    Rect {
        dst: u64,
        src: u64,
        width: u64,
        height: u64,
        depth: u64,
        src_row_pitch: u64,
        src_slice_pitch: u64,
        dst_row_pitch: u64,
        dst_slice_pitch: u64,
    },
    Fill {
        dst: u64,
        size: u64,
        /// Pattern byte that lands on `dst`.
        phase: u64,
        pattern_size: u64,
        pattern: [u8; MAX_FILL_PATTERN_SIZE],
    },
}

impl BuiltinArgs {
    pub fn encode(&self) -> Vec<u8> {
        let words: Vec<u64> = match *self {
            BuiltinArgs::Copy { dst, src, size } => vec![dst, src, size],
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
            } => vec![
                dst,
                src,
                width,
                height,
                depth,
                src_row_pitch,
                src_slice_pitch,
                dst_row_pitch,
                dst_slice_pitch,
            ],
            BuiltinArgs::Fill {
                dst,
                size,
                phase,
                pattern_size,
                pattern,
            } => vec![
                dst,
                size,
                phase,
                pattern_size,
                u64::from_le_bytes(pattern[0..8].try_into().unwrap_or_default()),
                u64::from_le_bytes(pattern[8..16].try_into().unwrap_or_default()),
            ],
        };
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn encoded_len(kind: BuiltinKernel) -> usize {
        match kind {
            BuiltinKernel::CopyBufferToBufferSide
            | BuiltinKernel::CopyBufferToBufferMiddle
            | BuiltinKernel::CopyBufferToBufferSideStateless
            | BuiltinKernel::CopyBufferToBufferMiddleStateless => 3 * 8,
            BuiltinKernel::FillBufferImmediate
            | BuiltinKernel::FillBufferImmediateLeftOver
            | BuiltinKernel::FillBufferImmediateStateless
            | BuiltinKernel::FillBufferImmediateLeftOverStateless => 6 * 8,
            _ => 9 * 8,
        }
    }

    pub fn decode(kind: BuiltinKernel, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::encoded_len(kind) {
            return None;
        }
        let w = |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap_or_default());
        Some(match Self::encoded_len(kind) {
            24 => BuiltinArgs::Copy {
                dst: w(0),
                src: w(1),
                size: w(2),
            },
            48 => {
                let mut pattern = [0u8; MAX_FILL_PATTERN_SIZE];
                pattern[0..8].copy_from_slice(&w(4).to_le_bytes());
                pattern[8..16].copy_from_slice(&w(5).to_le_bytes());
                BuiltinArgs::Fill {
                    dst: w(0),
                    size: w(1),
                    phase: w(2),
                    pattern_size: w(3),
                    pattern,
                }
            }
            _ => BuiltinArgs::Rect {
                dst: w(0),
                src: w(1),
                width: w(2),
                height: w(3),
                depth: w(4),
                src_row_pitch: w(5),
                src_slice_pitch: w(6),
                dst_row_pitch: w(7),
                dst_slice_pitch: w(8),
            },
        })
    }
}

/// A linear image: a byte surface with row and slice pitches.
#[derive(Clone, Debug)]
pub struct Image {
    pub alloc: Arc<GraphicsAllocation>,
    pub width: u64,
    pub height: u64,
    pub depth: u64,
    pub bytes_per_pixel: u64,
    pub row_pitch: u64,
    pub slice_pitch: u64,
}

impl Image {
    pub fn new(alloc: Arc<GraphicsAllocation>, width: u64, height: u64, depth: u64, bytes_per_pixel: u64) -> Self {
        let row_pitch = width * bytes_per_pixel;
        Self {
            alloc,
            width,
            height,
            depth,
            bytes_per_pixel,
            row_pitch,
            slice_pitch: row_pitch * height,
        }
    }

    pub fn is_3d(&self) -> bool {
        self.depth > 1
    }

    /// Pixel region converted to a byte region.
    pub fn byte_region(&self, region: &CopyRegion) -> CopyRegion {
        CopyRegion {
            origin_x: region.origin_x * self.bytes_per_pixel,
            width: region.width * self.bytes_per_pixel,
            ..*region
        }
    }

    pub fn full_region(&self) -> CopyRegion {
        CopyRegion {
            origin_x: 0,
            origin_y: 0,
            origin_z: 0,
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_isa_addresses_roundtrip() {
        for kind in BuiltinKernel::ALL {
            assert_eq!(BuiltinKernel::from_isa_address(kind.isa_address()), Some(kind));
        }
        assert_eq!(BuiltinKernel::from_isa_address(0x1000), None);
    }

    #[test]
    fn fill_args_keep_the_pattern() {
        let mut pattern = [0u8; MAX_FILL_PATTERN_SIZE];
        pattern[..3].copy_from_slice(&[1, 2, 3]);
        let args = BuiltinArgs::Fill {
            dst: 0x1000,
            size: 10,
            phase: 2,
            pattern_size: 3,
            pattern,
        };
        let bytes = args.encode();
        assert_eq!(bytes.len(), BuiltinArgs::encoded_len(BuiltinKernel::FillBufferImmediate));
        assert_eq!(BuiltinArgs::decode(BuiltinKernel::FillBufferImmediate, &bytes), Some(args));
    }

    #[test]
    fn region_extent() {
        let r = CopyRegion {
            origin_x: 4,
            origin_y: 1,
            origin_z: 0,
            width: 8,
            height: 2,
            depth: 1,
        };
        assert_eq!(r.origin_offset(16, 64), 20);
        assert_eq!(r.end_offset(16, 64), 20 + 16 + 8);
    }
}
