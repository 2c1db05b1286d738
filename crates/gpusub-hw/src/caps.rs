//! Runtime hardware capability descriptor.
//!
//! Populated once when a device is created and passed by reference to every component that
//! needs per-generation behaviour.

use serde::Deserialize;

/// MMIO register holding the engine's preemption mode.
pub const PREEMPTION_CONTROL_REGISTER: u32 = 0x2580;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    Disabled,
    MidBatch,
    #[default]
    ThreadGroup,
    MidThread,
}

impl PreemptionMode {
    /// Value loaded into [`PREEMPTION_CONTROL_REGISTER`].
    pub fn register_value(self) -> u32 {
        match self {
            PreemptionMode::Disabled => 0x0004_0000,
            PreemptionMode::MidBatch => 0x0006_0004,
            PreemptionMode::ThreadGroup => 0x0006_0002,
            PreemptionMode::MidThread => 0x0006_0000,
        }
    }

    pub fn from_register_value(v: u32) -> Option<Self> {
        [
            PreemptionMode::Disabled,
            PreemptionMode::MidBatch,
            PreemptionMode::ThreadGroup,
            PreemptionMode::MidThread,
        ]
        .into_iter()
        .find(|m| m.register_value() == v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontEndKind {
    /// MEDIA_VFE_STATE; scratch programmed as a GPU address.
    MediaVfe,
    /// CFE_STATE; scratch programmed as a surface-state offset (or an address when heapless).
    Cfe,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwCaps {
    pub front_end: FrontEndKind,
    /// Global stateless addressing; no per-list bindful heaps.
    pub heapless: bool,
    pub per_draw_coherency_tracking: bool,
    pub mid_thread_preemption: bool,
    pub compute_units_used_for_scratch: u32,
    pub scratch_granularity: u32,
    pub private_scratch_supported: bool,
    pub surface_state_size: u32,
    pub cache_line_size: u32,
    pub tile_count: u32,
    /// Distance between per-partition post-sync slots.
    pub post_sync_stride: u32,
    pub max_blit_width: u32,
    pub max_blit_height: u32,
    /// Largest byte range a single fill dispatch may address.
    pub max_fill_dispatch_bytes: u64,
    pub default_preemption_mode: PreemptionMode,
    /// Immediate lists record into CSR-owned heaps.
    pub shared_immediate_heaps: bool,
    pub sip_address: u64,
}

impl HwCaps {
    pub fn vfe_single_tile() -> Self {
        Self {
            front_end: FrontEndKind::MediaVfe,
            heapless: false,
            per_draw_coherency_tracking: false,
            mid_thread_preemption: true,
            compute_units_used_for_scratch: 64,
            scratch_granularity: 1024,
            private_scratch_supported: false,
            surface_state_size: 64,
            cache_line_size: 64,
            tile_count: 1,
            post_sync_stride: 16,
            max_blit_width: 0x4000,
            max_blit_height: 0x4000,
            max_fill_dispatch_bytes: 1 << 32,
            default_preemption_mode: PreemptionMode::MidThread,
            shared_immediate_heaps: true,
            sip_address: 0x00F0_0000,
        }
    }

    pub fn cfe_multi_tile() -> Self {
        Self {
            front_end: FrontEndKind::Cfe,
            per_draw_coherency_tracking: true,
            compute_units_used_for_scratch: 128,
            private_scratch_supported: true,
            tile_count: 2,
            post_sync_stride: 16,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            ..Self::vfe_single_tile()
        }
    }

    pub fn heapless() -> Self {
        Self {
            heapless: true,
            tile_count: 1,
            shared_immediate_heaps: false,
            ..Self::cfe_multi_tile()
        }
    }

    pub fn supports_inline_data_scratch_patch(&self) -> bool {
        self.heapless
    }

    pub fn supports_implicit_args_scratch_patch(&self) -> bool {
        self.heapless
    }

    pub fn uses_surface_state_scratch(&self) -> bool {
        self.front_end == FrontEndKind::Cfe && !self.heapless
    }
}

impl Default for HwCaps {
    fn default() -> Self {
        Self::vfe_single_tile()
    }
}
