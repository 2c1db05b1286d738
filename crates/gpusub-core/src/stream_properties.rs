//! Required vs. committed hardware state.
//!
//! Every leaf is either unset ("inherit whatever is committed") or carries a value. A queue
//! diffs a list's required state against the CSR's committed snapshot, emits one packet per
//! dirty group and commits the whole group afterwards.

use bitflags::bitflags;
use gpusub_hw::HwCaps;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamProperty<T> {
    value: Option<T>,
    dirty: bool,
}

impl<T> Default for StreamProperty<T> {
    fn default() -> Self {
        Self {
            value: None,
            dirty: false,
        }
    }
}

impl<T: Copy + PartialEq> StreamProperty<T> {
    pub fn value(&self) -> Option<T> {
        self.value
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// `None` leaves the property untouched.
    pub fn set(&mut self, value: Option<T>) {
        if let Some(v) = value {
            if self.value != Some(v) {
                self.value = Some(v);
                self.dirty = true;
            }
        }
    }

    pub fn set_value(&mut self, value: T) {
        self.set(Some(value));
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// An unset requirement never differs from what is committed.
    fn differs_from(&self, committed: &Self) -> bool {
        match self.value {
            None => false,
            Some(v) => committed.value != Some(v),
        }
    }

    fn commit_from(&mut self, required: &Self) {
        if required.value.is_some() {
            self.value = required.value;
        }
        self.dirty = false;
    }

    /// Value to program: the requirement if set, else what is committed, else `fallback`.
    pub fn resolve(&self, committed: &Self, fallback: T) -> T {
        self.value.or(committed.value).unwrap_or(fallback)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StateLeaves: u32 {
        const FE_DISABLE_EU_FUSION = 1 << 0;
        const FE_DISABLE_OVERDISPATCH = 1 << 1;
        const FE_COMPUTE_DISPATCH_ALL_WALKER = 1 << 2;
        const FE_SCRATCH_OFFSET = 1 << 3;
        const FE_PER_THREAD_SCRATCH_SIZE = 1 << 4;

        const SCM_COHERENCY_REQUIRED = 1 << 8;
        const SCM_LARGE_GRF_MODE = 1 << 9;
        const SCM_THREAD_ARBITRATION_POLICY = 1 << 10;

        const SBA_SURFACE_STATE_BASE = 1 << 12;
        const SBA_SURFACE_STATE_SIZE = 1 << 13;
        const SBA_DYNAMIC_STATE_BASE = 1 << 14;
        const SBA_DYNAMIC_STATE_SIZE = 1 << 15;
        const SBA_INDIRECT_OBJECT_BASE = 1 << 16;
        const SBA_INDIRECT_OBJECT_SIZE = 1 << 17;
        const SBA_BINDING_TABLE_POOL_BASE = 1 << 18;
        const SBA_BINDING_TABLE_POOL_SIZE = 1 << 19;
        const SBA_STATELESS_MOCS = 1 << 20;

        const PS_PIPELINE = 1 << 24;
        const PS_SYSTOLIC_MODE = 1 << 25;

        const FRONT_END = Self::FE_DISABLE_EU_FUSION.bits()
            | Self::FE_DISABLE_OVERDISPATCH.bits()
            | Self::FE_COMPUTE_DISPATCH_ALL_WALKER.bits()
            | Self::FE_SCRATCH_OFFSET.bits()
            | Self::FE_PER_THREAD_SCRATCH_SIZE.bits();
        const STATE_COMPUTE_MODE = Self::SCM_COHERENCY_REQUIRED.bits()
            | Self::SCM_LARGE_GRF_MODE.bits()
            | Self::SCM_THREAD_ARBITRATION_POLICY.bits();
        const STATE_BASE_ADDRESS = Self::SBA_SURFACE_STATE_BASE.bits()
            | Self::SBA_SURFACE_STATE_SIZE.bits()
            | Self::SBA_DYNAMIC_STATE_BASE.bits()
            | Self::SBA_DYNAMIC_STATE_SIZE.bits()
            | Self::SBA_INDIRECT_OBJECT_BASE.bits()
            | Self::SBA_INDIRECT_OBJECT_SIZE.bits()
            | Self::SBA_BINDING_TABLE_POOL_BASE.bits()
            | Self::SBA_BINDING_TABLE_POOL_SIZE.bits()
            | Self::SBA_STATELESS_MOCS.bits();
        const PIPELINE_SELECT = Self::PS_PIPELINE.bits() | Self::PS_SYSTOLIC_MODE.bits();
    }
}

impl StateLeaves {
    /// Expand to every group touched by at least one leaf.
    pub fn groups(self) -> StateLeaves {
        let mut out = StateLeaves::empty();
        for group in [
            StateLeaves::FRONT_END,
            StateLeaves::STATE_COMPUTE_MODE,
            StateLeaves::STATE_BASE_ADDRESS,
            StateLeaves::PIPELINE_SELECT,
        ] {
            if self.intersects(group) {
                out |= group;
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrontEndProperties {
    pub disable_eu_fusion: StreamProperty<bool>,
    pub disable_overdispatch: StreamProperty<bool>,
    pub compute_dispatch_all_walker: StreamProperty<bool>,
    pub scratch_offset: StreamProperty<u64>,
    /// Programmed bucket index, `log2(size / granularity)`.
    pub per_thread_scratch_size: StreamProperty<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateComputeModeProperties {
    pub is_coherency_required: StreamProperty<bool>,
    pub large_grf_mode: StreamProperty<bool>,
    pub thread_arbitration_policy: StreamProperty<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateBaseAddressProperties {
    pub surface_state_base: StreamProperty<u64>,
    pub surface_state_size: StreamProperty<u32>,
    pub dynamic_state_base: StreamProperty<u64>,
    pub dynamic_state_size: StreamProperty<u32>,
    pub indirect_object_base: StreamProperty<u64>,
    pub indirect_object_size: StreamProperty<u32>,
    pub binding_table_pool_base: StreamProperty<u64>,
    pub binding_table_pool_size: StreamProperty<u32>,
    pub stateless_mocs: StreamProperty<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineSelectProperties {
    pub pipeline: StreamProperty<u32>,
    pub systolic_mode: StreamProperty<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamProperties {
    pub front_end: FrontEndProperties,
    pub state_compute_mode: StateComputeModeProperties,
    pub state_base_address: StateBaseAddressProperties,
    pub pipeline_select: PipelineSelectProperties,
}

macro_rules! for_each_leaf {
    ($m:ident, $a:expr, $b:expr) => {{
        $m!($a.front_end.disable_eu_fusion, $b.front_end.disable_eu_fusion, FE_DISABLE_EU_FUSION);
        $m!($a.front_end.disable_overdispatch, $b.front_end.disable_overdispatch, FE_DISABLE_OVERDISPATCH);
        $m!(
            $a.front_end.compute_dispatch_all_walker,
            $b.front_end.compute_dispatch_all_walker,
            FE_COMPUTE_DISPATCH_ALL_WALKER
        );
        $m!($a.front_end.scratch_offset, $b.front_end.scratch_offset, FE_SCRATCH_OFFSET);
        $m!(
            $a.front_end.per_thread_scratch_size,
            $b.front_end.per_thread_scratch_size,
            FE_PER_THREAD_SCRATCH_SIZE
        );
        $m!(
            $a.state_compute_mode.is_coherency_required,
            $b.state_compute_mode.is_coherency_required,
            SCM_COHERENCY_REQUIRED
        );
        $m!($a.state_compute_mode.large_grf_mode, $b.state_compute_mode.large_grf_mode, SCM_LARGE_GRF_MODE);
        $m!(
            $a.state_compute_mode.thread_arbitration_policy,
            $b.state_compute_mode.thread_arbitration_policy,
            SCM_THREAD_ARBITRATION_POLICY
        );
        $m!(
            $a.state_base_address.surface_state_base,
            $b.state_base_address.surface_state_base,
            SBA_SURFACE_STATE_BASE
        );
        $m!(
            $a.state_base_address.surface_state_size,
            $b.state_base_address.surface_state_size,
            SBA_SURFACE_STATE_SIZE
        );
        $m!(
            $a.state_base_address.dynamic_state_base,
            $b.state_base_address.dynamic_state_base,
            SBA_DYNAMIC_STATE_BASE
        );
        $m!(
            $a.state_base_address.dynamic_state_size,
            $b.state_base_address.dynamic_state_size,
            SBA_DYNAMIC_STATE_SIZE
        );
        $m!(
            $a.state_base_address.indirect_object_base,
            $b.state_base_address.indirect_object_base,
            SBA_INDIRECT_OBJECT_BASE
        );
        $m!(
            $a.state_base_address.indirect_object_size,
            $b.state_base_address.indirect_object_size,
            SBA_INDIRECT_OBJECT_SIZE
        );
        $m!(
            $a.state_base_address.binding_table_pool_base,
            $b.state_base_address.binding_table_pool_base,
            SBA_BINDING_TABLE_POOL_BASE
        );
        $m!(
            $a.state_base_address.binding_table_pool_size,
            $b.state_base_address.binding_table_pool_size,
            SBA_BINDING_TABLE_POOL_SIZE
        );
        $m!(
            $a.state_base_address.stateless_mocs,
            $b.state_base_address.stateless_mocs,
            SBA_STATELESS_MOCS
        );
        $m!($a.pipeline_select.pipeline, $b.pipeline_select.pipeline, PS_PIPELINE);
        $m!($a.pipeline_select.systolic_mode, $b.pipeline_select.systolic_mode, PS_SYSTOLIC_MODE);
    }};
}

impl StreamProperties {
    /// Leaves of `required` that differ from `self` (the committed snapshot).
    pub fn compute_delta(&self, required: &StreamProperties, caps: &HwCaps) -> StateLeaves {
        let mut delta = StateLeaves::empty();
        macro_rules! diff {
            ($req:expr, $committed:expr, $leaf:ident) => {
                if $req.differs_from(&$committed) {
                    delta |= StateLeaves::$leaf;
                }
            };
        }
        for_each_leaf!(diff, required, self);

        if !caps.per_draw_coherency_tracking {
            delta.remove(StateLeaves::SCM_COHERENCY_REQUIRED);
        }
        delta
    }

    /// Copy every leaf of the given groups from `required` and clear their dirty flags.
    pub fn commit(&mut self, required: &StreamProperties, groups: StateLeaves) {
        let groups = groups.groups();
        macro_rules! commit {
            ($committed:expr, $req:expr, $leaf:ident) => {
                if groups.contains(StateLeaves::$leaf) {
                    $committed.commit_from(&$req);
                }
            };
        }
        for_each_leaf!(commit, self, required);
    }

    /// Leaves that carry a value.
    pub fn set_leaves(&self) -> StateLeaves {
        let mut set = StateLeaves::empty();
        macro_rules! is_set {
            ($a:expr, $_b:expr, $leaf:ident) => {
                if $a.is_set() {
                    set |= StateLeaves::$leaf;
                }
            };
        }
        for_each_leaf!(is_set, self, self);
        set
    }

    /// Overlay every set leaf of `other` onto `self`.
    pub fn merge(&mut self, other: &StreamProperties) {
        macro_rules! merge {
            ($a:expr, $b:expr, $_leaf:ident) => {
                $a.set($b.value());
            };
        }
        for_each_leaf!(merge, self, other);
    }

    pub fn clear_dirty(&mut self) {
        macro_rules! clear {
            ($a:expr, $_b:expr, $_leaf:ident) => {
                $a.clear_dirty();
            };
        }
        for_each_leaf!(clear, self, self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unset_leaves_never_dirty() {
        let mut committed = StreamProperties::default();
        committed.state_compute_mode.large_grf_mode.set_value(true);
        let required = StreamProperties::default();
        assert_eq!(committed.compute_delta(&required, &HwCaps::cfe_multi_tile()), StateLeaves::empty());
    }

    #[test]
    fn commit_is_per_group_and_clears_dirty() {
        let mut required = StreamProperties::default();
        required.front_end.disable_eu_fusion.set_value(true);
        required.state_compute_mode.large_grf_mode.set_value(true);
        assert!(required.front_end.disable_eu_fusion.is_dirty());

        let mut committed = StreamProperties::default();
        let caps = HwCaps::cfe_multi_tile();
        let delta = committed.compute_delta(&required, &caps);
        assert_eq!(delta, StateLeaves::FE_DISABLE_EU_FUSION | StateLeaves::SCM_LARGE_GRF_MODE);

        committed.commit(&required, StateLeaves::FE_DISABLE_EU_FUSION);
        assert_eq!(committed.front_end.disable_eu_fusion.value(), Some(true));
        assert!(!committed.front_end.disable_eu_fusion.is_dirty());
        assert_eq!(committed.state_compute_mode.large_grf_mode.value(), None);
        assert_eq!(committed.compute_delta(&required, &caps), StateLeaves::SCM_LARGE_GRF_MODE);
    }

    #[test]
    fn coherency_alone_is_ignored_without_per_draw_tracking() {
        let mut required = StreamProperties::default();
        required.state_compute_mode.is_coherency_required.set_value(true);
        let committed = StreamProperties::default();

        assert_eq!(
            committed.compute_delta(&required, &HwCaps::vfe_single_tile()),
            StateLeaves::empty()
        );
        assert_eq!(
            committed.compute_delta(&required, &HwCaps::cfe_multi_tile()),
            StateLeaves::SCM_COHERENCY_REQUIRED
        );
    }

    #[test]
    fn groups_expand_single_leaves() {
        assert_eq!(
            (StateLeaves::SBA_STATELESS_MOCS | StateLeaves::PS_PIPELINE).groups(),
            StateLeaves::STATE_BASE_ADDRESS | StateLeaves::PIPELINE_SELECT
        );
    }
}
