//! State packets built from stream properties.
//!
//! Every leaf resolves as "required, else committed, else zero" so a partially specified
//! requirement never clobbers state programmed by an earlier batch.

use gpusub_hw::{
    CfeState, FrontEndFlags, FrontEndKind, HwCaps, MediaVfeState, PipelineSelect, StateBaseAddress,
    StateComputeMode, PIPELINE_SELECT_GPGPU,
};

use crate::stream_properties::{
    FrontEndProperties, PipelineSelectProperties, StateBaseAddressProperties, StateComputeModeProperties,
};

/// Hardware threads per compute unit the front end is sized for.
const THREADS_PER_COMPUTE_UNIT: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrontEndCmd {
    Vfe(MediaVfeState),
    Cfe(CfeState),
}

pub(crate) fn pipeline_select(
    required: &PipelineSelectProperties,
    committed: &PipelineSelectProperties,
) -> PipelineSelect {
    PipelineSelect {
        pipeline: required.pipeline.resolve(&committed.pipeline, PIPELINE_SELECT_GPGPU),
        systolic_mode: required.systolic_mode.resolve(&committed.systolic_mode, false),
    }
}

pub(crate) fn state_compute_mode(
    required: &StateComputeModeProperties,
    committed: &StateComputeModeProperties,
) -> StateComputeMode {
    StateComputeMode {
        coherency_required: required
            .is_coherency_required
            .resolve(&committed.is_coherency_required, false),
        large_grf_mode: required.large_grf_mode.resolve(&committed.large_grf_mode, false),
        thread_arbitration_policy: required
            .thread_arbitration_policy
            .resolve(&committed.thread_arbitration_policy, 0),
    }
}

pub(crate) fn state_base_address(
    required: &StateBaseAddressProperties,
    committed: &StateBaseAddressProperties,
) -> StateBaseAddress {
    StateBaseAddress {
        general_state_base: 0,
        surface_state_base: required.surface_state_base.resolve(&committed.surface_state_base, 0),
        dynamic_state_base: required.dynamic_state_base.resolve(&committed.dynamic_state_base, 0),
        indirect_object_base: required
            .indirect_object_base
            .resolve(&committed.indirect_object_base, 0),
        binding_table_pool_base: required
            .binding_table_pool_base
            .resolve(&committed.binding_table_pool_base, 0),
        surface_state_size: required.surface_state_size.resolve(&committed.surface_state_size, 0),
        dynamic_state_size: required.dynamic_state_size.resolve(&committed.dynamic_state_size, 0),
        indirect_object_size: required
            .indirect_object_size
            .resolve(&committed.indirect_object_size, 0),
        binding_table_pool_size: required
            .binding_table_pool_size
            .resolve(&committed.binding_table_pool_size, 0),
        stateless_mocs: required.stateless_mocs.resolve(&committed.stateless_mocs, 0),
    }
}

pub(crate) fn front_end(caps: &HwCaps, required: &FrontEndProperties, committed: &FrontEndProperties) -> FrontEndCmd {
    let scratch = required.scratch_offset.resolve(&committed.scratch_offset, 0);
    let per_thread = required
        .per_thread_scratch_size
        .resolve(&committed.per_thread_scratch_size, 0);
    let maximum_number_of_threads = caps.compute_units_used_for_scratch * THREADS_PER_COMPUTE_UNIT;
    match caps.front_end {
        FrontEndKind::MediaVfe => FrontEndCmd::Vfe(MediaVfeState {
            scratch_space_pointer: scratch,
            per_thread_scratch_space: per_thread,
            per_thread_scratch_space_slot1: 0,
            maximum_number_of_threads,
        }),
        FrontEndKind::Cfe => {
            let mut flags = FrontEndFlags::empty();
            flags.set(
                FrontEndFlags::COMPUTE_DISPATCH_ALL_WALKER,
                required
                    .compute_dispatch_all_walker
                    .resolve(&committed.compute_dispatch_all_walker, false),
            );
            flags.set(
                FrontEndFlags::DISABLE_OVERDISPATCH,
                required
                    .disable_overdispatch
                    .resolve(&committed.disable_overdispatch, false),
            );
            flags.set(
                FrontEndFlags::DISABLE_EU_FUSION,
                required.disable_eu_fusion.resolve(&committed.disable_eu_fusion, false),
            );
            FrontEndCmd::Cfe(CfeState {
                scratch_space_buffer: scratch,
                per_thread_scratch_space: per_thread,
                maximum_number_of_threads,
                flags,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_leaves_fall_back_to_committed_state() {
        let mut committed = FrontEndProperties::default();
        committed.scratch_offset.set_value(0x4000);
        committed.per_thread_scratch_size.set_value(2);
        let mut required = FrontEndProperties::default();
        required.disable_eu_fusion.set_value(true);

        let FrontEndCmd::Cfe(cfe) = front_end(&HwCaps::cfe_multi_tile(), &required, &committed) else {
            panic!("CFE part must program CFE_STATE");
        };
        assert_eq!(cfe.scratch_space_buffer, 0x4000);
        assert_eq!(cfe.per_thread_scratch_space, 2);
        assert_eq!(cfe.flags, FrontEndFlags::DISABLE_EU_FUSION);
    }
}
