//! Scratch-space sizing and allocation.
//!
//! Per-thread sizes are bucketed to power-of-two multiples of the scratch granularity; the
//! front end is programmed with the bucket index. Allocations only ever grow. A replaced
//! allocation is parked with the last task count that may still reference it.

use std::sync::Arc;

use gpusub_hw::{FrontEndKind, HwCaps};
use gpusub_mem::{
    AllocationProperties, AllocationType, ContextId, GraphicsAllocation, MemoryManager, MemoryPool,
};
use tracing::debug;

use crate::error::{Result, SubmitError};
use crate::heap::{HeapSet, SCRATCH_SURFACE_SLOTS};

/// State that must be reprogrammed because scratch changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchUpdate {
    pub sba_dirty: bool,
    pub fe_dirty: bool,
}

impl ScratchUpdate {
    pub fn any(self) -> bool {
        self.sba_dirty || self.fe_dirty
    }
}

impl std::ops::BitOr for ScratchUpdate {
    type Output = ScratchUpdate;

    fn bitor(self, rhs: Self) -> Self {
        ScratchUpdate {
            sba_dirty: self.sba_dirty || rhs.sba_dirty,
            fe_dirty: self.fe_dirty || rhs.fe_dirty,
        }
    }
}

/// Round `size` up to its scratch bucket.
pub fn scratch_bucket_size(size: u32, granularity: u32) -> u32 {
    size.max(granularity).next_power_of_two()
}

/// Hardware field for a bucketed per-thread size: `log2(size / granularity)`.
pub fn scratch_size_field(bucket: u32, granularity: u32) -> u32 {
    (bucket / granularity).trailing_zeros()
}

const SCRATCH_SURFACE_TAG: u32 = 0x5C7A_0001;

#[derive(Debug)]
pub struct ScratchSpaceController {
    caps: HwCaps,
    per_thread_slot0: u32,
    per_thread_slot1: u32,
    scratch: Option<Arc<GraphicsAllocation>>,
    private_scratch: Option<Arc<GraphicsAllocation>>,
    slot_index: u64,
}

impl ScratchSpaceController {
    pub fn new(caps: &HwCaps) -> Self {
        Self {
            caps: caps.clone(),
            per_thread_slot0: 0,
            per_thread_slot1: 0,
            scratch: None,
            private_scratch: None,
            slot_index: 0,
        }
    }

    pub fn per_thread_scratch_size(&self) -> u32 {
        self.per_thread_slot0
    }

    pub fn per_thread_private_scratch_size(&self) -> u32 {
        self.per_thread_slot1
    }

    /// Programmed bucket index for slot 0.
    pub fn per_thread_scratch_field(&self) -> u32 {
        if self.per_thread_slot0 == 0 {
            0
        } else {
            scratch_size_field(self.per_thread_slot0, self.caps.scratch_granularity)
        }
    }

    pub fn scratch_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.scratch.as_ref()
    }

    pub fn private_scratch_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.private_scratch.as_ref()
    }

    pub fn slot_index(&self) -> u64 {
        self.slot_index
    }

    /// Grow scratch to cover the requested per-thread sizes.
    ///
    /// `last_task_count` is the newest submission that may still reference the current
    /// allocations.
    pub fn set_required_scratch_space(
        &mut self,
        mem: &MemoryManager,
        required_slot0: u32,
        required_slot1: u32,
        last_task_count: u64,
        ctx: ContextId,
    ) -> Result<ScratchUpdate> {
        let (required_slot0, required_slot1) = if self.caps.private_scratch_supported {
            (required_slot0, required_slot1)
        } else {
            (required_slot0.max(required_slot1), 0)
        };
        let granularity = self.caps.scratch_granularity;

        // Both slots are allocated before either is installed, so a failure leaves the
        // controller exactly as it was.
        let slot0 = if required_slot0 > self.per_thread_slot0 {
            let bucket = scratch_bucket_size(required_slot0, granularity);
            Some((bucket, self.allocate(mem, bucket, AllocationType::Scratch)?))
        } else {
            None
        };
        let slot1 = if required_slot1 > self.per_thread_slot1 {
            let bucket = scratch_bucket_size(required_slot1, granularity);
            match self.allocate(mem, bucket, AllocationType::PrivateScratch) {
                Ok(alloc) => Some((bucket, alloc)),
                Err(err) => {
                    if let Some((_, alloc)) = slot0 {
                        mem.free(&alloc);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };
        if slot0.is_none() && slot1.is_none() {
            return Ok(ScratchUpdate::default());
        }

        if let Some((bucket, alloc)) = slot0 {
            debug!(
                per_thread = bucket,
                size = alloc.size(),
                gpu_address = alloc.gpu_address(),
                "scratch reallocated"
            );
            if let Some(old) = self.scratch.replace(alloc) {
                mem.store_for_reuse(old, ctx, last_task_count);
            }
            self.per_thread_slot0 = bucket;
        }
        if let Some((bucket, alloc)) = slot1 {
            debug!(per_thread = bucket, size = alloc.size(), "private scratch reallocated");
            if let Some(old) = self.private_scratch.replace(alloc) {
                mem.store_for_reuse(old, ctx, last_task_count);
            }
            self.per_thread_slot1 = bucket;
        }
        if self.caps.uses_surface_state_scratch() {
            self.slot_index = self.slot_index % (SCRATCH_SURFACE_SLOTS - 1) + 1;
        }
        Ok(ScratchUpdate {
            sba_dirty: true,
            fe_dirty: true,
        })
    }

    fn allocate(
        &self,
        mem: &MemoryManager,
        per_thread: u32,
        alloc_type: AllocationType,
    ) -> Result<Arc<GraphicsAllocation>> {
        let size = u64::from(per_thread) * u64::from(self.caps.compute_units_used_for_scratch);
        mem.allocate_graphics_memory_with_properties(&AllocationProperties::new(
            size,
            alloc_type,
            MemoryPool::Local,
        ))
        .ok_or(SubmitError::OutOfDeviceMemory)
    }

    /// Value deferred patches and the front end carry for scratch.
    ///
    /// Changes exactly when scratch is reallocated.
    pub fn scratch_patch_address(&self) -> u64 {
        let Some(scratch) = &self.scratch else {
            return 0;
        };
        match self.caps.front_end {
            FrontEndKind::Cfe if !self.caps.heapless => {
                self.slot_index * 2 * u64::from(self.caps.surface_state_size)
            }
            _ => scratch.gpu_address(),
        }
    }

    /// Write the scratch surface states into every surface chunk of `heaps` at the current slot.
    ///
    /// Retired chunks get them too, since dispatches recorded against them still point their
    /// base address there. Only heapful CFE parts address scratch through surface state;
    /// elsewhere this is a no-op.
    pub fn program_heaps(&self, heaps: &mut HeapSet) -> Result<ScratchUpdate> {
        if !self.caps.uses_surface_state_scratch() {
            return Ok(ScratchUpdate::default());
        }
        let Some(scratch) = &self.scratch else {
            return Ok(ScratchUpdate::default());
        };

        let ss_size = u64::from(self.caps.surface_state_size);
        let slot_offset = self.slot_index * 2 * ss_size;
        let mut surfaces = vec![(slot_offset, surface_state(scratch, ss_size))];
        if let Some(private) = &self.private_scratch {
            surfaces.push((slot_offset + ss_size, surface_state(private, ss_size)));
        }
        let written = heaps.program_scratch_surfaces((scratch.id(), self.slot_index), &surfaces)?;
        Ok(ScratchUpdate {
            sba_dirty: written,
            fe_dirty: false,
        })
    }
}

fn surface_state(alloc: &GraphicsAllocation, ss_size: u64) -> Vec<u8> {
    let mut state = vec![0u8; ss_size as usize];
    state[0..8].copy_from_slice(&alloc.gpu_address().to_le_bytes());
    state[8..16].copy_from_slice(&alloc.size().to_le_bytes());
    state[16..20].copy_from_slice(&SCRATCH_SURFACE_TAG.to_le_bytes());
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_and_field() {
        assert_eq!(scratch_bucket_size(1, 1024), 1024);
        assert_eq!(scratch_bucket_size(1024, 1024), 1024);
        assert_eq!(scratch_bucket_size(1025, 1024), 2048);
        assert_eq!(scratch_bucket_size(3000, 1024), 4096);
        assert_eq!(scratch_size_field(1024, 1024), 0);
        assert_eq!(scratch_size_field(2048, 1024), 1);
        assert_eq!(scratch_size_field(8192, 1024), 3);
    }

    #[test]
    fn grows_but_never_shrinks() {
        let caps = HwCaps::vfe_single_tile();
        let mem = MemoryManager::new();
        let mut ctrl = ScratchSpaceController::new(&caps);

        let up = ctrl.set_required_scratch_space(&mem, 1024, 0, 0, 0).unwrap();
        assert_eq!(up, ScratchUpdate { sba_dirty: true, fe_dirty: true });
        let first = ctrl.scratch_patch_address();
        assert_eq!(
            ctrl.scratch_allocation().unwrap().size(),
            1024 * u64::from(caps.compute_units_used_for_scratch)
        );

        let up = ctrl.set_required_scratch_space(&mem, 512, 0, 1, 0).unwrap();
        assert_eq!(up, ScratchUpdate::default());
        assert_eq!(ctrl.scratch_patch_address(), first);
        assert_eq!(ctrl.per_thread_scratch_size(), 1024);

        let up = ctrl.set_required_scratch_space(&mem, 2048, 0, 1, 0).unwrap();
        assert!(up.fe_dirty && up.sba_dirty);
        assert_ne!(ctrl.scratch_patch_address(), first);
        assert_eq!(ctrl.per_thread_scratch_field(), 1);
        assert_eq!(mem.reusable_count(), 1);
    }

    #[test]
    fn cfe_slot_advances_on_each_reallocation() {
        let caps = HwCaps::cfe_multi_tile();
        let mem = MemoryManager::new();
        let mut ctrl = ScratchSpaceController::new(&caps);
        assert_eq!(ctrl.scratch_patch_address(), 0);

        ctrl.set_required_scratch_space(&mem, 1024, 0, 0, 0).unwrap();
        assert_eq!(ctrl.scratch_patch_address(), 2 * 64);
        ctrl.set_required_scratch_space(&mem, 1024, 4096, 0, 0).unwrap();
        assert_eq!(ctrl.scratch_patch_address(), 2 * 2 * 64);
        assert_eq!(ctrl.per_thread_private_scratch_size(), 4096);
    }

    #[test]
    fn allocation_failure_is_out_of_device_memory() {
        let caps = HwCaps::vfe_single_tile();
        let mem = MemoryManager::new();
        mem.inject_allocation_failures(1);
        let mut ctrl = ScratchSpaceController::new(&caps);
        assert_eq!(
            ctrl.set_required_scratch_space(&mem, 1024, 0, 0, 0),
            Err(SubmitError::OutOfDeviceMemory)
        );
        assert!(ctrl.scratch_allocation().is_none());
    }

    #[test]
    fn heaps_are_programmed_once_per_scratch_slot() {
        let caps = HwCaps::cfe_multi_tile();
        let mem = Arc::new(MemoryManager::new());
        let mut heaps = HeapSet::new(mem.clone(), 0x4000, caps.surface_state_size).unwrap();
        let mut ctrl = ScratchSpaceController::new(&caps);
        ctrl.set_required_scratch_space(&mem, 1024, 0, 0, 0).unwrap();

        assert!(ctrl.program_heaps(&mut heaps).unwrap().sba_dirty);
        assert_eq!(ctrl.program_heaps(&mut heaps).unwrap(), ScratchUpdate::default());

        let heap = heaps.surface_state_heap();
        let written = heap.read_u64(ctrl.scratch_patch_address()).unwrap();
        assert_eq!(written, ctrl.scratch_allocation().unwrap().gpu_address());
    }

    #[test]
    fn failed_private_allocation_leaves_both_slots_untouched() {
        let caps = HwCaps::cfe_multi_tile();
        let mem = MemoryManager::new();
        let mut ctrl = ScratchSpaceController::new(&caps);
        ctrl.set_required_scratch_space(&mem, 1024, 1024, 0, 0).unwrap();
        let scratch = ctrl.scratch_allocation().unwrap().id();
        let private = ctrl.private_scratch_allocation().unwrap().id();
        let address = ctrl.scratch_patch_address();
        let live = mem.allocation_count();

        // The slot-0 allocation succeeds, the slot-1 allocation is refused.
        mem.inject_allocation_failures_after(1, 1);
        assert_eq!(
            ctrl.set_required_scratch_space(&mem, 4096, 4096, 1, 0),
            Err(SubmitError::OutOfDeviceMemory)
        );
        assert_eq!(ctrl.per_thread_scratch_size(), 1024);
        assert_eq!(ctrl.per_thread_private_scratch_size(), 1024);
        assert_eq!(ctrl.scratch_allocation().unwrap().id(), scratch);
        assert_eq!(ctrl.private_scratch_allocation().unwrap().id(), private);
        assert_eq!(ctrl.scratch_patch_address(), address);
        assert_eq!(mem.allocation_count(), live);
        assert_eq!(mem.reusable_count(), 0);

        ctrl.set_required_scratch_space(&mem, 4096, 4096, 1, 0).unwrap();
        assert_ne!(ctrl.scratch_patch_address(), address);
        assert_eq!(mem.reusable_count(), 2);
    }
}
