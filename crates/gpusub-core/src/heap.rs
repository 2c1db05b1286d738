use std::sync::{Arc, Mutex, MutexGuard};

use gpusub_mem::{
    align_up, AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool,
};
use tracing::debug;

use crate::error::{Result, SubmitError};
use crate::stream_properties::StateBaseAddressProperties;

/// Surface-state slots reserved at the start of every surface heap for scratch surfaces.
pub const SCRATCH_SURFACE_SLOTS: u64 = 16;

pub const STATELESS_MOCS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapKind {
    SurfaceState,
    DynamicState,
    IndirectObject,
}

impl HeapKind {
    const ALL: [HeapKind; 3] = [
        HeapKind::SurfaceState,
        HeapKind::DynamicState,
        HeapKind::IndirectObject,
    ];

    fn index(self) -> usize {
        match self {
            HeapKind::SurfaceState => 0,
            HeapKind::DynamicState => 1,
            HeapKind::IndirectObject => 2,
        }
    }
}

/// Scratch allocation id and surface slot whose states sit in a surface chunk's reserved area.
pub type ScratchSurfaceKey = (u64, u64);

/// One chunk of a heap; `used` only moves forward until the owning list is reset.
#[derive(Debug)]
pub struct IndirectHeap {
    alloc: Arc<GraphicsAllocation>,
    used: u64,
    reserved: u64,
    scratch_surfaces: Option<ScratchSurfaceKey>,
}

impl IndirectHeap {
    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.alloc
    }

    pub fn gpu_base(&self) -> u64 {
        self.alloc.gpu_address()
    }

    pub fn size(&self) -> u64 {
        self.alloc.size()
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.size().saturating_sub(self.used)
    }
}

/// Space handed out by [`HeapSet::allocate`].
#[derive(Clone, Debug)]
pub struct HeapSpace {
    pub alloc: Arc<GraphicsAllocation>,
    /// Offset from the heap base.
    pub offset: u64,
    /// The heap moved to a new chunk to satisfy the request.
    pub grew: bool,
}

impl HeapSpace {
    pub fn gpu_address(&self) -> u64 {
        self.alloc.gpu_address() + self.offset
    }
}

#[derive(Debug)]
pub struct HeapSet {
    mem: Arc<MemoryManager>,
    chunk_size: u64,
    surface_reserved: u64,
    heaps: [IndirectHeap; 3],
    retired: Vec<RetiredChunk>,
}

/// A chunk the heap moved away from, still referenced by recorded commands.
#[derive(Debug)]
struct RetiredChunk {
    kind: HeapKind,
    chunk: IndirectHeap,
}

fn allocate_chunk(mem: &MemoryManager, size: u64) -> Result<Arc<GraphicsAllocation>> {
    mem.allocate_graphics_memory_with_properties(&AllocationProperties::new(
        size,
        AllocationType::InternalHeap,
        MemoryPool::Local,
    ))
    .ok_or(SubmitError::OutOfDeviceMemory)
}

impl HeapSet {
    pub fn new(mem: Arc<MemoryManager>, chunk_size: u64, surface_state_size: u32) -> Result<Self> {
        let surface_reserved = SCRATCH_SURFACE_SLOTS * 2 * u64::from(surface_state_size);
        let chunk_size = chunk_size.max(surface_reserved * 2);
        let make = |reserved: u64| -> Result<IndirectHeap> {
            Ok(IndirectHeap {
                alloc: allocate_chunk(&mem, chunk_size)?,
                used: reserved,
                reserved,
                scratch_surfaces: None,
            })
        };
        let heaps = [make(surface_reserved)?, make(0)?, make(0)?];
        Ok(Self {
            mem,
            chunk_size,
            surface_reserved,
            heaps,
            retired: Vec::new(),
        })
    }

    pub fn shared(self) -> SharedHeaps {
        Arc::new(Mutex::new(self))
    }

    pub fn heap(&self, kind: HeapKind) -> &IndirectHeap {
        &self.heaps[kind.index()]
    }

    pub fn used(&self, kind: HeapKind) -> u64 {
        self.heap(kind).used
    }

    /// Carve `size` bytes out of `kind`, moving to a fresh chunk when the current one is full.
    pub fn allocate(&mut self, kind: HeapKind, size: u64, alignment: u64) -> Result<HeapSpace> {
        let heap = &self.heaps[kind.index()];
        let offset = align_up(heap.used, alignment.max(1));
        if offset + size <= heap.size() {
            let heap = &mut self.heaps[kind.index()];
            heap.used = offset + size;
            return Ok(HeapSpace {
                alloc: heap.alloc.clone(),
                offset,
                grew: false,
            });
        }

        let reserved = heap.reserved;
        let chunk = self.chunk_size.max(align_up(reserved + size, 4096));
        let alloc = allocate_chunk(&self.mem, chunk)?;
        debug!(heap = ?kind, size = chunk, gpu_address = alloc.gpu_address(), "heap moved to new chunk");
        let old = std::mem::replace(
            &mut self.heaps[kind.index()],
            IndirectHeap {
                alloc,
                used: reserved,
                reserved,
                scratch_surfaces: None,
            },
        );
        self.retired.push(RetiredChunk { kind, chunk: old });

        let heap = &mut self.heaps[kind.index()];
        let offset = align_up(heap.used, alignment.max(1));
        heap.used = offset + size;
        Ok(HeapSpace {
            alloc: heap.alloc.clone(),
            offset,
            grew: true,
        })
    }

    /// Current chunks followed by retired ones still referenced by recorded commands.
    pub fn allocations(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        self.heaps
            .iter()
            .map(|h| &h.alloc)
            .chain(self.retired.iter().map(|r| &r.chunk.alloc))
    }

    pub fn surface_state_heap(&self) -> &Arc<GraphicsAllocation> {
        &self.heaps[HeapKind::SurfaceState.index()].alloc
    }

    /// Rewind every heap and hand back retired chunks.
    pub fn reset(&mut self) -> Vec<Arc<GraphicsAllocation>> {
        for kind in HeapKind::ALL {
            let heap = &mut self.heaps[kind.index()];
            heap.used = heap.reserved;
        }
        std::mem::take(&mut self.retired)
            .into_iter()
            .map(|r| r.chunk.alloc)
            .collect()
    }

    /// Write `surfaces` (offset, bytes) into the reserved area of every surface-state chunk,
    /// current and retired, that does not already hold the states for `key`.
    ///
    /// Returns whether any chunk was written.
    pub fn program_scratch_surfaces(
        &mut self,
        key: ScratchSurfaceKey,
        surfaces: &[(u64, Vec<u8>)],
    ) -> Result<bool> {
        let current = std::iter::once(&mut self.heaps[HeapKind::SurfaceState.index()]);
        let retired = self
            .retired
            .iter_mut()
            .filter(|r| r.kind == HeapKind::SurfaceState)
            .map(|r| &mut r.chunk);
        let mut written = false;
        for chunk in current.chain(retired) {
            if chunk.scratch_surfaces == Some(key) {
                continue;
            }
            for (offset, state) in surfaces {
                chunk.alloc.write(*offset, state)?;
            }
            chunk.scratch_surfaces = Some(key);
            written = true;
        }
        Ok(written)
    }

    /// Surface-state chunks, current first, then retired ones in retirement order.
    pub fn surface_state_chunks(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        std::iter::once(self.surface_state_heap()).chain(
            self.retired
                .iter()
                .filter(|r| r.kind == HeapKind::SurfaceState)
                .map(|r| &r.chunk.alloc),
        )
    }

    pub fn surface_reserved(&self) -> u64 {
        self.surface_reserved
    }

    /// Fill STATE_BASE_ADDRESS leaves from the current chunks.
    pub fn program_state_base_address(&self, sba: &mut StateBaseAddressProperties) -> Result<()> {
        let ss = self.heap(HeapKind::SurfaceState);
        let ds = self.heap(HeapKind::DynamicState);
        let io = self.heap(HeapKind::IndirectObject);
        let ss_size = heap_size_field(ss)?;
        sba.surface_state_base.set_value(ss.gpu_base());
        sba.surface_state_size.set_value(ss_size);
        sba.binding_table_pool_base.set_value(ss.gpu_base());
        sba.binding_table_pool_size.set_value(ss_size);
        sba.dynamic_state_base.set_value(ds.gpu_base());
        sba.dynamic_state_size.set_value(heap_size_field(ds)?);
        sba.indirect_object_base.set_value(io.gpu_base());
        sba.indirect_object_size.set_value(heap_size_field(io)?);
        sba.stateless_mocs.set_value(STATELESS_MOCS);
        Ok(())
    }
}

fn heap_size_field(heap: &IndirectHeap) -> Result<u32> {
    size_field(heap.size())
}

fn size_field(size: u64) -> Result<u32> {
    u32::try_from(size)
        .map_err(|_| SubmitError::InvalidArgument("heap chunk does not fit the base-address size field"))
}

/// Heaps recorded into by more than one list (immediate lists on one CSR).
pub type SharedHeaps = Arc<Mutex<HeapSet>>;

pub(crate) fn lock_heaps(heaps: &SharedHeaps) -> MutexGuard<'_, HeapSet> {
    match heaps.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_heap_keeps_scratch_slots_reserved() {
        let mem = Arc::new(MemoryManager::new());
        let heaps = HeapSet::new(mem, 0x4000, 64).unwrap();
        assert_eq!(heaps.used(HeapKind::SurfaceState), SCRATCH_SURFACE_SLOTS * 2 * 64);
        assert_eq!(heaps.used(HeapKind::DynamicState), 0);
    }

    #[test]
    fn growth_moves_to_new_chunk_and_retires_old_one() {
        let mem = Arc::new(MemoryManager::new());
        let mut heaps = HeapSet::new(mem, 0x1000, 64).unwrap();
        let first = heaps.allocate(HeapKind::DynamicState, 0x800, 64).unwrap();
        assert!(!first.grew);
        let second = heaps.allocate(HeapKind::DynamicState, 0x1000, 64).unwrap();
        assert!(second.grew);
        assert_ne!(first.alloc.id(), second.alloc.id());
        assert_eq!(heaps.allocations().count(), 4);

        let retired = heaps.reset();
        assert_eq!(retired.len(), 1);
        assert_eq!(heaps.used(HeapKind::DynamicState), 0);
    }

    #[test]
    fn scratch_surfaces_reach_retired_surface_chunks_once_per_key() {
        let mem = Arc::new(MemoryManager::new());
        let mut heaps = HeapSet::new(mem, 0x1000, 64).unwrap();
        let surfaces = vec![(128, vec![0xab; 64])];
        assert!(heaps.program_scratch_surfaces((7, 1), &surfaces).unwrap());
        assert!(!heaps.program_scratch_surfaces((7, 1), &surfaces).unwrap());

        let size = heaps.heap(HeapKind::SurfaceState).size();
        assert!(heaps.allocate(HeapKind::SurfaceState, size, 64).unwrap().grew);
        assert_eq!(heaps.surface_state_chunks().count(), 2);

        let moved = vec![(256, vec![0xcd; 64])];
        assert!(heaps.program_scratch_surfaces((8, 2), &moved).unwrap());
        for chunk in heaps.surface_state_chunks() {
            assert_eq!(chunk.bytes(256, 64).unwrap(), vec![0xcd; 64]);
        }
        assert!(!heaps.program_scratch_surfaces((8, 2), &moved).unwrap());
    }

    #[test]
    fn base_address_size_fields_are_checked() {
        assert_eq!(size_field(0x4000), Ok(0x4000));
        assert_eq!(size_field(u64::from(u32::MAX)), Ok(u32::MAX));
        assert!(matches!(size_field(1 << 32), Err(SubmitError::InvalidArgument(_))));

        let mem = Arc::new(MemoryManager::new());
        let heaps = HeapSet::new(mem, 0x4000, 64).unwrap();
        let mut sba = StateBaseAddressProperties::default();
        heaps.program_state_base_address(&mut sba).unwrap();
        assert_eq!(sba.surface_state_size.value(), Some(0x4000));
    }
}
