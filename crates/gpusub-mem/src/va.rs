use std::fmt;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Linear GPU virtual-address allocator.
///
/// Addresses are never handed out twice, so a reallocated buffer always lands at a new GPU
/// address even when the previous one has been freed.
#[derive(Clone)]
pub struct GpuVaArena {
    base: u64,
    capacity: u64,
    cursor: u64,
}

impl GpuVaArena {
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            cursor: base,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn remaining(&self) -> u64 {
        self.end().saturating_sub(self.cursor)
    }

    fn end(&self) -> u64 {
        self.base + self.capacity
    }

    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(1);

        let aligned = align_up(self.cursor, alignment);
        let end = aligned.checked_add(size)?;
        if end > self.end() {
            return None;
        }

        self.cursor = end;
        Some(aligned)
    }
}

impl fmt::Debug for GpuVaArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuVaArena")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("cursor", &format_args!("{:#x}", self.cursor))
            .finish()
    }
}
