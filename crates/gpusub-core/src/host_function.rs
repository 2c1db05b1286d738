//! Host callbacks scheduled from inside a command stream.
//!
//! A recorded host function is four packets: two stores publishing the callback id and user
//! data into the streamer slot, a store raising the slot's pending tag, and a semaphore that
//! blocks the engine until the host has run the callback and copied the tag to the completed
//! field. Addresses and tag values are patched per submission.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use gpusub_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool};
use tracing::{debug, warn};

use crate::error::{Result, SubmitError};

pub type HostFunctionCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone)]
pub struct HostFunction {
    pub callback: HostFunctionCallback,
    pub user_data: u64,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("user_data", &self.user_data)
            .finish_non_exhaustive()
    }
}

pub const ENTRY_OFFSET: u64 = 0;
pub const USER_DATA_OFFSET: u64 = 8;
pub const PENDING_TAG_OFFSET: u64 = 16;
pub const COMPLETED_TAG_OFFSET: u64 = 24;

/// Callback id and tag assigned to one recorded host function for one submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostFunctionBinding {
    pub id: u64,
    pub tag: u64,
}

#[derive(Default)]
struct StreamerInner {
    next_id: u64,
    next_tag: u64,
    callbacks: HashMap<u64, HostFunctionCallback>,
}

/// Per-CSR slot through which the engine hands host functions to the host.
pub struct HostFunctionStreamer {
    alloc: Arc<GraphicsAllocation>,
    inner: Mutex<StreamerInner>,
}

impl fmt::Debug for HostFunctionStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunctionStreamer")
            .field("gpu_address", &format_args!("{:#x}", self.alloc.gpu_address()))
            .finish_non_exhaustive()
    }
}

impl HostFunctionStreamer {
    pub fn new(mem: &MemoryManager) -> Result<Self> {
        let alloc = mem
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                4096,
                AllocationType::TagBuffer,
                MemoryPool::System,
            ))
            .ok_or(SubmitError::OutOfHostMemory)?;
        Ok(Self {
            alloc,
            inner: Mutex::new(StreamerInner {
                next_id: 1,
                next_tag: 1,
                callbacks: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StreamerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.alloc
    }

    pub fn entry_address(&self) -> u64 {
        self.alloc.gpu_address() + ENTRY_OFFSET
    }

    pub fn user_data_address(&self) -> u64 {
        self.alloc.gpu_address() + USER_DATA_OFFSET
    }

    pub fn pending_tag_address(&self) -> u64 {
        self.alloc.gpu_address() + PENDING_TAG_OFFSET
    }

    pub fn completed_tag_address(&self) -> u64 {
        self.alloc.gpu_address() + COMPLETED_TAG_OFFSET
    }

    /// Register `function` for one execution and reserve its tag.
    pub fn bind(&self, function: &HostFunction) -> HostFunctionBinding {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let tag = inner.next_tag;
        inner.next_tag += 1;
        inner.callbacks.insert(id, function.callback.clone());
        HostFunctionBinding { id, tag }
    }

    pub fn pending_callbacks(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Run the callback the engine is blocked on, if any. Returns true when one ran.
    pub fn process(&self) -> bool {
        let (Ok(pending), Ok(completed)) = (
            self.alloc.read_u64(PENDING_TAG_OFFSET),
            self.alloc.read_u64(COMPLETED_TAG_OFFSET),
        ) else {
            return false;
        };
        if pending <= completed {
            return false;
        }

        let id = self.alloc.read_u64(ENTRY_OFFSET).unwrap_or(0);
        let user_data = self.alloc.read_u64(USER_DATA_OFFSET).unwrap_or(0);
        let callback = self.lock().callbacks.remove(&id);
        match callback {
            Some(callback) => {
                debug!(id, tag = pending, "running host function");
                callback(user_data);
            }
            None => warn!(id, tag = pending, "host function slot names an unknown callback"),
        }
        if let Err(err) = self.alloc.write_u64(COMPLETED_TAG_OFFSET, pending) {
            warn!(error = %err, "failed to complete host function tag");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn process_runs_published_callback_once() {
        let mem = MemoryManager::new();
        let streamer = HostFunctionStreamer::new(&mem).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let binding = streamer.bind(&HostFunction {
            callback: Arc::new(move |ud| {
                seen2.store(ud, Ordering::SeqCst);
            }),
            user_data: 0,
        });
        assert!(!streamer.process());

        // What the engine does when it executes the recorded stores.
        mem.write_u64(streamer.entry_address(), binding.id).unwrap();
        mem.write_u64(streamer.user_data_address(), 99).unwrap();
        mem.write_u64(streamer.pending_tag_address(), binding.tag).unwrap();

        assert!(streamer.process());
        assert_eq!(seen.load(Ordering::SeqCst), 99);
        assert_eq!(mem.read_u64(streamer.completed_tag_address()).unwrap(), binding.tag);
        assert!(!streamer.process());
        assert_eq!(streamer.pending_callbacks(), 0);
    }
}
