//! Kernel printf buffers.
//!
//! Layout: a `u32` write cursor at offset 0 (bytes used, header included) followed by records
//! of `{len: u32, bytes, pad to 4}`.

use std::sync::Arc;

use gpusub_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool};
use tracing::{info, warn};

use crate::error::{Result, SubmitError};

pub const PRINTF_BUFFER_SIZE: u64 = 4096;
const HEADER_SIZE: u32 = 4;

/// Receives drained printf output.
pub trait PrintfSink: Send + Sync {
    fn flush(&self, kernel_name: &str, messages: &[String], incomplete_due_to_hang: bool);
}

/// Default sink: one `info!` event per message.
#[derive(Debug, Default)]
pub struct TracingPrintfSink;

impl PrintfSink for TracingPrintfSink {
    fn flush(&self, kernel_name: &str, messages: &[String], incomplete_due_to_hang: bool) {
        for message in messages {
            info!(kernel = kernel_name, incomplete_due_to_hang, "{message}");
        }
    }
}

#[derive(Clone, Debug)]
pub struct PrintfBuffer {
    kernel_name: String,
    alloc: Arc<GraphicsAllocation>,
}

impl PrintfBuffer {
    pub fn new(mem: &MemoryManager, kernel_name: &str) -> Result<Self> {
        let alloc = mem
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                PRINTF_BUFFER_SIZE,
                AllocationType::PrintfSurface,
                MemoryPool::System,
            ))
            .ok_or(SubmitError::OutOfHostMemory)?;
        alloc.write(0, &HEADER_SIZE.to_le_bytes())?;
        Ok(Self {
            kernel_name: kernel_name.to_owned(),
            alloc,
        })
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.alloc
    }

    fn cursor(&self) -> u32 {
        let mut buf = [0u8; 4];
        match self.alloc.read(0, &mut buf) {
            Ok(()) => u32::from_le_bytes(buf),
            Err(_) => HEADER_SIZE,
        }
    }

    /// Append a record the way a kernel would. Returns false when the buffer is full.
    pub fn write_message(&self, message: &str) -> bool {
        let cursor = self.cursor();
        let len = message.len() as u32;
        let padded = (len + 3) & !3;
        let end = u64::from(cursor) + 4 + u64::from(padded);
        if end > self.alloc.size() {
            return false;
        }
        let mut record = Vec::with_capacity(4 + padded as usize);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(message.as_bytes());
        record.resize(4 + padded as usize, 0);
        self.alloc.write(u64::from(cursor), &record).is_ok()
            && self.alloc.write(0, &(end as u32).to_le_bytes()).is_ok()
    }

    pub fn read_messages(&self) -> Vec<String> {
        let used = u64::from(self.cursor()).min(self.alloc.size());
        let Ok(bytes) = self.alloc.bytes(0, used as usize) else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        let mut pos = HEADER_SIZE as usize;
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
            let start = pos + 4;
            if start + len > bytes.len() {
                warn!(kernel = %self.kernel_name, "truncated printf record");
                break;
            }
            messages.push(String::from_utf8_lossy(&bytes[start..start + len]).into_owned());
            pos = start + ((len + 3) & !3);
        }
        messages
    }

    /// Hand the buffered output to `sink` and empty the buffer for the next execution.
    pub fn drain_to(&self, sink: &dyn PrintfSink, incomplete_due_to_hang: bool) {
        let messages = self.read_messages();
        if let Err(err) = self.alloc.write(0, &HEADER_SIZE.to_le_bytes()) {
            warn!(kernel = %self.kernel_name, error = %err, "failed to rewind printf buffer");
        }
        sink.flush(&self.kernel_name, &messages, incomplete_due_to_hang);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, Vec<String>, bool)>>);

    impl PrintfSink for Collect {
        fn flush(&self, kernel_name: &str, messages: &[String], incomplete: bool) {
            self.0
                .lock()
                .unwrap()
                .push((kernel_name.to_owned(), messages.to_vec(), incomplete));
        }
    }

    #[test]
    fn records_roundtrip_through_the_buffer() {
        let mem = MemoryManager::new();
        let buf = PrintfBuffer::new(&mem, "k").unwrap();
        assert!(buf.read_messages().is_empty());
        assert!(buf.write_message("hello"));
        assert!(buf.write_message("x = 42"));

        let sink = Collect::default();
        buf.drain_to(&sink, true);
        let got = sink.0.into_inner().unwrap();
        assert_eq!(
            got,
            vec![("k".to_owned(), vec!["hello".to_owned(), "x = 42".to_owned()], true)]
        );
    }

    #[test]
    fn draining_empties_the_buffer() {
        let mem = MemoryManager::new();
        let buf = PrintfBuffer::new(&mem, "k").unwrap();
        assert!(buf.write_message("once"));
        let sink = Collect::default();
        buf.drain_to(&sink, false);
        assert!(buf.read_messages().is_empty());

        assert!(buf.write_message("twice"));
        buf.drain_to(&sink, false);
        let got = sink.0.into_inner().unwrap();
        assert_eq!(got[0].1, vec!["once".to_owned()]);
        assert_eq!(got[1].1, vec!["twice".to_owned()]);
    }

    #[test]
    fn full_buffer_rejects_records() {
        let mem = MemoryManager::new();
        let buf = PrintfBuffer::new(&mem, "k").unwrap();
        let big = "a".repeat(PRINTF_BUFFER_SIZE as usize);
        assert!(!buf.write_message(&big));
    }
}
