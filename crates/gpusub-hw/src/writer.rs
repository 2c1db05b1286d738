//! Command stream builder.
//!
//! Produces canonical packets (correct `size_bytes`, zeroed reserved fields). Callers that
//! stream into GPU memory directly use [`encode_cmd`] and copy the bytes themselves.

use crate::cmd::{write_u32, CmdHdr, HwCommand};

pub fn align_up(v: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (v + (a - 1)) & !(a - 1)
}

/// Encode a single packet, header included.
pub fn encode_cmd<T: HwCommand>(cmd: &T) -> Vec<u8> {
    let mut out = vec![0u8; T::SIZE_BYTES];
    write_u32(&mut out, 0, T::OPCODE as u32);
    write_u32(&mut out, 4, T::SIZE_BYTES as u32);
    cmd.encode_payload(&mut out);
    out
}

/// Overwrite the packet at `offset` inside `buf`. Used when a reserved slot is filled in after
/// the rest of the stream has been written.
pub fn write_cmd_at<T: HwCommand>(buf: &mut [u8], offset: usize, cmd: &T) {
    let bytes = encode_cmd(cmd);
    buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
}

#[derive(Debug, Default, Clone)]
pub struct CmdStreamWriter {
    buf: Vec<u8>,
}

impl CmdStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append `cmd` and return the offset of its header.
    pub fn append<T: HwCommand>(&mut self, cmd: &T) -> usize {
        let offset = self.buf.len();
        self.buf.resize(offset + T::SIZE_BYTES, 0);
        let out = &mut self.buf[offset..];
        write_u32(out, 0, T::OPCODE as u32);
        write_u32(out, 4, T::SIZE_BYTES as u32);
        cmd.encode_payload(&mut out[..T::SIZE_BYTES]);
        offset
    }

    /// Reserve `size` zero bytes (parsed as no-ops) and return their offset.
    pub fn reserve_noop_space(&mut self, size: usize) -> usize {
        assert!(size % 4 == 0, "no-op space must be dword aligned");
        let offset = self.buf.len();
        self.buf.resize(offset + size, 0);
        offset
    }

    /// Overwrite a previously appended packet in place.
    pub fn patch<T: HwCommand>(&mut self, offset: usize, cmd: &T) {
        assert!(
            offset + T::SIZE_BYTES <= self.buf.len(),
            "patched packet extends past end of stream"
        );
        write_cmd_at(&mut self.buf, offset, cmd);
    }
}

const _: () = assert!(CmdHdr::SIZE_BYTES % 4 == 0);
