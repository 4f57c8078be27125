//! Thread table decoding and per-thread CPU context access.

use scroll::{Pread, LE};

use crate::minidump::{stream_type, MinidumpView, THREAD_ENTRY_SIZE};

// x64 CONTEXT register offsets.
const CONTEXT_RSP_OFFSET: usize = 0x98;
const CONTEXT_RBP_OFFSET: usize = 0xA0;
const CONTEXT_RIP_OFFSET: usize = 0xF8;

/// One decoded `MINIDUMP_THREAD`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRecord {
    pub tid: u32,
    pub stack_start: u64,
    pub stack_size: u32,
    pub stack_rva: u32,
    pub context_rva: u32,
    pub context_size: u32,
}

/// The registers the stack walker needs. Bytes not present in the dump's
/// context record are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadContext {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
}

/// Decoded ThreadList with bounds-checked context/stack accessors.
#[derive(Debug, Default)]
pub struct ThreadIndex {
    threads: Vec<ThreadRecord>,
}

impl ThreadIndex {
    /// Decodes the ThreadList stream. An absent or short stream yields an
    /// empty index; the pass continues without per-thread signals.
    pub fn load(view: &MinidumpView) -> Self {
        let mut threads = Vec::new();
        if let Some(body) = view.find_stream(stream_type::THREAD_LIST) {
            if body.len() >= 4 {
                let count: u32 = body.pread_with(0, LE).unwrap_or(0);
                let need =
                    4u64.saturating_add(u64::from(count).saturating_mul(THREAD_ENTRY_SIZE as u64));
                if need <= body.len() as u64 {
                    threads.reserve(count as usize);
                    for i in 0..count as usize {
                        let off = 4 + i * THREAD_ENTRY_SIZE;
                        let tid: u32 = body.pread_with(off, LE).unwrap_or(0);
                        let stack_start: u64 = body.pread_with(off + 16, LE).unwrap_or(0);
                        let stack_size: u32 = body.pread_with(off + 24, LE).unwrap_or(0);
                        let stack_rva: u32 = body.pread_with(off + 28, LE).unwrap_or(0);
                        let context_size: u32 = body.pread_with(off + 32, LE).unwrap_or(0);
                        let context_rva: u32 = body.pread_with(off + 36, LE).unwrap_or(0);
                        threads.push(ThreadRecord {
                            tid,
                            stack_start,
                            stack_size,
                            stack_rva,
                            context_rva,
                            context_size,
                        });
                    }
                }
            }
        }
        Self { threads }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn records(&self) -> &[ThreadRecord] {
        &self.threads
    }

    pub fn find(&self, tid: u32) -> Option<&ThreadRecord> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    /// Copies a thread's CPU context out of the dump. Fields beyond the
    /// recorded context size read as zero.
    pub fn context(&self, view: &MinidumpView, tid: u32) -> Option<ThreadContext> {
        let tr = self.find(tid)?;
        read_context_at(view, tr.context_rva, tr.context_size)
    }

    /// Returns `(bytes, base_addr)` of a thread's captured stack memory.
    pub fn stack_bytes<'a>(&self, view: &'a MinidumpView, tid: u32) -> Option<(&'a [u8], u64)> {
        let tr = self.find(tid)?;
        if tr.stack_rva == 0 || tr.stack_size == 0 {
            return None;
        }
        let bytes = view.slice_at(u64::from(tr.stack_rva), u64::from(tr.stack_size))?;
        Some((bytes, tr.stack_start))
    }
}

/// Reads an x64 context record at an explicit location (also used for the
/// exception stream's own context).
pub fn read_context_at(view: &MinidumpView, rva: u32, size: u32) -> Option<ThreadContext> {
    if rva == 0 || size == 0 {
        return None;
    }
    let body = view.slice_at(u64::from(rva), u64::from(size))?;
    let read_reg = |off: usize| -> u64 {
        if off + 8 <= body.len() {
            body.pread_with(off, LE).unwrap_or(0)
        } else {
            0
        }
    };
    Some(ThreadContext {
        rip: read_reg(CONTEXT_RIP_OFFSET),
        rsp: read_reg(CONTEXT_RSP_OFFSET),
        rbp: read_reg(CONTEXT_RBP_OFFSET),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Serializes one `MINIDUMP_THREAD` entry.
    pub fn encode_thread(tr: &ThreadRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(THREAD_ENTRY_SIZE);
        out.extend_from_slice(&tr.tid.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // suspend_count
        out.extend_from_slice(&0u32.to_le_bytes()); // priority_class
        out.extend_from_slice(&0u32.to_le_bytes()); // priority
        out.extend_from_slice(&0u64.to_le_bytes()); // teb
        out.extend_from_slice(&tr.stack_start.to_le_bytes());
        out.extend_from_slice(&tr.stack_size.to_le_bytes());
        out.extend_from_slice(&tr.stack_rva.to_le_bytes());
        out.extend_from_slice(&tr.context_size.to_le_bytes());
        out.extend_from_slice(&tr.context_rva.to_le_bytes());
        out
    }

    pub fn encode_thread_list(threads: &[ThreadRecord]) -> Vec<u8> {
        let mut body = (threads.len() as u32).to_le_bytes().to_vec();
        for tr in threads {
            body.extend_from_slice(&encode_thread(tr));
        }
        body
    }

    /// Minimal x64 context blob with just rip/rsp/rbp populated.
    pub fn encode_context(ctx: &ThreadContext) -> Vec<u8> {
        let mut out = vec![0u8; 0x100];
        out[CONTEXT_RSP_OFFSET..CONTEXT_RSP_OFFSET + 8].copy_from_slice(&ctx.rsp.to_le_bytes());
        out[CONTEXT_RBP_OFFSET..CONTEXT_RBP_OFFSET + 8].copy_from_slice(&ctx.rbp.to_le_bytes());
        out[CONTEXT_RIP_OFFSET..CONTEXT_RIP_OFFSET + 8].copy_from_slice(&ctx.rip.to_le_bytes());
        out
    }
}
