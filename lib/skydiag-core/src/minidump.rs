//! Memory-mapped minidump access.
//!
//! A minidump is a 32-byte header, a stream directory, and per-stream
//! bodies. The engine maps the file read-only and hands out bounds-checked
//! slices; nothing here copies stream payloads. All offset arithmetic is
//! checked against the file size so a truncated or hostile dump can never
//! read out of bounds.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use scroll::{Pread, LE};

use crate::threads::ThreadRecord;
use crate::{DiagError, Result};

/// 'MDMP' little-endian.
pub const MINIDUMP_SIGNATURE: u32 = 0x504D_444D;

/// Minidump header size in bytes.
pub const HEADER_SIZE: usize = 32;
/// One stream directory entry: `{stream_type, data_size, rva}`.
pub const DIRECTORY_ENTRY_SIZE: usize = 12;
/// `MINIDUMP_MODULE` without tail padding.
pub const MODULE_ENTRY_SIZE: usize = 108;
/// `MINIDUMP_THREAD`.
pub const THREAD_ENTRY_SIZE: usize = 48;
/// `MINIDUMP_MEMORY_DESCRIPTOR`.
pub const MEMORY_DESCRIPTOR_SIZE: usize = 16;
/// `MINIDUMP_MEMORY_DESCRIPTOR64`.
pub const MEMORY_DESCRIPTOR64_SIZE: usize = 16;
/// `MINIDUMP_EXCEPTION_STREAM`.
pub const EXCEPTION_STREAM_SIZE: usize = 168;

/// Standard stream types used by the engine.
pub mod stream_type {
    pub const THREAD_LIST: u32 = 3;
    pub const MODULE_LIST: u32 = 4;
    pub const MEMORY_LIST: u32 = 5;
    pub const EXCEPTION: u32 = 6;
    pub const MEMORY64_LIST: u32 = 9;

    // Custom user streams written by the capture helper. Must be above the
    // platform's reserved range (0xffff).
    pub const USER_BLACKBOX: u32 = 0x10000 + 0x5344;
    pub const USER_WCT_JSON: u32 = 0x10000 + 0x5743;
}

/// A validated stream directory entry.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub stream_type: u32,
    pub data_size: u32,
    pub rva: u32,
}

/// Exception record extracted from the ExceptionStream.
#[derive(Debug, Clone, Default)]
pub struct ExceptionInfo {
    pub code: u32,
    pub thread_id: u32,
    pub address: u64,
    /// `ExceptionInformation` slots, truncated to `NumberParameters`.
    pub info: Vec<u64>,
    /// Location of the faulting thread's CPU context, if recorded.
    pub context_rva: u32,
    pub context_size: u32,
}

/// CodeView PDB70 record ('RSDS') from a module's `cv_record`.
#[derive(Debug, Clone)]
pub struct CodeViewPdbRecord {
    pub guid: [u8; 16],
    pub age: u32,
    pub pdb_name: String,
}

impl CodeViewPdbRecord {
    /// Symbol-server identifier: uppercase GUID hex followed by the age.
    pub fn symbol_id(&self) -> String {
        let g = &self.guid;
        // GUID fields are stored little-endian for data1..data3.
        format!(
            "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:X}",
            g[3], g[2], g[1], g[0], g[5], g[4], g[7], g[6], g[8], g[9], g[10], g[11], g[12], g[13], g[14], g[15],
            self.age
        )
    }
}

/// A shared read-only mapping of one minidump file.
///
/// The mapping owns the pages; all stream slices, strings, and memory
/// ranges returned from here borrow the mapping and must not outlive it.
pub struct MinidumpView {
    mmap: Mmap,
    path: PathBuf,
    stream_count: u32,
    directory_rva: u32,
}

impl MinidumpView {
    /// Opens and validates a minidump.
    ///
    /// # Errors
    ///
    /// Returns `DiagError::MalformedDump` when the signature mismatches or
    /// the stream directory would read out of bounds, and `DiagError::Io`
    /// when the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE {
            return Err(DiagError::MalformedDump(format!(
                "file too small for header: {} bytes",
                mmap.len()
            )));
        }

        let signature: u32 = mmap
            .pread_with(0, LE)
            .map_err(|_| DiagError::MalformedDump("unreadable header".into()))?;
        if signature != MINIDUMP_SIGNATURE {
            return Err(DiagError::MalformedDump(format!(
                "bad signature 0x{signature:08X}"
            )));
        }

        let stream_count: u32 = mmap.pread_with(8, LE).unwrap_or(0);
        let directory_rva: u32 = mmap.pread_with(12, LE).unwrap_or(0);

        let dir_off = directory_rva as u64;
        let file_size = mmap.len() as u64;
        if dir_off > file_size {
            return Err(DiagError::MalformedDump("stream directory beyond EOF".into()));
        }
        let max_entries = (file_size - dir_off) / DIRECTORY_ENTRY_SIZE as u64;
        if stream_count == 0 || u64::from(stream_count) > max_entries {
            return Err(DiagError::MalformedDump(format!(
                "directory claims {stream_count} entries, file fits {max_entries}"
            )));
        }

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            stream_count,
            directory_rva,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The entire mapped file.
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn dir_entry(&self, index: u32) -> Option<DirEntry> {
        if index >= self.stream_count {
            return None;
        }
        let off = self.directory_rva as usize + index as usize * DIRECTORY_ENTRY_SIZE;
        let stream_type: u32 = self.mmap.pread_with(off, LE).ok()?;
        let data_size: u32 = self.mmap.pread_with(off + 4, LE).ok()?;
        let rva: u32 = self.mmap.pread_with(off + 8, LE).ok()?;
        Some(DirEntry {
            stream_type,
            data_size,
            rva,
        })
    }

    /// Finds the first stream of the given type and returns its body.
    ///
    /// O(N) over the directory; N is small. A stream whose body would read
    /// out of bounds is treated as absent (local-recoverable, the caller's
    /// signal is simply disabled).
    pub fn find_stream(&self, kind: u32) -> Option<&[u8]> {
        for i in 0..self.stream_count {
            let entry = self.dir_entry(i)?;
            if entry.stream_type != kind {
                continue;
            }
            return self.slice_at(entry.rva as u64, entry.data_size as u64);
        }
        None
    }

    /// Bounds-checked slice into the mapped file.
    pub fn slice_at(&self, rva: u64, size: u64) -> Option<&[u8]> {
        let file_size = self.file_size();
        if rva > file_size || size > file_size.saturating_sub(rva) {
            return None;
        }
        Some(&self.mmap[rva as usize..(rva + size) as usize])
    }

    /// Reads a minidump string: `u32 byte_length` followed by UTF-16LE
    /// code units. Rejected when the declared length is odd or overruns
    /// the file.
    pub fn read_sized_string_utf16(&self, rva: u32) -> Option<String> {
        if rva == 0 {
            return None;
        }
        let len_bytes: u32 = self.mmap.pread_with(rva as usize, LE).ok()?;
        if len_bytes % 2 != 0 {
            return None;
        }
        let body = self.slice_at(u64::from(rva) + 4, u64::from(len_bytes))?;
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// Parses the ExceptionStream, if present.
    pub fn exception(&self) -> Option<ExceptionInfo> {
        let body = self.find_stream(stream_type::EXCEPTION)?;
        if body.len() < EXCEPTION_STREAM_SIZE {
            return None;
        }
        let thread_id: u32 = body.pread_with(0, LE).ok()?;
        let code: u32 = body.pread_with(8, LE).ok()?;
        let address: u64 = body.pread_with(24, LE).ok()?;
        let num_params: u32 = body.pread_with(32, LE).ok()?;
        let n = num_params.min(15) as usize;
        let mut info = Vec::with_capacity(n);
        for i in 0..n {
            info.push(body.pread_with::<u64>(40 + i * 8, LE).ok()?);
        }
        let context_size: u32 = body.pread_with(160, LE).ok()?;
        let context_rva: u32 = body.pread_with(164, LE).ok()?;
        Some(ExceptionInfo {
            code,
            thread_id,
            address,
            info,
            context_rva,
            context_size,
        })
    }

    /// Builds the merged process-memory view.
    ///
    /// Policy: prefer Memory64List (densely packed after a base RVA
    /// cursor); else MemoryList (per-descriptor RVAs); else synthesize
    /// ranges from the per-thread stack descriptors. An inconsistent
    /// Memory64 list clears its ranges and falls through.
    pub fn memory_view<'a>(&'a self, threads: &[ThreadRecord]) -> MemoryView<'a> {
        let mut ranges: Vec<MemoryRange<'a>> = Vec::new();

        if let Some(body) = self.find_stream(stream_type::MEMORY64_LIST) {
            if body.len() >= 16 {
                let count: u64 = body.pread_with(0, LE).unwrap_or(0);
                let base_rva: u64 = body.pread_with(8, LE).unwrap_or(0);
                let need = 16u64.saturating_add(count.saturating_mul(MEMORY_DESCRIPTOR64_SIZE as u64));
                if need <= body.len() as u64 {
                    let mut cursor = base_rva;
                    for i in 0..count as usize {
                        let off = 16 + i * MEMORY_DESCRIPTOR64_SIZE;
                        let start: u64 = body.pread_with(off, LE).unwrap_or(0);
                        let size: u64 = body.pread_with(off + 8, LE).unwrap_or(0);
                        if size == 0 {
                            continue;
                        }
                        match self.slice_at(cursor, size) {
                            Some(bytes) => {
                                ranges.push(MemoryRange {
                                    start,
                                    end: start.saturating_add(size),
                                    bytes,
                                });
                                cursor += size;
                            }
                            None => {
                                ranges.clear();
                                break;
                            }
                        }
                    }
                }
            }
        }

        if ranges.is_empty() {
            if let Some(body) = self.find_stream(stream_type::MEMORY_LIST) {
                if body.len() >= 4 {
                    let count: u32 = body.pread_with(0, LE).unwrap_or(0);
                    let need = 4u64.saturating_add(
                        u64::from(count).saturating_mul(MEMORY_DESCRIPTOR_SIZE as u64),
                    );
                    if need <= body.len() as u64 {
                        for i in 0..count as usize {
                            let off = 4 + i * MEMORY_DESCRIPTOR_SIZE;
                            let start: u64 = body.pread_with(off, LE).unwrap_or(0);
                            let size: u32 = body.pread_with(off + 8, LE).unwrap_or(0);
                            let rva: u32 = body.pread_with(off + 12, LE).unwrap_or(0);
                            if rva == 0 || size == 0 {
                                continue;
                            }
                            if let Some(bytes) = self.slice_at(u64::from(rva), u64::from(size)) {
                                ranges.push(MemoryRange {
                                    start,
                                    end: start.saturating_add(u64::from(size)),
                                    bytes,
                                });
                            }
                        }
                    }
                }
            }
        }

        // Some dumps omit both memory lists but still record per-thread
        // stack memory in the thread list.
        if ranges.is_empty() {
            for tr in threads {
                if tr.stack_rva == 0 || tr.stack_size == 0 {
                    continue;
                }
                if let Some(bytes) =
                    self.slice_at(u64::from(tr.stack_rva), u64::from(tr.stack_size))
                {
                    ranges.push(MemoryRange {
                        start: tr.stack_start,
                        end: tr.stack_start.saturating_add(u64::from(tr.stack_size)),
                        bytes,
                    });
                }
            }
        }

        ranges.sort_by_key(|r| r.start);
        MemoryView { ranges }
    }

    /// Parses a module's CodeView record when it is a PDB70 ('RSDS') entry.
    pub fn codeview_pdb_record(&self, cv_rva: u32, cv_size: u32) -> Option<CodeViewPdbRecord> {
        const RSDS: u32 = 0x5344_5352;
        let body = self.slice_at(u64::from(cv_rva), u64::from(cv_size))?;
        if body.len() < 24 {
            return None;
        }
        let sig: u32 = body.pread_with(0, LE).ok()?;
        if sig != RSDS {
            return None;
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&body[4..20]);
        let age: u32 = body.pread_with(20, LE).ok()?;
        let name_bytes = &body[24..];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let pdb_name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        if pdb_name.is_empty() {
            return None;
        }
        Some(CodeViewPdbRecord { guid, age, pdb_name })
    }
}

/// One captured memory range; `bytes` points into the mapped dump file.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange<'a> {
    pub start: u64,
    pub end: u64,
    pub bytes: &'a [u8],
}

/// Merged view over the dump's captured memory ranges, sorted by start.
pub struct MemoryView<'a> {
    ranges: Vec<MemoryRange<'a>>,
}

impl<'a> MemoryView<'a> {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Reads up to `len` bytes starting at `addr`.
    ///
    /// Finds the single containing range (upper-bound then predecessor)
    /// and returns a slice truncated at the range end; adjacent ranges are
    /// not stitched.
    pub fn read(&self, addr: u64, len: usize) -> Option<&'a [u8]> {
        if len == 0 {
            return None;
        }
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        if idx == 0 {
            return None;
        }
        let r = &self.ranges[idx - 1];
        if addr < r.start || addr >= r.end {
            return None;
        }
        let off = (addr - r.start) as usize;
        let avail = (r.end - addr) as usize;
        let take = avail.min(len).min(r.bytes.len().saturating_sub(off));
        if take == 0 {
            return None;
        }
        Some(&r.bytes[off..off + take])
    }

    /// Reads one little-endian u64, failing on partial coverage.
    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = self.read(addr, 8)?;
        if bytes.len() < 8 {
            return None;
        }
        Some(u64::from_le_bytes(bytes[..8].try_into().ok()?))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Synthetic minidump builder shared by unit and integration tests.

    use super::*;

    #[derive(Default)]
    pub struct DumpBuilder {
        streams: Vec<(u32, Vec<u8>)>,
    }

    impl DumpBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn stream(mut self, kind: u32, body: Vec<u8>) -> Self {
            self.streams.push((kind, body));
            self
        }

        /// Lays out header + directory + bodies and returns the file bytes.
        pub fn build(self) -> Vec<u8> {
            let dir_off = HEADER_SIZE;
            let bodies_off = dir_off + self.streams.len() * DIRECTORY_ENTRY_SIZE;

            let mut out = Vec::new();
            out.extend_from_slice(&MINIDUMP_SIGNATURE.to_le_bytes());
            out.extend_from_slice(&0xA793u32.to_le_bytes()); // version
            out.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
            out.extend_from_slice(&(dir_off as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // checksum
            out.extend_from_slice(&0u32.to_le_bytes()); // time_date_stamp
            out.extend_from_slice(&0u64.to_le_bytes()); // flags

            let mut cursor = bodies_off as u32;
            for (kind, body) in &self.streams {
                out.extend_from_slice(&kind.to_le_bytes());
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(&cursor.to_le_bytes());
                cursor += body.len() as u32;
            }
            for (_, body) in &self.streams {
                out.extend_from_slice(body);
            }
            out
        }

        /// Writes the dump to a temp file and opens it.
        pub fn open(self, dir: &std::path::Path, name: &str) -> Result<MinidumpView> {
            let path = dir.join(name);
            std::fs::write(&path, self.build()).unwrap();
            MinidumpView::open(&path)
        }
    }

    /// Minidump string encoding: u32 byte length + UTF-16LE units.
    pub fn encode_string_utf16(s: &str) -> Vec<u8> {
        let units: Vec<u16> = s.encode_utf16().collect();
        let mut out = Vec::with_capacity(4 + units.len() * 2);
        out.extend_from_slice(&((units.len() * 2) as u32).to_le_bytes());
        for u in units {
            out.extend_from_slice(&u.to_le_bytes());
        }
        out
    }
}
