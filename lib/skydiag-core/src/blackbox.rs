//! In-process blackbox snapshot decoding.
//!
//! The probe DLL keeps a seq-locked ring of typed events plus a smaller
//! seq-locked resource-load ring in shared memory; the capture helper
//! embeds a raw snapshot of that region as a custom minidump user stream.
//! The reader side of the seqlock protocol applies even to the frozen
//! snapshot: read the sequence, copy the body, re-read the sequence, and
//! discard when odd, when the two reads differ, or when the type is
//! invalid. A torn write at capture time then surfaces as a dropped entry
//! instead of garbage.

use scroll::{Pread, LE};

use crate::mo2::Mo2Index;
use crate::report::{EventRow, ResourceRow};

/// 'SDIA' magic.
pub const BLACKBOX_MAGIC: u32 = 0x5344_4941;
pub const BLACKBOX_VERSION: u32 = 2;
pub const EVENT_CAPACITY: u32 = 1 << 16;
pub const RESOURCE_CAPACITY: u32 = 256;
pub const RESOURCE_PATH_MAX_BYTES: usize = 260;

/// Fixed layout offsets inside the snapshot stream.
const HEADER_SIZE: usize = 64;
const EVENT_SIZE: usize = 56;
const RESOURCE_ENTRY_SIZE: usize = 288;

/// Most recent resource entries kept after decoding.
pub const RESOURCE_KEEP_MAX: usize = 80;

/// Typed blackbox events written by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventType {
    Invalid = 0,
    SessionStart = 1,
    Heartbeat = 2,
    MenuOpen = 10,
    MenuClose = 11,
    LoadStart = 20,
    LoadEnd = 21,
    CellChange = 30,
    Note = 40,
    /// Long main-thread stall; payload slot `a` carries the stall in ms.
    PerfHitch = 50,
    Crash = 100,
    HangMark = 200,
}

impl EventType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => EventType::SessionStart,
            2 => EventType::Heartbeat,
            10 => EventType::MenuOpen,
            11 => EventType::MenuClose,
            20 => EventType::LoadStart,
            21 => EventType::LoadEnd,
            30 => EventType::CellChange,
            40 => EventType::Note,
            50 => EventType::PerfHitch,
            100 => EventType::Crash,
            200 => EventType::HangMark,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Invalid => "Invalid",
            EventType::SessionStart => "SessionStart",
            EventType::Heartbeat => "Heartbeat",
            EventType::MenuOpen => "MenuOpen",
            EventType::MenuClose => "MenuClose",
            EventType::LoadStart => "LoadStart",
            EventType::LoadEnd => "LoadEnd",
            EventType::CellChange => "CellChange",
            EventType::Note => "Note",
            EventType::PerfHitch => "PerfHitch",
            EventType::Crash => "Crash",
            EventType::HangMark => "HangMark",
        }
    }
}

pub fn event_type_name(v: u16) -> &'static str {
    EventType::from_u16(v).map_or("Unknown", EventType::name)
}

/// State flags mirrored from the probe's shared header.
pub mod state_flags {
    pub const FROZEN: u32 = 1 << 0;
    pub const LOADING: u32 = 1 << 1;
    pub const IN_MENU: u32 = 1 << 2;
}

/// Decoded snapshot: identifying fields plus the surviving ring entries.
#[derive(Debug, Default)]
pub struct BlackboxSnapshot {
    pub pid: u32,
    pub state_flags: u32,
    pub events: Vec<EventRow>,
    pub resources: Vec<ResourceRow>,
}

/// `nif`/`hkx`/`tri` stay as-is, other extensions are passed through
/// lowercased, extension-less paths classify as `(unknown)`.
pub fn resource_kind_from_path(path: &str) -> String {
    let filename = path.rsplit(['\\', '/']).next().unwrap_or(path);
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => "(unknown)".to_string(),
    }
}

/// Decodes the blackbox user stream. Returns `None` when the magic or
/// version mismatches or the stream is too short for its header.
pub fn decode(stream: &[u8], mo2: Option<&Mo2Index>) -> Option<BlackboxSnapshot> {
    if stream.len() < HEADER_SIZE {
        return None;
    }
    let magic: u32 = stream.pread_with(0, LE).ok()?;
    let version: u32 = stream.pread_with(4, LE).ok()?;
    if magic != BLACKBOX_MAGIC || !(1..=BLACKBOX_VERSION).contains(&version) {
        return None;
    }

    let pid: u32 = stream.pread_with(8, LE).ok()?;
    let mut capacity: u32 = stream.pread_with(12, LE).ok()?;
    let qpc_freq: u64 = stream.pread_with(16, LE).unwrap_or(0);
    let start_qpc: u64 = stream.pread_with(24, LE).unwrap_or(0);
    let flags: u32 = stream.pread_with(40, LE).unwrap_or(0);
    let write_index: u32 = stream.pread_with(44, LE).unwrap_or(0);

    if capacity == 0 || capacity > EVENT_CAPACITY {
        capacity = EVENT_CAPACITY;
    }
    let freq = if qpc_freq == 0 { 1 } else { qpc_freq };
    let to_ms = |qpc: u64| -> f64 {
        if qpc >= start_qpc {
            1000.0 * ((qpc - start_qpc) as f64) / (freq as f64)
        } else {
            0.0
        }
    };

    let mut snapshot = BlackboxSnapshot {
        pid,
        state_flags: flags,
        ..Default::default()
    };

    let begin = write_index.saturating_sub(capacity);
    let events_area = &stream[HEADER_SIZE..];
    let slots_present = (events_area.len() / EVENT_SIZE) as u32;
    let usable_cap = capacity.min(slots_present);
    if usable_cap > 0 {
        snapshot
            .events
            .reserve(write_index.saturating_sub(begin).min(usable_cap) as usize);
        for i in begin..write_index {
            let off = ((i % usable_cap) as usize) * EVENT_SIZE;
            if off + EVENT_SIZE > events_area.len() {
                continue;
            }
            let slot = &events_area[off..off + EVENT_SIZE];

            // Seqlock read protocol; the snapshot is immutable so the two
            // reads cannot differ here, but a writer caught mid-update at
            // capture time left an odd sequence behind.
            let seq1: u32 = slot.pread_with(0, LE).unwrap_or(1);
            if seq1 & 1 != 0 {
                continue;
            }
            let body = slot.to_vec();
            let seq2: u32 = slot.pread_with(0, LE).unwrap_or(1);
            if seq1 != seq2 || seq2 & 1 != 0 {
                continue;
            }

            let tid: u32 = body.pread_with(4, LE).unwrap_or(0);
            let qpc: u64 = body.pread_with(8, LE).unwrap_or(0);
            let ev_type: u16 = body.pread_with(16, LE).unwrap_or(0);
            if EventType::from_u16(ev_type).is_none() {
                continue;
            }
            snapshot.events.push(EventRow {
                index: i,
                t_ms: to_ms(qpc),
                tid,
                event_type: ev_type,
                type_name: event_type_name(ev_type).to_string(),
                a: body.pread_with(24, LE).unwrap_or(0),
                b: body.pread_with(32, LE).unwrap_or(0),
                c: body.pread_with(40, LE).unwrap_or(0),
                d: body.pread_with(48, LE).unwrap_or(0),
            });
        }
    }

    // Resource log tail (v2+), after the full event ring.
    let resources_off = HEADER_SIZE + (capacity as usize) * EVENT_SIZE;
    if stream.len() >= resources_off + 8 {
        let area = &stream[resources_off..];
        let r_write: u32 = area.pread_with(0, LE).unwrap_or(0);
        let entries_area = &area[8..];
        let r_slots = (entries_area.len() / RESOURCE_ENTRY_SIZE) as u32;
        let r_cap = RESOURCE_CAPACITY.min(r_slots);
        if r_cap > 0 {
            let r_begin = r_write.saturating_sub(r_cap);
            for i in r_begin..r_write {
                let off = ((i % r_cap) as usize) * RESOURCE_ENTRY_SIZE;
                if off + RESOURCE_ENTRY_SIZE > entries_area.len() {
                    continue;
                }
                let slot = &entries_area[off..off + RESOURCE_ENTRY_SIZE];
                let seq1: u32 = slot.pread_with(0, LE).unwrap_or(1);
                if seq1 & 1 != 0 {
                    continue;
                }
                let body = slot.to_vec();
                let seq2: u32 = slot.pread_with(0, LE).unwrap_or(1);
                if seq1 != seq2 || seq2 & 1 != 0 {
                    continue;
                }

                let tid: u32 = body.pread_with(4, LE).unwrap_or(0);
                let qpc: u64 = body.pread_with(8, LE).unwrap_or(0);
                let path_bytes = &body[24..24 + RESOURCE_PATH_MAX_BYTES];
                let len = path_bytes.iter().position(|&b| b == 0).unwrap_or(path_bytes.len());
                if len == 0 {
                    continue;
                }
                let path = String::from_utf8_lossy(&path_bytes[..len]).into_owned();
                let providers = mo2
                    .map(|idx| idx.providers(&path, 8))
                    .unwrap_or_default();
                snapshot.resources.push(ResourceRow {
                    t_ms: to_ms(qpc),
                    tid,
                    kind: resource_kind_from_path(&path),
                    is_conflict: providers.len() >= 2,
                    providers,
                    path,
                });
            }
        }
    }

    // Keep the most recent entries only.
    if snapshot.resources.len() > RESOURCE_KEEP_MAX {
        let drop = snapshot.resources.len() - RESOURCE_KEEP_MAX;
        snapshot.resources.drain(..drop);
    }

    Some(snapshot)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct SnapshotBuilder {
        pub pid: u32,
        pub state_flags: u32,
        pub capacity: u32,
        events: Vec<Vec<u8>>,
        resources: Vec<Vec<u8>>,
    }

    impl SnapshotBuilder {
        pub fn new(capacity: u32) -> Self {
            Self {
                pid: 4242,
                state_flags: 0,
                capacity,
                events: Vec::new(),
                resources: Vec::new(),
            }
        }

        pub fn event(mut self, seq: u32, tid: u32, qpc_ms: u64, ev_type: u16, a: u64) -> Self {
            let mut slot = vec![0u8; EVENT_SIZE];
            slot[0..4].copy_from_slice(&seq.to_le_bytes());
            slot[4..8].copy_from_slice(&tid.to_le_bytes());
            slot[8..16].copy_from_slice(&(qpc_ms * 10).to_le_bytes());
            slot[16..18].copy_from_slice(&ev_type.to_le_bytes());
            slot[24..32].copy_from_slice(&a.to_le_bytes());
            self.events.push(slot);
            self
        }

        pub fn resource(mut self, seq: u32, tid: u32, qpc_ms: u64, path: &str) -> Self {
            let mut slot = vec![0u8; RESOURCE_ENTRY_SIZE];
            slot[0..4].copy_from_slice(&seq.to_le_bytes());
            slot[4..8].copy_from_slice(&tid.to_le_bytes());
            slot[8..16].copy_from_slice(&(qpc_ms * 10).to_le_bytes());
            let bytes = path.as_bytes();
            let n = bytes.len().min(RESOURCE_PATH_MAX_BYTES - 1);
            slot[24..24 + n].copy_from_slice(&bytes[..n]);
            self.resources.push(slot);
            self
        }

        /// Serializes the snapshot stream. QPC frequency is 10 kHz so one
        /// builder "ms" tick equals one output millisecond.
        pub fn build(self) -> Vec<u8> {
            let mut out = vec![0u8; HEADER_SIZE];
            out[0..4].copy_from_slice(&BLACKBOX_MAGIC.to_le_bytes());
            out[4..8].copy_from_slice(&BLACKBOX_VERSION.to_le_bytes());
            out[8..12].copy_from_slice(&self.pid.to_le_bytes());
            out[12..16].copy_from_slice(&self.capacity.to_le_bytes());
            out[16..24].copy_from_slice(&10_000u64.to_le_bytes()); // qpc_freq
            out[24..32].copy_from_slice(&0u64.to_le_bytes()); // start_qpc
            out[40..44].copy_from_slice(&self.state_flags.to_le_bytes());
            out[44..48].copy_from_slice(&(self.events.len() as u32).to_le_bytes());

            for i in 0..self.capacity as usize {
                match self.events.get(i) {
                    Some(slot) => out.extend_from_slice(slot),
                    None => out.extend_from_slice(&[0u8; EVENT_SIZE]),
                }
            }

            out.extend_from_slice(&(self.resources.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            for slot in &self.resources {
                out.extend_from_slice(slot);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::SnapshotBuilder;
    use super::*;

    #[test]
    fn decodes_committed_events_only() {
        let stream = SnapshotBuilder::new(8)
            .event(2, 100, 1000, EventType::Heartbeat as u16, 0)
            .event(3, 100, 1500, EventType::Crash as u16, 0) // odd seq: torn write
            .event(4, 100, 2000, EventType::PerfHitch as u16, 2500)
            .event(2, 100, 2100, 999, 0) // invalid type
            .build();
        let snap = decode(&stream, None).unwrap();
        assert_eq!(snap.pid, 4242);
        assert_eq!(snap.events.len(), 2);
        assert_eq!(snap.events[0].type_name, "Heartbeat");
        assert_eq!(snap.events[1].type_name, "PerfHitch");
        assert_eq!(snap.events[1].a, 2500);
        assert!((snap.events[1].t_ms - 2000.0).abs() < 0.01);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut stream = SnapshotBuilder::new(4).build();
        stream[0] = 0;
        assert!(decode(&stream, None).is_none());
    }

    #[test]
    fn decodes_resource_tail_and_classifies_kind() {
        let stream = SnapshotBuilder::new(4)
            .event(2, 7, 100, EventType::Heartbeat as u16, 0)
            .resource(2, 7, 90, "meshes\\armor\\steel.nif")
            .resource(2, 7, 95, "sound\\fx\\boom.wav")
            .resource(5, 7, 99, "meshes\\torn.nif") // odd seq: dropped
            .build();
        let snap = decode(&stream, None).unwrap();
        assert_eq!(snap.resources.len(), 2);
        assert_eq!(snap.resources[0].kind, "nif");
        assert_eq!(snap.resources[1].kind, "wav");
    }

    #[test]
    fn resource_kind_edge_cases() {
        assert_eq!(resource_kind_from_path("a\\b\\c.NIF"), "nif");
        assert_eq!(resource_kind_from_path("noextension"), "(unknown)");
        assert_eq!(resource_kind_from_path("x.hkx"), "hkx");
    }
}
