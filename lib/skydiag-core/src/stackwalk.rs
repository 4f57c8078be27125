//! Bounded stack walking over the dump's memory view.
//!
//! Without access to unwind tables the walker uses the classic two-step
//! strategy: follow the frame-pointer chain while it stays plausible, and
//! fall back to scanning the stack for the next value that looks like a
//! return address (an address inside some loaded module). Either way the
//! iteration is bounded and terminates when the PC goes to zero, stops
//! changing, or leaves recoverable state.

use crate::minidump::MemoryView;
use crate::modules::ModuleIndex;
use crate::symbols::SymbolSession;
use crate::threads::ThreadContext;

/// Hard cap on frames returned by one walk.
pub const MAX_FRAMES: usize = 128;

/// Stack slots probed during the scan fallback before giving up.
const SCAN_SLOTS: usize = 64;

/// Walks frames for one CPU context, returning program counters.
///
/// All returned PCs are non-zero and the result length is at most
/// `max_frames.min(MAX_FRAMES)`. A walk that fails after the first frame
/// returns what was collected.
pub fn walk(
    ctx: &ThreadContext,
    mem: &MemoryView<'_>,
    modules: &ModuleIndex,
    max_frames: usize,
) -> Vec<u64> {
    let mut pcs = Vec::new();
    let limit = max_frames.min(MAX_FRAMES);
    if limit == 0 || ctx.rip == 0 {
        return pcs;
    }

    let mut pc = ctx.rip;
    let mut sp = ctx.rsp;
    let mut fp = ctx.rbp;

    for _ in 0..limit {
        if pc == 0 {
            break;
        }
        pcs.push(pc);

        let prev_pc = pc;
        let mut advanced = false;

        // Frame-pointer chain: [fp] = caller fp, [fp+8] = return address.
        if fp != 0 && fp >= sp {
            if let (Some(saved_fp), Some(ret_addr)) = (mem.read_u64(fp), mem.read_u64(fp + 8)) {
                if ret_addr != 0 && modules.find(ret_addr).is_some() && saved_fp > fp {
                    pc = ret_addr;
                    sp = fp + 16;
                    fp = saved_fp;
                    advanced = true;
                }
            }
        }

        // Scan fallback: next plausible return address above SP.
        if !advanced {
            let mut probe = sp;
            for _ in 0..SCAN_SLOTS {
                let Some(value) = mem.read_u64(probe) else {
                    break;
                };
                if value != 0 && value != prev_pc && modules.find(value).is_some() {
                    pc = value;
                    sp = probe + 8;
                    if fp < sp {
                        fp = 0;
                    }
                    advanced = true;
                    break;
                }
                probe += 8;
            }
        }

        if !advanced || pc == prev_pc {
            break;
        }
    }

    pcs
}

/// Per-frame symbolication counters for audit.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatCounters {
    pub total: u32,
    pub symbolized: u32,
    pub source_line: u32,
}

/// Formats one PC: `module!symbol+0xHEX` when symbols resolve, else
/// `module+0xHEX`, else the bare address.
pub fn format_frame(
    modules: &ModuleIndex,
    symbols: Option<&SymbolSession>,
    addr: u64,
    counters: &mut FormatCounters,
) -> String {
    counters.total += 1;
    if let Some(session) = symbols {
        if let Some(sym) = session.resolve(addr) {
            counters.symbolized += 1;
            let prefix = modules
                .find(addr)
                .map(|m| format!("{}!", m.filename))
                .unwrap_or_default();
            return format!("{}{}+0x{:x}", prefix, sym.name, sym.displacement);
        }
    }
    modules.format_module_plus_offset(addr)
}

/// Formats a callstack for display, skipping the system/game-exe prologue:
/// the window starts two frames above the first non-system frame.
pub fn format_callstack(
    modules: &ModuleIndex,
    symbols: Option<&SymbolSession>,
    pcs: &[u64],
    max_frames: usize,
    counters: &mut FormatCounters,
) -> Vec<String> {
    if pcs.is_empty() || max_frames == 0 {
        return Vec::new();
    }

    let first_non_system = pcs
        .iter()
        .position(|&pc| {
            modules
                .find(pc)
                .is_some_and(|m| !m.is_system && !m.is_game_exe)
        })
        .unwrap_or(pcs.len());

    let start = if first_non_system != pcs.len() && first_non_system > 2 {
        first_non_system - 2
    } else {
        0
    };
    let end = pcs.len().min(start + max_frames);
    pcs[start..end]
        .iter()
        .map(|&pc| format_frame(modules, symbols, pc, counters))
        .collect()
}
