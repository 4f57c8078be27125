//! Suspect scoring.
//!
//! Two modes over the same module table: callstack mode weights frames by
//! depth, stack-scan mode weights raw pointer-sized stack slots by
//! proximity to the stack pointer. Both filter out system and game-exe
//! modules, sort by `(score desc, first depth asc, filename asc)`, and
//! apply the hook-framework demotion policy: a hook framework at the top
//! is usually a victim frame owner, so a near-tied non-hook candidate is
//! promoted over it and the confidence drops one level.

use std::collections::HashMap;

use crate::i18n::{ConfidenceLevel, Language};
use crate::minidump::MinidumpView;
use crate::modules::ModuleIndex;
use crate::report::SuspectItem;
use crate::threads::ThreadIndex;

/// Suspects kept per mode.
const MAX_SUSPECTS: usize = 5;
/// Stack-scan budget per thread.
const MAX_SCAN_BYTES: usize = 96 * 1024;

/// Which signal produced the frames, and therefore which weight table,
/// promotion margin, and confidence thresholds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Callstack,
    StackScan,
}

impl FrameSource {
    fn weight(self, position: usize) -> u32 {
        match self {
            FrameSource::Callstack => match position {
                0 => 16,
                1 => 12,
                2 => 8,
                3..=5 => 4,
                6..=10 => 2,
                _ => 1,
            },
            FrameSource::StackScan => match position {
                0..=3 => 8,
                4..=15 => 4,
                16..=63 => 2,
                _ => 1,
            },
        }
    }

    /// Score margin within which a non-hook runner-up displaces a
    /// hook-framework leader.
    fn promotion_margin(self) -> u32 {
        match self {
            FrameSource::Callstack => 4,
            FrameSource::StackScan => 8,
        }
    }

    fn top_confidence(self, top: u32, second: u32, first_depth: usize) -> ConfidenceLevel {
        match self {
            FrameSource::Callstack => {
                if first_depth <= 2 && (top >= 24 || top >= second + 12) {
                    ConfidenceLevel::High
                } else if first_depth <= 6 && (top >= 12 || top >= second + 6) {
                    ConfidenceLevel::Medium
                } else {
                    ConfidenceLevel::Low
                }
            }
            FrameSource::StackScan => {
                if top >= 256 || (top >= 96 && top >= second * 2) {
                    ConfidenceLevel::High
                } else if top >= 40 {
                    ConfidenceLevel::Medium
                } else {
                    ConfidenceLevel::Low
                }
            }
        }
    }

    fn reason(self, lang: Language, score: u32, first_depth: usize) -> String {
        match (self, lang.is_english()) {
            (FrameSource::Callstack, true) => {
                format!("Callstack weight={score}, first depth={first_depth}")
            }
            (FrameSource::Callstack, false) => {
                format!("콜스택 상위 프레임에서 가중치={score}, 최초 깊이={first_depth}")
            }
            (FrameSource::StackScan, true) => format!("Observed {score} hit(s) in stack scan"),
            (FrameSource::StackScan, false) => format!("스택 스캔에서 {score}회 관측"),
        }
    }

    fn promotion_note(self, lang: Language) -> &'static str {
        match (self, lang.is_english()) {
            (FrameSource::Callstack, true) => {
                " (primary candidate promoted over hook framework frame owner)"
            }
            (FrameSource::Callstack, false) => " (훅 프레임워크 프레임 소유자보다 우선 후보로 승격)",
            (FrameSource::StackScan, true) => {
                " (primary candidate promoted over hook framework hit owner)"
            }
            (FrameSource::StackScan, false) => " (훅 프레임워크 히트 소유자보다 우선 후보로 승격)",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Row {
    mod_index: usize,
    score: u32,
    first_depth: usize,
}

/// Filenames promoted away from the top slot unconditionally when a
/// non-hook candidate exists: these hook into every callstack and their
/// frames prove nothing.
fn is_special_cased_hook_top(filename_lower: &str, source: FrameSource) -> bool {
    match source {
        FrameSource::Callstack => matches!(
            filename_lower,
            "crashloggersse.dll" | "crashlogger.dll" | "skse64_loader.dll" | "skse64_steam_loader.dll"
        ),
        FrameSource::StackScan => filename_lower == "crashloggersse.dll",
    }
}

fn rows_to_suspects(
    mut rows: Vec<Row>,
    modules: &ModuleIndex,
    source: FrameSource,
    lang: Language,
) -> Vec<SuspectItem> {
    if rows.is_empty() {
        return Vec::new();
    }

    rows.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.first_depth.cmp(&b.first_depth))
            .then_with(|| {
                let an = modules.get(a.mod_index).map(|m| m.filename.to_lowercase());
                let bn = modules.get(b.mod_index).map(|m| m.filename.to_lowercase());
                an.cmp(&bn)
            })
    });

    // Hook-framework demotion.
    let mut promoted_hook_top = false;
    let top_is_hook = modules
        .get(rows[0].mod_index)
        .is_some_and(|m| m.is_known_hook_framework);
    if rows.len() > 1 && top_is_hook {
        let fallback = rows[1..].iter().position(|r| {
            modules
                .get(r.mod_index)
                .is_some_and(|m| !m.is_known_hook_framework)
        });
        if let Some(rel) = fallback {
            let fb_index = rel + 1;
            let top_lower = modules
                .get(rows[0].mod_index)
                .map(|m| m.filename.to_lowercase())
                .unwrap_or_default();
            let special = is_special_cased_hook_top(&top_lower, source);
            let near_tie = rows[fb_index].score + source.promotion_margin() >= rows[0].score;
            if special || near_tie {
                rows.swap(0, fb_index);
                promoted_hook_top = true;
            }
        }
    }

    let top_score = rows[0].score;
    let second_score = rows.get(1).map_or(0, |r| r.score);
    let mut top_confidence = source.top_confidence(top_score, second_score, rows[0].first_depth);

    // A hook framework that stays on top is still suspect territory, just
    // weaker: it is often a victim of another mod's memory corruption.
    let final_top_is_hook = modules
        .get(rows[0].mod_index)
        .is_some_and(|m| m.is_known_hook_framework);
    if final_top_is_hook || promoted_hook_top {
        top_confidence = top_confidence.downgraded();
    }

    rows.iter()
        .take(MAX_SUSPECTS)
        .enumerate()
        .filter_map(|(i, row)| {
            let m = modules.get(row.mod_index)?;
            let mut reason = source.reason(lang, row.score, row.first_depth);
            if i == 0 && promoted_hook_top {
                reason.push_str(source.promotion_note(lang));
            }
            Some(SuspectItem {
                confidence: if i == 0 {
                    top_confidence
                } else {
                    ConfidenceLevel::Medium
                },
                module_filename: m.filename.clone(),
                module_path: m.path.clone(),
                inferred_mod_name: m.inferred_mod_name.clone(),
                score: row.score,
                reason,
            })
        })
        .collect()
}

/// Callstack mode: weight frames by depth, attribute to the owning module.
pub fn callstack_suspects(
    modules: &ModuleIndex,
    pcs: &[u64],
    lang: Language,
) -> Vec<SuspectItem> {
    if modules.is_empty() || pcs.is_empty() {
        return Vec::new();
    }

    let mut by_module: HashMap<usize, Row> = HashMap::new();
    for (depth, &pc) in pcs.iter().enumerate() {
        let Some(mi) = modules.find_index(pc) else {
            continue;
        };
        let m = &modules.modules()[mi];
        if m.is_system || m.is_game_exe {
            continue;
        }
        let w = FrameSource::Callstack.weight(depth);
        by_module
            .entry(mi)
            .and_modify(|row| {
                row.score += w;
                row.first_depth = row.first_depth.min(depth);
            })
            .or_insert(Row {
                mod_index: mi,
                score: w,
                first_depth: depth,
            });
    }

    rows_to_suspects(
        by_module.into_values().collect(),
        modules,
        FrameSource::Callstack,
        lang,
    )
}

/// Stack-scan mode: read the thread stacks as little-endian u64 values
/// starting at the reported SP and look each up in the module table.
pub fn stack_scan_suspects(
    view: &MinidumpView,
    threads: &ThreadIndex,
    modules: &ModuleIndex,
    target_tids: &[u32],
    lang: Language,
) -> Vec<SuspectItem> {
    if modules.is_empty() || target_tids.is_empty() {
        return Vec::new();
    }

    let mut by_module: HashMap<usize, Row> = HashMap::new();
    for &tid in target_tids {
        let Some(ctx) = threads.context(view, tid) else {
            continue;
        };
        let Some((stack_bytes, stack_base)) = threads.stack_bytes(view, tid) else {
            continue;
        };

        let start_off = if ctx.rsp >= stack_base
            && ctx.rsp < stack_base + stack_bytes.len() as u64
        {
            (ctx.rsp - stack_base) as usize
        } else {
            0
        };
        let end_off = stack_bytes.len().min(start_off + MAX_SCAN_BYTES);

        let mut off = start_off;
        while off + 8 <= end_off {
            let value = u64::from_le_bytes(stack_bytes[off..off + 8].try_into().unwrap());
            if let Some(mi) = modules.find_index(value) {
                let slot = (off - start_off) / 8;
                let w = FrameSource::StackScan.weight(slot);
                by_module
                    .entry(mi)
                    .and_modify(|row| {
                        row.score += w;
                        row.first_depth = row.first_depth.min(slot);
                    })
                    .or_insert(Row {
                        mod_index: mi,
                        score: w,
                        first_depth: slot,
                    });
            }
            off += 8;
        }
    }

    // System/game-exe hits contribute nothing to the ranking.
    let rows: Vec<Row> = by_module
        .into_values()
        .filter(|row| {
            modules
                .get(row.mod_index)
                .is_some_and(|m| !m.is_system && !m.is_game_exe)
        })
        .collect();

    rows_to_suspects(rows, modules, FrameSource::StackScan, lang)
}
