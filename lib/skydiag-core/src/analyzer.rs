//! The single-pass analysis orchestrator.
//!
//! One call turns one minidump (plus sidecars) into one owned
//! `AnalysisResult`. Stream discovery, module decoding, thread decoding,
//! exception parsing, and scoring happen in a fixed order so downstream
//! heuristics always see a consistent module table. Every sub-signal is
//! individually recoverable: a malformed stream disables that signal, a
//! failed symbol init degrades to stack scanning, and only a malformed
//! dump header aborts the pass.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::addressdb::AddressDb;
use crate::blackbox;
use crate::bucket;
use crate::crashlog;
use crate::evidence;
use crate::graphics::GraphicsRules;
use crate::history::{default_history_path, HistoryEntry, HistoryStore};
use crate::i18n::Language;
use crate::minidump::{stream_type, MinidumpView};
use crate::mo2::{self, Mo2Index};
use crate::modules::{self, ModuleIndex};
use crate::plugins::{self, PluginRules, PluginRulesContext, PluginScan};
use crate::report::{AnalysisResult, CrashLoggerReport};
use crate::scoring;
use crate::signatures::{SignatureDatabase, SignatureMatchInput};
use crate::stackwalk::{self, FormatCounters};
use crate::symbols::{ModuleSymbolInfo, SymbolSession};
use crate::threads::{read_context_at, ThreadContext, ThreadIndex};
use crate::wct;
use crate::Result;

/// Frames walked per candidate thread.
const WALK_FRAMES: usize = 64;
/// Frames kept for display and bucketing.
const DISPLAY_FRAMES: usize = 12;
/// WCT candidate threads considered.
const WCT_CANDIDATES: usize = 8;
/// History window for per-module stats.
const HISTORY_STATS_WINDOW: usize = 20;

/// Per-pass configuration supplied by the driver.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub out_dir: Option<PathBuf>,
    pub language: Language,
    pub allow_online_symbols: bool,
    /// Disables path redaction in the report output.
    pub debug: bool,
    /// Directory holding the rule databases (`crash_signatures.json` etc).
    pub data_dir: Option<PathBuf>,
    /// Game version override for the address database
    /// (`SKYRIMDIAG_GAME_VERSION`); defaults to the plugin scan's record.
    pub game_version: Option<String>,
    /// History file override; defaults to the per-user data directory.
    pub history_path: Option<PathBuf>,
    /// Skip history load/append entirely (tests, one-shot runs).
    pub disable_history: bool,
}

/// Analyzes one dump. Fatal only on I/O failure or a malformed dump
/// header; every other missing signal degrades gracefully.
pub fn analyze(dump_path: &Path, opts: &AnalyzeOptions) -> Result<AnalysisResult> {
    let mut r = AnalysisResult {
        dump_path: dump_path.to_path_buf(),
        out_dir: opts.out_dir.clone(),
        language: opts.language,
        ..Default::default()
    };

    if let Some(data_dir) = &opts.data_dir {
        modules::load_hook_frameworks_from_json(&data_dir.join("hook_frameworks.json"));
    }

    let view = MinidumpView::open(dump_path)?;
    let module_index = ModuleIndex::load(&view);
    let thread_index = ThreadIndex::load(&view);
    debug!(
        "dump opened: {} modules, {} threads",
        module_index.len(),
        thread_index.records().len()
    );

    let module_paths = module_index.paths();
    let mo2_index = Mo2Index::from_module_paths(&module_paths);
    let mo2_base = mo2::infer_base_dir_from_module_paths(&module_paths);

    // Exception stream.
    let mut exc_ctx: Option<ThreadContext> = None;
    if let Some(exc) = view.exception() {
        r.exc_code = exc.code;
        r.exc_tid = exc.thread_id;
        r.exc_addr = exc.address;
        r.exc_info = exc.info.clone();
        exc_ctx = read_context_at(&view, exc.context_rva, exc.context_size);
    }

    // Fault module.
    if r.exc_addr != 0 {
        if let Some(m) = module_index.find(r.exc_addr) {
            r.fault_module_path = m.path.clone();
            r.fault_module_filename = m.filename.clone();
            r.fault_module_plus_offset = m.plus_offset(r.exc_addr);
            r.fault_module_offset = r.exc_addr - m.base;
            r.fault_module_is_system = m.is_system;
            r.fault_module_is_game_exe = m.is_game_exe;
            r.fault_module_is_hook_framework = m.is_known_hook_framework;
            r.inferred_mod_name = m.inferred_mod_name.clone();
        }
    }

    // Blackbox snapshot (optional user stream).
    if let Some(stream) = view.find_stream(stream_type::USER_BLACKBOX) {
        if let Some(snapshot) = blackbox::decode(stream, mo2_index.as_ref()) {
            r.has_blackbox = true;
            r.pid = snapshot.pid;
            r.state_flags = snapshot.state_flags;
            r.events = snapshot.events;
            r.resources = snapshot.resources;
        }
    }

    // Embedded wait-chain document (optional user stream).
    if let Some(stream) = view.find_stream(stream_type::USER_WCT_JSON) {
        if !stream.is_empty() {
            r.has_wct = true;
            r.wct_json = String::from_utf8_lossy(stream).into_owned();
        }
    }

    let hang_like = precheck_hang_like(&r);

    // Crash Logger sidecar. Manual snapshot dumps include WCT even when
    // the game is fine, so only search when the capture looks real.
    let dump_name_lower = dump_path
        .file_name()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let should_search_log =
        r.exc_code != 0 || dump_name_lower.contains("_crash_") || hang_like;
    if should_search_log {
        r.crash_logger = collect_crash_logger(dump_path, mo2_base.as_deref(), &module_index);
    }

    // Plugin-scan sidecar and rules.
    let plugin_scan = find_plugin_scan(dump_path);
    if let Some(scan) = &plugin_scan {
        r.game_exe_version = opts
            .game_version
            .clone()
            .unwrap_or_else(|| scan.game_exe_version.clone());
        r.missing_masters = scan.missing_masters();
        r.needs_bees = plugins::needs_bees(
            scan,
            &r.game_exe_version,
            module_index.has_filename("bees.dll"),
        );
        if let Some(data_dir) = &opts.data_dir {
            match PluginRules::load(&data_dir.join("plugin_rules.json")) {
                Ok(rules) => {
                    let loaded = module_index.filenames();
                    let ctx = PluginRulesContext {
                        scan,
                        game_version: &r.game_exe_version,
                        loaded_module_filenames: &loaded,
                        missing_masters: &r.missing_masters,
                    };
                    r.plugin_diagnostics = rules.evaluate(&ctx, opts.language);
                }
                Err(err) => debug!("plugin rules unavailable: {err}"),
            }
        }
    } else if let Some(game_version) = &opts.game_version {
        r.game_exe_version = game_version.clone();
    }

    // Graphics injection rules.
    if let Some(data_dir) = &opts.data_dir {
        match GraphicsRules::load(&data_dir.join("graphics_rules.json")) {
            Ok(rules) => {
                r.graphics_diag = rules.diagnose(
                    &module_index.filenames(),
                    &r.fault_module_filename,
                    opts.language,
                );
            }
            Err(err) => debug!("graphics rules unavailable: {err}"),
        }
    }

    // Address database: engine function names for game-exe faults.
    if r.fault_module_is_game_exe && !r.game_exe_version.is_empty() {
        if let Some(data_dir) = &opts.data_dir {
            let db_path = data_dir.join("address_db").join("skyrimse_functions.json");
            match AddressDb::load(&db_path, &r.game_exe_version) {
                Ok(db) => {
                    r.resolved_function = db.resolve(r.fault_module_offset).map(String::from);
                }
                Err(err) => debug!("address db unavailable: {err}"),
            }
        }
    }

    // Suspects: stackwalk first, stack scan as fallback.
    let should_analyze_stacks = r.exc_tid != 0 || hang_like;
    if should_analyze_stacks && !module_index.is_empty() {
        let mut tids: Vec<u32> = Vec::new();
        if r.exc_tid != 0 {
            tids.push(r.exc_tid);
        } else if r.has_wct {
            tids = wct::candidate_thread_ids(&r.wct_json, WCT_CANDIDATES);
        }
        if r.has_blackbox {
            if let Some(main_tid) = infer_main_thread(&r.events) {
                tids.push(main_tid);
            }
        }
        tids.sort_unstable();
        tids.dedup();

        if !tids.is_empty() {
            let walked = compute_stackwalk_suspects(
                &view,
                &module_index,
                &thread_index,
                &tids,
                exc_ctx,
                opts,
                &mut r,
            );
            if !walked {
                r.suspects_from_stackwalk = false;
                r.suspects = scoring::stack_scan_suspects(
                    &view,
                    &thread_index,
                    &module_index,
                    &tids,
                    opts.language,
                );
            }
            apply_crash_logger_boost(&mut r, opts.language);
        }
    }

    // Signature database match.
    if let Some(data_dir) = &opts.data_dir {
        match SignatureDatabase::load(&data_dir.join("crash_signatures.json")) {
            Ok(db) => {
                let mut callstack = r.stackwalk_primary_frames.clone();
                callstack.extend(r.crash_logger.top_modules.iter().cloned());
                let input = SignatureMatchInput {
                    exc_code: r.exc_code,
                    fault_module: &r.fault_module_filename,
                    fault_offset: r.fault_module_offset,
                    fault_module_is_system: r.fault_module_is_system,
                    exc_address: r.exc_addr,
                    callstack: &callstack,
                };
                r.signature_match = db.find_match(&input, opts.language);
            }
            Err(err) => debug!("signature database unavailable: {err}"),
        }
    }

    // Stable bucket key, then history statistics.
    r.crash_bucket_key = bucket::compute_result_bucket_key(&r);
    if !opts.disable_history {
        update_history(&mut r, opts);
    }

    evidence::build_evidence_and_summary(&mut r);
    info!("analysis complete: {}", r.summary_sentence);
    Ok(r)
}

/// Pre-classification used before the evidence pass to decide whether
/// stack analysis and crash-log discovery are worth doing.
fn precheck_hang_like(r: &AnalysisResult) -> bool {
    let name_hang = r
        .dump_path
        .file_name()
        .map(|s| s.to_string_lossy().to_lowercase().contains("_hang_"))
        .unwrap_or(false);
    let has_hang_event = r
        .events
        .iter()
        .any(|e| e.event_type == blackbox::EventType::HangMark as u16);

    if r.has_wct {
        let info = wct::summarize(&r.wct_json);
        let cap_says_hang = info.as_ref().is_some_and(|w| w.suggests_hang());
        let mut hang_like = match &info {
            Some(w) if w.capture.is_some() => cap_says_hang,
            _ => name_hang,
        };
        if has_hang_event {
            hang_like = true;
        }
        // Manual hotkey dumps are sometimes named "_Hang_" even when the
        // game is fine; a fresh heartbeat overrides the name.
        if !cap_says_hang && !has_hang_event && r.has_blackbox {
            if let Some(age) = evidence::heartbeat_age_sec(r) {
                if age < 5.0 {
                    hang_like = false;
                }
            }
        }
        hang_like
    } else {
        name_hang || has_hang_event
    }
}

/// The main thread is whichever thread produced the latest heartbeat.
fn infer_main_thread(events: &[crate::report::EventRow]) -> Option<u32> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == blackbox::EventType::Heartbeat as u16 && e.tid != 0)
        .map(|e| e.tid)
}

fn collect_crash_logger(
    dump_path: &Path,
    mo2_base: Option<&Path>,
    module_index: &ModuleIndex,
) -> CrashLoggerReport {
    let mut out = CrashLoggerReport::default();
    let Some(log_path) = crashlog::find_log_for_dump(dump_path, mo2_base) else {
        return out;
    };
    out.log_path = log_path.display().to_string();

    let Ok(text) = std::fs::read_to_string(&log_path) else {
        return out;
    };
    out.version = crashlog::parse_version(&text).unwrap_or_default();

    // Map lowercase log tokens back to the dump's canonical casing.
    let canonical: std::collections::HashMap<String, String> = module_index
        .modules()
        .iter()
        .map(|m| (m.filename.to_lowercase(), m.filename.clone()))
        .collect();
    out.top_modules = crashlog::parse_top_modules(&text)
        .into_iter()
        .map(|lower| canonical.get(&lower).cloned().unwrap_or(lower))
        .collect();

    if let Some(details) = crashlog::parse_cpp_exception(&text) {
        out.cpp_exception_type = details.exc_type;
        out.cpp_exception_info = details.info;
        out.cpp_exception_throw_location = details.throw_location;
        out.cpp_exception_module = details.module;
    }
    out
}

/// `<stem>_SkyrimDiagPlugins.json` next to the dump, else a shared
/// `SkyrimDiagPlugins.json` in the dump's directory.
fn find_plugin_scan(dump_path: &Path) -> Option<PluginScan> {
    let dir = dump_path.parent()?;
    let stem = dump_path.file_stem()?.to_string_lossy();
    let candidates = [
        dir.join(format!("{stem}_SkyrimDiagPlugins.json")),
        dir.join("SkyrimDiagPlugins.json"),
    ];
    for path in candidates {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Some(scan) = PluginScan::from_json(&text) {
            debug!("plugin scan loaded from {:?}", path);
            return Some(scan);
        }
    }
    None
}

/// Walks each candidate thread, scores the frames, and keeps the best
/// candidate (the exception thread wins ties). Returns false when no
/// thread produced suspects, leaving partial frames for display.
fn compute_stackwalk_suspects(
    view: &MinidumpView,
    module_index: &ModuleIndex,
    thread_index: &ThreadIndex,
    tids: &[u32],
    exc_ctx: Option<ThreadContext>,
    opts: &AnalyzeOptions,
    r: &mut AnalysisResult,
) -> bool {
    let mem = view.memory_view(thread_index.records());
    if mem.is_empty() {
        return false;
    }

    let sym_infos: Vec<ModuleSymbolInfo> = module_index
        .modules()
        .iter()
        .map(|m| ModuleSymbolInfo {
            filename: m.filename.clone(),
            base: m.base,
            end: m.end,
            pdb_record: view.codeview_pdb_record(m.cv_rva, m.cv_size),
        })
        .collect();
    let session = match SymbolSession::initialize(&sym_infos, opts.allow_online_symbols) {
        Ok(s) => {
            r.symbols.search_path = s.search_path.clone();
            r.symbols.cache_path = s.cache_path.display().to_string();
            r.symbols.online_allowed = s.online_allowed;
            r.symbols.online_used = s.online_used;
            Some(s)
        }
        Err(err) => {
            warn!("symbolication unavailable: {err}");
            r.symbols.online_allowed = opts.allow_online_symbols;
            None
        }
    };

    struct Candidate {
        tid: u32,
        pcs: Vec<u64>,
        suspects: Vec<crate::report::SuspectItem>,
        top_score: u32,
    }
    let mut best: Option<Candidate> = None;
    let mut best_any: (u32, Vec<u64>) = (0, Vec::new());

    for &tid in tids {
        let ctx = if tid != 0 && tid == r.exc_tid && exc_ctx.is_some() {
            exc_ctx.unwrap()
        } else {
            match thread_index.context(view, tid) {
                Some(c) => c,
                None => continue,
            }
        };
        if ctx.rip == 0 || ctx.rsp == 0 {
            continue;
        }

        let pcs = stackwalk::walk(&ctx, &mem, module_index, WALK_FRAMES);
        if pcs.is_empty() {
            continue;
        }
        if best_any.1.len() < pcs.len() {
            best_any = (tid, pcs.clone());
        }

        let suspects = scoring::callstack_suspects(module_index, &pcs, opts.language);
        if suspects.is_empty() {
            continue;
        }
        let top_score = suspects[0].score;
        let prefer = best.as_ref().is_some_and(|b| b.tid != r.exc_tid) && tid == r.exc_tid;
        let better = best.as_ref().is_none_or(|b| prefer || top_score > b.top_score);
        if better {
            best = Some(Candidate {
                tid,
                pcs,
                suspects,
                top_score,
            });
        }
    }

    let mut counters = FormatCounters::default();
    match best {
        Some(candidate) => {
            r.suspects_from_stackwalk = true;
            r.suspects = candidate.suspects;
            r.stackwalk_primary_tid = candidate.tid;
            r.stackwalk_primary_frames = stackwalk::format_callstack(
                module_index,
                session.as_ref(),
                &candidate.pcs,
                DISPLAY_FRAMES,
                &mut counters,
            );
            r.symbols.total_frames = counters.total;
            r.symbols.symbolized_frames = counters.symbolized;
            r.symbols.source_line_frames = counters.source_line;
            true
        }
        None => {
            if !best_any.1.is_empty() {
                r.stackwalk_primary_tid = best_any.0;
                r.stackwalk_primary_frames = stackwalk::format_callstack(
                    module_index,
                    session.as_ref(),
                    &best_any.1,
                    DISPLAY_FRAMES,
                    &mut counters,
                );
                r.symbols.total_frames = counters.total;
                r.symbols.symbolized_frames = counters.symbolized;
                r.symbols.source_line_frames = counters.source_line;
            }
            false
        }
    }
}

/// Raises the top suspect to High confidence when the Crash Logger log
/// corroborates it.
fn apply_crash_logger_boost(r: &mut AnalysisResult, lang: Language) {
    let Some(top) = r.suspects.first() else {
        return;
    };
    let top_lower = top.module_filename.to_lowercase();
    let en = lang.is_english();

    let in_log_stack = r
        .crash_logger
        .top_modules
        .iter()
        .any(|m| m.to_lowercase() == top_lower);
    if in_log_stack {
        let top = &mut r.suspects[0];
        top.confidence = crate::i18n::ConfidenceLevel::High;
        top.reason.push_str(if en {
            " (also in Crash Logger callstack)"
        } else {
            " (Crash Logger 콜스택에도 등장)"
        });
        return;
    }

    if !r.crash_logger.cpp_exception_module.is_empty()
        && r.crash_logger.cpp_exception_module.to_lowercase() == top_lower
    {
        let top = &mut r.suspects[0];
        top.confidence = crate::i18n::ConfidenceLevel::High;
        top.reason.push_str(if en {
            " (Crash Logger C++ exception module)"
        } else {
            " (Crash Logger C++ 예외 모듈)"
        });
    }
}

fn update_history(r: &mut AnalysisResult, opts: &AnalyzeOptions) {
    let Some(path) = opts.history_path.clone().or_else(default_history_path) else {
        return;
    };
    let mut store = HistoryStore::load(&path);
    store.append(HistoryEntry {
        timestamp_utc: Utc::now().to_rfc3339(),
        dump_file: r
            .dump_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        bucket_key: r.crash_bucket_key.clone(),
        top_suspect: r
            .suspects
            .first()
            .map(|s| s.module_filename.clone())
            .unwrap_or_default(),
        confidence: r
            .suspects
            .first()
            .map(|s| s.confidence.label(Language::English).to_string())
            .unwrap_or_default(),
        signature_id: r
            .signature_match
            .as_ref()
            .map(|m| m.id.clone())
            .unwrap_or_default(),
        all_suspects: r.suspects.iter().map(|s| s.module_filename.clone()).collect(),
    });
    r.history_stats = store.module_stats(HISTORY_STATS_WINDOW);
    r.history_correlation = store.bucket_stats(&r.crash_bucket_key);
    if let Err(err) = store.save(&path) {
        warn!("history not persisted: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::EventRow;

    #[test]
    fn infer_main_thread_uses_latest_heartbeat() {
        let events = vec![
            EventRow {
                event_type: blackbox::EventType::Heartbeat as u16,
                tid: 10,
                t_ms: 100.0,
                ..Default::default()
            },
            EventRow {
                event_type: blackbox::EventType::Heartbeat as u16,
                tid: 20,
                t_ms: 200.0,
                ..Default::default()
            },
            EventRow {
                event_type: blackbox::EventType::Note as u16,
                tid: 30,
                t_ms: 300.0,
                ..Default::default()
            },
        ];
        assert_eq!(infer_main_thread(&events), Some(20));
        assert_eq!(infer_main_thread(&[]), None);
    }

    #[test]
    fn hang_precheck_from_name_without_wct() {
        let r = AnalysisResult {
            dump_path: PathBuf::from("SkyrimSE_Hang_20260101_000000.dmp"),
            ..Default::default()
        };
        assert!(precheck_hang_like(&r));

        let r2 = AnalysisResult {
            dump_path: PathBuf::from("SkyrimSE_Crash_20260101_000000.dmp"),
            ..Default::default()
        };
        assert!(!precheck_hang_like(&r2));
    }

    #[test]
    fn missing_dump_file_is_io_error() {
        let opts = AnalyzeOptions {
            disable_history: true,
            ..Default::default()
        };
        let err = analyze(Path::new("/nonexistent/nope.dmp"), &opts).unwrap_err();
        assert!(matches!(err, crate::DiagError::Io(_)));
    }
}
