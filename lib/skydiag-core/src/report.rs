//! Owned analysis result types.
//!
//! Everything in here is owned data: the memory-mapped dump and all of its
//! borrowed slices are gone by the time an `AnalysisResult` leaves the
//! analyzer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::i18n::{ConfidenceLevel, Language};

/// A candidate module ranked above the OS and the game executable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuspectItem {
    pub confidence: ConfidenceLevel,
    pub module_filename: String,
    pub module_path: String,
    pub inferred_mod_name: String,
    pub score: u32,
    pub reason: String,
}

impl SuspectItem {
    /// `ModName (file.dll)` when an MO2 mod name is known, else the bare
    /// filename.
    pub fn display_name(&self) -> String {
        if self.inferred_mod_name.is_empty() {
            self.module_filename.clone()
        } else {
            format!("{} ({})", self.inferred_mod_name, self.module_filename)
        }
    }
}

/// One localized evidence row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub confidence: ConfidenceLevel,
    pub title: String,
    pub details: String,
}

/// A signature-database hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub id: String,
    pub cause: String,
    pub confidence: ConfidenceLevel,
    pub recommendations: Vec<String>,
}

/// A graphics-injection rule hit (ENB / ReShade / DXVK and friends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsDiagnosis {
    pub rule_id: String,
    pub cause: String,
    pub confidence: ConfidenceLevel,
    pub recommendations: Vec<String>,
}

/// A plugin-rules hit (load-order problems).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDiagnosis {
    pub rule_id: String,
    pub cause: String,
    pub confidence: ConfidenceLevel,
    pub recommendations: Vec<String>,
}

/// One decoded blackbox event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventRow {
    pub index: u32,
    pub t_ms: f64,
    pub tid: u32,
    #[serde(rename = "type")]
    pub event_type: u16,
    pub type_name: String,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

/// One decoded resource-log entry with MO2 provider attribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRow {
    pub t_ms: f64,
    pub tid: u32,
    /// `nif`/`hkx`/`tri`, another lowercase extension, or `(unknown)`.
    pub kind: String,
    pub path: String,
    pub providers: Vec<String>,
    pub is_conflict: bool,
}

/// Crash Logger SSE/AE sidecar pass-throughs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashLoggerReport {
    pub log_path: String,
    pub version: String,
    pub top_modules: Vec<String>,
    pub cpp_exception_type: String,
    pub cpp_exception_info: String,
    pub cpp_exception_throw_location: String,
    pub cpp_exception_module: String,
}

impl CrashLoggerReport {
    pub fn has_cpp_exception(&self) -> bool {
        !self.cpp_exception_type.is_empty()
            || !self.cpp_exception_info.is_empty()
            || !self.cpp_exception_throw_location.is_empty()
            || !self.cpp_exception_module.is_empty()
    }
}

/// Per-module crash-history statistics over the last N entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleStats {
    pub module_name: String,
    pub total_appearances: u32,
    pub as_top_suspect: u32,
    pub total_crashes: u32,
}

/// Bucket repetition statistics over the whole history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketStats {
    pub count: u32,
    pub first_seen: String,
    pub last_seen: String,
}

/// Symbolication provenance for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolProvenance {
    pub search_path: String,
    pub cache_path: String,
    pub online_allowed: bool,
    pub online_used: bool,
    pub total_frames: u32,
    pub symbolized_frames: u32,
    pub source_line_frames: u32,
}

/// The single value produced by one analysis pass.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub dump_path: PathBuf,
    pub out_dir: Option<PathBuf>,
    pub language: Language,

    pub pid: u32,
    pub state_flags: u32,

    pub exc_code: u32,
    pub exc_tid: u32,
    pub exc_addr: u64,
    pub exc_info: Vec<u64>,

    pub fault_module_path: String,
    pub fault_module_filename: String,
    pub fault_module_plus_offset: String,
    pub fault_module_offset: u64,
    pub fault_module_is_system: bool,
    pub fault_module_is_game_exe: bool,
    pub fault_module_is_hook_framework: bool,
    pub inferred_mod_name: String,

    pub game_exe_version: String,

    pub crash_logger: CrashLoggerReport,

    pub suspects: Vec<SuspectItem>,
    pub suspects_from_stackwalk: bool,

    pub stackwalk_primary_tid: u32,
    pub stackwalk_primary_frames: Vec<String>,

    pub symbols: SymbolProvenance,

    pub has_blackbox: bool,
    pub events: Vec<EventRow>,
    pub resources: Vec<ResourceRow>,

    pub has_wct: bool,
    pub wct_json: String,

    pub signature_match: Option<SignatureMatch>,
    pub graphics_diag: Option<GraphicsDiagnosis>,
    pub plugin_diagnostics: Vec<PluginDiagnosis>,
    pub missing_masters: Vec<String>,
    pub needs_bees: bool,
    /// Engine function name resolved from the address database when the
    /// fault module is the game executable.
    pub resolved_function: Option<String>,

    pub history_stats: Vec<ModuleStats>,
    pub history_correlation: BucketStats,

    pub summary_sentence: String,
    pub evidence: Vec<EvidenceItem>,
    pub recommendations: Vec<String>,
    pub crash_bucket_key: String,
}

impl AnalysisResult {
    pub fn has_exception(&self) -> bool {
        self.exc_code != 0
    }

    pub fn has_fault_module(&self) -> bool {
        !self.fault_module_filename.is_empty()
    }
}
