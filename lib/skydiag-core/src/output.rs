//! Output artifacts: the schema-versioned summary JSON, the
//! human-readable report, the blackbox event JSONL, and the embedded WCT
//! copy. Writes are single-file full-overwrite; the engine is idempotent
//! on a fresh input, so a partial write is repaired by re-running.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::i18n::Language;
use crate::report::AnalysisResult;
use crate::{DiagError, Result};

pub const SCHEMA_NAME: &str = "SkyrimDiagSummary";
pub const SCHEMA_VERSION: u32 = 2;
/// Consumers must accept these schema versions.
pub const ACCEPTED_SCHEMA_VERSIONS: &[u32] = &[1, 2];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySchema {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryException {
    pub code: u32,
    pub thread_id: u32,
    pub address: u64,
    pub module_plus_offset: String,
    pub module_path: String,
    pub inferred_mod_name: String,
    pub fault_module_unknown: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryCppException {
    pub r#type: String,
    pub info: String,
    pub throw_location: String,
    pub module: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryCrashLogger {
    pub log_path: String,
    pub version: String,
    pub top_modules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpp_exception: Option<SummaryCppException>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySuspect {
    pub confidence: String,
    pub module_filename: String,
    pub module_path: String,
    pub inferred_mod_name: String,
    pub score: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryCallstack {
    pub thread_id: u32,
    pub frames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResource {
    pub t_ms: f64,
    pub tid: u32,
    pub kind: String,
    pub path: String,
    pub providers: Vec<String>,
    pub is_conflict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryEvidence {
    pub confidence: String,
    pub title: String,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySymbols {
    pub search_path: String,
    pub cache_path: String,
    pub online_allowed: bool,
    pub online_used: bool,
    pub total_frames: u32,
    pub symbolized_frames: u32,
}

/// The stable summary document written next to the dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryDoc {
    pub schema: SummarySchema,
    pub dump_path: String,
    pub pid: u32,
    pub state_flags: u32,
    pub language: String,
    pub summary_sentence: String,
    pub crash_bucket_key: String,
    pub exception: SummaryException,
    pub crash_logger: SummaryCrashLogger,
    pub suspects: Vec<SummarySuspect>,
    pub callstack: SummaryCallstack,
    pub resources: Vec<SummaryResource>,
    pub evidence: Vec<SummaryEvidence>,
    pub recommendations: Vec<String>,
    pub symbols: SummarySymbols,
}

impl SummaryDoc {
    pub fn accepts_schema(version: u32) -> bool {
        ACCEPTED_SCHEMA_VERSIONS.contains(&version)
    }
}

/// Replaces the user-profile prefix in a path-ish string unless the run
/// opted out of redaction.
fn redact_path(value: &str, home: Option<&str>, redact: bool) -> String {
    if !redact {
        return value.to_string();
    }
    match home {
        Some(home) if !home.is_empty() && value.starts_with(home) => {
            format!("~{}", &value[home.len()..])
        }
        _ => value.to_string(),
    }
}

/// Builds the summary document from a result.
pub fn build_summary(r: &AnalysisResult, redact: bool) -> SummaryDoc {
    let lang: Language = r.language;
    let home = dirs::home_dir().map(|p| p.display().to_string());
    let home = home.as_deref();
    let label = |c: crate::i18n::ConfidenceLevel| c.label(lang).to_string();

    SummaryDoc {
        schema: SummarySchema {
            name: SCHEMA_NAME.to_string(),
            version: SCHEMA_VERSION,
        },
        dump_path: redact_path(&r.dump_path.display().to_string(), home, redact),
        pid: r.pid,
        state_flags: r.state_flags,
        language: lang.code().to_string(),
        summary_sentence: r.summary_sentence.clone(),
        crash_bucket_key: r.crash_bucket_key.clone(),
        exception: SummaryException {
            code: r.exc_code,
            thread_id: r.exc_tid,
            address: r.exc_addr,
            module_plus_offset: r.fault_module_plus_offset.clone(),
            module_path: redact_path(&r.fault_module_path, home, redact),
            inferred_mod_name: r.inferred_mod_name.clone(),
            fault_module_unknown: r.exc_addr != 0 && r.fault_module_filename.is_empty(),
        },
        crash_logger: SummaryCrashLogger {
            log_path: redact_path(&r.crash_logger.log_path, home, redact),
            version: r.crash_logger.version.clone(),
            top_modules: r.crash_logger.top_modules.clone(),
            cpp_exception: r.crash_logger.has_cpp_exception().then(|| SummaryCppException {
                r#type: r.crash_logger.cpp_exception_type.clone(),
                info: r.crash_logger.cpp_exception_info.clone(),
                throw_location: r.crash_logger.cpp_exception_throw_location.clone(),
                module: r.crash_logger.cpp_exception_module.clone(),
            }),
        },
        suspects: r
            .suspects
            .iter()
            .map(|s| SummarySuspect {
                confidence: label(s.confidence),
                module_filename: s.module_filename.clone(),
                module_path: redact_path(&s.module_path, home, redact),
                inferred_mod_name: s.inferred_mod_name.clone(),
                score: s.score,
                reason: s.reason.clone(),
            })
            .collect(),
        callstack: SummaryCallstack {
            thread_id: r.stackwalk_primary_tid,
            frames: r.stackwalk_primary_frames.clone(),
        },
        resources: r
            .resources
            .iter()
            .map(|rr| SummaryResource {
                t_ms: rr.t_ms,
                tid: rr.tid,
                kind: rr.kind.clone(),
                path: rr.path.clone(),
                providers: rr.providers.clone(),
                is_conflict: rr.is_conflict,
            })
            .collect(),
        evidence: r
            .evidence
            .iter()
            .map(|e| SummaryEvidence {
                confidence: label(e.confidence),
                title: e.title.clone(),
                details: e.details.clone(),
            })
            .collect(),
        recommendations: r.recommendations.clone(),
        symbols: SummarySymbols {
            search_path: redact_path(&r.symbols.search_path, home, redact),
            cache_path: redact_path(&r.symbols.cache_path, home, redact),
            online_allowed: r.symbols.online_allowed,
            online_used: r.symbols.online_used,
            total_frames: r.symbols.total_frames,
            symbolized_frames: r.symbols.symbolized_frames,
        },
    }
}

fn output_base(r: &AnalysisResult) -> PathBuf {
    match &r.out_dir {
        Some(dir) => dir.clone(),
        None => r
            .dump_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

fn write_text(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .map_err(|e| DiagError::OutputWrite(format!("{}: {e}", path.display())))
}

/// The human-readable report; same information as the JSON, sectioned.
pub fn render_report(r: &AnalysisResult, redact: bool) -> String {
    let en = r.language.is_english();
    let home = dirs::home_dir().map(|p| p.display().to_string());
    let home = home.as_deref();
    let mut out = String::new();

    let _ = writeln!(out, "{}", if en { "SkyrimDiag Report" } else { "SkyrimDiag 리포트" });
    let _ = writeln!(
        out,
        "{}{}",
        if en { "Dump: " } else { "덤프: " },
        redact_path(&r.dump_path.display().to_string(), home, redact)
    );
    let _ = writeln!(
        out,
        "{}{}",
        if en { "Summary: " } else { "결론: " },
        r.summary_sentence
    );
    if !r.crash_bucket_key.is_empty() {
        let _ = writeln!(
            out,
            "{}{}",
            if en { "CrashBucketKey: " } else { "크래시 버킷 키: " },
            r.crash_bucket_key
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "ExceptionCode: 0x{:x}", r.exc_code);
    let _ = writeln!(out, "ExceptionAddress: 0x{:x}", r.exc_addr);
    let _ = writeln!(out, "ThreadId: {}", r.exc_tid);
    let _ = writeln!(out, "Module+Offset: {}", r.fault_module_plus_offset);
    if !r.inferred_mod_name.is_empty() {
        let _ = writeln!(
            out,
            "{}{}",
            if en { "InferredMod: " } else { "추정 모드: " },
            r.inferred_mod_name
        );
    }
    if !r.crash_logger.log_path.is_empty() {
        let _ = writeln!(
            out,
            "{}{}",
            if en { "CrashLoggerLog: " } else { "Crash Logger 로그: " },
            redact_path(&r.crash_logger.log_path, home, redact)
        );
    }
    if !r.crash_logger.version.is_empty() {
        let _ = writeln!(
            out,
            "{}{}",
            if en { "CrashLoggerVersion: " } else { "Crash Logger 버전: " },
            r.crash_logger.version
        );
    }
    let _ = writeln!(out, "StateFlags: {}", r.state_flags);
    let _ = writeln!(out, "HasBlackbox: {}", u8::from(r.has_blackbox));
    let _ = writeln!(out, "HasWCT: {}", u8::from(r.has_wct));

    let _ = writeln!(out, "{}", if en { "\nEvidence:" } else { "\n근거:" });
    for e in &r.evidence {
        let _ = writeln!(out, "- [{}] {}", e.confidence.label(r.language), e.title);
        let _ = writeln!(out, "  {}", e.details);
    }

    if !r.stackwalk_primary_frames.is_empty() {
        let _ = writeln!(
            out,
            "{}{}{}",
            if en { "\nCallstack (primary, tid=" } else { "\n콜스택(대표, tid=" },
            r.stackwalk_primary_tid,
            "):"
        );
        for f in &r.stackwalk_primary_frames {
            let _ = writeln!(out, "  {f}");
        }
    }

    if !r.suspects.is_empty() {
        let basis = if r.suspects_from_stackwalk { "callstack" } else { "stack scan" };
        let _ = writeln!(out, "{}{basis}{}", if en { "\nSuspects (" } else { "\n후보(" }, "):");
        for s in &r.suspects {
            let _ = write!(
                out,
                "- [{}] {}",
                s.confidence.label(r.language),
                s.module_filename
            );
            if !s.inferred_mod_name.is_empty() {
                let _ = write!(out, " ({})", s.inferred_mod_name);
            }
            let _ = writeln!(out, " score={}", s.score);
            let _ = writeln!(out, "  {}", s.reason);
            if !s.module_path.is_empty() {
                let _ = writeln!(out, "  path={}", redact_path(&s.module_path, home, redact));
            }
        }
    }

    if !r.resources.is_empty() {
        let _ = writeln!(
            out,
            "{}",
            if en { "\nRecent resources (.nif/.hkx/.tri):" } else { "\n최근 리소스(.nif/.hkx/.tri):" }
        );
        for rr in &r.resources {
            let _ = write!(out, "- t_ms={} tid={} [{}] {}", rr.t_ms, rr.tid, rr.kind, rr.path);
            if !rr.providers.is_empty() {
                let _ = write!(out, " providers={}", rr.providers.join(", "));
            }
            if rr.is_conflict {
                let _ = write!(out, " (conflict)");
            }
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(
        out,
        "{}",
        if en { "\nRecommendations (checklist):" } else { "\n권장 조치(체크리스트):" }
    );
    for s in &r.recommendations {
        let _ = writeln!(out, "- {s}");
    }

    if !r.events.is_empty() {
        let _ = writeln!(
            out,
            "{}",
            if en { "\nLast events (most recent last):" } else { "\n최근 이벤트(최신이 마지막):" }
        );
        for ev in &r.events {
            let _ = writeln!(
                out,
                "[{}] t_ms={} tid={} {} a={} b={} c={} d={}",
                ev.index, ev.t_ms, ev.tid, ev.type_name, ev.a, ev.b, ev.c, ev.d
            );
        }
    }

    out
}

/// Writes all artifacts next to the dump (or the requested out dir).
pub fn write_outputs(r: &AnalysisResult, redact: bool) -> Result<()> {
    let out_base = output_base(r);
    std::fs::create_dir_all(&out_base)
        .map_err(|e| DiagError::OutputWrite(format!("{}: {e}", out_base.display())))?;

    let stem = r
        .dump_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dump".to_string());

    let summary = build_summary(r, redact);
    let summary_text = serde_json::to_string_pretty(&summary)?;
    write_text(
        &out_base.join(format!("{stem}_SkyrimDiagSummary.json")),
        &summary_text,
    )?;

    write_text(
        &out_base.join(format!("{stem}_SkyrimDiagReport.txt")),
        &render_report(r, redact),
    )?;

    if r.has_blackbox {
        let mut jsonl = String::new();
        for ev in &r.events {
            jsonl.push_str(&serde_json::to_string(ev)?);
            jsonl.push('\n');
        }
        write_text(
            &out_base.join(format!("{stem}_SkyrimDiagBlackbox.jsonl")),
            &jsonl,
        )?;
    }

    if r.has_wct {
        write_text(&out_base.join(format!("{stem}_SkyrimDiagWct.json")), &r.wct_json)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::ConfidenceLevel;
    use crate::report::{EvidenceItem, SuspectItem};

    fn sample_result(dir: &Path) -> AnalysisResult {
        AnalysisResult {
            dump_path: dir.join("SkyrimSE_Crash_20260105_213015.dmp"),
            language: Language::English,
            exc_code: 0xC000_0005,
            exc_tid: 42,
            exc_addr: 0x7FF0_1234,
            fault_module_filename: "hdtSMP64.dll".into(),
            fault_module_plus_offset: "hdtSMP64.dll+0x1234".into(),
            summary_sentence: "Top suspect: hdtSMP64.dll (Confidence: High)".into(),
            crash_bucket_key: "CTD-0123456789abcdef".into(),
            suspects: vec![SuspectItem {
                confidence: ConfidenceLevel::High,
                module_filename: "hdtSMP64.dll".into(),
                module_path: "D:\\MO2\\mods\\HDT\\hdtSMP64.dll".into(),
                inferred_mod_name: "HDT".into(),
                score: 28,
                reason: "Callstack weight=28, first depth=0".into(),
            }],
            stackwalk_primary_tid: 42,
            stackwalk_primary_frames: vec!["hdtSMP64.dll+0x1234".into()],
            evidence: vec![EvidenceItem {
                confidence: ConfidenceLevel::High,
                title: "Exception occurred inside a specific DLL".into(),
                details: "hdtSMP64.dll".into(),
            }],
            recommendations: vec!["[Top suspect] Update HDT".into()],
            ..Default::default()
        }
    }

    #[test]
    fn summary_roundtrips_schema_fields() {
        let dir = tempfile::tempdir().unwrap();
        let r = sample_result(dir.path());
        let doc = build_summary(&r, false);
        let json = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: SummaryDoc = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string_pretty(&parsed).unwrap();
        assert_eq!(json, rejson);
        assert_eq!(parsed.schema.name, SCHEMA_NAME);
        assert_eq!(parsed.schema.version, SCHEMA_VERSION);
        assert_eq!(parsed.exception.code, 0xC000_0005);
        assert_eq!(parsed.suspects[0].confidence, "High");
        assert!(SummaryDoc::accepts_schema(1));
        assert!(SummaryDoc::accepts_schema(2));
        assert!(!SummaryDoc::accepts_schema(3));
    }

    #[test]
    fn writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = sample_result(dir.path());
        r.out_dir = Some(dir.path().to_path_buf());
        r.has_wct = true;
        r.wct_json = r#"{"threads": []}"#.into();
        write_outputs(&r, false).unwrap();

        let stem = "SkyrimSE_Crash_20260105_213015";
        assert!(dir.path().join(format!("{stem}_SkyrimDiagSummary.json")).exists());
        assert!(dir.path().join(format!("{stem}_SkyrimDiagReport.txt")).exists());
        assert!(dir.path().join(format!("{stem}_SkyrimDiagWct.json")).exists());
        // No blackbox stream: no jsonl artifact.
        assert!(!dir.path().join(format!("{stem}_SkyrimDiagBlackbox.jsonl")).exists());
    }

    #[test]
    fn report_contains_summary_and_suspects() {
        let dir = tempfile::tempdir().unwrap();
        let r = sample_result(dir.path());
        let report = render_report(&r, false);
        assert!(report.contains("SkyrimDiag Report"));
        assert!(report.contains("Top suspect: hdtSMP64.dll"));
        assert!(report.contains("CrashBucketKey: CTD-0123456789abcdef"));
        assert!(report.contains("score=28"));
        assert!(report.contains("[Top suspect] Update HDT"));
    }

    #[test]
    fn redaction_strips_home_prefix() {
        let home = dirs::home_dir().map(|p| p.display().to_string());
        if let Some(home) = home {
            let value = format!("{home}/Documents/My Games/dump.dmp");
            let redacted = redact_path(&value, Some(&home), true);
            assert!(redacted.starts_with('~'));
            assert!(!redacted.contains(&home));
            assert_eq!(redact_path(&value, Some(&home), false), value);
        }
    }
}
