//! Evidence, recommendations, and the summary sentence.
//!
//! This is the fusion layer: every upstream signal (exception stream,
//! suspects, signature/graphics/plugin rules, blackbox events, resource
//! log, WCT, crash history) is turned into localized evidence rows, a
//! recommendation checklist, and exactly one summary sentence ending in a
//! parenthesized confidence label.

use crate::blackbox::{state_flags, EventType};
use crate::i18n::{ConfidenceLevel, Language};
use crate::modules;
use crate::report::{AnalysisResult, EvidenceItem, ResourceRow, SuspectItem};
use crate::wct::{self, WctInfo};

/// Heartbeats younger than this reclassify a `_hang_` dump as a snapshot.
const FRESH_HEARTBEAT_SEC: f64 = 5.0;
/// Near-anchor resource window while loading.
const ANCHOR_WINDOW_LOADING_MS: f64 = 15_000.0;
/// Near-anchor resource window otherwise.
const ANCHOR_WINDOW_DEFAULT_MS: f64 = 5_000.0;
const ANCHOR_WINDOW_AFTER_MS: f64 = 300.0;
/// Recent-window hitch stats: before/after the capture anchor.
const RECENT_HITCH_BEFORE_MS: f64 = 10_000.0;
const RECENT_HITCH_AFTER_MS: f64 = 300.0;
/// A hitch this long counts as a freeze for pre-freeze context.
const BIG_HITCH_MS: u64 = 2_000;

/// PerfHitch aggregate.
#[derive(Debug, Clone, Copy, Default)]
pub struct HitchSummary {
    pub count: u32,
    pub max_ms: u64,
    pub p95_ms: u64,
}

/// Derived incident classification shared by the evidence items, the
/// recommendations, and the summary sentence.
#[derive(Debug, Default)]
pub struct EvidenceContext {
    pub has_exception: bool,
    pub is_crash_like: bool,
    pub is_hang_like: bool,
    pub is_snapshot_like: bool,
    pub is_manual_capture: bool,
    pub has_module: bool,
    pub is_system: bool,
    pub is_game_exe: bool,
    pub is_hook_framework: bool,
    pub wct: Option<WctInfo>,
    pub wct_suggests_hang: bool,
    pub hitch: HitchSummary,
    pub suspect_basis: String,
}

fn join_list(items: &[String], max_n: usize, sep: &str) -> String {
    if items.is_empty() || max_n == 0 {
        return String::new();
    }
    let n = items.len().min(max_n);
    let mut out = items[..n].join(sep);
    if items.len() > n {
        out.push_str(sep);
        out.push_str("...");
    }
    out
}

fn hitch_summary_in<F: Fn(&crate::report::EventRow) -> bool>(
    events: &[crate::report::EventRow],
    keep: F,
) -> HitchSummary {
    let mut out = HitchSummary::default();
    let mut ms: Vec<u64> = Vec::new();
    for e in events {
        if e.event_type != EventType::PerfHitch as u16 || e.a == 0 || !keep(e) {
            continue;
        }
        ms.push(e.a);
        out.count += 1;
        out.max_ms = out.max_ms.max(e.a);
    }
    if !ms.is_empty() {
        ms.sort_unstable();
        let idx = (ms.len() - 1) * 95 / 100;
        out.p95_ms = ms[idx.min(ms.len() - 1)];
    }
    out
}

pub fn hitch_summary(events: &[crate::report::EventRow]) -> HitchSummary {
    hitch_summary_in(events, |_| true)
}

fn last_event_time_by_type(events: &[crate::report::EventRow], ty: EventType) -> Option<f64> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == ty as u16)
        .map(|e| e.t_ms)
}

/// Anchor: last explicit Crash/HangMark, else the last event, else the
/// last resource timestamp.
pub fn capture_anchor_ms(r: &AnalysisResult) -> Option<f64> {
    last_event_time_by_type(&r.events, EventType::Crash)
        .or_else(|| last_event_time_by_type(&r.events, EventType::HangMark))
        .or_else(|| r.events.last().map(|e| e.t_ms))
        .or_else(|| r.resources.last().map(|rr| rr.t_ms))
}

/// Heartbeat age relative to the capture anchor, in seconds.
pub fn heartbeat_age_sec(r: &AnalysisResult) -> Option<f64> {
    let anchor = capture_anchor_ms(r)?;
    let hb = last_event_time_by_type(&r.events, EventType::Heartbeat)?;
    Some(((anchor - hb) / 1000.0).max(0.0))
}

fn is_key_resource_kind(kind: &str) -> bool {
    matches!(kind, "nif" | "hkx" | "tri")
}

fn resources_near_anchor<'a>(
    resources: &'a [ResourceRow],
    anchor_ms: f64,
    window_before_ms: f64,
    window_after_ms: f64,
) -> Vec<&'a ResourceRow> {
    let mut hits: Vec<&ResourceRow> = resources
        .iter()
        .filter(|rr| is_key_resource_kind(&rr.kind))
        .filter(|rr| rr.t_ms >= anchor_ms - window_before_ms && rr.t_ms <= anchor_ms + window_after_ms)
        .collect();
    hits.sort_by(|a, b| {
        let da = (a.t_ms - anchor_ms).abs();
        let db = (b.t_ms - anchor_ms).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(8);
    hits
}

fn format_resource_hit(rr: &ResourceRow, anchor_ms: f64) -> String {
    let mut line = format!("{:+.0}ms ", rr.t_ms - anchor_ms);
    if !rr.kind.is_empty() && rr.kind != "(unknown)" {
        line.push_str(&format!("[{}] ", rr.kind));
    }
    line.push_str(&rr.path);
    if rr.is_conflict && !rr.providers.is_empty() {
        line.push_str(&format!(" (providers: {})", join_list(&rr.providers, 4, ", ")));
    }
    line
}

fn provider_scores(hits: &[&ResourceRow]) -> Vec<String> {
    let mut score: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for rr in hits {
        for p in &rr.providers {
            *score.entry(p.as_str()).or_insert(0) += 1;
        }
    }
    let mut rows: Vec<(&str, u32)> = score.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    rows.into_iter()
        .take(5)
        .map(|(name, n)| format!("{name} ({n})"))
        .collect()
}

/// Correlates hitch timestamps with nearby resource loads and their
/// providers. Heuristic only, "possible suspects" not proof.
fn perf_suspects_from_resources(
    events: &[crate::report::EventRow],
    resources: &[ResourceRow],
) -> Vec<String> {
    const WINDOW_BEFORE_MS: f64 = 1_500.0;
    const WINDOW_AFTER_MS: f64 = 150.0;
    if events.is_empty() || resources.is_empty() {
        return Vec::new();
    }
    let mut score: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for ev in events {
        if ev.event_type != EventType::PerfHitch as u16 {
            continue;
        }
        for rr in resources {
            if rr.t_ms < ev.t_ms - WINDOW_BEFORE_MS || rr.t_ms > ev.t_ms + WINDOW_AFTER_MS {
                continue;
            }
            for p in &rr.providers {
                *score.entry(p.as_str()).or_insert(0) += 1;
            }
        }
    }
    let mut rows: Vec<(&str, u32)> = score.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    rows.into_iter()
        .take(5)
        .map(|(name, n)| format!("{name} ({n})"))
        .collect()
}

/// Event names within ten seconds before the last big hitch.
fn pre_freeze_context_line(events: &[crate::report::EventRow]) -> String {
    let Some(big) = events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::PerfHitch as u16 && e.a >= BIG_HITCH_MS)
    else {
        return String::new();
    };

    let mut context: Vec<String> = Vec::new();
    for e in events {
        if e.t_ms > big.t_ms || e.t_ms < big.t_ms - 10_000.0 {
            continue;
        }
        if std::ptr::eq(e, big) {
            break;
        }
        match EventType::from_u16(e.event_type) {
            Some(
                EventType::MenuOpen
                | EventType::MenuClose
                | EventType::LoadStart
                | EventType::LoadEnd
                | EventType::CellChange,
            ) => context.push(e.type_name.clone()),
            Some(EventType::PerfHitch) => context.push(format!("PerfHitch({}ms)", e.a)),
            _ => {}
        }
        if context.len() >= 5 {
            break;
        }
    }
    if context.is_empty() {
        return String::new();
    }
    format!("{} -> PerfHitch({}ms)", context.join(" -> "), big.a)
}

/// Access-violation / in-page-error parameter explanation.
fn explain_exception_info(r: &AnalysisResult, lang: Language) -> Option<String> {
    let en = lang.is_english();
    let access_kind = |k: u64| -> &'static str {
        match (k, en) {
            (0, true) => "read",
            (0, false) => "읽기",
            (1, true) => "write",
            (1, false) => "쓰기",
            (8, true) => "execute",
            (8, false) => "실행",
            (_, true) => "unknown",
            (_, false) => "알 수 없음",
        }
    };

    if r.exc_code == 0xC000_0005 && r.exc_info.len() >= 2 {
        let kind = access_kind(r.exc_info[0]);
        let addr = format!("0x{:X}", r.exc_info[1]);
        return Some(if en {
            format!("EXCEPTION_ACCESS_VIOLATION: {kind} at {addr}")
        } else {
            format!("접근 위반: {kind} 주소={addr}")
        });
    }
    if r.exc_code == 0xC000_0006 && r.exc_info.len() >= 3 {
        let kind = access_kind(r.exc_info[0]);
        let addr = format!("0x{:X}", r.exc_info[1]);
        let status = format!("0x{:X}", r.exc_info[2]);
        return Some(if en {
            format!("EXCEPTION_IN_PAGE_ERROR: {kind} at {addr} (NTSTATUS {status})")
        } else {
            format!("페이지 오류: {kind} 주소={addr} (NTSTATUS {status})")
        });
    }
    None
}

/// Classifies the incident and derives the shared context.
pub fn build_context(r: &AnalysisResult) -> EvidenceContext {
    let lang = r.language;
    let lower_name = r
        .dump_path
        .file_name()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let name_crash = lower_name.contains("_crash_");
    let name_hang = lower_name.contains("_hang_");
    let name_manual = lower_name.contains("_manual_");

    let has_crash_event = r
        .events
        .iter()
        .any(|e| e.event_type == EventType::Crash as u16);
    let has_hang_event = r
        .events
        .iter()
        .any(|e| e.event_type == EventType::HangMark as u16);

    let wct_info = if r.has_wct {
        wct::summarize(&r.wct_json)
    } else {
        None
    };
    let hb_age = heartbeat_age_sec(r);
    let hb_fresh = hb_age.is_some_and(|age| age < FRESH_HEARTBEAT_SEC);
    let manual_from_wct = wct_info.as_ref().is_some_and(|w| w.is_manual_capture());
    let wct_suggests_hang = wct_info.as_ref().is_some_and(|w| w.suggests_hang());
    let manual_capture_hint = name_manual || manual_from_wct;

    let has_exception = r.has_exception();
    // A manual capture can include a Crash blackbox marker from handled
    // exceptions; the exception stream is the stronger crash signal.
    let is_crash_like = name_crash || has_exception || (has_crash_event && !manual_capture_hint);
    let name_hang_effective = name_hang && !manual_from_wct && !hb_fresh;
    let is_hang_like = name_hang_effective || has_hang_event || wct_suggests_hang;
    let is_snapshot_like = !is_crash_like && !is_hang_like;
    let is_manual_capture = manual_capture_hint || (name_hang && is_snapshot_like);

    EvidenceContext {
        has_exception,
        is_crash_like,
        is_hang_like,
        is_snapshot_like,
        is_manual_capture,
        has_module: r.has_fault_module(),
        is_system: r.fault_module_is_system,
        is_game_exe: r.fault_module_is_game_exe,
        is_hook_framework: r.fault_module_is_hook_framework,
        wct: wct_info,
        wct_suggests_hang,
        hitch: hitch_summary(&r.events),
        suspect_basis: match (r.suspects_from_stackwalk, lang.is_english()) {
            (true, true) => "callstack".to_string(),
            (true, false) => "콜스택".to_string(),
            (false, true) => "stack scan".to_string(),
            (false, false) => "스택 스캔".to_string(),
        },
    }
}

/// Builds `evidence`, `recommendations`, and `summary_sentence` in place.
pub fn build_evidence_and_summary(r: &mut AnalysisResult) {
    r.evidence.clear();
    r.recommendations.clear();
    let ctx = build_context(r);
    build_evidence_items(r, &ctx);
    build_recommendations(r, &ctx);
    r.summary_sentence = build_summary_sentence(r, &ctx);
}

fn push(r: &mut AnalysisResult, confidence: ConfidenceLevel, title: String, details: String) {
    r.evidence.push(EvidenceItem {
        confidence,
        title,
        details,
    });
}

fn build_evidence_items(r: &mut AnalysisResult, ctx: &EvidenceContext) {
    let lang = r.language;
    let en = lang.is_english();

    if let Some(sig) = r.signature_match.clone() {
        push(
            r,
            sig.confidence,
            if en {
                format!("Known crash pattern: {}", sig.id)
            } else {
                format!("알려진 크래시 패턴: {}", sig.id)
            },
            sig.cause,
        );
    }

    if let Some(gd) = r.graphics_diag.clone() {
        push(
            r,
            gd.confidence,
            if en {
                format!("Graphics injection crash: {}", gd.rule_id)
            } else {
                format!("그래픽 인젝션 크래시: {}", gd.rule_id)
            },
            gd.cause,
        );
    }

    for pd in r.plugin_diagnostics.clone() {
        push(
            r,
            pd.confidence,
            if en {
                format!("Plugin diagnostics: {}", pd.rule_id)
            } else {
                format!("플러그인 진단: {}", pd.rule_id)
            },
            pd.cause,
        );
    }

    if !r.missing_masters.is_empty() {
        let details = join_list(&r.missing_masters, 4, ", ");
        push(
            r,
            ConfidenceLevel::High,
            if en {
                "Missing plugin masters detected".to_string()
            } else {
                "누락된 마스터 플러그인 감지".to_string()
            },
            details,
        );
    }

    if r.needs_bees {
        push(
            r,
            ConfidenceLevel::High,
            if en {
                "BEES requirement detected".to_string()
            } else {
                "BEES 필요 조건 감지".to_string()
            },
            if en {
                "Header 1.71 plugin(s) found on pre-1.6.1130 runtime without bees.dll.".to_string()
            } else {
                "1.71 헤더 플러그인이 있으나 1.6.1130 미만 런타임에서 bees.dll이 로드되지 않았습니다."
                    .to_string()
            },
        );
    }

    if ctx.has_exception {
        if let Some(info) = explain_exception_info(r, lang) {
            push(
                r,
                ConfidenceLevel::High,
                if en {
                    "Exception parameter analysis".to_string()
                } else {
                    "예외 파라미터 분석".to_string()
                },
                info,
            );
        }
    }

    if ctx.is_snapshot_like {
        push(
            r,
            ConfidenceLevel::High,
            if en {
                "This dump looks like a state snapshot (not a crash/hang dump)".to_string()
            } else {
                "이 덤프는 크래시 덤프가 아니라 '상태 스냅샷'으로 보임".to_string()
            },
            match (en, ctx.is_manual_capture) {
                (true, true) => {
                    "Likely a manual snapshot. This alone does not prove there is a problem. (For state inspection)"
                        .to_string()
                }
                (true, false) => {
                    "Captured without crash/hang signals. Treat it as a snapshot, not a root-cause dump."
                        .to_string()
                }
                (false, true) => {
                    "수동 캡처로 추정됩니다. 이 결과만으로 '문제가 있다'고 단정할 수 없습니다. (상태 확인용)"
                        .to_string()
                }
                (false, false) => {
                    "크래시/행 신호 없이 캡처된 덤프입니다. 원인 확정용이 아니라 '상태 확인용'입니다."
                        .to_string()
                }
            },
        );
    }

    if !r.crash_logger.log_path.is_empty() {
        let mut details = std::path::Path::new(&r.crash_logger.log_path)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| r.crash_logger.log_path.clone());
        if !r.crash_logger.version.is_empty() {
            details.push_str(&format!(" ({})", r.crash_logger.version));
        }
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Crash Logger SSE/AE log auto-detected".to_string()
            } else {
                "Crash Logger SSE/AE 로그를 자동으로 찾음".to_string()
            },
            details,
        );
    }

    if !r.crash_logger.top_modules.is_empty() {
        let details = join_list(&r.crash_logger.top_modules, 4, ", ");
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Crash Logger: top callstack modules".to_string()
            } else {
                "Crash Logger 콜스택 상위 모듈".to_string()
            },
            details,
        );
    }

    if r.crash_logger.has_cpp_exception() {
        let mut parts = Vec::new();
        if !r.crash_logger.cpp_exception_type.is_empty() {
            parts.push(format!("Type: {}", r.crash_logger.cpp_exception_type));
        }
        if !r.crash_logger.cpp_exception_info.is_empty() {
            parts.push(format!("Info: {}", r.crash_logger.cpp_exception_info));
        }
        if !r.crash_logger.cpp_exception_throw_location.is_empty() {
            parts.push(format!("Throw: {}", r.crash_logger.cpp_exception_throw_location));
        }
        if !r.crash_logger.cpp_exception_module.is_empty() {
            parts.push(format!("Module: {}", r.crash_logger.cpp_exception_module));
        }
        let details = join_list(&parts, 8, " | ");
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Crash Logger: C++ exception details".to_string()
            } else {
                "Crash Logger C++ 예외 정보".to_string()
            },
            details,
        );
    }

    if !r.stackwalk_primary_frames.is_empty() {
        let confidence = r
            .suspects
            .first()
            .map_or(ConfidenceLevel::Low, |s| s.confidence);
        let details = format!(
            "tid={}: {}",
            r.stackwalk_primary_tid,
            join_list(&r.stackwalk_primary_frames, 4, " | ")
        );
        push(
            r,
            confidence,
            if en {
                "Callstack (primary thread): top frames".to_string()
            } else {
                "콜스택(대표 스레드) 상위 프레임".to_string()
            },
            details,
        );
    }

    if !r.suspects.is_empty() {
        let is_actionable = |s: &SuspectItem| {
            !modules::is_known_hook_framework(&s.module_filename)
                && !modules::is_systemish_filename(&s.module_filename)
                && !modules::is_system_module_path(&s.module_path)
                && !modules::is_game_exe(&s.module_filename)
        };
        let top_is_victimish = !is_actionable(&r.suspects[0]);
        let selected = if top_is_victimish {
            r.suspects.iter().find(|s| is_actionable(s)).unwrap_or(&r.suspects[0])
        } else {
            &r.suspects[0]
        };

        let mut display = vec![selected.display_name()];
        for s in &r.suspects {
            if std::ptr::eq(s, selected) {
                continue;
            }
            display.push(s.display_name());
            if display.len() >= 3 {
                break;
            }
        }
        let confidence = selected.confidence;
        let details = join_list(&display, 3, ", ");
        push(
            r,
            confidence,
            match (en, r.suspects_from_stackwalk) {
                (true, true) => "Top suspect (callstack-based)".to_string(),
                (true, false) => "Top suspect (stack-scan-based)".to_string(),
                (false, true) => "콜스택 기반 유력 후보".to_string(),
                (false, false) => "스택 스캔 기반 유력 후보".to_string(),
            },
            details,
        );
    }

    if !r.resources.is_empty() {
        let n = r.resources.len().min(4);
        let recent: Vec<String> = r.resources[r.resources.len() - n..]
            .iter()
            .map(|rr| {
                let mut line = rr.path.clone();
                if !rr.kind.is_empty() && rr.kind != "(unknown)" {
                    line = format!("[{}] {}", rr.kind, line);
                }
                if rr.is_conflict && !rr.providers.is_empty() {
                    line.push_str(&format!(" (providers: {})", join_list(&rr.providers, 4, ", ")));
                }
                line
            })
            .collect();
        let details = join_list(&recent, 4, ", ");
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Recent resource loads (mesh/anim)".to_string()
            } else {
                "최근 로드된 리소스(메쉬/애니) 기록".to_string()
            },
            details,
        );

        let conflicts: Vec<String> = r
            .resources
            .iter()
            .filter(|rr| rr.is_conflict && rr.providers.len() >= 2)
            .take(4)
            .map(|rr| format!("{} <= {}", rr.path, join_list(&rr.providers, 6, ", ")))
            .collect();
        if !conflicts.is_empty() {
            let details = join_list(&conflicts, 4, " | ");
            push(
                r,
                ConfidenceLevel::Medium,
                if en {
                    "Same file provided by multiple mods (possible conflict)".to_string()
                } else {
                    "동일 파일을 여러 모드가 제공(충돌 가능)".to_string()
                },
                details,
            );
        }

        // For crashes/hangs, highlight resources closest to capture time.
        if ctx.is_crash_like || ctx.is_hang_like {
            if let Some(anchor) = capture_anchor_ms(r) {
                let window_before = if r.state_flags & state_flags::LOADING != 0 {
                    ANCHOR_WINDOW_LOADING_MS
                } else {
                    ANCHOR_WINDOW_DEFAULT_MS
                };
                let hits =
                    resources_near_anchor(&r.resources, anchor, window_before, ANCHOR_WINDOW_AFTER_MS);
                if !hits.is_empty() {
                    let lines: Vec<String> = hits
                        .iter()
                        .take(4)
                        .map(|rr| format_resource_hit(rr, anchor))
                        .collect();
                    let near_conflicts: Vec<String> = hits
                        .iter()
                        .filter(|rr| rr.is_conflict && rr.providers.len() >= 2)
                        .take(3)
                        .map(|rr| format_resource_hit(rr, anchor))
                        .collect();
                    let scores = provider_scores(&hits);

                    let details = join_list(&lines, 4, " | ");
                    push(
                        r,
                        ConfidenceLevel::Low,
                        match (en, ctx.is_crash_like) {
                            (true, true) => {
                                "Resources loaded near the crash moment (heuristic)".to_string()
                            }
                            (true, false) => {
                                "Resources loaded near the hang moment (heuristic)".to_string()
                            }
                            (false, true) => "크래시 직전/직후 로드된 리소스(메쉬/애니) 추정".to_string(),
                            (false, false) => {
                                "프리징/무한로딩 시점 근처 로드된 리소스(메쉬/애니) 추정".to_string()
                            }
                        },
                        details,
                    );

                    if !near_conflicts.is_empty() {
                        let details = join_list(&near_conflicts, 3, " | ");
                        push(
                            r,
                            ConfidenceLevel::Medium,
                            if en {
                                "Near-timestamp resources exist in multiple mods (possible conflict)"
                                    .to_string()
                            } else {
                                "시점 근처 리소스가 여러 모드에 존재(충돌 가능)".to_string()
                            },
                            details,
                        );
                    }

                    if !scores.is_empty() {
                        let details = join_list(&scores, 5, ", ");
                        push(
                            r,
                            ConfidenceLevel::Low,
                            if en {
                                "Mods providing near-timestamp resources (correlation)".to_string()
                            } else {
                                "시점 근처 리소스를 제공한 모드(상관분석)".to_string()
                            },
                            details,
                        );
                    }
                }
            }
        }
    }

    if ctx.hitch.count > 0 {
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Stutter / hitch detected".to_string()
            } else {
                "끊김/프레임 드랍(히치) 감지".to_string()
            },
            format!(
                "count={}, max={}ms, p95={}ms",
                ctx.hitch.count, ctx.hitch.max_ms, ctx.hitch.p95_ms
            ),
        );

        if !r.resources.is_empty() {
            let suspects = perf_suspects_from_resources(&r.events, &r.resources);
            if !suspects.is_empty() {
                let details = join_list(&suspects, 5, ", ");
                push(
                    r,
                    ConfidenceLevel::Low,
                    if en {
                        "Mods providing resources near hitch events (correlation)".to_string()
                    } else {
                        "히치 시점 근처 리소스를 제공한 모드(상관분석)".to_string()
                    },
                    details,
                );
            }
        }

        if let Some(anchor) = capture_anchor_ms(r) {
            let recent = hitch_summary_in(&r.events, |e| {
                e.t_ms >= anchor - RECENT_HITCH_BEFORE_MS && e.t_ms <= anchor + RECENT_HITCH_AFTER_MS
            });
            if recent.count > 0 {
                push(
                    r,
                    ConfidenceLevel::Medium,
                    if en {
                        "Recent-window hitch stats (separate from overall)".to_string()
                    } else {
                        "최근 구간 히치 통계(전체 통계와 분리)".to_string()
                    },
                    if en {
                        format!(
                            "window=10s_before_to_0.3s_after_capture, count={}, max={}ms, p95={}ms (overall max={}ms)",
                            recent.count, recent.max_ms, recent.p95_ms, ctx.hitch.max_ms
                        )
                    } else {
                        format!(
                            "캡처 기준 -10초~+0.3초, count={}, max={}ms, p95={}ms (전체 max={}ms)",
                            recent.count, recent.max_ms, recent.p95_ms, ctx.hitch.max_ms
                        )
                    },
                );
            }
        }
    }

    // Pre-freeze context: what happened before the biggest stall.
    if ctx.is_hang_like || (ctx.hitch.count > 0 && ctx.hitch.max_ms >= BIG_HITCH_MS) {
        let line = pre_freeze_context_line(&r.events);
        if !line.is_empty() {
            push(
                r,
                ConfidenceLevel::Medium,
                if en {
                    "Context before freeze / big hitch (pre-freeze context)".to_string()
                } else {
                    "프리징/큰 히치 직전 상황".to_string()
                },
                line,
            );
        }
    }

    if ctx.has_module && !ctx.is_system && !ctx.is_game_exe {
        let details = if en {
            format!(
                "The exception address is within {}. (Module+Offset: {})",
                r.fault_module_filename, r.fault_module_plus_offset
            )
        } else {
            format!(
                "예외 주소가 {} 범위에 포함됩니다. (Module+Offset: {})",
                r.fault_module_filename, r.fault_module_plus_offset
            )
        };
        push(
            r,
            ConfidenceLevel::High,
            if en {
                "Exception occurred inside a specific DLL".to_string()
            } else {
                "크래시가 특정 DLL 내부에서 발생".to_string()
            },
            details,
        );
    } else if ctx.has_module && ctx.is_system {
        let details = if en {
            format!(
                "The exception address is reported in {}. In this case the real culprit is often another mod/DLL. (Module+Offset: {})",
                r.fault_module_filename, r.fault_module_plus_offset
            )
        } else {
            format!(
                "예외 주소가 {} 에서 보고됩니다. 이 경우 실제 원인은 다른 DLL/모드일 수 있습니다. (Module+Offset: {})",
                r.fault_module_filename, r.fault_module_plus_offset
            )
        };
        push(
            r,
            ConfidenceLevel::Low,
            if en {
                "Exception reported in a Windows system DLL".to_string()
            } else {
                "크래시가 Windows 시스템 DLL에서 보고됨".to_string()
            },
            details,
        );
    } else if !ctx.has_module && ctx.has_exception {
        push(
            r,
            ConfidenceLevel::Low,
            if en {
                "Could not determine the fault module".to_string()
            } else {
                "fault module을 특정하지 못함".to_string()
            },
            if en {
                "The dump may lack module list/exception data.".to_string()
            } else {
                "덤프에 모듈 목록/예외 정보가 부족할 수 있습니다.".to_string()
            },
        );
    }

    if ctx.is_game_exe {
        if let Some(fn_name) = r.resolved_function.clone() {
            push(
                r,
                ConfidenceLevel::Medium,
                if en {
                    "Game function identified".to_string()
                } else {
                    "게임 함수 식별".to_string()
                },
                if en {
                    format!("Crash occurred in or near: {fn_name}")
                } else {
                    format!("크래시 발생 위치(또는 근처): {fn_name}")
                },
            );
        }
    }

    if !r.inferred_mod_name.is_empty() {
        let details = if en {
            format!(
                "Detected a \\mods\\<modname>\\ path pattern; inferred '{}'.",
                r.inferred_mod_name
            )
        } else {
            format!(
                "모듈 경로에 \\mods\\<모드명>\\ 패턴이 있어 '{}' 로 추정했습니다.",
                r.inferred_mod_name
            )
        };
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Inferred mod name from MO2 mod path".to_string()
            } else {
                "MO2 모드 폴더 경로에서 모드명 추정".to_string()
            },
            details,
        );
    }

    if r.state_flags & state_flags::LOADING != 0 {
        push(
            r,
            ConfidenceLevel::Medium,
            if en {
                "Capture appears to have happened during loading".to_string()
            } else {
                "크래시 당시 로딩 상태로 추정".to_string()
            },
            if en {
                "The Loading flag is set in state_flags. (Likely mesh/texture/script init stage)"
                    .to_string()
            } else {
                "state_flags에 Loading 플래그가 설정되어 있습니다. (메쉬/텍스처/스크립트 초기화 단계일 수 있음)"
                    .to_string()
            },
        );
    }

    if r.has_wct {
        if ctx.is_snapshot_like && ctx.is_manual_capture && !ctx.wct_suggests_hang {
            push(
                r,
                ConfidenceLevel::Low,
                if en {
                    "WCT snapshot (manual capture)".to_string()
                } else {
                    "WCT(Wait Chain) 스냅샷(수동 캡처)".to_string()
                },
                if en {
                    "Manual captures always include WCT. This alone does not mean a hang.".to_string()
                } else {
                    "수동 캡처에는 WCT가 항상 포함됩니다. 이것만으로 프리징/무한로딩을 의미하지 않습니다."
                        .to_string()
                },
            );
        } else {
            push(
                r,
                ConfidenceLevel::Medium,
                if en {
                    "WCT (Wait Chain) included".to_string()
                } else {
                    "WCT(Wait Chain) 정보 포함".to_string()
                },
                if en {
                    "For freezes/infinite loading, WCT can show which threads are waiting on what."
                        .to_string()
                } else {
                    "프리징/무한로딩처럼 멈춘 경우, 어떤 스레드가 무엇을 기다리는지 단서를 제공합니다."
                        .to_string()
                },
            );
        }
    }

    if let Some(w) = &ctx.wct {
        let details = match &w.capture {
            Some(cap) if cap.threshold_sec > 0 => format!(
                "capture={}, threads={}, cycleThreads={}, heartbeatAge={:.1}s (threshold={}s, loading={})",
                cap.kind,
                w.threads,
                w.cycles,
                cap.seconds_since_heartbeat,
                cap.threshold_sec,
                u8::from(cap.is_loading)
            ),
            _ => format!("threads={}, cycleThreads={}", w.threads, w.cycles),
        };
        push(
            r,
            ConfidenceLevel::Medium,
            if en { "WCT summary".to_string() } else { "WCT 요약".to_string() },
            details,
        );
    }

    if !r.history_stats.is_empty() {
        let mut details = String::new();
        for ms in r.history_stats.iter().take(3) {
            if ms.module_name.is_empty() {
                continue;
            }
            if !details.is_empty() {
                details.push('\n');
            }
            if en {
                details.push_str(&format!(
                    "{}: {}/{} crashes, top {}x",
                    ms.module_name, ms.total_appearances, ms.total_crashes, ms.as_top_suspect
                ));
            } else {
                details.push_str(&format!(
                    "{}: {}회 중 {}회 등장, 1위 {}회",
                    ms.module_name, ms.total_crashes, ms.total_appearances, ms.as_top_suspect
                ));
            }
        }
        if !details.is_empty() {
            push(
                r,
                ConfidenceLevel::Medium,
                if en {
                    "Crash history pattern".to_string()
                } else {
                    "크래시 이력 패턴".to_string()
                },
                details,
            );
        }
    }

    if r.history_correlation.count > 1 {
        let details = if en {
            format!(
                "Same bucket_key matched {} times (first: {})",
                r.history_correlation.count, r.history_correlation.first_seen
            )
        } else {
            format!(
                "동일 패턴이 {}회 발생 (최초: {})",
                r.history_correlation.count, r.history_correlation.first_seen
            )
        };
        push(
            r,
            ConfidenceLevel::High,
            if en {
                "Repeated crash pattern".to_string()
            } else {
                "반복 크래시 패턴".to_string()
            },
            details,
        );
    }
}

fn build_recommendations(r: &mut AnalysisResult, ctx: &EvidenceContext) {
    let en = r.language.is_english();
    let mut rec = |s: String| r.recommendations.push(s);

    if ctx.is_snapshot_like {
        rec(if en {
            "[Snapshot] No exception/crash info is present. This dump alone is not enough to blame a mod."
                .to_string()
        } else {
            "[정상/스냅샷] 예외(크래시) 정보가 없습니다. 이 덤프만으로 '어떤 모드가 크래시 원인'인지 판단하기 어렵습니다."
                .to_string()
        });
        rec(if en {
            "[Snapshot] Capture during a real issue for diagnosis: (1) real CTD dump, (2) manual capture during freeze/infinite loading or an auto hang dump."
                .to_string()
        } else {
            "[정상/스냅샷] 문제 상황에서 캡처해야 진단이 가능합니다: (1) 실제 크래시 덤프, (2) 프리징/무한로딩 중 수동 캡처 또는 자동 감지 덤프"
                .to_string()
        });
    }

    if r.exc_code != 0 {
        if r.exc_code == 0xC000_0005 {
            rec(if en {
                "[Basics] ExceptionCode=0xC0000005 (Access Violation). Often caused by DLL hooks / invalid memory access."
                    .to_string()
            } else {
                "[기본] ExceptionCode=0xC0000005(접근 위반)입니다. 보통 DLL 후킹/메모리 접근 문제로 발생합니다."
                    .to_string()
            });
        } else {
            rec(if en {
                format!("[Basics] ExceptionCode=0x{:08X}.", r.exc_code)
            } else {
                format!("[기본] ExceptionCode=0x{:08X} 입니다.", r.exc_code)
            });
        }

        if r.exc_code == 0xE06D_7363 {
            rec(if en {
                "[Interpretation] 0xE06D7363 is a common C++ exception (throw) code. It can occur during normal throw/catch."
                    .to_string()
            } else {
                "[해석] 0xE06D7363은 흔한 C++ 예외(throw) 코드입니다. 정상 동작 중에도 throw/catch로 발생할 수 있습니다."
                    .to_string()
            });
            rec(if en {
                "[Interpretation] If the game did not actually crash, this dump may be a handled exception false positive."
                    .to_string()
            } else {
                "[해석] 게임이 실제로 튕기지 않았다면, 이 덤프는 '실제 CTD'가 아니라 'handled exception 오탐'일 수 있습니다."
                    .to_string()
            });
        }
    }

    if ctx.is_hook_framework {
        rec(if en {
            "[Hook framework] This mod extensively hooks the game engine. It may be a victim of memory corruption caused by another mod, not the root cause itself. Check other suspect candidates first."
                .to_string()
        } else {
            "[훅 프레임워크] 이 모드는 게임 엔진을 광범위하게 훅합니다. 다른 모드의 메모리 오염으로 인한 피해자일 수 있으며, 이 모드 자체가 원인이 아닐 수 있습니다. 다른 후보 모드를 먼저 점검하세요."
                .to_string()
        });
    }

    if !r.inferred_mod_name.is_empty() {
        rec(if en {
            format!(
                "[Top suspect] Reproduce after updating/reinstalling '{}'.",
                r.inferred_mod_name
            )
        } else {
            format!(
                "[유력 후보] '{}' 모드를 업데이트/재설치 후 재현 여부 확인",
                r.inferred_mod_name
            )
        });
        rec(if en {
            format!(
                "[Top suspect] If it repeats, disable the mod (or its SKSE plugin DLL) and retest: '{}'.",
                r.inferred_mod_name
            )
        } else {
            format!(
                "[유력 후보] 동일 크래시가 반복되면 '{}' 모드(또는 해당 모드의 SKSE 플러그인 DLL)를 비활성화 후 재현 여부 확인",
                r.inferred_mod_name
            )
        });
    }

    if r.inferred_mod_name.is_empty() {
        if let Some(s0) = r.suspects.first() {
            if !s0.inferred_mod_name.is_empty() {
                rec(if en {
                    format!(
                        "[Top suspect] {} candidate: reproduce after updating/reinstalling '{}'.",
                        ctx.suspect_basis, s0.inferred_mod_name
                    )
                } else {
                    format!(
                        "[유력 후보] {} 기반 후보: '{}' 모드 업데이트/재설치 후 재현 여부 확인",
                        ctx.suspect_basis, s0.inferred_mod_name
                    )
                });
                rec(if en {
                    format!(
                        "[Top suspect] If it repeats, disable the mod (or its SKSE plugin DLL) and retest: '{}'.",
                        s0.inferred_mod_name
                    )
                } else {
                    format!(
                        "[유력 후보] 동일 문제가 반복되면 '{}' 모드(또는 해당 모드의 SKSE 플러그인 DLL)를 비활성화 후 재현 여부 확인",
                        s0.inferred_mod_name
                    )
                });
            } else if !s0.module_filename.is_empty() {
                rec(if en {
                    format!(
                        "[Top suspect] {} candidate DLL: {} — check the providing mod first.",
                        ctx.suspect_basis, s0.module_filename
                    )
                } else {
                    format!(
                        "[유력 후보] {} 기반 후보 DLL: {} — 포함된 모드를 우선 점검",
                        ctx.suspect_basis, s0.module_filename
                    )
                });
            }
        }
    }

    if !r.resources.is_empty() {
        let has_conflict = r.resources.iter().any(|rr| rr.is_conflict);
        rec(if en {
            "[Mesh/Anim] This dump includes recent resource load history (.nif/.hkx/.tri). Check the 'Recent resources' section."
                .to_string()
        } else {
            "[메쉬/애니] 이 덤프에는 최근 로드된 리소스(.nif/.hkx/.tri) 기록이 포함되어 있습니다. '최근 로드된 리소스' 항목을 확인하세요."
                .to_string()
        });
        if has_conflict {
            rec(if en {
                "[Conflict] If multiple mods provide the same file, conflicts are common. Adjust MO2 priority / disable mods to retest."
                    .to_string()
            } else {
                "[충돌] 같은 파일을 제공하는 모드가 2개 이상이면 충돌 가능성이 큽니다. MO2에서 우선순위(모드 순서) 조정/비활성화로 재현 여부 확인"
                    .to_string()
            });
        }
    }

    if ctx.hitch.count > 0 {
        rec(if en {
            "[Performance] PerfHitch events were recorded. Check the event log (t_ms and hitch ms) to see when the stutter happens."
                .to_string()
        } else {
            "[성능] PerfHitch 이벤트가 기록되었습니다. 이벤트 로그에서 t_ms와 hitch(ms)를 확인해 '언제 끊기는지' 먼저 파악하세요."
                .to_string()
        });
        if !r.resources.is_empty() {
            rec(if en {
                "[Performance] Check the resource list for .nif/.hkx/.tri loaded right before/after the hitch, and their providing mods. (Correlation, not proof)"
                    .to_string()
            } else {
                "[성능] 리소스 목록에서 히치 직전/직후 로드된 .nif/.hkx/.tri 및 제공 모드를 확인하세요. (상관관계 기반, 확정 아님)"
                    .to_string()
            });
        }
    }

    if ctx.has_module && !ctx.is_system && !ctx.is_game_exe {
        rec(if en {
            "[Top suspect] Verify prerequisites/versions for the mod containing this DLL (SKSE / Address Library / game runtime)."
                .to_string()
        } else {
            "[유력 후보] 해당 DLL이 포함된 모드의 선행 모드/요구 버전(SKSE/Address Library/엔진 버전) 충족 여부 확인"
                .to_string()
        });
        rec(if en {
            "[Top suspect] Attach this report (*_SkyrimDiagReport.txt) and dump (*.dmp) when reporting to the mod author."
                .to_string()
        } else {
            "[유력 후보] 이 리포트 파일(*_SkyrimDiagReport.txt)과 덤프(*.dmp)를 모드 제작자에게 첨부"
                .to_string()
        });
    } else if ctx.has_module && ctx.is_game_exe {
        rec(if en {
            "[Check] Crash location is the game executable. Version mismatch (Address Library/SKSE) or hook conflicts are likely."
                .to_string()
        } else {
            "[점검] 크래시 위치가 게임 본체(EXE)로 나옵니다. Address Library/SKSE 버전 불일치 또는 후킹 충돌 가능성이 큽니다."
                .to_string()
        });
        rec(if en {
            "[Check] Disable recently added/updated SKSE plugin DLLs one by one and retest.".to_string()
        } else {
            "[점검] 최근 추가/업데이트한 SKSE 플러그인(DLL)부터 하나씩 제외하며 재현 여부 확인".to_string()
        });
    } else if ctx.has_module && ctx.is_system {
        rec(if en {
            "[Check] When a Windows system DLL is shown, the real culprit is often another mod/DLL."
                .to_string()
        } else {
            "[점검] Windows 시스템 DLL로 표시될 때는 실제 원인이 다른 모드/DLL인 경우가 많습니다."
                .to_string()
        });
        rec(if en {
            "[Check] Disable recently added/updated SKSE plugin DLLs one by one and retest.".to_string()
        } else {
            "[점검] 최근 추가/업데이트한 SKSE 플러그인(DLL)부터 하나씩 제외하며 재현 여부 확인".to_string()
        });
        rec(if en {
            "[Check] Verify SKSE version, game runtime (AE/SE/VR), and Address Library all match."
                .to_string()
        } else {
            "[점검] SKSE 버전/게임 버전(AE/SE/VR)/Address Library 버전이 서로 맞는지 확인".to_string()
        });
    } else if !ctx.is_snapshot_like {
        rec(if en {
            "[Check] Fault module could not be determined. Capturing again with a FullMemory dump can provide more clues."
                .to_string()
        } else {
            "[점검] 덤프에서 fault module을 특정하지 못했습니다. FullMemory 덤프로 다시 캡처하면 단서가 늘 수 있습니다."
                .to_string()
        });
    }

    if r.state_flags & state_flags::LOADING != 0 {
        rec(if en {
            "[Loading] Crashes right after load screens often involve animation/mesh/texture/skeleton/script initialization."
                .to_string()
        } else {
            "[로딩 중] 로딩 화면/세이브 로드 직후 크래시는 애니메이션/메쉬/텍스처/스켈레톤/스크립트 초기화 쪽이 흔합니다."
                .to_string()
        });
        rec(if en {
            "[Loading] Check mods affecting that stage first (animations/skeleton/body/physics/precaching)."
                .to_string()
        } else {
            "[로딩 중] 해당 시점에 개입하는 모드(애니메이션/스켈레톤/바디/물리/프리캐시)를 우선 점검"
                .to_string()
        });
    }

    if r.has_wct {
        if ctx.is_hang_like {
            if let Some(w) = &ctx.wct {
                if w.cycles > 0 {
                    rec(if en {
                        "[Hang] WCT detected isCycle=true thread(s). Deadlock is likely.".to_string()
                    } else {
                        "[프리징] WCT에서 isCycle=true 스레드가 감지되었습니다. 데드락 가능성이 높습니다."
                            .to_string()
                    });
                } else {
                    rec(if en {
                        "[Hang] No WCT cycle: possible infinite loop / busy wait.".to_string()
                    } else {
                        "[프리징] WCT cycle이 없으면 무한루프/바쁜 대기(busy wait) 가능성도 있습니다."
                            .to_string()
                    });
                }
            }
            rec(if en {
                "[Hang] If it repeats, use the event log (just before the freeze) to narrow related mods."
                    .to_string()
            } else {
                "[프리징] 프리징이 반복되면 문제 상황 직전에 실행된 이벤트를 기준으로 관련 모드를 점검"
                    .to_string()
            });
        } else if ctx.is_manual_capture && ctx.is_snapshot_like {
            if let Some(w) = &ctx.wct {
                if let Some(cap) = &w.capture {
                    if cap.threshold_sec > 0
                        && cap.seconds_since_heartbeat < f64::from(cap.threshold_sec)
                    {
                        rec(if en {
                            format!(
                                "[Manual] At capture time, heartbeatAge={:.1}s < threshold={}s, so it is not considered a hang.",
                                cap.seconds_since_heartbeat, cap.threshold_sec
                            )
                        } else {
                            format!(
                                "[수동] 수동 캡처 당시 heartbeatAge={:.1}s < threshold={}s 이므로 '프리징/무한로딩'으로 판단되지 않습니다.",
                                cap.seconds_since_heartbeat, cap.threshold_sec
                            )
                        });
                    }
                }
            }
            rec(if en {
                "[Manual] Manual captures include WCT. For real freezes/infinite loading, check the WCT data from a capture taken during the issue."
                    .to_string()
            } else {
                "[수동] 수동 캡처에는 WCT가 포함됩니다. 실제 프리징/무한로딩 중 캡처한 덤프에서 WCT 정보를 참고하세요."
                    .to_string()
            });
        }
    }
}

fn build_summary_sentence(r: &AnalysisResult, ctx: &EvidenceContext) -> String {
    let lang = r.language;
    let en = lang.is_english();

    if let Some(sig) = &r.signature_match {
        let conf = sig.confidence.label(lang);
        return if en {
            format!("Known pattern [{}]: {} (Confidence: {conf})", sig.id, sig.cause)
        } else {
            format!("알려진 패턴 [{}]: {} (신뢰도: {conf})", sig.id, sig.cause)
        };
    }

    let top_suspect = r.suspects.first();
    let first_non_hook = r
        .suspects
        .iter()
        .find(|s| !modules::is_known_hook_framework(&s.module_filename));
    let top_is_hook = top_suspect
        .is_some_and(|s| modules::is_known_hook_framework(&s.module_filename));

    let suspect_who = top_suspect.map(|s| s.display_name()).unwrap_or_default();
    let suspect_conf = top_suspect
        .map(|s| s.confidence.label(lang))
        .unwrap_or_else(|| ConfidenceLevel::Medium.label(lang));
    let non_hook_who = first_non_hook.map(|s| s.display_name()).unwrap_or_default();
    let non_hook_conf = first_non_hook
        .map(|s| s.confidence.label(lang))
        .unwrap_or_else(|| ConfidenceLevel::Medium.label(lang));

    let who = if !r.inferred_mod_name.is_empty() {
        format!("{} ({})", r.inferred_mod_name, r.fault_module_filename)
    } else if !r.fault_module_filename.is_empty() {
        r.fault_module_filename.clone()
    } else if en {
        "(unknown)".to_string()
    } else {
        "(알 수 없음)".to_string()
    };

    let basis = &ctx.suspect_basis;

    if ctx.is_snapshot_like {
        return match (en, ctx.is_manual_capture) {
            (true, true) => {
                "Looks like a manual snapshot. This alone does not prove a problem. (Confidence: High)"
                    .to_string()
            }
            (true, false) => {
                "Looks like a snapshot dump (not a crash/hang). Useful for state inspection, not root cause. (Confidence: High)"
                    .to_string()
            }
            (false, true) => {
                "수동 캡처 스냅샷으로 보입니다. 이 결과만으로 '문제가 있다'고 단정할 수 없습니다. (신뢰도: 높음)"
                    .to_string()
            }
            (false, false) => {
                "스냅샷 덤프(크래시/행 아님)로 보입니다. 원인 판정용이 아니라 '상태 확인'에 유용합니다. (신뢰도: 높음)"
                    .to_string()
            }
        };
    }

    if ctx.has_module && !ctx.is_system && !ctx.is_game_exe && ctx.is_hook_framework {
        if !non_hook_who.is_empty() {
            return if en {
                format!(
                    "Crash is reported in {who} (known hook framework), but {basis} points to {non_hook_who}. (Confidence: {non_hook_conf})"
                )
            } else {
                format!(
                    "크래시 위치가 {who}(알려진 훅 프레임워크)로 보고되었지만, {basis}에서는 {non_hook_who} 가 유력합니다. (신뢰도: {non_hook_conf})"
                )
            };
        }
        return if en {
            format!(
                "Top suspect: {who} (known hook framework; may be a victim of another mod's corruption) — the crash appears to occur inside this DLL. (Confidence: Medium)"
            )
        } else {
            format!(
                "유력 후보: {who} (알려진 훅 프레임워크; 다른 모드의 메모리 오염 피해자일 수 있음) — 해당 DLL 내부에서 크래시가 발생한 것으로 보입니다. (신뢰도: 중간)"
            )
        };
    }

    if ctx.has_module && !ctx.is_system && !ctx.is_game_exe {
        return if en {
            format!(
                "Top suspect: {who} — the crash appears to occur inside this DLL. (Confidence: High)"
            )
        } else {
            format!(
                "유력 후보: {who} — 해당 DLL 내부에서 크래시가 발생한 것으로 보입니다. (신뢰도: 높음)"
            )
        };
    }

    if ctx.has_module && ctx.is_system {
        if !non_hook_who.is_empty() && top_is_hook {
            return if en {
                format!(
                    "Crash is reported in a Windows system DLL, but {basis} points to {non_hook_who}. (Confidence: {non_hook_conf})"
                )
            } else {
                format!(
                    "크래시가 Windows 시스템 DLL에서 보고되었지만, {basis}에서는 {non_hook_who} 가 유력합니다. (신뢰도: {non_hook_conf})"
                )
            };
        }
        if !suspect_who.is_empty() {
            return if en {
                format!(
                    "Crash is reported in a Windows system DLL, and the top stack candidate is {suspect_who}. This can still be a victim location rather than the root cause. (Confidence: Low)"
                )
            } else {
                format!(
                    "크래시가 Windows 시스템 DLL에서 보고되었고, 스택 후보 1순위는 {suspect_who} 입니다. 이 경우에도 실제 원인은 다른 DLL/모드일 수 있습니다. (신뢰도: 낮음)"
                )
            };
        }
        if r.exc_code == 0xE06D_7363 {
            return if en {
                "Reported in a Windows system DLL with 0xE06D7363 (C++ exception). Could be normal throw/catch; confirm this was an actual CTD. (Confidence: Low)"
                    .to_string()
            } else {
                "0xE06D7363(C++ 예외)로 Windows 시스템 DLL에서 보고되었습니다. 정상 동작 중 throw/catch일 수도 있어 실제 CTD 여부 확인이 필요합니다. (신뢰도: 낮음)"
                    .to_string()
            };
        }
        return if en {
            "Crash is reported in a Windows system DLL. The real culprit may be another mod/DLL. (Confidence: Low)"
                .to_string()
        } else {
            "크래시가 Windows 시스템 DLL에서 보고되었습니다. 실제 원인은 다른 모드/DLL일 수 있습니다. (신뢰도: 낮음)"
                .to_string()
        };
    }

    if ctx.has_module && ctx.is_game_exe {
        if !non_hook_who.is_empty() && top_is_hook {
            return if en {
                format!(
                    "Crash is reported in the game executable, but {basis} points to {non_hook_who}. (Confidence: {non_hook_conf})"
                )
            } else {
                format!(
                    "크래시 위치가 게임 본체(EXE)로 보고되었지만, {basis}에서는 {non_hook_who} 가 유력합니다. (신뢰도: {non_hook_conf})"
                )
            };
        }
        if top_is_hook && !suspect_who.is_empty() {
            return if en {
                format!(
                    "Crash is reported in the game executable, and the top stack candidate is {suspect_who} (known hook framework). This DLL is often a victim frame owner, so avoid treating it as root cause by itself. (Confidence: Low)"
                )
            } else {
                format!(
                    "크래시 위치가 게임 본체(EXE)로 보고되었고, 스택 후보 1순위는 {suspect_who}(알려진 훅 프레임워크)입니다. 이 DLL은 피해 프레임 소유자로 자주 나타나므로 단독 원인으로 단정하기 어렵습니다. (신뢰도: 낮음)"
                )
            };
        }
        if !suspect_who.is_empty() {
            return if en {
                format!(
                    "Crash is reported in the game executable, and {basis} points to {suspect_who}. (Confidence: {suspect_conf})"
                )
            } else {
                format!(
                    "크래시 위치가 게임 본체(EXE)로 보고되었고, {basis}에서는 {suspect_who} 가 유력합니다. (신뢰도: {suspect_conf})"
                )
            };
        }
        return if en {
            "Crash is reported in the game executable. Version mismatch/hook conflict is possible. (Confidence: Medium)"
                .to_string()
        } else {
            "크래시 위치가 게임 본체(EXE)로 보고되었습니다. 버전 불일치/후킹 충돌 가능성이 있습니다. (신뢰도: 중간)"
                .to_string()
        };
    }

    if ctx.is_hang_like {
        let mut hang_prefix = if en {
            "Likely a freeze/infinite loading.".to_string()
        } else {
            "프리징/무한로딩으로 추정됩니다.".to_string()
        };
        if let Some(w) = &ctx.wct {
            if let Some(cap) = &w.capture {
                if cap.threshold_sec > 0 {
                    hang_prefix = if en {
                        format!(
                            "Hang detected (capture={}, heartbeatAge={:.1}s >= {}s).",
                            cap.kind, cap.seconds_since_heartbeat, cap.threshold_sec
                        )
                    } else {
                        format!(
                            "프리징 감지(capture={}, heartbeatAge={:.1}s >= {}s).",
                            cap.kind, cap.seconds_since_heartbeat, cap.threshold_sec
                        )
                    };
                }
            }
        }
        if !suspect_who.is_empty() {
            return if en {
                format!(
                    "{hang_prefix} Candidate: {suspect_who} — based on {basis} heuristic. (Confidence: {suspect_conf})"
                )
            } else {
                format!(
                    "{hang_prefix} 후보: {suspect_who} — {basis} 기반 추정입니다. (신뢰도: {suspect_conf})"
                )
            };
        }
        return if en {
            format!("{hang_prefix} Dump alone isn't enough to identify a candidate. (Confidence: Low)")
        } else {
            format!("{hang_prefix} 덤프만으로 후보를 특정하기 어렵습니다. (신뢰도: 낮음)")
        };
    }

    if !suspect_who.is_empty() {
        return if en {
            format!(
                "Top suspect: {suspect_who} — based on {basis} heuristic. (Confidence: {suspect_conf})"
            )
        } else {
            format!("유력 후보: {suspect_who} — {basis} 기반 추정입니다. (신뢰도: {suspect_conf})")
        };
    }

    if en {
        "Dump alone isn't enough to identify a top suspect. (Confidence: Low)".to_string()
    } else {
        "덤프만으로 유력 후보를 특정하기 어렵습니다. (신뢰도: 낮음)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{EventRow, SignatureMatch};
    use std::path::PathBuf;

    fn event(t_ms: f64, ty: EventType, a: u64) -> EventRow {
        EventRow {
            t_ms,
            event_type: ty as u16,
            type_name: ty.name().to_string(),
            a,
            tid: 1,
            ..Default::default()
        }
    }

    fn base_result() -> AnalysisResult {
        AnalysisResult {
            dump_path: PathBuf::from("SkyrimSE_Crash_20260105_213015.dmp"),
            language: Language::English,
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_classification_without_signals() {
        let mut r = base_result();
        r.dump_path = PathBuf::from("SkyrimSE_Manual_20260105_213015.dmp");
        let ctx = build_context(&r);
        assert!(ctx.is_snapshot_like);
        assert!(ctx.is_manual_capture);
        assert!(!ctx.is_crash_like);
    }

    #[test]
    fn exception_makes_crash_like() {
        let mut r = base_result();
        r.exc_code = 0xC000_0005;
        let ctx = build_context(&r);
        assert!(ctx.is_crash_like);
        assert!(!ctx.is_snapshot_like);
    }

    #[test]
    fn fresh_heartbeat_reclassifies_hang_name_as_snapshot() {
        let mut r = base_result();
        r.dump_path = PathBuf::from("SkyrimSE_Hang_20260105_213015.dmp");
        r.has_blackbox = true;
        // Heartbeat two seconds before the last event: fresh.
        r.events = vec![
            event(1000.0, EventType::Heartbeat, 0),
            event(3000.0, EventType::Note, 0),
        ];
        let ctx = build_context(&r);
        assert!(!ctx.is_hang_like);
        assert!(ctx.is_snapshot_like);
    }

    #[test]
    fn hang_mark_event_is_hang_like() {
        let mut r = base_result();
        r.dump_path = PathBuf::from("snapshot.dmp");
        r.events = vec![event(5000.0, EventType::HangMark, 0)];
        let ctx = build_context(&r);
        assert!(ctx.is_hang_like);
    }

    #[test]
    fn signature_summary_takes_priority() {
        let mut r = base_result();
        r.exc_code = 0xC000_0005;
        r.signature_match = Some(SignatureMatch {
            id: "D6DDDA_VRAM".into(),
            cause: "Renderer crash".into(),
            confidence: ConfidenceLevel::High,
            recommendations: vec![],
        });
        build_evidence_and_summary(&mut r);
        assert!(r.summary_sentence.starts_with("Known pattern [D6DDDA_VRAM]"));
        assert!(r.summary_sentence.ends_with("(Confidence: High)"));
        assert_eq!(r.evidence[0].title, "Known crash pattern: D6DDDA_VRAM");
    }

    #[test]
    fn every_summary_ends_with_confidence_label() {
        // Non-system DLL fault.
        let mut r = base_result();
        r.exc_code = 0xC000_0005;
        r.fault_module_filename = "hdtSMP64.dll".into();
        r.fault_module_plus_offset = "hdtSMP64.dll+0x1234".into();
        build_evidence_and_summary(&mut r);
        assert!(r.summary_sentence.ends_with("(Confidence: High)"));

        // System DLL fault with no suspects.
        let mut r = base_result();
        r.exc_code = 0xC000_0005;
        r.fault_module_filename = "ntdll.dll".into();
        r.fault_module_is_system = true;
        build_evidence_and_summary(&mut r);
        assert!(r.summary_sentence.ends_with("(Confidence: Low)"));

        // Nothing at all.
        let mut r = base_result();
        r.dump_path = PathBuf::from("plain.dmp");
        build_evidence_and_summary(&mut r);
        assert!(r.summary_sentence.contains("Confidence:"));
    }

    #[test]
    fn hook_framework_fault_prefers_non_hook_suspect() {
        let mut r = base_result();
        r.exc_code = 0xC000_0005;
        r.fault_module_filename = "CrashLoggerSSE.dll".into();
        r.fault_module_is_hook_framework = true;
        r.suspects = vec![
            SuspectItem {
                confidence: ConfidenceLevel::Medium,
                module_filename: "CrashLoggerSSE.dll".into(),
                ..Default::default()
            },
            SuspectItem {
                confidence: ConfidenceLevel::Medium,
                module_filename: "hdtSMP64.dll".into(),
                ..Default::default()
            },
        ];
        build_evidence_and_summary(&mut r);
        // hdtSMP64 is itself a hook framework; with only hook suspects the
        // dedicated hook-framework sentence is used.
        assert!(r.summary_sentence.contains("hook framework"));
    }

    #[test]
    fn hitch_summary_percentiles() {
        let events: Vec<EventRow> = (1..=20)
            .map(|i| event(f64::from(i) * 100.0, EventType::PerfHitch, i as u64 * 10))
            .collect();
        let h = hitch_summary(&events);
        assert_eq!(h.count, 20);
        assert_eq!(h.max_ms, 200);
        assert_eq!(h.p95_ms, 190);
    }

    #[test]
    fn anchor_prefers_crash_event() {
        let mut r = base_result();
        r.events = vec![
            event(1000.0, EventType::Heartbeat, 0),
            event(2000.0, EventType::Crash, 0),
            event(3000.0, EventType::Note, 0),
        ];
        assert_eq!(capture_anchor_ms(&r), Some(2000.0));
    }

    #[test]
    fn pre_freeze_context_sequences_events() {
        let events = vec![
            event(1000.0, EventType::LoadStart, 0),
            event(5000.0, EventType::CellChange, 0),
            event(9000.0, EventType::PerfHitch, 3000),
        ];
        let line = pre_freeze_context_line(&events);
        assert_eq!(line, "LoadStart -> CellChange -> PerfHitch(3000ms)");
    }

    #[test]
    fn near_anchor_window_depends_on_loading_flag() {
        let mut r = base_result();
        r.exc_code = 0xC000_0005;
        r.events = vec![event(20_000.0, EventType::Crash, 0)];
        r.resources = vec![ResourceRow {
            t_ms: 8_000.0, // 12s before anchor
            kind: "nif".into(),
            path: "meshes\\a.nif".into(),
            ..Default::default()
        }];

        build_evidence_and_summary(&mut r);
        assert!(!r
            .evidence
            .iter()
            .any(|e| e.title.contains("Resources loaded near the crash moment")));

        // With the Loading flag the window widens to 15s and the hit lands.
        r.state_flags = state_flags::LOADING;
        build_evidence_and_summary(&mut r);
        assert!(r
            .evidence
            .iter()
            .any(|e| e.title.contains("Resources loaded near the crash moment")));
    }

    #[test]
    fn korean_output_localizes_evidence() {
        let mut r = base_result();
        r.language = Language::Korean;
        r.exc_code = 0xC000_0005;
        r.exc_info = vec![1, 0xDEAD];
        r.fault_module_filename = "hdtSMP64.dll".into();
        r.fault_module_plus_offset = "hdtSMP64.dll+0x10".into();
        build_evidence_and_summary(&mut r);
        assert!(r.evidence.iter().any(|e| e.title == "예외 파라미터 분석"));
        assert!(r.summary_sentence.contains("신뢰도"));
        assert!(r.recommendations.iter().any(|s| s.starts_with("[기본]")));
    }

    #[test]
    fn recommendations_tagged_by_category() {
        let mut r = base_result();
        r.exc_code = 0xE06D_7363;
        build_evidence_and_summary(&mut r);
        assert!(r.recommendations.iter().any(|s| s.starts_with("[Basics]")));
        assert!(r
            .recommendations
            .iter()
            .any(|s| s.starts_with("[Interpretation]")));
    }
}
