//! Crash Logger SSE/AE sidecar log discovery and parsing.
//!
//! Crash Logger writes its own text log at crash time. When a log exists
//! close in time to the dump it corroborates (or contradicts) the
//! engine's own stackwalk, so the parser extracts the top callstack
//! modules, the tool version, and any C++ exception details. Everything
//! here is best-effort: a parse failure yields empty results, never an
//! error.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use tracing::debug;

/// Logs farther than this from the dump are not attached.
const MAX_LOG_DISTANCE_SECS: i64 = 30 * 60;
/// Signature check reads at most this much of a candidate file.
const SIGNATURE_PREFIX_BYTES: u64 = 256 * 1024;
/// Top modules returned from one log.
const MAX_TOP_MODULES: usize = 8;

/// C++ exception block fields from a crash log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CppExceptionDetails {
    pub exc_type: String,
    pub info: String,
    pub throw_location: String,
    pub module: String,
}

fn digits_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parses the dump filename's `YYYYMMDD_HHMMSS` token (local time).
/// Byte-wise so non-ASCII filenames around the token are harmless.
pub fn parse_dump_timestamp_token(stem: &str) -> Option<NaiveDateTime> {
    let b = stem.as_bytes();
    let mut best = None;
    for i in 0..b.len().saturating_sub(14) {
        if b[i + 8] != b'_' {
            continue;
        }
        if !b[i..i + 8].iter().all(u8::is_ascii_digit)
            || !b[i + 9..i + 15].iter().all(u8::is_ascii_digit)
        {
            continue;
        }
        best = Some(i);
    }
    let i = best?;
    let d = NaiveDate::from_ymd_opt(
        digits_u32(&b[i..i + 4])? as i32,
        digits_u32(&b[i + 4..i + 6])?,
        digits_u32(&b[i + 6..i + 8])?,
    )?;
    d.and_hms_opt(
        digits_u32(&b[i + 9..i + 11])?,
        digits_u32(&b[i + 11..i + 13])?,
        digits_u32(&b[i + 13..i + 15])?,
    )
}

/// Parses a crash log filename's `YYYY-MM-DD-HH-MM-SS` token (local time).
pub fn parse_crashlog_timestamp_token(stem: &str) -> Option<NaiveDateTime> {
    let b = stem.as_bytes();
    for i in 0..b.len().saturating_sub(18) {
        let v = &b[i..i + 19];
        if v[4] != b'-' || v[7] != b'-' || v[10] != b'-' || v[13] != b'-' || v[16] != b'-' {
            continue;
        }
        let fields = [
            digits_u32(&v[0..4]),
            digits_u32(&v[5..7]),
            digits_u32(&v[8..10]),
            digits_u32(&v[11..13]),
            digits_u32(&v[14..16]),
            digits_u32(&v[17..19]),
        ];
        let [Some(y), Some(mo), Some(d), Some(hh), Some(mm), Some(ss)] = fields else {
            continue;
        };
        let date = NaiveDate::from_ymd_opt(y as i32, mo, d)?;
        return date.and_hms_opt(hh, mm, ss);
    }
    None
}

fn mtime_local(path: &Path) -> Option<NaiveDateTime> {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    Some(DateTime::<Local>::from(mtime).naive_local())
}

/// The dump's best-effort capture time: the filename token, else mtime,
/// else now.
pub fn best_effort_dump_timestamp(dump_path: &Path) -> NaiveDateTime {
    let stem = dump_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_dump_timestamp_token(&stem)
        .or_else(|| mtime_local(dump_path))
        .unwrap_or_else(|| Local::now().naive_local())
}

/// Heuristic signature check on a log prefix.
pub fn looks_like_crash_logger_text(prefix: &str) -> bool {
    let lower = prefix.to_lowercase();
    if !lower.contains("crashlogger") {
        return false;
    }
    lower.contains("crash time:")
        || lower.contains("thread dump")
        || lower.contains("probable call stack")
        || lower.contains("process info:")
}

/// Candidate directories: the user's Documents SKSE trees plus MO2
/// overwrite/profile trees when an MO2 base is known.
pub fn candidate_log_dirs(mo2_base: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let subdirs = ["", "CrashLogger", "CrashLogs", "Crashlogs"];

    if let Some(docs) = dirs::document_dir() {
        for game in ["Skyrim Special Edition", "Skyrim VR"] {
            let root = docs.join("My Games").join(game).join("SKSE");
            for sub in subdirs {
                let d = if sub.is_empty() { root.clone() } else { root.join(sub) };
                if d.is_dir() {
                    dirs.push(d);
                }
            }
        }
    }

    if let Some(base) = mo2_base {
        let overwrite = base.join("overwrite").join("SKSE");
        for sub in subdirs {
            let d = if sub.is_empty() { overwrite.clone() } else { overwrite.join(sub) };
            if d.is_dir() {
                dirs.push(d);
            }
        }
        let profiles = base.join("profiles");
        if let Ok(entries) = fs::read_dir(&profiles) {
            for ent in entries.flatten() {
                let p = ent.path();
                if !p.is_dir() {
                    continue;
                }
                let root = p.join("SKSE");
                for sub in subdirs {
                    let d = if sub.is_empty() { root.clone() } else { root.join(sub) };
                    if d.is_dir() {
                        dirs.push(d);
                    }
                }
            }
        }
    }
    dirs
}

/// The closest-in-time matching log across the candidate directories,
/// gated at 30 minutes from the dump timestamp.
pub fn find_closest_log(dump_time: NaiveDateTime, dirs: &[PathBuf]) -> Option<PathBuf> {
    let mut best: Option<(i64, PathBuf)> = None;

    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        for ent in entries.flatten() {
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            let ext = p
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if ext != "log" && ext != "txt" {
                continue;
            }

            let stem = p
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(log_time) = parse_crashlog_timestamp_token(&stem).or_else(|| mtime_local(&p))
            else {
                continue;
            };

            let Ok(prefix) = read_prefix(&p, SIGNATURE_PREFIX_BYTES) else {
                continue;
            };
            if !looks_like_crash_logger_text(&prefix) {
                continue;
            }

            let diff = (log_time - dump_time).num_seconds().abs();
            if best.as_ref().is_none_or(|(d, _)| diff < *d) {
                best = Some((diff, p));
            }
        }
    }

    match best {
        Some((diff, path)) if diff <= MAX_LOG_DISTANCE_SECS => {
            debug!("crash logger log matched at {diff}s distance: {:?}", path);
            Some(path)
        }
        _ => None,
    }
}

/// Discovery entry point for one dump.
pub fn find_log_for_dump(dump_path: &Path, mo2_base: Option<&Path>) -> Option<PathBuf> {
    let dump_time = best_effort_dump_timestamp(dump_path);
    let dirs = candidate_log_dirs(mo2_base);
    find_closest_log(dump_time, &dirs)
}

fn read_prefix(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    use std::io::Read;
    let file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.take(max_bytes).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// The `CrashLoggerSSE vX.Y.Z` token from the log header.
pub fn parse_version(log_text: &str) -> Option<String> {
    for line in log_text.lines().take(32) {
        let lower = line.to_ascii_lowercase();
        let Some(cl_pos) = lower.find("crashloggersse") else {
            continue;
        };
        let Some(v_rel) = lower[cl_pos..].find('v') else {
            continue;
        };
        let v_pos = cl_pos + v_rel;
        let after = &line[v_pos + 1..];
        if !after.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            continue;
        }
        let end = after
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-' || c.is_ascii_alphabetic()))
            .map_or(after.len(), |(i, _)| i);
        if end == 0 {
            continue;
        }
        return Some(line[v_pos..v_pos + 1 + end].to_string());
    }
    None
}

/// Extracts the first `<name>.(dll|exe)+<hex>` token from a line.
fn extract_module_plus_offset_token(line: &str) -> Option<&str> {
    let lower = line.to_ascii_lowercase();
    let pos = lower.find(".dll+").or_else(|| lower.find(".exe+"))?;
    let plus_end = pos + 5;

    let mut start = pos;
    while start > 0 {
        let c = line.as_bytes()[start - 1];
        if c == b' ' || c == b'\t' {
            break;
        }
        start -= 1;
    }
    let mut end = plus_end;
    while end < line.len() && line.as_bytes()[end].is_ascii_hexdigit() {
        end += 1;
    }
    (end > start).then(|| &line[start..end])
}

fn is_systemish_lower(filename: &str) -> bool {
    crate::modules::is_systemish_filename(filename) || crate::modules::is_game_exe(filename)
}

/// Aggregates callstack modules from either log dialect and returns up to
/// eight lowercase filenames, most frequent first, ties alphabetical.
pub fn parse_top_modules(log_text: &str) -> Vec<String> {
    let is_thread_dump = log_text.to_lowercase().contains("thread dump");
    let mut freq: std::collections::HashMap<String, u32> = std::collections::HashMap::new();

    let mut in_stack = false;
    let mut in_thread_callstack = false;
    for line in log_text.lines() {
        let line = line.trim_end_matches('\r');
        let lower = line.to_lowercase();

        if is_thread_dump {
            if !in_thread_callstack {
                if lower.contains("callstack:") {
                    in_thread_callstack = true;
                }
                continue;
            }
            if line.is_empty() || line.starts_with('=') {
                in_thread_callstack = false;
                continue;
            }
        } else {
            if !in_stack {
                if lower.contains("probable call stack") {
                    in_stack = true;
                }
                continue;
            }
            if line.is_empty() || lower.contains("registers:") || lower.contains("modules:") {
                break;
            }
        }

        let Some(token) = extract_module_plus_offset_token(line) else {
            continue;
        };
        let token_lower = token.to_lowercase();
        let Some((module, _)) = token_lower.split_once('+') else {
            continue;
        };
        if module.is_empty() {
            continue;
        }
        *freq.entry(module.to_string()).or_insert(0) += 1;
    }

    let mut rows: Vec<(String, u32)> = freq.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    rows.into_iter()
        .map(|(module, _)| module)
        .filter(|m| !is_systemish_lower(m))
        .take(MAX_TOP_MODULES)
        .collect()
}

/// Parses the `C++ EXCEPTION:` block's indented `Type/Info/Throw
/// Location/Module` fields.
pub fn parse_cpp_exception(log_text: &str) -> Option<CppExceptionDetails> {
    let mut in_block = false;
    let mut out = CppExceptionDetails::default();
    let mut got_any = false;

    for line in log_text.lines() {
        let line = line.trim_end_matches('\r');
        if !in_block {
            if line.to_lowercase().contains("c++ exception:") {
                in_block = true;
            }
            continue;
        }
        if line.is_empty() {
            break;
        }
        let first = line.as_bytes()[0];
        if first != b'\t' && first != b' ' {
            break;
        }
        let trimmed = line.trim_start();
        let mut try_field = |key: &str, dst: &mut String| {
            if trimmed.len() >= key.len() && trimmed[..key.len()].eq_ignore_ascii_case(key) {
                *dst = trimmed[key.len()..].trim().to_string();
                got_any = true;
                true
            } else {
                false
            }
        };
        if try_field("Type:", &mut out.exc_type) {
            continue;
        }
        if try_field("Info:", &mut out.info) {
            continue;
        }
        if try_field("Throw Location:", &mut out.throw_location) {
            continue;
        }
        if try_field("Module:", &mut out.module) {
            continue;
        }
    }

    got_any.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRASH_LOG: &str = "CrashLoggerSSE v1.15.0\n\
        CRASH TIME: 2026-01-05 21:30:11\n\
        \n\
        PROBABLE CALL STACK:\n\
        \t[0] 0x7FF712D6DDDA SkyrimSE.exe+D6DDDA\n\
        \t[1] 0x7FFA12003344 hdtSMP64.dll+3344\n\
        \t[2] 0x7FFA12005566 hdtSMP64.dll+5566\n\
        \t[3] 0x7FFB00112233 MuJointFix.dll+2233\n\
        \t[4] 0x7FFC00000001 ntdll.dll+1122\n\
        REGISTERS:\n\
        \tRAX 0x0\n";

    const THREAD_DUMP_LOG: &str = "CrashLoggerSSE v1.15.0 THREAD DUMP\n\
        ============\n\
        Thread 1234\n\
        Callstack:\n\
        \tSkyrimSE.exe+11111\n\
        \thdtSMP64.dll+22222\n\
        \n\
        Thread 5678\n\
        Callstack:\n\
        \thdtSMP64.dll+33333\n\
        ============\n";

    #[test]
    fn signature_heuristic() {
        assert!(looks_like_crash_logger_text(CRASH_LOG));
        assert!(looks_like_crash_logger_text(THREAD_DUMP_LOG));
        assert!(!looks_like_crash_logger_text("some unrelated log"));
    }

    #[test]
    fn parses_version_token() {
        assert_eq!(parse_version(CRASH_LOG).as_deref(), Some("v1.15.0"));
        assert_eq!(parse_version("no version here"), None);
    }

    #[test]
    fn crash_dialect_top_modules() {
        let modules = parse_top_modules(CRASH_LOG);
        // hdtSMP64 twice, MuJointFix once; system and game exe dropped.
        assert_eq!(modules, vec!["hdtsmp64.dll", "mujointfix.dll"]);
    }

    #[test]
    fn thread_dump_dialect_top_modules() {
        let modules = parse_top_modules(THREAD_DUMP_LOG);
        assert_eq!(modules, vec!["hdtsmp64.dll"]);
    }

    #[test]
    fn cpp_exception_block() {
        let log = "CrashLoggerSSE v1.15.0\nCRASH TIME: x\n\
            C++ EXCEPTION:\n\
            \tType: std::bad_alloc\n\
            \tInfo: allocation failure\n\
            \tThrow Location: BSSmallBlockAllocator.cpp:123\n\
            \tModule: hdtSMP64.dll\n\
            \n";
        let details = parse_cpp_exception(log).unwrap();
        assert_eq!(details.exc_type, "std::bad_alloc");
        assert_eq!(details.module, "hdtSMP64.dll");
        assert!(parse_cpp_exception("no block").is_none());
    }

    #[test]
    fn dump_timestamp_token() {
        let ts = parse_dump_timestamp_token("SkyrimSE_Crash_20260105_213015").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-05 21:30:15");
        assert!(parse_dump_timestamp_token("no_token_here").is_none());
    }

    #[test]
    fn crashlog_timestamp_token() {
        let ts = parse_crashlog_timestamp_token("crash-2026-01-05-21-25-00").unwrap();
        assert_eq!(ts.format("%H:%M:%S").to_string(), "21:25:00");
        assert!(parse_crashlog_timestamp_token("crash-2026-99-05-21-25-00").is_none());
    }

    #[test]
    fn proximity_gating_picks_closest_and_rejects_far() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("SKSE");
        std::fs::create_dir_all(&logs).unwrap();
        // 10 minutes away: acceptable. 45 minutes away: too far.
        std::fs::write(logs.join("crash-2026-01-05-21-20-00.log"), CRASH_LOG).unwrap();
        std::fs::write(logs.join("crash-2026-01-05-20-45-00.log"), CRASH_LOG).unwrap();
        // Close in time but not a crash logger log.
        std::fs::write(logs.join("crash-2026-01-05-21-29-00.log"), "unrelated").unwrap();

        let dump_time = parse_dump_timestamp_token("Dump_20260105_213000").unwrap();
        let found = find_closest_log(dump_time, &[logs.clone()]).unwrap();
        assert_eq!(
            found.file_name().unwrap().to_string_lossy(),
            "crash-2026-01-05-21-20-00.log"
        );

        // With only the distant log present, nothing is attached.
        std::fs::remove_file(logs.join("crash-2026-01-05-21-20-00.log")).unwrap();
        std::fs::remove_file(logs.join("crash-2026-01-05-21-29-00.log")).unwrap();
        assert!(find_closest_log(dump_time, &[logs]).is_none());
    }
}
