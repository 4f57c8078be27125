//! Stable crash-bucket keys for incident deduplication.
//!
//! Canonical form: `exc=0xHEX|mod=<lowered,trimmed>|f0=...|f1=...` over at
//! most six frames, with non-ASCII code points replaced by `?` so the key
//! is stable across locales, hashed with FNV-1a/64.

use crate::report::AnalysisResult;

const MAX_BUCKET_FRAMES: usize = 6;

fn lower_trimmed_ascii(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| {
            if c.is_ascii() {
                c.to_ascii_lowercase()
            } else {
                '?'
            }
        })
        .collect()
}

fn fnv1a64(s: &str) -> u64 {
    let mut h: u64 = 0xCBF2_9CE4_8422_2325;
    for b in s.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100_0000_01B3);
    }
    h
}

/// Computes `CTD-<16 lowercase hex>` from the incident identity tuple.
pub fn compute_bucket_key(exc_code: u32, fault_module: &str, frames: &[String]) -> String {
    let mut canonical = format!("exc=0x{exc_code:x}|mod={}", lower_trimmed_ascii(fault_module));
    for (i, frame) in frames.iter().take(MAX_BUCKET_FRAMES).enumerate() {
        canonical.push_str(&format!("|f{i}={}", lower_trimmed_ascii(frame)));
    }
    format!("CTD-{:016x}", fnv1a64(&canonical))
}

/// Selects bucket frames from the result: stackwalk frames first, then
/// suspect filenames, then the bare fault module+offset.
pub fn compute_result_bucket_key(result: &AnalysisResult) -> String {
    let frames: Vec<String> = if !result.stackwalk_primary_frames.is_empty() {
        result
            .stackwalk_primary_frames
            .iter()
            .take(MAX_BUCKET_FRAMES)
            .cloned()
            .collect()
    } else if !result.suspects.is_empty() {
        result
            .suspects
            .iter()
            .take(4)
            .map(|s| s.module_filename.clone())
            .collect()
    } else if !result.fault_module_plus_offset.is_empty() {
        vec![result.fault_module_plus_offset.clone()]
    } else {
        Vec::new()
    };

    let fault_module = if result.fault_module_filename.is_empty() {
        &result.fault_module_plus_offset
    } else {
        &result.fault_module_filename
    };
    compute_bucket_key(result.exc_code, fault_module, &frames)
}
