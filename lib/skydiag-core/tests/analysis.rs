//! End-to-end analysis over synthetic minidumps.
//!
//! Each test lays out a minimal but structurally valid dump (header,
//! stream directory, typed stream bodies) on disk, runs the full pass,
//! and checks the produced result and output artifacts.

use std::path::{Path, PathBuf};

use skydiag_core::analyzer::{analyze, AnalyzeOptions};
use skydiag_core::i18n::{ConfidenceLevel, Language};
use skydiag_core::output::{write_outputs, SummaryDoc};

const MINIDUMP_SIGNATURE: u32 = 0x504D_444D;
const HEADER_SIZE: usize = 32;
const DIR_ENTRY_SIZE: usize = 12;
const MODULE_ENTRY_SIZE: usize = 108;
const THREAD_ENTRY_SIZE: usize = 48;

const STREAM_THREAD_LIST: u32 = 3;
const STREAM_MODULE_LIST: u32 = 4;
const STREAM_MEMORY_LIST: u32 = 5;
const STREAM_EXCEPTION: u32 = 6;
const STREAM_BLACKBOX: u32 = 0x10000 + 0x5344;
const STREAM_WCT: u32 = 0x10000 + 0x5743;
/// Unclaimed stream number used to park raw payload bytes (context
/// records, stack memory) at a known RVA.
const STREAM_SCRATCH: u32 = 0x9999;

fn serialize_dump(streams: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let dir_off = HEADER_SIZE;
    let mut out = Vec::new();
    out.extend_from_slice(&MINIDUMP_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&0xA793u32.to_le_bytes());
    out.extend_from_slice(&(streams.len() as u32).to_le_bytes());
    out.extend_from_slice(&(dir_off as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&0u64.to_le_bytes());

    let mut cursor = (dir_off + streams.len() * DIR_ENTRY_SIZE) as u32;
    for (kind, body) in streams {
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&cursor.to_le_bytes());
        cursor += body.len() as u32;
    }
    for (_, body) in streams {
        out.extend_from_slice(body);
    }
    out
}

/// File offset of stream body `index` given all body sizes.
fn body_rva(sizes: &[usize], index: usize) -> u32 {
    let mut off = HEADER_SIZE + sizes.len() * DIR_ENTRY_SIZE;
    for size in &sizes[..index] {
        off += size;
    }
    off as u32
}

fn encode_utf16_string(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut out = ((units.len() * 2) as u32).to_le_bytes().to_vec();
    for u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

/// Encodes a ModuleList whose name strings live inside the same stream
/// body, after the fixed-size entries.
fn encode_module_list(modules: &[(u64, u32, &str)], list_rva: u32) -> Vec<u8> {
    let entries_len = 4 + modules.len() * MODULE_ENTRY_SIZE;
    let mut heap: Vec<u8> = Vec::new();
    let mut body = (modules.len() as u32).to_le_bytes().to_vec();
    for (base, size, path) in modules {
        let name_rva = list_rva + (entries_len + heap.len()) as u32;
        heap.extend_from_slice(&encode_utf16_string(path));

        let mut entry = vec![0u8; MODULE_ENTRY_SIZE];
        entry[0..8].copy_from_slice(&base.to_le_bytes());
        entry[8..12].copy_from_slice(&size.to_le_bytes());
        entry[20..24].copy_from_slice(&name_rva.to_le_bytes());
        body.extend_from_slice(&entry);
    }
    body.extend_from_slice(&heap);
    body
}

fn encode_thread_list(threads: &[(u32, u64, u32, u32, u32, u32)]) -> Vec<u8> {
    // (tid, stack_start, stack_size, stack_rva, context_size, context_rva)
    let mut body = (threads.len() as u32).to_le_bytes().to_vec();
    for (tid, stack_start, stack_size, stack_rva, context_size, context_rva) in threads {
        let mut entry = vec![0u8; THREAD_ENTRY_SIZE];
        entry[0..4].copy_from_slice(&tid.to_le_bytes());
        entry[16..24].copy_from_slice(&stack_start.to_le_bytes());
        entry[24..28].copy_from_slice(&stack_size.to_le_bytes());
        entry[28..32].copy_from_slice(&stack_rva.to_le_bytes());
        entry[32..36].copy_from_slice(&context_size.to_le_bytes());
        entry[36..40].copy_from_slice(&context_rva.to_le_bytes());
        body.extend_from_slice(&entry);
    }
    body
}

fn encode_context(rip: u64, rsp: u64, rbp: u64) -> Vec<u8> {
    let mut out = vec![0u8; 0x100];
    out[0x98..0xA0].copy_from_slice(&rsp.to_le_bytes());
    out[0xA0..0xA8].copy_from_slice(&rbp.to_le_bytes());
    out[0xF8..0x100].copy_from_slice(&rip.to_le_bytes());
    out
}

fn encode_exception(code: u32, tid: u32, addr: u64, ctx_rva: u32, ctx_size: u32) -> Vec<u8> {
    let mut body = vec![0u8; 168];
    body[0..4].copy_from_slice(&tid.to_le_bytes());
    body[8..12].copy_from_slice(&code.to_le_bytes());
    body[24..32].copy_from_slice(&addr.to_le_bytes());
    body[160..164].copy_from_slice(&ctx_size.to_le_bytes());
    body[164..168].copy_from_slice(&ctx_rva.to_le_bytes());
    body
}

fn encode_memory_list(ranges: &[(u64, u32, u32)]) -> Vec<u8> {
    let mut body = (ranges.len() as u32).to_le_bytes().to_vec();
    for (start, size, rva) in ranges {
        body.extend_from_slice(&start.to_le_bytes());
        body.extend_from_slice(&size.to_le_bytes());
        body.extend_from_slice(&rva.to_le_bytes());
    }
    body
}

fn repo_data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..").join("data")
}

fn test_options(dir: &Path) -> AnalyzeOptions {
    AnalyzeOptions {
        language: Language::English,
        data_dir: Some(repo_data_dir()),
        history_path: Some(dir.join("history.json")),
        ..Default::default()
    }
}

const GAME_BASE: u64 = 0x1_4000_0000;
const NTDLL_BASE: u64 = 0x7FFA_0000_0000;
const MOD_BASE: u64 = 0x7FFB_0000_0000;
const STACK_START: u64 = 0xE0_0000_0000;

/// A structurally complete crash dump: three modules, one thread with a
/// walkable stack, and an access violation inside a mod DLL.
fn write_crash_dump(dir: &Path, name: &str) -> PathBuf {
    let modules: &[(u64, u32, &str)] = &[
        (GAME_BASE, 0x0200_0000, "C:\\Games\\Skyrim\\SkyrimSE.exe"),
        (NTDLL_BASE, 0x0020_0000, "C:\\Windows\\System32\\ntdll.dll"),
        (
            MOD_BASE,
            0x0010_0000,
            "D:\\MO2\\mods\\Joint Fix\\SKSE\\Plugins\\MuJointFix.dll",
        ),
    ];

    // Stack: one frame-pointer link then a scanned return address.
    let mut stack = vec![0u8; 0x200];
    stack[0..8].copy_from_slice(&(STACK_START + 0x20).to_le_bytes());
    stack[8..16].copy_from_slice(&(MOD_BASE + 0x2000).to_le_bytes());
    stack[0x28..0x30].copy_from_slice(&(GAME_BASE + 0x1000).to_le_bytes());

    let ctx = encode_context(MOD_BASE + 0x1234, STACK_START, STACK_START);

    // Stream plan: module list, thread list, exception, memory list,
    // context scratch, stack scratch.
    let module_list_probe = encode_module_list(modules, 0);
    let thread_list_len = 4 + THREAD_ENTRY_SIZE;
    let sizes = [
        module_list_probe.len(),
        thread_list_len,
        168,
        4 + 16,
        ctx.len(),
        stack.len(),
    ];

    let module_list = encode_module_list(modules, body_rva(&sizes, 0));
    let ctx_rva = body_rva(&sizes, 4);
    let stack_rva = body_rva(&sizes, 5);
    let thread_list = encode_thread_list(&[(
        42,
        STACK_START,
        stack.len() as u32,
        stack_rva,
        ctx.len() as u32,
        ctx_rva,
    )]);
    let exception = encode_exception(0xC000_0005, 42, MOD_BASE + 0x1234, ctx_rva, ctx.len() as u32);
    let memory_list = encode_memory_list(&[(STACK_START, stack.len() as u32, stack_rva)]);

    let dump = serialize_dump(&[
        (STREAM_MODULE_LIST, module_list),
        (STREAM_THREAD_LIST, thread_list),
        (STREAM_EXCEPTION, exception),
        (STREAM_MEMORY_LIST, memory_list),
        (STREAM_SCRATCH, ctx),
        (STREAM_SCRATCH, stack),
    ]);
    let path = dir.join(name);
    std::fs::write(&path, dump).unwrap();
    path
}

#[test]
fn crash_dump_produces_mod_suspect_and_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = write_crash_dump(dir.path(), "SkyrimSE_Crash_20260105_213015.dmp");
    let opts = test_options(dir.path());

    let result = analyze(&dump_path, &opts).unwrap();

    assert_eq!(result.exc_code, 0xC000_0005);
    assert_eq!(result.exc_tid, 42);
    assert_eq!(result.fault_module_filename, "MuJointFix.dll");
    assert_eq!(result.fault_module_plus_offset, "MuJointFix.dll+0x1234");
    assert_eq!(result.inferred_mod_name, "Joint Fix");

    // Suspect slot 0 is the mod DLL, never the OS or the game exe.
    assert!(result.suspects_from_stackwalk);
    let top = &result.suspects[0];
    assert_eq!(top.module_filename, "MuJointFix.dll");
    assert_eq!(top.confidence, ConfidenceLevel::High);

    // Stackwalk invariants: bounded, non-zero frames.
    assert!(!result.stackwalk_primary_frames.is_empty());
    assert!(result.stackwalk_primary_frames.len() <= 128);
    assert!(result
        .stackwalk_primary_frames
        .iter()
        .any(|f| f.starts_with("MuJointFix.dll+0x")));

    assert!(result.summary_sentence.contains("Joint Fix (MuJointFix.dll)"));
    assert!(result.summary_sentence.ends_with("(Confidence: High)"));
    assert!(result.crash_bucket_key.starts_with("CTD-"));

    // Full output cycle: summary JSON round-trips.
    let mut result = result;
    result.out_dir = Some(dir.path().to_path_buf());
    write_outputs(&result, true).unwrap();
    let summary_path = dir
        .path()
        .join("SkyrimSE_Crash_20260105_213015_SkyrimDiagSummary.json");
    let parsed: SummaryDoc =
        serde_json::from_str(&std::fs::read_to_string(summary_path).unwrap()).unwrap();
    assert_eq!(parsed.exception.code, 0xC000_0005);
    assert_eq!(parsed.suspects[0].module_filename, "MuJointFix.dll");
    assert!(SummaryDoc::accepts_schema(parsed.schema.version));
}

#[test]
fn bucket_key_is_stable_and_history_counts_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = write_crash_dump(dir.path(), "SkyrimSE_Crash_20260105_220000.dmp");
    let opts = test_options(dir.path());

    let first = analyze(&dump_path, &opts).unwrap();
    let second = analyze(&dump_path, &opts).unwrap();

    assert_eq!(first.crash_bucket_key, second.crash_bucket_key);
    assert_eq!(second.history_correlation.count, 2);
    assert!(second.history_correlation.first_seen <= second.history_correlation.last_seen);
    // The repeat surfaces as high-confidence evidence.
    assert!(second
        .evidence
        .iter()
        .any(|e| e.title == "Repeated crash pattern"));
}

#[test]
fn module_list_overrun_is_ignored_but_pass_completes() {
    let dir = tempfile::tempdir().unwrap();
    // ModuleList declares 100 modules but carries bytes for none.
    let module_list = 100u32.to_le_bytes().to_vec();
    let dump = serialize_dump(&[(STREAM_MODULE_LIST, module_list)]);
    let dump_path = dir.path().join("SkyrimSE_Crash_20260101_000000.dmp");
    std::fs::write(&dump_path, dump).unwrap();

    let opts = test_options(dir.path());
    let result = analyze(&dump_path, &opts).unwrap();
    assert!(result.suspects.is_empty());
    assert!(result.fault_module_filename.is_empty());
    assert!(!result.summary_sentence.is_empty());

    // The engine still writes a summary with empty suspects.
    let mut result = result;
    result.out_dir = Some(dir.path().to_path_buf());
    write_outputs(&result, true).unwrap();
    let parsed: SummaryDoc = serde_json::from_str(
        &std::fs::read_to_string(
            dir.path()
                .join("SkyrimSE_Crash_20260101_000000_SkyrimDiagSummary.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert!(parsed.suspects.is_empty());
}

#[test]
fn known_signature_pattern_wins_the_summary() {
    let dir = tempfile::tempdir().unwrap();

    // Fault inside the game exe at the known renderer offset.
    let modules: &[(u64, u32, &str)] =
        &[(GAME_BASE, 0x0200_0000, "C:\\Games\\Skyrim\\SkyrimSE.exe")];
    let module_list_probe = encode_module_list(modules, 0);
    let sizes = [module_list_probe.len(), 168];
    let module_list = encode_module_list(modules, body_rva(&sizes, 0));
    let exception = encode_exception(0xC000_0005, 7, GAME_BASE + 0xD6DDDA, 0, 0);
    let dump = serialize_dump(&[
        (STREAM_MODULE_LIST, module_list),
        (STREAM_EXCEPTION, exception),
    ]);
    let dump_path = dir.path().join("SkyrimSE_Crash_20260110_120000.dmp");
    std::fs::write(&dump_path, dump).unwrap();

    // A local signature database keyed on module+offset alone.
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(
        data_dir.join("crash_signatures.json"),
        r#"{
          "version": 1,
          "signatures": [{
            "id": "D6DDDA_VRAM",
            "match": {
              "exc_code": "0xC0000005",
              "fault_module": "SkyrimSE.exe",
              "fault_offset_regex": "^D6DDDA$"
            },
            "diagnosis": {
              "cause_en": "Renderer crash commonly tied to VRAM exhaustion",
              "confidence": "high",
              "recommendations_en": ["Lower texture resolution"]
            }
          }]
        }"#,
    )
    .unwrap();

    let opts = AnalyzeOptions {
        language: Language::English,
        data_dir: Some(data_dir),
        history_path: Some(dir.path().join("history.json")),
        ..Default::default()
    };
    let result = analyze(&dump_path, &opts).unwrap();

    let sig = result.signature_match.as_ref().unwrap();
    assert_eq!(sig.id, "D6DDDA_VRAM");
    assert!(result.summary_sentence.starts_with("Known pattern [D6DDDA_VRAM]"));
    assert_eq!(result.evidence[0].title, "Known crash pattern: D6DDDA_VRAM");
}

#[test]
fn missing_master_sidecar_flows_into_diagnosis() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = write_crash_dump(dir.path(), "SkyrimSE_Crash_20260111_090000.dmp");

    std::fs::write(
        dir.path()
            .join("SkyrimSE_Crash_20260111_090000_SkyrimDiagPlugins.json"),
        r#"{
          "game_exe_version": "1.6.1170.0",
          "plugins_source": "mo2_profile",
          "mo2_detected": true,
          "plugins": [
            {"filename": "A.esm", "header_version": 1.70, "is_esl": false, "is_active": true, "masters": []},
            {"filename": "B.esp", "header_version": 1.70, "is_esl": false, "is_active": true,
             "masters": ["A.esm", "MissingMaster.esm"]}
          ]
        }"#,
    )
    .unwrap();

    let opts = test_options(dir.path());
    let result = analyze(&dump_path, &opts).unwrap();

    assert_eq!(result.missing_masters, vec!["MissingMaster.esm"]);
    assert!(result
        .plugin_diagnostics
        .iter()
        .any(|d| d.rule_id == "MISSING_MASTER"));
    assert!(result
        .evidence
        .iter()
        .any(|e| e.title == "Missing plugin masters detected"));
}

#[test]
fn wct_snapshot_dump_classifies_as_manual() {
    let dir = tempfile::tempdir().unwrap();

    let wct = br#"{
      "threads": [{"tid": 10, "isCycle": false, "nodes": []}],
      "capture": {"kind": "manual", "secondsSinceHeartbeat": 0.5, "thresholdSec": 10, "isLoading": false}
    }"#
    .to_vec();
    let modules: &[(u64, u32, &str)] =
        &[(GAME_BASE, 0x0200_0000, "C:\\Games\\Skyrim\\SkyrimSE.exe")];
    let module_list_probe = encode_module_list(modules, 0);
    let sizes = [module_list_probe.len(), wct.len()];
    let module_list = encode_module_list(modules, body_rva(&sizes, 0));
    let dump = serialize_dump(&[(STREAM_MODULE_LIST, module_list), (STREAM_WCT, wct)]);
    let dump_path = dir.path().join("SkyrimSE_Manual_20260112_100000.dmp");
    std::fs::write(&dump_path, dump).unwrap();

    let opts = test_options(dir.path());
    let result = analyze(&dump_path, &opts).unwrap();

    assert!(result.has_wct);
    assert!(result.summary_sentence.contains("manual snapshot"));
    assert!(result
        .recommendations
        .iter()
        .any(|s| s.starts_with("[Snapshot]") || s.starts_with("[Manual]")));

    // The embedded WCT document is copied out verbatim.
    let mut result = result;
    result.out_dir = Some(dir.path().to_path_buf());
    write_outputs(&result, true).unwrap();
    assert!(dir
        .path()
        .join("SkyrimSE_Manual_20260112_100000_SkyrimDiagWct.json")
        .exists());
}

#[test]
fn blackbox_events_survive_the_pass_and_reach_jsonl() {
    let dir = tempfile::tempdir().unwrap();

    // Blackbox stream: 64-byte header + 4 event slots of 56 bytes.
    let capacity = 4u32;
    let mut bb = vec![0u8; 64];
    bb[0..4].copy_from_slice(&0x5344_4941u32.to_le_bytes()); // 'SDIA'
    bb[4..8].copy_from_slice(&2u32.to_le_bytes());
    bb[8..12].copy_from_slice(&7777u32.to_le_bytes()); // pid
    bb[12..16].copy_from_slice(&capacity.to_le_bytes());
    bb[16..24].copy_from_slice(&1000u64.to_le_bytes()); // qpc freq
    bb[44..48].copy_from_slice(&2u32.to_le_bytes()); // write_index
    for (seq, ev_type, qpc) in [(2u32, 2u16, 5000u64), (2, 100, 9000)] {
        let mut slot = vec![0u8; 56];
        slot[0..4].copy_from_slice(&seq.to_le_bytes());
        slot[4..8].copy_from_slice(&11u32.to_le_bytes()); // tid
        slot[8..16].copy_from_slice(&qpc.to_le_bytes());
        slot[16..18].copy_from_slice(&ev_type.to_le_bytes());
        bb.extend_from_slice(&slot);
    }
    bb.extend_from_slice(&vec![0u8; 2 * 56]); // remaining empty slots

    let modules: &[(u64, u32, &str)] =
        &[(GAME_BASE, 0x0200_0000, "C:\\Games\\Skyrim\\SkyrimSE.exe")];
    let module_list_probe = encode_module_list(modules, 0);
    let sizes = [module_list_probe.len(), bb.len()];
    let module_list = encode_module_list(modules, body_rva(&sizes, 0));
    let dump = serialize_dump(&[(STREAM_MODULE_LIST, module_list), (STREAM_BLACKBOX, bb)]);
    let dump_path = dir.path().join("SkyrimSE_Crash_20260113_110000.dmp");
    std::fs::write(&dump_path, dump).unwrap();

    let opts = test_options(dir.path());
    let result = analyze(&dump_path, &opts).unwrap();

    assert!(result.has_blackbox);
    assert_eq!(result.pid, 7777);
    assert_eq!(result.events.len(), 2);
    assert_eq!(result.events[0].type_name, "Heartbeat");
    assert_eq!(result.events[1].type_name, "Crash");

    let mut result = result;
    result.out_dir = Some(dir.path().to_path_buf());
    write_outputs(&result, true).unwrap();
    let jsonl = std::fs::read_to_string(
        dir.path()
            .join("SkyrimSE_Crash_20260113_110000_SkyrimDiagBlackbox.jsonl"),
    )
    .unwrap();
    assert_eq!(jsonl.lines().count(), 2);
    assert!(jsonl.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
}

#[test]
fn truncated_header_is_a_malformed_dump() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("truncated.dmp");
    std::fs::write(&dump_path, b"MDMP").unwrap();
    let opts = test_options(dir.path());
    assert!(matches!(
        analyze(&dump_path, &opts),
        Err(skydiag_core::DiagError::MalformedDump(_))
    ));
}
