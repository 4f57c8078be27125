//! Module table reconstruction and classification.
//!
//! Modules are decoded from the ModuleList stream, sorted by base address,
//! and classified as OS-provided, game executable, or known hook
//! framework. Classification drives suspect filtering: system and game-exe
//! modules never lead the suspect list, and hook frameworks are demoted
//! because they are frequent crash victims rather than root causes.

use std::path::Path;
use std::sync::Mutex;

use scroll::{Pread, LE};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::minidump::{stream_type, MinidumpView, MODULE_ENTRY_SIZE};
use crate::mo2;

const VS_FFI_SIGNATURE: u32 = 0xFEEF_04BD;

/// OS DLLs that commonly own victim frames.
const SYSTEMISH_FILENAMES: &[&str] = &[
    "kernelbase.dll",
    "ntdll.dll",
    "kernel32.dll",
    "ucrtbase.dll",
    "msvcp140.dll",
    "vcruntime140.dll",
    "vcruntime140_1.dll",
    "concrt140.dll",
    "user32.dll",
    "gdi32.dll",
    "combase.dll",
    "ole32.dll",
    "ws2_32.dll",
    "win32u.dll",
];

const GAME_EXE_FILENAMES: &[&str] = &["skyrimse.exe", "skyrimae.exe", "skyrimvr.exe", "skyrim.exe"];

fn default_hook_framework_dlls() -> Vec<String> {
    [
        "enginefixes.dll",
        "ssedisplaytweaks.dll",
        "po3_tweaks.dll",
        "hdtssephysics.dll",
        "hdtsmp64.dll",
        "storageutil.dll",
        "crashlogger.dll",
        "crashloggersse.dll",
        "sl.interposer.dll",
        "skse64.dll",
        "skse64_loader.dll",
        "skse64_steam_loader.dll",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// Written at most once per process by the config loader; readers take a
// short critical section.
static HOOK_FRAMEWORK_DLLS: Mutex<Option<Vec<String>>> = Mutex::new(None);

#[derive(Deserialize)]
struct HookFrameworksFile {
    frameworks: Vec<HookFrameworkEntry>,
}

#[derive(Deserialize)]
struct HookFrameworkEntry {
    dll: String,
}

/// Replaces the hook-framework DLL set from `data/hook_frameworks.json`.
/// Parse or I/O errors keep the built-in defaults.
pub fn load_hook_frameworks_from_json(path: &Path) {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(err) => {
            debug!("hook framework list not loaded from {:?}: {}", path, err);
            return;
        }
    };
    match serde_json::from_str::<HookFrameworksFile>(&text) {
        Ok(parsed) => {
            let loaded: Vec<String> = parsed
                .frameworks
                .into_iter()
                .map(|f| f.dll.to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !loaded.is_empty() {
                let mut guard = HOOK_FRAMEWORK_DLLS
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                *guard = Some(loaded);
            }
        }
        Err(err) => warn!("invalid hook framework list {:?}: {}", path, err),
    }
}

fn is_skse_module_lower(lower: &str) -> bool {
    if matches!(lower, "skse64_loader.dll" | "skse64_steam_loader.dll" | "skse64.dll") {
        return true;
    }
    // SKSE runtime binaries follow skse64_<runtime>.dll, e.g. skse64_1_6_1170.dll.
    if let Some(rest) = lower.strip_prefix("skse64_") {
        if rest.ends_with(".dll") && rest.len() > 4 {
            return rest.as_bytes()[0].is_ascii_digit();
        }
    }
    false
}

/// Whether `filename` names a DLL that hooks the engine process-wide.
/// Matches the SKSE loader/runtime pattern plus the configured list.
pub fn is_known_hook_framework(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    if is_skse_module_lower(&lower) {
        return true;
    }
    let guard = HOOK_FRAMEWORK_DLLS.lock().unwrap_or_else(|p| p.into_inner());
    match guard.as_ref() {
        Some(list) => list.iter().any(|m| *m == lower),
        None => default_hook_framework_dlls().iter().any(|m| *m == lower),
    }
}

/// Whether `filename` is on the OS DLL allow-list.
pub fn is_systemish_filename(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    SYSTEMISH_FILENAMES.iter().any(|m| *m == lower)
}

/// Whether a normalized module path lives under a Windows system directory.
pub fn is_system_module_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("\\windows\\system32\\")
        || lower.contains("\\windows\\syswow64\\")
        || lower.contains("\\windows\\winsxs\\")
        || lower.contains("\\systemroot\\system32\\")
}

pub fn is_game_exe(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    GAME_EXE_FILENAMES.iter().any(|m| *m == lower)
}

/// Basename of a Windows-style module path.
pub fn path_filename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// One loaded module from the dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub base: u64,
    pub end: u64,
    pub path: String,
    pub filename: String,
    /// "major.minor.build.revision" from the embedded version record.
    pub version: String,
    /// Best-effort MO2 mod name inferred from a `\mods\<name>\` path.
    pub inferred_mod_name: String,
    pub is_system: bool,
    pub is_game_exe: bool,
    pub is_known_hook_framework: bool,
    /// CodeView record location, for PDB identification.
    pub cv_rva: u32,
    pub cv_size: u32,
}

impl Module {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end
    }

    /// `filename+0xHEX` for an address inside this module.
    pub fn plus_offset(&self, addr: u64) -> String {
        format!("{}+0x{:x}", self.filename, addr - self.base)
    }
}

/// Base-sorted module table with O(log n) address lookup.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    modules: Vec<Module>,
}

impl ModuleIndex {
    /// Decodes and classifies the ModuleList stream. A list whose declared
    /// count overruns the stream yields an empty table (the signal is
    /// disabled, the pass continues).
    pub fn load(view: &MinidumpView) -> Self {
        let mut modules = Vec::new();
        if let Some(body) = view.find_stream(stream_type::MODULE_LIST) {
            if body.len() >= 4 {
                let count: u32 = body.pread_with(0, LE).unwrap_or(0);
                let need =
                    4u64.saturating_add(u64::from(count).saturating_mul(MODULE_ENTRY_SIZE as u64));
                if need <= body.len() as u64 {
                    modules.reserve(count as usize);
                    for i in 0..count as usize {
                        let off = 4 + i * MODULE_ENTRY_SIZE;
                        let base: u64 = body.pread_with(off, LE).unwrap_or(0);
                        let size: u32 = body.pread_with(off + 8, LE).unwrap_or(0);
                        let name_rva: u32 = body.pread_with(off + 20, LE).unwrap_or(0);
                        let vs_sig: u32 = body.pread_with(off + 24, LE).unwrap_or(0);
                        let file_ver_hi: u32 = body.pread_with(off + 32, LE).unwrap_or(0);
                        let file_ver_lo: u32 = body.pread_with(off + 36, LE).unwrap_or(0);
                        let cv_size: u32 = body.pread_with(off + 76, LE).unwrap_or(0);
                        let cv_rva: u32 = body.pread_with(off + 80, LE).unwrap_or(0);

                        let Some(path) = view.read_sized_string_utf16(name_rva) else {
                            continue;
                        };
                        if size == 0 {
                            continue;
                        }

                        let filename = path_filename(&path).to_string();
                        let version = if vs_sig == VS_FFI_SIGNATURE {
                            format!(
                                "{}.{}.{}.{}",
                                file_ver_hi >> 16,
                                file_ver_hi & 0xFFFF,
                                file_ver_lo >> 16,
                                file_ver_lo & 0xFFFF
                            )
                        } else {
                            String::new()
                        };

                        let is_system =
                            is_systemish_filename(&filename) || is_system_module_path(&path);
                        modules.push(Module {
                            base,
                            end: base.saturating_add(u64::from(size)),
                            inferred_mod_name: mo2::infer_mod_name_from_path(&path),
                            is_system,
                            is_game_exe: is_game_exe(&filename),
                            is_known_hook_framework: is_known_hook_framework(&filename),
                            path,
                            filename,
                            version,
                            cv_rva,
                            cv_size,
                        });
                    }
                }
            }
        }
        modules.sort_by_key(|m| m.base);
        Self { modules }
    }

    pub fn from_modules(mut modules: Vec<Module>) -> Self {
        modules.sort_by_key(|m| m.base);
        Self { modules }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn get(&self, index: usize) -> Option<&Module> {
        self.modules.get(index)
    }

    /// Upper-bound by base, then containment check on the predecessor.
    pub fn find_index(&self, addr: u64) -> Option<usize> {
        let idx = self.modules.partition_point(|m| m.base <= addr);
        if idx == 0 {
            return None;
        }
        let cand = &self.modules[idx - 1];
        cand.contains(addr).then_some(idx - 1)
    }

    pub fn find(&self, addr: u64) -> Option<&Module> {
        self.find_index(addr).map(|i| &self.modules[i])
    }

    pub fn filenames(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.filename.clone()).collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| !m.path.is_empty())
            .map(|m| m.path.clone())
            .collect()
    }

    /// Whether a DLL with the given filename (case-insensitive) is loaded.
    pub fn has_filename(&self, filename: &str) -> bool {
        let lower = filename.to_lowercase();
        self.modules.iter().any(|m| m.filename.to_lowercase() == lower)
    }

    /// `filename+0xHEX` when the address maps into a module, else `0xHEX`.
    pub fn format_module_plus_offset(&self, addr: u64) -> String {
        match self.find(addr) {
            Some(m) => m.plus_offset(addr),
            None => format!("0x{addr:x}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn module(base: u64, end: u64, path: &str) -> Module {
        let filename = path_filename(path).to_string();
        Module {
            base,
            end,
            inferred_mod_name: mo2::infer_mod_name_from_path(path),
            is_system: is_systemish_filename(&filename) || is_system_module_path(path),
            is_game_exe: is_game_exe(&filename),
            is_known_hook_framework: is_known_hook_framework(&filename),
            path: path.to_string(),
            filename,
            ..Default::default()
        }
    }

}
