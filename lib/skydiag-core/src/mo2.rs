//! Mod Organizer 2 install discovery.
//!
//! MO2 launches the game with plugin DLLs loaded straight out of
//! `<base>\mods\<ModName>\...`, so module paths in the dump betray both
//! the MO2 base directory and the owning mod of each DLL. The index also
//! answers "which mods provide this Data-relative asset path", in MO2
//! priority order, which feeds the resource-conflict evidence.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Best-effort: extract `<ModName>` from a `...\mods\<ModName>\...` path.
/// Returns an empty string when the pattern is absent.
pub fn infer_mod_name_from_path(full_path: &str) -> String {
    let lower = full_path.to_lowercase();
    let needle = "\\mods\\";
    let Some(pos) = lower.find(needle) else {
        return String::new();
    };
    let start = pos + needle.len();
    if start >= full_path.len() {
        return String::new();
    }
    match full_path[start..].find('\\') {
        Some(end) if end > 0 => full_path[start..start + end].to_string(),
        _ => String::new(),
    }
}

/// Infers the MO2 base directory from any module path containing `\mods\`.
pub fn infer_base_dir_from_module_paths(module_paths: &[String]) -> Option<PathBuf> {
    for path in module_paths {
        if path.is_empty() {
            continue;
        }
        let lower = path.to_lowercase();
        if let Some(pos) = lower.find("\\mods\\") {
            if pos > 0 {
                return Some(PathBuf::from(&path[..pos]));
            }
        }
    }
    None
}

/// Resolved MO2 install layout with the active profile's mod ordering.
#[derive(Debug, Clone, Default)]
pub struct Mo2Index {
    pub base: PathBuf,
    pub mods_dir: PathBuf,
    pub overwrite_dir: PathBuf,
    pub profile_name: String,
    /// Mod directories in winner-first order (MO2 bottom-of-list wins).
    mod_dirs: Vec<PathBuf>,
    mod_names: Vec<String>,
}

impl Mo2Index {
    /// Builds the index from the dump's module paths. Returns `None` when
    /// no MO2 layout can be located on this machine.
    pub fn from_module_paths(module_paths: &[String]) -> Option<Self> {
        let base = infer_base_dir_from_module_paths(module_paths)?;
        Self::from_base_dir(base)
    }

    pub fn from_base_dir(base: PathBuf) -> Option<Self> {
        let mods_dir = base.join("mods");
        if !mods_dir.is_dir() {
            return None;
        }

        // Installed mod directories, case-insensitive.
        let mut dir_by_lower: HashMap<String, PathBuf> = HashMap::new();
        let mut name_by_lower: HashMap<String, String> = HashMap::new();
        if let Ok(entries) = fs::read_dir(&mods_dir) {
            for ent in entries.flatten() {
                let p = ent.path();
                if !p.is_dir() {
                    continue;
                }
                let Some(name) = p.file_name().and_then(|s| s.to_str()).map(String::from) else {
                    continue;
                };
                let lower = name.to_lowercase();
                dir_by_lower.insert(lower.clone(), p);
                name_by_lower.insert(lower, name);
            }
        }

        let mut idx = Mo2Index {
            overwrite_dir: base.join("overwrite"),
            mods_dir,
            base,
            ..Default::default()
        };

        let mut used_lower: HashSet<String> = HashSet::new();
        if let Some((profile_name, profile_dir)) = pick_profile_dir(&idx.base) {
            idx.profile_name = profile_name;
            let modlist = profile_dir.join("modlist.txt");
            for name in read_enabled_mods_winner_first(&modlist) {
                let lower = name.to_lowercase();
                let Some(dir) = dir_by_lower.get(&lower) else {
                    continue;
                };
                idx.mod_dirs.push(dir.clone());
                idx.mod_names
                    .push(name_by_lower.get(&lower).cloned().unwrap_or(name));
                used_lower.insert(lower);
            }
        }

        // Unused installed mods follow, sorted by lowercased name for
        // determinism.
        let mut remaining: Vec<&String> = dir_by_lower
            .keys()
            .filter(|lower| !used_lower.contains(*lower))
            .collect();
        remaining.sort();
        for lower in remaining {
            if let Some(dir) = dir_by_lower.get(lower) {
                idx.mod_dirs.push(dir.clone());
                idx.mod_names
                    .push(name_by_lower.get(lower).cloned().unwrap_or_else(|| lower.clone()));
            }
        }

        debug!(
            "MO2 index: base={:?} profile={:?} mods={}",
            idx.base,
            idx.profile_name,
            idx.mod_names.len()
        );
        Some(idx)
    }

    pub fn mod_names(&self) -> &[String] {
        &self.mod_names
    }

    /// Mods (and `overwrite`) that provide a Data-relative path, winner
    /// first, truncated to `max`.
    pub fn providers(&self, rel_path: &str, max: usize) -> Vec<String> {
        let mut out = Vec::new();
        if rel_path.is_empty() || max == 0 {
            return out;
        }
        let trimmed = rel_path.trim_start_matches(['\\', '/']);
        if trimmed.is_empty() {
            return out;
        }
        let rel = PathBuf::from(trimmed.replace('\\', "/"));
        if rel.is_absolute() {
            return out;
        }

        // overwrite wins in MO2 and is highly relevant for conflicts.
        if self.overwrite_dir.is_dir() && self.overwrite_dir.join(&rel).exists() {
            out.push("overwrite".to_string());
            if out.len() >= max {
                return out;
            }
        }

        for (dir, name) in self.mod_dirs.iter().zip(&self.mod_names) {
            if dir.join(&rel).exists() {
                out.push(name.clone());
                if out.len() >= max {
                    break;
                }
            }
        }
        out
    }
}

/// Reads `selected_profile=` from `ModOrganizer.ini`, unwrapping the
/// common `@ByteArray(...)` form.
fn read_selected_profile_name(base: &Path) -> Option<String> {
    let text = fs::read_to_string(base.join("ModOrganizer.ini")).ok()?;
    for raw in text.lines() {
        let line = raw.trim_start_matches('\u{feff}').trim();
        let Some(mut value) = line.strip_prefix("selected_profile=") else {
            continue;
        };
        value = value.trim();
        if let Some(inner) = value
            .strip_prefix("@ByteArray(")
            .and_then(|v| v.strip_suffix(')'))
        {
            value = inner.trim();
        }
        if value.is_empty() {
            return None;
        }
        return Some(value.to_string());
    }
    None
}

/// The selected profile when valid, else the profile whose `modlist.txt`
/// was modified most recently.
fn pick_profile_dir(base: &Path) -> Option<(String, PathBuf)> {
    let profiles_dir = base.join("profiles");
    if !profiles_dir.is_dir() {
        return None;
    }

    if let Some(selected) = read_selected_profile_name(base) {
        let p = profiles_dir.join(&selected);
        if p.is_dir() {
            return Some((selected, p));
        }
    }

    let mut best: Option<(std::time::SystemTime, String, PathBuf)> = None;
    for ent in fs::read_dir(&profiles_dir).ok()?.flatten() {
        let p = ent.path();
        if !p.is_dir() {
            continue;
        }
        let modlist = p.join("modlist.txt");
        let Ok(meta) = fs::metadata(&modlist) else {
            continue;
        };
        let Ok(mtime) = meta.modified() else {
            continue;
        };
        let name = p.file_name()?.to_string_lossy().into_owned();
        if best.as_ref().is_none_or(|(t, _, _)| mtime > *t) {
            best = Some((mtime, name, p));
        }
    }
    best.map(|(_, name, p)| (name, p))
}

/// Parses `modlist.txt` bottom-up (bottom has highest MO2 priority),
/// keeping `+`-prefixed entries and deduping case-insensitively.
fn read_enabled_mods_winner_first(modlist_path: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(modlist_path) else {
        return Vec::new();
    };
    let mut seen_lower: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for raw in text.lines().rev() {
        let line = raw.trim_start_matches('\u{feff}').trim();
        let Some(first) = line.chars().next() else {
            continue;
        };
        if first != '+' && first != '-' {
            continue;
        }
        let name = line[1..].trim();
        if first != '+' || name.is_empty() {
            continue;
        }
        let lower = name.to_lowercase();
        if seen_lower.insert(lower) {
            out.push(name.to_string());
        }
    }
    out
}
