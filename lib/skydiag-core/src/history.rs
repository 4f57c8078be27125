//! Append-only bounded crash history.
//!
//! A small JSON file records prior incidents so repeated crashes can be
//! recognized. The log is bounded to the most recent 100 entries; stats
//! queries answer "which modules keep showing up" and "how often has this
//! exact bucket been seen".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::report::{BucketStats, ModuleStats};
use crate::{DiagError, Result};

/// Entries kept after an append.
pub const MAX_ENTRIES: usize = 100;

const HISTORY_VERSION: u32 = 1;

/// One recorded incident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    pub timestamp_utc: String,
    pub dump_file: String,
    pub bucket_key: String,
    pub top_suspect: String,
    pub confidence: String,
    pub signature_id: String,
    pub all_suspects: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    entries: Vec<HistoryEntry>,
}

/// The bounded incident log.
#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
}

/// Default location: the per-user data directory.
pub fn default_history_path() -> Option<PathBuf> {
    Some(dirs::data_local_dir()?.join("SkyrimDiag").join("crash_history.json"))
}

impl HistoryStore {
    /// Loads the history file; a missing or unreadable file yields an
    /// empty store.
    pub fn load(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<HistoryFile>(&text) {
            Ok(file) => Self {
                entries: file.entries,
            },
            Err(err) => {
                debug!("history file unreadable, starting fresh: {err}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = HistoryFile {
            version: HISTORY_VERSION,
            entries: self.entries.clone(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, text)
            .map_err(|e| DiagError::OutputWrite(format!("{}: {e}", path.display())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends one entry, evicting from the front on overflow.
    pub fn append(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if self.entries.len() > MAX_ENTRIES {
            let drop = self.entries.len() - MAX_ENTRIES;
            self.entries.drain(..drop);
        }
    }

    /// Per-module stats over the last `last_n` entries (0 = all), sorted
    /// by `(as_top_suspect desc, total_appearances desc, name asc)`.
    pub fn module_stats(&self, last_n: usize) -> Vec<ModuleStats> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let count = if last_n == 0 || last_n > self.entries.len() {
            self.entries.len()
        } else {
            last_n
        };
        let window = &self.entries[self.entries.len() - count..];

        let mut by_module: HashMap<String, ModuleStats> = HashMap::new();
        for entry in window {
            if !entry.top_suspect.is_empty() {
                let stats = by_module.entry(entry.top_suspect.clone()).or_default();
                stats.module_name = entry.top_suspect.clone();
                stats.as_top_suspect += 1;
                stats.total_crashes = count as u32;
            }
            for module in &entry.all_suspects {
                if module.is_empty() {
                    continue;
                }
                let stats = by_module.entry(module.clone()).or_default();
                stats.module_name = module.clone();
                stats.total_appearances += 1;
                stats.total_crashes = count as u32;
            }
        }

        let mut result: Vec<ModuleStats> = by_module.into_values().collect();
        result.sort_by(|a, b| {
            b.as_top_suspect
                .cmp(&a.as_top_suspect)
                .then(b.total_appearances.cmp(&a.total_appearances))
                .then(a.module_name.cmp(&b.module_name))
        });
        result
    }

    /// Repetition stats for one bucket key over all entries.
    pub fn bucket_stats(&self, bucket_key: &str) -> BucketStats {
        let mut stats = BucketStats::default();
        if bucket_key.is_empty() {
            return stats;
        }
        for entry in &self.entries {
            if entry.bucket_key != bucket_key {
                continue;
            }
            stats.count += 1;
            if stats.first_seen.is_empty() || entry.timestamp_utc < stats.first_seen {
                stats.first_seen = entry.timestamp_utc.clone();
            }
            if stats.last_seen.is_empty() || entry.timestamp_utc > stats.last_seen {
                stats.last_seen = entry.timestamp_utc.clone();
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: &str, bucket: &str, top: &str, all: &[&str]) -> HistoryEntry {
        HistoryEntry {
            timestamp_utc: ts.to_string(),
            dump_file: "dump.dmp".to_string(),
            bucket_key: bucket.to_string(),
            top_suspect: top.to_string(),
            confidence: "High".to_string(),
            signature_id: String::new(),
            all_suspects: all.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn append_evicts_from_front() {
        let mut store = HistoryStore::default();
        for i in 0..MAX_ENTRIES + 5 {
            store.append(entry(&format!("t{i:04}"), "CTD-x", "a.dll", &["a.dll"]));
        }
        assert_eq!(store.len(), MAX_ENTRIES);
        // The oldest five are gone.
        assert_eq!(store.entries[0].timestamp_utc, "t0005");
    }

    #[test]
    fn module_stats_ordering() {
        let mut store = HistoryStore::default();
        store.append(entry("t1", "k1", "a.dll", &["a.dll", "b.dll"]));
        store.append(entry("t2", "k2", "a.dll", &["a.dll", "c.dll"]));
        store.append(entry("t3", "k3", "b.dll", &["b.dll"]));

        let stats = store.module_stats(0);
        assert_eq!(stats[0].module_name, "a.dll");
        assert_eq!(stats[0].as_top_suspect, 2);
        assert_eq!(stats[0].total_appearances, 2);
        assert_eq!(stats[1].module_name, "b.dll");
        assert_eq!(stats[1].as_top_suspect, 1);
        assert_eq!(stats[0].total_crashes, 3);
    }

    #[test]
    fn bucket_stats_counts_and_time_range() {
        let mut store = HistoryStore::default();
        store.append(entry("2026-01-01T10:00:00Z", "CTD-a", "a.dll", &[]));
        store.append(entry("2026-01-02T10:00:00Z", "CTD-b", "b.dll", &[]));
        store.append(entry("2026-01-03T10:00:00Z", "CTD-a", "a.dll", &[]));

        let stats = store.bucket_stats("CTD-a");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.first_seen, "2026-01-01T10:00:00Z");
        assert_eq!(stats.last_seen, "2026-01-03T10:00:00Z");
        assert!(stats.first_seen < stats.last_seen);
        assert_eq!(store.bucket_stats("CTD-missing").count, 0);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crash_history.json");
        let mut store = HistoryStore::default();
        store.append(entry("t1", "k1", "a.dll", &["a.dll"]));
        store.save(&path).unwrap();

        let loaded = HistoryStore::load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.entries[0].bucket_key, "k1");
    }

    #[test]
    fn unreadable_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(HistoryStore::load(&path).is_empty());
    }
}
