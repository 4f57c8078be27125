//! Game-function address database.
//!
//! `data/address_db/<game>_functions.json` maps known engine function
//! offsets to names per game version. When the fault lands inside the
//! game executable this gives a human-readable hint even without PDBs.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::{DiagError, Result};

/// Offsets within this distance below a known function still resolve to it.
const NEAR_TOLERANCE: u64 = 0x100;

#[derive(Debug, Deserialize)]
struct RawFile {
    game_versions: HashMap<String, RawVersionEntry>,
}

#[derive(Debug, Deserialize)]
struct RawVersionEntry {
    #[serde(default)]
    functions: HashMap<String, String>,
}

/// Function map for one selected game version.
#[derive(Debug, Default)]
pub struct AddressDb {
    functions: HashMap<u64, String>,
}

impl AddressDb {
    /// Loads the entry for `game_version`. Fails with `Config` when the
    /// file or the version entry is unusable.
    pub fn load(path: &Path, game_version: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text, game_version)
    }

    pub fn from_json(text: &str, game_version: &str) -> Result<Self> {
        let raw: RawFile = serde_json::from_str(text)?;
        let entry = raw
            .game_versions
            .get(game_version)
            .ok_or_else(|| DiagError::Config(format!("address db: no entry for {game_version}")))?;

        let mut functions = HashMap::with_capacity(entry.functions.len());
        for (offset_hex, name) in &entry.functions {
            let digits = offset_hex
                .strip_prefix("0x")
                .or_else(|| offset_hex.strip_prefix("0X"))
                .unwrap_or(offset_hex);
            if let Ok(offset) = u64::from_str_radix(digits, 16) {
                functions.insert(offset, name.clone());
            }
        }
        if functions.is_empty() {
            return Err(DiagError::Config(format!(
                "address db: empty function table for {game_version}"
            )));
        }
        Ok(Self { functions })
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Exact hit, else the nearest function starting within the tolerance
    /// below the offset.
    pub fn resolve(&self, offset: u64) -> Option<&str> {
        if let Some(name) = self.functions.get(&offset) {
            return Some(name);
        }
        let mut nearest: Option<(u64, &str)> = None;
        for (&fn_offset, name) in &self.functions {
            if offset < fn_offset {
                continue;
            }
            let diff = offset - fn_offset;
            if diff >= NEAR_TOLERANCE {
                continue;
            }
            if nearest.is_none_or(|(best, _)| diff < best) {
                nearest = Some((diff, name));
            }
        }
        nearest.map(|(_, name)| name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "game_versions": {
        "1.6.1170.0": {
          "functions": {
            "D6DDDA": "BSBatchRenderer::Draw",
            "0x12A000": "BSLightingShader::SetupGeometry"
          }
        }
      }
    }"#;

    #[test]
    fn exact_and_near_resolution() {
        let db = AddressDb::from_json(SAMPLE, "1.6.1170.0").unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.resolve(0xD6DDDA), Some("BSBatchRenderer::Draw"));
        assert_eq!(db.resolve(0xD6DE50), Some("BSBatchRenderer::Draw"));
        assert_eq!(db.resolve(0xD6DDDA + NEAR_TOLERANCE), None);
        assert_eq!(db.resolve(0x12A010), Some("BSLightingShader::SetupGeometry"));
        assert_eq!(db.resolve(0x1000), None);
    }

    #[test]
    fn unknown_version_is_config_error() {
        assert!(matches!(
            AddressDb::from_json(SAMPLE, "1.5.97.0"),
            Err(DiagError::Config(_))
        ));
    }
}
