//! Plugin-scan sidecar parsing and load-order rules.
//!
//! The capture helper scans the active plugin list (plugins.txt or the
//! MO2 profile) at incident time and writes a JSON sidecar next to the
//! dump. The engine derives missing masters, header-version facts, and
//! ESL counts from it and evaluates `data/plugin_rules.json` against
//! those facts. Rules fire independently; all firing rules are returned.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::i18n::{ConfidenceLevel, Language};
use crate::report::PluginDiagnosis;
use crate::{DiagError, Result};

/// Masters the runtime can load implicitly even when absent from the
/// active list (base game, DLC, mandatory CC content).
const IMPLICIT_RUNTIME_MASTERS: &[&str] = &[
    "skyrim.esm",
    "update.esm",
    "dawnguard.esm",
    "hearthfires.esm",
    "dragonborn.esm",
    "ccbgssse001-fish.esm",
    "ccqdrsse001-survivalmode.esl",
    "ccbgssse037-curios.esl",
    "ccbgssse025-advdsgs.esm",
    "_resourcepack.esl",
    "resourcepack.esl",
];

/// One scanned plugin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginEntry {
    pub filename: String,
    pub header_version: f32,
    pub is_esl: bool,
    pub is_active: bool,
    pub masters: Vec<String>,
}

/// The parsed plugin-scan sidecar.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginScan {
    pub game_exe_version: String,
    pub plugins_source: String,
    pub mo2_detected: bool,
    pub plugins: Vec<PluginEntry>,
}

impl PluginScan {
    /// Any parse failure yields `None`; the plugin signal is disabled.
    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Masters required by active plugins that are neither active
    /// themselves nor implicitly loadable, once each, in discovery order.
    pub fn missing_masters(&self) -> Vec<String> {
        let active: HashSet<String> = self
            .plugins
            .iter()
            .filter(|p| p.is_active && !p.filename.is_empty())
            .map(|p| p.filename.to_lowercase())
            .collect();

        let mut added: HashSet<String> = HashSet::new();
        let mut missing = Vec::new();
        for plugin in self.plugins.iter().filter(|p| p.is_active) {
            for master in &plugin.masters {
                if master.is_empty() {
                    continue;
                }
                let lower = master.to_lowercase();
                if active.contains(&lower) {
                    continue;
                }
                if IMPLICIT_RUNTIME_MASTERS.contains(&lower.as_str()) {
                    continue;
                }
                if added.insert(lower) {
                    missing.push(master.clone());
                }
            }
        }
        missing
    }

    pub fn any_header_version_gte(&self, threshold: f64) -> bool {
        self.plugins
            .iter()
            .any(|p| f64::from(p.header_version) + 1e-6 >= threshold)
    }

    pub fn esl_count(&self) -> usize {
        self.plugins.iter().filter(|p| p.is_esl).count()
    }
}

/// Lexical segmented numeric comparison on dotted tokens, zero-padded.
pub fn version_lt(lhs: &str, rhs: &str) -> bool {
    fn segments(s: &str) -> Vec<u64> {
        s.split('.')
            .map(|token| {
                let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
    let lv = segments(lhs);
    let rv = segments(rhs);
    let n = lv.len().max(rv.len());
    for i in 0..n {
        let a = lv.get(i).copied().unwrap_or(0);
        let b = rv.get(i).copied().unwrap_or(0);
        if a != b {
            return a < b;
        }
    }
    false
}

/// BEES requirement: a header-1.71 plugin on a pre-1.6.1130 runtime
/// without the backported header support DLL loaded.
pub fn needs_bees(scan: &PluginScan, game_version: &str, bees_loaded: bool) -> bool {
    !game_version.is_empty()
        && scan.any_header_version_gte(1.71)
        && version_lt(game_version, "1.6.1130")
        && !bees_loaded
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCondition {
    any_plugin_header_version_gte: Option<f64>,
    game_version_lt: Option<String>,
    module_not_loaded: Option<String>,
    has_missing_master: Option<bool>,
    esl_count_gte: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDiagnosis {
    cause_ko: String,
    cause_en: String,
    confidence: String,
    recommendations_ko: Vec<String>,
    recommendations_en: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: String,
    #[serde(default)]
    condition: RawCondition,
    #[serde(default)]
    diagnosis: RawDiagnosis,
}

#[derive(Debug, Deserialize)]
struct RawRulesFile {
    version: Option<u32>,
    #[serde(default)]
    rules: Vec<Value>,
}

/// Context the rules are evaluated against.
#[derive(Debug)]
pub struct PluginRulesContext<'a> {
    pub scan: &'a PluginScan,
    pub game_version: &'a str,
    pub loaded_module_filenames: &'a [String],
    pub missing_masters: &'a [String],
}

impl<'a> PluginRulesContext<'a> {
    pub fn new(scan: &'a PluginScan) -> Self {
        Self {
            scan,
            game_version: "",
            loaded_module_filenames: &[],
            missing_masters: &[],
        }
    }
}

/// The plugin-rules database.
#[derive(Debug, Default)]
pub struct PluginRules {
    rules: Vec<Rule>,
}

#[derive(Debug)]
struct Rule {
    id: String,
    any_plugin_header_version_gte: Option<f64>,
    game_version_lt: Option<String>,
    module_not_loaded_lower: Option<String>,
    has_missing_master: Option<bool>,
    esl_count_gte: Option<u64>,
    cause_ko: String,
    cause_en: String,
    confidence: ConfidenceLevel,
    recommendations_ko: Vec<String>,
    recommendations_en: Vec<String>,
}

impl PluginRules {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawRulesFile = serde_json::from_str(text)?;
        if raw.version.is_none() {
            return Err(DiagError::Config("plugin_rules.json: missing version".into()));
        }
        let mut rules = Vec::with_capacity(raw.rules.len());
        for value in raw.rules {
            let parsed: RawRule = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(err) => {
                    debug!("plugin rule dropped: {err}");
                    continue;
                }
            };
            if parsed.id.is_empty() {
                continue;
            }
            rules.push(Rule {
                id: parsed.id,
                any_plugin_header_version_gte: parsed.condition.any_plugin_header_version_gte,
                game_version_lt: parsed.condition.game_version_lt,
                module_not_loaded_lower: parsed
                    .condition
                    .module_not_loaded
                    .map(|s| s.to_lowercase()),
                has_missing_master: parsed.condition.has_missing_master,
                esl_count_gte: parsed.condition.esl_count_gte,
                cause_ko: parsed.diagnosis.cause_ko,
                cause_en: parsed.diagnosis.cause_en,
                confidence: ConfidenceLevel::parse_token(&parsed.diagnosis.confidence),
                recommendations_ko: parsed.diagnosis.recommendations_ko,
                recommendations_en: parsed.diagnosis.recommendations_en,
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates every rule (AND over present conditions) and returns all
    /// firing diagnoses.
    pub fn evaluate(&self, ctx: &PluginRulesContext<'_>, lang: Language) -> Vec<PluginDiagnosis> {
        let mut out = Vec::new();
        if self.rules.is_empty() {
            return out;
        }

        let owned_missing;
        let missing_masters: &[String] = if ctx.missing_masters.is_empty() {
            owned_missing = ctx.scan.missing_masters();
            &owned_missing
        } else {
            ctx.missing_masters
        };
        let esl_count = ctx.scan.esl_count() as u64;
        let loaded_lower: HashSet<String> = ctx
            .loaded_module_filenames
            .iter()
            .map(|m| m.to_lowercase())
            .collect();

        for rule in &self.rules {
            if let Some(threshold) = rule.any_plugin_header_version_gte {
                if !ctx.scan.any_header_version_gte(threshold) {
                    continue;
                }
            }
            if let Some(bound) = &rule.game_version_lt {
                if ctx.game_version.is_empty() || !version_lt(ctx.game_version, bound) {
                    continue;
                }
            }
            if let Some(module) = &rule.module_not_loaded_lower {
                if loaded_lower.contains(module) {
                    continue;
                }
            }
            if let Some(expected) = rule.has_missing_master {
                if expected != !missing_masters.is_empty() {
                    continue;
                }
            }
            if let Some(min) = rule.esl_count_gte {
                if esl_count < min {
                    continue;
                }
            }

            out.push(PluginDiagnosis {
                rule_id: rule.id.clone(),
                cause: if lang.is_english() {
                    rule.cause_en.clone()
                } else {
                    rule.cause_ko.clone()
                },
                confidence: rule.confidence,
                recommendations: if lang.is_english() {
                    rule.recommendations_en.clone()
                } else {
                    rule.recommendations_ko.clone()
                },
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN_JSON: &str = r#"{
      "game_exe_version": "1.6.640.0",
      "plugins_source": "mo2_profile",
      "mo2_detected": true,
      "plugins": [
        {"filename": "A.esm", "header_version": 1.70, "is_esl": false, "is_active": true, "masters": []},
        {"filename": "B.esp", "header_version": 1.71, "is_esl": true, "is_active": true,
         "masters": ["A.esm", "MissingMaster.esm", "Skyrim.esm"]},
        {"filename": "C.esp", "header_version": 1.70, "is_esl": true, "is_active": false,
         "masters": ["AlsoMissing.esm"]}
      ]
    }"#;

    #[test]
    fn missing_masters_skip_active_and_implicit() {
        let scan = PluginScan::from_json(SCAN_JSON).unwrap();
        // C.esp is inactive so AlsoMissing.esm is not required.
        assert_eq!(scan.missing_masters(), vec!["MissingMaster.esm"]);
    }

    #[test]
    fn header_and_esl_facts() {
        let scan = PluginScan::from_json(SCAN_JSON).unwrap();
        assert!(scan.any_header_version_gte(1.71));
        assert!(!scan.any_header_version_gte(1.80));
        assert_eq!(scan.esl_count(), 2);
    }

    #[test]
    fn version_comparison_is_segmented_numeric() {
        assert!(version_lt("1.6.640", "1.6.1130"));
        assert!(!version_lt("1.6.1130", "1.6.640"));
        assert!(!version_lt("1.6.1130", "1.6.1130"));
        assert!(version_lt("1.6.1130.9", "1.6.1131"));
        assert!(version_lt("1.5", "1.5.97"));
    }

    #[test]
    fn bees_requirement() {
        let scan = PluginScan::from_json(SCAN_JSON).unwrap();
        assert!(needs_bees(&scan, "1.6.640.0", false));
        assert!(!needs_bees(&scan, "1.6.640.0", true));
        assert!(!needs_bees(&scan, "1.6.1170.0", false));
        assert!(!needs_bees(&scan, "", false));
    }

    const RULES_JSON: &str = r#"{
      "version": 1,
      "rules": [
        {
          "id": "MISSING_MASTER",
          "condition": {"has_missing_master": true},
          "diagnosis": {"cause_en": "A required master plugin is not active", "confidence": "high",
                        "recommendations_en": ["Enable or install the missing master"]}
        },
        {
          "id": "HEADER_171_OLD_RUNTIME",
          "condition": {"any_plugin_header_version_gte": 1.71, "game_version_lt": "1.6.1130",
                        "module_not_loaded": "bees.dll"},
          "diagnosis": {"cause_en": "1.71-header plugin on an old runtime", "confidence": "high"}
        }
      ]
    }"#;

    #[test]
    fn rules_fire_independently() {
        let scan = PluginScan::from_json(SCAN_JSON).unwrap();
        let rules = PluginRules::from_json(RULES_JSON).unwrap();
        let loaded = vec!["SkyrimSE.exe".to_string()];
        let ctx = PluginRulesContext {
            scan: &scan,
            game_version: "1.6.640.0",
            loaded_module_filenames: &loaded,
            missing_masters: &[],
        };
        let fired = rules.evaluate(&ctx, Language::English);
        let ids: Vec<&str> = fired.iter().map(|d| d.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["MISSING_MASTER", "HEADER_171_OLD_RUNTIME"]);
        assert_eq!(fired[0].confidence, ConfidenceLevel::High);
    }

    #[test]
    fn module_not_loaded_condition_suppressed_when_present() {
        let scan = PluginScan::from_json(SCAN_JSON).unwrap();
        let rules = PluginRules::from_json(RULES_JSON).unwrap();
        let loaded = vec!["bees.dll".to_string()];
        let ctx = PluginRulesContext {
            scan: &scan,
            game_version: "1.6.640.0",
            loaded_module_filenames: &loaded,
            missing_masters: &[],
        };
        let ids: Vec<String> = rules
            .evaluate(&ctx, Language::English)
            .into_iter()
            .map(|d| d.rule_id)
            .collect();
        assert_eq!(ids, vec!["MISSING_MASTER"]);
    }

    #[test]
    fn rules_file_without_version_is_config_error() {
        assert!(matches!(
            PluginRules::from_json(r#"{"rules": []}"#),
            Err(DiagError::Config(_))
        ));
    }
}
