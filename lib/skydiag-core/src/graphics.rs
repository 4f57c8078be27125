//! Graphics-injection diagnosis.
//!
//! ENB, ReShade, DXVK, and frame-generation shims inject into the D3D
//! call path and account for a recognizable family of crashes.
//! `data/graphics_rules.json` declares detection groups (which DLLs imply
//! which environment) and rules over the loaded-module set plus the fault
//! module; the first matching rule wins.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::i18n::{ConfidenceLevel, Language};
use crate::report::GraphicsDiagnosis;
use crate::{DiagError, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDetect {
    modules_any: Vec<String>,
    modules_all: Vec<String>,
    fault_module_any: Vec<String>,
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
    detect: RawDetect,
    #[serde(default)]
    diagnosis: RawDiagnosis,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    version: Option<u32>,
    #[serde(default)]
    detection_modules: serde_json::Map<String, Value>,
    #[serde(default)]
    rules: Vec<Value>,
}

#[derive(Debug)]
struct DetectionGroup {
    name: String,
    dlls: Vec<String>,
}

#[derive(Debug)]
struct Rule {
    id: String,
    modules_any: Vec<String>,
    modules_all: Vec<String>,
    fault_module_any: Vec<String>,
    cause_ko: String,
    cause_en: String,
    confidence: ConfidenceLevel,
    recommendations_ko: Vec<String>,
    recommendations_en: Vec<String>,
}

/// Which injection layers are present in the module list.
#[derive(Debug, Default, Clone)]
pub struct GraphicsEnvironment {
    pub enb_detected: bool,
    pub reshade_detected: bool,
    pub dxvk_detected: bool,
    pub injection_modules: Vec<String>,
}

/// The graphics rule database.
#[derive(Debug, Default)]
pub struct GraphicsRules {
    groups: Vec<DetectionGroup>,
    rules: Vec<Rule>,
}

fn lower_list(values: &[String]) -> Vec<String> {
    values.iter().map(|s| s.to_lowercase()).filter(|s| !s.is_empty()).collect()
}

fn has_any(present: &HashSet<String>, required_any: &[String]) -> bool {
    required_any.is_empty() || required_any.iter().any(|t| present.contains(t))
}

fn has_all(present: &HashSet<String>, required_all: &[String]) -> bool {
    required_all.iter().all(|t| present.contains(t))
}

impl GraphicsRules {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawFile = serde_json::from_str(text)?;
        if raw.version.is_none() {
            return Err(DiagError::Config("graphics_rules.json: missing version".into()));
        }

        let mut groups = Vec::new();
        for (name, dlls_value) in raw.detection_modules {
            let dlls: Vec<String> = serde_json::from_value(dlls_value).unwrap_or_default();
            let dlls = lower_list(&dlls);
            if !name.is_empty() && !dlls.is_empty() {
                groups.push(DetectionGroup {
                    name: name.to_lowercase(),
                    dlls,
                });
            }
        }

        let mut rules = Vec::with_capacity(raw.rules.len());
        for value in raw.rules {
            let parsed: RawRule = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(err) => {
                    debug!("graphics rule dropped: {err}");
                    continue;
                }
            };
            if parsed.id.is_empty() {
                continue;
            }
            rules.push(Rule {
                id: parsed.id,
                modules_any: lower_list(&parsed.detect.modules_any),
                modules_all: lower_list(&parsed.detect.modules_all),
                fault_module_any: lower_list(&parsed.detect.fault_module_any),
                cause_ko: parsed.diagnosis.cause_ko,
                cause_en: parsed.diagnosis.cause_en,
                confidence: ConfidenceLevel::parse_token(&parsed.diagnosis.confidence),
                recommendations_ko: parsed.diagnosis.recommendations_ko,
                recommendations_en: parsed.diagnosis.recommendations_en,
            });
        }
        Ok(Self { groups, rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Detects which injection layers are present.
    pub fn detect_environment(&self, module_filenames: &[String]) -> GraphicsEnvironment {
        let mut env = GraphicsEnvironment::default();
        if module_filenames.is_empty() || self.groups.is_empty() {
            return env;
        }
        let present: HashSet<String> =
            module_filenames.iter().map(|m| m.to_lowercase()).collect();

        let mut added: HashSet<String> = HashSet::new();
        for group in &self.groups {
            if !group.dlls.iter().any(|d| present.contains(d)) {
                continue;
            }
            match group.name.as_str() {
                "enb" => env.enb_detected = true,
                "reshade" => env.reshade_detected = true,
                "dxvk" => env.dxvk_detected = true,
                _ => {}
            }
            for m in module_filenames {
                let lower = m.to_lowercase();
                if group.dlls.contains(&lower) && added.insert(lower) {
                    env.injection_modules.push(m.clone());
                }
            }
        }
        env
    }

    /// First rule matching the module set and fault module.
    pub fn diagnose(
        &self,
        module_filenames: &[String],
        fault_module_filename: &str,
        lang: Language,
    ) -> Option<GraphicsDiagnosis> {
        if self.rules.is_empty() || module_filenames.is_empty() {
            return None;
        }
        let present: HashSet<String> =
            module_filenames.iter().map(|m| m.to_lowercase()).collect();
        let fault_lower = fault_module_filename.to_lowercase();

        for rule in &self.rules {
            if !has_any(&present, &rule.modules_any) {
                continue;
            }
            if !has_all(&present, &rule.modules_all) {
                continue;
            }
            if !rule.fault_module_any.is_empty() && !rule.fault_module_any.contains(&fault_lower) {
                continue;
            }
            return Some(GraphicsDiagnosis {
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
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "version": 1,
      "detection_modules": {
        "enb": ["d3d11.dll", "enbseries.dll"],
        "reshade": ["dxgi.dll"]
      },
      "rules": [
        {
          "id": "ENB_DXGI_FAULT",
          "detect": {"modules_any": ["enbseries.dll"], "fault_module_any": ["enbseries.dll"]},
          "diagnosis": {"cause_en": "Crash inside ENB", "confidence": "high",
                        "recommendations_en": ["Update or remove ENB"]}
        },
        {
          "id": "RESHADE_PRESENT",
          "detect": {"modules_all": ["dxgi.dll"]},
          "diagnosis": {"cause_en": "ReShade present during crash", "confidence": "low"}
        }
      ]
    }"#;

    #[test]
    fn detects_environment_groups() {
        let rules = GraphicsRules::from_json(SAMPLE).unwrap();
        let modules = vec!["EnbSeries.dll".to_string(), "SkyrimSE.exe".to_string()];
        let env = rules.detect_environment(&modules);
        assert!(env.enb_detected);
        assert!(!env.reshade_detected);
        assert_eq!(env.injection_modules, vec!["EnbSeries.dll"]);
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = GraphicsRules::from_json(SAMPLE).unwrap();
        let modules = vec!["enbseries.dll".to_string(), "dxgi.dll".to_string()];
        let diag = rules.diagnose(&modules, "ENBSeries.dll", Language::English).unwrap();
        assert_eq!(diag.rule_id, "ENB_DXGI_FAULT");
        assert_eq!(diag.confidence, ConfidenceLevel::High);
    }

    #[test]
    fn fault_module_filter_falls_through() {
        let rules = GraphicsRules::from_json(SAMPLE).unwrap();
        let modules = vec!["enbseries.dll".to_string(), "dxgi.dll".to_string()];
        let diag = rules.diagnose(&modules, "SkyrimSE.exe", Language::English).unwrap();
        assert_eq!(diag.rule_id, "RESHADE_PRESENT");
    }

    #[test]
    fn missing_version_is_config_error() {
        assert!(matches!(
            GraphicsRules::from_json(r#"{"rules": []}"#),
            Err(DiagError::Config(_))
        ));
    }
}
