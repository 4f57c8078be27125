//! Known-crash-pattern signature database.
//!
//! `data/crash_signatures.json` holds an ordered list of rules matched
//! against the incident's `(exc_code, fault_module, offset, address,
//! callstack)`. Matching is first-rule-wins in file order; a rule is only
//! evaluated with complete state (all present match fields must succeed
//! or the rule is skipped).

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::i18n::{ConfidenceLevel, Language};
use crate::report::SignatureMatch;
use crate::{DiagError, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMatch {
    exc_code: Option<String>,
    fault_module: Option<String>,
    fault_offset_regex: Option<String>,
    fault_module_is_system: Option<bool>,
    exc_address_near_zero: Option<bool>,
    callstack_contains: Vec<String>,
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
struct RawSignature {
    id: String,
    #[serde(default)]
    r#match: RawMatch,
    #[serde(default)]
    diagnosis: RawDiagnosis,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    version: Option<u32>,
    #[serde(default)]
    signatures: Vec<Value>,
}

#[derive(Debug)]
struct Signature {
    id: String,
    exc_code: Option<u32>,
    fault_module_lower: Option<String>,
    fault_offset_re: Option<Regex>,
    fault_module_is_system: Option<bool>,
    exc_address_near_zero: Option<bool>,
    callstack_contains_lower: Vec<String>,
    cause_ko: String,
    cause_en: String,
    confidence: ConfidenceLevel,
    recommendations_ko: Vec<String>,
    recommendations_en: Vec<String>,
}

/// Inputs evaluated against the rule list.
#[derive(Debug, Default)]
pub struct SignatureMatchInput<'a> {
    pub exc_code: u32,
    pub fault_module: &'a str,
    pub fault_offset: u64,
    pub fault_module_is_system: bool,
    pub exc_address: u64,
    /// Formatted callstack frames (or crash-log tokens) searched by
    /// `callstack_contains`.
    pub callstack: &'a [String],
}

/// Ordered signature rule database.
#[derive(Debug, Default)]
pub struct SignatureDatabase {
    signatures: Vec<Signature>,
}

/// Parses a hex exception code, with or without a `0x` prefix.
fn parse_hex_u32(s: &str) -> Option<u32> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).ok()
}

impl SignatureDatabase {
    /// Loads `crash_signatures.json`.
    ///
    /// Individual rules with invalid regexes or hex codes are dropped
    /// (`RuleParseError` behavior); the remainder must still load. A file
    /// without a `version` field fails with `Config`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawDatabase = serde_json::from_str(text)?;
        if raw.version.is_none() {
            return Err(DiagError::Config("crash_signatures.json: missing version".into()));
        }

        let mut signatures = Vec::with_capacity(raw.signatures.len());
        for value in raw.signatures {
            let parsed: RawSignature = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(err) => {
                    debug!("signature entry dropped: {err}");
                    continue;
                }
            };
            if parsed.id.is_empty() {
                continue;
            }
            match compile_signature(parsed) {
                Ok(sig) => signatures.push(sig),
                Err(err) => warn!("signature rule dropped: {err}"),
            }
        }
        Ok(Self { signatures })
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// First rule whose present match fields all succeed.
    pub fn find_match(&self, input: &SignatureMatchInput<'_>, lang: Language) -> Option<SignatureMatch> {
        for sig in &self.signatures {
            if let Some(code) = sig.exc_code {
                if code != input.exc_code {
                    continue;
                }
            }
            if let Some(module) = &sig.fault_module_lower {
                if input.fault_module.to_lowercase() != *module {
                    continue;
                }
            }
            if let Some(re) = &sig.fault_offset_re {
                let offset_hex = format!("{:X}", input.fault_offset);
                if !re.is_match(&offset_hex) {
                    continue;
                }
            }
            if let Some(expected) = sig.fault_module_is_system {
                if expected != input.fault_module_is_system {
                    continue;
                }
            }
            if let Some(expected) = sig.exc_address_near_zero {
                let near_zero = input.exc_address <= 0x10000;
                if expected != near_zero {
                    continue;
                }
            }
            if !sig.callstack_contains_lower.is_empty() {
                let all_matched = sig.callstack_contains_lower.iter().all(|token| {
                    input
                        .callstack
                        .iter()
                        .any(|frame| frame.to_lowercase().contains(token))
                });
                if !all_matched {
                    continue;
                }
            }

            return Some(SignatureMatch {
                id: sig.id.clone(),
                cause: if lang.is_english() {
                    sig.cause_en.clone()
                } else {
                    sig.cause_ko.clone()
                },
                confidence: sig.confidence,
                recommendations: if lang.is_english() {
                    sig.recommendations_en.clone()
                } else {
                    sig.recommendations_ko.clone()
                },
            });
        }
        None
    }
}

fn compile_signature(raw: RawSignature) -> std::result::Result<Signature, String> {
    let exc_code = match &raw.r#match.exc_code {
        Some(s) => Some(parse_hex_u32(s).ok_or_else(|| format!("{}: bad exc_code '{s}'", raw.id))?),
        None => None,
    };
    let fault_offset_re = match &raw.r#match.fault_offset_regex {
        Some(pattern) if !pattern.is_empty() => Some(
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("{}: bad fault_offset_regex: {e}", raw.id))?,
        ),
        _ => None,
    };
    Ok(Signature {
        exc_code,
        fault_module_lower: raw
            .r#match
            .fault_module
            .as_ref()
            .map(|s| s.to_lowercase())
            .filter(|s| !s.is_empty()),
        fault_offset_re,
        fault_module_is_system: raw.r#match.fault_module_is_system,
        exc_address_near_zero: raw.r#match.exc_address_near_zero,
        callstack_contains_lower: raw
            .r#match
            .callstack_contains
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
        cause_ko: raw.diagnosis.cause_ko,
        cause_en: raw.diagnosis.cause_en,
        confidence: ConfidenceLevel::parse_token(&raw.diagnosis.confidence),
        recommendations_ko: raw.diagnosis.recommendations_ko,
        recommendations_en: raw.diagnosis.recommendations_en,
        id: raw.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "version": 1,
      "signatures": [
        {
          "id": "D6DDDA_VRAM",
          "match": {
            "exc_code": "0xC0000005",
            "fault_module": "SkyrimSE.exe",
            "fault_offset_regex": "^D6DDDA$",
            "callstack_contains": ["BSBatchRenderer::Draw"]
          },
          "diagnosis": {
            "cause_en": "Renderer crash commonly tied to VRAM exhaustion",
            "cause_ko": "VRAM 부족과 관련된 렌더러 크래시",
            "confidence": "high",
            "recommendations_en": ["Lower texture resolution"],
            "recommendations_ko": ["텍스처 해상도를 낮추세요"]
          }
        },
        {
          "id": "NULLPTR_GENERIC",
          "match": {"exc_code": "0xC0000005", "exc_address_near_zero": true},
          "diagnosis": {"cause_en": "Null pointer dereference", "confidence": "medium"}
        }
      ]
    }"#;

    #[test]
    fn matches_first_rule_with_all_fields() {
        let db = SignatureDatabase::from_json(SAMPLE).unwrap();
        assert_eq!(db.len(), 2);
        let frames = vec!["SkyrimSE.exe!BSBatchRenderer::Draw+0x2F".to_string()];
        let input = SignatureMatchInput {
            exc_code: 0xC000_0005,
            fault_module: "SkyrimSE.exe",
            fault_offset: 0xD6DDDA,
            fault_module_is_system: false,
            exc_address: 0x1_4000_0000,
            callstack: &frames,
        };
        let m = db.find_match(&input, Language::English).unwrap();
        assert_eq!(m.id, "D6DDDA_VRAM");
        assert_eq!(m.confidence, ConfidenceLevel::High);
        assert!(m.cause.contains("VRAM"));
    }

    #[test]
    fn partial_match_skips_to_next_rule() {
        let db = SignatureDatabase::from_json(SAMPLE).unwrap();
        // Offset mismatches the first rule; near-zero address fires the second.
        let input = SignatureMatchInput {
            exc_code: 0xC000_0005,
            fault_module: "SkyrimSE.exe",
            fault_offset: 0x1234,
            exc_address: 0x8,
            callstack: &[],
            ..Default::default()
        };
        let m = db.find_match(&input, Language::English).unwrap();
        assert_eq!(m.id, "NULLPTR_GENERIC");
    }

    #[test]
    fn no_match_when_callstack_token_missing() {
        let db = SignatureDatabase::from_json(SAMPLE).unwrap();
        let input = SignatureMatchInput {
            exc_code: 0xC000_0005,
            fault_module: "SkyrimSE.exe",
            fault_offset: 0xD6DDDA,
            exc_address: 0x1_4000_0000,
            callstack: &[],
            ..Default::default()
        };
        // First rule needs the callstack token; second needs near-zero.
        assert!(db.find_match(&input, Language::English).is_none());
    }

    #[test]
    fn invalid_regex_drops_only_that_rule() {
        let json = r#"{
          "version": 1,
          "signatures": [
            {"id": "BAD", "match": {"fault_offset_regex": "("}, "diagnosis": {}},
            {"id": "BADHEX", "match": {"exc_code": "zzz"}, "diagnosis": {}},
            {"id": "GOOD", "match": {"exc_code": "0xC0000005"}, "diagnosis": {"cause_en": "x"}}
          ]
        }"#;
        let db = SignatureDatabase::from_json(json).unwrap();
        assert_eq!(db.len(), 1);
        let input = SignatureMatchInput {
            exc_code: 0xC000_0005,
            ..Default::default()
        };
        assert_eq!(db.find_match(&input, Language::English).unwrap().id, "GOOD");
    }

    #[test]
    fn missing_version_is_config_error() {
        let err = SignatureDatabase::from_json(r#"{"signatures": []}"#).unwrap_err();
        assert!(matches!(err, DiagError::Config(_)));
    }

    #[test]
    fn korean_diagnosis_selected() {
        let db = SignatureDatabase::from_json(SAMPLE).unwrap();
        let frames = vec!["skyrimse.exe!bsbatchrenderer::draw+0x2f".to_string()];
        let input = SignatureMatchInput {
            exc_code: 0xC000_0005,
            fault_module: "skyrimse.EXE",
            fault_offset: 0xD6DDDA,
            exc_address: 0x1_4000_0000,
            callstack: &frames,
            ..Default::default()
        };
        let m = db.find_match(&input, Language::Korean).unwrap();
        assert!(m.cause.contains("렌더러"));
        assert_eq!(m.recommendations, vec!["텍스처 해상도를 낮추세요"]);
    }
}
