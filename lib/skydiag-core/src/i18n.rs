//! Output language and confidence labels.
//!
//! The engine produces user-facing evidence and recommendations in either
//! English or Korean; everything else (JSON keys, rule ids, module names)
//! is language-neutral.

use serde::{Deserialize, Serialize};

/// Output language for evidence, recommendations, and the summary sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ko", alias = "korean")]
    Korean,
}

impl Language {
    /// Parses a language token such as `en`, `eng`, `ko`, or `korean`.
    /// Unknown tokens fall back to English.
    pub fn parse_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "ko" | "kor" | "korean" => Language::Korean,
            _ => Language::English,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Korean => "ko",
        }
    }

    pub fn is_english(self) -> bool {
        self == Language::English
    }
}

/// Confidence attached to suspects, evidence items, and diagnoses.
///
/// Ordering is by strength: `High` beats `Medium` beats `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    #[default]
    Unknown,
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    /// Parses the `confidence` field of a rule diagnosis (`high`/`medium`/`low`).
    pub fn parse_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "high" => ConfidenceLevel::High,
            "medium" => ConfidenceLevel::Medium,
            "low" => ConfidenceLevel::Low,
            _ => ConfidenceLevel::Unknown,
        }
    }

    /// Localized display label.
    pub fn label(self, lang: Language) -> &'static str {
        if lang.is_english() {
            match self {
                ConfidenceLevel::High => "High",
                ConfidenceLevel::Medium => "Medium",
                ConfidenceLevel::Low => "Low",
                ConfidenceLevel::Unknown => "Unknown",
            }
        } else {
            match self {
                ConfidenceLevel::High => "높음",
                ConfidenceLevel::Medium => "중간",
                ConfidenceLevel::Low => "낮음",
                ConfidenceLevel::Unknown => "(unknown)",
            }
        }
    }

    /// One step weaker: High -> Medium -> Low. Used when a hook-framework
    /// module is promoted away from the top suspect slot.
    pub fn downgraded(self) -> Self {
        match self {
            ConfidenceLevel::High => ConfidenceLevel::Medium,
            ConfidenceLevel::Medium => ConfidenceLevel::Low,
            other => other,
        }
    }
}
