//! SkyrimDiag Core Library
//!
//! This crate implements the post-incident analysis engine for modded
//! Skyrim: it parses a crash/hang minidump, reconstructs the module and
//! thread tables, walks and scores callstacks, matches known crash
//! signatures, fuses sidecar signals (Crash Logger logs, plugin scans,
//! MO2 install layout, embedded blackbox/WCT streams), and produces a
//! ranked, localized diagnosis.

pub mod addressdb;
pub mod analyzer;
pub mod blackbox;
pub mod bucket;
pub mod crashlog;
pub mod evidence;
pub mod graphics;
pub mod history;
pub mod i18n;
pub mod minidump;
pub mod mo2;
pub mod modules;
pub mod output;
pub mod plugins;
pub mod report;
pub mod scoring;
pub mod signatures;
pub mod stackwalk;
pub mod symbols;
pub mod threads;
pub mod wct;

use thiserror::Error;

/// Error types for SkyrimDiag operations.
#[derive(Error, Debug)]
pub enum DiagError {
    /// File absent or a read failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dump signature or stream directory failed validation.
    /// Fatal for the analysis pass.
    #[error("Malformed minidump: {0}")]
    MalformedDump(String),

    /// An individual stream failed validation. The affected signal is
    /// disabled but the pass continues.
    #[error("Malformed stream: {0}")]
    MalformedStream(&'static str),

    /// The symbol subsystem could not be initialized.
    #[error("Symbol session init failed: {0}")]
    SymInit(String),

    /// A data JSON was invalid or its schema version is unsupported.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single rule inside a rules JSON was invalid.
    #[error("Rule parse error: {0}")]
    RuleParse(String),

    /// Failed to serialize or deserialize data.
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Failed to write an output artifact.
    #[error("Output write failed: {0}")]
    OutputWrite(String),
}

/// A specialized Result type for SkyrimDiag operations.
pub type Result<T> = std::result::Result<T, DiagError>;
