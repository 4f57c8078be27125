//! Headless SkyrimDiag driver: analyze one dump, write the result files.
//!
//! Exit codes: 0 ok, 2 bad arguments (clap default), 3 analysis failed,
//! 4 output write failed.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use skydiag_core::analyzer::{analyze, AnalyzeOptions};
use skydiag_core::i18n::Language;
use skydiag_core::output::write_outputs;

#[derive(Parser, Debug)]
#[command(
    name = "skydiag",
    about = "Analyzes a modded-Skyrim crash/hang minidump and writes a ranked diagnosis",
    version
)]
struct Cli {
    /// Path to the minidump (.dmp) to analyze.
    dump_path: PathBuf,

    /// Output directory (defaults to the dump's directory).
    #[arg(long = "out-dir")]
    out_dir: Option<PathBuf>,

    /// Allow symbol-server usage (opt-in).
    #[arg(long = "allow-online-symbols", conflicts_with = "no_online_symbols")]
    allow_online_symbols: bool,

    /// Disallow symbol-server usage.
    #[arg(long = "no-online-symbols")]
    no_online_symbols: bool,

    /// Output language for evidence and recommendations.
    #[arg(long, value_parser = ["en", "ko"], default_value = "en")]
    lang: String,

    /// Disable path redaction in the report output.
    #[arg(long)]
    debug: bool,

    /// Accepted for compatibility with the capture helper; ignored.
    #[arg(long, hide = true)]
    headless: bool,
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn data_dir_next_to_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.join("data");
    dir.is_dir().then_some(dir)
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let allow_online = if cli.allow_online_symbols {
        true
    } else if cli.no_online_symbols {
        false
    } else {
        env_bool("SKYRIMDIAG_ALLOW_ONLINE_SYMBOLS", false)
    };

    let opts = AnalyzeOptions {
        out_dir: cli.out_dir.clone(),
        language: Language::parse_token(&cli.lang),
        allow_online_symbols: allow_online,
        debug: cli.debug,
        data_dir: data_dir_next_to_exe(),
        game_version: std::env::var("SKYRIMDIAG_GAME_VERSION")
            .ok()
            .filter(|v| !v.is_empty()),
        history_path: None,
        disable_history: false,
    };

    let result = match analyze(&cli.dump_path, &opts) {
        Ok(r) => r,
        Err(err) => {
            error!("analysis failed: {err}");
            return Ok(3);
        }
    };

    println!("{}", result.summary_sentence);
    if !result.crash_bucket_key.is_empty() {
        println!("bucket: {}", result.crash_bucket_key);
    }

    if let Err(err) = write_outputs(&result, !cli.debug) {
        error!("output write failed: {err}");
        return Ok(4);
    }
    Ok(0)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).context("skydiag failed") {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_minimal_invocation() {
        let cli = Cli::try_parse_from(["skydiag", "crash.dmp"]).unwrap();
        assert_eq!(cli.dump_path, PathBuf::from("crash.dmp"));
        assert!(!cli.debug);
        assert_eq!(cli.lang, "en");
    }

    #[test]
    fn cli_parses_full_invocation() {
        let cli = Cli::try_parse_from([
            "skydiag",
            "crash.dmp",
            "--out-dir",
            "out",
            "--allow-online-symbols",
            "--lang",
            "ko",
            "--debug",
            "--headless",
        ])
        .unwrap();
        assert!(cli.allow_online_symbols);
        assert!(cli.headless);
        assert_eq!(cli.lang, "ko");
    }

    #[test]
    fn online_flags_conflict() {
        assert!(Cli::try_parse_from([
            "skydiag",
            "crash.dmp",
            "--allow-online-symbols",
            "--no-online-symbols",
        ])
        .is_err());
    }

    #[test]
    fn missing_dump_path_is_an_error() {
        assert!(Cli::try_parse_from(["skydiag"]).is_err());
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
