// src/logging.rs
//! Global log dispatch shared by the agent and the collector binaries.

use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::{path::Path, process, thread};

use crate::config::LoggingConfig;

/// Map the `[logging].level` string onto a filter; unknown names mean INFO.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "OFF" => LevelFilter::Off,
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Configure global logging as requested in `[logging]`.
///
/// Lines always go to stdout; with `enable = true` they are also appended to
/// `file` (or `default_file`) under `base_dir`.
pub fn setup_logging(
    base_dir: &Path,
    cfg: &LoggingConfig,
    default_file: &str,
) -> Result<(), fern::InitError> {
    let log_path = cfg
        .enable
        .then(|| base_dir.join(cfg.file.as_deref().unwrap_or(default_file)));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(parse_level(&cfg.level))
        // the exporter's HTTP stack is chatty at DEBUG
        .level_for("hyper", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("Warn"), LevelFilter::Warn);
        assert_eq!(parse_level("verbose"), LevelFilter::Info);
        assert_eq!(parse_level("off"), LevelFilter::Off);
    }
}
