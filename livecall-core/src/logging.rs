//! Subscriber setup
//!
//! `RUST_LOG` overrides `logging.level`. Output goes to stdout unless
//! `logging.file_path` is set.

use std::path::Path;

use tracing_subscriber::{
    fmt::{format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = env_filter(&config.level)?;
    let to_file = config.file_path.is_some();
    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(file_appender(path)?),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer: BoxedLayer = if config.format == "json" {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(writer)
                .with_filter(filter),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(!to_file)
                .with_file(false)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(writer)
                .with_filter(filter),
        )
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = normalize_level(level)?;
    EnvFilter::try_new(&directives).map_err(|e| anyhow::anyhow!("Invalid log filter {directives:?}: {e}"))
}

/// Accepts a bare level (`warning` is an alias of `warn`) or a directive
/// list such as `info,livecall_sfu=debug`.
fn normalize_level(level: &str) -> anyhow::Result<String> {
    let level = level.trim().to_lowercase();
    if level.is_empty() {
        anyhow::bail!("Empty log level");
    }
    if level.contains(['=', ',']) {
        return Ok(level);
    }
    match level.as_str() {
        "warning" => Ok("warn".to_string()),
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(level),
        _ => anyhow::bail!("Invalid log level: {level}"),
    }
}

/// Never-rotating appender; creates the parent directory.
fn file_appender(file_path: &str) -> anyhow::Result<tracing_appender::rolling::RollingFileAppender> {
    let path = Path::new(file_path);
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {file_path}"))?;
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)?;
    Ok(tracing_appender::rolling::never(directory, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("INFO").unwrap(), "info");
        assert_eq!(normalize_level("warning").unwrap(), "warn");
        assert_eq!(normalize_level("info,livecall_sfu=debug").unwrap(), "info,livecall_sfu=debug");
        assert!(normalize_level("loud").is_err());
        assert!(normalize_level("  ").is_err());
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("livecall.log");
        let appender = file_appender(path.to_str().unwrap());
        assert!(appender.is_ok());
        assert!(dir.path().join("logs").is_dir());
    }
}
