// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialization shared by kvfs binaries
//!
//! Every binary flattens [`CliLoggingArgs`] into its clap arguments and calls
//! [`CliLoggingArgs::init`] once at startup. `RUST_LOG` always wins over the
//! level chosen on the command line or in the filesystem config.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Minimum level to log at
///
/// Accepts the level names used by kvfs config files, where `critical` is the
/// most severe level and `warning` is spelled out.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    /// Only error conditions
    #[value(alias = "critical")]
    #[serde(alias = "critical")]
    Error,
    /// Errors and warnings
    #[value(alias = "warning")]
    #[serde(alias = "warning")]
    Warn,
    /// Errors, warnings, and informational messages
    #[default]
    Info,
    /// All above plus debug information
    Debug,
    /// All above plus detailed tracing
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" | "error" => Ok(CliLogLevel::Error),
            "warning" | "warn" => Ok(CliLogLevel::Warn),
            "info" => Ok(CliLogLevel::Info),
            "debug" => Ok(CliLogLevel::Debug),
            "trace" => Ok(CliLogLevel::Trace),
            _ => Err(format!(
                "Invalid log level: {}. Use critical, error, warn, info, debug or trace",
                s
            )),
        }
    }
}

/// Logging arguments for `#[command(flatten)]`
///
/// Logs go to stderr unless `--log-file` or `--log-dir` is given. A mounted
/// filesystem usually runs detached from a terminal, so the file options are
/// the common case in production.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Minimum level to log at
    #[arg(
        short = 'L',
        long = "level",
        value_enum,
        help = "Minimum level to log at (overrides the config file)"
    )]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    #[arg(long, help = "Directory for log files (default: platform specific)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    #[arg(long, help = "Log filename")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl CliLoggingArgs {
    /// Initialize the global subscriber
    ///
    /// `default_level` applies when neither `--level` nor `RUST_LOG` is given;
    /// callers pass the level from their config file here.
    pub fn init(self, component: &str, default_level: CliLogLevel) -> anyhow::Result<()> {
        let level = self.effective_level(default_level).into();
        let format = self.log_format.unwrap_or_default();

        if self.logs_to_file() {
            let log_path = self.resolve_log_path(component);
            init_to_file(component, level, format, &log_path)
        } else {
            init(component, level, format)
        }
    }

    pub fn effective_level(&self, default_level: CliLogLevel) -> CliLogLevel {
        self.log_level.unwrap_or(default_level)
    }

    pub fn logs_to_file(&self) -> bool {
        self.log_file.is_some() || self.log_dir.is_some()
    }

    /// Resolve the log file path
    ///
    /// An absolute `--log-file` is used as is. A relative one is placed under
    /// `--log-dir` when given. With only `--log-dir`, the file is named after the
    /// component. Otherwise the platform standard location is used.
    pub fn resolve_log_path(&self, component: &str) -> PathBuf {
        match (&self.log_file, &self.log_dir) {
            (Some(file), _) if Path::new(file).is_absolute() => PathBuf::from(file),
            (Some(file), Some(dir)) => Path::new(dir).join(file),
            (Some(file), None) => PathBuf::from(file),
            (None, Some(dir)) => Path::new(dir).join(format!("{}.log", component)),
            (None, None) => get_standard_log_path_for_component(component),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log_level.is_none()
            && self.log_format.is_none()
            && self.log_dir.is_none()
            && self.log_file.is_none()
    }
}

/// Platform log location for one component
///
/// - macOS: ~/Library/Logs/kvfs/<component>.log
/// - Windows: %APPDATA%\kvfs\<component>.log
/// - Linux and others: ~/.local/share/kvfs/<component>.log
pub fn get_standard_log_path_for_component(component: &str) -> PathBuf {
    let filename = format!("{}.log", component);

    #[cfg(target_os = "macos")]
    {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("Library");
        path.push("Logs");
        path.push("kvfs");
        path.push(filename);
        path
    }

    #[cfg(not(target_os = "macos"))]
    {
        let mut path = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("kvfs");
        path.push(filename);
        path
    }
}

/// Log to stderr; stdout is left to the binary
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

pub fn init_plaintext(component: &str, default_level: Level) -> anyhow::Result<()> {
    init(component, default_level, LogFormat::Plaintext)
}

/// Append to `log_path`, creating its directory first
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    use std::fs;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    init_with_writer(component, default_level, format, log_file)
}

/// Filter directives used when `RUST_LOG` is unset
///
/// Tracing targets are module paths, so the component name is matched with
/// underscores in place of dashes.
pub fn default_directives(component: &str, level: Level) -> String {
    format!("{},{}={}", level, component.replace('-', "_"), level)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(component, default_level)));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::str::FromStr;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        logging: CliLoggingArgs,
    }

    #[test]
    fn config_level_names_parse() {
        assert_eq!(CliLogLevel::from_str("critical").unwrap(), CliLogLevel::Error);
        assert_eq!(CliLogLevel::from_str("error").unwrap(), CliLogLevel::Error);
        assert_eq!(CliLogLevel::from_str("WARNING").unwrap(), CliLogLevel::Warn);
        assert_eq!(CliLogLevel::from_str(" info ").unwrap(), CliLogLevel::Info);
        assert_eq!(CliLogLevel::from_str("debug").unwrap(), CliLogLevel::Debug);
        assert!(CliLogLevel::from_str("loud").is_err());
    }

    #[test]
    fn serde_accepts_aliases() {
        let level: CliLogLevel = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(level, CliLogLevel::Error);
        assert_eq!(serde_json::to_string(&CliLogLevel::Warn).unwrap(), "\"warn\"");
    }

    #[test]
    fn cli_log_level_conversion() {
        assert_eq!(Level::from(CliLogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(CliLogLevel::Info), Level::INFO);
        assert_eq!(Level::from(CliLogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
    }

    #[test]
    fn cli_flags_parse() {
        let args = TestArgs::try_parse_from(["kvfs", "-L", "critical", "--log-format", "json"])
            .unwrap();
        assert_eq!(args.logging.log_level, Some(CliLogLevel::Error));
        assert_eq!(args.logging.log_format, Some(LogFormat::Json));
        assert!(!args.logging.logs_to_file());

        let args = TestArgs::try_parse_from(["kvfs"]).unwrap();
        assert!(args.logging.is_empty());
    }

    #[test]
    fn cli_level_wins_over_default() {
        let args = CliLoggingArgs {
            log_level: Some(CliLogLevel::Debug),
            ..Default::default()
        };
        assert_eq!(args.effective_level(CliLogLevel::Error), CliLogLevel::Debug);
        assert_eq!(
            CliLoggingArgs::default().effective_level(CliLogLevel::Warn),
            CliLogLevel::Warn
        );
    }

    #[test]
    fn log_path_resolution() {
        let dir = tempfile::TempDir::new().unwrap();
        let dir_str = dir.path().to_string_lossy().to_string();
        let absolute = dir.path().join("abs.log").to_string_lossy().to_string();

        let args = CliLoggingArgs {
            log_file: Some(absolute.clone()),
            log_dir: Some("/ignored".into()),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("kvfs"), PathBuf::from(&absolute));

        let args = CliLoggingArgs {
            log_file: Some("sub/fs.log".into()),
            log_dir: Some(dir_str.clone()),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("kvfs"), dir.path().join("sub/fs.log"));

        let args = CliLoggingArgs {
            log_dir: Some(dir_str),
            ..Default::default()
        };
        assert!(args.logs_to_file());
        assert_eq!(args.resolve_log_path("kvfs-fuse-host"), dir.path().join("kvfs-fuse-host.log"));
    }

    #[test]
    fn standard_log_path_names_component() {
        let path = get_standard_log_path_for_component("kvfs-fuse-host");
        assert!(path.ends_with("kvfs/kvfs-fuse-host.log"));
    }

    #[test]
    fn default_directives_use_target_names() {
        assert_eq!(
            default_directives("kvfs-fuse-host", Level::WARN),
            "WARN,kvfs_fuse_host=WARN"
        );
    }
}
