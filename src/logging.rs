//! Logging setup
//!
//! `tracing-subscriber` configured from `RUST_LOG` and the `MAILNOTES_*`
//! variables, with CLI overrides. Logs never go to stdout.
//!
//! Lines the mail tool prints on stderr are re-logged under the
//! `mail_tool` target. `MAILNOTES_TOOL_LOG` (or `--tool-log-level`) sets
//! their level independently of the daemon's own output.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target used for re-logged mail tool output
pub const MAIL_TOOL_TARGET: &str = "mail_tool";

const DEFAULT_LEVEL: &str = "info";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter for the daemon itself (`RUST_LOG` syntax)
    pub level: String,
    /// Level for the `mail_tool` target; `None` inherits `level`
    pub tool_level: Option<String>,
    /// Log file; stderr when unset
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_string(),
            tool_level: None,
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_env_with<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| env(name).is_some_and(|value| value == "true");

        let file_path = env("MAILNOTES_LOG_FILE").map(|path| {
            let path = PathBuf::from(path);
            if flag("MAILNOTES_LOG_UNIQUE") {
                unique_log_path(&path, std::process::id())
            } else {
                path
            }
        });

        Self {
            level: env("RUST_LOG").unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            tool_level: env("MAILNOTES_TOOL_LOG").filter(|level| !level.trim().is_empty()),
            file_path,
            json_format: flag("MAILNOTES_LOG_JSON"),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(
        mut self,
        level: Option<String>,
        tool_level: Option<String>,
        file_path: Option<PathBuf>,
    ) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(tool_level) = tool_level {
            self.tool_level = Some(tool_level);
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }

    /// Filter directives; the tool directive comes last so it wins for its target
    pub fn filter_directives(&self) -> String {
        match &self.tool_level {
            Some(tool_level) => format!("{},{}={}", self.level, MAIL_TOOL_TARGET, tool_level),
            None => self.level.clone(),
        }
    }

    /// The configured filter, or plain `info` if the directives do not parse
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(self.filter_directives()).unwrap_or_else(|e| {
            eprintln!(
                "Invalid log filter '{}' ({e}), using '{}'",
                self.filter_directives(),
                DEFAULT_LEVEL
            );
            EnvFilter::new(DEFAULT_LEVEL)
        })
    }
}

/// `daemon.log` becomes `daemon.<pid>.log`
fn unique_log_path(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(extension) => format!("{}.{}.{}", stem.to_string_lossy(), pid, extension),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(name)
}

/// Initialize the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (writer, ansi) = match &config.file_path {
        Some(file_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(config.env_filter());
    if config.json_format {
        registry
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    Ok(())
}

/// One JSON-RPC message exchanged with the mail tool, in one line
#[macro_export]
macro_rules! log_rpc_message {
    ($level:expr, $direction:expr, $kind:expr, $id:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            kind = $kind,
            id = %$id,
            "JSON-RPC message"
        );
    };
}

/// Duration of a lifecycle operation
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $elapsed:expr) => {{
        let elapsed: std::time::Duration = $elapsed;
        tracing::event!(
            $level,
            operation = $operation,
            elapsed_ms = elapsed.as_millis() as u64,
            "{} took {:?}",
            $operation,
            elapsed
        );
    }};
}
