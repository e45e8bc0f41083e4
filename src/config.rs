//! Port configuration
//!
//! Resolves the daemon's two ports (status front door and mail tool) with
//! priority CLI > environment > default, remembering every source that was
//! considered so diagnostics can show why a value won. Also validates the
//! allowed range, detects two services claiming the same port and suggests
//! alternatives.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Lowest accepted port, above the privileged range
pub const MIN_PORT: u16 = 1024;

/// Highest accepted port
pub const MAX_PORT: u16 = 65535;

/// Default port of the status front door
pub const DEFAULT_HTTP_PORT: u16 = 3002;

/// Default port handed to the mail tool
pub const DEFAULT_MCP_PORT: u16 = 3000;

/// Environment override for the status front door port
pub const HTTP_PORT_ENV: &str = "HTTP_SERVER_PORT";

/// Environment override for the mail tool port
pub const MCP_PORT_ENV: &str = "GMAIL_MCP_PORT";

/// Service names used in conflict reports
pub const HTTP_SERVICE: &str = "HTTP Server";
pub const MCP_SERVICE: &str = "Gmail MCP Service";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortConfigError {
    #[error("Port must be an integer, got '{raw}'")]
    NotANumber { raw: String },

    #[error("Port {port} is below the minimum allowed port {}", MIN_PORT)]
    BelowMinimum { port: u32 },

    #[error("Port {port} exceeds the maximum allowed port {}", MAX_PORT)]
    AboveMaximum { port: u32 },

    #[error("{}", format_conflict_summary(.conflicts))]
    Conflicts { conflicts: Vec<PortConflict> },
}

impl PortConfigError {
    /// Closest valid value, for error messages
    pub fn suggestion(&self) -> Option<u16> {
        match self {
            PortConfigError::NotANumber { .. } => Some(DEFAULT_HTTP_PORT),
            PortConfigError::BelowMinimum { .. } => Some(MIN_PORT),
            PortConfigError::AboveMaximum { .. } => Some(MAX_PORT),
            PortConfigError::Conflicts { conflicts } => conflicts
                .first()
                .and_then(|conflict| conflict.suggestions.first().copied()),
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Where a configuration value came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum ConfigSource {
    Cli,
    Environment(String),
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Cli => write!(f, "command line"),
            ConfigSource::Environment(var) => write!(f, "environment ({var})"),
            ConfigSource::Default => write!(f, "default"),
        }
    }
}

/// One candidate value considered during resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCandidate {
    pub source: ConfigSource,
    /// Raw text as provided; `None` when the source was not set
    pub raw: Option<String>,
    /// Parsed and validated value
    pub value: Option<u16>,
}

/// A resolved port together with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSetting {
    pub service: String,
    pub value: u16,
    pub source: ConfigSource,
    pub all_sources: Vec<SourceCandidate>,
}

impl PortSetting {
    /// Resolve one port: CLI, then `env_var`, then `default`
    ///
    /// An explicit CLI value must be valid. Invalid environment values are
    /// ignored with a warning and resolution falls through to the default.
    pub fn resolve(
        service: &str,
        cli: Option<u16>,
        env_var: &str,
        env_value: Option<String>,
        default: u16,
    ) -> Result<Self, PortConfigError> {
        let mut all_sources = Vec::with_capacity(3);

        if let Some(port) = cli {
            validate_port_range(u32::from(port))?;
        }
        all_sources.push(SourceCandidate {
            source: ConfigSource::Cli,
            raw: cli.map(|port| port.to_string()),
            value: cli,
        });

        let env_port = match env_value.as_deref() {
            Some(raw) => match parse_port(raw) {
                Ok(port) => Some(port),
                Err(e) => {
                    warn!("Ignoring {}={:?}: {}", env_var, raw, e);
                    None
                }
            },
            None => None,
        };
        all_sources.push(SourceCandidate {
            source: ConfigSource::Environment(env_var.to_string()),
            raw: env_value,
            value: env_port,
        });

        all_sources.push(SourceCandidate {
            source: ConfigSource::Default,
            raw: Some(default.to_string()),
            value: Some(default),
        });

        let (value, source) = match (cli, env_port) {
            (Some(port), _) => (port, ConfigSource::Cli),
            (None, Some(port)) => (port, ConfigSource::Environment(env_var.to_string())),
            (None, None) => (default, ConfigSource::Default),
        };

        debug!("{} port {} from {}", service, value, source);
        Ok(Self {
            service: service.to_string(),
            value,
            source,
            all_sources,
        })
    }
}

/// Both ports of the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub http: PortSetting,
    pub mcp: PortSetting,
}

impl PortConfig {
    /// Resolve both ports, reading overrides through `env`
    pub fn resolve_with<F>(
        cli_http: Option<u16>,
        cli_mcp: Option<u16>,
        env: F,
    ) -> Result<Self, PortConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http = PortSetting::resolve(
            HTTP_SERVICE,
            cli_http,
            HTTP_PORT_ENV,
            env(HTTP_PORT_ENV),
            DEFAULT_HTTP_PORT,
        )?;
        let mcp = PortSetting::resolve(
            MCP_SERVICE,
            cli_mcp,
            MCP_PORT_ENV,
            env(MCP_PORT_ENV),
            DEFAULT_MCP_PORT,
        )?;
        Ok(Self { http, mcp })
    }

    /// Resolve both ports from the process environment
    pub fn resolve(cli_http: Option<u16>, cli_mcp: Option<u16>) -> Result<Self, PortConfigError> {
        Self::resolve_with(cli_http, cli_mcp, |name| std::env::var(name).ok())
    }

    /// Ports already claimed by the daemon's services
    pub fn claimed_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.http.value, self.mcp.value];
        ports.dedup();
        ports
    }

    /// Fail if two services share a port
    pub fn validate(&self) -> Result<(), PortConfigError> {
        let conflicts = detect_conflicts(&[&self.http, &self.mcp]);
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(PortConfigError::Conflicts { conflicts })
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Check the allowed port range
pub fn validate_port_range(port: u32) -> Result<u16, PortConfigError> {
    if port < u32::from(MIN_PORT) {
        return Err(PortConfigError::BelowMinimum { port });
    }
    u16::try_from(port).map_err(|_| PortConfigError::AboveMaximum { port })
}

/// Parse and range-check a port given as text
pub fn parse_port(raw: &str) -> Result<u16, PortConfigError> {
    let trimmed = raw.trim();
    let port: u32 = trimmed.parse().map_err(|_| PortConfigError::NotANumber {
        raw: raw.to_string(),
    })?;
    validate_port_range(port)
}

/// Several services configured on the same port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortConflict {
    pub port: u16,
    pub services: Vec<String>,
    pub suggestions: Vec<u16>,
}

/// Find ports claimed by more than one service
pub fn detect_conflicts(settings: &[&PortSetting]) -> Vec<PortConflict> {
    let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for setting in settings {
        by_port
            .entry(setting.value)
            .or_default()
            .push(setting.service.clone());
    }

    let used: HashSet<u16> = by_port.keys().copied().collect();
    by_port
        .into_iter()
        .filter(|(_, services)| services.len() > 1)
        .map(|(port, services)| PortConflict {
            port,
            services,
            suggestions: suggest_alternatives(port, &used, 3),
        })
        .collect()
}

/// Nearby free ports: upward from `port`, then downward
pub fn suggest_alternatives(port: u16, used: &HashSet<u16>, count: usize) -> Vec<u16> {
    let upward = (port.saturating_add(1)..=MAX_PORT).filter(|p| *p > port);
    let downward = (MIN_PORT..port).rev();

    upward
        .chain(downward)
        .filter(|candidate| *candidate >= MIN_PORT && !used.contains(candidate))
        .take(count)
        .collect()
}

/// Human-readable conflict report
pub fn format_conflict_summary(conflicts: &[PortConflict]) -> String {
    if conflicts.is_empty() {
        return "No port conflicts detected.".to_string();
    }

    let plural = if conflicts.len() > 1 { "s" } else { "" };
    let mut lines = vec![format!("Found {} port conflict{}:", conflicts.len(), plural)];
    for (index, conflict) in conflicts.iter().enumerate() {
        let suggestions = if conflict.suggestions.is_empty() {
            String::new()
        } else {
            let list: Vec<String> = conflict
                .suggestions
                .iter()
                .take(3)
                .map(u16::to_string)
                .collect();
            format!(" Try: {}", list.join(", "))
        };
        lines.push(format!(
            "  {}. Port {} is used by: {}.{}",
            index + 1,
            conflict.port,
            conflict.services.join(" and "),
            suggestions
        ));
    }
    lines.join("\n")
}
