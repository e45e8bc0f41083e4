mod config;
mod daemon;
mod http_server;
mod io;
mod logging;
mod mail;
mod net;
mod rpc;
mod supervisor;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use config::{PortConfig, parse_port};
use daemon::Daemon;
use logging::{LogConfig, init_logging};
use mail::MailToolConfig;

use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// CLI arguments for the mail notes daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP server port (overrides HTTP_SERVER_PORT env var)
    #[arg(long, value_name = "PORT", value_parser = port_arg)]
    http_port: Option<u16>,

    /// Port handed to the mail tool (overrides GMAIL_MCP_PORT env var)
    #[arg(long, value_name = "PORT", value_parser = port_arg)]
    mcp_port: Option<u16>,

    /// Interpreter used to launch the mail tool (defaults to python)
    #[arg(long, value_name = "PATH")]
    mcp_command: Option<String>,

    /// Mail tool checkout directory (overrides GOOGLE_WORKSPACE_MCP_PATH env var)
    #[arg(long, value_name = "DIR")]
    mcp_path: Option<PathBuf>,

    /// Consecutive restart attempts before giving up
    #[arg(long, value_name = "N")]
    restart_attempts: Option<u32>,

    /// Time allowed for the mail tool to become ready
    #[arg(long, value_name = "MS")]
    startup_timeout_ms: Option<u64>,

    /// Default per-request timeout
    #[arg(long, value_name = "MS")]
    request_timeout_ms: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Level for the mail tool's own output (overrides MAILNOTES_TOOL_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    tool_log_level: Option<String>,

    /// Log file path (overrides MAILNOTES_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Print the resolved port configuration as JSON and exit
    #[arg(long)]
    config_dump: bool,
}

fn port_arg(raw: &str) -> Result<u16, String> {
    parse_port(raw).map_err(|e| e.to_string())
}

fn apply_overrides(mut mail: MailToolConfig, args: &Args) -> MailToolConfig {
    if let Some(command) = &args.mcp_command {
        mail.python = command.clone();
    }
    if let Some(path) = &args.mcp_path {
        mail.mcp_path = path.clone();
    }
    if let Some(attempts) = args.restart_attempts {
        mail.restart_attempts = attempts;
    }
    if let Some(ms) = args.startup_timeout_ms {
        mail.startup_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = args.request_timeout_ms {
        mail.request_timeout = Duration::from_millis(ms);
    }
    mail
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(
        args.log_level.clone(),
        args.tool_log_level.clone(),
        args.log_file.clone(),
    );
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let ports = match PortConfig::resolve(args.http_port, args.mcp_port) {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("{e}");
            if let Some(port) = e.suggestion() {
                eprintln!("Suggestion: try port {port}");
            }
            std::process::exit(1);
        }
    };

    if args.config_dump {
        match serde_json::to_string_pretty(&ports) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to serialize port configuration: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let mail = apply_overrides(MailToolConfig::from_env(ports.mcp.value), &args);
    info!(
        "Starting {} {} (HTTP port {} from {}, mail tool port {} from {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        ports.http.value,
        ports.http.source,
        ports.mcp.value,
        ports.mcp.source
    );

    match Daemon::new(ports, mail).run().await {
        Ok(exit) => {
            info!("Daemon exited: {:?}", exit);
            std::process::exit(exit.code());
        }
        Err(e) => {
            eprintln!("{e}");
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {hint}");
            }
            std::process::exit(1);
        }
    }
}
