//! Test helpers
//!
//! Scripted `sh -c` mail tools and, with the `test-logging` feature, a
//! subscriber shared by every test module.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::fmt;

    use crate::logging::LogConfig;

    static INIT: Once = Once::new();

    /// Install a test-writer subscriber once per test binary
    ///
    /// Uses the daemon's own `LogConfig`, so `RUST_LOG` and
    /// `MAILNOTES_TOOL_LOG` behave as they do in production. Without
    /// `RUST_LOG` the daemon logs at debug and the scripted tools at trace.
    ///
    /// ```bash
    /// MAILNOTES_TOOL_LOG=off cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let mut config = LogConfig::from_env();
            if std::env::var_os("RUST_LOG").is_none() {
                config.level = "debug,tokio=info,hyper=info".to_string();
                config.tool_level.get_or_insert_with(|| "trace".to_string());
            }

            fmt()
                .with_env_filter(config.env_filter())
                .with_test_writer()
                .with_target(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Initialize test logging before any test in the module runs
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Supervised child processes scripted with `sh -c`
#[cfg(test)]
pub mod scripts {
    use std::time::Duration;

    use crate::supervisor::SupervisorConfig;
    use crate::supervisor::config::SupervisorConfigBuilder;

    /// Prints a ready line, then answers every request with `{"echo": <tag>}`
    pub const ECHO_SERVER: &str = r#"echo "MCP server running"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  tag=$(printf '%s' "$line" | sed -n 's/.*"tag":"\([^"]*\)".*/\1/p')
  printf '{"jsonrpc":"2.0","result":{"echo":"%s"},"id":"%s"}\n' "$tag" "$id"
done"#;

    /// Fake mail tool: answers initialize, ping, one search and one read
    ///
    /// Any other call gets a tool-level error result.
    pub const MAIL_TOOL: &str = r#"echo "MCP server running"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05"},"id":"%s"}\n' "$id" ;;
    *'"method":"ping"'*)
      printf '{"jsonrpc":"2.0","result":{"pong":true},"id":"%s"}\n' "$id" ;;
    *'"name":"search_gmail_messages"'*'"query_string":"transcript"'*|*'"query_string":"transcript"'*'"name":"search_gmail_messages"'*)
      printf '{"jsonrpc":"2.0","result":{"content":[{"type":"text","text":"ID: m1\\nSubject: Sync\\n\\nID: m2\\nSubject: Retro"}]},"id":"%s"}\n' "$id" ;;
    *'"message_id":"m1"'*)
      printf '{"jsonrpc":"2.0","result":{"content":[{"type":"text","text":"Subject: Sync\\n\\nAction items follow"}]},"id":"%s"}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","result":{"isError":true,"content":[{"type":"text","text":"unexpected call"}]},"id":"%s"}\n' "$id" ;;
  esac
done"#;

    /// Supervisor config running `script` with short test timings
    pub fn sh(script: &str) -> SupervisorConfigBuilder {
        SupervisorConfig::builder("sh")
            .args(["-c", script])
            .ready_fallback(None)
            .startup_timeout(Duration::from_secs(5))
            .request_timeout(Duration::from_secs(5))
            .shutdown_grace(Duration::from_millis(100))
            .kill_grace(Duration::from_millis(500))
            .restart_delays(Duration::from_millis(10), Duration::from_millis(40))
    }
}
