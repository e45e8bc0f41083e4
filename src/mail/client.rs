//! Mail tool client
//!
//! Domain facade over a `ProcessSupervisor` running the Google Workspace
//! MCP server with only its Gmail tools enabled. Logical tool names and
//! parameters are translated to the ones the tool expects, and results are
//! decoded into `MailMessage` values here rather than in the transport.

use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mail::message::{MailMessage, extract_text, parse_message_text, parse_search_text};
use crate::rpc::RpcError;
use crate::supervisor::config::{
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RESTART_ATTEMPTS, DEFAULT_STARTUP_TIMEOUT_MS,
};
use crate::supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorConfigError, SupervisorError};

/// MCP protocol revision sent in the initialize handshake
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name reported to the tool
pub const CLIENT_NAME: &str = "mailnotes-daemon";

/// Directory holding the tool's `main.py` when none is configured
pub const DEFAULT_MCP_PATH: &str = "google_workspace_mcp";

/// Interpreter used to run the tool
pub const DEFAULT_PYTHON: &str = "python";

/// Variables that carry the tool port
pub const MAIL_TOOL_PORT_ENV_VARS: [&str; 3] = ["PORT", "GMAIL_MCP_PORT", "MCP_PORT"];

/// Environment variables read by `MailToolConfig::from_env`
pub const MCP_PATH_ENV: &str = "GOOGLE_WORKSPACE_MCP_PATH";
pub const OAUTH_CLIENT_ID_ENV: &str = "GOOGLE_OAUTH_CLIENT_ID";
pub const OAUTH_CLIENT_SECRET_ENV: &str = "GOOGLE_OAUTH_CLIENT_SECRET";
pub const USER_EMAIL_ENVS: [&str; 2] = ["GMAIL_USER_EMAIL", "GOOGLE_USER_EMAIL"];

/// Logical tool names mapped to the tool's own names
const TOOL_MAP: [(&str, &str); 2] = [
    ("search_emails", "search_gmail_messages"),
    ("read_email", "get_gmail_message_content"),
];

#[derive(Debug, thiserror::Error)]
pub enum MailClientError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Tool '{tool}' reported an error: {message}")]
    Tool { tool: String, message: String },

    #[error("Unexpected response from '{method}': {detail}")]
    UnexpectedResponse { method: String, detail: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// How to launch and address the mail tool
#[derive(Debug, Clone)]
pub struct MailToolConfig {
    pub python: String,
    pub mcp_path: PathBuf,
    pub port: u16,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub user_email: String,
    pub restart_attempts: u32,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
}

impl MailToolConfig {
    /// Read tool settings through `env`
    pub fn from_env_with<F>(port: u16, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        Self {
            python: DEFAULT_PYTHON.to_string(),
            mcp_path: non_empty(MCP_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MCP_PATH)),
            port,
            oauth_client_id: non_empty(OAUTH_CLIENT_ID_ENV),
            oauth_client_secret: non_empty(OAUTH_CLIENT_SECRET_ENV),
            user_email: USER_EMAIL_ENVS
                .iter()
                .find_map(|name| non_empty(*name))
                .unwrap_or_else(|| "me".to_string()),
            restart_attempts: DEFAULT_RESTART_ATTEMPTS,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// Read tool settings from the process environment
    pub fn from_env(port: u16) -> Self {
        Self::from_env_with(port, |name| std::env::var(name).ok())
    }

    /// Supervisor configuration that launches the tool
    pub fn supervisor_config(&self) -> Result<SupervisorConfig, SupervisorConfigError> {
        let main_file = self.mcp_path.join("main.py");
        let mut builder = SupervisorConfig::builder(self.python.clone())
            .arg(main_file.display().to_string())
            .args(["--tools", "gmail", "--port"])
            .arg(self.port.to_string())
            .port(self.port)
            .port_env_vars(MAIL_TOOL_PORT_ENV_VARS)
            .restart_attempts(self.restart_attempts)
            .startup_timeout(self.startup_timeout)
            .request_timeout(self.request_timeout)
            .handshake("initialize", initialize_params());

        match &self.oauth_client_id {
            Some(id) => builder = builder.env(OAUTH_CLIENT_ID_ENV, id.clone()),
            None => warn!("{} is not set; the mail tool will fail to authenticate", OAUTH_CLIENT_ID_ENV),
        }
        match &self.oauth_client_secret {
            Some(secret) => builder = builder.env(OAUTH_CLIENT_SECRET_ENV, secret.clone()),
            None => warn!(
                "{} is not set; the mail tool will fail to authenticate",
                OAUTH_CLIENT_SECRET_ENV
            ),
        }

        builder.build()
    }
}

/// Parameters of the MCP `initialize` request
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "tools": true,
            "resources": true,
        },
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ============================================================================
// Client
// ============================================================================

/// Search request in the daemon's vocabulary
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub query: Option<String>,
    pub max_results: Option<u32>,
}

/// Mail operations over a supervised tool process
#[derive(Clone)]
pub struct MailToolClient {
    supervisor: ProcessSupervisor,
    user_email: String,
}

impl MailToolClient {
    pub fn new(config: &MailToolConfig) -> Result<Self, SupervisorConfigError> {
        let supervisor = ProcessSupervisor::new(config.supervisor_config()?);
        Ok(Self::with_supervisor(supervisor, config.user_email.clone()))
    }

    /// Wrap an existing supervisor
    pub fn with_supervisor(supervisor: ProcessSupervisor, user_email: impl Into<String>) -> Self {
        Self {
            supervisor,
            user_email: user_email.into(),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub async fn start(&self) -> Result<(), MailClientError> {
        self.supervisor.start().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), MailClientError> {
        self.supervisor.stop().await?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Forward a raw JSON-RPC request; `None` uses the configured timeout
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, MailClientError> {
        let result = match timeout {
            Some(timeout) => {
                self.supervisor
                    .send_request_with_timeout(method, params, timeout)
                    .await?
            }
            None => self.supervisor.send_request(method, params).await?,
        };
        Ok(result)
    }

    /// Call `tool` after translating its name and arguments
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, MailClientError> {
        let (name, arguments) = adapt_request(tool, arguments, &self.user_email);
        info!("Calling tool: {}", name);
        debug!("Tool arguments: {:?}", arguments);

        let result = self
            .supervisor
            .send_request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(MailClientError::Tool {
                tool: name,
                message: extract_text(&result).unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(result)
    }

    pub async fn search_emails(
        &self,
        params: &SearchParams,
    ) -> Result<Vec<MailMessage>, MailClientError> {
        let mut arguments = Map::new();
        if let Some(query) = &params.query {
            arguments.insert("query".to_string(), json!(query));
        }
        if let Some(max_results) = params.max_results {
            arguments.insert("maxResults".to_string(), json!(max_results));
        }

        let result = self.call_tool("search_emails", arguments).await?;
        let messages = extract_text(&result)
            .map(|text| parse_search_text(&text))
            .unwrap_or_default();
        debug!("Search returned {} message(s)", messages.len());
        Ok(messages)
    }

    pub async fn read_email(&self, message_id: &str) -> Result<MailMessage, MailClientError> {
        let mut arguments = Map::new();
        arguments.insert("messageId".to_string(), json!(message_id));

        let result = self.call_tool("read_email", arguments).await?;
        let text = extract_text(&result).ok_or_else(|| MailClientError::UnexpectedResponse {
            method: "read_email".to_string(),
            detail: "no text content".to_string(),
        })?;
        Ok(parse_message_text(&text, message_id))
    }
}

/// Translate a logical tool call into the tool's names and parameters
pub fn adapt_request(
    tool: &str,
    mut arguments: Map<String, Value>,
    user_email: &str,
) -> (String, Map<String, Value>) {
    let mapped = TOOL_MAP
        .iter()
        .find(|(logical, _)| *logical == tool)
        .map(|(_, actual)| actual.to_string())
        .unwrap_or_else(|| tool.to_string());

    if mapped.contains("gmail") {
        arguments.insert("user_google_email".to_string(), json!(user_email));
    }

    let rename = |arguments: &mut Map<String, Value>, from: &str, to: &str| {
        if let Some(value) = arguments.remove(from) {
            arguments.insert(to.to_string(), value);
        }
    };

    match tool {
        "search_emails" => {
            rename(&mut arguments, "maxResults", "page_size");
            rename(&mut arguments, "query", "query_string");
        }
        "read_email" => {
            rename(&mut arguments, "messageId", "message_id");
            arguments.insert("include_body".to_string(), json!(true));
        }
        _ => {}
    }

    (mapped, arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scripts::{MAIL_TOOL, sh};
    use std::collections::HashMap;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_adapt_search_request() {
        let (name, arguments) = adapt_request(
            "search_emails",
            args(json!({"query": "subject:transcript", "maxResults": 5})),
            "me@example.com",
        );
        assert_eq!(name, "search_gmail_messages");
        assert_eq!(
            Value::Object(arguments),
            json!({
                "query_string": "subject:transcript",
                "page_size": 5,
                "user_google_email": "me@example.com",
            })
        );
    }

    #[test]
    fn test_adapt_read_request() {
        let (name, arguments) =
            adapt_request("read_email", args(json!({"messageId": "abc"})), "me");
        assert_eq!(name, "get_gmail_message_content");
        assert_eq!(arguments["message_id"], "abc");
        assert_eq!(arguments["include_body"], true);
        assert!(!arguments.contains_key("messageId"));
    }

    #[test]
    fn test_unknown_tool_passes_through() {
        let (name, arguments) = adapt_request("list_labels", args(json!({"x": 1})), "me");
        assert_eq!(name, "list_labels");
        assert!(!arguments.contains_key("user_google_email"));
    }

    #[test]
    fn test_config_from_env() {
        let env: HashMap<&str, &str> = [
            (MCP_PATH_ENV, "/opt/workspace-mcp"),
            (OAUTH_CLIENT_ID_ENV, "client-id"),
            ("GOOGLE_USER_EMAIL", "user@example.com"),
        ]
        .into_iter()
        .collect();
        let config = MailToolConfig::from_env_with(3100, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.mcp_path, PathBuf::from("/opt/workspace-mcp"));
        assert_eq!(config.oauth_client_id.as_deref(), Some("client-id"));
        assert_eq!(config.oauth_client_secret, None);
        assert_eq!(config.user_email, "user@example.com");

        let supervisor_config = config.supervisor_config().unwrap();
        assert_eq!(supervisor_config.command, "python");
        assert_eq!(
            supervisor_config.args,
            vec!["/opt/workspace-mcp/main.py", "--tools", "gmail", "--port", "3100"]
        );
        let child_env = supervisor_config.child_env();
        for name in MAIL_TOOL_PORT_ENV_VARS {
            assert!(child_env.contains(&(name.to_string(), "3100".to_string())));
        }
        assert!(child_env.contains(&(OAUTH_CLIENT_ID_ENV.to_string(), "client-id".to_string())));
        assert_eq!(
            supervisor_config.handshake.as_ref().map(|h| h.method.as_str()),
            Some("initialize")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = MailToolConfig::from_env_with(3000, |_| None);
        assert_eq!(config.mcp_path, PathBuf::from(DEFAULT_MCP_PATH));
        assert_eq!(config.user_email, "me");
        assert_eq!(initialize_params()["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    fn fake_client() -> MailToolClient {
        let config = sh(MAIL_TOOL)
            .handshake("initialize", initialize_params())
            .build()
            .unwrap();
        MailToolClient::with_supervisor(ProcessSupervisor::new(config), "me@example.com")
    }

    #[tokio::test]
    async fn test_search_and_read_through_fake_tool() {
        let client = fake_client();
        client.start().await.unwrap();

        let messages = client
            .search_emails(&SearchParams {
                query: Some("transcript".to_string()),
                max_results: Some(10),
            })
            .await
            .unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        let message = client.read_email("m1").await.unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.subject.as_deref(), Some("Sync"));
        assert_eq!(message.body.as_deref(), Some("Action items follow"));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_error_result() {
        let client = fake_client();
        client.start().await.unwrap();

        match client.call_tool("list_labels", Map::new()).await {
            Err(MailClientError::Tool { tool, message }) => {
                assert_eq!(tool, "list_labels");
                assert_eq!(message, "unexpected call");
            }
            other => panic!("expected tool error, got {other:?}"),
        }

        client.stop().await.unwrap();
    }
}
