use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Load the config from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// The socket address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if !self.server.studio_url.starts_with("http://")
            && !self.server.studio_url.starts_with("https://")
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.studio_url".into(),
                message: format!(
                    "studio_url must start with http:// or https:// (got \"{}\")",
                    self.server.studio_url
                ),
            });
        }

        if self.agent.program.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "agent.program".into(),
                message: "agent program must not be empty".into(),
            });
        }

        if self.stream.subscriber_buffer < 8 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "stream.subscriber_buffer".into(),
                message: "very small subscriber buffers drop slow consumers aggressively".into(),
            });
        }

        if self.lifecycle.terminate_grace_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "lifecycle.terminate_grace_secs".into(),
                message: "a zero grace period hard-kills agents immediately".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Public base URL handed to agent subprocesses for their callbacks.
    #[serde(default = "d_studio_url")]
    pub studio_url: String,
    /// Env var holding the API bearer token. Unset env = auth disabled.
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    /// Env var holding the shared secret for `/trpc` agent callbacks.
    #[serde(default = "d_callback_token_env")]
    pub callback_token_env: String,
    /// Allowed CORS origins. Empty = same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            studio_url: d_studio_url(),
            api_token_env: d_api_token_env(),
            callback_token_env: d_callback_token_env(),
            cors_origins: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all durable state (conversations, messages,
    /// agent sessions, plans).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent subprocess
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable spawned for every reply.
    #[serde(default = "d_agent_program")]
    pub program: String,
    /// Arguments placed before the wire flag set (e.g. a script path).
    #[serde(default)]
    pub leading_args: Vec<String>,
    #[serde(default = "d_llm_provider")]
    pub llm_provider: String,
    #[serde(default = "d_model_name")]
    pub model_name: String,
    /// Env var holding the model API key, forwarded via `--apiKey`.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Root of the per-(user, conversation) file namespace.
    #[serde(default = "d_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub tools: AgentToolsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: d_agent_program(),
            leading_args: Vec::new(),
            llm_provider: d_llm_provider(),
            model_name: d_model_name(),
            api_key_env: d_api_key_env(),
            workspace: d_workspace(),
            mode: AgentMode::default(),
            tools: AgentToolsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Direct,
    Coordinator,
}

impl AgentMode {
    /// The value passed on the agent's `--mode` flag.
    pub fn as_flag(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Coordinator => "coordinator",
        }
    }
}

/// Tool visibility policy, loaded once at startup and fixed for the life
/// of every in-flight reply.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentToolsConfig {
    /// Raw tool names whose calls and results never reach clients.
    #[serde(default)]
    pub hidden: Vec<String>,
    /// Raw tool name → user-facing display name.
    #[serde(default)]
    pub rename: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Seconds of SSE inactivity before a heartbeat frame is written.
    #[serde(default = "d_heartbeat")]
    pub heartbeat_secs: u64,
    /// Bounded queue depth per hub subscriber.
    #[serde(default = "d_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: d_heartbeat(),
            subscriber_buffer: d_buffer(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds between soft-kill and hard-kill on interrupt.
    #[serde(default = "d_terminate_grace")]
    pub terminate_grace_secs: u64,
    /// Seconds between soft-kill and hard-kill on process shutdown.
    #[serde(default = "d_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// TTL of the `agent:reply:{id}` forensic snapshots.
    #[serde(default = "d_forensics_ttl")]
    pub forensics_ttl_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            terminate_grace_secs: d_terminate_grace(),
            shutdown_grace_secs: d_shutdown_grace(),
            forensics_ttl_secs: d_forensics_ttl(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8787
}
fn d_studio_url() -> String {
    "http://127.0.0.1:8787".into()
}
fn d_api_token_env() -> String {
    "STUDIO_API_TOKEN".into()
}
fn d_callback_token_env() -> String {
    "STUDIO_CALLBACK_TOKEN".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
fn d_agent_program() -> String {
    "test-agent".into()
}
fn d_llm_provider() -> String {
    "openai".into()
}
fn d_model_name() -> String {
    "gpt-4o".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}
fn d_heartbeat() -> u64 {
    30
}
fn d_buffer() -> usize {
    256
}
fn d_terminate_grace() -> u64 {
    5
}
fn d_shutdown_grace() -> u64 {
    3
}
fn d_forensics_ttl() -> u64 {
    3_600
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
