//! Configuration loading, validation, and management for OmniBridge.
//!
//! Loads configuration from `~/.omnibridge/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use omnibridge_core::{AgentSettings, BackendKind, SentinelMarkers};

/// The root configuration structure.
///
/// Maps directly to `~/.omnibridge/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which model backend to drive
    #[serde(default)]
    pub backend: BackendConfig,

    /// Agent loop limits
    #[serde(default)]
    pub agent: AgentSettings,

    /// MCP client behavior
    #[serde(default)]
    pub mcp: McpConfig,

    /// Retrieval (embedding + vector store) settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Tool servers to connect to, in priority order (first registered wins on name clashes)
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
}

// ── Backend ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `remote`, `prompted` or `native`
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// Model identifier passed to the backend
    #[serde(default = "default_model")]
    pub model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Default max tokens per generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub local: LocalConfig,
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Remote
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

/// OpenAI-compatible endpoint settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Whether the remote model accepts image parts
    #[serde(default = "default_true")]
    pub vision: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_true() -> bool {
    true
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            vision: true,
            timeout_secs: default_request_timeout(),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("vision", &self.vision)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// What a local backend does when its model instance is already generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePolicy {
    /// Wait for the instance to become free.
    #[default]
    Queue,
    /// Fail immediately with a busy error.
    Reject,
}

/// Locally hosted model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Preset alias (e.g. `phi3`, `qwen:1.5b`) or path to a `.gguf` file
    #[serde(default = "default_local_model")]
    pub model: String,

    /// Explicit tokenizer.json; defaults to one next to the weights
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,

    #[serde(default)]
    pub lease: LeasePolicy,

    /// Marker pairs for prompt-engineered tool calling
    #[serde(default)]
    pub markers: SentinelMarkers,
}

fn default_local_model() -> String {
    "qwen:1.5b".into()
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            model: default_local_model(),
            tokenizer_path: None,
            lease: LeasePolicy::default(),
            markers: SentinelMarkers::default(),
        }
    }
}

// ── Tool servers ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

/// One MCP tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,

    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Executable for stdio servers (e.g. `uvx`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Endpoint for http servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_transport() -> TransportKind {
    TransportKind::Stdio
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Per-call timeout for `tools/call`
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Timeout for the initialize handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    30
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// ── Retrieval ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// `{base_url}/embeddings` on the remote endpoint
    OpenAi,
    /// Offline feature hashing
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_encoder")]
    pub encoder: EncoderKind,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// `cosine`, `dot` or `euclidean`
    #[serde(default = "default_similarity")]
    pub similarity: String,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// JSON file the store is loaded from and saved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

fn default_encoder() -> EncoderKind {
    EncoderKind::OpenAi
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimensions() -> usize {
    1536
}
fn default_similarity() -> String {
    "cosine".into()
}
fn default_top_k() -> usize {
    3
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            encoder: default_encoder(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            similarity: default_similarity(),
            top_k: default_top_k(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            store_path: None,
        }
    }
}

/// Accepted spellings of `retrieval.similarity`.
const SIMILARITIES: [&str; 6] = ["cosine", "dot", "dot_product", "dotproduct", "euclidean", "l2"];

impl AppConfig {
    /// Load configuration from the default path (~/.omnibridge/config.toml).
    ///
    /// Environment overrides:
    /// - `OPENAI_API_KEY` (when no key is configured)
    /// - `OPENAI_BASE_URL`
    /// - `OMNIBRIDGE_BACKEND` (`remote`, `prompted`, `native`)
    /// - `OMNIBRIDGE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if self.backend.remote.api_key.is_none() {
            self.backend.remote.api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
        }
        if let Some(url) = lookup("OPENAI_BASE_URL").filter(|u| !u.is_empty()) {
            self.backend.remote.base_url = url;
        }
        if let Some(kind) = lookup("OMNIBRIDGE_BACKEND") {
            self.backend.kind = match kind.to_ascii_lowercase().as_str() {
                "remote" => BackendKind::Remote,
                "prompted" => BackendKind::Prompted,
                "native" => BackendKind::Native,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "OMNIBRIDGE_BACKEND must be remote, prompted or native (got '{other}')"
                    )));
                }
            };
        }
        if let Some(model) = lookup("OMNIBRIDGE_MODEL").filter(|m| !m.is_empty()) {
            self.backend.model = model;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".omnibridge")
    }

    /// Default location of the persisted vector store.
    pub fn default_store_path() -> PathBuf {
        Self::config_dir().join("vectors.json")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.temperature < 0.0 || self.backend.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "backend.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_turns == 0 {
            return Err(ConfigError::ValidationError("agent.max_turns must be at least 1".into()));
        }

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError("retrieval.top_k must be at least 1".into()));
        }

        if self.retrieval.chunk_overlap >= self.retrieval.chunk_size {
            return Err(ConfigError::ValidationError(
                "retrieval.chunk_overlap must be smaller than retrieval.chunk_size".into(),
            ));
        }

        let similarity = self.retrieval.similarity.trim().to_lowercase();
        if !SIMILARITIES.contains(&similarity.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "retrieval.similarity must be cosine, dot or euclidean (got '{}')",
                self.retrieval.similarity
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        for server in &self.tool_servers {
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool server name '{}'",
                    server.name
                )));
            }
            match server.transport {
                TransportKind::Stdio if server.command.is_none() => {
                    return Err(ConfigError::ValidationError(format!(
                        "stdio tool server '{}' needs a command",
                        server.name
                    )));
                }
                TransportKind::Http if server.url.is_none() => {
                    return Err(ConfigError::ValidationError(format!(
                        "http tool server '{}' needs a url",
                        server.name
                    )));
                }
                _ => {}
            }
        }

        let m = &self.backend.local.markers;
        if [&m.schema_open, &m.schema_close, &m.call_open, &m.call_close]
            .iter()
            .any(|s| s.is_empty())
        {
            return Err(ConfigError::ValidationError("sentinel markers must not be empty".into()));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for omnibridge_core::Error {
    fn from(e: ConfigError) -> Self {
        omnibridge_core::Error::Config { message: e.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.backend.kind, BackendKind::Remote);
        assert_eq!(config.agent.max_turns, 10);
        assert_eq!(config.retrieval.top_k, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.backend.model, config.backend.model);
        assert_eq!(parsed.backend.local.markers, config.backend.local.markers);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.backend.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut config = AppConfig::default();
        config.retrieval.chunk_overlap = config.retrieval.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_similarity_rejected() {
        let mut config = AppConfig::default();
        config.retrieval.similarity = "Euclidean".into();
        assert!(config.validate().is_ok());
        config.retrieval.similarity = "manhattan".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.backend.model, "gpt-4o");
    }

    #[test]
    fn parses_tool_servers_and_markers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[backend]
kind = "prompted"

[backend.local]
model = "/models/phi.gguf"
lease = "reject"

[backend.local.markers]
call_open = "<call>"
call_close = "</call>"

[agent]
max_turns = 3

[[tool_servers]]
name = "fetch"
command = "uvx"
args = ["mcp-server-fetch"]

[[tool_servers]]
name = "remote"
transport = "http"
url = "http://localhost:8080/mcp"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Prompted);
        assert_eq!(config.backend.local.lease, LeasePolicy::Reject);
        assert_eq!(config.backend.local.markers.call_open, "<call>");
        assert_eq!(config.backend.local.markers.schema_open, "<|tool|>");
        assert_eq!(config.agent.max_turns, 3);
        assert_eq!(config.agent.session_timeout_secs, 120);
        assert_eq!(config.tool_servers.len(), 2);
        assert_eq!(config.tool_servers[1].transport, TransportKind::Http);
    }

    #[test]
    fn stdio_server_without_command_rejected() {
        let mut config = AppConfig::default();
        config.tool_servers.push(ToolServerConfig {
            name: "broken".into(),
            transport: TransportKind::Stdio,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_server_names_rejected() {
        let server = ToolServerConfig {
            name: "fs".into(),
            transport: TransportKind::Http,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: Some("http://x".into()),
        };
        let config = AppConfig {
            tool_servers: vec![server.clone(), server],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_env(|key| match key {
                "OPENAI_API_KEY" => Some("sk-test".into()),
                "OPENAI_BASE_URL" => Some("http://localhost:11434/v1".into()),
                "OMNIBRIDGE_BACKEND" => Some("native".into()),
                "OMNIBRIDGE_MODEL" => Some("qwen2.5".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.backend.remote.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.backend.remote.base_url, "http://localhost:11434/v1");
        assert_eq!(config.backend.kind, BackendKind::Native);
        assert_eq!(config.backend.model, "qwen2.5");
    }

    #[test]
    fn bad_backend_env_rejected() {
        let mut config = AppConfig::default();
        let result = config.apply_env(|key| (key == "OMNIBRIDGE_BACKEND").then(|| "quantum".into()));
        assert!(result.is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.backend.remote.api_key = Some("sk-secret".into());
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o"));
        assert!(toml_str.contains("text-embedding-3-small"));
    }
}
