use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_CODE_PATTERN: &str = r"^4/[0-9A-Za-z_\-]+$";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8088,
        }
    }
}

/// The small redirect server the OAuth provider sends the browser back to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackConfig {
    pub host: String,
    pub port: u16,
    /// Agent endpoint that receives `{session_id, auth_code}`.
    pub forward_url: String,
    #[serde(default = "default_forward_timeout_secs")]
    pub forward_timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            forward_url: "http://localhost:8088/oauth/callback".into(),
            forward_timeout_secs: default_forward_timeout_secs(),
        }
    }
}

fn default_forward_timeout_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Regex an inbound chat message must match to be treated as an authorization code.
    #[serde(default = "default_code_pattern")]
    pub code_pattern: String,
    #[serde(default = "default_extra_auth_params")]
    pub extra_auth_params: BTreeMap<String, String>,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.into()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.into()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/callback".into()
}

fn default_code_pattern() -> String {
    GOOGLE_CODE_PATTERN.into()
}

fn default_extra_auth_params() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("access_type".to_string(), "offline".to_string()),
        ("prompt".to_string(), "consent".to_string()),
    ])
}

impl ProviderConfig {
    fn google(name: &str, scopes: &[&str]) -> Self {
        Self {
            name: name.into(),
            client_id: None,
            client_secret: None,
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            redirect_uri: default_redirect_uri(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            code_pattern: default_code_pattern(),
            extra_auth_params: default_extra_auth_params(),
        }
    }

    pub fn google_gmail() -> Self {
        Self::google(
            "gmail",
            &[
                "https://www.googleapis.com/auth/gmail.send",
                "https://www.googleapis.com/auth/gmail.readonly",
                "https://www.googleapis.com/auth/gmail.modify",
            ],
        )
    }

    pub fn google_calendar() -> Self {
        Self::google(
            "calendar",
            &[
                "https://www.googleapis.com/auth/calendar",
                "https://www.googleapis.com/auth/calendar.events",
                "https://www.googleapis.com/auth/calendar.readonly",
                "https://www.googleapis.com/auth/calendar.settings.readonly",
            ],
        )
    }

    pub fn with_client(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self.client_secret = Some(secret.into());
        self
    }

    /// Returns `(client_id, client_secret)` or a configuration error naming what is missing.
    pub fn client_credentials(&self) -> Result<(&str, &str)> {
        let id = self
            .client_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AgentError::Configuration(format!("{} client_id is not configured", self.name))
            })?;
        let secret = self
            .client_secret
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AgentError::Configuration(format!("{} client_secret is not configured", self.name))
            })?;
        Ok((id, secret))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::google_gmail()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Inactivity window after which a conversation starts over.
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of user/assistant exchanges kept in history.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout_secs(),
            max_history: default_max_history(),
        }
    }
}

fn default_session_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_history() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolBackendKind {
    /// Call the Google REST APIs directly through the built-in tool registry.
    #[default]
    Registry,
    /// Forward tool calls to a remote MCP server.
    Mcp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
    #[serde(default)]
    pub backend: ToolBackendKind,
    #[serde(default)]
    pub mcp_url: Option<String>,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            backend: ToolBackendKind::default(),
            mcp_url: None,
            retry_delay_ms: default_retry_delay_ms(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// `keyword` resolves intents locally; `openai` asks an OpenAI-compatible chat API.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "keyword".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
    #[cfg(feature = "persistence")]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub file_path: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            file_path: default_storage_path(),
            database_url: None,
        }
    }
}

fn default_storage_path() -> String {
    "sessions.json".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn for_provider(provider: ProviderConfig) -> Self {
        Self {
            provider,
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| AgentError::Configuration(format!("failed to parse configuration: {err}")))
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Layers the TOML file at `path` (when it exists) and then the environment over `base`.
    pub fn load(path: impl AsRef<Path>, base: Self) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let overlay: toml::Value = toml::from_str(&raw).map_err(|err| {
                AgentError::Configuration(format!("failed to parse configuration: {err}"))
            })?;
            let mut merged = toml::Value::try_from(&base).map_err(|err| {
                AgentError::Configuration(format!("failed to encode defaults: {err}"))
            })?;
            merge_toml(&mut merged, overlay);
            merged.try_into().map_err(|err| {
                AgentError::Configuration(format!("invalid configuration: {err}"))
            })?
        } else {
            base
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = env::var("AGENT_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("AGENT_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(port) = env::var("AGENT_CALLBACK_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.callback.port = parsed;
            }
        }
        if let Ok(url) = env::var("AGENT_CALLBACK_FORWARD_URL") {
            self.callback.forward_url = url;
        }
        if let Ok(id) = env::var("AGENT_CLIENT_ID") {
            self.provider.client_id = Some(id);
        }
        if let Ok(secret) = env::var("AGENT_CLIENT_SECRET") {
            self.provider.client_secret = Some(secret);
        }
        if let Ok(redirect) = env::var("AGENT_REDIRECT_URI") {
            self.provider.redirect_uri = redirect;
        }
        if let Ok(timeout) = env::var("AGENT_SESSION_TIMEOUT_SECS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.session.timeout_secs = parsed;
            }
        }
        if let Ok(history) = env::var("AGENT_MAX_HISTORY") {
            if let Ok(parsed) = history.parse::<usize>() {
                self.session.max_history = parsed;
            }
        }
        if let Ok(url) = env::var("AGENT_MCP_URL") {
            self.tools.backend = ToolBackendKind::Mcp;
            self.tools.mcp_url = Some(url);
        }
        if let Ok(provider) = env::var("AGENT_MODEL_PROVIDER") {
            self.model.provider = provider;
        }
        if let Ok(model) = env::var("AGENT_MODEL") {
            self.model.model = model;
        }
        if let Ok(key) = env::var("AGENT_OPENAI_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Ok(format) = env::var("AGENT_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            };
        }
        if let Ok(backend) = env::var("AGENT_STORAGE_BACKEND") {
            self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                #[cfg(feature = "persistence")]
                "sqlite" => StorageBackend::Sqlite,
                _ => StorageBackend::File,
            };
        }
        if let Ok(path) = env::var("AGENT_STORAGE_PATH") {
            self.storage.file_path = path;
        }
        if let Ok(url) = env::var("AGENT_DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
