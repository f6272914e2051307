use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of Actix Web workers for the HTTP gateway
pub const DEFAULT_WORKERS: usize = 4;

/// Serialize a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs_f64()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(d)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Environment variable value as it may appear in a configuration document.
///
/// Both shapes are accepted on input:
///
/// ```json
/// { "PLAIN": "value", "RICH": { "value": "x", "required": true, "description": "..." } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// A bare string value
    Simple(String),
    /// A value with metadata
    Structured {
        /// The value, if one is configured
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        /// Whether the server needs this variable to work
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        required: bool,
        /// Human-readable description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// Normalized environment variable.
///
/// Every [`EnvValue`] shape is converted into this struct once, when the
/// configuration is deserialized, so the rest of the crate handles one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EnvValue", into = "EnvValue")]
pub struct EnvVar {
    /// Configured value
    pub value: Option<String>,
    /// Whether the variable is required
    pub required: bool,
    /// Optional description
    pub description: Option<String>,
}

impl EnvVar {
    /// A plain, optional variable with a value
    pub fn simple(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            required: false,
            description: None,
        }
    }
}

impl From<EnvValue> for EnvVar {
    fn from(raw: EnvValue) -> Self {
        match raw {
            EnvValue::Simple(value) => Self::simple(value),
            EnvValue::Structured {
                value,
                required,
                description,
            } => Self {
                value,
                required,
                description,
            },
        }
    }
}

impl From<EnvVar> for EnvValue {
    fn from(var: EnvVar) -> Self {
        match var {
            EnvVar {
                value: Some(value),
                required: false,
                description: None,
            } => EnvValue::Simple(value),
            EnvVar {
                value,
                required,
                description,
            } => EnvValue::Structured {
                value,
                required,
                description,
            },
        }
    }
}

fn default_max_restarts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_restart_window() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

/// Restart policy for a supervised server.
///
/// The fields are flattened into the server entry of the configuration
/// document. Durations are expressed in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Lifetime cap on automatic restarts
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Delay before the first restart
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,
    /// Growth factor applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,
    /// Trailing horizon for the windowed restart cap
    #[serde(default = "default_restart_window", with = "duration_secs")]
    pub restart_window: Duration,
    /// Restarts allowed inside `restart_window`; `max_restarts` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_max_restarts: Option<u32>,
    /// Whether automatic restarts are allowed at all
    #[serde(default = "default_true")]
    pub auto_restart: bool,
}

impl RestartPolicy {
    /// Threshold used by the sliding-window check
    pub fn window_limit(&self) -> u32 {
        self.window_max_restarts.unwrap_or(self.max_restarts)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
            restart_window: default_restart_window(),
            window_max_restarts: None,
            auto_restart: true,
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Protocol-level liveness probe for a server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// Only OS-level liveness is checked
    #[default]
    None,
    /// A bounded `tools/list` round trip over stdio
    ToolsList,
    /// An HTTP GET against `http://{host}:{port}{path}`
    Http {
        /// Request path
        #[serde(default = "default_health_path")]
        path: String,
    },
}

/// Configuration for a single MCP server instance.
///
/// # Examples
///
/// ```
/// use mcp_gateway::config::{EnvVar, ServerConfig};
///
/// let mut config = ServerConfig::new("fetch", "uvx", vec!["mcp-server-fetch".to_string()]);
/// config.env.insert("LOG_LEVEL".to_string(), EnvVar::simple("debug"));
/// assert_eq!(config.display_name(), "fetch");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique, URL-safe identifier. Taken from the document key.
    #[serde(default, skip_serializing)]
    pub id: String,

    /// Display name, defaults to the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Command to execute when starting the server.
    pub command: String,

    /// Command-line arguments to pass to the server.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set when launching the server.
    #[serde(default)]
    pub env: BTreeMap<String, EnvVar>,

    /// Explicit working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Directory the server package was installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,

    /// Restart policy fields
    #[serde(flatten)]
    pub restart_policy: RestartPolicy,

    /// Disabled servers are skipped by `start_all`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Protocol-level health probe
    #[serde(default)]
    pub health_check: HealthCheck,

    /// Host the server listens on, for HTTP probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port the server listens on, for HTTP probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ServerConfig {
    /// Create a configuration with default policy and no environment
    pub fn new(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            command: command.into(),
            args,
            env: BTreeMap::new(),
            working_dir: None,
            install_path: None,
            restart_policy: RestartPolicy::default(),
            enabled: true,
            health_check: HealthCheck::None,
            host: None,
            port: None,
        }
    }

    /// Name used in logs and listings
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Gateway-wide settings: the `gateway` section of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Address to bind the HTTP gateway to
    pub address: String,
    /// Port to bind the HTTP gateway to
    pub port: u16,
    /// Number of Actix Web workers
    pub workers: usize,
    /// Time allowed for the `initialize` exchange
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,
    /// Client-side timeout on proxied requests; none waits indefinitely
    #[serde(with = "duration_secs::option")]
    pub request_timeout: Option<Duration>,
    /// Health monitor interval
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Timeout of a single protocol-level probe
    #[serde(with = "duration_secs")]
    pub health_check_timeout: Duration,
    /// Restart history older than this is pruned
    #[serde(with = "duration_secs")]
    pub history_retention: Duration,
    /// Allow one restart-and-retry when a proxied call loses its transport
    pub retry_on_transport_error: bool,
    /// Where instance state is persisted; next to the config file when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

impl GatewaySettings {
    /// Socket address string for the HTTP listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Parsed socket address for the HTTP listener
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_address()
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("Invalid gateway address: {}", e)))
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8765,
            workers: DEFAULT_WORKERS,
            handshake_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            request_timeout: None,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            history_retention: Duration::from_secs(3600),
            retry_on_transport_error: true,
            state_file: None,
        }
    }
}

/// Main configuration document.
///
/// # JSON Schema
///
/// ```json
/// {
///   "gateway": { "port": 8765 },
///   "mcpServers": {
///     "fetch": {
///       "command": "uvx",
///       "args": ["mcp-server-fetch"],
///       "env": { "PROXY": "http://proxy:3128" },
///       "max_restarts": 3,
///       "restart_window": 60
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Gateway settings
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Map of server ids to their configurations.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else
    /// as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        if is_yaml_path(path) {
            Self::parse_yaml_str(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))?;
        Ok(config.normalized())
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))?;
        Ok(config.normalized())
    }

    /// Serialize the document in the format implied by `path`.
    pub fn to_string_for(&self, path: &Path) -> Result<String> {
        if is_yaml_path(path) {
            serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
        } else {
            Ok(serde_json::to_string_pretty(self)?)
        }
    }

    /// All server configurations, ordered by id
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.mcp_servers.values().cloned().collect()
    }

    fn normalized(mut self) -> Self {
        for (id, server) in self.mcp_servers.iter_mut() {
            server.id = id.clone();
        }
        self
    }
}

pub(crate) fn is_yaml_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_claude_config() {
        let config_str = r#"{
            "mcpServers": {
                "filesystem": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/path/to/allowed/files"]
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();

        assert_eq!(config.mcp_servers.len(), 1);
        let fs_config = &config.mcp_servers["filesystem"];
        assert_eq!(fs_config.id, "filesystem");
        assert_eq!(fs_config.command, "npx");
        assert_eq!(fs_config.restart_policy, RestartPolicy::default());
        assert!(fs_config.enabled);
        assert_eq!(config.gateway, GatewaySettings::default());
    }

    #[test]
    fn test_env_shapes_normalize() {
        let config_str = r#"{
            "mcpServers": {
                "github": {
                    "command": "npx",
                    "env": {
                        "PLAIN": "abc",
                        "TOKEN": { "value": "t", "required": true, "description": "API token" },
                        "OPTIONAL": { "description": "unused" }
                    }
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();
        let env = &config.mcp_servers["github"].env;

        assert_eq!(env["PLAIN"], EnvVar::simple("abc"));
        assert_eq!(env["TOKEN"].value.as_deref(), Some("t"));
        assert!(env["TOKEN"].required);
        assert_eq!(env["OPTIONAL"].value, None);

        let out = serde_json::to_value(env).unwrap();
        assert_eq!(out["PLAIN"], serde_json::json!("abc"));
        assert_eq!(out["TOKEN"]["required"], serde_json::json!(true));
    }

    #[test]
    fn test_flattened_restart_policy() {
        let config_str = r#"{
            "gateway": { "port": 9000, "request_timeout": 2.5 },
            "mcpServers": {
                "fetch": {
                    "command": "uvx",
                    "max_restarts": 3,
                    "restart_window": 60,
                    "initial_delay": 0.5,
                    "auto_restart": false,
                    "health_check": { "type": "http" },
                    "port": 3001
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();
        let fetch = &config.mcp_servers["fetch"];

        assert_eq!(fetch.restart_policy.max_restarts, 3);
        assert_eq!(fetch.restart_policy.window_limit(), 3);
        assert_eq!(fetch.restart_policy.restart_window, Duration::from_secs(60));
        assert_eq!(fetch.restart_policy.initial_delay, Duration::from_millis(500));
        assert!(!fetch.restart_policy.auto_restart);
        assert_eq!(
            fetch.health_check,
            HealthCheck::Http {
                path: "/health".to_string()
            }
        );
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.request_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.gateway.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
mcpServers:
  echo:
    command: cat
    args: ["-u"]
    window_max_restarts: 2
"#;
        let config = Config::parse_yaml_str(yaml).unwrap();
        let echo = &config.mcp_servers["echo"];
        assert_eq!(echo.args, vec!["-u"]);
        assert_eq!(echo.restart_policy.window_limit(), 2);
        assert_eq!(echo.restart_policy.max_restarts, 5);
    }
}
