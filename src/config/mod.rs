//! Configuration module for the MCP gateway.
//!
//! This module handles parsing, validation, and persistence of the gateway
//! settings and the per-server configuration. Documents can be JSON or YAML.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use mcp_gateway::config::Config;
//!
//! let config = Config::from_file("gateway.json").unwrap();
//! println!("Loaded configuration with {} servers", config.mcp_servers.len());
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use mcp_gateway::config::{Config, ServerConfig, validate_config};
//!
//! let mut config = Config::default();
//! let server = ServerConfig::new("fetch", "uvx", vec!["mcp-server-fetch".to_string()]);
//! config.mcp_servers.insert(server.id.clone(), server);
//! validate_config(&config).unwrap();
//! ```
mod parser;
pub mod store;
pub mod validator;

pub(crate) use parser::is_yaml_path;
pub use parser::{
    Config, DEFAULT_WORKERS, EnvValue, EnvVar, GatewaySettings, HealthCheck, RestartPolicy,
    ServerConfig,
};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore};
pub use validator::{is_url_safe_id, validate_config, validate_server_config};
