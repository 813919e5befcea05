// Configuration File Support
//
// TOML configuration naming the MCP servers the CLI can talk to, plus logging.
// Environment variables override logging settings.
// Default location: ~/.config/mcp-conduit/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::{HttpConfig, HttpTransport, StdioConfig, StdioTransport, Transport};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Named MCP servers
    pub servers: HashMap<String, ServerConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// How a configured server is reached
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

/// MCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport type (stdio, http)
    pub transport: TransportKind,

    /// Command to spawn the MCP server (stdio)
    pub command: String,

    /// Arguments for the MCP server (stdio)
    pub args: Vec<String>,

    /// Working directory for the child (stdio)
    pub cwd: Option<PathBuf>,

    /// Complete environment for the child; inherited when absent (stdio)
    pub env: Option<BTreeMap<String, String>>,

    /// Endpoint URL (http)
    pub url: Option<String>,

    /// Extra request headers (http)
    pub headers: BTreeMap<String, String>,

    /// Timeout in seconds for MCP requests
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: None,
            url: None,
            headers: BTreeMap::new(),
            timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Transport settings for a stdio server
    pub fn stdio_config(&self) -> StdioConfig {
        let mut config = StdioConfig::new(self.command.clone())
            .with_args(self.args.clone())
            .with_timeout(self.timeout());
        if let Some(cwd) = &self.cwd {
            config = config.with_working_dir(cwd.clone());
        }
        if let Some(env) = &self.env {
            config = config.with_env(env.clone());
        }
        config
    }

    /// Transport settings for an HTTP server
    ///
    /// # Errors
    ///
    /// Returns an error if no URL is configured.
    pub fn http_config(&self) -> Result<HttpConfig> {
        let url = self
            .url
            .as_deref()
            .context("HTTP transport requires a url")?;
        Ok(HttpConfig::new(url)
            .with_timeout(self.timeout())
            .with_headers(self.headers.clone()))
    }

    /// Build the transport this entry describes.
    ///
    /// Stdio servers are spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is incomplete, the process cannot be
    /// spawned or the HTTP settings are invalid.
    pub fn connect(&self) -> Result<Box<dyn Transport>> {
        match self.transport {
            TransportKind::Stdio => {
                let config = self.stdio_config();
                let transport = StdioTransport::with_config(config)
                    .with_context(|| format!("Failed to start MCP server '{}'", self.command))?;
                Ok(Box::new(transport))
            }
            TransportKind::Http => {
                let config = self.http_config()?;
                let transport = HttpTransport::with_config(config)
                    .context("Failed to create HTTP transport")?;
                Ok(Box::new(transport))
            }
        }
    }
}

impl Config {
    /// Load configuration from the default config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns default
    /// configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/mcp-conduit/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "mcp-conduit", "mcp-conduit") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("mcp-conduit")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides:
    /// - MCP_CONDUIT_LOG_LEVEL
    /// - MCP_CONDUIT_LOG_FORMAT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("MCP_CONDUIT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MCP_CONDUIT_LOG_FORMAT") {
            self.logging.format = format;
        }
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        for (name, server) in &self.servers {
            match server.transport {
                TransportKind::Stdio if server.command.trim().is_empty() => {
                    anyhow::bail!("MCP server '{}' has empty command", name)
                }
                TransportKind::Http if server.url.is_none() => {
                    anyhow::bail!("MCP server '{}' uses HTTP transport but has no URL configured", name)
                }
                _ => {}
            }
            if server.timeout_secs == 0 {
                anyhow::bail!("MCP server '{}' must have timeout_secs > 0", name);
            }
        }

        Ok(())
    }

    /// Look up a configured server by name
    ///
    /// # Errors
    ///
    /// Returns an error naming the known servers if `name` is not configured.
    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers.get(name).with_context(|| {
            let mut known: Vec<&str> = self.servers.keys().map(String::as_str).collect();
            known.sort_unstable();
            format!("Unknown MCP server '{}' (configured: {})", name, known.join(", "))
        })
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
