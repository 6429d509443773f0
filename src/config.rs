use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default)]
    pub min_idle: Option<u32>,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub read_only: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// One language-model backend. Loaded once at startup and never mutated.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    pub key: String,
    pub display_name: String,
    /// Base URL of an OpenAI-compatible API, e.g. `http://localhost:8000/v1`.
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub default_backend: String,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_report_timeout_secs")]
    pub report_timeout_secs: u64,
    #[serde(default = "default_report_max_tokens")]
    pub report_max_tokens: u32,
    /// Tables described to the model. Empty means every table in the database.
    #[serde(default)]
    pub target_tables: Vec<String>,
    /// Additional numbered rules appended to the generation prompt.
    #[serde(default)]
    pub extra_rules: Vec<String>,
}

impl GatewayConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub backends: Vec<BackendConfig>,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// DuckDB database file to query
    #[arg(long)]
    pub database: Option<String>,
}

fn default_pool_size() -> u32 {
    5
}

fn default_max_lifetime_secs() -> u64 {
    3600
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_rows() -> usize {
    1000
}

fn default_execution_timeout_secs() -> u64 {
    30
}

fn default_concurrency_limit() -> usize {
    3
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_report_timeout_secs() -> u64 {
    30
}

fn default_report_max_tokens() -> u32 {
    1024
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/sqlgate/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // SQLGATE__WEB__PORT=8080 and friends
        config_builder = config_builder.add_source(
            Environment::with_prefix("SQLGATE")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Message(
                "at least one [[backends]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.key.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate backend key: {}",
                    backend.key
                )));
            }
        }

        let any_enabled = self.backends.iter().any(|b| b.enabled);
        let default_enabled = self
            .backends
            .iter()
            .any(|b| b.enabled && b.key == self.gateway.default_backend);
        if any_enabled && !default_enabled {
            return Err(ConfigError::Message(format!(
                "default_backend '{}' must name an enabled backend",
                self.gateway.default_backend
            )));
        }

        if self.gateway.concurrency_limit == 0 {
            return Err(ConfigError::Message(
                "gateway.concurrency_limit must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "sqlgate.duckdb".to_string(),
                pool_size: default_pool_size(),
                min_idle: None,
                max_lifetime_secs: default_max_lifetime_secs(),
                connection_timeout_secs: default_connection_timeout_secs(),
                read_only: true,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            gateway: GatewayConfig {
                default_backend: "local".to_string(),
                max_rows: default_max_rows(),
                execution_timeout_secs: default_execution_timeout_secs(),
                concurrency_limit: default_concurrency_limit(),
                probe_timeout_ms: default_probe_timeout_ms(),
                generation_timeout_secs: default_generation_timeout_secs(),
                report_timeout_secs: default_report_timeout_secs(),
                report_max_tokens: default_report_max_tokens(),
                target_tables: Vec::new(),
                extra_rules: Vec::new(),
            },
            logging: LoggingConfig::default(),
            backends: vec![BackendConfig {
                key: "local".to_string(),
                display_name: "Local vLLM".to_string(),
                endpoint: "http://localhost:8000/v1".to_string(),
                model: "sqlcoder".to_string(),
                max_tokens: default_max_tokens(),
                enabled: true,
                api_key: None,
                description: None,
            }],
        }
    }
}
