use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub case_api: CaseApi,
    pub store: Store,
    #[serde(default)]
    pub redelivery: Redelivery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseApi {
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url_env: Option<String>,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_statement_mode")]
    pub statement_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redelivery {
    /// Upstream statuses at or above this value ask for redelivery.
    #[serde(default = "default_upstream_min_status")]
    pub upstream_min_status: u16,
    #[serde(default)]
    pub forward_failures: bool,
}

impl Default for Redelivery {
    fn default() -> Self {
        Self {
            upstream_min_status: default_upstream_min_status(),
            forward_failures: false,
        }
    }
}

/// Credentials read once at startup. Never serialized.
#[derive(Clone, Default)]
pub struct Secrets {
    pub api_token: Option<String>,
    pub database_url: Option<String>,
}

impl Secrets {
    pub fn from_env(cfg: &Config) -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_token: read(&cfg.case_api.token_env),
            database_url: cfg.store.url_env.as_deref().and_then(read),
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn default_token_env() -> String {
    "API_ACCESS_TOKEN".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_connections() -> u32 {
    5
}

fn default_statement_mode() -> String {
    "bound".to_string()
}

fn default_upstream_min_status() -> u16 {
    500
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    let base_url = cfg.case_api.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "case_api.base_url={base_url} must be an http(s) URL"
        )));
    }
    if cfg.case_api.token_env.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "case_api.token_env must name an environment variable".to_string(),
        ));
    }
    match cfg.store.kind.as_str() {
        "mysql" => {
            if cfg
                .store
                .url_env
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "store.url_env is required when store.type=mysql".to_string(),
                ));
            }
        }
        "sqlite" => {
            if cfg
                .store
                .sqlite_path
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path is required when store.type=sqlite".to_string(),
                ));
            }
        }
        "memory" => {
            if cfg.store.sqlite_path.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path is not supported when store.type=memory".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "store.type={other} is not implemented; supported: mysql, sqlite, memory"
            )));
        }
    }
    if cfg.store.max_connections == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "store.max_connections must be >= 1".to_string(),
        ));
    }
    if cfg.store.statement_mode != "bound" && cfg.store.statement_mode != "text" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.statement_mode={} is not implemented; supported: bound, text",
            cfg.store.statement_mode
        )));
    }
    if !(100..=599).contains(&cfg.redelivery.upstream_min_status) {
        return Err(ConfigError::UnsupportedConfig(
            "redelivery.upstream_min_status must be an HTTP status (100..=599)".to_string(),
        ));
    }
    Ok(())
}
