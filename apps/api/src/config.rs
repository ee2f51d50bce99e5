use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::transform::orchestrator::TransformConfig;

/// Which text-generation backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Anthropic,
    Gemini,
    Dummy,
}

impl ClientKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ClientKind::Anthropic),
            "gemini" => Ok(ClientKind::Gemini),
            "dummy" => Ok(ClientKind::Dummy),
            other => bail!("LM_CLIENT must be 'anthropic', 'gemini' or 'dummy', got '{other}'"),
        }
    }

    /// Model used when `LM_MODEL` is not set.
    fn default_model(self) -> &'static str {
        match self {
            ClientKind::Anthropic => "claude-sonnet-4-5",
            ClientKind::Gemini => "gemini-flash-latest",
            ClientKind::Dummy => "dummy",
        }
    }

    /// Environment variable holding the backend's API key, if it needs one.
    fn api_key_var(self) -> Option<&'static str> {
        match self {
            ClientKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ClientKind::Gemini => Some("GEMINI_API_KEY"),
            ClientKind::Dummy => None,
        }
    }
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub lm_client: ClientKind,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub lm_model: String,
    pub lm_timeout_secs: u64,
    pub max_prompt_size: usize,
    pub max_records_per_batch: usize,
    pub max_examples: usize,
    /// Zero disables the reply cache.
    pub response_cache_ttl_secs: u64,
    pub log_exchanges: bool,
    /// How long finished runs stay queryable.
    pub run_retention_secs: u64,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let lm_client = ClientKind::parse(&optional_env("LM_CLIENT", "dummy"))?;
        if let Some(key) = lm_client.api_key_var() {
            require_env(key).with_context(|| format!("LM_CLIENT={lm_client:?} needs an API key"))?;
        }

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            lm_client,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            lm_model: optional_env("LM_MODEL", lm_client.default_model()),
            lm_timeout_secs: parse_env("LM_TIMEOUT_SECS", 120)?,
            max_prompt_size: parse_env("MAX_PROMPT_SIZE", 100_000)?,
            max_records_per_batch: parse_env("MAX_RECORDS_PER_BATCH", 50)?,
            max_examples: parse_env("MAX_EXAMPLES", 3)?,
            response_cache_ttl_secs: parse_env("RESPONSE_CACHE_TTL_SECS", 0)?,
            log_exchanges: parse_flag(&optional_env("LOG_EXCHANGES", "false")),
            run_retention_secs: parse_env("RUN_RETENTION_SECS", 3600)?,
            port: parse_env("PORT", 8080)?,
            rust_log: optional_env("RUST_LOG", "info"),
        })
    }

    /// The subset of settings the transformation core runs with.
    pub fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            max_examples: self.max_examples,
            max_prompt_size: self.max_prompt_size,
            max_records_per_batch: self.max_records_per_batch,
            client_timeout: Duration::from_secs(self.lm_timeout_secs),
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "y" | "1"
    )
}
