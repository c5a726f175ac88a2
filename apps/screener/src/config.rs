use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::llm_client::DEFAULT_MODEL;
use crate::pipeline::settings::{EngineSettings, LowQualityPolicy};
use crate::pipeline::timeout_policy::ModelClass;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or values are malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    pub llm_model: String,
    /// Declared timeout class; detected from the model id when unset.
    pub model_class: Option<ModelClass>,
    pub job_description: Option<String>,
    pub state_path: PathBuf,
    pub tick_interval: Duration,
    pub min_quality_score: f32,
    pub low_quality_policy: LowQualityPolicy,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            fast_timeout_secs: env_or("FAST_TIMEOUT_SECS", defaults.fast_timeout_secs)?,
            slow_timeout_secs: env_or("SLOW_TIMEOUT_SECS", defaults.slow_timeout_secs)?,
            max_timeout_secs: env_or("MAX_TIMEOUT_SECS", defaults.max_timeout_secs)?,
            max_retries: env_or("MAX_RETRIES", defaults.max_retries)?,
            concurrency_limit: env_or("CONCURRENCY_LIMIT", defaults.concurrency_limit)?,
            batch_size: env_or("BATCH_SIZE", defaults.batch_size)?,
        };
        engine
            .validate()
            .map_err(|e| anyhow!("invalid engine settings: {e}"))?;

        let model_class = match optional_env("LLM_MODEL_CLASS") {
            Some(v) => Some(ModelClass::parse(&v).with_context(|| {
                format!("LLM_MODEL_CLASS must be 'fast' or 'slow', got '{v}'")
            })?),
            None => None,
        };
        let low_quality_policy = match optional_env("LOW_QUALITY_POLICY") {
            Some(v) => LowQualityPolicy::parse(&v).with_context(|| {
                format!("LOW_QUALITY_POLICY must be 'retry' or 'accept', got '{v}'")
            })?,
            None => LowQualityPolicy::default(),
        };

        Ok(Config {
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: env_or("PORT", 8080u16)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            llm_model: optional_env("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            model_class,
            job_description: optional_env("JOB_DESCRIPTION"),
            state_path: optional_env("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/retry_state.json")),
            tick_interval: Duration::from_millis(env_or("TICK_INTERVAL_MS", 1000u64)?),
            min_quality_score: env_or("MIN_QUALITY_SCORE", 4.0f32)?,
            low_quality_policy,
            engine,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} has an invalid value '{raw}'"))
}
