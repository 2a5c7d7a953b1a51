use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// OpenAI-compatible chat completion backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    /// The variable holding this provider's API key.
    pub fn key_var(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OPENAI_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1/",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAI),
            "gemini" => Ok(Provider::Gemini),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub provider: Provider,
    /// Key for `provider`, read from [`Provider::key_var`].
    pub api_key: String,
    pub chat_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub llm_max_concurrency: usize,
    pub llm_timeout: Duration,
    /// Minimum confidence for an achieved goal to move the run on.
    pub goal_min_confidence: f64,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("'{}' could not be parsed", raw))
        }),
        Err(_) => Ok(default),
    }
}

fn require_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var("BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 3000)))?;
        let database_url = require_var("DATABASE_URL")?;
        let provider = parse_var("LLM_PROVIDER", Provider::OpenAI)?;
        let api_key = require_var(provider.key_var())?;
        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let log_level = parse_var("RUST_LOG", Level::INFO)?;
        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let llm_max_concurrency = parse_var("LLM_MAX_CONCURRENCY", 4usize)?;
        if llm_max_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "LLM_MAX_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let llm_timeout = Duration::from_secs(parse_var("LLM_TIMEOUT_SECS", 30u64)?);

        let goal_min_confidence = parse_var("GOAL_MIN_CONFIDENCE", 0.0f64)?;
        if !(0.0..=1.0).contains(&goal_min_confidence) {
            return Err(ConfigError::InvalidValue(
                "GOAL_MIN_CONFIDENCE".to_string(),
                format!("{} is outside 0.0..=1.0", goal_min_confidence),
            ));
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            api_key,
            chat_model,
            log_level,
            prompts_path,
            llm_max_concurrency,
            llm_timeout,
            goal_min_confidence,
        })
    }
}
