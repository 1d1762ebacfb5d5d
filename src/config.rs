use std::{str::FromStr, time::Duration};

use anyhow::Context;

/// Longest persona reply anyone should wait for.
pub const MAX_GENERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// `None` keeps everything in memory.
    pub database_url: Option<String>,

    pub history_limit: usize,
    pub context_window: usize,
    pub generation_timeout: Duration,

    pub generation: GenerationConfig,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Base url of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_reply_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: None,
            history_limit: 50,
            context_window: 10,
            generation_timeout: Duration::from_secs(15),
            generation: GenerationConfig {
                url: "https://api.openai.com/v1".to_owned(),
                api_key: None,
                model: "gpt-4o-mini".to_owned(),
                max_reply_tokens: 400,
            },
        }
    }
}

impl Config {
    /// Reads the environment, with `.env` applied on top if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();

        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match lookup(key) {
                Some(raw) => raw.trim().parse().with_context(|| format!("{key}={raw:?} is not valid")),
                None => Ok(default),
            }
        }

        let generation_timeout = Duration::from_secs(
            parsed(&lookup, "GENERATION_TIMEOUT_SECS", defaults.generation_timeout.as_secs())?
        );
        anyhow::ensure!(
            !generation_timeout.is_zero() && generation_timeout <= MAX_GENERATION_TIMEOUT,
            "GENERATION_TIMEOUT_SECS must be between 1 and {}",
            MAX_GENERATION_TIMEOUT.as_secs(),
        );

        Ok(Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            history_limit: parsed(&lookup, "HISTORY_LIMIT", defaults.history_limit)?,
            context_window: parsed(&lookup, "CONTEXT_WINDOW", defaults.context_window)?,
            generation_timeout,
            generation: GenerationConfig {
                url: lookup("GENERATION_URL").unwrap_or(defaults.generation.url),
                api_key: lookup("GENERATION_API_KEY"),
                model: lookup("GENERATION_MODEL").unwrap_or(defaults.generation.model),
                max_reply_tokens: parsed(&lookup, "MAX_REPLY_TOKENS", defaults.generation.max_reply_tokens)?,
            },
        })
    }
}
