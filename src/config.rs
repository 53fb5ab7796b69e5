use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use crate::data::http::RetryPolicy;
use crate::data::news::SortOrder;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub market_data: MarketDataConfig,
    pub news: NewsConfig,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub evidence_store: EvidenceStoreConfig,
    pub estimator: EstimatorConfig,
    pub mispricing: MispricingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    pub page_size: u32,
    /// Stop listing after this many events; unset follows every cursor
    pub max_events: Option<usize>,
    pub series_ticker: Option<String>,
    pub timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_events: None,
            series_ticker: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NewsConfig {
    pub page_size: u32,
    pub excerpt_chars: usize,
    pub language: String,
    pub lookback_days: i64,
    pub sort: SortOrder,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            excerpt_chars: 600,
            language: "en".to_string(),
            lookback_days: 30,
            sort: SortOrder::Relevance,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_secs: u64,
    /// Concurrent article scorings per market
    pub max_concurrent: usize,
    /// Markets of one event analyzed at the same time
    pub max_concurrent_markets: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 512,
            temperature: 0.0,
            timeout_secs: 60,
            max_concurrent: 5,
            max_concurrent_markets: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 8_000 }
fn default_max_attempts() -> u32 { 5 }
fn default_jitter() -> f64 { 0.1 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts.max(1),
            jitter: self.jitter.max(0.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvidenceStoreConfig {
    pub evidence_capacity: usize,
    pub evidence_ttl_secs: u64,
    pub estimate_capacity: usize,
    pub estimate_ttl_secs: u64,
}

impl Default for EvidenceStoreConfig {
    fn default() -> Self {
        Self {
            evidence_capacity: 10_000,
            evidence_ttl_secs: 6 * 3600,
            estimate_capacity: 2_000,
            estimate_ttl_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Evidence records shown to the LLM
    pub top_k: usize,
    pub low_confidence_ceiling: f64,
    pub no_evidence_confidence: f64,
    /// Fraction of the remaining distance the evidence signal may move the prior
    pub evidence_weight: f64,
    /// Share of the LLM estimate in the final probability
    pub llm_weight: f64,
    /// Total relevance at which volume confidence reaches ~63%
    pub volume_scale: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            low_confidence_ceiling: 0.3,
            no_evidence_confidence: 0.3,
            evidence_weight: 0.5,
            llm_weight: 0.5,
            volume_scale: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MispricingConfig {
    pub min_delta: f64,
    pub min_confidence: f64,
    pub event_tolerance: f64,
}

impl Default for MispricingConfig {
    fn default() -> Self {
        Self {
            min_delta: 0.10,
            min_confidence: 0.7,
            event_tolerance: 0.03,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; RUST_LOG overrides it
    pub level: String,
    pub json: bool,
    /// CSV audit trail of raised flags
    pub flags_csv: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            flags_csv: None,
        }
    }
}

/// Secrets and endpoints from the environment (and `.env`)
#[derive(Clone)]
pub struct EnvConfig {
    pub kalshi_api_key: String,
    pub kalshi_private_key_path: String,
    pub anthropic_api_key: String,
    pub news_api_key: String,
    pub kalshi_base_url: String,
    pub news_base_url: String,
    pub anthropic_url: String,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("kalshi_api_key", &self.kalshi_api_key)
            .field("kalshi_private_key_path", &self.kalshi_private_key_path)
            .field("anthropic_api_key", &"<redacted>")
            .field("news_api_key", &"<redacted>")
            .field("kalshi_base_url", &self.kalshi_base_url)
            .field("news_base_url", &self.news_base_url)
            .field("anthropic_url", &self.anthropic_url)
            .finish()
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise run on defaults
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            tracing::warn!("Config file {} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{} not set", key))
        };

        Ok(Self {
            kalshi_api_key: required("KALSHI_API_KEY")?,
            kalshi_private_key_path: required("KALSHI_PRIVATE_KEY_PATH")?,
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            news_api_key: required("NEWS_API_KEY")?,
            kalshi_base_url: lookup("KALSHI_BASE_URL")
                .unwrap_or_else(|| "https://api.elections.kalshi.com".to_string()),
            news_base_url: lookup("NEWS_API_BASE_URL")
                .unwrap_or_else(|| "https://newsapi.org".to_string()),
            anthropic_url: lookup("ANTHROPIC_API_URL")
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string()),
        })
    }
}
