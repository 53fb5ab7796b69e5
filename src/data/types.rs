use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use crate::data::cache::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Open,
    Closed,
    Settled,
}

impl MarketStatus {
    /// Map the provider's status vocabulary onto the three lifecycle states.
    /// Markets not yet trading (`initialized`, `unopened`) count as closed.
    pub fn from_provider(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "open" | "active" => MarketStatus::Open,
            "settled" | "determined" | "finalized" => MarketStatus::Settled,
            _ => MarketStatus::Closed,
        }
    }

    /// Value for the provider's `status` query filter
    pub fn as_query(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
        }
    }
}

/// Immutable market snapshot. Prices are in probability units (provider cents / 100).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub event_ticker: String,
    pub question: String,
    pub subtitle: Option<String>,
    pub rules: Option<String>,
    pub yes_bid: f64,
    pub yes_ask: f64,
    pub no_bid: f64,
    pub no_ask: f64,
    pub last_price: f64,
    pub volume: f64,
    pub close_time: Option<DateTime<Utc>>,
    pub status: MarketStatus,
    pub fetched_at: DateTime<Utc>,
}

impl Market {
    /// Implied probability of YES: mid of a two-sided yes quote, else last trade
    pub fn implied_probability(&self) -> f64 {
        let two_sided = self.yes_ask > 0.0 && self.yes_bid > 0.0 && self.yes_bid <= self.yes_ask;
        let p = if two_sided {
            (self.yes_bid + self.yes_ask) / 2.0
        } else {
            self.last_price
        };
        p.clamp(0.0, 1.0)
    }

    pub fn implied_no_probability(&self) -> f64 {
        1.0 - self.implied_probability()
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }

    /// Question text including the outcome subtitle, e.g. "Who will win?: Candidate A"
    pub fn full_question(&self) -> String {
        match self.subtitle.as_deref().filter(|s| !s.is_empty()) {
            Some(subtitle) => format!("{}: {}", self.question, subtitle),
            None => self.question.clone(),
        }
    }
}

/// A group of related markets; `mutually_exclusive` groups partition probability space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_ticker: String,
    pub series_ticker: Option<String>,
    pub title: String,
    pub category: Option<String>,
    pub mutually_exclusive: bool,
    pub markets: Vec<Market>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub excerpt: String,
    pub url: String,
    pub normalized_url: String,
}

impl NewsArticle {
    /// Hash of the article content, independent of which market it is scored against
    pub fn content_hash(&self) -> Fingerprint {
        Fingerprint::of(&[self.normalized_url.as_str(), self.title.as_str(), self.excerpt.as_str()])
    }
}

/// Filter for paginated event listing
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub status: Option<MarketStatus>,
    pub series_ticker: Option<String>,
    /// Stop following cursors once this many events are collected
    pub limit: Option<usize>,
    pub page_size: u32,
    pub with_nested_markets: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            status: Some(MarketStatus::Open),
            series_ticker: None,
            limit: None,
            page_size: 100,
            with_nested_markets: true,
        }
    }
}
