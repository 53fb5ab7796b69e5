use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::config::NewsConfig;
use crate::data::http::{with_retry, FetchError, HttpTransport, RetryPolicy};
use crate::data::types::NewsArticle;

const REMOVED_PLACEHOLDER: &str = "[Removed]";
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewsWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl NewsWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window ending now and reaching back `days`
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - ChronoDuration::days(days),
            end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Relevance,
    Recency,
}

impl SortOrder {
    fn as_query(&self) -> &'static str {
        match self {
            SortOrder::Relevance => "relevancy",
            SortOrder::Recency => "publishedAt",
        }
    }
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch_articles(
        &self,
        query: &str,
        window: &NewsWindow,
        sort: SortOrder,
        cancel: &CancellationToken,
    ) -> Result<Vec<NewsArticle>, FetchError>;
}

/// NewsAPI `/v2/everything` client
pub struct NewsAggregator {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    base_url: String,
    config: NewsConfig,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, Deserialize)]
struct NewsApiArticle {
    #[serde(default)]
    source: Option<NewsApiSource>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(rename = "publishedAt", default)]
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsApiSource {
    #[serde(default)]
    name: Option<String>,
}

impl NewsAggregator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        api_key: String,
        base_url: String,
        config: NewsConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            retry,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<NewsApiResponse, FetchError> {
        let headers = vec![("X-Api-Key".to_string(), self.api_key.clone())];
        let body = self.transport.get(url, &headers).await?.into_success_body()?;
        let parsed: NewsApiResponse = serde_json::from_str(&body)
            .map_err(|e| {
                FetchError::permanent(None, format!("Failed to parse news response: {}", e))
            })?;

        // NewsAPI can report errors in a 200 body
        if parsed.status == "error" {
            let code = parsed.code.unwrap_or_default();
            let message = format!("{}: {}", code, parsed.message.unwrap_or_default());
            return Err(if code == "rateLimited" {
                FetchError::transient(message)
            } else {
                FetchError::permanent(None, message)
            });
        }

        Ok(parsed)
    }

    fn convert(&self, articles: Vec<NewsApiArticle>) -> Vec<NewsArticle> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(articles.len());
        let mut dropped = 0;

        for raw in articles {
            match convert_article(raw, self.config.excerpt_chars) {
                Some(article) => {
                    if seen.insert(article.normalized_url.clone()) {
                        out.push(article);
                    }
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(dropped, "Dropped news articles missing title, URL or timestamp");
        }
        out
    }
}

#[async_trait]
impl NewsSource for NewsAggregator {
    async fn fetch_articles(
        &self,
        query: &str,
        window: &NewsWindow,
        sort: SortOrder,
        cancel: &CancellationToken,
    ) -> Result<Vec<NewsArticle>, FetchError> {
        let query = query.trim();
        if query.is_empty() {
            warn!("Empty news query, returning no articles");
            return Ok(Vec::new());
        }

        let attempts = relaxed_queries(query);
        let mut articles = Vec::new();
        for (i, attempt) in attempts.iter().enumerate() {
            if i > 0 {
                debug!(query = %attempt, "No articles, retrying with relaxed query");
            }
            articles = self.search(attempt, window, sort, cancel).await?;
            if !articles.is_empty() {
                break;
            }
        }

        debug!(query, count = articles.len(), "Fetched news");
        Ok(articles)
    }
}

impl NewsAggregator {
    async fn search(
        &self,
        query: &str,
        window: &NewsWindow,
        sort: SortOrder,
        cancel: &CancellationToken,
    ) -> Result<Vec<NewsArticle>, FetchError> {
        let params = [
            ("q", query.to_string()),
            ("from", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("to", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("sortBy", sort.as_query().to_string()),
            ("language", self.config.language.clone()),
            ("pageSize", self.config.page_size.to_string()),
            ("searchIn", "title,description".to_string()),
        ];
        let url = Url::parse_with_params(&format!("{}/v2/everything", self.base_url), &params)
            .map_err(|e| FetchError::permanent(None, format!("Invalid news URL: {}", e)))?;
        let url = url.as_str();

        let response =
            with_retry(&self.retry, cancel, "news", move || self.fetch_once(url)).await?;
        Ok(self.convert(response.articles))
    }
}

/// The query followed by successively simpler forms: operators and quotes
/// stripped, then the first four terms, then the first two. No duplicates.
pub fn relaxed_queries(query: &str) -> Vec<String> {
    const OPERATORS: &[&str] = &["AND", "OR", "NOT"];

    let terms: Vec<&str> = query
        .split(|c: char| c.is_whitespace() || matches!(c, '"' | '(' | ')'))
        .filter(|t| !t.is_empty() && !OPERATORS.contains(t))
        .collect();

    let mut out = vec![query.trim().to_string()];
    let candidates = [
        terms.join(" "),
        terms[..terms.len().min(4)].join(" "),
        terms[..terms.len().min(2)].join(" "),
    ];
    for candidate in candidates {
        if !candidate.is_empty() && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

fn convert_article(raw: NewsApiArticle, excerpt_chars: usize) -> Option<NewsArticle> {
    let title = raw.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())?;
    let url = raw.url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty())?;
    if title == REMOVED_PLACEHOLDER || url.contains("removed.com") {
        return None;
    }

    let published_at = raw
        .published_at
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    let body = [raw.description, raw.content]
        .into_iter()
        .flatten()
        .filter(|s| s != REMOVED_PLACEHOLDER)
        .collect::<Vec<_>>()
        .join(" ");

    Some(NewsArticle {
        source: raw
            .source
            .and_then(|s| s.name)
            .unwrap_or_else(|| "unknown".to_string()),
        published_at,
        normalized_url: normalize_url(&url),
        title,
        excerpt: make_excerpt(&body, excerpt_chars),
        url,
    })
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn truncation_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*(…|\.\.\.)?\s*\[\+\d+ chars\]\s*$").unwrap())
}

/// Collapse whitespace, drop NewsAPI's "[+N chars]" suffix and bound the length
pub fn make_excerpt(text: &str, max_chars: usize) -> String {
    let stripped = truncation_marker().replace(text, "");
    let collapsed = whitespace().replace_all(stripped.trim(), " ");

    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => collapsed[..idx].trim_end().to_string(),
        None => collapsed.into_owned(),
    }
}

/// Canonical form used for deduplication: scheme-less, lower-cased host without
/// `www.`, no fragment, no tracking parameters, no trailing slash
pub fn normalize_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return raw.trim().trim_end_matches('/').to_lowercase();
    };

    let host = url
        .host_str()
        .unwrap_or_default()
        .to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let query: Vec<String> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.iter().any(|p| *k == *p))
        .map(|(k, v)| if v.is_empty() { k.into_owned() } else { format!("{}={}", k, v) })
        .collect();

    let mut normalized = format!("{}{}", host, url.path().trim_end_matches('/'));
    if !query.is_empty() {
        normalized.push('?');
        normalized.push_str(&query.join("&"));
    }
    normalized
}
