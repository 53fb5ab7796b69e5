use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::data::auth::RequestSigner;
use crate::data::http::{with_retry, FetchError, HttpTransport, RetryPolicy};
use crate::data::types::{Event, EventFilter, Market, MarketStatus};

const API_PREFIX: &str = "/trade-api/v2";

/// Narrow market-data seam so analysis can run against canned snapshots
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_events(
        &self,
        filter: &EventFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>, FetchError>;

    async fn fetch_markets(
        &self,
        event_ticker: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Market>, FetchError>;

    async fn fetch_event(
        &self,
        event_ticker: &str,
        cancel: &CancellationToken,
    ) -> Result<Event, FetchError>;
}

pub struct KalshiClient {
    transport: Arc<dyn HttpTransport>,
    signer: Arc<RequestSigner>,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct KalshiMarket {
    ticker: String,
    #[serde(default)]
    event_ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    yes_sub_title: Option<String>,
    #[serde(default)]
    rules_primary: Option<String>,
    #[serde(default)]
    yes_bid: f64,
    #[serde(default)]
    yes_ask: f64,
    #[serde(default)]
    no_bid: f64,
    #[serde(default)]
    no_ask: f64,
    #[serde(default)]
    last_price: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    close_time: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct KalshiEvent {
    event_ticker: String,
    #[serde(default)]
    series_ticker: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    mutually_exclusive: bool,
    #[serde(default)]
    markets: Vec<KalshiMarket>,
}

#[derive(Debug, Deserialize)]
struct KalshiEventsResponse {
    #[serde(default)]
    events: Vec<KalshiEvent>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KalshiMarketsResponse {
    #[serde(default)]
    markets: Vec<KalshiMarket>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KalshiEventResponse {
    event: KalshiEvent,
    #[serde(default)]
    markets: Vec<KalshiMarket>,
}

impl KalshiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        signer: Arc<RequestSigner>,
        base_url: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            signer,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    /// Signed GET with retry; each attempt is signed with a fresh timestamp
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T, FetchError> {
        let url = Url::parse_with_params(&format!("{}{}", self.base_url, path), query)
            .map_err(|e| FetchError::permanent(None, format!("Invalid URL for {}: {}", path, e)))?;
        let url = url.as_str();

        with_retry(&self.retry, cancel, path, move || self.get_once::<T>(url, path)).await
    }

    async fn get_once<T: DeserializeOwned>(&self, url: &str, path: &str) -> Result<T, FetchError> {
        let headers = self.signer.sign("GET", path).to_headers();
        let body = self.transport.get(url, &headers).await?.into_success_body()?;

        serde_json::from_str(&body).map_err(|e| {
            FetchError::permanent(None, format!("Failed to parse {} response: {}", path, e))
        })
    }

    fn page_query(
        page_size: u32,
        limit: Option<usize>,
        collected: usize,
        cursor: &Option<String>,
    ) -> Vec<(&'static str, String)> {
        let remaining = limit.map(|l| l.saturating_sub(collected)).unwrap_or(usize::MAX);
        let page_size = (page_size as usize).min(remaining).max(1);

        let mut query = vec![("limit", page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.clone()));
        }
        query
    }
}

#[async_trait]
impl MarketDataSource for KalshiClient {
    /// Follow pagination cursors until exhausted or `filter.limit` is reached
    async fn fetch_events(
        &self,
        filter: &EventFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>, FetchError> {
        let path = format!("{}/events", API_PREFIX);
        let mut events = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let mut query = Self::page_query(filter.page_size, filter.limit, events.len(), &cursor);
            query.push(("with_nested_markets", filter.with_nested_markets.to_string()));
            if let Some(status) = filter.status {
                query.push(("status", status.as_query().to_string()));
            }
            if let Some(series) = &filter.series_ticker {
                query.push(("series_ticker", series.clone()));
            }

            let page: KalshiEventsResponse = self.get_json(&path, &query, cancel).await?;
            pages += 1;

            let fetched_at = Utc::now();
            events.extend(page.events.into_iter().map(|e| convert_event(e, fetched_at)));

            if let Some(limit) = filter.limit {
                if events.len() >= limit {
                    events.truncate(limit);
                    break;
                }
            }

            match next_cursor(page.cursor, &cursor) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pages, count = events.len(), "Fetched events");
        Ok(events)
    }

    async fn fetch_markets(
        &self,
        event_ticker: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Market>, FetchError> {
        let path = format!("{}/markets", API_PREFIX);
        let mut markets = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = Self::page_query(1000, None, markets.len(), &cursor);
            query.push(("event_ticker", event_ticker.to_string()));

            let page: KalshiMarketsResponse = self.get_json(&path, &query, cancel).await?;
            let fetched_at = Utc::now();
            markets.extend(
                page.markets
                    .into_iter()
                    .map(|m| convert_market(m, event_ticker, fetched_at)),
            );

            match next_cursor(page.cursor, &cursor) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(event_ticker, count = markets.len(), "Fetched markets");
        Ok(markets)
    }

    async fn fetch_event(
        &self,
        event_ticker: &str,
        cancel: &CancellationToken,
    ) -> Result<Event, FetchError> {
        let path = format!("{}/events/{}", API_PREFIX, event_ticker);
        let query = [("with_nested_markets", "true".to_string())];

        let response: KalshiEventResponse = self.get_json(&path, &query, cancel).await?;

        let mut raw = response.event;
        if !response.markets.is_empty() {
            raw.markets = response.markets;
        }
        Ok(convert_event(raw, Utc::now()))
    }
}

/// Next cursor, or None when the provider signals the end (empty, absent or repeated)
fn next_cursor(next: Option<String>, current: &Option<String>) -> Option<String> {
    let next = next.filter(|c| !c.is_empty())?;
    if current.as_deref() == Some(next.as_str()) {
        warn!(cursor = %next, "Provider repeated pagination cursor, stopping");
        return None;
    }
    Some(next)
}

fn convert_event(raw: KalshiEvent, fetched_at: DateTime<Utc>) -> Event {
    let markets = raw
        .markets
        .into_iter()
        .map(|m| convert_market(m, &raw.event_ticker, fetched_at))
        .collect();

    Event {
        event_ticker: raw.event_ticker,
        series_ticker: raw.series_ticker.filter(|s| !s.is_empty()),
        title: raw.title,
        category: raw.category.filter(|c| !c.is_empty()),
        mutually_exclusive: raw.mutually_exclusive,
        markets,
        fetched_at,
    }
}

/// Convert provider cents into probability units
fn convert_market(raw: KalshiMarket, parent_event: &str, fetched_at: DateTime<Utc>) -> Market {
    let close_time = raw
        .close_time
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let subtitle = raw
        .yes_sub_title
        .filter(|s| !s.is_empty())
        .or(raw.subtitle.filter(|s| !s.is_empty()));

    let event_ticker = if raw.event_ticker.is_empty() {
        parent_event.to_string()
    } else {
        raw.event_ticker
    };

    Market {
        ticker: raw.ticker,
        event_ticker,
        question: raw.title,
        subtitle,
        rules: raw.rules_primary.filter(|s| !s.is_empty()),
        yes_bid: raw.yes_bid / 100.0,
        yes_ask: raw.yes_ask / 100.0,
        no_bid: raw.no_bid / 100.0,
        no_ask: raw.no_ask / 100.0,
        last_price: raw.last_price / 100.0,
        volume: raw.volume,
        close_time,
        status: MarketStatus::from_provider(&raw.status),
        fetched_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::auth::testing::test_signer;
    use crate::data::auth::{HEADER_SIGNATURE, HEADER_TIMESTAMP};
    use crate::data::http::testing::ScriptedTransport;
    use std::time::Duration;

    const BASE: &str = "https://kalshi.test";

    fn client(transport: Arc<ScriptedTransport>) -> KalshiClient {
        KalshiClient::new(
            transport,
            Arc::new(test_signer()),
            BASE.to_string(),
            RetryPolicy::default(),
        )
    }

    fn events_page(tickers: &[&str], cursor: &str) -> String {
        let events: Vec<serde_json::Value> = tickers
            .iter()
            .map(|t| {
                serde_json::json!({
                    "event_ticker": t,
                    "title": format!("Event {}", t),
                    "category": "Politics",
                    "mutually_exclusive": true,
                    "markets": [{
                        "ticker": format!("{}-A", t),
                        "title": "Who will win?",
                        "yes_sub_title": "Candidate A",
                        "yes_bid": 38, "yes_ask": 42, "no_bid": 58, "no_ask": 62,
                        "last_price": 40, "volume": 1200,
                        "close_time": "2026-11-03T00:00:00Z",
                        "status": "active"
                    }]
                })
            })
            .collect();
        serde_json::json!({ "events": events, "cursor": cursor }).to_string()
    }

    #[tokio::test]
    async fn test_fetch_events_follows_cursor_until_exhausted() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(200, &events_page(&["E1", "E2"], "c1"))
                .respond(200, &events_page(&["E3"], "c2"))
                .respond(200, &events_page(&["E4"], "")),
        );
        let client = client(transport.clone());

        let events = client
            .fetch_events(&EventFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        let tickers: Vec<_> = events.iter().map(|e| e.event_ticker.as_str()).collect();
        assert_eq!(tickers, vec!["E1", "E2", "E3", "E4"]);

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(!requests[0].url.contains("cursor="));
        assert!(requests[1].url.contains("cursor=c1"));
        assert!(requests[2].url.contains("cursor=c2"));
        assert!(requests[0].url.contains("status=open"));
    }

    #[tokio::test]
    async fn test_fetch_events_stops_at_caller_limit() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(200, &events_page(&["E1", "E2"], "c1"))
                .respond(200, &events_page(&["E3", "E4"], "c2")),
        );
        let client = client(transport.clone());
        let filter = EventFilter {
            limit: Some(3),
            page_size: 2,
            ..EventFilter::default()
        };

        let events = client.fetch_events(&filter, &CancellationToken::new()).await.unwrap();

        assert_eq!(events.len(), 3);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        // Second page only asks for what is still missing
        assert!(requests[1].url.contains("limit=1"));
    }

    #[tokio::test]
    async fn test_market_prices_converted_from_cents() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, &events_page(&["E1"], "")));
        let events = client(transport)
            .fetch_events(&EventFilter::default(), &CancellationToken::new())
            .await
            .unwrap();

        let market = &events[0].markets[0];
        assert_eq!(market.event_ticker, "E1");
        assert_eq!(market.subtitle.as_deref(), Some("Candidate A"));
        assert_eq!(market.status, MarketStatus::Open);
        assert!((market.implied_probability() - 0.40).abs() < 1e-9);
        assert!(market.close_time.is_some());
        assert!(events[0].mutually_exclusive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_three_503s_with_increasing_backoff() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(503, "unavailable")
                .respond(503, "unavailable")
                .respond(503, "unavailable")
                .respond(200, &events_page(&["E1"], "")),
        );
        let client = client(transport.clone());

        let events = client
            .fetch_events(&EventFilter::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let requests = transport.requests();
        assert_eq!(requests.len(), 4);

        let gaps: Vec<Duration> = requests.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(gaps[0], Duration::from_millis(500));
        assert!(gaps[1] > gaps[0]);
        assert!(gaps[2] > gaps[1]);

        // Every attempt signed afresh
        let timestamps: Vec<_> =
            requests.iter().map(|r| r.header(HEADER_TIMESTAMP).unwrap()).collect();
        let mut unique = timestamps.clone();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert!(requests.iter().all(|r| r.header(HEADER_SIGNATURE).is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(401, "{\"error\":\"unauthorized\"}")
                .respond(200, &events_page(&["E1"], "")),
        );
        let client = client(transport.clone());

        let result = client
            .fetch_events(&EventFilter::default(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::Permanent { status: Some(401), .. })));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_permanent() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, "<html>oops</html>"));
        let result = client(transport)
            .fetch_events(&EventFilter::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(FetchError::Permanent { status: None, .. })));
    }

    #[tokio::test]
    async fn test_fetch_markets_paginates_and_signs_path_without_query() {
        let page1 = serde_json::json!({
            "markets": [
                {"ticker": "M1", "title": "Q1", "yes_bid": 10, "yes_ask": 12, "status": "open"}
            ],
            "cursor": "next"
        });
        let page2 = serde_json::json!({
            "markets": [{"ticker": "M2", "title": "Q2", "last_price": 55, "status": "settled"}],
            "cursor": null
        });
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(200, &page1.to_string())
                .respond(200, &page2.to_string()),
        );
        let client = client(transport.clone());

        let markets = client.fetch_markets("EVT", &CancellationToken::new()).await.unwrap();

        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].event_ticker, "EVT");
        assert_eq!(markets[1].status, MarketStatus::Settled);
        assert!((markets[1].implied_probability() - 0.55).abs() < 1e-9);

        let request = &transport.requests()[0];
        assert!(request.url.starts_with("https://kalshi.test/trade-api/v2/markets?"));
        assert!(request.url.contains("event_ticker=EVT"));
    }

    #[tokio::test]
    async fn test_fetch_event_prefers_top_level_markets() {
        let body = serde_json::json!({
            "event": {"event_ticker": "EVT", "title": "Election", "mutually_exclusive": true},
            "markets": [
                {"ticker": "EVT-A", "title": "Winner?", "yes_bid": 30, "yes_ask": 34},
                {"ticker": "EVT-B", "title": "Winner?", "yes_bid": 60, "yes_ask": 64}
            ]
        });
        let transport = Arc::new(ScriptedTransport::new().respond(200, &body.to_string()));

        let event = client(transport.clone())
            .fetch_event("EVT", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(event.markets.len(), 2);
        assert!(transport.requests()[0].url.contains("/trade-api/v2/events/EVT?"));
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, &events_page(&["E1"], "")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client(transport.clone()).fetch_events(&EventFilter::default(), &cancel).await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_repeated_cursor_stops_pagination() {
        assert_eq!(next_cursor(Some("a".into()), &None), Some("a".to_string()));
        assert_eq!(next_cursor(Some("a".into()), &Some("a".into())), None);
        assert_eq!(next_cursor(Some(String::new()), &None), None);
        assert_eq!(next_cursor(None, &None), None);
    }
}
