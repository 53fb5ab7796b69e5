use anyhow::Context;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::ai::{ClaudeClient, LlmClient};
use crate::analysis::types::{
    AnalysisError, EvidenceRecord, MispricingFlag, ProbabilityEstimate,
};
use crate::analysis::{MispricingDetector, ProbabilityEstimator, SentimentAnalyzer};
use crate::config::{Config, EnvConfig};
use crate::data::auth::{RequestSigner, SystemClock};
use crate::data::cache::EvidenceStore;
use crate::data::http::{FetchError, HttpTransport, ReqwestTransport};
use crate::data::kalshi_api::{KalshiClient, MarketDataSource};
use crate::data::news::{NewsAggregator, NewsSource, NewsWindow, SortOrder};
use crate::data::types::{Event, Market};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Market data unavailable: {0}")]
    MarketData(FetchError),

    #[error("Analysis failed: {0}")]
    Analysis(AnalysisError),

    #[error("Pipeline cancelled")]
    Cancelled,
}

impl From<AnalysisError> for PipelineError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Analysis(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketAnalysis {
    pub market: Market,
    pub evidence: Vec<Arc<EvidenceRecord>>,
    pub estimate: Arc<ProbabilityEstimate>,
    pub flag: Option<MispricingFlag>,
}

#[derive(Debug, Clone)]
pub struct EventAnalysis {
    pub event: Event,
    pub consistency_flag: Option<MispricingFlag>,
    /// One entry per analyzed open market, in event order
    pub markets: Vec<MarketAnalysis>,
}

impl EventAnalysis {
    pub fn flags(&self) -> impl Iterator<Item = &MispricingFlag> {
        self.consistency_flag
            .iter()
            .chain(self.markets.iter().filter_map(|m| m.flag.as_ref()))
    }
}

/// News → scoring → estimate → flag, per market and per event
pub struct AnalysisPipeline {
    market_data: Arc<dyn MarketDataSource>,
    news: Arc<dyn NewsSource>,
    news_sort: SortOrder,
    sentiment: SentimentAnalyzer,
    estimator: ProbabilityEstimator,
    detector: MispricingDetector,
    max_concurrent_markets: usize,
}

impl AnalysisPipeline {
    pub fn new(
        market_data: Arc<dyn MarketDataSource>,
        news: Arc<dyn NewsSource>,
        llm: Arc<dyn LlmClient>,
        config: &Config,
    ) -> Self {
        let stores = &config.evidence_store;
        let evidence_store = Arc::new(EvidenceStore::new(
            stores.evidence_capacity,
            Duration::from_secs(stores.evidence_ttl_secs),
        ));
        let estimate_store = Arc::new(EvidenceStore::new(
            stores.estimate_capacity,
            Duration::from_secs(stores.estimate_ttl_secs),
        ));

        Self {
            market_data,
            news,
            news_sort: config.news.sort,
            sentiment: SentimentAnalyzer::new(
                llm.clone(),
                evidence_store,
                config.llm.max_concurrent,
            ),
            estimator: ProbabilityEstimator::new(llm, estimate_store, config.estimator.clone()),
            detector: MispricingDetector::new(config.mispricing.clone()),
            max_concurrent_markets: config.llm.max_concurrent_markets.max(1),
        }
    }

    /// Wire the production clients: signed Kalshi, NewsAPI and Claude
    pub fn from_config(config: &Config, env: &EnvConfig) -> anyhow::Result<Self> {
        let signer = RequestSigner::from_file(
            env.kalshi_api_key.clone(),
            &env.kalshi_private_key_path,
            Arc::new(SystemClock),
        )
        .context("Failed to load Kalshi signing key")?;
        let retry = config.retry.policy();

        let market_transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
            Duration::from_secs(config.market_data.timeout_secs),
        )?);
        let llm_transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(Duration::from_secs(config.llm.timeout_secs))?);

        let market_data = Arc::new(KalshiClient::new(
            market_transport.clone(),
            Arc::new(signer),
            env.kalshi_base_url.clone(),
            retry.clone(),
        ));
        let news = Arc::new(NewsAggregator::new(
            market_transport,
            env.news_api_key.clone(),
            env.news_base_url.clone(),
            config.news.clone(),
            retry.clone(),
        ));
        let llm = Arc::new(ClaudeClient::new(
            llm_transport,
            env.anthropic_api_key.clone(),
            env.anthropic_url.clone(),
            &config.llm,
            retry,
        ));

        info!("Pipeline ready: model={}, kalshi={}", llm.model(), env.kalshi_base_url);
        Ok(Self::new(market_data, news, llm, config))
    }

    pub fn market_data(&self) -> &Arc<dyn MarketDataSource> {
        &self.market_data
    }

    /// Analyze one market. News failures degrade to no evidence; cancellation aborts.
    pub async fn analyze_market(
        &self,
        market: &Market,
        query: &str,
        window: &NewsWindow,
        cancel: &CancellationToken,
    ) -> Result<MarketAnalysis, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let fetched = self.news.fetch_articles(query, window, self.news_sort, cancel).await;
        let articles = match fetched {
            Ok(articles) => articles,
            Err(FetchError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                warn!(
                    market = %market.ticker,
                    error = %e,
                    "News unavailable, continuing without evidence"
                );
                Vec::new()
            }
        };

        let evidence = self.sentiment.score_all(market, articles, cancel).await?;
        let estimate = self.estimator.estimate(market, &evidence, cancel).await?;
        let flag = self.detector.detect(market, &estimate);

        Ok(MarketAnalysis {
            market: market.clone(),
            evidence,
            estimate,
            flag,
        })
    }

    /// Fetch a fresh snapshot of the event, then analyze it
    pub async fn analyze_event<Q>(
        &self,
        event_ticker: &str,
        query_for: Q,
        window: &NewsWindow,
        cancel: &CancellationToken,
    ) -> Result<EventAnalysis, PipelineError>
    where
        Q: Fn(&Market) -> String,
    {
        let event = match self.market_data.fetch_event(event_ticker, cancel).await {
            Ok(event) => event,
            Err(FetchError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => return Err(PipelineError::MarketData(e)),
        };

        self.analyze_fetched_event(event, query_for, window, cancel).await
    }

    /// Consistency check plus per-market analysis of every open market, at most
    /// `max_concurrent_markets` at a time, results in event order
    pub async fn analyze_fetched_event<Q>(
        &self,
        event: Event,
        query_for: Q,
        window: &NewsWindow,
        cancel: &CancellationToken,
    ) -> Result<EventAnalysis, PipelineError>
    where
        Q: Fn(&Market) -> String,
    {
        let consistency_flag = self.detector.detect_event_consistency(&event, &event.markets);

        let open: Vec<&Market> = event.markets.iter().filter(|m| m.is_open()).collect();
        let queries: Vec<String> = open.iter().map(|&m| query_for(m)).collect();

        let results: Vec<_> = stream::iter(open.iter().zip(queries.iter()))
            .map(|(market, query)| self.analyze_market(market, query, window, cancel))
            .buffered(self.max_concurrent_markets)
            .collect()
            .await;

        let mut markets = Vec::with_capacity(results.len());
        for (market, result) in open.iter().zip(results) {
            match result {
                Ok(analysis) => markets.push(analysis),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(market = %market.ticker, error = %e, "Market analysis failed, skipping");
                }
            }
        }

        Ok(EventAnalysis {
            event,
            consistency_flag,
            markets,
        })
    }
}

/// News search terms for a market: the question without filler words and punctuation
pub fn news_query(market: &Market) -> String {
    const STOP_WORDS: &[&str] = &[
        "will", "the", "a", "an", "be", "by", "of", "in", "on", "to", "before", "after",
    ];

    market
        .full_question()
        .split(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}
