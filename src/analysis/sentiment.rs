use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::ai::{complete_structured, prompts, LlmClient};
use crate::analysis::types::{rank_evidence, AnalysisError, EvidenceRecord};
use crate::data::cache::EvidenceStore;
use crate::data::types::{Market, NewsArticle};

#[derive(Debug, Deserialize)]
struct SentimentReply {
    relevance: f64,
    sentiment: f64,
    #[serde(default)]
    justification: String,
}

/// Scores news articles against a market question through the LLM
pub struct SentimentAnalyzer {
    llm: Arc<dyn LlmClient>,
    store: Arc<EvidenceStore<EvidenceRecord>>,
    max_concurrent: usize,
}

impl SentimentAnalyzer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<EvidenceStore<EvidenceRecord>>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            llm,
            store,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Score one article; cached by (question, article content)
    pub async fn score(
        &self,
        market: &Market,
        article: NewsArticle,
        cancel: &CancellationToken,
    ) -> Result<Arc<EvidenceRecord>, AnalysisError> {
        let fingerprint = EvidenceRecord::fingerprint_for(market, &article);

        self.store
            .get_or_try_compute(&fingerprint, cancel, || async {
                let request = prompts::sentiment_request(market, &article);
                let reply: SentimentReply =
                    complete_structured(self.llm.as_ref(), request, cancel).await?;
                Ok::<_, AnalysisError>(self.to_record(market, article, reply))
            })
            .await
    }

    /// Score all articles with bounded concurrency, skipping articles that fail.
    ///
    /// Results are deduplicated by fingerprint and ranked.
    pub async fn score_all(
        &self,
        market: &Market,
        articles: Vec<NewsArticle>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<EvidenceRecord>>, AnalysisError> {
        let total = articles.len();

        let results: Vec<_> = stream::iter(articles)
            .map(|article| {
                let url = article.url.clone();
                async move { (url, self.score(market, article, cancel).await) }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(results.len());
        for (url, result) in results {
            match result {
                Ok(record) => {
                    if seen.insert(record.fingerprint.clone()) {
                        records.push(record);
                    }
                }
                Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
                Err(e) => {
                    let ticker = &market.ticker;
                    warn!(market = %ticker, url = %url, error = %e, "Skipping unscored article");
                }
            }
        }

        rank_evidence(&mut records);
        debug!(market = %market.ticker, scored = records.len(), total, "Scored evidence");
        Ok(records)
    }

    fn to_record(
        &self,
        market: &Market,
        article: NewsArticle,
        reply: SentimentReply,
    ) -> EvidenceRecord {
        let ticker = &market.ticker;
        if !(0.0..=1.0).contains(&reply.relevance) {
            warn!(market = %ticker, value = reply.relevance, "Relevance out of range, clamping");
        }
        if !(-1.0..=1.0).contains(&reply.sentiment) {
            warn!(market = %ticker, value = reply.sentiment, "Sentiment out of range, clamping");
        }

        EvidenceRecord::new(market, article, reply.relevance, reply.sentiment, reply.justification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::{FnLlm, ScriptedLlm};
    use crate::ai::LlmRequest;
    use crate::data::http::FetchError;
    use crate::data::types::fixtures::{article, market};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn store() -> Arc<EvidenceStore<EvidenceRecord>> {
        Arc::new(EvidenceStore::new(100, Duration::from_secs(3600)))
    }

    fn reply(relevance: f64, sentiment: f64) -> String {
        serde_json::json!({
            "relevance": relevance,
            "sentiment": sentiment,
            "justification": "because"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_score_is_cached_by_fingerprint() {
        let llm = Arc::new(FnLlm::new(|_: &LlmRequest| Ok(reply(0.8, 0.5))));
        let analyzer = SentimentAnalyzer::new(llm.clone(), store(), 5);
        let m = market("A", 0.4, 0.42);
        let a = article("https://x.com/1", "Poll", Utc::now());

        let first = analyzer.score(&m, a.clone(), &CancellationToken::new()).await.unwrap();
        let second = analyzer.score(&m, a, &CancellationToken::new()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(llm.call_count(), 1);
        assert_eq!(first.relevance, 0.8);
        assert_eq!(first.justification, "because");
    }

    #[tokio::test]
    async fn test_out_of_range_scores_are_clamped() {
        let llm = Arc::new(ScriptedLlm::new().reply(&reply(1.6, -2.0)));
        let analyzer = SentimentAnalyzer::new(llm, store(), 5);
        let m = market("A", 0.4, 0.42);

        let record = analyzer
            .score(&m, article("https://x.com/1", "Poll", Utc::now()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.relevance, 1.0);
        assert_eq!(record.sentiment, -1.0);
    }

    #[tokio::test]
    async fn test_score_all_skips_failures_and_ranks() {
        let llm = Arc::new(FnLlm::new(|req: &LlmRequest| {
            // Repairs append turns, so key off the original prompt
            let prompt = &req.messages[0].content;
            if prompt.contains("Broken") {
                Ok("not json".to_string())
            } else if prompt.contains("Offline") {
                Err(FetchError::permanent(Some(400), "bad request"))
            } else if prompt.contains("Major") {
                Ok(reply(0.9, 0.7))
            } else {
                Ok(reply(0.3, -0.2))
            }
        }));
        let analyzer = SentimentAnalyzer::new(llm, store(), 2);
        let m = market("A", 0.4, 0.42);
        let now = Utc::now();
        let articles = vec![
            article("https://x.com/minor", "Minor note", now),
            article("https://x.com/broken", "Broken", now),
            article("https://x.com/major", "Major poll", now - ChronoDuration::hours(3)),
            article("https://x.com/offline", "Offline", now),
        ];

        let records = analyzer.score_all(&m, articles, &CancellationToken::new()).await.unwrap();

        let urls: Vec<_> = records.iter().map(|r| r.article.url.as_str()).collect();
        assert_eq!(urls, vec!["https://x.com/major", "https://x.com/minor"]);
    }

    #[tokio::test]
    async fn test_score_all_deduplicates_identical_articles() {
        let llm = Arc::new(FnLlm::new(|_: &LlmRequest| Ok(reply(0.5, 0.1))));
        let analyzer = SentimentAnalyzer::new(llm.clone(), store(), 5);
        let m = market("A", 0.4, 0.42);
        let a = article("https://x.com/1", "Same", Utc::now());

        let records = analyzer
            .score_all(&m, vec![a.clone(), a], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_score_all_propagates_cancellation() {
        let llm = Arc::new(FnLlm::new(|_: &LlmRequest| Ok(reply(0.5, 0.1))));
        let store = store();
        let analyzer = SentimentAnalyzer::new(llm, store.clone(), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let articles = vec![article("https://x.com/1", "t", Utc::now())];
        let result = analyzer.score_all(&market("A", 0.4, 0.42), articles, &cancel).await;

        assert!(matches!(result, Err(AnalysisError::Cancelled)));
        assert!(store.is_empty());
    }

    /// Tracks the peak number of overlapping calls
    struct GaugeLlm {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for GaugeLlm {
        async fn complete(
            &self,
            _request: &LlmRequest,
            _cancel: &CancellationToken,
        ) -> Result<String, FetchError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(reply(0.5, 0.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_is_bounded() {
        let llm = Arc::new(GaugeLlm {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let analyzer = SentimentAnalyzer::new(llm.clone(), store(), 3);
        let articles = (0..10)
            .map(|i| article(&format!("https://x.com/{}", i), &format!("Story {}", i), Utc::now()))
            .collect();

        let records = analyzer
            .score_all(&market("A", 0.4, 0.42), articles, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(records.len(), 10);
        assert_eq!(llm.peak.load(Ordering::SeqCst), 3);
    }
}
