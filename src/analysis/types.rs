use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use crate::data::cache::{Cancelled, Fingerprint};
use crate::data::http::FetchError;
use crate::data::types::{Market, NewsArticle};

/// A news article scored against one market
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRecord {
    pub market_ticker: String,
    pub article: NewsArticle,
    /// 0 = irrelevant, 1 = directly decisive
    pub relevance: f64,
    /// -1 favors NO, +1 favors YES
    pub sentiment: f64,
    pub justification: String,
    pub fingerprint: Fingerprint,
}

impl EvidenceRecord {
    /// Clamps relevance to [0, 1] and sentiment to [-1, 1]
    pub fn new(
        market: &Market,
        article: NewsArticle,
        relevance: f64,
        sentiment: f64,
        justification: String,
    ) -> Self {
        let fingerprint = Self::fingerprint_for(market, &article);
        Self {
            market_ticker: market.ticker.clone(),
            article,
            relevance: clamp_finite(relevance, 0.0, 1.0),
            sentiment: clamp_finite(sentiment, -1.0, 1.0),
            justification,
            fingerprint,
        }
    }

    /// Same question and same article content always yield the same key
    pub fn fingerprint_for(market: &Market, article: &NewsArticle) -> Fingerprint {
        let content = article.content_hash();
        Fingerprint::of(&["evidence", market.full_question().as_str(), content.as_str()])
    }
}

/// Relevance desc, then recency desc, then fingerprint asc
pub fn evidence_order(a: &EvidenceRecord, b: &EvidenceRecord) -> Ordering {
    b.relevance
        .total_cmp(&a.relevance)
        .then_with(|| b.article.published_at.cmp(&a.article.published_at))
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
}

pub fn rank_evidence(records: &mut [Arc<EvidenceRecord>]) {
    records.sort_by(|a, b| evidence_order(a, b));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EstimateBasis {
    /// No evidence; the market price is returned as the estimate
    NoEvidence,
    /// Evidence signal only, the LLM pass failed
    EvidenceOnly,
    /// Evidence signal fused with the LLM estimate
    Fused,
}

/// Estimated probability that a market resolves YES.
///
/// Only built through the constructors below, which clamp to valid ranges.
#[derive(Debug, Clone, Serialize)]
pub struct ProbabilityEstimate {
    market_ticker: String,
    probability: f64,
    confidence: f64,
    rationale: String,
    sources: Vec<String>,
    evidence_count: usize,
    basis: EstimateBasis,
    created_at: DateTime<Utc>,
    inputs_hash: Fingerprint,
}

impl ProbabilityEstimate {
    pub fn no_evidence(market: &Market, confidence: f64, inputs_hash: Fingerprint) -> Self {
        Self::build(
            market,
            EstimateBasis::NoEvidence,
            market.implied_probability(),
            confidence,
            "No relevant news evidence; estimate defaults to the market price".to_string(),
            &[],
            0,
            inputs_hash,
        )
    }

    pub fn evidence_only(
        market: &Market,
        probability: f64,
        confidence: f64,
        rationale: String,
        top: &[Arc<EvidenceRecord>],
        evidence_count: usize,
        inputs_hash: Fingerprint,
    ) -> Self {
        Self::build(
            market,
            EstimateBasis::EvidenceOnly,
            probability,
            confidence,
            rationale,
            top,
            evidence_count,
            inputs_hash,
        )
    }

    pub fn fused(
        market: &Market,
        probability: f64,
        confidence: f64,
        rationale: String,
        top: &[Arc<EvidenceRecord>],
        evidence_count: usize,
        inputs_hash: Fingerprint,
    ) -> Self {
        Self::build(
            market,
            EstimateBasis::Fused,
            probability,
            confidence,
            rationale,
            top,
            evidence_count,
            inputs_hash,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        market: &Market,
        basis: EstimateBasis,
        probability: f64,
        confidence: f64,
        rationale: String,
        top: &[Arc<EvidenceRecord>],
        evidence_count: usize,
        inputs_hash: Fingerprint,
    ) -> Self {
        Self {
            market_ticker: market.ticker.clone(),
            probability: clamp_finite(probability, 0.0, 1.0),
            confidence: clamp_finite(confidence, 0.0, 1.0),
            rationale,
            sources: top.iter().map(|r| r.article.url.clone()).collect(),
            evidence_count,
            basis,
            created_at: Utc::now(),
            inputs_hash,
        }
    }

    pub fn market_ticker(&self) -> &str {
        &self.market_ticker
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    /// URLs of the articles shown to the LLM
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence_count
    }

    pub fn basis(&self) -> EstimateBasis {
        self.basis
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn inputs_hash(&self) -> &Fingerprint {
        &self.inputs_hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlagKind {
    Market,
    EventConsistency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Market price above the estimate
    Overvalued,
    Undervalued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Recommendation {
    BidYes,
    BidNo,
}

impl Direction {
    pub fn recommendation(&self) -> Recommendation {
        match self {
            Direction::Overvalued => Recommendation::BidNo,
            Direction::Undervalued => Recommendation::BidYes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MispricingFlag {
    /// Market ticker, or event ticker for consistency flags
    pub subject: String,
    pub kind: FlagKind,
    /// Estimated probability; 1.0 for the event basket
    pub estimate: f64,
    /// Implied probability; basket sum for event flags
    pub market_price: f64,
    /// `market_price - estimate`
    pub delta: f64,
    pub direction: Direction,
    pub confidence: f64,
    /// `sum - 1` for event flags
    pub event_inconsistency: Option<f64>,
    pub recommendation: Recommendation,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("LLM call failed: {0}")]
    Llm(FetchError),

    #[error("LLM response could not be parsed: {0}")]
    MalformedResponse(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

impl From<FetchError> for AnalysisError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => AnalysisError::Cancelled,
            other => AnalysisError::Llm(other),
        }
    }
}

impl From<Cancelled> for AnalysisError {
    fn from(_: Cancelled) -> Self {
        AnalysisError::Cancelled
    }
}

/// NaN collapses to the lower bound
pub(crate) fn clamp_finite(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}
