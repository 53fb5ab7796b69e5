use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::ai::{complete_structured, prompts, LlmClient};
use crate::analysis::types::{
    clamp_finite, rank_evidence, AnalysisError, EvidenceRecord, ProbabilityEstimate,
};
use crate::config::EstimatorConfig;
use crate::data::cache::{EvidenceStore, Fingerprint};
use crate::data::types::Market;

#[derive(Debug, Deserialize)]
struct EstimateReply {
    probability: f64,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Relevance-weighted aggregate of evidence sentiment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidenceSignal {
    /// Σ(relevance·sentiment) / Σrelevance, in [-1, 1]
    pub score: f64,
    /// Σrelevance
    pub total_weight: f64,
    pub count: usize,
}

impl EvidenceSignal {
    pub fn from_records(records: &[Arc<EvidenceRecord>]) -> Self {
        let total_weight: f64 = records.iter().map(|r| r.relevance).sum();
        let weighted: f64 = records.iter().map(|r| r.relevance * r.sentiment).sum();
        let score = if total_weight > 0.0 {
            (weighted / total_weight).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        Self {
            score,
            total_weight,
            count: records.len(),
        }
    }

    /// Move `prior` toward 1 (positive signal) or 0 (negative) by
    /// `weight·|score|` of the remaining distance
    pub fn adjust(&self, prior: f64, weight: f64) -> f64 {
        let step = weight.clamp(0.0, 1.0) * self.score.abs();
        let p = if self.score >= 0.0 {
            prior + step * (1.0 - prior)
        } else {
            prior - step * prior
        };
        p.clamp(0.0, 1.0)
    }

    /// Saturating confidence from the amount of relevant evidence
    pub fn volume_factor(&self, scale: f64) -> f64 {
        if scale <= 0.0 {
            return 1.0;
        }
        1.0 - (-self.total_weight / scale).exp()
    }
}

/// Fuses scored evidence with the market prior into a probability estimate
pub struct ProbabilityEstimator {
    llm: Arc<dyn LlmClient>,
    store: Arc<EvidenceStore<ProbabilityEstimate>>,
    config: EstimatorConfig,
}

impl ProbabilityEstimator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<EvidenceStore<ProbabilityEstimate>>,
        config: EstimatorConfig,
    ) -> Self {
        Self { llm, store, config }
    }

    /// Estimate the YES probability of `market` given scored evidence.
    ///
    /// Always produces an estimate unless cancelled: no evidence yields the
    /// market price at low confidence, and an LLM failure falls back to the
    /// evidence signal alone.
    pub async fn estimate(
        &self,
        market: &Market,
        evidence: &[Arc<EvidenceRecord>],
        cancel: &CancellationToken,
    ) -> Result<Arc<ProbabilityEstimate>, AnalysisError> {
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let mut ranked = evidence.to_vec();
        rank_evidence(&mut ranked);
        let hash = inputs_hash(market, &ranked);

        self.store
            .get_or_try_compute(&hash, cancel, || {
                self.compute(market, &ranked, hash.clone(), cancel)
            })
            .await
    }

    async fn compute(
        &self,
        market: &Market,
        ranked: &[Arc<EvidenceRecord>],
        hash: Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<ProbabilityEstimate, AnalysisError> {
        let prior = market.implied_probability();
        let signal = EvidenceSignal::from_records(ranked);

        if signal.count == 0 || signal.total_weight <= 0.0 {
            let confidence =
                self.config.no_evidence_confidence.min(self.config.low_confidence_ceiling);
            info!(market = %market.ticker, prior, "No evidence, estimate defaults to market price");
            return Ok(ProbabilityEstimate::no_evidence(market, confidence, hash));
        }

        let evidence_probability = signal.adjust(prior, self.config.evidence_weight);
        let volume = signal.volume_factor(self.config.volume_scale);
        let top = &ranked[..self.config.top_k.clamp(1, ranked.len())];

        let request = prompts::estimate_request(market, top, evidence_probability);
        let reply = complete_structured::<EstimateReply>(self.llm.as_ref(), request, cancel).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
            Err(e) => {
                warn!(
                    market = %market.ticker,
                    error = %e,
                    "LLM estimate failed, using evidence signal only"
                );
                return Ok(ProbabilityEstimate::evidence_only(
                    market,
                    evidence_probability,
                    volume * 0.5,
                    format!(
                        "Evidence-only estimate from {} articles (signal {:+.2}); LLM unavailable",
                        signal.count, signal.score
                    ),
                    top,
                    signal.count,
                    hash,
                ));
            }
        };

        let llm_probability = checked_unit(market, "probability", reply.probability);
        let llm_confidence = checked_unit(market, "confidence", reply.confidence);

        let llm_weight = self.config.llm_weight.clamp(0.0, 1.0);
        let probability = llm_weight * llm_probability + (1.0 - llm_weight) * evidence_probability;
        let confidence = llm_confidence.min(volume);

        info!(
            "Estimate {}: prior={:.1}%, evidence={:.1}%, llm={:.1}%, final={:.1}% \
             (confidence {:.2})",
            market.ticker,
            prior * 100.0,
            evidence_probability * 100.0,
            llm_probability * 100.0,
            probability * 100.0,
            confidence
        );

        Ok(ProbabilityEstimate::fused(
            market,
            probability,
            confidence,
            reply.rationale,
            top,
            signal.count,
            hash,
        ))
    }
}

/// Cache key over everything the estimate depends on
fn inputs_hash(market: &Market, ranked: &[Arc<EvidenceRecord>]) -> Fingerprint {
    let price = format!("{:.4}", market.implied_probability());
    let question = market.full_question();

    let mut evidence: Vec<String> = ranked
        .iter()
        .map(|r| format!("{}:{:.4}:{:.4}", r.fingerprint.as_str(), r.relevance, r.sentiment))
        .collect();
    evidence.sort();

    let mut parts = vec!["estimate", market.ticker.as_str(), question.as_str(), price.as_str()];
    parts.extend(evidence.iter().map(String::as_str));
    Fingerprint::of(&parts)
}

fn checked_unit(market: &Market, field: &str, value: f64) -> f64 {
    if !(0.0..=1.0).contains(&value) {
        warn!(market = %market.ticker, field, value, "LLM value out of range, clamping");
    }
    clamp_finite(value, 0.0, 1.0)
}
