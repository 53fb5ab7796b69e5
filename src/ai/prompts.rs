use std::fmt::Write;
use std::sync::Arc;
use crate::ai::LlmRequest;
use crate::analysis::types::EvidenceRecord;
use crate::data::types::{Market, NewsArticle};

pub const SENTIMENT_SYSTEM: &str = "You are a financial analyst specializing in \
prediction markets. You judge how a single news article bears on whether a market resolves YES. \
Reply with a single JSON object and nothing else.";

pub const ESTIMATE_SYSTEM: &str = "You are a financial analyst specializing in \
prediction markets. You estimate the probability that a market resolves YES \
from scored news evidence. Reply with a single JSON object and nothing else.";

pub const FORMAT_REMINDER: &str = "Your previous reply could not be parsed. \
Respond again with only the JSON object in the requested shape, no prose and no code fences.";

pub fn sentiment_request(market: &Market, article: &NewsArticle) -> LlmRequest {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Market question: {}", market.full_question());
    if let Some(rules) = &market.rules {
        let _ = writeln!(prompt, "Resolution rules: {}", rules);
    }
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "Article ({}, {}):",
        article.source,
        article.published_at.format("%Y-%m-%d")
    );
    let _ = writeln!(prompt, "Title: {}", article.title);
    let _ = writeln!(prompt, "Excerpt: {}", article.excerpt);
    let _ = writeln!(prompt);
    let _ = write!(
        prompt,
        "Return {{\"relevance\": <0..1, how much the article bears on the question>, \
         \"sentiment\": <-1..1, negative favors NO and positive favors YES>, \
         \"justification\": <one sentence>}}"
    );

    LlmRequest::new(SENTIMENT_SYSTEM, prompt)
}

/// `evidence` is already ranked and cut to the top-K records
pub fn estimate_request(
    market: &Market,
    evidence: &[Arc<EvidenceRecord>],
    evidence_probability: f64,
) -> LlmRequest {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Market question: {}", market.full_question());
    if let Some(rules) = &market.rules {
        let _ = writeln!(prompt, "Resolution rules: {}", rules);
    }
    let _ = writeln!(
        prompt,
        "Current market-implied probability: {:.3}",
        market.implied_probability()
    );
    let _ = writeln!(prompt, "Evidence-adjusted probability: {:.3}", evidence_probability);
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Evidence, most relevant first:");
    for (i, record) in evidence.iter().enumerate() {
        let article = &record.article;
        let _ = writeln!(
            prompt,
            "{}. [{}] {}: {} (relevance {:.2}, sentiment {:+.2})",
            i + 1,
            article.published_at.format("%Y-%m-%d"),
            article.source,
            article.title,
            record.relevance,
            record.sentiment
        );
        let _ = writeln!(prompt, "   URL: {}", article.url);
        if !article.excerpt.is_empty() {
            let _ = writeln!(prompt, "   Excerpt: {}", article.excerpt);
        }
        if !record.justification.is_empty() {
            let _ = writeln!(prompt, "   Scored because: {}", record.justification);
        }
    }
    let _ = writeln!(prompt);
    let _ = write!(
        prompt,
        "Return {{\"probability\": <0..1 that the market resolves YES>, \
         \"confidence\": <0..1 in your estimate>, \
         \"rationale\": <two or three sentences>}}"
    );

    LlmRequest::new(ESTIMATE_SYSTEM, prompt)
}
