use tracing::info;
use crate::analysis::types::{Direction, FlagKind, MispricingFlag, ProbabilityEstimate};
use crate::config::MispricingConfig;
use crate::data::types::{Event, Market};
use crate::monitoring::metrics;

/// Compares estimates with market prices and checks event baskets sum to one
#[derive(Debug, Clone)]
pub struct MispricingDetector {
    config: MispricingConfig,
}

impl MispricingDetector {
    pub fn new(config: MispricingConfig) -> Self {
        Self { config }
    }

    /// Flag iff the gap exceeds `min_delta` and confidence exceeds `min_confidence`
    pub fn detect(
        &self,
        market: &Market,
        estimate: &ProbabilityEstimate,
    ) -> Option<MispricingFlag> {
        let market_price = market.implied_probability();
        let delta = market_price - estimate.probability();

        if delta.abs() <= self.config.min_delta {
            return None;
        }

        if estimate.confidence() <= self.config.min_confidence {
            info!(
                "{}: gap {:.1}% but confidence {:.2} not above {:.2}, skipping",
                market.ticker,
                delta.abs() * 100.0,
                estimate.confidence(),
                self.config.min_confidence
            );
            return None;
        }

        let direction = if delta > 0.0 {
            Direction::Overvalued
        } else {
            Direction::Undervalued
        };

        info!(
            "Mispricing {}: market={:.1}%, estimate={:.1}%, delta={:+.1}%, {:?}",
            market.ticker,
            market_price * 100.0,
            estimate.probability() * 100.0,
            delta * 100.0,
            direction
        );
        metrics::record_flag_raised();

        Some(MispricingFlag {
            subject: market.ticker.clone(),
            kind: FlagKind::Market,
            estimate: estimate.probability(),
            market_price,
            delta,
            direction,
            confidence: estimate.confidence(),
            event_inconsistency: None,
            recommendation: direction.recommendation(),
        })
    }

    /// For mutually exclusive events, implied probabilities should sum to one.
    ///
    /// Only markets belonging to `event` are counted; fewer than two means
    /// there is nothing to compare.
    pub fn detect_event_consistency(
        &self,
        event: &Event,
        markets: &[Market],
    ) -> Option<MispricingFlag> {
        if !event.mutually_exclusive {
            return None;
        }

        let members: Vec<&Market> = markets
            .iter()
            .filter(|m| m.event_ticker == event.event_ticker)
            .collect();
        if members.len() < 2 {
            return None;
        }

        let sum: f64 = members.iter().map(|m| m.implied_probability()).sum();
        let inconsistency = sum - 1.0;

        if inconsistency.abs() <= self.config.event_tolerance {
            return None;
        }

        let direction = if inconsistency > 0.0 {
            Direction::Overvalued
        } else {
            Direction::Undervalued
        };

        info!(
            "Event {} basket sums to {:.1}% across {} markets ({:+.1}%), {:?}",
            event.event_ticker,
            sum * 100.0,
            members.len(),
            inconsistency * 100.0,
            direction
        );
        metrics::record_flag_raised();

        Some(MispricingFlag {
            subject: event.event_ticker.clone(),
            kind: FlagKind::EventConsistency,
            estimate: 1.0,
            market_price: sum,
            delta: inconsistency,
            direction,
            confidence: 1.0,
            event_inconsistency: Some(inconsistency),
            recommendation: direction.recommendation(),
        })
    }
}
