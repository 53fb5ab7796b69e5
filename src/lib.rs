//! Prediction-market mispricing analysis.
//!
//! Pulls signed market snapshots from Kalshi, gathers news, scores it with an
//! LLM, fuses the evidence into probability estimates and flags markets whose
//! price disagrees with the estimate.

pub mod ai;
pub mod analysis;
pub mod config;
pub mod data;
pub mod monitoring;
pub mod pipeline;

pub use pipeline::{AnalysisPipeline, EventAnalysis, MarketAnalysis, PipelineError};
