pub mod estimator;
pub mod mispricing;
pub mod sentiment;
pub mod types;

pub use estimator::ProbabilityEstimator;
pub use mispricing::MispricingDetector;
pub use sentiment::SentimentAnalyzer;
