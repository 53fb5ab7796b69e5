pub mod logger;
pub mod logging;
pub mod metrics;
