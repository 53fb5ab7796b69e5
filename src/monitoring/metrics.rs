//! Process-wide counters, exported in Prometheus text format when the
//! `metrics` feature is enabled. Without it every recorder is a no-op.

#[cfg(feature = "metrics")]
pub use enabled::*;

#[cfg(not(feature = "metrics"))]
pub use disabled::*;

#[cfg(feature = "metrics")]
mod enabled {
    use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
    use std::sync::OnceLock;

    struct Counters {
        registry: Registry,
        fetch_retries: IntCounter,
        llm_calls: IntCounterVec,
        cache_hits: IntCounter,
        cache_misses: IntCounter,
        flags_raised: IntCounter,
    }

    fn build() -> prometheus::Result<Counters> {
        let registry = Registry::new();

        let fetch_retries = IntCounter::new(
            "market_edge_fetch_retries_total",
            "Transient fetch failures retried",
        )?;
        let llm_calls = IntCounterVec::new(
            Opts::new("market_edge_llm_calls_total", "LLM completions by outcome"),
            &["outcome"],
        )?;
        let cache_hits = IntCounter::new("market_edge_cache_hits_total", "Evidence store hits")?;
        let cache_misses =
            IntCounter::new("market_edge_cache_misses_total", "Evidence store misses")?;
        let flags_raised =
            IntCounter::new("market_edge_flags_raised_total", "Mispricing flags raised")?;

        registry.register(Box::new(fetch_retries.clone()))?;
        registry.register(Box::new(llm_calls.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(flags_raised.clone()))?;

        Ok(Counters {
            registry,
            fetch_retries,
            llm_calls,
            cache_hits,
            cache_misses,
            flags_raised,
        })
    }

    fn counters() -> Option<&'static Counters> {
        static COUNTERS: OnceLock<Option<Counters>> = OnceLock::new();
        COUNTERS
            .get_or_init(|| match build() {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("Metrics disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    pub fn record_fetch_retry() {
        if let Some(c) = counters() {
            c.fetch_retries.inc();
        }
    }

    pub fn record_llm_call(success: bool) {
        if let Some(c) = counters() {
            let outcome = if success { "ok" } else { "error" };
            c.llm_calls.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_cache_hit() {
        if let Some(c) = counters() {
            c.cache_hits.inc();
        }
    }

    pub fn record_cache_miss() {
        if let Some(c) = counters() {
            c.cache_misses.inc();
        }
    }

    pub fn record_flag_raised() {
        if let Some(c) = counters() {
            c.flags_raised.inc();
        }
    }

    /// Prometheus text exposition of all counters
    pub fn gather_text() -> String {
        let Some(c) = counters() else {
            return String::new();
        };
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&c.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_counters_exported() {
            record_flag_raised();
            record_llm_call(true);
            let text = gather_text();
            assert!(text.contains("market_edge_flags_raised_total"));
            assert!(text.contains("outcome=\"ok\""));
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod disabled {
    pub fn record_fetch_retry() {}
    pub fn record_llm_call(_success: bool) {}
    pub fn record_cache_hit() {}
    pub fn record_cache_miss() {}
    pub fn record_flag_raised() {}

    pub fn gather_text() -> String {
        String::new()
    }
}
