use anyhow::Result;
use market_edge::analysis::types::MispricingFlag;
use market_edge::config::{Config, EnvConfig};
use market_edge::data::kalshi_api::MarketDataSource;
use market_edge::data::news::NewsWindow;
use market_edge::data::types::EventFilter;
use market_edge::monitoring::logger::FlagLogger;
use market_edge::monitoring::{logging, metrics};
use market_edge::pipeline::news_query;
use market_edge::{AnalysisPipeline, PipelineError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default("config.toml")?;
    logging::init_logging(&config.logging)?;

    info!("🚀 Market edge scanner starting...");
    let env_config = EnvConfig::load()?;
    let pipeline = AnalysisPipeline::from_config(&config, &env_config)?;

    let flag_logger = match &config.logging.flags_csv {
        Some(path) => Some(FlagLogger::new(path.as_str())?),
        None => None,
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, cancelling in-flight work");
        }
        shutdown.cancel();
    });

    let filter = EventFilter {
        series_ticker: config.market_data.series_ticker.clone(),
        limit: config.market_data.max_events,
        page_size: config.market_data.page_size,
        ..EventFilter::default()
    };

    let events = match pipeline.market_data().fetch_events(&filter, &cancel).await {
        Ok(events) => events,
        Err(e) if cancel.is_cancelled() => {
            info!("Shutting down before events were listed: {}", e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    info!("Analyzing {} open events", events.len());

    let window = NewsWindow::last_days(config.news.lookback_days);
    let mut total_flags = 0;

    for event in events {
        let ticker = event.event_ticker.clone();
        match pipeline.analyze_fetched_event(event, news_query, &window, &cancel).await {
            Ok(analysis) => {
                for flag in analysis.flags() {
                    total_flags += 1;
                    report(flag);
                    if let Some(logger) = &flag_logger {
                        if let Err(e) = logger.log_flag(flag) {
                            warn!("Failed to write flag log: {:#}", e);
                        }
                    }
                }
            }
            Err(PipelineError::Cancelled) => {
                info!("Shutting down...");
                break;
            }
            Err(e) => error!("Event {} failed: {}", ticker, e),
        }
    }

    info!("Done: {} flags raised", total_flags);
    let snapshot = metrics::gather_text();
    if !snapshot.is_empty() {
        info!("Metrics:\n{}", snapshot);
    }

    Ok(())
}

fn report(flag: &MispricingFlag) {
    info!(
        "🚩 {} {:?}: market={:.1}%, estimate={:.1}%, delta={:+.1}%, confidence={:.2} → {:?}",
        flag.subject,
        flag.kind,
        flag.market_price * 100.0,
        flag.estimate * 100.0,
        flag.delta * 100.0,
        flag.confidence,
        flag.recommendation
    );
}
