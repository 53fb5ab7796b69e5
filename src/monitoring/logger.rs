use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use crate::analysis::types::MispricingFlag;

const HEADER: &str = "timestamp,subject,kind,direction,recommendation,market_price,estimate,\
delta,confidence,event_inconsistency";

/// Append-only CSV audit trail of raised flags
pub struct FlagLogger {
    log_path: PathBuf,
}

impl FlagLogger {
    pub fn new(log_path: impl Into<PathBuf>) -> Result<Self> {
        let log_path = log_path.into();

        // Create CSV file with headers if it doesn't exist
        if !log_path.exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)
                .with_context(|| format!("Failed to create flag log: {}", log_path.display()))?;

            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self { log_path })
    }

    pub fn log_flag(&self, flag: &MispricingFlag) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open flag log: {}", self.log_path.display()))?;

        let inconsistency = match flag.event_inconsistency {
            Some(v) => format!("{:.4}", v),
            None => String::new(),
        };

        writeln!(
            file,
            "{},{},{:?},{:?},{:?},{:.4},{:.4},{:.4},{:.3},{}",
            Utc::now().to_rfc3339(),
            flag.subject,
            flag.kind,
            flag.direction,
            flag.recommendation,
            flag.market_price,
            flag.estimate,
            flag.delta,
            flag.confidence,
            inconsistency
        )?;

        Ok(())
    }
}
