// Run configuration, loaded from the environment.
//
// Connector credentials are deliberately not here: transport belongs to
// whoever wires the connectors, the engine only needs the migration scope.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::env;
use std::path::PathBuf;

/// Scope and tuning for one migration session.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Company scope applied to every source query.
    pub company_id: i64,

    /// Lower date bound; only records on or after this date are migrated.
    pub start_date: NaiveDate,

    /// Records per batch. Any value >= 1 is valid; smaller batches commit
    /// mappings more often.
    pub batch_size: usize,

    /// Path of the durable mapping store.
    pub tracking_db: PathBuf,

    /// Path of the reference-equivalence side file.
    pub reference_file: PathBuf,

    /// How many detailed errors the end-of-run summary prints.
    pub error_report_limit: usize,
}

impl MigrationConfig {
    /// Read configuration from the environment (a `.env` file is honored
    /// when present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let company_id = env_or("COMPANY_ID", "1")
            .parse::<i64>()
            .context("COMPANY_ID must be an integer")?;

        let start_date = NaiveDate::parse_from_str(&env_or("MIGRATION_START_DATE", "2026-01-01"), "%Y-%m-%d")
            .context("MIGRATION_START_DATE must be YYYY-MM-DD")?;

        let batch_size = env_or("BATCH_SIZE", "50")
            .parse::<usize>()
            .context("BATCH_SIZE must be an integer")?;
        anyhow::ensure!(batch_size >= 1, "BATCH_SIZE must be at least 1");

        Ok(MigrationConfig {
            company_id,
            start_date,
            batch_size,
            tracking_db: env_or("TRACKING_DB", "tracking.db").into(),
            reference_file: env_or("REFERENCE_FILE", "mappings.json").into(),
            error_report_limit: 10,
        })
    }

    /// Date frontier in the wire format queries expect.
    pub fn start_date_str(&self) -> String {
        self.start_date.format("%Y-%m-%d").to_string()
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            company_id: 1,
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            batch_size: 50,
            tracking_db: "tracking.db".into(),
            reference_file: "mappings.json".into(),
            error_report_limit: 10,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scope() {
        let config = MigrationConfig::default();
        assert_eq!(config.company_id, 1);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.start_date_str(), "2026-01-01");
    }
}
