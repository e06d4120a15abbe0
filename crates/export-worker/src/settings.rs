// Process-level worker settings
//
// Pipeline tuning lives in `ExportConfig` and `WorkerPoolConfig`; this covers
// only what the binary needs to wire them up.

use std::time::Duration;

use anyhow::{Context, Result};

/// Connection and bootstrap settings for the worker process
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Export job and work queue database
    pub database_url: String,
    pub max_connections: u32,
    /// Base URL of the upstream resource API
    pub upstream_base_url: String,
    pub upstream_timeout: Duration,
    /// Apply embedded migrations at startup
    pub run_migrations: bool,
}

impl WorkerSettings {
    /// Load settings from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL` (required)
    /// - `DB_MAX_CONNECTIONS`: connection pool size (default: 10)
    /// - `UPSTREAM_BASE_URL` (required)
    /// - `UPSTREAM_TIMEOUT_SECS`: per-request timeout (default: 30)
    /// - `RUN_MIGRATIONS`: "false" to skip migrations (default: true)
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .context("UPSTREAM_BASE_URL environment variable required")?;

        Ok(Self {
            database_url,
            max_connections: parse_var("DB_MAX_CONNECTIONS")?.unwrap_or(10),
            upstream_base_url,
            upstream_timeout: Duration::from_secs(
                parse_var("UPSTREAM_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            run_migrations: std::env::var("RUN_MIGRATIONS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {name}: {raw}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_missing_is_none() {
        let value: Option<u32> = parse_var("BULK_EXPORT_TEST_UNSET_VARIABLE").unwrap();
        assert!(value.is_none());
    }
}
