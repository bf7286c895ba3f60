// PostgreSQL pool backing the shared coordinator.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use super::migrations::run_migrations;

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 2_000;

/// Pool sizing. Admission sits on the hot path of every connection and
/// message, so acquisition waits are kept short and fail closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();
        let min_connections = env("TANDEM_GATEWAY_DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(defaults.min_connections);
        let max_connections = env("TANDEM_GATEWAY_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_connections)
            .max(min_connections);
        let acquire_timeout = env("TANDEM_GATEWAY_DB_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.acquire_timeout);

        Self { min_connections, max_connections, acquire_timeout }
    }
}

/// Open the coordinator pool, verify it answers, and bring the schema up to date.
pub async fn connect_coordinator_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse coordinator PostgreSQL connection options")?;
    ensure_postgres_tls(&connect_options)?;

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to coordinator PostgreSQL")?;

    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&pool)
        .await
        .context("coordinator PostgreSQL health check failed")?;
    run_migrations(&pool).await?;

    Ok(pool)
}

fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "coordinator PostgreSQL connection must require TLS; got sslmode={mode:?}. Set sslmode=require (or stricter)."
        ),
    }
}
