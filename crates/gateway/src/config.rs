// Gateway server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::coordinator::BucketSpec;

pub const DEV_JWT_SECRET: &str = "tandem_local_development_jwt_secret_must_be_32_chars";

const DEFAULT_CONNECTION_LIMIT: u32 = 100;
const DEFAULT_CONNECTION_WINDOW_SECS: u64 = 60;
const DEFAULT_MESSAGE_LIMIT: u32 = 300;
const DEFAULT_MESSAGE_WINDOW_SECS: u64 = 60;
const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 300;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Core gateway configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret for bearer credentials.
    pub jwt_secret: String,
    /// Shared coordinator database. `None` keeps counters in process memory,
    /// which is only correct for a single gateway instance.
    pub database_url: Option<String>,
    /// Connection attempts allowed per client IP.
    pub connection_limit: BucketSpec,
    /// Messages allowed per authenticated user.
    pub message_limit: BucketSpec,
    /// Lifetime of a (user, requestId) idempotency record.
    pub idempotency_ttl: Duration,
    /// Upper bound on admission work before the upgrade is refused.
    pub handshake_timeout: Duration,
    /// Trust the left-most `X-Forwarded-For` entry as the client IP.
    pub trust_forwarded_for: bool,
    /// How often expired coordinator records are purged.
    pub sweep_interval: Duration,
    /// Log filter directive (e.g. `info`, `tandem_gateway=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_GATEWAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_GATEWAY_PORT` | `8080` |
    /// | `TANDEM_GATEWAY_JWT_SECRET` | dev-only placeholder |
    /// | `TANDEM_GATEWAY_DATABASE_URL` | *(none: in-memory coordinator)* |
    /// | `TANDEM_GATEWAY_CONNECTION_LIMIT` | `100` |
    /// | `TANDEM_GATEWAY_CONNECTION_WINDOW_SECS` | `60` |
    /// | `TANDEM_GATEWAY_MESSAGE_LIMIT` | `300` |
    /// | `TANDEM_GATEWAY_MESSAGE_WINDOW_SECS` | `60` |
    /// | `TANDEM_GATEWAY_IDEMPOTENCY_TTL_SECS` | `300` |
    /// | `TANDEM_GATEWAY_HANDSHAKE_TIMEOUT_MS` | `5000` |
    /// | `TANDEM_GATEWAY_TRUST_FORWARDED_FOR` | `false` |
    /// | `TANDEM_GATEWAY_SWEEP_INTERVAL_SECS` | `60` |
    /// | `TANDEM_GATEWAY_LOG_FILTER` | `info` |
    /// | `TANDEM_GATEWAY_LOG_FORMAT` | `pretty` (`json` for structured output) |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|value| value.trim().parse::<u64>().ok());

        let host = env("TANDEM_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = env("TANDEM_GATEWAY_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("TANDEM_GATEWAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("TANDEM_GATEWAY_DATABASE_URL").ok().filter(|v| !v.is_empty());

        let connection_limit = BucketSpec::new(
            parsed("TANDEM_GATEWAY_CONNECTION_LIMIT")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_CONNECTION_LIMIT),
            Duration::from_secs(
                parsed("TANDEM_GATEWAY_CONNECTION_WINDOW_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(DEFAULT_CONNECTION_WINDOW_SECS),
            ),
        );
        let message_limit = BucketSpec::new(
            parsed("TANDEM_GATEWAY_MESSAGE_LIMIT")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MESSAGE_LIMIT),
            Duration::from_secs(
                parsed("TANDEM_GATEWAY_MESSAGE_WINDOW_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(DEFAULT_MESSAGE_WINDOW_SECS),
            ),
        );

        let idempotency_ttl = Duration::from_secs(
            parsed("TANDEM_GATEWAY_IDEMPOTENCY_TTL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_IDEMPOTENCY_TTL_SECS),
        );
        let handshake_timeout = Duration::from_millis(
            parsed("TANDEM_GATEWAY_HANDSHAKE_TIMEOUT_MS")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        );
        let sweep_interval = Duration::from_secs(
            parsed("TANDEM_GATEWAY_SWEEP_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let trust_forwarded_for = env("TANDEM_GATEWAY_TRUST_FORWARDED_FOR")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let log_filter = env("TANDEM_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TANDEM_GATEWAY_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            connection_limit,
            message_limit,
            idempotency_ttl,
            handshake_timeout,
            trust_forwarded_for,
            sweep_interval,
            log_filter,
            log_format,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = GatewayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.connection_limit, BucketSpec::new(100, Duration::from_secs(60)));
        assert_eq!(cfg.message_limit, BucketSpec::new(300, Duration::from_secs(60)));
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(300));
        assert_eq!(cfg.handshake_timeout, Duration::from_millis(5_000));
        assert!(!cfg.trust_forwarded_for);
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_HOST", "127.0.0.1");
        m.insert("TANDEM_GATEWAY_PORT", "3000");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_PORT", "not_a_number");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn rate_limits_override() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_CONNECTION_LIMIT", "5");
        m.insert("TANDEM_GATEWAY_CONNECTION_WINDOW_SECS", "10");
        m.insert("TANDEM_GATEWAY_MESSAGE_LIMIT", "20");
        m.insert("TANDEM_GATEWAY_MESSAGE_WINDOW_SECS", "30");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.connection_limit, BucketSpec::new(5, Duration::from_secs(10)));
        assert_eq!(cfg.message_limit, BucketSpec::new(20, Duration::from_secs(30)));
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_MESSAGE_LIMIT", "0");
        m.insert("TANDEM_GATEWAY_IDEMPOTENCY_TTL_SECS", "0");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.message_limit.limit, 300);
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(300));
    }

    #[test]
    fn empty_database_url_means_memory_coordinator() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_DATABASE_URL", "");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn forwarded_for_and_json_logs() {
        let mut m = HashMap::new();
        m.insert("TANDEM_GATEWAY_TRUST_FORWARDED_FOR", "TRUE");
        m.insert("TANDEM_GATEWAY_LOG_FORMAT", "json");
        m.insert("TANDEM_GATEWAY_LOG_FILTER", "debug,tower_http=trace");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.trust_forwarded_for);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
