// PostgreSQL implementations of the coordinator primitives. Each operation is
// a single statement so concurrent gateways never interleave read and write.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

pub(super) async fn set_if_absent(pool: &PgPool, key: &str, ttl: Duration) -> Result<bool> {
    let claimed = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO coordinator_keys (key, expires_at)
        VALUES ($1, now() + make_interval(secs => $2))
        ON CONFLICT (key) DO UPDATE
            SET expires_at = EXCLUDED.expires_at
            WHERE coordinator_keys.expires_at <= now()
        RETURNING key
        "#,
    )
    .bind(key)
    .bind(ttl.as_secs_f64())
    .fetch_optional(pool)
    .await
    .context("failed to claim coordinator key")?;

    Ok(claimed.is_some())
}

pub(super) async fn release(pool: &PgPool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM coordinator_keys WHERE key = $1")
        .bind(key)
        .execute(pool)
        .await
        .context("failed to release coordinator key")?;
    Ok(())
}

pub(super) async fn increment_with_expiry(
    pool: &PgPool,
    key: &str,
    window: Duration,
) -> Result<(u64, Duration)> {
    let (count, ttl_ms) = sqlx::query_as::<_, (i64, i64)>(
        r#"
        INSERT INTO coordinator_counters (key, count, expires_at)
        VALUES ($1, 1, now() + make_interval(secs => $2))
        ON CONFLICT (key) DO UPDATE SET
            count = CASE
                WHEN coordinator_counters.expires_at <= now() THEN 1
                ELSE coordinator_counters.count + 1
            END,
            expires_at = CASE
                WHEN coordinator_counters.expires_at <= now() THEN EXCLUDED.expires_at
                ELSE coordinator_counters.expires_at
            END
        RETURNING
            count,
            GREATEST(0, EXTRACT(EPOCH FROM (expires_at - now())) * 1000)::BIGINT
        "#,
    )
    .bind(key)
    .bind(window.as_secs_f64())
    .fetch_one(pool)
    .await
    .context("failed to increment coordinator counter")?;

    Ok((count.max(0) as u64, Duration::from_millis(ttl_ms.max(0) as u64)))
}

pub(super) async fn evict_expired(pool: &PgPool) -> Result<u64> {
    let keys = sqlx::query("DELETE FROM coordinator_keys WHERE expires_at <= now()")
        .execute(pool)
        .await
        .context("failed to evict expired coordinator keys")?
        .rows_affected();
    let counters = sqlx::query("DELETE FROM coordinator_counters WHERE expires_at <= now()")
        .execute(pool)
        .await
        .context("failed to evict expired coordinator counters")?
        .rows_affected();
    Ok(keys + counters)
}
