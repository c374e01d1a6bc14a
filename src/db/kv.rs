//! Key-value state with optional expiry.
//!
//! Expiry is judged against the database clock. Expired rows are left in
//! place and treated as absent; writes overwrite them.

use std::time::Duration;

use serde_json::Value;

use crate::error::Result;
use crate::store::KeyPattern;

/// `expires_at` for a TTL bound as milliseconds in parameter `$n`.
fn expiry_from(n: u8) -> String {
    format!(
        "CASE WHEN ${n}::bigint IS NULL THEN NULL \
         ELSE now() + (${n}::bigint * interval '1 millisecond') END"
    )
}

const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

fn ttl_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| ttl.as_millis().min(i64::MAX as u128) as i64)
}

impl super::Db {
    pub async fn kv_fetch(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as(&format!(
            "SELECT value FROM kv_entries WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn kv_upsert(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, {})
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            expiry_from(3)
        ))
        .bind(key)
        .bind(value)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns whether a live row was removed.
    pub async fn kv_remove(&self, key: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(&format!(
            "DELETE FROM kv_entries WHERE key = $1 RETURNING {LIVE}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|(live,)| live))
    }

    pub async fn kv_remove_matching(&self, pattern: &KeyPattern) -> Result<u64> {
        let (removed,): (i64,) = sqlx::query_as(&format!(
            "WITH gone AS (
                 DELETE FROM kv_entries WHERE key LIKE $1 ESCAPE '\\' RETURNING expires_at
             )
             SELECT COUNT(*) FILTER (WHERE {LIVE}) FROM gone"
        ))
        .bind(pattern.to_sql_like())
        .fetch_one(&self.pool)
        .await?;
        Ok(removed as u64)
    }

    /// Add `by` to an integer value, treating absent or expired as 0.
    pub async fn kv_add(&self, key: &str, by: i64) -> Result<i64> {
        let (next,): (i64,) = sqlx::query_as(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, to_jsonb($2::bigint), NULL)
             ON CONFLICT (key) DO UPDATE SET
                 value = to_jsonb(
                     CASE WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now()
                          THEN 0
                          ELSE (kv_entries.value #>> '{}')::bigint
                     END + $2::bigint),
                 expires_at = CASE WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now()
                                   THEN NULL
                                   ELSE kv_entries.expires_at
                              END
             RETURNING (value #>> '{}')::bigint",
        )
        .bind(key)
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    pub async fn kv_insert_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, {})
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now()
             RETURNING key",
            expiry_from(3)
        ))
        .bind(key)
        .bind(value)
        .bind(ttl_ms(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Replace or delete a live row whose value equals `expected`.
    pub async fn kv_swap(
        &self,
        key: &str,
        expected: &Value,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let result = match value {
            Some(value) => {
                sqlx::query(&format!(
                    "UPDATE kv_entries SET value = $3, expires_at = {}
                     WHERE key = $1 AND value = $2 AND {LIVE}",
                    expiry_from(4)
                ))
                .bind(key)
                .bind(expected)
                .bind(value)
                .bind(ttl_ms(ttl))
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "DELETE FROM kv_entries WHERE key = $1 AND value = $2 AND {LIVE}"
                ))
                .bind(key)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    /// Delete and return a live row. Concurrent callers race on the row
    /// lock; exactly one sees it.
    pub async fn kv_consume(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as(&format!(
            "DELETE FROM kv_entries WHERE key = $1 AND {LIVE} RETURNING value"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }
}
