//! Variable star targets (`variablestars`)

use super::{format_ts, parse_ts};
use crate::error::ArchiveResult;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteExecutor, SqlitePool};

/// Create the target on first reference, otherwise refresh its timestamp
///
/// Returns `true` when the target was new.
pub async fn touch(pool: &SqlitePool, name: &str, now: &DateTime<Utc>) -> ArchiveResult<bool> {
    let existed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM variablestars WHERE target_name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO variablestars (target_name, created_at) VALUES (?, ?)
        ON CONFLICT(target_name) DO UPDATE SET created_at = excluded.created_at
        "#,
    )
    .bind(name)
    .bind(format_ts(now))
    .execute(pool)
    .await?;

    Ok(existed == 0)
}

pub async fn is_variable_star<'e>(executor: impl SqliteExecutor<'e>, name: &str) -> ArchiveResult<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM variablestars WHERE target_name = ?")
        .bind(name)
        .fetch_one(executor)
        .await?;
    Ok(count > 0)
}

pub async fn list(pool: &SqlitePool) -> ArchiveResult<Vec<(String, DateTime<Utc>)>> {
    let rows = sqlx::query("SELECT target_name, created_at FROM variablestars ORDER BY target_name")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| -> ArchiveResult<(String, DateTime<Utc>)> {
            let created: String = row.try_get("created_at")?;
            Ok((row.try_get("target_name")?, parse_ts(&created)?))
        })
        .collect()
}
