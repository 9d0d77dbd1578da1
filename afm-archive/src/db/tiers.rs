//! Tier state columns shared by `fitsfile` and `masters`
//!
//! Every transition is a single conditional UPDATE guarded on the expected
//! prior state, so a concurrent transition makes the guard fail instead of
//! being overwritten.

use crate::error::ArchiveResult;
use crate::models::{ContentHash, Subject, TierState};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::PathBuf;

/// Tiering view of a frame or master
#[derive(Debug, Clone)]
pub struct TierRecord {
    pub state: TierState,
    pub path: PathBuf,
    pub hash: ContentHash,
}

pub async fn load_tier_record(pool: &SqlitePool, subject: &Subject) -> ArchiveResult<Option<TierRecord>> {
    let hash_column = match subject {
        Subject::Frame(_) => "content_hash",
        Subject::Master(_) => "hash",
    };
    let row = sqlx::query(&format!(
        "SELECT tier_state, pending_location, cloud_url, path, {} AS hash FROM {} WHERE {} = ?",
        hash_column,
        subject.table(),
        subject.key_column()
    ))
    .bind(subject.key())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let path: String = row.try_get("path")?;
    Ok(Some(TierRecord {
        state: TierState::from_columns(
            &row.try_get::<String, _>("tier_state")?,
            row.try_get("pending_location")?,
            row.try_get("cloud_url")?,
        )?,
        path: PathBuf::from(path),
        hash: ContentHash::from_stored(row.try_get("hash")?),
    }))
}

/// `Local | CloudPending -> CloudPending { location }`
pub async fn mark_pending(pool: &SqlitePool, subject: &Subject, location: &str) -> ArchiveResult<bool> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE {} SET tier_state = 'cloud_pending', pending_location = ?
        WHERE {} = ? AND tier_state IN ('local', 'cloud_pending')
        "#,
        subject.table(),
        subject.key_column()
    ))
    .bind(location)
    .bind(subject.key())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `CloudPending { location } -> CloudVerified { url: location }`
pub async fn mark_verified(
    conn: &mut SqliteConnection,
    subject: &Subject,
    location: &str,
) -> ArchiveResult<bool> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE {} SET tier_state = 'cloud_verified', cloud_url = ?, pending_location = NULL
        WHERE {} = ? AND tier_state = 'cloud_pending' AND pending_location = ?
        "#,
        subject.table(),
        subject.key_column()
    ))
    .bind(location)
    .bind(subject.key())
    .bind(location)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `CloudVerified { url } -> SoftDeleted { url }`
pub async fn mark_soft_deleted(pool: &SqlitePool, subject: &Subject, url: &str) -> ArchiveResult<bool> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE {} SET tier_state = 'soft_deleted', soft_delete = 1
        WHERE {} = ? AND tier_state = 'cloud_verified' AND cloud_url = ?
        "#,
        subject.table(),
        subject.key_column()
    ))
    .bind(subject.key())
    .bind(url)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Undo a soft delete whose local removal failed
pub async fn revert_soft_delete(pool: &SqlitePool, subject: &Subject) -> ArchiveResult<()> {
    sqlx::query(&format!(
        "UPDATE {} SET tier_state = 'cloud_verified', soft_delete = 0 WHERE {} = ? AND tier_state = 'soft_deleted'",
        subject.table(),
        subject.key_column()
    ))
    .bind(subject.key())
    .execute(pool)
    .await?;
    Ok(())
}
