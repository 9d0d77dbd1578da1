//! Header normalization rules (`mapping`)

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::MappingRule;
use sqlx::{Row, SqlitePool};

pub async fn list_mappings(pool: &SqlitePool) -> ArchiveResult<Vec<MappingRule>> {
    let rows = sqlx::query(
        "SELECT id, card, current_value, replacement, is_default FROM mapping ORDER BY card, is_default, current_value",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> ArchiveResult<MappingRule> {
            Ok(MappingRule {
                id: row.try_get("id")?,
                card: row.try_get("card")?,
                current: row.try_get("current_value")?,
                replacement: row.try_get("replacement")?,
                is_default: row.try_get("is_default")?,
            })
        })
        .collect()
}

/// Add a rule; a second exact rule or default for the same card is refused
pub async fn add_mapping(
    pool: &SqlitePool,
    card: &str,
    current: Option<&str>,
    replacement: &str,
    is_default: bool,
) -> ArchiveResult<i64> {
    let card = card.trim().to_ascii_uppercase();
    if card.is_empty() {
        return Err(ArchiveError::InvalidInput("mapping card must not be empty".to_string()));
    }
    if !is_default && current.is_none() {
        return Err(ArchiveError::InvalidInput(format!(
            "mapping for {} needs a current value unless it is the default",
            card
        )));
    }

    if is_default {
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mapping WHERE card = ? AND is_default = 1")
                .bind(&card)
                .fetch_one(pool)
                .await?;
        if existing > 0 {
            return Err(ArchiveError::InvalidInput(format!(
                "card {} already has a default mapping",
                card
            )));
        }
    }

    let result = sqlx::query(
        "INSERT INTO mapping (card, current_value, replacement, is_default) VALUES (?, ?, ?, ?)",
    )
    .bind(&card)
    .bind(current.map(str::trim))
    .bind(replacement.trim())
    .bind(is_default)
    .execute(pool)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE constraint failed") => {
            Err(ArchiveError::InvalidInput(format!(
                "card {} already maps '{}'",
                card,
                current.unwrap_or_default()
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn remove_mapping(pool: &SqlitePool, id: i64) -> ArchiveResult<bool> {
    let result = sqlx::query("DELETE FROM mapping WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}
