//! Master persistence (`masters`)

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::ArchiveResult;
use crate::models::{
    Acquisition, CalibrationKey, CalibrationRole, ContentHash, Master, MasterId, SessionId,
    TierState,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor, SqlitePool};
use std::path::PathBuf;

const MASTER_COLUMNS: &str = r#"
    master_id, master_type, path, creation_date,
    telescope, instrument, exposure, binning_x, binning_y, ccd_temp, gain, sensor_offset, filter_name,
    source_session_id, file_count, quality_score, file_size, hash,
    is_validated, validation_date, notes,
    tier_state, pending_location, cloud_url, superseded_by
"#;

fn master_from_row(row: &SqliteRow) -> ArchiveResult<Master> {
    let id: String = row.try_get("master_id")?;
    let master_type: String = row.try_get("master_type")?;
    let path: String = row.try_get("path")?;
    let source: Option<String> = row.try_get("source_session_id")?;
    let superseded_by: Option<String> = row.try_get("superseded_by")?;

    Ok(Master {
        id: MasterId::from_stored(&id)?,
        master_type: master_type.parse()?,
        path: PathBuf::from(path),
        creation_date: parse_ts(&row.try_get::<String, _>("creation_date")?)?,
        acquisition: Acquisition {
            telescope: row.try_get("telescope")?,
            instrument: row.try_get("instrument")?,
            filter: row.try_get("filter_name")?,
            exposure: row.try_get("exposure")?,
            binning_x: row.try_get("binning_x")?,
            binning_y: row.try_get("binning_y")?,
            ccd_temp: row.try_get("ccd_temp")?,
            gain: row.try_get("gain")?,
            offset: row.try_get("sensor_offset")?,
        },
        source_session_id: source.as_deref().map(SessionId::from_stored).transpose()?,
        file_count: row.try_get("file_count")?,
        quality_score: row.try_get("quality_score")?,
        file_size: row.try_get("file_size")?,
        hash: ContentHash::from_stored(row.try_get("hash")?),
        is_validated: row.try_get("is_validated")?,
        validation_date: parse_opt_ts(row.try_get("validation_date")?)?,
        notes: row.try_get("notes")?,
        tier: TierState::from_columns(
            &row.try_get::<String, _>("tier_state")?,
            row.try_get("pending_location")?,
            row.try_get("cloud_url")?,
        )?,
        superseded_by: superseded_by.as_deref().map(MasterId::from_stored).transpose()?,
    })
}

pub async fn load_master(pool: &SqlitePool, id: MasterId) -> ArchiveResult<Option<Master>> {
    let row = sqlx::query(&format!("SELECT {} FROM masters WHERE master_id = ?", MASTER_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(master_from_row).transpose()
}

/// Live (not soft-deleted) master with this content
///
/// The match may be superseded; callers decide whether to reinstate it.
pub async fn find_live_by_hash<'e>(
    executor: impl SqliteExecutor<'e>,
    hash: &ContentHash,
) -> ArchiveResult<Option<Master>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM masters WHERE hash = ? AND soft_delete = 0 ORDER BY creation_date LIMIT 1",
        MASTER_COLUMNS
    ))
    .bind(hash.as_str())
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(master_from_row).transpose()
}

/// Current master built from `session` out of exactly `file_count` frames
pub async fn find_current_for_source(
    pool: &SqlitePool,
    session: SessionId,
    file_count: i64,
) -> ArchiveResult<Option<Master>> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {} FROM masters
        WHERE source_session_id = ? AND file_count = ?
          AND soft_delete = 0 AND superseded_by IS NULL
        ORDER BY creation_date DESC
        LIMIT 1
        "#,
        MASTER_COLUMNS
    ))
    .bind(session.to_string())
    .bind(file_count)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(master_from_row).transpose()
}

/// Best existing master for `role` and `key`
///
/// Validated masters are preferred; an unvalidated one is returned only when
/// no validated master matches. Superseded and soft-deleted masters are
/// never returned. Ties go to the creation date nearest `light_date`.
pub async fn find_best_master(
    pool: &SqlitePool,
    role: CalibrationRole,
    key: &CalibrationKey,
    light_date: &DateTime<Utc>,
) -> ArchiveResult<Option<Master>> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {} FROM masters
        WHERE master_type = ?
          AND soft_delete = 0
          AND superseded_by IS NULL
          AND telescope IS ?
          AND instrument IS ?
          AND binning_x IS ?
          AND binning_y IS ?
          AND (? = 0 OR (exposure IS NULL AND ? IS NULL) OR ABS(exposure - ?) < 0.001)
          AND (? = 0 OR filter_name IS ?)
        ORDER BY is_validated DESC,
                 ABS(julianday(creation_date) - julianday(?)) ASC,
                 creation_date ASC,
                 master_id ASC
        LIMIT 1
        "#,
        MASTER_COLUMNS
    ))
    .bind(role.as_str())
    .bind(&key.telescope)
    .bind(&key.instrument)
    .bind(key.binning_x)
    .bind(key.binning_y)
    .bind(role.matches_exposure())
    .bind(key.exposure)
    .bind(key.exposure)
    .bind(role.matches_filter())
    .bind(&key.filter)
    .bind(format_ts(light_date))
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(master_from_row).transpose()
}

/// Register a master; returns `false` if a live master with the same
/// content hash already exists
pub async fn insert_master<'e>(executor: impl SqliteExecutor<'e>, master: &Master) -> ArchiveResult<bool> {
    let acq = &master.acquisition;
    let result = sqlx::query(
        r#"
        INSERT INTO masters (
            master_id, master_type, path, creation_date,
            telescope, instrument, exposure, binning_x, binning_y, ccd_temp, gain, sensor_offset, filter_name,
            source_session_id, file_count, quality_score, file_size, hash,
            is_validated, validation_date, notes, tier_state, soft_delete
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'local', 0)
        "#,
    )
    .bind(master.id.to_string())
    .bind(master.master_type.as_str())
    .bind(master.path.to_string_lossy().to_string())
    .bind(format_ts(&master.creation_date))
    .bind(&acq.telescope)
    .bind(&acq.instrument)
    .bind(acq.exposure)
    .bind(acq.binning_x)
    .bind(acq.binning_y)
    .bind(acq.ccd_temp)
    .bind(acq.gain)
    .bind(acq.offset)
    .bind(&acq.filter)
    .bind(master.source_session_id.map(|id| id.to_string()))
    .bind(master.file_count)
    .bind(master.quality_score)
    .bind(master.file_size)
    .bind(master.hash.as_str())
    .bind(master.is_validated)
    .bind(master.validation_date.as_ref().map(format_ts))
    .bind(&master.notes)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(true),
        // Partial unique index on live hashes
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE constraint failed: masters.hash") => {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Point every other current master of `session` at `newer`
pub async fn supersede_for_source<'e>(
    executor: impl SqliteExecutor<'e>,
    session: SessionId,
    newer: MasterId,
) -> ArchiveResult<Vec<MasterId>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE masters SET superseded_by = ?
        WHERE source_session_id = ? AND master_id != ?
          AND soft_delete = 0 AND superseded_by IS NULL
        RETURNING master_id
        "#,
    )
    .bind(newer.to_string())
    .bind(session.to_string())
    .bind(newer.to_string())
    .fetch_all(executor)
    .await?;

    ids.iter().map(|id| MasterId::from_stored(id)).collect()
}

/// Make a superseded master current again
pub async fn reinstate_master<'e>(executor: impl SqliteExecutor<'e>, id: MasterId) -> ArchiveResult<()> {
    sqlx::query("UPDATE masters SET superseded_by = NULL WHERE master_id = ? AND soft_delete = 0")
        .bind(id.to_string())
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn list_masters(pool: &SqlitePool) -> ArchiveResult<Vec<Master>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM masters ORDER BY creation_date DESC, master_id",
        MASTER_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(master_from_row).collect()
}

pub async fn count_masters_for_source(pool: &SqlitePool, session: SessionId) -> ArchiveResult<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM masters WHERE source_session_id = ?")
        .bind(session.to_string())
        .fetch_one(pool)
        .await?)
}
