//! Session persistence (`fitssession`)

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::ArchiveResult;
use crate::models::{
    CalibrationKey, CalibrationRole, FrameType, RoleState, Session, SessionId, SessionKey,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor, SqlitePool};

const SESSION_COLUMNS: &str = r#"
    id, date, object_name, frame_type, telescope, instrument, filter_name,
    is_auto_calibration,
    auto_cal_bias_session_id, auto_cal_dark_session_id, auto_cal_flat_session_id,
    master_bias_created, master_dark_created, master_flat_created,
    is_variable_star, last_frame_at, created_at
"#;

fn role_state(row: &SqliteRow, role: CalibrationRole) -> ArchiveResult<RoleState> {
    let auto_cal: Option<String> = row.try_get(role.auto_cal_column())?;
    Ok(RoleState {
        auto_cal_session: auto_cal.as_deref().map(SessionId::from_stored).transpose()?,
        master_created: row.try_get(role.created_column())?,
    })
}

fn session_from_row(row: &SqliteRow) -> ArchiveResult<Session> {
    let id: String = row.try_get("id")?;
    let frame_type: String = row.try_get("frame_type")?;
    let date = parse_ts(&row.try_get::<String, _>("date")?)?;

    Ok(Session {
        id: SessionId::from_stored(&id)?,
        date,
        object_name: row.try_get("object_name")?,
        frame_type: frame_type.parse()?,
        telescope: row.try_get("telescope")?,
        instrument: row.try_get("instrument")?,
        filter: row.try_get("filter_name")?,
        is_auto_calibration: row.try_get("is_auto_calibration")?,
        bias: role_state(row, CalibrationRole::Bias)?,
        dark: role_state(row, CalibrationRole::Dark)?,
        flat: role_state(row, CalibrationRole::Flat)?,
        is_variable_star: row.try_get("is_variable_star")?,
        // Rows from older builds lack these; fall back to the session date
        last_frame_at: parse_opt_ts(row.try_get("last_frame_at")?)?.unwrap_or(date),
        created_at: parse_opt_ts(row.try_get("created_at")?)?.unwrap_or(date),
    })
}

pub async fn load_session<'e>(executor: impl SqliteExecutor<'e>, id: SessionId) -> ArchiveResult<Option<Session>> {
    let row = sqlx::query(&format!("SELECT {} FROM fitssession WHERE id = ?", SESSION_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(session_from_row).transpose()
}

/// All sessions, newest observation first, optionally limited to one type
pub async fn list_sessions(
    pool: &SqlitePool,
    frame_type: Option<FrameType>,
) -> ArchiveResult<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM fitssession WHERE (? IS NULL OR frame_type = ?) ORDER BY date DESC, id",
        SESSION_COLUMNS
    ))
    .bind(frame_type.map(|t| t.as_str()))
    .bind(frame_type.map(|t| t.as_str()))
    .fetch_all(pool)
    .await?;

    rows.iter().map(session_from_row).collect()
}

/// Most recently created session the key may join
///
/// Lights must share target, instrument and filter; calibration frames only
/// instrument and filter. The frame must lie within `window` of the
/// session's latest frame.
pub async fn find_open_session<'e>(
    executor: impl SqliteExecutor<'e>,
    key: &SessionKey,
    window: Duration,
) -> ArchiveResult<Option<Session>> {
    let lower = format_ts(&(key.observed_at - window));
    let upper = format_ts(&(key.observed_at + window));
    let is_light = key.frame_type == FrameType::Light;

    let row = sqlx::query(&format!(
        r#"
        SELECT {} FROM fitssession
        WHERE frame_type = ?
          AND instrument IS ?
          AND filter_name IS ?
          AND (? = 0 OR object_name IS ?)
          AND last_frame_at BETWEEN ? AND ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#,
        SESSION_COLUMNS
    ))
    .bind(key.frame_type.as_str())
    .bind(&key.instrument)
    .bind(&key.filter)
    .bind(is_light)
    .bind(&key.object_name)
    .bind(lower)
    .bind(upper)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(session_from_row).transpose()
}

pub async fn insert_session<'e>(executor: impl SqliteExecutor<'e>, session: &Session) -> ArchiveResult<()> {
    sqlx::query(
        r#"
        INSERT INTO fitssession (
            id, date, object_name, frame_type, telescope, instrument, filter_name,
            is_auto_calibration, is_variable_star, last_frame_at, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.id.to_string())
    .bind(format_ts(&session.date))
    .bind(&session.object_name)
    .bind(session.frame_type.as_str())
    .bind(&session.telescope)
    .bind(&session.instrument)
    .bind(&session.filter)
    .bind(session.is_auto_calibration)
    .bind(session.is_variable_star)
    .bind(format_ts(&session.last_frame_at))
    .bind(format_ts(&session.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

/// Extend a session to cover a newly assigned frame
pub async fn extend_session<'e>(
    executor: impl SqliteExecutor<'e>,
    id: SessionId,
    observed_at: &DateTime<Utc>,
) -> ArchiveResult<()> {
    let ts = format_ts(observed_at);
    sqlx::query(
        r#"
        UPDATE fitssession SET
            last_frame_at = MAX(last_frame_at, ?),
            date = MIN(date, ?)
        WHERE id = ?
        "#,
    )
    .bind(&ts)
    .bind(&ts)
    .bind(id.to_string())
    .execute(executor)
    .await?;
    Ok(())
}

/// Cache a successful resolution on the light session
pub async fn record_resolution(
    pool: &SqlitePool,
    light: SessionId,
    role: CalibrationRole,
    calibration: SessionId,
) -> ArchiveResult<()> {
    sqlx::query(&format!(
        "UPDATE fitssession SET {} = 1, {} = ?, is_auto_calibration = 1 WHERE id = ?",
        role.created_column(),
        role.auto_cal_column()
    ))
    .bind(calibration.to_string())
    .bind(light.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark that a master of `role` exists for `session`; never clears the flag
pub async fn mark_master_created<'e>(
    executor: impl SqliteExecutor<'e>,
    session: SessionId,
    role: CalibrationRole,
) -> ArchiveResult<()> {
    sqlx::query(&format!(
        "UPDATE fitssession SET {} = 1 WHERE id = ?",
        role.created_column()
    ))
    .bind(session.to_string())
    .execute(executor)
    .await?;
    Ok(())
}

/// Clear a created flag; returns `false` if the flag was not set
pub async fn clear_master_created(
    pool: &SqlitePool,
    session: SessionId,
    role: CalibrationRole,
) -> ArchiveResult<bool> {
    let column = role.created_column();
    let result = sqlx::query(&format!(
        "UPDATE fitssession SET {column} = 0 WHERE id = ? AND {column} = 1"
    ))
    .bind(session.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Store an operator-chosen calibration session on a light session
pub async fn set_auto_cal_session(
    pool: &SqlitePool,
    light: SessionId,
    role: CalibrationRole,
    calibration: Option<SessionId>,
) -> ArchiveResult<()> {
    sqlx::query(&format!(
        "UPDATE fitssession SET {} = ?, is_auto_calibration = ? WHERE id = ?",
        role.auto_cal_column()
    ))
    .bind(calibration.map(|id| id.to_string()))
    .bind(calibration.is_some())
    .bind(light.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Best unprocessed calibration session for `role` matching `key`
///
/// Nearest date to `light_date` wins; equidistant candidates fall back to
/// the earlier date, then to the smallest frame content hash, so the choice
/// does not depend on the order frames were ingested.
pub async fn find_calibration_session(
    pool: &SqlitePool,
    role: CalibrationRole,
    key: &CalibrationKey,
    light_date: &DateTime<Utc>,
) -> ArchiveResult<Option<SessionId>> {
    let created = role.created_column();
    let id: Option<String> = sqlx::query_scalar(&format!(
        r#"
        SELECT s.id FROM fitssession s
        WHERE s.frame_type = ?
          AND s.{created} = 0
          AND s.telescope IS ?
          AND s.instrument IS ?
          AND (? = 0 OR s.filter_name IS ?)
          AND EXISTS (
              SELECT 1 FROM fitsfile f
              WHERE f.session_id = s.id
                AND f.soft_delete = 0
                AND f.binning_x IS ?
                AND f.binning_y IS ?
                AND (? = 0 OR (f.exposure IS NULL AND ? IS NULL) OR ABS(f.exposure - ?) < 0.001)
          )
        ORDER BY ABS(julianday(s.date) - julianday(?)) ASC,
                 s.date ASC,
                 (SELECT MIN(f.content_hash) FROM fitsfile f WHERE f.session_id = s.id) ASC
        LIMIT 1
        "#
    ))
    .bind(role.frame_type().as_str())
    .bind(&key.telescope)
    .bind(&key.instrument)
    .bind(role.matches_filter())
    .bind(&key.filter)
    .bind(key.binning_x)
    .bind(key.binning_y)
    .bind(role.matches_exposure())
    .bind(key.exposure)
    .bind(key.exposure)
    .bind(format_ts(light_date))
    .fetch_optional(pool)
    .await?;

    id.as_deref().map(SessionId::from_stored).transpose()
}

/// Ids of every light session, oldest first
pub async fn light_session_ids(pool: &SqlitePool) -> ArchiveResult<Vec<SessionId>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM fitssession WHERE frame_type = 'light' ORDER BY date, id")
            .fetch_all(pool)
            .await?;
    ids.iter().map(|id| SessionId::from_stored(id)).collect()
}

/// Flag light sessions on `target` as variable-star sessions
pub async fn flag_variable_star_sessions(pool: &SqlitePool, target: &str) -> ArchiveResult<u64> {
    let result = sqlx::query(
        "UPDATE fitssession SET is_variable_star = 1 WHERE frame_type = 'light' AND object_name = ? AND is_variable_star = 0",
    )
    .bind(target)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
