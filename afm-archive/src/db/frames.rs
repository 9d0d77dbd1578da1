//! Frame persistence (`fitsfile`)

use super::{format_ts, parse_opt_ts};
use crate::error::ArchiveResult;
use crate::models::{
    Acquisition, CalibrationRefs, CalibrationState, ContentHash, Frame, FrameFilter, FrameHeader,
    MasterId, QualityMetrics, SessionId, TierState,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use std::path::{Path, PathBuf};

const FRAME_COLUMNS: &str = r#"
    content_hash, path, frame_type, session_id, object_name, date_obs,
    telescope, instrument, filter_name, exposure, binning_x, binning_y,
    ccd_temp, gain, sensor_offset, observer, notes,
    avg_fwhm, avg_eccentricity, avg_hfr, image_snr, star_count, image_scale,
    calibration_date, master_bias_ref, master_dark_ref, master_flat_ref,
    original_file_ref, original_cloud_url,
    tier_state, pending_location, cloud_url, file_size, created_at
"#;

fn opt_master(value: Option<String>) -> ArchiveResult<Option<MasterId>> {
    value.as_deref().map(MasterId::from_stored).transpose()
}

pub(crate) fn frame_from_row(row: &SqliteRow) -> ArchiveResult<Frame> {
    let session_id: Option<String> = row.try_get("session_id")?;
    let frame_type: String = row.try_get("frame_type")?;
    let path: String = row.try_get("path")?;

    Ok(Frame {
        hash: ContentHash::from_stored(row.try_get("content_hash")?),
        path: PathBuf::from(path),
        frame_type: frame_type.parse()?,
        session_id: session_id.as_deref().map(SessionId::from_stored).transpose()?,
        object_name: row.try_get("object_name")?,
        date_obs: parse_opt_ts(row.try_get("date_obs")?)?,
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
        observer: row.try_get("observer")?,
        notes: row.try_get("notes")?,
        quality: QualityMetrics {
            avg_fwhm: row.try_get("avg_fwhm")?,
            avg_eccentricity: row.try_get("avg_eccentricity")?,
            avg_hfr: row.try_get("avg_hfr")?,
            image_snr: row.try_get("image_snr")?,
            star_count: row.try_get("star_count")?,
            image_scale: row.try_get("image_scale")?,
        },
        calibration: CalibrationState {
            calibration_date: parse_opt_ts(row.try_get("calibration_date")?)?,
            masters: CalibrationRefs {
                bias: opt_master(row.try_get("master_bias_ref")?)?,
                dark: opt_master(row.try_get("master_dark_ref")?)?,
                flat: opt_master(row.try_get("master_flat_ref")?)?,
            },
            original_file_ref: row
                .try_get::<Option<String>, _>("original_file_ref")?
                .map(ContentHash::from_stored),
            original_cloud_url: row.try_get("original_cloud_url")?,
        },
        tier: TierState::from_columns(
            &row.try_get::<String, _>("tier_state")?,
            row.try_get("pending_location")?,
            row.try_get("cloud_url")?,
        )?,
        file_size: row.try_get("file_size")?,
        created_at: parse_opt_ts(row.try_get("created_at")?)?,
    })
}

pub async fn load_frame(pool: &SqlitePool, hash: &ContentHash) -> ArchiveResult<Option<Frame>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM fitsfile WHERE content_hash = ?",
        FRAME_COLUMNS
    ))
    .bind(hash.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(frame_from_row).transpose()
}

/// Frames of one session in content-hash order
pub async fn load_session_frames(pool: &SqlitePool, session_id: SessionId) -> ArchiveResult<Vec<Frame>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM fitsfile WHERE session_id = ? ORDER BY content_hash",
        FRAME_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(frame_from_row).collect()
}

/// One page of frames matching `filter`, keyset-paginated on content hash
pub async fn load_frames_page(
    pool: &SqlitePool,
    filter: &FrameFilter,
    after: Option<&ContentHash>,
    limit: i64,
) -> ArchiveResult<Vec<Frame>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM fitsfile WHERE 1 = 1", FRAME_COLUMNS));

    if let Some(session_id) = filter.session_id {
        qb.push(" AND session_id = ").push_bind(session_id.to_string());
    }
    if let Some(frame_type) = filter.frame_type {
        qb.push(" AND frame_type = ").push_bind(frame_type.as_str());
    }
    match filter.calibrated {
        Some(true) => {
            qb.push(" AND calibration_date IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND calibration_date IS NULL");
        }
        None => {}
    }
    if let Some(soft_deleted) = filter.soft_deleted {
        qb.push(" AND soft_delete = ").push_bind(soft_deleted);
    }
    if let Some(after) = after {
        qb.push(" AND content_hash > ").push_bind(after.as_str().to_string());
    }
    qb.push(" ORDER BY content_hash LIMIT ").push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(frame_from_row).collect()
}

/// Insert a newly ingested frame unless its content is already catalogued
///
/// Returns `false` when a row with the same content hash already exists.
pub async fn insert_frame_if_absent<'e>(
    executor: impl SqliteExecutor<'e>,
    hash: &ContentHash,
    path: &Path,
    header: &FrameHeader,
    session_id: SessionId,
    file_size: Option<i64>,
    now: &DateTime<Utc>,
) -> ArchiveResult<bool> {
    let acq = &header.acquisition;
    let q = &header.quality;

    let result = sqlx::query(
        r#"
        INSERT INTO fitsfile (
            content_hash, path, frame_type, session_id, object_name, date_obs,
            telescope, instrument, filter_name, exposure, binning_x, binning_y,
            ccd_temp, gain, sensor_offset, observer, notes,
            avg_fwhm, avg_eccentricity, avg_hfr, image_snr, star_count, image_scale,
            file_size, tier_state, soft_delete, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'local', 0, ?)
        ON CONFLICT(content_hash) DO NOTHING
        "#,
    )
    .bind(hash.as_str())
    .bind(path.to_string_lossy().to_string())
    .bind(header.frame_type.as_str())
    .bind(session_id.to_string())
    .bind(&header.object_name)
    .bind(header.date_obs.as_ref().map(format_ts))
    .bind(&acq.telescope)
    .bind(&acq.instrument)
    .bind(&acq.filter)
    .bind(acq.exposure)
    .bind(acq.binning_x)
    .bind(acq.binning_y)
    .bind(acq.ccd_temp)
    .bind(acq.gain)
    .bind(acq.offset)
    .bind(&header.observer)
    .bind(&header.notes)
    .bind(q.avg_fwhm)
    .bind(q.avg_eccentricity)
    .bind(q.avg_hfr)
    .bind(q.image_snr)
    .bind(q.star_count)
    .bind(q.image_scale)
    .bind(file_size)
    .bind(format_ts(now))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record where the bytes of a catalogued frame now live
pub async fn update_frame_path(pool: &SqlitePool, hash: &ContentHash, path: &Path) -> ArchiveResult<()> {
    sqlx::query("UPDATE fitsfile SET path = ? WHERE content_hash = ?")
        .bind(path.to_string_lossy().to_string())
        .bind(hash.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Catalog a calibrated derivative, inheriting acquisition metadata and
/// session from its original
///
/// Returns `false` when the derived content is already catalogued.
pub async fn insert_calibrated_frame(
    conn: &mut SqliteConnection,
    original: &ContentHash,
    derived: &ContentHash,
    derived_path: &Path,
    masters: &CalibrationRefs,
    file_size: Option<i64>,
    now: &DateTime<Utc>,
) -> ArchiveResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO fitsfile (
            content_hash, path, frame_type, session_id, object_name, date_obs,
            telescope, instrument, filter_name, exposure, binning_x, binning_y,
            ccd_temp, gain, sensor_offset, observer, notes,
            avg_fwhm, avg_eccentricity, avg_hfr, image_snr, star_count, image_scale,
            calibration_date, master_bias_ref, master_dark_ref, master_flat_ref,
            original_file_ref, original_cloud_url,
            file_size, tier_state, soft_delete, created_at
        )
        SELECT ?, ?, frame_type, session_id, object_name, date_obs,
            telescope, instrument, filter_name, exposure, binning_x, binning_y,
            ccd_temp, gain, sensor_offset, observer, notes,
            avg_fwhm, avg_eccentricity, avg_hfr, image_snr, star_count, image_scale,
            ?, ?, ?, ?,
            content_hash, cloud_url,
            ?, 'local', 0, ?
        FROM fitsfile WHERE content_hash = ?
        ON CONFLICT(content_hash) DO NOTHING
        "#,
    )
    .bind(derived.as_str())
    .bind(derived_path.to_string_lossy().to_string())
    .bind(format_ts(now))
    .bind(masters.bias.map(|id| id.to_string()))
    .bind(masters.dark.map(|id| id.to_string()))
    .bind(masters.flat.map(|id| id.to_string()))
    .bind(file_size)
    .bind(format_ts(now))
    .bind(original.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Copy a newly verified original's URL onto its calibrated derivatives
pub async fn propagate_original_cloud_url(
    conn: &mut SqliteConnection,
    original: &ContentHash,
    url: &str,
) -> ArchiveResult<u64> {
    let result = sqlx::query("UPDATE fitsfile SET original_cloud_url = ? WHERE original_file_ref = ?")
        .bind(url)
        .bind(original.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_frames(pool: &SqlitePool) -> ArchiveResult<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM fitsfile")
        .fetch_one(pool)
        .await?)
}
