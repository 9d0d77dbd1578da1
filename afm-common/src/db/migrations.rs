//! Versioned catalog upgrades
//!
//! Column additions are handled by `schema_sync`. The steps here transform
//! data written by older builds. Each step runs inside one transaction
//! together with its `schema_version` row, so a failing step leaves the
//! database exactly as it was before the step started.
//!
//! Never edit a released step; append a new one and bump
//! `CURRENT_SCHEMA_VERSION`.

use crate::{Error, Result};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Latest applied version, 0 for a database that never recorded one
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(pool)
            .await?;
    Ok(version.unwrap_or(0))
}

/// Run every pending upgrade step in order
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current = get_schema_version(pool).await?;

    if current == CURRENT_SCHEMA_VERSION {
        info!("Catalog schema is up to date (v{})", current);
        return Ok(());
    }

    if current > CURRENT_SCHEMA_VERSION {
        warn!(
            "Catalog schema v{} is newer than this build (v{}); leaving it untouched",
            current, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!("Upgrading catalog schema: v{} -> v{}", current, CURRENT_SCHEMA_VERSION);

    for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
        apply_step(pool, version).await?;
        info!("Schema upgrade v{} applied", version);
    }

    Ok(())
}

async fn apply_step(pool: &SqlitePool, version: i32) -> Result<()> {
    let fail = |e: Error| match e {
        Error::SchemaUpgrade { .. } => e,
        other => Error::SchemaUpgrade {
            version,
            reason: other.to_string(),
        },
    };

    let mut tx = pool.begin().await.map_err(|e| fail(e.into()))?;

    let outcome = match version {
        1 => migrate_v1(&mut *tx).await,
        2 => migrate_v2(&mut *tx).await,
        3 => migrate_v3(&mut *tx).await,
        4 => migrate_v4(&mut *tx).await,
        _ => Err(Error::Internal(format!("No upgrade step for v{}", version))),
    };
    // Dropping the transaction rolls back any partial work of the step
    outcome.map_err(fail)?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| fail(e.into()))?;

    tx.commit().await.map_err(|e| fail(e.into()))?;
    Ok(())
}

async fn column_exists(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

/// Copy `legacy` into `canonical` where the canonical value is still NULL
async fn union_legacy_column(
    conn: &mut SqliteConnection,
    table: &str,
    legacy: &str,
    canonical: &str,
) -> Result<u64> {
    if !column_exists(conn, table, legacy).await? {
        return Ok(0);
    }

    let sql = format!(
        "UPDATE {table} SET {canonical} = {legacy} WHERE {canonical} IS NULL AND {legacy} IS NOT NULL"
    );
    let moved = sqlx::query(&sql).execute(&mut *conn).await?.rows_affected();
    if moved > 0 {
        info!("Carried {} value(s) from {}.{} into {}", moved, table, legacy, canonical);
    }
    Ok(moved)
}

/// v1: observer and notes were once written to per-file legacy columns
async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
    union_legacy_column(conn, "fitsfile", "file_observer", "observer").await?;
    union_legacy_column(conn, "fitsfile", "file_notes", "notes").await?;
    Ok(())
}

/// v2: image quality metrics move to their `avg_`/`image_` names
async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
    const RENAMES: &[(&str, &str)] = &[
        ("fwhm", "avg_fwhm"),
        ("eccentricity", "avg_eccentricity"),
        ("hfr", "avg_hfr"),
        ("snr", "image_snr"),
        ("stars", "star_count"),
        ("scale", "image_scale"),
    ];

    for (legacy, canonical) in RENAMES {
        union_legacy_column(conn, "fitsfile", legacy, canonical).await?;
    }
    Ok(())
}

/// v3: derive `tier_state` from the soft-delete flag and cloud URL
///
/// A soft-deleted row without a cloud copy cannot be given a valid state,
/// so the step refuses to run and names the offending rows.
async fn migrate_v3(conn: &mut SqliteConnection) -> Result<()> {
    let orphan_frames: Vec<String> = sqlx::query_scalar(
        "SELECT content_hash FROM fitsfile WHERE soft_delete = 1 AND cloud_url IS NULL ORDER BY content_hash",
    )
    .fetch_all(&mut *conn)
    .await?;
    let orphan_masters: Vec<String> = sqlx::query_scalar(
        "SELECT master_id FROM masters WHERE soft_delete = 1 AND cloud_url IS NULL ORDER BY master_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    if !orphan_frames.is_empty() || !orphan_masters.is_empty() {
        let mut offending: Vec<String> =
            orphan_frames.into_iter().map(|h| format!("frame:{}", h)).collect();
        offending.extend(orphan_masters.into_iter().map(|id| format!("master:{}", id)));
        return Err(Error::SchemaUpgrade {
            version: 3,
            reason: format!(
                "soft-deleted rows without a cloud copy: {}",
                offending.join(", ")
            ),
        });
    }

    for table in ["fitsfile", "masters"] {
        let sql = format!(
            r#"
            UPDATE {table} SET tier_state = CASE
                WHEN soft_delete = 1 THEN 'soft_deleted'
                WHEN cloud_url IS NOT NULL THEN 'cloud_verified'
                ELSE 'local'
            END
            WHERE tier_state = 'local' OR tier_state IS NULL
            "#
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

/// v4: calibration references become master ids
///
/// Older builds stored the master's file path in `master_*_ref`. Paths that
/// match a registered master are rewritten to its id; anything else is
/// recorded in the frame's notes and cleared. Auto-calibration session
/// references to sessions that no longer exist are cleared.
async fn migrate_v4(conn: &mut SqliteConnection) -> Result<()> {
    for column in ["master_bias_ref", "master_dark_ref", "master_flat_ref"] {
        let rewrite = format!(
            r#"
            UPDATE fitsfile SET {column} = (
                SELECT m.master_id FROM masters m WHERE m.path = fitsfile.{column}
                ORDER BY m.creation_date DESC LIMIT 1
            )
            WHERE {column} IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM masters m WHERE m.master_id = fitsfile.{column})
              AND EXISTS (SELECT 1 FROM masters m WHERE m.path = fitsfile.{column})
            "#
        );
        sqlx::query(&rewrite).execute(&mut *conn).await?;

        let note = format!(
            r#"
            UPDATE fitsfile SET
                notes = TRIM(COALESCE(notes, '') || ' [unresolved {column}: ' || {column} || ']'),
                {column} = NULL
            WHERE {column} IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM masters m WHERE m.master_id = fitsfile.{column})
            "#
        );
        let cleared = sqlx::query(&note).execute(&mut *conn).await?.rows_affected();
        if cleared > 0 {
            warn!("Cleared {} unresolvable {} value(s)", cleared, column);
        }
    }

    for column in [
        "auto_cal_dark_session_id",
        "auto_cal_flat_session_id",
        "auto_cal_bias_session_id",
    ] {
        let sql = format!(
            r#"
            UPDATE fitssession SET {column} = NULL
            WHERE {column} IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM fitssession s WHERE s.id = fitssession.{column})
            "#
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}
