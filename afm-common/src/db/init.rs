//! Database initialization
//!
//! Startup runs in three phases:
//! 1. `CREATE TABLE IF NOT EXISTS` with the full current schema
//! 2. Declarative column synchronization for databases created by older builds
//! 3. Versioned upgrade steps for data transformations

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default SQLite busy timeout applied to every connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize the catalog database, creating it and its schema if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        // WAL allows concurrent readers alongside the single writer
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new catalog database: {}", db_path.display());
    } else {
        info!("Opened existing catalog database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    // Phase 2: add columns introduced after the database was created
    crate::db::table_schemas::sync_all_table_schemas(&pool).await?;

    create_indexes(&pool).await?;

    // Phase 3: versioned upgrade steps
    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

/// Phase 1: create every table of the current schema
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_session_table(pool).await?;
    create_masters_table(pool).await?;
    create_frame_table(pool).await?;
    create_mapping_table(pool).await?;
    create_variable_stars_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the fitssession table
///
/// One row per observing run. Auto-calibration references point at other
/// sessions; the `master_*_created` flags only ever move from 0 to 1 through
/// the resolver.
pub async fn create_session_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fitssession (
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            object_name TEXT,
            frame_type TEXT NOT NULL CHECK (frame_type IN ('light', 'dark', 'flat', 'bias')),
            telescope TEXT,
            instrument TEXT,
            filter_name TEXT,
            is_auto_calibration INTEGER NOT NULL DEFAULT 0,
            auto_cal_dark_session_id TEXT REFERENCES fitssession(id) ON DELETE SET NULL,
            auto_cal_flat_session_id TEXT REFERENCES fitssession(id) ON DELETE SET NULL,
            auto_cal_bias_session_id TEXT REFERENCES fitssession(id) ON DELETE SET NULL,
            master_dark_created INTEGER NOT NULL DEFAULT 0,
            master_flat_created INTEGER NOT NULL DEFAULT 0,
            master_bias_created INTEGER NOT NULL DEFAULT 0,
            is_variable_star INTEGER NOT NULL DEFAULT 0,
            last_frame_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the masters table
pub async fn create_masters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS masters (
            master_id TEXT PRIMARY KEY,
            master_type TEXT NOT NULL CHECK (master_type IN ('bias', 'dark', 'flat')),
            path TEXT NOT NULL,
            creation_date TEXT NOT NULL,
            telescope TEXT,
            instrument TEXT,
            exposure REAL,
            binning_x INTEGER,
            binning_y INTEGER,
            ccd_temp REAL,
            gain REAL,
            sensor_offset REAL,
            filter_name TEXT,
            source_session_id TEXT REFERENCES fitssession(id) ON DELETE SET NULL,
            file_count INTEGER NOT NULL,
            quality_score REAL,
            file_size INTEGER,
            hash TEXT NOT NULL,
            cloud_url TEXT,
            is_validated INTEGER NOT NULL DEFAULT 0,
            validation_date TEXT,
            notes TEXT,
            soft_delete INTEGER NOT NULL DEFAULT 0,
            tier_state TEXT NOT NULL DEFAULT 'local'
                CHECK (tier_state IN ('local', 'cloud_pending', 'cloud_verified', 'soft_deleted')),
            pending_location TEXT,
            superseded_by TEXT REFERENCES masters(master_id),
            CHECK (file_count > 0),
            CHECK (soft_delete = 0 OR cloud_url IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the fitsfile table
///
/// Keyed by content hash. A soft-deleted row must keep its cloud URL.
pub async fn create_frame_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fitsfile (
            content_hash TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            frame_type TEXT NOT NULL CHECK (frame_type IN ('light', 'dark', 'flat', 'bias')),
            session_id TEXT REFERENCES fitssession(id),
            object_name TEXT,
            date_obs TEXT,
            telescope TEXT,
            instrument TEXT,
            filter_name TEXT,
            exposure REAL,
            binning_x INTEGER,
            binning_y INTEGER,
            ccd_temp REAL,
            gain REAL,
            sensor_offset REAL,
            observer TEXT,
            notes TEXT,
            avg_fwhm REAL,
            avg_eccentricity REAL,
            avg_hfr REAL,
            image_snr REAL,
            star_count INTEGER,
            image_scale REAL,
            file_size INTEGER,
            soft_delete INTEGER NOT NULL DEFAULT 0,
            calibration_date TEXT,
            master_bias_ref TEXT REFERENCES masters(master_id),
            master_dark_ref TEXT REFERENCES masters(master_id),
            master_flat_ref TEXT REFERENCES masters(master_id),
            original_file_ref TEXT REFERENCES fitsfile(content_hash),
            original_cloud_url TEXT,
            cloud_url TEXT,
            tier_state TEXT NOT NULL DEFAULT 'local'
                CHECK (tier_state IN ('local', 'cloud_pending', 'cloud_verified', 'soft_deleted')),
            pending_location TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (binning_x IS NULL OR binning_x > 0),
            CHECK (binning_y IS NULL OR binning_y > 0),
            CHECK (soft_delete = 0 OR cloud_url IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the mapping table (header normalization rules)
pub async fn create_mapping_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            card TEXT NOT NULL,
            current_value TEXT,
            replacement TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            UNIQUE (card, current_value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the variablestars table
pub async fn create_variable_stars_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS variablestars (
            target_name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the lookup indexes the resolver and catalog rely on
///
/// Runs after column synchronization so indexes over newly added columns
/// can be built on databases created by older builds.
pub async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    const INDEXES: &[&str] = &[
        "CREATE INDEX IF NOT EXISTS idx_fitsfile_hash ON fitsfile(content_hash)",
        "CREATE INDEX IF NOT EXISTS idx_fitsfile_session_type ON fitsfile(session_id, frame_type)",
        "CREATE INDEX IF NOT EXISTS idx_fitsfile_original ON fitsfile(original_file_ref)",
        "CREATE INDEX IF NOT EXISTS idx_fitssession_date_object ON fitssession(date, object_name)",
        "CREATE INDEX IF NOT EXISTS idx_fitssession_grouping ON fitssession(frame_type, instrument, filter_name)",
        "CREATE INDEX IF NOT EXISTS idx_masters_lookup ON masters(telescope, instrument, master_type, soft_delete, binning_x, binning_y, exposure, filter_name)",
        "CREATE INDEX IF NOT EXISTS idx_masters_source ON masters(source_session_id, soft_delete)",
        "CREATE INDEX IF NOT EXISTS idx_mapping_card ON mapping(card)",
    ];

    for statement in INDEXES {
        sqlx::query(statement).execute(pool).await?;
    }

    // Atomic insert-if-absent primitive for content-addressed master dedup
    match sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_masters_live_hash ON masters(hash) WHERE soft_delete = 0",
    )
    .execute(pool)
    .await
    {
        Ok(_) => {}
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE constraint failed") => {
            warn!("Duplicate live master hashes present; content dedup falls back to lookup only");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
