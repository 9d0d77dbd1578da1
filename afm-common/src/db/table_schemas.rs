//! Expected columns of every catalog table
//!
//! Keep these lists in step with the `CREATE TABLE` statements in
//! `init.rs`. A column added here is appended to older databases on startup.

use super::schema_sync::{sync_table, ColumnSpec, TableSpec};
use crate::Result;
use sqlx::SqlitePool;
use tracing::info;

pub struct SessionTable;

impl TableSpec for SessionTable {
    fn table_name() -> &'static str {
        "fitssession"
    }

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", "TEXT").primary_key(),
            ColumnSpec::new("date", "TEXT").not_null(),
            ColumnSpec::new("object_name", "TEXT"),
            ColumnSpec::new("frame_type", "TEXT").not_null(),
            ColumnSpec::new("telescope", "TEXT"),
            ColumnSpec::new("instrument", "TEXT"),
            ColumnSpec::new("filter_name", "TEXT"),
            ColumnSpec::new("is_auto_calibration", "INTEGER").not_null().default("0"),
            ColumnSpec::new("auto_cal_dark_session_id", "TEXT"),
            ColumnSpec::new("auto_cal_flat_session_id", "TEXT"),
            ColumnSpec::new("auto_cal_bias_session_id", "TEXT"),
            ColumnSpec::new("master_dark_created", "INTEGER").not_null().default("0"),
            ColumnSpec::new("master_flat_created", "INTEGER").not_null().default("0"),
            ColumnSpec::new("master_bias_created", "INTEGER").not_null().default("0"),
            ColumnSpec::new("is_variable_star", "INTEGER").not_null().default("0"),
            // Older databases grouped on `date` only
            ColumnSpec::new("last_frame_at", "TEXT").not_null().default("''"),
            ColumnSpec::new("created_at", "TEXT").not_null().default("''"),
        ]
    }
}

pub struct MasterTable;

impl TableSpec for MasterTable {
    fn table_name() -> &'static str {
        "masters"
    }

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("master_id", "TEXT").primary_key(),
            ColumnSpec::new("master_type", "TEXT").not_null(),
            ColumnSpec::new("path", "TEXT").not_null(),
            ColumnSpec::new("creation_date", "TEXT").not_null(),
            ColumnSpec::new("telescope", "TEXT"),
            ColumnSpec::new("instrument", "TEXT"),
            ColumnSpec::new("exposure", "REAL"),
            ColumnSpec::new("binning_x", "INTEGER"),
            ColumnSpec::new("binning_y", "INTEGER"),
            ColumnSpec::new("ccd_temp", "REAL"),
            ColumnSpec::new("gain", "REAL"),
            ColumnSpec::new("sensor_offset", "REAL"),
            ColumnSpec::new("filter_name", "TEXT"),
            ColumnSpec::new("source_session_id", "TEXT"),
            ColumnSpec::new("file_count", "INTEGER").not_null(),
            ColumnSpec::new("quality_score", "REAL"),
            ColumnSpec::new("file_size", "INTEGER"),
            ColumnSpec::new("hash", "TEXT").not_null(),
            ColumnSpec::new("cloud_url", "TEXT"),
            ColumnSpec::new("is_validated", "INTEGER").not_null().default("0"),
            ColumnSpec::new("validation_date", "TEXT"),
            ColumnSpec::new("notes", "TEXT"),
            ColumnSpec::new("soft_delete", "INTEGER").not_null().default("0"),
            ColumnSpec::new("tier_state", "TEXT").not_null().default("'local'"),
            ColumnSpec::new("pending_location", "TEXT"),
            ColumnSpec::new("superseded_by", "TEXT"),
        ]
    }
}

pub struct FrameTable;

impl TableSpec for FrameTable {
    fn table_name() -> &'static str {
        "fitsfile"
    }

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("content_hash", "TEXT").primary_key(),
            ColumnSpec::new("path", "TEXT").not_null(),
            ColumnSpec::new("frame_type", "TEXT").not_null(),
            ColumnSpec::new("session_id", "TEXT"),
            ColumnSpec::new("object_name", "TEXT"),
            ColumnSpec::new("date_obs", "TEXT"),
            ColumnSpec::new("telescope", "TEXT"),
            ColumnSpec::new("instrument", "TEXT"),
            ColumnSpec::new("filter_name", "TEXT"),
            ColumnSpec::new("exposure", "REAL"),
            ColumnSpec::new("binning_x", "INTEGER"),
            ColumnSpec::new("binning_y", "INTEGER"),
            ColumnSpec::new("ccd_temp", "REAL"),
            ColumnSpec::new("gain", "REAL"),
            ColumnSpec::new("sensor_offset", "REAL"),
            ColumnSpec::new("observer", "TEXT"),
            ColumnSpec::new("notes", "TEXT"),
            ColumnSpec::new("avg_fwhm", "REAL"),
            ColumnSpec::new("avg_eccentricity", "REAL"),
            ColumnSpec::new("avg_hfr", "REAL"),
            ColumnSpec::new("image_snr", "REAL"),
            ColumnSpec::new("star_count", "INTEGER"),
            ColumnSpec::new("image_scale", "REAL"),
            ColumnSpec::new("file_size", "INTEGER"),
            ColumnSpec::new("soft_delete", "INTEGER").not_null().default("0"),
            ColumnSpec::new("calibration_date", "TEXT"),
            ColumnSpec::new("master_bias_ref", "TEXT"),
            ColumnSpec::new("master_dark_ref", "TEXT"),
            ColumnSpec::new("master_flat_ref", "TEXT"),
            ColumnSpec::new("original_file_ref", "TEXT"),
            ColumnSpec::new("original_cloud_url", "TEXT"),
            ColumnSpec::new("cloud_url", "TEXT"),
            ColumnSpec::new("tier_state", "TEXT").not_null().default("'local'"),
            ColumnSpec::new("pending_location", "TEXT"),
            ColumnSpec::new("created_at", "TEXT").not_null().default("''"),
        ]
    }
}

pub struct MappingTable;

impl TableSpec for MappingTable {
    fn table_name() -> &'static str {
        "mapping"
    }

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", "INTEGER").primary_key(),
            ColumnSpec::new("card", "TEXT").not_null(),
            ColumnSpec::new("current_value", "TEXT"),
            ColumnSpec::new("replacement", "TEXT").not_null(),
            ColumnSpec::new("is_default", "INTEGER").not_null().default("0"),
        ]
    }
}

pub struct VariableStarTable;

impl TableSpec for VariableStarTable {
    fn table_name() -> &'static str {
        "variablestars"
    }

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("target_name", "TEXT").primary_key(),
            ColumnSpec::new("created_at", "TEXT").not_null().default("''"),
        ]
    }
}

/// Phase 2 of initialization: bring every table up to the expected columns
pub async fn sync_all_table_schemas(pool: &SqlitePool) -> Result<()> {
    let added = sync_table::<SessionTable>(pool).await?
        + sync_table::<MasterTable>(pool).await?
        + sync_table::<FrameTable>(pool).await?
        + sync_table::<MappingTable>(pool).await?
        + sync_table::<VariableStarTable>(pool).await?;

    if added > 0 {
        info!("Column sync added {} column(s)", added);
    }
    Ok(())
}
