//! Declarative column synchronization
//!
//! Each catalog table describes the columns the current build expects. On
//! startup the live table is introspected with `PRAGMA table_info` and any
//! missing column is appended with `ALTER TABLE ADD COLUMN`. Type or
//! constraint drift cannot be repaired in place by SQLite and is only
//! reported; those cases belong to a versioned upgrade step.

use crate::Result;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

/// Expected column of a catalog table
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: &'static str,
    /// SQLite declared type ("TEXT", "INTEGER", "REAL")
    pub sql_type: &'static str,
    pub not_null: bool,
    pub primary_key: bool,
    /// SQL literal used as DEFAULT when the column has to be added
    pub default_value: Option<&'static str>,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, sql_type: &'static str) -> Self {
        Self {
            name,
            sql_type,
            not_null: false,
            primary_key: false,
            default_value: None,
        }
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub const fn default(mut self, value: &'static str) -> Self {
        self.default_value = Some(value);
        self
    }

    /// `ALTER TABLE` statement adding this column
    ///
    /// SQLite refuses NOT NULL without a default on added columns, so such a
    /// column is added nullable.
    fn add_column_sql(&self, table: &str) -> String {
        let mut sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, self.name, self.sql_type);
        match (self.not_null, self.default_value) {
            (true, Some(default)) => sql.push_str(&format!(" NOT NULL DEFAULT {}", default)),
            (false, Some(default)) => sql.push_str(&format!(" DEFAULT {}", default)),
            (true, None) => {
                warn!(
                    "Column {}.{} is NOT NULL without a default; adding it nullable",
                    table, self.name
                );
            }
            (false, None) => {}
        }
        sql
    }
}

/// Live column as reported by `PRAGMA table_info`
#[derive(Debug, Clone)]
pub struct LiveColumn {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// Difference between the expected and the live shape of a table
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDrift {
    Missing(ColumnSpec),
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },
}

/// A catalog table whose columns are kept in sync on startup
pub trait TableSpec {
    fn table_name() -> &'static str;
    fn columns() -> Vec<ColumnSpec>;
}

/// Read the live columns of `table`, empty when the table does not exist
pub async fn live_columns(pool: &SqlitePool, table: &str) -> Result<Vec<LiveColumn>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| LiveColumn {
            name: row.get("name"),
            type_name: row.get("type"),
            not_null: row.get::<i32, _>("notnull") != 0,
            primary_key: row.get::<i32, _>("pk") != 0,
        })
        .collect())
}

/// Compare expected columns against live ones
pub fn diff_columns(expected: &[ColumnSpec], live: &[LiveColumn]) -> Vec<ColumnDrift> {
    expected
        .iter()
        .filter_map(|spec| match live.iter().find(|c| c.name.eq_ignore_ascii_case(spec.name)) {
            None => Some(ColumnDrift::Missing(spec.clone())),
            Some(col) if !same_affinity(spec.sql_type, &col.type_name) => {
                Some(ColumnDrift::TypeMismatch {
                    column: spec.name.to_string(),
                    expected: spec.sql_type.to_string(),
                    actual: col.type_name.clone(),
                })
            }
            Some(_) => None,
        })
        .collect()
}

/// SQLite type affinity of a declared type
fn affinity(declared: &str) -> &'static str {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        "INTEGER"
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        "TEXT"
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        "REAL"
    } else if upper.is_empty() || upper.contains("BLOB") {
        "BLOB"
    } else {
        "NUMERIC"
    }
}

fn same_affinity(expected: &str, actual: &str) -> bool {
    affinity(expected) == affinity(actual)
}

/// Add every missing column of `T`; returns the number of columns added
pub async fn sync_table<T: TableSpec>(pool: &SqlitePool) -> Result<usize> {
    let table = T::table_name();
    let live = live_columns(pool, table).await?;

    if live.is_empty() {
        warn!("Table '{}' missing during column sync", table);
        return Ok(0);
    }

    let mut added = 0;
    for drift in diff_columns(&T::columns(), &live) {
        match drift {
            ColumnDrift::Missing(spec) => {
                let sql = spec.add_column_sql(table);
                match sqlx::query(&sql).execute(pool).await {
                    Ok(_) => {
                        info!("Added column {}.{} ({})", table, spec.name, spec.sql_type);
                        added += 1;
                    }
                    // Another process initialized the same database first
                    Err(sqlx::Error::Database(db_err))
                        if db_err.message().contains("duplicate column") =>
                    {
                        debug!("Column {}.{} already added concurrently", table, spec.name);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            ColumnDrift::TypeMismatch {
                column,
                expected,
                actual,
            } => {
                warn!(
                    "Type drift in {}.{}: expected {}, found {}; needs an upgrade step",
                    table, column, expected, actual
                );
            }
        }
    }

    if added == 0 {
        debug!("Columns of '{}' up to date", table);
    }
    Ok(added)
}
