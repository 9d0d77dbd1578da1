//! Catalog database: initialization, column sync and upgrades

pub mod init;
pub mod migrations;
pub mod schema_sync;
pub mod table_schemas;

pub use init::{create_indexes, create_schema, init_database};
pub use migrations::{get_schema_version, run_migrations, CURRENT_SCHEMA_VERSION};
