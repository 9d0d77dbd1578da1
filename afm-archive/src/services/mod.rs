//! Archive services
//!
//! Leaves first: header reading, hashing and scanning feed the catalog;
//! the grouper assigns sessions; the resolver and synthesizer turn
//! calibration sessions into masters; tiering manages local and cloud copies.

pub mod archive_tiering;
pub mod calibration_resolver;
pub mod catalog;
pub mod collaborators;
pub mod file_scanner;
pub mod fits_header;
pub mod hasher;
pub mod ingest_pipeline;
pub mod master_synthesizer;
pub mod session_grouper;

pub use archive_tiering::ArchiveTiering;
pub use calibration_resolver::{CalibrationReport, CalibrationResolver, Resolution};
pub use catalog::FrameCatalog;
pub use collaborators::{
    cloud_from_config, combiner_from_config, CloudStore, CommandCombiner, DirectoryCloudStore,
    FrameCombiner, Unconfigured,
};
pub use file_scanner::FileScanner;
pub use fits_header::{read_header, RawHeader};
pub use ingest_pipeline::{IngestPipeline, IngestReport};
pub use master_synthesizer::MasterSynthesizer;
pub use session_grouper::SessionGrouper;
