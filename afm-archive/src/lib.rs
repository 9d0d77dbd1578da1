//! afm-archive library interface
//!
//! Calibration-frame catalog and content-addressed archive manager. The
//! binary wires these components to a CLI; integration tests build them
//! directly through [`Archive`].

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ArchiveError, ArchiveResult};

use afm_common::config::ArchiveConfig;
use afm_common::events::EventBus;
use services::{
    ArchiveTiering, CalibrationResolver, CloudStore, FrameCatalog, FrameCombiner, IngestPipeline,
    MasterSynthesizer, SessionGrouper,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Archive components sharing one catalog pool, configuration and event bus
#[derive(Clone)]
pub struct Archive {
    pub config: Arc<ArchiveConfig>,
    pub pool: SqlitePool,
    pub events: EventBus,
    pub catalog: Arc<FrameCatalog>,
    pub grouper: Arc<SessionGrouper>,
    pub synthesizer: Arc<MasterSynthesizer>,
    pub resolver: Arc<CalibrationResolver>,
    pub tiering: Arc<ArchiveTiering>,
}

impl Archive {
    pub fn new(
        pool: SqlitePool,
        config: ArchiveConfig,
        combiner: Arc<dyn FrameCombiner>,
        cloud: Arc<dyn CloudStore>,
    ) -> Self {
        let config = Arc::new(config);
        let events = EventBus::default();

        let grouper = Arc::new(SessionGrouper::new(&config, events.clone()));
        let catalog = Arc::new(FrameCatalog::new(
            pool.clone(),
            config.clone(),
            grouper.clone(),
            events.clone(),
        ));
        let synthesizer = Arc::new(MasterSynthesizer::new(
            pool.clone(),
            config.clone(),
            combiner,
            events.clone(),
        ));
        let resolver = Arc::new(CalibrationResolver::new(
            pool.clone(),
            config.clone(),
            synthesizer.clone(),
            events.clone(),
        ));
        let tiering = Arc::new(ArchiveTiering::new(pool.clone(), config.clone(), cloud, events.clone()));

        Self {
            config,
            pool,
            events,
            catalog,
            grouper,
            synthesizer,
            resolver,
            tiering,
        }
    }

    /// Open (creating or upgrading) the catalog at the configured path
    pub async fn open(
        config: ArchiveConfig,
        combiner: Arc<dyn FrameCombiner>,
        cloud: Arc<dyn CloudStore>,
    ) -> ArchiveResult<Self> {
        config.validate()?;
        let pool = afm_common::db::init_database(&config.database_path()).await?;
        Ok(Self::new(pool, config, combiner, cloud))
    }

    pub fn ingest_pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(self.catalog.clone(), self.config.clone(), self.events.clone())
    }
}
