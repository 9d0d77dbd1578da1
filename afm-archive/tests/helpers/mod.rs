//! Test Helper Utilities
//!
//! Shared setup for afm-archive integration tests

#![allow(dead_code)]

pub mod fits_builder;
pub mod stubs;

pub use fits_builder::FitsFrame;
pub use stubs::{FlakyCloudStore, StubCombiner};

use afm_archive::models::{ContentHash, Frame, IngestOutcome, Session};
use afm_archive::services::read_header;
use afm_archive::Archive;
use afm_common::config::ArchiveConfig;
use afm_common::events::ArchiveEvent;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub struct TestArchive {
    pub dir: TempDir,
    pub archive: Archive,
    pub combiner: Arc<StubCombiner>,
    pub cloud: Arc<FlakyCloudStore>,
}

/// Archive in a scratch directory with default configuration
pub async fn create_test_archive() -> TestArchive {
    create_test_archive_with(|_| {}).await
}

pub async fn create_test_archive_with(tweak: impl FnOnce(&mut ArchiveConfig)) -> TestArchive {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("intake");
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::create_dir_all(&repo).unwrap();

    let mut config = ArchiveConfig::with_roots(&source, &repo);
    config.cloud_root = Some(dir.path().join("cloud"));
    config.ingest_workers = 4;
    tweak(&mut config);

    let combiner = Arc::new(StubCombiner::new(0.9));
    let cloud = Arc::new(FlakyCloudStore::new(dir.path().join("cloud")));
    let archive = Archive::open(config, combiner.clone(), cloud.clone())
        .await
        .unwrap();

    TestArchive {
        dir,
        archive,
        combiner,
        cloud,
    }
}

impl TestArchive {
    pub fn source(&self) -> PathBuf {
        self.archive.config.source.clone()
    }

    /// Write `frame` outside the intake directory and catalogue it in place
    pub async fn ingest(&self, frame: &FitsFrame) -> IngestOutcome {
        self.try_ingest(frame).await.unwrap()
    }

    pub async fn try_ingest(&self, frame: &FitsFrame) -> afm_archive::ArchiveResult<IngestOutcome> {
        let bytes = frame.to_bytes();
        let hash = ContentHash::of_bytes(&bytes);
        let path = self.dir.path().join("store").join(format!("{}.fits", hash));
        frame.write_to(&path);

        let header = read_header(&path)?;
        self.archive
            .catalog
            .ingest(&header, &hash, &path, Some(bytes.len() as i64))
            .await
    }

    pub async fn ingest_frame(&self, frame: &FitsFrame) -> Frame {
        self.ingest(frame).await.into_frame()
    }

    /// Ingest `count` frames built by `make(i)`; returns them in order
    pub async fn ingest_many(&self, count: usize, make: impl Fn(usize) -> FitsFrame) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            frames.push(self.ingest_frame(&make(i)).await);
        }
        frames
    }

    pub async fn session_of(&self, frame: &Frame) -> Session {
        let id = frame.session_id.expect("ingested frame has a session");
        afm_archive::db::sessions::load_session(&self.archive.pool, id)
            .await
            .unwrap()
            .expect("session exists")
    }
}

/// Everything currently buffered on a subscription
pub fn drain_events(rx: &mut broadcast::Receiver<ArchiveEvent>) -> Vec<ArchiveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// `DATE-OBS` value `minutes` after `base` (`YYYY-MM-DDTHH:MM:SS`)
pub fn minutes_after(base: &str, minutes: i64) -> String {
    let start = chrono::NaiveDateTime::parse_from_str(base, "%Y-%m-%dT%H:%M:%S").unwrap();
    (start + chrono::Duration::minutes(minutes))
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}
