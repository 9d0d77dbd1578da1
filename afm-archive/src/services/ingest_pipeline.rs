//! Bulk ingestion from the intake directory
//!
//! Scans SOURCE, then hashes, reads and catalogues files on a bounded worker
//! pool. New frames are moved into the archive under
//! `REPO/<object|Calibration>/<type>/<yyyy-mm-dd>/`; the source file is only
//! removed once the catalog row points at the archived copy. Duplicates stay
//! where they are. Cancelling stops scheduling new files; every completed
//! ingest remains valid.

use crate::db::frames;
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{Frame, IngestOutcome};
use crate::services::catalog::FrameCatalog;
use crate::services::file_scanner::FileScanner;
use crate::services::{fits_header, hasher};
use afm_common::config::ArchiveConfig;
use afm_common::events::{ArchiveEvent, EventBus};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub scanned: usize,
    pub new: usize,
    pub duplicates: usize,
    pub failed: Vec<(PathBuf, String)>,
    /// Files never started because the run was cancelled
    pub skipped: usize,
    pub cancelled: bool,
}

pub struct IngestPipeline {
    catalog: Arc<FrameCatalog>,
    config: Arc<ArchiveConfig>,
    events: EventBus,
}

impl IngestPipeline {
    pub fn new(catalog: Arc<FrameCatalog>, config: Arc<ArchiveConfig>, events: EventBus) -> Self {
        Self {
            catalog,
            config,
            events,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> ArchiveResult<IngestReport> {
        let source = self.config.source.clone();
        let files = tokio::task::spawn_blocking(move || FileScanner::new().scan(&source))
            .await
            .map_err(|e| ArchiveError::Common(afm_common::Error::Internal(format!("scan task failed: {}", e))))??;

        let total = files.len();
        let workers = self.config.worker_count();
        tracing::info!(source = %self.config.source.display(), files = total, workers, "Ingest started");

        let processed = AtomicUsize::new(0);
        let outcomes: Vec<(PathBuf, ArchiveResult<IngestOutcome>)> = stream::iter(files)
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|path| {
                let processed = &processed;
                async move {
                    let outcome = self.ingest_file(&path).await;
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    self.events.emit_lossy(ArchiveEvent::IngestProgress {
                        processed: done,
                        total,
                        timestamp: Utc::now(),
                    });
                    if done % 100 == 0 {
                        tracing::info!(processed = done, total, "Ingest progress");
                    }
                    (path, outcome)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = IngestReport {
            scanned: total,
            skipped: total - outcomes.len(),
            cancelled: cancel.is_cancelled(),
            ..Default::default()
        };
        for (path, outcome) in outcomes {
            match outcome {
                Ok(IngestOutcome::New(_)) => report.new += 1,
                Ok(IngestOutcome::Duplicate(_)) => report.duplicates += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Ingest failed: {}", e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        report.failed.sort();

        tracing::info!(
            new = report.new,
            duplicates = report.duplicates,
            failed = report.failed.len(),
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Ingest finished"
        );
        Ok(report)
    }

    /// Hash, read and catalogue one file, then move it into the archive
    pub async fn ingest_file(&self, path: &Path) -> ArchiveResult<IngestOutcome> {
        let hash = hasher::hash_file(path).await?;

        let owned = path.to_path_buf();
        let header = tokio::task::spawn_blocking(move || fits_header::read_header(&owned))
            .await
            .map_err(|e| ArchiveError::Common(afm_common::Error::Internal(format!("header task failed: {}", e))))??;
        let file_size = tokio::fs::metadata(path).await.ok().map(|m| m.len() as i64);

        match self.catalog.ingest(&header, &hash, path, file_size).await? {
            IngestOutcome::New(frame) => Ok(IngestOutcome::New(self.archive(frame).await?)),
            duplicate => Ok(duplicate),
        }
    }

    async fn archive(&self, frame: Frame) -> ArchiveResult<Frame> {
        let dir = archive_dir(&self.config.repo, &frame);
        let file_name = frame
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.fits", frame.hash));

        let mut dest = dir.join(&file_name);
        if dest == frame.path {
            return Ok(frame);
        }
        tokio::fs::create_dir_all(&dir).await?;
        if tokio::fs::try_exists(&dest).await? {
            dest = dir.join(format!("{}_{}", frame.hash.short(), file_name));
        }

        tokio::fs::copy(&frame.path, &dest).await?;
        frames::update_frame_path(self.catalog.pool(), &frame.hash, &dest).await?;
        if let Err(e) = tokio::fs::remove_file(&frame.path).await {
            tracing::warn!(hash = %frame.hash.short(), path = %frame.path.display(), "Archived but could not remove source: {}", e);
        }

        tracing::debug!(hash = %frame.hash.short(), dest = %dest.display(), "Frame archived");
        Ok(Frame { path: dest, ..frame })
    }
}

/// `REPO/<object|Calibration>/<type>/<yyyy-mm-dd>`
pub fn archive_dir(repo: &Path, frame: &Frame) -> PathBuf {
    let group = match (frame.frame_type.calibration_role(), &frame.object_name) {
        (None, Some(object)) => sanitize(object),
        (None, None) => "Unknown".to_string(),
        (Some(_), _) => "Calibration".to_string(),
    };
    let date = frame
        .date_obs
        .or(frame.created_at)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string();

    repo.join(group).join(frame.frame_type.as_str()).join(date)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "Unknown".to_string()
    } else {
        cleaned
    }
}
