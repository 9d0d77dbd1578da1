//! Storage tier lifecycle of frames and masters
//!
//! `Local -> CloudPending -> CloudVerified -> SoftDeleted`. A record only
//! becomes verified after the remote copy hashes equal to the catalogued
//! content, and local bytes are only removed from a verified record whose
//! remote copy still verifies at deletion time. Every transition is a
//! guarded single-row update: a refused or timed-out step leaves the state
//! untouched.

use crate::db::{frames, tiers};
use crate::db::tiers::TierRecord;
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{Subject, TierState};
use crate::services::collaborators::CloudStore;
use afm_common::config::ArchiveConfig;
use afm_common::events::{ArchiveEvent, EventBus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct ArchiveTiering {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    cloud: Arc<dyn CloudStore>,
    events: EventBus,
}

impl ArchiveTiering {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        cloud: Arc<dyn CloudStore>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            config,
            cloud,
            events,
        }
    }

    pub async fn state(&self, subject: &Subject) -> ArchiveResult<TierState> {
        Ok(self.record(subject).await?.state)
    }

    /// Start an upload; `Local | CloudPending -> CloudPending`
    pub async fn begin_upload(&self, subject: &Subject) -> ArchiveResult<String> {
        let record = self.record(subject).await?;
        if !matches!(record.state, TierState::Local | TierState::CloudPending { .. }) {
            return Err(refused(subject, &record.state, "cloud_pending", "a verified cloud copy already exists"));
        }

        let location = self.cloud.upload(&record.path, &record.hash).await?;
        if !tiers::mark_pending(&self.pool, subject, &location).await? {
            let current = self.state(subject).await?;
            return Err(refused(subject, &current, "cloud_pending", "state changed during upload"));
        }

        tracing::info!(subject = %subject, location = %location, "Upload started");
        self.changed(subject, record.state.name(), "cloud_pending");
        Ok(location)
    }

    /// Confirm a pending upload by hash; `CloudPending -> CloudVerified`
    ///
    /// A mismatch or timeout leaves the record pending.
    pub async fn verify(&self, subject: &Subject) -> ArchiveResult<TierState> {
        let record = self.record(subject).await?;
        let TierState::CloudPending { location } = &record.state else {
            return Err(refused(subject, &record.state, "cloud_verified", "no upload is pending"));
        };

        self.check_remote(subject, location, &record).await?;

        let mut tx = self.pool.begin().await?;
        if !tiers::mark_verified(&mut tx, subject, location).await? {
            drop(tx);
            let current = self.state(subject).await?;
            return Err(refused(subject, &current, "cloud_verified", "state changed during verification"));
        }
        if let Subject::Frame(hash) = subject {
            let derived = frames::propagate_original_cloud_url(&mut tx, hash, location).await?;
            if derived > 0 {
                tracing::debug!(subject = %subject, derived, "Original cloud URL recorded on calibrated frames");
            }
        }
        tx.commit().await?;

        tracing::info!(subject = %subject, url = %location, "Cloud copy verified");
        self.changed(subject, "cloud_pending", "cloud_verified");
        Ok(TierState::CloudVerified { url: location.clone() })
    }

    /// Verify up to `attempts` times, re-uploading after each mismatch
    pub async fn verify_with_retry(&self, subject: &Subject, attempts: usize) -> ArchiveResult<TierState> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.verify(subject).await {
                Err(ArchiveError::VerificationMismatch { .. }) if attempt < attempts => {
                    tracing::warn!(subject = %subject, attempt, attempts, "Verification mismatch, uploading again");
                    self.begin_upload(subject).await?;
                }
                result => return result,
            }
        }
        Err(ArchiveError::VerificationMismatch {
            subject: subject.to_string(),
            expected: self.record(subject).await?.hash.to_string(),
        })
    }

    /// Remove the local bytes of a verified record; `CloudVerified -> SoftDeleted`
    ///
    /// Refused for every other state. The remote copy is hashed again first.
    pub async fn soft_delete(&self, subject: &Subject) -> ArchiveResult<TierState> {
        let record = self.record(subject).await?;
        let TierState::CloudVerified { url } = &record.state else {
            let reason = match &record.state {
                TierState::SoftDeleted { .. } => "local copy already removed",
                _ => "no verified cloud copy; local file is the only copy",
            };
            tracing::warn!(subject = %subject, state = record.state.name(), "Refused local deletion");
            return Err(refused(subject, &record.state, "soft_deleted", reason));
        };

        self.check_remote(subject, url, &record).await?;

        if !tiers::mark_soft_deleted(&self.pool, subject, url).await? {
            let current = self.state(subject).await?;
            return Err(refused(subject, &current, "soft_deleted", "state changed during deletion"));
        }

        match tokio::fs::remove_file(&record.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(subject = %subject, path = %record.path.display(), "Local file already gone");
            }
            Err(e) => {
                tiers::revert_soft_delete(&self.pool, subject).await?;
                tracing::error!(subject = %subject, path = %record.path.display(), "Local removal failed, soft delete reverted: {}", e);
                return Err(e.into());
            }
        }

        tracing::info!(subject = %subject, url = %url, "Local copy removed; cloud copy retained");
        self.changed(subject, "cloud_verified", "soft_deleted");
        Ok(TierState::SoftDeleted { url: url.clone() })
    }

    async fn record(&self, subject: &Subject) -> ArchiveResult<TierRecord> {
        tiers::load_tier_record(&self.pool, subject)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(subject.to_string()))
    }

    /// Hash check of the remote copy under the verify timeout
    async fn check_remote(&self, subject: &Subject, location: &str, record: &TierRecord) -> ArchiveResult<()> {
        let verified = tokio::time::timeout(
            self.config.verify_timeout(),
            self.cloud.verify(location, &record.hash),
        )
        .await
        .map_err(|_| {
            tracing::warn!(subject = %subject, location, "Cloud verification timed out");
            ArchiveError::Timeout {
                operation: "cloud verification".to_string(),
                subject: subject.to_string(),
            }
        })??;

        if !verified {
            tracing::warn!(subject = %subject, location, expected = %record.hash.short(), "Cloud copy hash mismatch");
            return Err(ArchiveError::VerificationMismatch {
                subject: subject.to_string(),
                expected: record.hash.to_string(),
            });
        }
        Ok(())
    }

    fn changed(&self, subject: &Subject, from: &str, to: &str) {
        self.events.emit_lossy(ArchiveEvent::TierChanged {
            subject: subject.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn refused(subject: &Subject, from: &TierState, to: &str, reason: &str) -> ArchiveError {
    ArchiveError::TransitionRefused {
        subject: subject.to_string(),
        from: from.name().to_string(),
        to: to.to_string(),
        reason: reason.to_string(),
    }
}
