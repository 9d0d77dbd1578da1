//! Calibration resolution for light sessions
//!
//! Per role the resolver tries, in order: an existing master matching the
//! light's calibration key, the operator-assigned calibration session, the
//! best unprocessed calibration session, and finally defers. Steps two and
//! three synthesize a master and cache the choice on the light session.
//! Mutations of one light session are serialized.

use crate::db::{frames, masters, sessions};
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{dominant_key, CalibrationRole, Master, Session, SessionId};
use crate::services::master_synthesizer::MasterSynthesizer;
use crate::utils::KeyedLocks;
use afm_common::config::ArchiveConfig;
use afm_common::events::{ArchiveEvent, EventBus};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Outcome of resolving one role for one light session
#[derive(Debug, Clone)]
pub enum Resolution {
    Master(Master),
    /// Synthesis from this session is still outstanding (timed out)
    CalibrationSession(Session),
    /// Nothing matches yet; calibration is deferred
    Unresolved,
}

/// Summary of a bulk calibration pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct CalibrationReport {
    pub resolved: usize,
    pub pending: Vec<(SessionId, CalibrationRole)>,
    pub deferred: Vec<(SessionId, CalibrationRole)>,
    pub failed: Vec<(SessionId, CalibrationRole, String)>,
}

pub struct CalibrationResolver {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    synthesizer: Arc<MasterSynthesizer>,
    events: EventBus,
    light_locks: KeyedLocks<SessionId>,
}

impl CalibrationResolver {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        synthesizer: Arc<MasterSynthesizer>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            config,
            synthesizer,
            events,
            light_locks: KeyedLocks::new(),
        }
    }

    pub async fn resolve(&self, light_id: SessionId, role: CalibrationRole) -> ArchiveResult<Resolution> {
        let _guard = self.light_locks.lock(&light_id).await;

        let light = self.load_light(light_id).await?;
        let light_frames = frames::load_session_frames(&self.pool, light_id).await?;
        let Some(key) = dominant_key(&light_frames, role) else {
            tracing::warn!(session_id = %light_id, role = %role, "Light session has no frames to match on");
            return Ok(self.defer(&light, role));
        };

        if let Some(master) = masters::find_best_master(&self.pool, role, &key, &light.date).await? {
            tracing::debug!(
                session_id = %light_id,
                role = %role,
                master_id = %master.id,
                validated = master.is_validated,
                "Resolved to existing master"
            );
            return Ok(Resolution::Master(master));
        }

        if let Some(assigned) = light.role(role).auto_cal_session {
            let calibration = self.load_calibration(&light, role, assigned).await?;
            tracing::debug!(session_id = %light_id, role = %role, calibration = %assigned, "Using assigned calibration session");
            return self.synthesize_for(&light, role, calibration).await;
        }

        if let Some(candidate) = sessions::find_calibration_session(&self.pool, role, &key, &light.date).await? {
            let calibration = self.load_calibration(&light, role, candidate).await?;
            tracing::debug!(session_id = %light_id, role = %role, calibration = %candidate, key = %key, "Matched calibration session");
            return self.synthesize_for(&light, role, calibration).await;
        }

        Ok(self.defer(&light, role))
    }

    /// Operator override of the calibration session used for `role`
    pub async fn assign_calibration_session(
        &self,
        light_id: SessionId,
        role: CalibrationRole,
        calibration_id: SessionId,
    ) -> ArchiveResult<()> {
        let _guard = self.light_locks.lock(&light_id).await;

        let light = self.load_light(light_id).await?;
        self.load_calibration(&light, role, calibration_id).await?;
        sessions::set_auto_cal_session(&self.pool, light_id, role, Some(calibration_id)).await?;

        tracing::info!(session_id = %light_id, role = %role, calibration = %calibration_id, "Calibration session assigned");
        Ok(())
    }

    /// Clear a `master_*_created` flag; the only way the flag goes back to false
    pub async fn reset_master_created(
        &self,
        session_id: SessionId,
        role: CalibrationRole,
        reason: &str,
    ) -> ArchiveResult<bool> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ArchiveError::InvalidInput(format!(
                "resetting master_{}_created on session {} requires a reason",
                role, session_id
            )));
        }

        let _guard = self.light_locks.lock(&session_id).await;
        if sessions::load_session(&self.pool, session_id).await?.is_none() {
            return Err(ArchiveError::NotFound(format!("session {}", session_id)));
        }

        let cleared = sessions::clear_master_created(&self.pool, session_id, role).await?;
        if cleared {
            tracing::warn!(session_id = %session_id, role = %role, reason, "master_created flag reset");
        }
        Ok(cleared)
    }

    /// Resolve every light session for each of `roles`
    pub async fn calibrate_all(&self, roles: &[CalibrationRole]) -> ArchiveResult<CalibrationReport> {
        let lights = sessions::light_session_ids(&self.pool).await?;
        let jobs: Vec<(SessionId, CalibrationRole)> = lights
            .iter()
            .flat_map(|id| roles.iter().map(move |role| (*id, *role)))
            .collect();

        let outcomes: Vec<_> = stream::iter(jobs)
            .map(|(id, role)| async move { (id, role, self.resolve(id, role).await) })
            .buffer_unordered(self.config.worker_count())
            .collect()
            .await;

        let mut report = CalibrationReport::default();
        for (id, role, outcome) in outcomes {
            match outcome {
                Ok(Resolution::Master(_)) => report.resolved += 1,
                Ok(Resolution::CalibrationSession(_)) => report.pending.push((id, role)),
                Ok(Resolution::Unresolved) => report.deferred.push((id, role)),
                Err(e) => {
                    tracing::warn!(session_id = %id, role = %role, "Calibration failed: {}", e);
                    report.failed.push((id, role, e.to_string()));
                }
            }
        }
        report.pending.sort_by_key(|(id, role)| (*id, role.as_str()));
        report.deferred.sort_by_key(|(id, role)| (*id, role.as_str()));
        report.failed.sort_by(|a, b| (a.0, a.1.as_str()).cmp(&(b.0, b.1.as_str())));

        tracing::info!(
            sessions = lights.len(),
            resolved = report.resolved,
            pending = report.pending.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "Calibration pass complete"
        );
        Ok(report)
    }

    async fn synthesize_for(
        &self,
        light: &Session,
        role: CalibrationRole,
        calibration: Session,
    ) -> ArchiveResult<Resolution> {
        let timeout = self.config.synthesis_timeout();
        // On timeout only the wait ends; the synthesis keeps running
        match tokio::time::timeout(timeout, self.synthesizer.synthesize(calibration.id)).await {
            Err(_) => {
                tracing::warn!(
                    session_id = %light.id,
                    role = %role,
                    calibration = %calibration.id,
                    timeout_secs = timeout.as_secs(),
                    "Synthesis still running after timeout; light session left pending"
                );
                Ok(Resolution::CalibrationSession(calibration))
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(master)) => {
                sessions::record_resolution(&self.pool, light.id, role, calibration.id).await?;
                tracing::info!(
                    session_id = %light.id,
                    role = %role,
                    calibration = %calibration.id,
                    master_id = %master.id,
                    "Light session calibration resolved"
                );
                Ok(Resolution::Master(master))
            }
        }
    }

    fn defer(&self, light: &Session, role: CalibrationRole) -> Resolution {
        tracing::info!(session_id = %light.id, role = %role, "No calibration available, deferred");
        self.events.emit_lossy(ArchiveEvent::CalibrationDeferred {
            session_id: light.id.as_uuid(),
            role: role.as_str().to_string(),
            timestamp: Utc::now(),
        });
        Resolution::Unresolved
    }

    async fn load_light(&self, id: SessionId) -> ArchiveResult<Session> {
        let session = sessions::load_session(&self.pool, id)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(format!("session {}", id)))?;
        if !session.is_light() {
            return Err(ArchiveError::InvalidInput(format!(
                "session {} holds {} frames, not lights",
                id, session.frame_type
            )));
        }
        Ok(session)
    }

    /// Calibration session `id`, which must hold frames of `role`
    async fn load_calibration(&self, light: &Session, role: CalibrationRole, id: SessionId) -> ArchiveResult<Session> {
        let entity = format!("session {} ({} calibration)", light.id, role);
        match sessions::load_session(&self.pool, id).await? {
            Some(session) if session.frame_type == role.frame_type() => Ok(session),
            Some(session) => Err(ArchiveError::ReferentialIntegrity {
                entity,
                reference: format!("session {} holding {} frames", id, session.frame_type),
            }),
            None => Err(ArchiveError::ReferentialIntegrity {
                entity,
                reference: format!("session {}", id),
            }),
        }
    }
}
