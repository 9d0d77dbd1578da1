//! Master frame synthesis
//!
//! Builds one master from the frames of a calibration session. Each
//! synthesis runs as its own task and at most one runs per session; later
//! requests join the run in flight. A caller that stops waiting leaves the
//! run going, so a long combine still completes and registers its master.
//! Output is content-addressed: a master whose bytes already exist among
//! live masters is discarded in favour of the existing record.

use crate::db::{masters, sessions};
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{
    dominant_key, CalibrationRole, Frame, Master, MasterId, Session, SessionId, TierState,
};
use crate::services::collaborators::FrameCombiner;
use crate::services::hasher;
use afm_common::config::ArchiveConfig;
use afm_common::events::{ArchiveEvent, EventBus};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

type SynthesisRun = Shared<BoxFuture<'static, Result<Master, Arc<ArchiveError>>>>;

pub struct MasterSynthesizer {
    worker: Arc<SynthesisWorker>,
    in_flight: Arc<Mutex<HashMap<SessionId, SynthesisRun>>>,
}

struct SynthesisWorker {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    combiner: Arc<dyn FrameCombiner>,
    events: EventBus,
}

impl MasterSynthesizer {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        combiner: Arc<dyn FrameCombiner>,
        events: EventBus,
    ) -> Self {
        Self {
            worker: Arc::new(SynthesisWorker {
                pool,
                config,
                combiner,
                events,
            }),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Directory holding masters of `role`
    pub fn masters_dir(&self, role: CalibrationRole) -> PathBuf {
        self.worker.masters_dir(role)
    }

    /// Master for calibration session `session_id`
    ///
    /// Dropping the returned future only stops waiting; the run itself
    /// carries on in the background.
    pub async fn synthesize(&self, session_id: SessionId) -> ArchiveResult<Master> {
        self.join_or_start(session_id)
            .await
            .map_err(ArchiveError::from_shared)
    }

    /// True while a synthesis for `session_id` is running
    pub fn is_running(&self, session_id: SessionId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session_id)
    }

    fn join_or_start(&self, session_id: SessionId) -> SynthesisRun {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = in_flight.get(&session_id) {
            tracing::debug!(session_id = %session_id, "Joining synthesis in flight");
            return run.clone();
        }

        let worker = Arc::clone(&self.worker);
        let registry = Arc::clone(&self.in_flight);
        // The entry is inserted below before the lock is released, so the
        // task cannot remove it early
        let handle = tokio::spawn(async move {
            let result = worker.run(session_id).await.map_err(Arc::new);
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session_id);
            result
        });

        let run = async move {
            handle.await.unwrap_or_else(|e| {
                Err(Arc::new(ArchiveError::Synthesis {
                    session_id: session_id.to_string(),
                    reason: format!("synthesis task ended abnormally: {}", e),
                    offending: Vec::new(),
                }))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(session_id, run.clone());
        run
    }
}

impl SynthesisWorker {
    fn masters_dir(&self, role: CalibrationRole) -> PathBuf {
        self.config.repo.join("Masters").join(role.as_str())
    }

    async fn run(&self, session_id: SessionId) -> ArchiveResult<Master> {
        let session = sessions::load_session(&self.pool, session_id)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(format!("session {}", session_id)))?;
        let role = session.frame_type.calibration_role().ok_or_else(|| {
            ArchiveError::InvalidInput(format!(
                "session {} holds {} frames; only calibration sessions can be synthesized",
                session_id, session.frame_type
            ))
        })?;

        let frames: Vec<Frame> = crate::db::frames::load_session_frames(&self.pool, session_id)
            .await?
            .into_iter()
            .filter(|f| !f.tier.is_soft_deleted())
            .collect();
        self.check_homogeneous(&session, role, &frames)?;

        let file_count = frames.len() as i64;
        if let Some(existing) = masters::find_current_for_source(&self.pool, session_id, file_count).await? {
            tracing::debug!(
                session_id = %session_id,
                master_id = %existing.id,
                "Session unchanged since last synthesis, reusing master"
            );
            sessions::mark_master_created(&self.pool, session_id, role).await?;
            return Ok(existing);
        }

        let dir = self.masters_dir(role);
        tokio::fs::create_dir_all(&dir).await?;
        let mut output = OutputFile::new(dir.join(format!(".staging-{}.fits", uuid::Uuid::new_v4())));
        let inputs: Vec<PathBuf> = frames.iter().map(|f| f.path.clone()).collect();

        let quality = self
            .combiner
            .combine(role, &inputs, output.path())
            .await
            .map_err(|e| ArchiveError::Synthesis {
                session_id: session_id.to_string(),
                reason: format!("combine failed: {}", e),
                offending: Vec::new(),
            })?;
        let hash = hasher::hash_file(output.path()).await?;

        let id = MasterId::new();
        output.rename(dir.join(format!("{}.fits", id))).await?;
        let file_size = tokio::fs::metadata(output.path()).await.ok().map(|m| m.len() as i64);

        // Reference acquisition: the key plus temperature/gain/offset of the first matching frame
        let acquisition = frames
            .first()
            .map(|f| f.acquisition.clone())
            .unwrap_or_default();
        let now = Utc::now();
        let is_validated = quality >= self.config.master_quality_threshold;

        let master = Master {
            id,
            master_type: role,
            path: output.path().to_path_buf(),
            creation_date: now,
            acquisition,
            source_session_id: Some(session_id),
            file_count,
            quality_score: Some(quality),
            file_size,
            hash: hash.clone(),
            is_validated,
            validation_date: is_validated.then_some(now),
            notes: None,
            tier: TierState::Local,
            superseded_by: None,
        };

        // The insert comes first so the transaction takes the write lock up front
        let mut tx = self.pool.begin().await?;
        if !masters::insert_master(&mut *tx, &master).await? {
            let existing = masters::find_live_by_hash(&mut *tx, &hash)
                .await?
                .ok_or_else(|| ArchiveError::NotFound(format!("master with hash {}", hash)))?;

            let reinstate = existing.superseded_by.is_some() && existing.source_session_id == Some(session_id);
            let replaced = if reinstate {
                masters::reinstate_master(&mut *tx, existing.id).await?;
                masters::supersede_for_source(&mut *tx, session_id, existing.id).await?
            } else {
                Vec::new()
            };
            sessions::mark_master_created(&mut *tx, session_id, role).await?;
            tx.commit().await?;

            if reinstate {
                tracing::info!(
                    session_id = %session_id,
                    master_id = %existing.id,
                    hash = %hash.short(),
                    "Output matches a superseded master of this session, reinstating it"
                );
            } else {
                tracing::info!(
                    session_id = %session_id,
                    master_id = %existing.id,
                    hash = %hash.short(),
                    "Identical master already registered, discarding new output"
                );
            }
            self.announce_superseded(&replaced, existing.id, now);

            return Ok(Master {
                superseded_by: if reinstate { None } else { existing.superseded_by },
                ..existing
            });
        }

        let replaced = masters::supersede_for_source(&mut *tx, session_id, id).await?;
        sessions::mark_master_created(&mut *tx, session_id, role).await?;
        tx.commit().await?;
        output.keep();

        self.announce_superseded(&replaced, id, now);
        if is_validated {
            tracing::info!(
                master_id = %id,
                master_type = %role,
                session_id = %session_id,
                file_count,
                quality,
                "Master registered"
            );
        } else {
            tracing::warn!(
                master_id = %id,
                master_type = %role,
                session_id = %session_id,
                quality,
                threshold = self.config.master_quality_threshold,
                "Master registered below quality threshold, left unvalidated"
            );
        }
        self.events.emit_lossy(ArchiveEvent::MasterRegistered {
            master_id: id.as_uuid(),
            master_type: role.as_str().to_string(),
            source_session_id: session_id.as_uuid(),
            validated: is_validated,
            timestamp: now,
        });

        Ok(master)
    }

    fn announce_superseded(&self, replaced: &[MasterId], newer: MasterId, now: DateTime<Utc>) {
        for old in replaced {
            tracing::info!(master_id = %old, superseded_by = %newer, "Master superseded");
            self.events.emit_lossy(ArchiveEvent::MasterSuperseded {
                master_id: old.as_uuid(),
                superseded_by: newer.as_uuid(),
                timestamp: now,
            });
        }
    }

    /// Every frame must be of the session's role and share one calibration key
    fn check_homogeneous(&self, session: &Session, role: CalibrationRole, frames: &[Frame]) -> ArchiveResult<()> {
        let Some(key) = dominant_key(frames, role) else {
            return Err(ArchiveError::Synthesis {
                session_id: session.id.to_string(),
                reason: "no frames with local data".to_string(),
                offending: Vec::new(),
            });
        };

        let offending: Vec<String> = frames
            .iter()
            .filter(|f| f.frame_type != role.frame_type() || f.acquisition.calibration_key(role) != key)
            .map(|f| f.hash.to_string())
            .collect();

        if offending.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            session_id = %session.id,
            expected = %key,
            offending = offending.len(),
            "Calibration session is not homogeneous"
        );
        Err(ArchiveError::Synthesis {
            session_id: session.id.to_string(),
            reason: format!("frames differ from the session key {}", key),
            offending,
        })
    }
}

/// Combiner output that is removed unless kept
///
/// Covers every early return and a run dropped at shutdown.
struct OutputFile {
    path: PathBuf,
    keep: bool,
}

impl OutputFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn rename(&mut self, to: PathBuf) -> ArchiveResult<()> {
        tokio::fs::rename(&self.path, &to).await?;
        self.path = to;
        Ok(())
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove discarded master output: {}", e);
            }
        }
    }
}
