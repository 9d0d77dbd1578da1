//! Frame catalog
//!
//! Durable store of ingested frames keyed by content hash. Ingestion is
//! idempotent: concurrent or repeated ingests of the same content collapse to
//! one row (per-hash lock plus `INSERT ... ON CONFLICT DO NOTHING`), and the
//! existing record is returned for duplicates. A frame's session is
//! assigned in the same transaction that inserts it.

use crate::db::{frames, mappings, masters, sessions, variable_stars};
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{
    CalibrationRefs, ContentHash, Frame, FrameFilter, FrameHeader, IngestOutcome, MappingRule,
    SessionKey,
};
use crate::services::fits_header::RawHeader;
use crate::services::session_grouper::{AssignGuard, Assigned, SessionGrouper};
use crate::utils::{retry_on_lock, KeyedLocks};
use afm_common::config::ArchiveConfig;
use afm_common::events::{ArchiveEvent, EventBus};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

/// Rows fetched per round trip by `query`
const QUERY_PAGE_SIZE: i64 = 256;

pub struct FrameCatalog {
    pool: SqlitePool,
    config: Arc<ArchiveConfig>,
    grouper: Arc<SessionGrouper>,
    events: EventBus,
    hash_locks: KeyedLocks<ContentHash>,
}

impl FrameCatalog {
    pub fn new(
        pool: SqlitePool,
        config: Arc<ArchiveConfig>,
        grouper: Arc<SessionGrouper>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            config,
            grouper,
            events,
            hash_locks: KeyedLocks::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Catalog one frame
    ///
    /// Header cards pass through the mapping rules before they become
    /// matching keys. `path` is where the bytes currently live.
    pub async fn ingest(
        &self,
        header: &RawHeader,
        hash: &ContentHash,
        path: &Path,
        file_size: Option<i64>,
    ) -> ArchiveResult<IngestOutcome> {
        let _guard = self.hash_locks.lock(hash).await;

        if let Some(existing) = frames::load_frame(&self.pool, hash).await? {
            tracing::debug!(hash = %hash.short(), path = %path.display(), "Duplicate content, keeping existing record");
            return Ok(IngestOutcome::Duplicate(existing));
        }

        let rules = mappings::list_mappings(&self.pool).await?;
        let frame_header = normalize(header, &rules).to_frame_header()?;

        let now = Utc::now();
        let key = SessionKey {
            frame_type: frame_header.frame_type,
            object_name: frame_header.object_name.clone(),
            telescope: frame_header.acquisition.telescope.clone(),
            instrument: frame_header.acquisition.instrument.clone(),
            filter: frame_header.acquisition.filter.clone(),
            observed_at: frame_header.date_obs.unwrap_or(now),
        };

        let assign_guard = self.grouper.lock().await;
        let guard_ref = &assign_guard;
        let key_ref = &key;
        let header_ref = &frame_header;
        let now_ref = &now;
        let stored = retry_on_lock("insert_frame", self.config.max_lock_wait_ms, || {
            self.store_frame(guard_ref, key_ref, hash, path, header_ref, file_size, now_ref)
        })
        .await?;
        drop(assign_guard);

        let frame = frames::load_frame(&self.pool, hash)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(format!("frame:{}", hash)))?;

        let Some(assigned) = stored else {
            return Ok(IngestOutcome::Duplicate(frame));
        };
        self.grouper.announce(&assigned);
        let session = &assigned.session;

        tracing::info!(
            hash = %hash.short(),
            frame_type = %frame.frame_type,
            session_id = %session.id,
            "Frame ingested"
        );
        self.events.emit_lossy(ArchiveEvent::FrameIngested {
            hash: hash.to_string(),
            frame_type: frame.frame_type.as_str().to_string(),
            session_id: session.id.as_uuid(),
            timestamp: now,
        });

        Ok(IngestOutcome::New(frame))
    }

    /// Assign the session and insert the frame in one transaction
    ///
    /// Returns `None`, with nothing written, when the content is already
    /// catalogued.
    #[allow(clippy::too_many_arguments)]
    async fn store_frame(
        &self,
        guard: &AssignGuard<'_>,
        key: &SessionKey,
        hash: &ContentHash,
        path: &Path,
        header: &FrameHeader,
        file_size: Option<i64>,
        now: &DateTime<Utc>,
    ) -> ArchiveResult<Option<Assigned>> {
        let mut tx = self.pool.begin().await?;
        let assigned = self.grouper.assign(guard, &mut *tx, key).await?;
        let inserted =
            frames::insert_frame_if_absent(&mut *tx, hash, path, header, assigned.session.id, file_size, now)
                .await?;
        if !inserted {
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(assigned))
    }

    pub async fn lookup(&self, hash: &ContentHash) -> ArchiveResult<Option<Frame>> {
        frames::load_frame(&self.pool, hash).await
    }

    /// Lazily stream frames matching `filter`, in content hash order
    pub fn query(&self, filter: FrameFilter) -> impl Stream<Item = ArchiveResult<Frame>> + Send + 'static {
        let pool = self.pool.clone();
        try_stream! {
            let mut after: Option<ContentHash> = None;
            loop {
                let page = frames::load_frames_page(&pool, &filter, after.as_ref(), QUERY_PAGE_SIZE).await?;
                let exhausted = (page.len() as i64) < QUERY_PAGE_SIZE;
                after = page.last().map(|frame| frame.hash.clone());

                for frame in page {
                    yield frame;
                }
                if exhausted {
                    break;
                }
            }
        }
    }

    /// Catalog a calibrated derivative of `original`
    ///
    /// Every master reference must name an existing master of the matching
    /// role. Re-registering the same derived content returns the existing row.
    pub async fn register_calibrated(
        &self,
        original: &ContentHash,
        derived: &ContentHash,
        derived_path: &Path,
        refs: &CalibrationRefs,
    ) -> ArchiveResult<Frame> {
        let entity = format!("frame:{}", derived);

        if original == derived {
            return Err(ArchiveError::InvalidInput(format!(
                "{} cannot be its own calibration original",
                entity
            )));
        }
        if frames::load_frame(&self.pool, original).await?.is_none() {
            return Err(ArchiveError::ReferentialIntegrity {
                entity,
                reference: format!("original frame:{}", original),
            });
        }
        for (role, id) in refs.iter() {
            match masters::load_master(&self.pool, id).await? {
                Some(master) if master.master_type == role => {}
                Some(master) => {
                    return Err(ArchiveError::ReferentialIntegrity {
                        entity,
                        reference: format!("{} master:{} (is a {} master)", role, id, master.master_type),
                    });
                }
                None => {
                    return Err(ArchiveError::ReferentialIntegrity {
                        entity,
                        reference: format!("{} master:{}", role, id),
                    });
                }
            }
        }

        let _guard = self.hash_locks.lock(derived).await;
        let file_size = tokio::fs::metadata(derived_path).await.ok().map(|m| m.len() as i64);
        let now = Utc::now();

        let mut conn = self.pool.acquire().await?;
        let inserted =
            frames::insert_calibrated_frame(&mut conn, original, derived, derived_path, refs, file_size, &now)
                .await?;
        drop(conn);

        let frame = frames::load_frame(&self.pool, derived)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(entity.clone()))?;

        if inserted {
            tracing::info!(
                hash = %derived.short(),
                original = %original.short(),
                bias = ?refs.bias,
                dark = ?refs.dark,
                flat = ?refs.flat,
                "Calibrated frame registered"
            );
        } else {
            tracing::debug!(hash = %derived.short(), "Calibrated frame already catalogued");
        }
        Ok(frame)
    }

    pub async fn list_mappings(&self) -> ArchiveResult<Vec<MappingRule>> {
        mappings::list_mappings(&self.pool).await
    }

    /// Add a normalization rule; returns its id
    ///
    /// Rules only affect frames ingested afterwards.
    pub async fn add_mapping(
        &self,
        card: &str,
        current: Option<&str>,
        replacement: &str,
        is_default: bool,
    ) -> ArchiveResult<i64> {
        let id = mappings::add_mapping(&self.pool, card, current, replacement, is_default).await?;
        tracing::info!(id, card, current = current.unwrap_or("*"), replacement, is_default, "Mapping added");
        Ok(id)
    }

    pub async fn remove_mapping(&self, id: i64) -> ArchiveResult<()> {
        if !mappings::remove_mapping(&self.pool, id).await? {
            return Err(ArchiveError::NotFound(format!("mapping {}", id)));
        }
        tracing::info!(id, "Mapping removed");
        Ok(())
    }

    /// Reference a variable star target, creating it on first use
    ///
    /// Existing light sessions on the target are flagged.
    pub async fn touch_variable_star(&self, name: &str) -> ArchiveResult<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ArchiveError::InvalidInput("variable star name is empty".to_string()));
        }
        let created = variable_stars::touch(&self.pool, name, &Utc::now()).await?;
        let flagged = sessions::flag_variable_star_sessions(&self.pool, name).await?;
        tracing::info!(target_name = name, created, flagged_sessions = flagged, "Variable star referenced");
        Ok(created)
    }

    pub async fn list_variable_stars(&self) -> ArchiveResult<Vec<(String, DateTime<Utc>)>> {
        variable_stars::list(&self.pool).await
    }
}

fn normalize(header: &RawHeader, rules: &[MappingRule]) -> RawHeader {
    let mut normalized = header.clone();
    crate::models::mapping::apply_rules(&mut normalized.cards, rules);
    normalized
}
