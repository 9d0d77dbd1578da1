//! Session grouping
//!
//! Frames join the most recently created session with the same grouping key
//! whose latest frame lies within the configured window. There is no close
//! operation: a later matching frame simply extends the session again.

use crate::db::{sessions, variable_stars};
use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{RoleState, Session, SessionId, SessionKey};
use afm_common::config::ArchiveConfig;
use afm_common::events::{ArchiveEvent, EventBus};
use chrono::{Duration, Utc};
use sqlx::SqliteConnection;
use tokio::sync::{Mutex, MutexGuard};

pub struct SessionGrouper {
    window: Duration,
    events: EventBus,
    /// Find-or-create must not interleave, or two frames of a new run could
    /// each open their own session
    assign_lock: Mutex<()>,
}

/// Exclusive right to assign sessions
///
/// Hold it until the transaction that stores the frame has committed.
pub struct AssignGuard<'a> {
    _held: MutexGuard<'a, ()>,
}

/// Outcome of assigning one frame
#[derive(Debug, Clone)]
pub struct Assigned {
    pub session: Session,
    pub created: bool,
}

impl SessionGrouper {
    pub fn new(config: &ArchiveConfig, events: EventBus) -> Self {
        Self {
            window: config.session_window(),
            events,
            assign_lock: Mutex::new(()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn lock(&self) -> AssignGuard<'_> {
        AssignGuard {
            _held: self.assign_lock.lock().await,
        }
    }

    /// Session for a frame with grouping attributes `key`
    ///
    /// Runs on the caller's transaction so that a frame insert failing
    /// afterwards leaves no empty or stretched session behind. Call
    /// `announce` once it has committed.
    pub async fn assign(
        &self,
        _guard: &AssignGuard<'_>,
        conn: &mut SqliteConnection,
        key: &SessionKey,
    ) -> ArchiveResult<Assigned> {
        if let Some(open) = sessions::find_open_session(&mut *conn, key, self.window).await? {
            sessions::extend_session(&mut *conn, open.id, &key.observed_at).await?;
            let session = sessions::load_session(&mut *conn, open.id)
                .await?
                .ok_or_else(|| ArchiveError::NotFound(format!("session {}", open.id)))?;
            return Ok(Assigned { session, created: false });
        }

        let is_variable_star = match (&key.object_name, key.frame_type.calibration_role()) {
            (Some(object), None) => variable_stars::is_variable_star(&mut *conn, object).await?,
            _ => false,
        };

        let session = Session {
            id: SessionId::new(),
            date: key.observed_at,
            object_name: key.object_name.clone(),
            frame_type: key.frame_type,
            telescope: key.telescope.clone(),
            instrument: key.instrument.clone(),
            filter: key.filter.clone(),
            is_auto_calibration: false,
            bias: RoleState::default(),
            dark: RoleState::default(),
            flat: RoleState::default(),
            is_variable_star,
            last_frame_at: key.observed_at,
            created_at: Utc::now(),
        };
        sessions::insert_session(&mut *conn, &session).await?;

        Ok(Assigned { session, created: true })
    }

    /// Log a committed assignment and publish new sessions
    pub fn announce(&self, assigned: &Assigned) {
        let session = &assigned.session;
        if !assigned.created {
            tracing::debug!(session_id = %session.id, frame_type = %session.frame_type, "Frame joined open session");
            return;
        }

        tracing::info!(
            session_id = %session.id,
            frame_type = %session.frame_type,
            object = session.object_name.as_deref().unwrap_or("-"),
            instrument = session.instrument.as_deref().unwrap_or("-"),
            filter = session.filter.as_deref().unwrap_or("-"),
            variable_star = session.is_variable_star,
            "Session created"
        );
        self.events.emit_lossy(ArchiveEvent::SessionCreated {
            session_id: session.id.as_uuid(),
            frame_type: session.frame_type.as_str().to_string(),
            object_name: session.object_name.clone(),
            timestamp: session.created_at,
        });
    }
}
