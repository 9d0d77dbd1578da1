//! Synthesized master calibration frames

use super::frame::{Acquisition, CalibrationRole};
use super::ids::{ContentHash, MasterId, SessionId};
use super::tier::TierState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Master {
    pub id: MasterId,
    pub master_type: CalibrationRole,
    pub path: PathBuf,
    pub creation_date: DateTime<Utc>,
    /// Key tuple the master matches on, plus temperature/gain/offset for reference
    pub acquisition: Acquisition,
    pub source_session_id: Option<SessionId>,
    pub file_count: i64,
    pub quality_score: Option<f64>,
    pub file_size: Option<i64>,
    pub hash: ContentHash,
    pub is_validated: bool,
    pub validation_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub tier: TierState,
    pub superseded_by: Option<MasterId>,
}

impl Master {
    /// Eligible for resolution: not superseded and local bytes still present
    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none() && !self.tier.is_soft_deleted()
    }
}
