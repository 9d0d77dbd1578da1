//! Observing sessions

use super::frame::{CalibrationRole, FrameType};
use super::ids::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-role calibration bookkeeping of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleState {
    /// Calibration session selected (by the resolver or an operator)
    pub auto_cal_session: Option<SessionId>,
    /// A master has been created for this role; only moves false -> true
    /// except through an explicit operator reset
    pub master_created: bool,
}

/// A coherent observing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Observation time of the first frame
    pub date: DateTime<Utc>,
    pub object_name: Option<String>,
    pub frame_type: FrameType,
    pub telescope: Option<String>,
    pub instrument: Option<String>,
    pub filter: Option<String>,
    pub is_auto_calibration: bool,
    pub bias: RoleState,
    pub dark: RoleState,
    pub flat: RoleState,
    pub is_variable_star: bool,
    /// Observation time of the latest frame; the grouping window is measured from here
    pub last_frame_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn role(&self, role: CalibrationRole) -> &RoleState {
        match role {
            CalibrationRole::Bias => &self.bias,
            CalibrationRole::Dark => &self.dark,
            CalibrationRole::Flat => &self.flat,
        }
    }

    pub fn is_light(&self) -> bool {
        self.frame_type == FrameType::Light
    }
}

/// Grouping attributes of an incoming frame
#[derive(Debug, Clone, PartialEq)]
pub struct SessionKey {
    pub frame_type: FrameType,
    pub object_name: Option<String>,
    pub telescope: Option<String>,
    pub instrument: Option<String>,
    pub filter: Option<String>,
    pub observed_at: DateTime<Utc>,
}
