//! Storage tier lifecycle of frames and masters
//!
//! `Local -> CloudPending -> CloudVerified -> SoftDeleted`. The catalog keeps
//! the state in `tier_state` plus the location columns; `soft_delete` and
//! `cloud_url` are derived from it so the legacy columns stay consistent.

use super::ids::{ContentHash, MasterId};
use crate::error::{ArchiveError, ArchiveResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TierState {
    /// Only the local copy exists
    Local,
    /// Upload started; `location` is not trusted until verified
    CloudPending { location: String },
    /// Remote copy hashed equal to the local content
    CloudVerified { url: String },
    /// Local bytes removed; recoverable only from `url`
    SoftDeleted { url: String },
}

impl TierState {
    pub fn name(&self) -> &'static str {
        match self {
            TierState::Local => "local",
            TierState::CloudPending { .. } => "cloud_pending",
            TierState::CloudVerified { .. } => "cloud_verified",
            TierState::SoftDeleted { .. } => "soft_deleted",
        }
    }

    /// Verified cloud URL, if any
    pub fn cloud_url(&self) -> Option<&str> {
        match self {
            TierState::CloudVerified { url } | TierState::SoftDeleted { url } => Some(url),
            _ => None,
        }
    }

    pub fn is_soft_deleted(&self) -> bool {
        matches!(self, TierState::SoftDeleted { .. })
    }

    /// Rebuild the state from catalog columns, rejecting combinations that
    /// would claim a cloud copy that was never recorded
    pub fn from_columns(
        state: &str,
        pending_location: Option<String>,
        cloud_url: Option<String>,
    ) -> ArchiveResult<Self> {
        let corrupt = |what: &str| {
            ArchiveError::InvalidInput(format!("tier state '{}' stored without {}", state, what))
        };
        match state {
            "local" => Ok(TierState::Local),
            "cloud_pending" => pending_location
                .map(|location| TierState::CloudPending { location })
                .ok_or_else(|| corrupt("pending location")),
            "cloud_verified" => cloud_url
                .map(|url| TierState::CloudVerified { url })
                .ok_or_else(|| corrupt("cloud url")),
            "soft_deleted" => cloud_url
                .map(|url| TierState::SoftDeleted { url })
                .ok_or_else(|| corrupt("cloud url")),
            other => Err(ArchiveError::InvalidInput(format!("unknown tier state '{}'", other))),
        }
    }
}

impl fmt::Display for TierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A catalog entry subject to tiering: `frame:<hash>` or `master:<uuid>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Frame(ContentHash),
    Master(MasterId),
}

impl Subject {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Subject::Frame(_) => "fitsfile",
            Subject::Master(_) => "masters",
        }
    }

    pub(crate) fn key_column(&self) -> &'static str {
        match self {
            Subject::Frame(_) => "content_hash",
            Subject::Master(_) => "master_id",
        }
    }

    pub(crate) fn key(&self) -> String {
        match self {
            Subject::Frame(hash) => hash.to_string(),
            Subject::Master(id) => id.to_string(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Frame(hash) => write!(f, "frame:{}", hash),
            Subject::Master(id) => write!(f, "master:{}", id),
        }
    }
}

impl FromStr for Subject {
    type Err = ArchiveError;

    fn from_str(s: &str) -> ArchiveResult<Self> {
        match s.split_once(':') {
            Some(("frame", hash)) => Ok(Subject::Frame(hash.parse()?)),
            Some(("master", id)) => Ok(Subject::Master(id.parse()?)),
            _ => Err(ArchiveError::InvalidInput(format!(
                "'{}' is not frame:<hash> or master:<id>",
                s
            ))),
        }
    }
}
