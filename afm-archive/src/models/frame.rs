//! Frame records and acquisition metadata

use super::ids::{ContentHash, MasterId, SessionId};
use super::tier::TierState;
use crate::error::{ArchiveError, ArchiveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Declared image type of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Light,
    Dark,
    Flat,
    Bias,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Light => "light",
            FrameType::Dark => "dark",
            FrameType::Flat => "flat",
            FrameType::Bias => "bias",
        }
    }

    /// Calibration role served by frames of this type, `None` for lights
    pub fn calibration_role(&self) -> Option<CalibrationRole> {
        match self {
            FrameType::Light => None,
            FrameType::Dark => Some(CalibrationRole::Dark),
            FrameType::Flat => Some(CalibrationRole::Flat),
            FrameType::Bias => Some(CalibrationRole::Bias),
        }
    }

    /// Interpret an `IMAGETYP` card as written by common capture programs
    pub fn from_imagetyp(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase();
        if v.contains("light") || v == "object" || v == "science" {
            Some(FrameType::Light)
        } else if v.contains("dark") {
            Some(FrameType::Dark)
        } else if v.contains("flat") {
            Some(FrameType::Flat)
        } else if v.contains("bias") || v.contains("offset") || v == "zero" {
            Some(FrameType::Bias)
        } else {
            None
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = ArchiveError;

    fn from_str(s: &str) -> ArchiveResult<Self> {
        match s {
            "light" => Ok(FrameType::Light),
            "dark" => Ok(FrameType::Dark),
            "flat" => Ok(FrameType::Flat),
            "bias" => Ok(FrameType::Bias),
            other => Err(ArchiveError::InvalidInput(format!("unknown frame type '{}'", other))),
        }
    }
}

/// Calibration role a master or calibration session plays for a light session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationRole {
    Bias,
    Dark,
    Flat,
}

impl CalibrationRole {
    pub const ALL: [CalibrationRole; 3] =
        [CalibrationRole::Bias, CalibrationRole::Dark, CalibrationRole::Flat];

    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationRole::Bias => "bias",
            CalibrationRole::Dark => "dark",
            CalibrationRole::Flat => "flat",
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            CalibrationRole::Bias => FrameType::Bias,
            CalibrationRole::Dark => FrameType::Dark,
            CalibrationRole::Flat => FrameType::Flat,
        }
    }

    /// `fitssession` flag recording that a master was created for this role
    pub(crate) fn created_column(&self) -> &'static str {
        match self {
            CalibrationRole::Bias => "master_bias_created",
            CalibrationRole::Dark => "master_dark_created",
            CalibrationRole::Flat => "master_flat_created",
        }
    }

    /// `fitssession` reference to the calibration session chosen for this role
    pub(crate) fn auto_cal_column(&self) -> &'static str {
        match self {
            CalibrationRole::Bias => "auto_cal_bias_session_id",
            CalibrationRole::Dark => "auto_cal_dark_session_id",
            CalibrationRole::Flat => "auto_cal_flat_session_id",
        }
    }

    /// Exposure must match only for darks
    pub fn matches_exposure(&self) -> bool {
        matches!(self, CalibrationRole::Dark)
    }

    /// Filter must match only for flats
    pub fn matches_filter(&self) -> bool {
        matches!(self, CalibrationRole::Flat)
    }
}

impl fmt::Display for CalibrationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalibrationRole {
    type Err = ArchiveError;

    fn from_str(s: &str) -> ArchiveResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bias" => Ok(CalibrationRole::Bias),
            "dark" => Ok(CalibrationRole::Dark),
            "flat" => Ok(CalibrationRole::Flat),
            other => Err(ArchiveError::InvalidInput(format!(
                "unknown calibration role '{}' (expected bias, dark or flat)",
                other
            ))),
        }
    }
}

/// Acquisition attributes recorded for a frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub telescope: Option<String>,
    pub instrument: Option<String>,
    pub filter: Option<String>,
    /// Seconds
    pub exposure: Option<f64>,
    pub binning_x: Option<i64>,
    pub binning_y: Option<i64>,
    pub ccd_temp: Option<f64>,
    pub gain: Option<f64>,
    pub offset: Option<f64>,
}

impl Acquisition {
    /// The attributes a calibration frame must share with a light for `role`
    pub fn calibration_key(&self, role: CalibrationRole) -> CalibrationKey {
        CalibrationKey {
            telescope: self.telescope.clone(),
            instrument: self.instrument.clone(),
            binning_x: self.binning_x,
            binning_y: self.binning_y,
            exposure: if role.matches_exposure() { self.exposure } else { None },
            filter: if role.matches_filter() { self.filter.clone() } else { None },
        }
    }
}

/// Exposures closer than this are treated as equal
pub const EXPOSURE_TOLERANCE: f64 = 1e-3;

/// Matching key between light sessions, calibration sessions and masters
///
/// `exposure` is only populated for darks and `filter` only for flats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationKey {
    pub telescope: Option<String>,
    pub instrument: Option<String>,
    pub binning_x: Option<i64>,
    pub binning_y: Option<i64>,
    pub exposure: Option<f64>,
    pub filter: Option<String>,
}

impl PartialEq for CalibrationKey {
    fn eq(&self, other: &Self) -> bool {
        let exposure_eq = match (self.exposure, other.exposure) {
            (Some(a), Some(b)) => (a - b).abs() < EXPOSURE_TOLERANCE,
            (None, None) => true,
            _ => false,
        };
        exposure_eq
            && self.telescope == other.telescope
            && self.instrument == other.instrument
            && self.binning_x == other.binning_x
            && self.binning_y == other.binning_y
            && self.filter == other.filter
    }
}

impl fmt::Display for CalibrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}/{} bin {}x{}",
            opt(&self.telescope),
            opt(&self.instrument),
            self.binning_x.map_or("-".to_string(), |b| b.to_string()),
            self.binning_y.map_or("-".to_string(), |b| b.to_string()),
        )?;
        if let Some(exposure) = self.exposure {
            write!(f, " {}s", exposure)?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " filter {}", filter)?;
        }
        Ok(())
    }
}

/// Image quality metrics reported by the capture or analysis software
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub avg_fwhm: Option<f64>,
    pub avg_eccentricity: Option<f64>,
    pub avg_hfr: Option<f64>,
    pub image_snr: Option<f64>,
    pub star_count: Option<i64>,
    pub image_scale: Option<f64>,
}

/// Normalized header content ready for ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub object_name: Option<String>,
    pub date_obs: Option<DateTime<Utc>>,
    pub acquisition: Acquisition,
    pub observer: Option<String>,
    pub notes: Option<String>,
    pub quality: QualityMetrics,
}

/// Calibration provenance of a derived frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRefs {
    pub bias: Option<MasterId>,
    pub dark: Option<MasterId>,
    pub flat: Option<MasterId>,
}

impl CalibrationRefs {
    pub fn iter(&self) -> impl Iterator<Item = (CalibrationRole, MasterId)> + '_ {
        [
            (CalibrationRole::Bias, self.bias),
            (CalibrationRole::Dark, self.dark),
            (CalibrationRole::Flat, self.flat),
        ]
        .into_iter()
        .filter_map(|(role, id)| id.map(|id| (role, id)))
    }
}

/// Calibration state of a frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub calibration_date: Option<DateTime<Utc>>,
    pub masters: CalibrationRefs,
    /// Pre-calibration original this frame was derived from
    pub original_file_ref: Option<ContentHash>,
    pub original_cloud_url: Option<String>,
}

/// One catalogued image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub hash: ContentHash,
    pub path: PathBuf,
    pub frame_type: FrameType,
    pub session_id: Option<SessionId>,
    pub object_name: Option<String>,
    pub date_obs: Option<DateTime<Utc>>,
    pub acquisition: Acquisition,
    pub observer: Option<String>,
    pub notes: Option<String>,
    pub quality: QualityMetrics,
    pub calibration: CalibrationState,
    pub tier: TierState,
    pub file_size: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Frame {
    pub fn is_calibrated(&self) -> bool {
        self.calibration.calibration_date.is_some()
    }
}

/// Result of cataloguing one file
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// First time this content was seen
    New(Frame),
    /// Content already catalogued; the existing record is returned unchanged
    Duplicate(Frame),
}

impl IngestOutcome {
    pub fn frame(&self) -> &Frame {
        match self {
            IngestOutcome::New(frame) | IngestOutcome::Duplicate(frame) => frame,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            IngestOutcome::New(frame) | IngestOutcome::Duplicate(frame) => frame,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate(_))
    }
}

/// Filter for lazy catalog queries; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    pub session_id: Option<SessionId>,
    pub frame_type: Option<FrameType>,
    /// `Some(true)` only calibrated derivatives, `Some(false)` only originals
    pub calibrated: Option<bool>,
    pub soft_deleted: Option<bool>,
}

/// Most common calibration key among `frames`
///
/// Ties go to the key seen first, so callers pass frames in a stable order.
pub fn dominant_key(frames: &[Frame], role: CalibrationRole) -> Option<CalibrationKey> {
    let mut counts: Vec<(CalibrationKey, usize)> = Vec::new();
    for frame in frames {
        let key = frame.acquisition.calibration_key(role);
        match counts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, n)) => *n += 1,
            None => counts.push((key, 1)),
        }
    }

    let mut best: Option<(CalibrationKey, usize)> = None;
    for (key, n) in counts {
        if best.as_ref().map_or(true, |(_, top)| n > *top) {
            best = Some((key, n));
        }
    }
    best.map(|(key, _)| key)
}
