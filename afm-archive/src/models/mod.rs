//! Catalog data models

pub mod frame;
pub mod ids;
pub mod mapping;
pub mod master;
pub mod session;
pub mod tier;

pub use frame::{
    dominant_key, Acquisition, CalibrationKey, CalibrationRefs, CalibrationRole, CalibrationState,
    Frame, FrameFilter, FrameHeader, FrameType, IngestOutcome, QualityMetrics,
};
pub use ids::{ContentHash, MasterId, SessionId};
pub use mapping::MappingRule;
pub use master::Master;
pub use session::{RoleState, Session, SessionKey};
pub use tier::{Subject, TierState};
