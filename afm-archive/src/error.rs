//! Error types for afm-archive
//!
//! Every variant that reaches an operator names the entity key (content
//! hash, session id, master id) and the rule that was violated.

use std::sync::Arc;
use thiserror::Error;

/// Archive error type
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// No master exists and none can be synthesized yet; calibration deferred
    #[error("No {role} calibration available for light session {session_id}; calibration deferred")]
    Unresolved { session_id: String, role: String },

    /// Calibration session cannot be combined; left unprocessed for correction
    #[error("Cannot synthesize master from session {session_id}: {reason} (frames: {})", offending.join(", "))]
    Synthesis {
        session_id: String,
        reason: String,
        offending: Vec<String>,
    },

    /// Remote copy does not hash to the local content
    #[error("Cloud copy of {subject} does not match expected hash {expected}; local copy kept")]
    VerificationMismatch { subject: String, expected: String },

    /// Tier transition guard rejected the request; state unchanged
    #[error("Refused {from} -> {to} for {subject}: {reason}")]
    TransitionRefused {
        subject: String,
        from: String,
        to: String,
        reason: String,
    },

    /// A typed reference points at a record that does not exist or has the wrong kind
    #[error("{entity} references missing or mismatched {reference}")]
    ReferentialIntegrity { entity: String, reference: String },

    /// Operation exceeded its deadline; no state was changed
    #[error("{operation} for {subject} timed out; left pending")]
    Timeout { operation: String, subject: String },

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed operator input or FITS header
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// afm-common error
    #[error(transparent)]
    Common(#[from] afm_common::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// True for transient SQLite lock contention
    pub fn is_lock_contention(&self) -> bool {
        match self {
            ArchiveError::Database(e) => e.to_string().contains("database is locked"),
            ArchiveError::Common(e) => e.is_lock_contention(),
            _ => false,
        }
    }

    /// Recover an error handed to several waiters of one shared operation
    ///
    /// The last holder gets the original; others get an equivalent copy.
    /// Database and IO errors are not cloneable and keep only their message.
    pub(crate) fn from_shared(error: Arc<ArchiveError>) -> Self {
        Arc::try_unwrap(error).unwrap_or_else(|shared| shared.duplicate())
    }

    fn duplicate(&self) -> Self {
        match self {
            ArchiveError::Unresolved { session_id, role } => ArchiveError::Unresolved {
                session_id: session_id.clone(),
                role: role.clone(),
            },
            ArchiveError::Synthesis { session_id, reason, offending } => ArchiveError::Synthesis {
                session_id: session_id.clone(),
                reason: reason.clone(),
                offending: offending.clone(),
            },
            ArchiveError::VerificationMismatch { subject, expected } => ArchiveError::VerificationMismatch {
                subject: subject.clone(),
                expected: expected.clone(),
            },
            ArchiveError::TransitionRefused { subject, from, to, reason } => ArchiveError::TransitionRefused {
                subject: subject.clone(),
                from: from.clone(),
                to: to.clone(),
                reason: reason.clone(),
            },
            ArchiveError::ReferentialIntegrity { entity, reference } => ArchiveError::ReferentialIntegrity {
                entity: entity.clone(),
                reference: reference.clone(),
            },
            ArchiveError::Timeout { operation, subject } => ArchiveError::Timeout {
                operation: operation.clone(),
                subject: subject.clone(),
            },
            ArchiveError::NotFound(what) => ArchiveError::NotFound(what.clone()),
            ArchiveError::InvalidInput(what) => ArchiveError::InvalidInput(what.clone()),
            ArchiveError::Io(e) => ArchiveError::Io(std::io::Error::new(e.kind(), e.to_string())),
            other => ArchiveError::Common(afm_common::Error::Internal(other.to_string())),
        }
    }
}

/// Result type for archive operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;
