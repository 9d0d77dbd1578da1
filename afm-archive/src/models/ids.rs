//! Typed identifiers
//!
//! The catalog stores every identifier as TEXT. These wrappers keep hashes,
//! session ids and master ids from being mixed up at the catalog boundary.

use crate::error::{ArchiveError, ArchiveResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lowercase hex SHA-256 of a file's bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Accepts a 64-digit hex digest in either case
    pub fn parse(value: &str) -> ArchiveResult<Self> {
        let value = value.trim();
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ArchiveError::InvalidInput(format!(
                "'{}' is not a SHA-256 content hash",
                value
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Hash of an in-memory buffer
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Wraps a digest read back from the catalog
    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, for log lines and directory fan-out
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ArchiveError;

    fn from_str(s: &str) -> ArchiveResult<Self> {
        Self::parse(s)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub(crate) fn from_stored(value: &str) -> ArchiveResult<Self> {
                Uuid::parse_str(value).map(Self).map_err(|_| {
                    ArchiveError::InvalidInput(format!("corrupt {} '{}' in catalog", $label, value))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ArchiveError;

            fn from_str(s: &str) -> ArchiveResult<Self> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ArchiveError::InvalidInput(format!("'{}' is not a {}", s, $label)))
            }
        }
    };
}

uuid_id!(
    /// Identity of an observing session
    SessionId,
    "session id"
);

uuid_id!(
    /// Identity of a synthesized master frame
    MasterId,
    "master id"
);
