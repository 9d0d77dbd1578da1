//! # AFM Common Library
//!
//! Shared code for the astrophotography file manager:
//! - Error type shared by every crate
//! - Configuration file loading (SOURCE / REPO roots and tunables)
//! - Event bus for lifecycle notifications
//! - Database initialization, declarative table schemas and versioned upgrades

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
