//! Common utilities and types shared across the offsync crates.
//!
//! This module provides the error taxonomy and the small identifier and
//! enumeration types that every component of the sync engine agrees on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Priority, RecordId, RecordKind, RecordStatus};
