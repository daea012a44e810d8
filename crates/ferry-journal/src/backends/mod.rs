//! Backend implementations for StepJournal
//!
//! This module provides different storage backends:
//! - `memory`: process-local, always available
//! - `sqlite`: SQLite-based backend (default, requires `sqlite` feature)
//! - `redb`: Pure Rust embedded database (requires `redb` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "redb")]
pub mod redb;
