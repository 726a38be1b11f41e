//! Storage
//!
//! SQLite-backed persistence: whole-snapshot project storage plus
//! append-only codebook history, audit log, and reliability reports.

pub mod database;

pub use database::{Database, PoolConfig, ProjectSummary, SharedDatabase};
