//! Schema Snapshot Module
//!
//! Point-in-time, schema-only dumps of the `public` schema taken right before
//! an apply. Rollback replays the most recent one. Only the newest few are
//! kept on disk.

pub mod store;

pub use store::{SchemaSnapshot, SnapshotStore, DEFAULT_RETENTION};
