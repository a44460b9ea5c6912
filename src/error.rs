//! Error handling module
//!
//! Provides the unified error type for planning, applying, rolling back and
//! packaging. Pre-flight errors abort before any side effect; execution-time
//! errors are folded into structured reports by the engines instead.

use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unsupported plan version: {0}")]
    InvalidPlanVersion(String),

    #[error("Invalid identifier: {0}")]
    IdentifierInvalid(String),

    #[error("Migration conflict: {0} already exists")]
    MigrationConflict(String),

    #[error("Migration {name} failed: {message}")]
    MigrationExecution { name: String, message: String },

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    #[error("No schema snapshot available to roll back to")]
    NoSnapshotAvailable,

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Template requires platform version {required}, this is {current}")]
    VersionIncompatible { required: String, current: String },

    #[error("Verification probe failed: {0}")]
    VerificationProbe(String),

    #[error("{0}")]
    Manifest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, printed at the CLI boundary
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidPlanVersion(_) => "INVALID_PLAN_VERSION",
            AppError::IdentifierInvalid(_) => "IDENTIFIER_INVALID",
            AppError::MigrationConflict(_) => "MIGRATION_CONFLICT",
            AppError::MigrationExecution { .. } => "MIGRATION_EXECUTION_FAILURE",
            AppError::Snapshot(_) => "SNAPSHOT_FAILURE",
            AppError::NoSnapshotAvailable => "NO_SNAPSHOT_AVAILABLE",
            AppError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            AppError::VersionIncompatible { .. } => "VERSION_INCOMPATIBLE",
            AppError::VerificationProbe(_) => "VERIFICATION_PROBE_FAILURE",
            AppError::Manifest(_) => "MANIFEST_INVALID",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Pool(_) => "POOL_EXHAUSTED",
            AppError::Io(_) => "IO_ERROR",
            AppError::Yaml(_) => "YAML_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Http(_) => "HTTP_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Remediation hint for the operator, if there is a useful one
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            AppError::InvalidPlanVersion(_) => Some("set `version: 1` in the plan file"),
            AppError::IdentifierInvalid(_) => {
                Some("identifiers must match ^[a-z_][a-z0-9_]*$ (lowercase, digits, underscores)")
            }
            AppError::MigrationConflict(_) => Some("use --force to overwrite existing artifacts"),
            AppError::MigrationExecution { .. } => {
                Some("fix the failing migration and re-run apply, or run `schemaflow rollback --last`")
            }
            AppError::NoSnapshotAvailable => Some("snapshots are taken automatically by `schemaflow apply`"),
            AppError::ChecksumMismatch { .. } => Some("re-download the template archive and verify its .sha256"),
            AppError::VersionIncompatible { .. } => Some("upgrade schemaflow before installing this template"),
            AppError::VerificationProbe(_) => Some("run `schemaflow rollback --last` to restore the previous schema"),
            AppError::Database(_) | AppError::Pool(_) => Some("check DATABASE_URL and that the database is reachable"),
            AppError::Config(_) => Some("check .env, schemaflow.toml and SCHEMAFLOW__* variables"),
            _ => None,
        }
    }

    /// Log the error once at the boundary where it stops propagating
    pub fn log(&self) {
        match self {
            AppError::Database(e) => error!("Database error: {:?}", e),
            AppError::Pool(e) => error!("Pool error: {:?}", e),
            AppError::Internal(msg) => error!("Internal error: {}", msg),
            other => error!("{}", other),
        }
    }
}

/// Result type alias used across the crate
pub type AppResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create an identifier error
pub fn identifier_error(msg: impl Into<String>) -> AppError {
    AppError::IdentifierInvalid(msg.into())
}

/// Helper function to create a template manifest error
pub fn manifest_error(msg: impl Into<String>) -> AppError {
    AppError::Manifest(msg.into())
}
