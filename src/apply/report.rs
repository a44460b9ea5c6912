//! Apply results

use crate::error::AppError;
use crate::snapshot::SchemaSnapshot;
use crate::verify::VerificationReport;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    Staged,
    Snapshotting,
    Migrating,
    Succeeded,
    PartialFailure,
    FunctionsDeployed,
    Verified,
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplyPhase::Staged => "staged",
            ApplyPhase::Snapshotting => "snapshotting",
            ApplyPhase::Migrating => "migrating",
            ApplyPhase::Succeeded => "succeeded",
            ApplyPhase::PartialFailure => "partial_failure",
            ApplyPhase::FunctionsDeployed => "functions_deployed",
            ApplyPhase::Verified => "verified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStage {
    Snapshot,
    Migration,
    Function,
    Manifest,
}

/// One structured failure inside an apply run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyIssue {
    pub stage: ApplyStage,
    pub target: String,
    pub code: String,
    pub message: String,
}

impl ApplyIssue {
    pub fn from_error(stage: ApplyStage, target: impl Into<String>, err: &AppError) -> Self {
        Self {
            stage,
            target: target.into(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub success: bool,
    pub phase: ApplyPhase,
    pub snapshot: Option<SchemaSnapshot>,
    pub applied_migrations: Vec<String>,
    pub skipped_migrations: Vec<String>,
    pub failed_migrations: Vec<String>,
    pub deployed_functions: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<ApplyIssue>,
    pub verification: Option<VerificationReport>,
    pub duration_ms: u64,
}

impl ApplyReport {
    pub fn new() -> Self {
        Self {
            success: false,
            phase: ApplyPhase::Staged,
            snapshot: None,
            applied_migrations: Vec::new(),
            skipped_migrations: Vec::new(),
            failed_migrations: Vec::new(),
            deployed_functions: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            verification: None,
            duration_ms: 0,
        }
    }

    /// Every migration committed and nothing was skipped
    pub fn all_committed(&self) -> bool {
        self.failed_migrations.is_empty() && self.skipped_migrations.is_empty()
    }
}

impl Default for ApplyReport {
    fn default() -> Self {
        Self::new()
    }
}
