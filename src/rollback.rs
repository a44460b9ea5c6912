//! Rollback Engine
//!
//! Restores the schema from the most recent pre-apply snapshot. The database
//! drops and recreates `public` and replays the snapshot DDL in a single
//! transaction, so a failed restore leaves the current schema untouched.
//!
//! After a successful restore the project manifest forgets the applies made
//! since the snapshot, and their migrations leave `migrations/` for
//! `<state>/rolled_back/<snapshot>/`, so re-applying the plan runs them again.

use crate::apply::move_file;
use crate::config::ProjectConfig;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::manifest::{HistoryAction, HistoryEntry, ProjectManifest};
use crate::snapshot::{SchemaSnapshot, SnapshotStore};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub success: bool,
    pub snapshot: SchemaSnapshot,
    /// Live migrations moved out because the restore undid them
    pub rewound_migrations: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

pub struct RollbackEngine<'a> {
    project: &'a ProjectConfig,
    db: &'a dyn Database,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(project: &'a ProjectConfig, db: &'a dyn Database) -> Self {
        Self { project, db }
    }

    /// Restore the newest snapshot
    pub async fn rollback_last(&self) -> AppResult<RollbackReport> {
        let started = Instant::now();
        let store = SnapshotStore::new(self.project.snapshots_dir(), self.project.snapshot_retention);
        let snapshot = store.latest()?.ok_or(AppError::NoSnapshotAvailable)?;
        let ddl = store.read(&snapshot)?;

        info!("Restoring schema from {} (taken {})", snapshot.id, snapshot.taken_at.to_rfc3339());
        let restored = self.db.restore_schema(&ddl).await;

        let manifest_path = self.project.manifest_path();
        let mut manifest = ProjectManifest::load(&manifest_path)?;
        let rewound = if restored.is_ok() {
            manifest.rewind(&snapshot.id)
        } else {
            Vec::new()
        };
        let summary = format!("rollback to {}", snapshot.id);
        let mut entry = HistoryEntry::new(HistoryAction::Rollback, summary, restored.is_ok());
        entry.snapshot = Some(snapshot.id.clone());
        entry.migrations = rewound.clone();
        manifest.record_history(entry);
        let saved = manifest.save(&manifest_path);
        if let Err(e) = &saved {
            warn!("Could not record rollback in {}: {}", manifest_path.display(), e);
        }

        restored?;

        let mut warnings = vec![format!(
            "Rows written after {} are not restored; only the schema was rolled back",
            snapshot.taken_at.to_rfc3339()
        )];
        if let Err(e) = saved {
            warnings.push(format!(
                "The project manifest was not updated ({}); the next apply may skip migrations this rollback undid",
                e
            ));
        }

        let live_dir = self.project.live_migrations_dir();
        let parked = self.project.rolled_back_dir(&snapshot.id);
        for name in &rewound {
            let live = live_dir.join(name);
            if !live.exists() {
                continue;
            }
            match move_file(&live, &parked.join(name)) {
                Ok(()) => debug!("Moved {} to {}", name, parked.display()),
                Err(e) => warnings.push(format!(
                    "{} is still in {} ({}); re-apply with --force to run it again",
                    name,
                    live_dir.display(),
                    e
                )),
            }
        }
        info!("Rollback undid {} migrations", rewound.len());

        Ok(RollbackReport {
            success: true,
            snapshot,
            rewound_migrations: rewound,
            warnings,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
