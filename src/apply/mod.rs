//! Apply Engine
//!
//! Executes a plan against the live database:
//!
//! 1. pre-flight (version, `safety.requireForce`), compile and stage. Errors
//!    here are returned and nothing has touched the database.
//! 2. snapshot the schema (a failure is only a warning)
//! 3. run staged migrations in filename order, one transaction each, or all
//!    in one transaction with `atomic`
//! 4. move functions live and drop a reload marker for the runtime
//! 5. optionally verify, then record the run in the project manifest
//!
//! From step 2 on, failures are collected into the [`ApplyReport`] instead of
//! being returned. A failed migration stays staged and later ones still run.

pub mod report;

pub use report::{ApplyIssue, ApplyPhase, ApplyReport, ApplyStage};

use crate::compiler::{compile_with, GeneratedFile};
use crate::config::ProjectConfig;
use crate::db::{Database, NamedSql};
use crate::error::{validation_error, AppError, AppResult};
use crate::manifest::{HistoryAction, HistoryEntry, ProjectManifest};
use crate::plan::Plan;
use crate::snapshot::SnapshotStore;
use crate::staging::{write_generated, StagingArea};
use crate::verify::VerificationEngine;
use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Marker the function runtime watches for hot reloads
pub const RELOAD_MARKER: &str = ".reload";

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Overwrite live artifacts and bypass `safety.requireForce`
    pub force: bool,
    /// Run the plan's verification block after deploying
    pub verify: bool,
    /// All migrations in one transaction
    pub atomic: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            force: false,
            verify: true,
            atomic: false,
        }
    }
}

/// A staged migration ready to run
struct Pending {
    name: String,
    content: String,
    staged: PathBuf,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Rename, falling back to copy + remove across filesystems
pub(crate) fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

fn same_content(a: &Path, b: &Path) -> bool {
    match (fs::read(a), fs::read(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

pub struct ApplyEngine<'a> {
    project: &'a ProjectConfig,
    db: &'a dyn Database,
    verifier: Option<&'a VerificationEngine>,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(project: &'a ProjectConfig, db: &'a dyn Database) -> Self {
        Self {
            project,
            db,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: &'a VerificationEngine) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub async fn apply(&self, plan: &Plan, options: &ApplyOptions) -> AppResult<ApplyReport> {
        let started = Instant::now();

        // Pre-flight
        plan.check_version()?;
        let safety = plan.safety();
        if safety.require_force && !options.force {
            return Err(validation_error(
                "plan sets safety.requireForce; re-run with --force to apply it",
            ));
        }

        let manifest_path = self.project.manifest_path();
        let mut manifest = ProjectManifest::load(&manifest_path)?;
        let output = compile_with(plan, &self.project.compile_options(manifest.clone()))?;

        let staging = StagingArea::new(self.project.staging_dir());
        staging.clear()?;
        staging.stage(&output, true)?;

        let mut report = ApplyReport::new();
        report.warnings.extend(output.warnings.iter().cloned());
        info!("Applying plan '{}' ({} migrations staged)", plan.summary, output.migrations.len());

        let generated: Vec<GeneratedFile> = output
            .sdk_files
            .iter()
            .chain(output.test_files.iter())
            .cloned()
            .collect();
        if let Err(e) = write_generated(self.project, &generated, options.force) {
            report
                .warnings
                .push(format!("Generated SDK/test files were not written: {}", e));
        }

        // Snapshot
        report.phase = ApplyPhase::Snapshotting;
        if safety.snapshot {
            let store = SnapshotStore::new(self.project.snapshots_dir(), self.project.snapshot_retention);
            match store.capture(self.db).await {
                Ok(snapshot) => report.snapshot = Some(snapshot),
                Err(e) => {
                    warn!("Pre-apply snapshot failed: {}", e);
                    report.warnings.push(format!(
                        "Pre-apply snapshot failed ({}); `rollback --last` will restore an older snapshot if one exists",
                        e
                    ));
                }
            }
        } else {
            report
                .warnings
                .push("Snapshot disabled by safety.snapshot=false; this apply cannot be rolled back".to_string());
        }

        // Migrations
        report.phase = ApplyPhase::Migrating;
        let mut committed: Vec<(String, String)> = Vec::new();
        let pending = self.collect_pending(&staging, options, &mut report);
        if options.atomic {
            self.migrate_atomic(pending, &mut report, &mut committed).await;
        } else {
            self.migrate_each(pending, &mut report, &mut committed).await;
        }

        let migrations_ok = report.all_committed() && report.errors.is_empty();
        report.phase = if migrations_ok {
            ApplyPhase::Succeeded
        } else {
            ApplyPhase::PartialFailure
        };

        // Functions
        self.deploy_functions(&staging, options, &mut report);
        if report.phase == ApplyPhase::Succeeded {
            report.phase = ApplyPhase::FunctionsDeployed;
        }

        // Verification
        if options.verify {
            if let Some(spec) = &plan.verification {
                match self.verifier {
                    Some(verifier) => {
                        let result = verifier.run(spec).await;
                        if result.success {
                            if report.phase == ApplyPhase::FunctionsDeployed {
                                report.phase = ApplyPhase::Verified;
                            }
                        } else {
                            report.warnings.push(format!(
                                "Verification failed ({} of {} probes); inspect the report and run `schemaflow rollback --last` to restore the pre-apply schema",
                                result.failed,
                                result.probes.len()
                            ));
                        }
                        report.verification = Some(result);
                    }
                    None => report
                        .warnings
                        .push("Verification skipped: services.api_url is not configured".to_string()),
                }
            }
        }

        // Manifest
        report.success = report.all_committed() && report.errors.is_empty();
        for (name, content) in &committed {
            manifest.record_migration(name, content);
        }
        let mut entry = HistoryEntry::new(HistoryAction::Apply, plan.summary.clone(), report.success);
        if report.all_committed() {
            let known: Vec<String> = manifest.tables.keys().cloned().collect();
            manifest.record_plan(plan);
            entry.tables = manifest
                .tables
                .keys()
                .filter(|name| !known.contains(name))
                .cloned()
                .collect();
        }
        entry.snapshot = report.snapshot.as_ref().map(|s| s.id.clone());
        entry.migrations = report.applied_migrations.clone();
        manifest.record_history(entry);
        if let Err(e) = manifest.save(&manifest_path) {
            report
                .errors
                .push(ApplyIssue::from_error(ApplyStage::Manifest, manifest_path.display().to_string(), &e));
            report.success = false;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Apply finished in {}ms: phase={}, applied={}, failed={}, skipped={}",
            report.duration_ms,
            report.phase,
            report.applied_migrations.len(),
            report.failed_migrations.len(),
            report.skipped_migrations.len()
        );
        Ok(report)
    }

    /// Read staged migrations; conflicting ones are skipped, identical ones dropped
    fn collect_pending(&self, staging: &StagingArea, options: &ApplyOptions, report: &mut ApplyReport) -> Vec<Pending> {
        let staged = match staging.staged_migrations() {
            Ok(files) => files,
            Err(e) => {
                report.errors.push(ApplyIssue::from_error(ApplyStage::Migration, "staging", &e));
                return Vec::new();
            }
        };

        let live_dir = self.project.live_migrations_dir();
        let mut pending = Vec::with_capacity(staged.len());
        for path in staged {
            let name = file_name(&path);
            let live = live_dir.join(&name);

            if live.exists() && !options.force {
                if same_content(&path, &live) {
                    debug!("{} is already live and unchanged", name);
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("Could not unstage {}: {}", name, e);
                    }
                    continue;
                }
                let err = AppError::MigrationConflict(name.clone());
                warn!("{}", err);
                report.errors.push(ApplyIssue::from_error(ApplyStage::Migration, &name, &err));
                report.skipped_migrations.push(name);
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(content) => pending.push(Pending {
                    name,
                    content,
                    staged: path,
                }),
                Err(e) => {
                    report
                        .errors
                        .push(ApplyIssue::from_error(ApplyStage::Migration, &name, &AppError::Io(e)));
                    report.failed_migrations.push(name);
                }
            }
        }
        pending
    }

    fn promote(&self, migration: &Pending, report: &mut ApplyReport) {
        let live = self.project.live_migrations_dir().join(&migration.name);
        if let Err(e) = move_file(&migration.staged, &live) {
            report.warnings.push(format!(
                "{} committed but could not be moved to {}: {}",
                migration.name,
                live.display(),
                e
            ));
        }
    }

    async fn migrate_each(
        &self,
        pending: Vec<Pending>,
        report: &mut ApplyReport,
        committed: &mut Vec<(String, String)>,
    ) {
        for migration in pending {
            match self.db.execute_migration(&migration.name, &migration.content).await {
                Ok(()) => {
                    info!("Applied {}", migration.name);
                    self.promote(&migration, report);
                    report.applied_migrations.push(migration.name.clone());
                    committed.push((migration.name, migration.content));
                }
                Err(e) => {
                    warn!("{}", e);
                    report
                        .errors
                        .push(ApplyIssue::from_error(ApplyStage::Migration, &migration.name, &e));
                    report.failed_migrations.push(migration.name);
                }
            }
        }
    }

    async fn migrate_atomic(
        &self,
        pending: Vec<Pending>,
        report: &mut ApplyReport,
        committed: &mut Vec<(String, String)>,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch: Vec<NamedSql> = pending
            .iter()
            .map(|m| (m.name.clone(), m.content.clone()))
            .collect();

        match self.db.execute_atomic(&batch).await {
            Ok(()) => {
                info!("Applied {} migrations in one transaction", pending.len());
                for migration in pending {
                    self.promote(&migration, report);
                    report.applied_migrations.push(migration.name.clone());
                    committed.push((migration.name, migration.content));
                }
            }
            Err(e) => {
                let target = match &e {
                    AppError::MigrationExecution { name, .. } => name.clone(),
                    _ => "atomic batch".to_string(),
                };
                warn!("{}", e);
                report
                    .errors
                    .push(ApplyIssue::from_error(ApplyStage::Migration, target, &e));
                report.warnings.push(format!(
                    "Atomic batch rolled back; all {} migrations remain staged",
                    pending.len()
                ));
                report
                    .failed_migrations
                    .extend(pending.into_iter().map(|m| m.name));
            }
        }
    }

    fn deploy_functions(&self, staging: &StagingArea, options: &ApplyOptions, report: &mut ApplyReport) {
        let staged = match staging.staged_functions() {
            Ok(dirs) => dirs,
            Err(e) => {
                report.errors.push(ApplyIssue::from_error(ApplyStage::Function, "staging", &e));
                return;
            }
        };

        let live_dir = self.project.live_functions_dir();
        for dir in staged {
            let name = file_name(&dir);
            let target = live_dir.join(&name);

            if target.exists() {
                if !options.force {
                    if same_content(&dir.join("index.ts"), &target.join("index.ts")) {
                        debug!("Function {} is already live and unchanged", name);
                        if let Err(e) = fs::remove_dir_all(&dir) {
                            warn!("Could not unstage function {}: {}", name, e);
                        }
                        continue;
                    }
                    let err = AppError::MigrationConflict(format!("function {}", name));
                    report.errors.push(ApplyIssue::from_error(ApplyStage::Function, &name, &err));
                    continue;
                }
                if let Err(e) = fs::remove_dir_all(&target) {
                    report
                        .errors
                        .push(ApplyIssue::from_error(ApplyStage::Function, &name, &AppError::Io(e)));
                    continue;
                }
            }

            let moved = fs::create_dir_all(&live_dir).and_then(|_| fs::rename(&dir, &target));
            match moved {
                Ok(()) => {
                    info!("Deployed function {}", name);
                    report.deployed_functions.push(name);
                }
                Err(e) => report
                    .errors
                    .push(ApplyIssue::from_error(ApplyStage::Function, &name, &AppError::Io(e))),
            }
        }

        if !report.deployed_functions.is_empty() {
            let marker = live_dir.join(RELOAD_MARKER);
            let body = json!({
                "functions": report.deployed_functions,
                "at": Utc::now().to_rfc3339(),
            });
            if let Err(e) = fs::write(&marker, body.to_string()) {
                report
                    .warnings
                    .push(format!("Functions deployed but the runtime reload signal failed: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDatabase;
    use crate::plan::PlanFormat;
    use tempfile::TempDir;

    const TWO_TABLES: &str = r#"
version: 1
summary: todos and a broken table
steps:
  - kind: table
    table:
      name: todos
      columns: [{ name: id, type: uuid, pk: true }]
  - kind: table
    table:
      name: broken
      columns: [{ name: id, type: uuid, pk: true }]
"#;

    fn project(dir: &TempDir) -> ProjectConfig {
        ProjectConfig {
            root: dir.path().to_path_buf(),
            install_identity: false,
            ..Default::default()
        }
    }

    fn plan(text: &str) -> Plan {
        Plan::parse(text, PlanFormat::Yaml).unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut out: Vec<String> = fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| file_name(&e.path())).collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_failed_migration_staged() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase::failing_on("\"broken\"");

        let report = ApplyEngine::new(&project, &db)
            .apply(&plan(TWO_TABLES), &ApplyOptions::default())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.phase, ApplyPhase::PartialFailure);
        assert_eq!(report.applied_migrations, vec!["001_create_todos.sql"]);
        assert_eq!(report.failed_migrations, vec!["002_create_broken.sql"]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, "MIGRATION_EXECUTION_FAILURE");
        assert_eq!(report.errors[0].target, "002_create_broken.sql");
        assert!(report.snapshot.is_some());

        assert_eq!(names(&project.live_migrations_dir()), vec!["001_create_todos.sql"]);
        assert_eq!(
            names(&project.staging_dir().join("migrations")),
            vec!["002_create_broken.sql"]
        );
        assert_eq!(db.committed(), vec!["001_create_todos.sql"]);

        let manifest = ProjectManifest::load(&project.manifest_path()).unwrap();
        assert!(manifest.has_migration("001_create_todos.sql"));
        assert!(!manifest.has_table("todos"));
        assert_eq!(manifest.history.len(), 1);
        assert!(!manifest.history[0].success);
    }

    #[tokio::test]
    async fn test_successful_apply_records_schema() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase::default();

        let report = ApplyEngine::new(&project, &db)
            .apply(&plan(TWO_TABLES), &ApplyOptions::default())
            .await
            .unwrap();
        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.phase, ApplyPhase::FunctionsDeployed);
        assert_eq!(report.applied_migrations.len(), 2);

        let manifest = ProjectManifest::load(&project.manifest_path()).unwrap();
        assert!(manifest.has_table("todos") && manifest.has_table("broken"));
        assert!(names(&project.staging_dir().join("migrations")).is_empty());

        // Re-applying the same plan is a no-op
        let again = ApplyEngine::new(&project, &db)
            .apply(&plan(TWO_TABLES), &ApplyOptions::default())
            .await
            .unwrap();
        assert!(again.success);
        assert!(again.applied_migrations.is_empty());
        assert!(again.skipped_migrations.is_empty());
        assert_eq!(db.committed().len(), 2);
    }

    #[tokio::test]
    async fn test_identity_migration_runs_first_by_default() {
        let dir = TempDir::new().unwrap();
        let project = ProjectConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let db = MemoryDatabase::default();

        let report = ApplyEngine::new(&project, &db)
            .apply(&plan(TWO_TABLES), &ApplyOptions::default())
            .await
            .unwrap();
        assert!(report.success, "{:?}", report.errors);
        assert_eq!(
            report.applied_migrations,
            vec!["000_caller_identity.sql", "001_create_todos.sql", "002_create_broken.sql"]
        );
        assert!(db.schema.lock().unwrap().starts_with("-- Caller identity functions"));
    }

    #[tokio::test]
    async fn test_changed_migration_conflicts_without_force() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase::default();
        let engine = ApplyEngine::new(&project, &db);
        engine.apply(&plan(TWO_TABLES), &ApplyOptions::default()).await.unwrap();

        let changed = TWO_TABLES.replace(
            "name: todos\n      columns: [{ name: id, type: uuid, pk: true }]",
            "name: todos\n      columns: [{ name: id, type: uuid, pk: true }, { name: title, type: text }]",
        );
        let report = engine.apply(&plan(&changed), &ApplyOptions::default()).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.skipped_migrations, vec!["001_create_todos.sql"]);
        assert_eq!(report.errors[0].code, "MIGRATION_CONFLICT");

        let forced = ApplyOptions {
            force: true,
            ..Default::default()
        };
        let report = engine.apply(&plan(&changed), &forced).await.unwrap();
        assert!(report.success);
        assert_eq!(report.applied_migrations.len(), 2);
    }

    #[tokio::test]
    async fn test_preflight_errors_have_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase::default();
        let engine = ApplyEngine::new(&project, &db);

        let guarded = plan(&format!("{}safety: {{ requireForce: true }}\n", TWO_TABLES));
        let err = engine.apply(&guarded, &ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut future = plan(TWO_TABLES);
        future.version = 2;
        let err = engine.apply(&future, &ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidPlanVersion(ref v) if v == "2"));

        assert!(!project.staging_dir().exists());
        assert!(!project.manifest_path().exists());
        assert!(db.committed().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_a_warning() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase {
            dump_fails: true,
            ..Default::default()
        };
        let report = ApplyEngine::new(&project, &db)
            .apply(&plan(TWO_TABLES), &ApplyOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.snapshot.is_none());
        assert!(report.warnings.iter().any(|w| w.contains("Pre-apply snapshot failed")));
    }

    #[tokio::test]
    async fn test_atomic_failure_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase::failing_on("\"broken\"");
        let options = ApplyOptions {
            atomic: true,
            ..Default::default()
        };
        let report = ApplyEngine::new(&project, &db)
            .apply(&plan(TWO_TABLES), &options)
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.applied_migrations.is_empty());
        assert_eq!(report.failed_migrations.len(), 2);
        assert_eq!(report.errors[0].target, "002_create_broken.sql");
        assert!(db.committed().is_empty());
        assert_eq!(names(&project.staging_dir().join("migrations")).len(), 2);
    }

    #[tokio::test]
    async fn test_functions_deploy_with_reload_marker() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let db = MemoryDatabase::default();
        let text = r#"
version: 1
summary: digest
steps:
  - kind: function
    function: { name: digest }
verification:
  smoke: [{ path: /rest/v1/, expect: 200 }]
"#;
        let report = ApplyEngine::new(&project, &db)
            .apply(&plan(text), &ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(report.deployed_functions, vec!["digest"]);
        let live = project.live_functions_dir();
        assert!(live.join("digest").join("index.ts").exists());
        let marker = fs::read_to_string(live.join(RELOAD_MARKER)).unwrap();
        assert!(marker.contains("\"digest\""));
        assert!(report.warnings.iter().any(|w| w.contains("Verification skipped")));
        assert!(report.verification.is_none());
    }
}
