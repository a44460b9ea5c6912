//! Project Manifest
//!
//! Durable record of what has been applied to a project: tables (with their
//! columns, policies and RLS flag), deployed functions, applied migrations and
//! an apply/rollback history. Later compilations read it to warn about plans
//! that recreate or target tables.

use crate::error::{AppError, AppResult};
use crate::plan::{ColumnSpec, Plan, Step};
use crate::policy::{PolicyPreset, PolicyRule, PolicySynthesizer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRecord {
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub presets: Vec<PolicyPreset>,
    /// Policy names, in the order they were created
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub rls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRecord {
    pub auth: bool,
    #[serde(default)]
    pub env: Vec<String>,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Apply,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub action: HistoryAction,
    pub at: DateTime<Utc>,
    pub success: bool,
    pub summary: String,
    /// Snapshot taken (apply) or restored (rollback)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub migrations: Vec<String>,
    /// Tables this apply added to the manifest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, summary: impl Into<String>, success: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            at: Utc::now(),
            success,
            summary: summary.into(),
            snapshot: None,
            migrations: Vec::new(),
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    pub version: u32,
    #[serde(default)]
    pub tables: BTreeMap<String, TableRecord>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionRecord>,
    #[serde(default)]
    pub migrations: Vec<AppliedMigration>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Default for ProjectManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            tables: BTreeMap::new(),
            functions: BTreeMap::new(),
            migrations: Vec::new(),
            history: Vec::new(),
        }
    }
}

pub fn checksum(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

impl ProjectManifest {
    /// Load from disk; a missing file is an empty project
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&text)
            .map_err(|e| AppError::Internal(format!("Corrupt project manifest {}: {}", path.display(), e)))?;
        Ok(manifest)
    }

    /// Write through a temp file so a crash never leaves half a manifest
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved project manifest to {}", path.display());
        Ok(())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> Option<&TableRecord> {
        self.tables.get(name)
    }

    pub fn has_migration(&self, name: &str) -> bool {
        self.migrations.iter().any(|m| m.name == name)
    }

    pub fn record_migration(&mut self, name: &str, content: &str) {
        self.migrations.retain(|m| m.name != name);
        self.migrations.push(AppliedMigration {
            name: name.to_string(),
            checksum: checksum(content),
            applied_at: Utc::now(),
        });
    }

    pub fn record_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn last_history(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Forget everything applied since `snapshot_id` was taken: the apply that
    /// took it and every later apply. Migrations an earlier apply also ran are
    /// kept. Returns the forgotten migration names in history order.
    pub fn rewind(&mut self, snapshot_id: &str) -> Vec<String> {
        let Some(start) = self
            .history
            .iter()
            .rposition(|e| e.action == HistoryAction::Apply && e.snapshot.as_deref() == Some(snapshot_id))
        else {
            return Vec::new();
        };

        let (before, after) = self.history.split_at(start);
        let kept: HashSet<&str> = before
            .iter()
            .filter(|e| e.action == HistoryAction::Apply)
            .flat_map(|e| e.migrations.iter().map(String::as_str))
            .collect();

        let mut migrations: Vec<String> = Vec::new();
        let mut tables: Vec<String> = Vec::new();
        for entry in after.iter().filter(|e| e.action == HistoryAction::Apply) {
            for name in &entry.migrations {
                if !kept.contains(name.as_str()) && !migrations.contains(name) {
                    migrations.push(name.clone());
                }
            }
            tables.extend(entry.tables.iter().cloned());
        }

        self.migrations.retain(|m| !migrations.contains(&m.name));
        for table in &tables {
            self.tables.remove(table);
        }
        debug!(
            "Rewound manifest to {}: {} migrations, {} tables forgotten",
            snapshot_id,
            migrations.len(),
            tables.len()
        );
        migrations
    }

    fn add_policies(&mut self, table: &str, rules: &[PolicyRule]) {
        let names = PolicySynthesizer::new()
            .generate_layered(table, rules)
            .map(|out| out.policy_names)
            .unwrap_or_default();
        let record = self.tables.entry(table.to_string()).or_default();
        record.rls = true;
        for rule in rules {
            if !record.presets.contains(&rule.preset) {
                record.presets.push(rule.preset);
            }
        }
        for name in names {
            if !record.policies.contains(&name) {
                record.policies.push(name);
            }
        }
    }

    /// Fold the schema-level effects of a fully committed plan into the manifest
    pub fn record_plan(&mut self, plan: &Plan) {
        for step in &plan.steps {
            match step {
                Step::Table(t) => {
                    let record = self.tables.entry(t.name.clone()).or_default();
                    record.columns = t.columns.clone();
                    record.rls |= t.rls;
                    if !t.policies.is_empty() {
                        self.add_policies(&t.name, &t.policies);
                    }
                }
                Step::Policy(p) => self.add_policies(&p.table, &[p.rule()]),
                Step::Realtime(r) => {
                    self.tables.entry(r.table.clone()).or_default().realtime_channel = Some(r.channel_name());
                }
                Step::Function(f) => {
                    self.functions.insert(
                        f.name.clone(),
                        FunctionRecord {
                            auth: f.auth,
                            env: f.env.clone(),
                            deployed_at: Utc::now(),
                        },
                    );
                }
                Step::Index(_) | Step::Seed(_) | Step::Note(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanFormat;
    use tempfile::TempDir;

    const PLAN: &str = r#"
version: 1
summary: todos
steps:
  - kind: table
    table:
      name: todos
      columns:
        - { name: id, type: uuid, pk: true }
        - { name: user_id, type: uuid }
  - kind: policy
    policy: { table: todos, preset: owner }
  - kind: policy
    policy: { table: todos, preset: admin_override }
  - kind: realtime
    realtime: { table: todos }
  - kind: function
    function: { name: nightly-digest, env: [SMTP_URL] }
"#;

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let manifest = ProjectManifest::load(&dir.path().join("project.json")).unwrap();
        assert_eq!(manifest, ProjectManifest::default());
    }

    #[test]
    fn test_record_plan_and_roundtrip_through_disk() {
        let plan = Plan::parse(PLAN, PlanFormat::Yaml).unwrap();
        let mut manifest = ProjectManifest::default();
        manifest.record_plan(&plan);
        manifest.record_migration("001_create_todos.sql", "CREATE TABLE ...");
        manifest.record_history(HistoryEntry::new(HistoryAction::Apply, "todos", true));

        let todos = manifest.table("todos").unwrap();
        assert!(todos.rls);
        assert_eq!(todos.presets, vec![PolicyPreset::Owner, PolicyPreset::AdminOverride]);
        assert_eq!(todos.policies.len(), 8);
        assert_eq!(todos.realtime_channel.as_deref(), Some("realtime:todos"));
        assert!(manifest.functions.contains_key("nightly-digest"));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("project.json");
        manifest.save(&path).unwrap();
        let loaded = ProjectManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.has_migration("001_create_todos.sql"));
        assert_eq!(loaded.migrations[0].checksum, checksum("CREATE TABLE ..."));
    }

    fn applied(snapshot: &str, migrations: &[&str], tables: &[&str]) -> HistoryEntry {
        let mut entry = HistoryEntry::new(HistoryAction::Apply, "apply", true);
        entry.snapshot = Some(snapshot.to_string());
        entry.migrations = migrations.iter().map(|m| m.to_string()).collect();
        entry.tables = tables.iter().map(|t| t.to_string()).collect();
        entry
    }

    #[test]
    fn test_rewind_forgets_applies_since_snapshot() {
        let mut manifest = ProjectManifest::default();
        for name in ["001_create_todos.sql", "002_create_tags.sql", "003_index_tags_name.sql"] {
            manifest.record_migration(name, name);
        }
        manifest.tables.insert("todos".to_string(), TableRecord::default());
        manifest.tables.insert("tags".to_string(), TableRecord::default());
        manifest.record_history(applied("snap-1", &["001_create_todos.sql"], &["todos"]));
        manifest.record_history(applied("snap-2", &["002_create_tags.sql"], &["tags"]));
        manifest.record_history(applied("snap-3", &["003_index_tags_name.sql"], &[]));

        let forgotten = manifest.rewind("snap-2");
        assert_eq!(forgotten, vec!["002_create_tags.sql", "003_index_tags_name.sql"]);
        assert!(manifest.has_migration("001_create_todos.sql"));
        assert!(!manifest.has_migration("002_create_tags.sql"));
        assert!(manifest.has_table("todos"));
        assert!(!manifest.has_table("tags"));

        assert!(manifest.rewind("snap-unknown").is_empty());
        assert_eq!(manifest.migrations.len(), 1);
    }

    #[test]
    fn test_rewind_keeps_migrations_applied_before_snapshot() {
        let mut manifest = ProjectManifest::default();
        manifest.record_migration("001_create_todos.sql", "v2");
        manifest.record_history(applied("snap-1", &["001_create_todos.sql"], &[]));
        // forced re-run of the same file after the second snapshot
        manifest.record_history(applied("snap-2", &["001_create_todos.sql"], &[]));

        assert!(manifest.rewind("snap-2").is_empty());
        assert!(manifest.has_migration("001_create_todos.sql"));
    }

    #[test]
    fn test_recording_same_migration_replaces_entry() {
        let mut manifest = ProjectManifest::default();
        manifest.record_migration("001_a.sql", "one");
        manifest.record_migration("001_a.sql", "two");
        assert_eq!(manifest.migrations.len(), 1);
        assert_eq!(manifest.migrations[0].checksum, checksum("two"));
    }
}
