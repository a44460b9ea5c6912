//! Schema Snapshot Store
//!
//! Snapshots live as `snapshot_<timestamp>.sql` files in the state directory.
//! The timestamp sorts lexically, so "newest first" is a reverse filename sort.

use crate::db::Database;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_RETENTION: usize = 5;

const PREFIX: &str = "snapshot_";
const HEADER: &str = "-- schemaflow snapshot taken_at=";

/// Metadata about a snapshot on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    /// File stem, e.g. `snapshot_20261019T101500123Z`
    pub id: String,
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
}

pub struct SnapshotStore {
    dir: PathBuf,
    retention: usize,
}

fn is_snapshot_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with(PREFIX) && name.ends_with(".sql")
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    /// Dump the schema, persist it, then prune down to the retention limit
    pub async fn capture(&self, db: &dyn Database) -> AppResult<SchemaSnapshot> {
        let ddl = db.dump_schema().await?;
        let taken_at = Utc::now();
        let snapshot = self.save(&ddl, taken_at)?;

        let pruned = self.prune(self.retention)?;
        if pruned > 0 {
            debug!("Pruned {} old snapshots", pruned);
        }
        info!("Captured snapshot {} ({} bytes)", snapshot.id, snapshot.size_bytes);
        Ok(snapshot)
    }

    /// Write DDL as a new snapshot file
    pub fn save(&self, ddl: &str, taken_at: DateTime<Utc>) -> AppResult<SchemaSnapshot> {
        fs::create_dir_all(&self.dir)?;

        let stamp = taken_at.format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut id = format!("{}{}", PREFIX, stamp);
        let mut suffix = 1;
        while self.dir.join(format!("{}.sql", id)).exists() {
            id = format!("{}{}_{}", PREFIX, stamp, suffix);
            suffix += 1;
        }

        let path = self.dir.join(format!("{}.sql", id));
        let content = format!("{}{}\n{}", HEADER, taken_at.to_rfc3339(), ddl);
        fs::write(&path, &content)?;

        Ok(SchemaSnapshot {
            id,
            path,
            taken_at,
            size_bytes: content.len() as u64,
            checksum: format!("{:x}", Sha256::digest(ddl.as_bytes())),
        })
    }

    fn describe(&self, path: &Path) -> AppResult<SchemaSnapshot> {
        let content = fs::read_to_string(path)?;
        let (taken_at, ddl) = match content.split_once('\n') {
            Some((first, rest)) if first.starts_with(HEADER) => {
                let stamp = &first[HEADER.len()..];
                let parsed = DateTime::parse_from_rfc3339(stamp.trim())
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| AppError::Snapshot(format!("Bad snapshot header in {}: {}", path.display(), e)))?;
                (parsed, rest)
            }
            _ => {
                let modified = fs::metadata(path)?.modified()?;
                (DateTime::<Utc>::from(modified), content.as_str())
            }
        };
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        Ok(SchemaSnapshot {
            id,
            path: path.to_path_buf(),
            taken_at,
            size_bytes: content.len() as u64,
            checksum: format!("{:x}", Sha256::digest(ddl.as_bytes())),
        })
    }

    fn files(&self) -> AppResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_snapshot_file(p))
            .collect();
        files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(files)
    }

    /// All snapshots, newest first
    pub fn list(&self) -> AppResult<Vec<SchemaSnapshot>> {
        self.files()?.iter().map(|p| self.describe(p)).collect()
    }

    pub fn latest(&self) -> AppResult<Option<SchemaSnapshot>> {
        match self.files()?.first() {
            Some(path) => Ok(Some(self.describe(path)?)),
            None => Ok(None),
        }
    }

    /// DDL of a snapshot, without the header line
    pub fn read(&self, snapshot: &SchemaSnapshot) -> AppResult<String> {
        let content = fs::read_to_string(&snapshot.path)?;
        Ok(match content.split_once('\n') {
            Some((first, rest)) if first.starts_with(HEADER) => rest.to_string(),
            _ => content,
        })
    }

    /// Delete old snapshots, keeping the newest `keep`
    pub fn prune(&self, keep: usize) -> AppResult<usize> {
        let files = self.files()?;
        if files.len() <= keep {
            return Ok(0);
        }
        let mut removed = 0;
        for path in files.into_iter().skip(keep) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not prune snapshot {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDatabase;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_capture_prunes_to_retention() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            fs::write(
                dir.path().join(format!("snapshot_20200101T000000{:03}Z.sql", i)),
                format!("{}2020-01-01T00:00:00.{:03}+00:00\nCREATE TABLE t{} ();\n", HEADER, i, i),
            )
            .unwrap();
        }

        let store = SnapshotStore::new(dir.path(), DEFAULT_RETENTION);
        let db = MemoryDatabase::with_schema("CREATE TABLE public.todos ();\n");
        let snapshot = store.capture(&db).await.unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 5);
        assert_eq!(list[0].id, snapshot.id);
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert!(!ids.contains(&"snapshot_20200101T000000000Z"));
        assert!(!ids.contains(&"snapshot_20200101T000000001Z"));
        assert!(ids.contains(&"snapshot_20200101T000000005Z"));

        assert_eq!(store.read(&snapshot).unwrap(), "CREATE TABLE public.todos ();\n");
    }

    #[test]
    fn test_latest_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("missing"), 5);
        assert!(store.latest().unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_same_millisecond_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 5);
        let at = Utc::now();
        let a = store.save("A", at).unwrap();
        let b = store.save("B", at).unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.read(&b).unwrap(), "B");
    }

    #[tokio::test]
    async fn test_failed_dump_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 5);
        let db = MemoryDatabase {
            dump_fails: true,
            ..Default::default()
        };
        assert!(matches!(store.capture(&db).await, Err(AppError::Snapshot(_))));
        assert!(store.latest().unwrap().is_none());
    }
}
