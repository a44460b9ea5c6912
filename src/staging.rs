//! Staging Area
//!
//! Compiled artifacts are written to `<state>/staging/{migrations,functions}`
//! before apply moves them live. A file never silently replaces an existing
//! one with the same logical name: that is a [`AppError::MigrationConflict`]
//! unless the caller asked to overwrite.

use crate::compiler::{CompileOutput, GeneratedFile};
use crate::config::ProjectConfig;
use crate::error::{AppError, AppResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct StagingArea {
    root: PathBuf,
}

/// Paths written by one `stage` call
#[derive(Debug, Clone, Default)]
pub struct StagedSet {
    pub migrations: Vec<PathBuf>,
    pub functions: Vec<PathBuf>,
    pub generated: Vec<PathBuf>,
}

fn write_once(path: &Path, content: &str, overwrite: bool) -> AppResult<()> {
    if path.exists() && !overwrite {
        return Err(AppError::MigrationConflict(path.display().to_string()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    debug!("Wrote {} ({} bytes)", path.display(), content.len());
    Ok(())
}

/// Write SDK/test output into the project's output directories
pub fn write_generated(project: &ProjectConfig, files: &[GeneratedFile], overwrite: bool) -> AppResult<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let path = project.output_dir(&file.path);
        write_once(&path, &file.content, overwrite)?;
        written.push(path);
    }
    Ok(written)
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.root.join("migrations")
    }

    pub fn functions_dir(&self) -> PathBuf {
        self.root.join("functions")
    }

    /// Stage migrations and functions. Conflicts are checked up front so a
    /// rejected stage leaves nothing half-written.
    pub fn stage(&self, output: &CompileOutput, overwrite: bool) -> AppResult<StagedSet> {
        let migrations_dir = self.migrations_dir();
        let functions_dir = self.functions_dir();

        if !overwrite {
            for m in &output.migrations {
                let path = migrations_dir.join(&m.name);
                if path.exists() {
                    return Err(AppError::MigrationConflict(m.name.clone()));
                }
            }
            for f in &output.functions {
                let path = functions_dir.join(&f.name);
                if path.exists() {
                    return Err(AppError::MigrationConflict(format!("function {}", f.name)));
                }
            }
        }

        fs::create_dir_all(&migrations_dir)?;
        fs::create_dir_all(&functions_dir)?;

        let mut staged = StagedSet::default();
        for m in &output.migrations {
            let path = migrations_dir.join(&m.name);
            write_once(&path, &m.content, overwrite)?;
            staged.migrations.push(path);
        }
        for f in &output.functions {
            write_once(&functions_dir.join(&f.path), &f.content, overwrite)?;
            staged.functions.push(functions_dir.join(&f.name));
        }

        info!(
            "Staged {} migrations and {} functions in {}",
            staged.migrations.len(),
            staged.functions.len(),
            self.root.display()
        );
        Ok(staged)
    }

    /// Staged `*.sql` files sorted by filename
    pub fn staged_migrations(&self) -> AppResult<Vec<PathBuf>> {
        let dir = self.migrations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map(|x| x == "sql").unwrap_or(false))
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Staged function directories sorted by name
    pub fn staged_functions(&self) -> AppResult<Vec<PathBuf>> {
        let dir = self.functions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    pub fn clear(&self) -> AppResult<()> {
        for dir in [self.migrations_dir(), self.functions_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        debug!("Cleared staging area {}", self.root.display());
        Ok(())
    }
}
