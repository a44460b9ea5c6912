//! In-memory database double for engine tests

use super::{Database, NamedSql};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryDatabase {
    /// Migrations whose SQL contains this marker fail
    pub fail_marker: Option<String>,
    pub dump_fails: bool,
    pub schema: Mutex<String>,
    pub committed: Mutex<Vec<String>>,
    pub restores: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Default::default()
        }
    }

    pub fn with_schema(ddl: &str) -> Self {
        Self {
            schema: Mutex::new(ddl.to_string()),
            ..Default::default()
        }
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn check(&self, name: &str, sql: &str) -> AppResult<()> {
        match &self.fail_marker {
            Some(marker) if sql.contains(marker.as_str()) => Err(AppError::MigrationExecution {
                name: name.to_string(),
                message: format!("syntax error at or near \"{}\"", marker),
            }),
            _ => Ok(()),
        }
    }

    fn lock_err<T>(_: T) -> AppError {
        AppError::Internal("memory database lock poisoned".to_string())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn execute_migration(&self, name: &str, sql: &str) -> AppResult<()> {
        self.check(name, sql)?;
        self.committed.lock().map_err(Self::lock_err)?.push(name.to_string());
        self.schema.lock().map_err(Self::lock_err)?.push_str(sql);
        Ok(())
    }

    async fn execute_atomic(&self, migrations: &[NamedSql]) -> AppResult<()> {
        for (name, sql) in migrations {
            self.check(name, sql)?;
        }
        for (name, sql) in migrations {
            self.committed.lock().map_err(Self::lock_err)?.push(name.clone());
            self.schema.lock().map_err(Self::lock_err)?.push_str(sql);
        }
        Ok(())
    }

    async fn dump_schema(&self) -> AppResult<String> {
        if self.dump_fails {
            return Err(AppError::Snapshot("pg_dump: connection refused".to_string()));
        }
        Ok(self.schema.lock().map_err(Self::lock_err)?.clone())
    }

    async fn restore_schema(&self, ddl: &str) -> AppResult<()> {
        *self.schema.lock().map_err(Self::lock_err)? = ddl.to_string();
        self.restores.lock().map_err(Self::lock_err)?.push(ddl.to_string());
        Ok(())
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
