//! PostgreSQL implementation over a deadpool pool

use super::{sanitize_dump, Database, NamedSql, RESET_PUBLIC_SCHEMA};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio::process::Command;
use tracing::{debug, info};

/// Render a driver error with the server's message and position when present
fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => match db.position() {
            Some(tokio_postgres::error::ErrorPosition::Original(pos)) => {
                format!("{} (SQLSTATE {}, at character {})", db.message(), db.code().code(), pos)
            }
            _ => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
        },
        None => err.to_string(),
    }
}

pub struct PgDatabase {
    pool: Pool,
    config: DatabaseConfig,
    pg_dump: String,
}

impl PgDatabase {
    /// Build the pool; TLS for `ssl` configs and managed hosts
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let use_tls = config.ssl || config.host.contains("neon.tech");

        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_pool_size.max(1)));

        let pool = if use_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))?
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
                .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))?
        };

        let db = Self {
            pool,
            config: config.clone(),
            pg_dump: std::env::var("PG_DUMP").unwrap_or_else(|_| "pg_dump".to_string()),
        };
        db.ping().await?;
        info!("Connected to {} (TLS: {})", config.to_display_string(), use_tls);
        Ok(db)
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn execute_migration(&self, name: &str, sql: &str) -> AppResult<()> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        transaction
            .batch_execute(sql)
            .await
            .map_err(|e| AppError::MigrationExecution {
                name: name.to_string(),
                message: describe(&e),
            })?;
        transaction.commit().await?;
        debug!("Committed {}", name);
        Ok(())
    }

    async fn execute_atomic(&self, migrations: &[NamedSql]) -> AppResult<()> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        for (name, sql) in migrations {
            // Dropping the transaction on error rolls everything back
            transaction
                .batch_execute(sql)
                .await
                .map_err(|e| AppError::MigrationExecution {
                    name: name.clone(),
                    message: describe(&e),
                })?;
        }
        transaction.commit().await?;
        debug!("Committed {} migrations atomically", migrations.len());
        Ok(())
    }

    async fn dump_schema(&self) -> AppResult<String> {
        let mut cmd = Command::new(&self.pg_dump);
        cmd.arg("--schema-only")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--schema=public")
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--username")
            .arg(&self.config.user)
            .arg("--dbname")
            .arg(&self.config.database)
            .env("PGPASSWORD", &self.config.password);
        if self.config.ssl {
            cmd.env("PGSSLMODE", "require");
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| AppError::Snapshot(format!("Failed to run {}: {}", self.pg_dump, e)))?;
        if !output.status.success() {
            return Err(AppError::Snapshot(format!(
                "{} exited with {}: {}",
                self.pg_dump,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let ddl = sanitize_dump(&String::from_utf8_lossy(&output.stdout));
        debug!("Dumped {} bytes of schema DDL", ddl.len());
        Ok(ddl)
    }

    async fn restore_schema(&self, ddl: &str) -> AppResult<()> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        transaction.batch_execute(RESET_PUBLIC_SCHEMA).await?;
        transaction
            .batch_execute(ddl)
            .await
            .map_err(|e| AppError::Snapshot(format!("Replaying snapshot failed: {}", describe(&e))))?;
        transaction.commit().await?;
        info!("Restored public schema ({} bytes of DDL)", ddl.len());
        Ok(())
    }

    async fn ping(&self) -> AppResult<()> {
        let client = self.pool.get().await?;
        client.query_one("SELECT 1 AS ok", &[]).await?;
        Ok(())
    }
}
