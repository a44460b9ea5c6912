//! Database capability
//!
//! The apply and rollback engines only talk to the database through
//! [`Database`], so they can run against a live PostgreSQL pool
//! ([`postgres::PgDatabase`]) or an in-memory double in tests.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use crate::error::AppResult;
use async_trait::async_trait;

pub use postgres::PgDatabase;

/// A named migration body
pub type NamedSql = (String, String);

#[async_trait]
pub trait Database: Send + Sync {
    /// Run one migration in its own transaction. Failures are reported as
    /// `AppError::MigrationExecution` carrying the migration name.
    async fn execute_migration(&self, name: &str, sql: &str) -> AppResult<()>;

    /// Run several migrations in a single transaction; nothing commits unless all succeed
    async fn execute_atomic(&self, migrations: &[NamedSql]) -> AppResult<()>;

    /// Schema-only DDL for the `public` schema
    async fn dump_schema(&self) -> AppResult<String>;

    /// Drop and recreate `public`, then replay `ddl`, all in one transaction
    async fn restore_schema(&self, ddl: &str) -> AppResult<()>;

    async fn ping(&self) -> AppResult<()>;
}

/// Statements that recreate an empty `public` schema with the default grants
pub const RESET_PUBLIC_SCHEMA: &str = "DROP SCHEMA IF EXISTS public CASCADE;
CREATE SCHEMA public;
GRANT USAGE ON SCHEMA public TO PUBLIC;
DO $$
DECLARE
    r text;
BEGIN
    FOREACH r IN ARRAY ARRAY['anon', 'authenticated', 'service_role'] LOOP
        IF EXISTS (SELECT 1 FROM pg_roles WHERE rolname = r) THEN
            EXECUTE format('GRANT USAGE ON SCHEMA public TO %I', r);
        END IF;
    END LOOP;
END
$$;
";

/// Strip the parts of a `pg_dump` script that cannot be replayed inside one
/// transaction on a pooled session: psql meta-commands, session `SET`s, the
/// search_path reset, and the `public` schema itself, which restore recreates.
pub fn sanitize_dump(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    // Top-level statements only; indented lines belong to function bodies
    for line in raw.lines() {
        if line.starts_with('\\')
            || line.starts_with("SET ")
            || line.starts_with("SELECT pg_catalog.set_config(")
            || line == "CREATE SCHEMA public;"
            || line.starts_with("ALTER SCHEMA public OWNER")
            || line.starts_with("COMMENT ON SCHEMA public")
        {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
