//! Application configuration module
//!
//! Settings are layered: built-in defaults, an optional `schemaflow.toml`,
//! `SCHEMAFLOW__SECTION__KEY` environment variables, and finally the
//! conventional `DATABASE_URL` / `JWT_SECRET` variables (a `.env` file is
//! loaded first if present).

use crate::compiler::CompileOptions;
use crate::manifest::ProjectManifest;
use crate::policy::identity::IdentityKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration sources: {0}")]
    Source(#[from] ::config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        crate::error::AppError::Config(err.to_string())
    }
}

/// Project layout: where plans compile to and where live artifacts land
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub root: PathBuf,
    /// Private state (staging, snapshots, project manifest), relative to root
    pub state_dir: PathBuf,
    pub migrations_dir: PathBuf,
    pub functions_dir: PathBuf,
    /// How many pre-apply snapshots to keep
    pub snapshot_retention: usize,
    /// Emit the caller-identity SQL functions as a bootstrap migration
    pub install_identity: bool,
    /// `claims` (caller_id() and friends) or `auth_schema` (auth.uid())
    pub identity: IdentityKind,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            state_dir: PathBuf::from(".schemaflow"),
            migrations_dir: PathBuf::from("migrations"),
            functions_dir: PathBuf::from("functions"),
            snapshot_retention: 5,
            install_identity: true,
            identity: IdentityKind::Claims,
        }
    }
}

impl ProjectConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir).join("staging")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir).join("snapshots")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.resolve(&self.state_dir).join("project.json")
    }

    pub fn live_migrations_dir(&self) -> PathBuf {
        self.resolve(&self.migrations_dir)
    }

    /// Live migrations a rollback took back out of `migrations/`
    pub fn rolled_back_dir(&self, snapshot_id: &str) -> PathBuf {
        self.resolve(&self.state_dir).join("rolled_back").join(snapshot_id)
    }

    pub fn live_functions_dir(&self) -> PathBuf {
        self.resolve(&self.functions_dir)
    }

    /// Output directories for generated SDK/test files are relative to root
    pub fn output_dir(&self, relative: &str) -> PathBuf {
        self.resolve(Path::new(relative))
    }

    /// Compiler options for this project on top of what earlier applies recorded
    pub fn compile_options(&self, existing: ProjectManifest) -> CompileOptions {
        CompileOptions {
            install_identity: self.install_identity,
            identity: self.identity,
            existing: Some(existing),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// Require TLS (set automatically for `sslmode=require` and managed hosts)
    pub ssl: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 4,
            ssl: false,
        }
    }
}

impl DatabaseConfig {
    /// Connection URL with the password masked, for logs
    pub fn to_display_string(&self) -> String {
        format!(
            "postgresql://{}:****@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// External services probed by verification
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Gateway base URL, e.g. http://localhost:54321
    pub api_url: Option<String>,
    pub rest_path: String,
    pub auth_path: String,
    pub functions_path: String,
    /// Secret shared with the REST layer, used to sign probe identities
    pub jwt_secret: Option<String>,
    pub anon_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            rest_path: "/rest/v1".to_string(),
            auth_path: "/auth/v1".to_string(),
            functions_path: "/functions/v1".to_string(),
            jwt_secret: None,
            anon_key: None,
            timeout_secs: 30,
        }
    }
}

impl ServiceConfig {
    fn join(&self, path: &str) -> Option<String> {
        self.api_url
            .as_ref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), path))
    }

    pub fn rest_url(&self) -> Option<String> {
        self.join(&self.rest_path)
    }

    pub fn auth_url(&self) -> Option<String> {
        self.join(&self.auth_path)
    }

    pub fn functions_url(&self) -> Option<String> {
        self.join(&self.functions_path)
    }

    /// Absolute URL for an operator-declared path
    pub fn url_for(&self, path: &str) -> Option<String> {
        if path.starts_with('/') {
            self.join(path)
        } else {
            self.join(&format!("/{}", path))
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub project: ProjectConfig,
    pub database: DatabaseConfig,
    pub services: ServiceConfig,
}

impl Settings {
    /// Load settings from defaults, `schemaflow.toml` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let layered = ::config::Config::builder()
            .add_source(::config::File::with_name("schemaflow").required(false))
            .add_source(
                ::config::Environment::with_prefix("SCHEMAFLOW")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut settings: Settings = layered.try_deserialize()?;

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            settings.database = Self::parse_database_url(&database_url, settings.database.max_pool_size)?;
        }

        if settings.services.jwt_secret.is_none() {
            settings.services.jwt_secret = std::env::var("JWT_SECRET").ok();
        }

        Ok(settings)
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    pub fn parse_database_url(url: &str, max_pool_size: usize) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid DATABASE_URL format (expected postgresql://...)".to_string())
        })?;

        if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme: {}",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let user = if parsed.username().is_empty() {
            "postgres".to_string()
        } else {
            parsed.username().to_string()
        };

        // Managed hosts require TLS even when the URL does not say so
        let ssl = url.contains("sslmode=require") || host.contains("neon.tech") || host.contains("supabase.co");

        Ok(DatabaseConfig {
            port: parsed.port().unwrap_or(5432),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            host,
            user,
            database,
            max_pool_size,
            ssl,
        })
    }
}
