//! SchemaFlow Deploy
//!
//! Compiles declarative plans into migrations, RLS policies and function
//! scaffolds, applies them to PostgreSQL behind a pre-apply schema snapshot,
//! and packages reusable templates.

pub mod apply;
pub mod compiler;
pub mod config;
pub mod db;
pub mod error;
pub mod manifest;
pub mod plan;
pub mod policy;
pub mod rollback;
pub mod snapshot;
pub mod sql;
pub mod staging;
pub mod template;
pub mod verify;

pub use error::{AppError, AppResult};
