//! Plan model
//!
//! A Plan is the versioned, declarative description of the schema, security
//! and function state a project wants. Plans are read from YAML or JSON; the
//! version is checked on the raw document before anything else is parsed.

pub mod step;

pub use step::{
    ColumnSpec, FunctionStep, IndexStep, NoteStep, PolicyStep, RealtimeEvent, RealtimeStep, SeedStep, Step,
    StepKind, TableStep,
};

use crate::error::{validation_error, AppError, AppResult};
use crate::policy::{owner_col_conflict, PolicyPreset, PolicyRule, PolicySynthesizer};
use crate::sql::map_validation;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use tracing::debug;
use validator::Validate;

/// The only plan format version this build understands
pub const SUPPORTED_PLAN_VERSION: u32 = 1;

pub static FUNCTION_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("function name regex"));

pub static CHANNEL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_:.-]+$").expect("channel regex"));

/// Format of a plan document on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Yaml,
    Json,
}

impl PlanFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => PlanFormat::Json,
            _ => PlanFormat::Yaml,
        }
    }
}

/// Versioned declarative plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: u32,
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Post-apply checks the verification engine runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSpec {
    #[serde(default)]
    pub rls: Vec<RlsCheck>,
    /// Functions to smoke-call with `dryRun`
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub smoke: Vec<SmokeAssertion>,
    /// Emit pgTAP tests mirroring the declared schema
    #[serde(default = "default_true")]
    pub generate_tests: bool,
    #[serde(default = "default_tests_dir")]
    pub tests_dir: String,
}

impl Default for VerificationSpec {
    fn default() -> Self {
        Self {
            rls: Vec::new(),
            functions: Vec::new(),
            smoke: Vec::new(),
            generate_tests: true,
            tests_dir: default_tests_dir(),
        }
    }
}

/// Cross-identity isolation check for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RlsCheck {
    pub table: String,
    /// Row to insert as the first identity (owner column is filled in)
    #[serde(default)]
    pub row: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_owner_col")]
    pub owner_col: String,
}

/// Operator-declared HTTP assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeAssertion {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    pub expect: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// `anon`, `user`, or a literal bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetySpec {
    /// Take a schema snapshot before applying
    #[serde(default = "default_true")]
    pub snapshot: bool,
    /// Refuse to apply unless `--force` is given
    #[serde(default)]
    pub require_force: bool,
}

impl Default for SafetySpec {
    fn default() -> Self {
        Self {
            snapshot: true,
            require_force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdkLanguage {
    Typescript,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkSpec {
    #[serde(default = "default_language")]
    pub language: SdkLanguage,
    #[serde(default = "default_sdk_dir")]
    pub out_dir: String,
}

fn default_true() -> bool {
    true
}

fn default_tests_dir() -> String {
    "tests".to_string()
}

fn default_owner_col() -> String {
    "user_id".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_language() -> SdkLanguage {
    SdkLanguage::Typescript
}

fn default_sdk_dir() -> String {
    "sdk".to_string()
}

/// Accept `version: 1` as well as `version: "1"`
fn deserialize_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(u32),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Int(v) => Ok(v),
        Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Read the version off a raw document without trusting anything else in it
fn raw_version(doc: &serde_json::Value) -> Option<String> {
    match doc.get("version")? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

impl Plan {
    /// Parse plan text, rejecting unsupported versions before deserializing steps
    pub fn parse(text: &str, format: PlanFormat) -> AppResult<Self> {
        let doc: serde_json::Value = match format {
            PlanFormat::Json => serde_json::from_str(text)?,
            PlanFormat::Yaml => serde_yaml::from_str(text)?,
        };

        match raw_version(&doc) {
            Some(v) if v == SUPPORTED_PLAN_VERSION.to_string() => {}
            Some(v) => return Err(AppError::InvalidPlanVersion(v)),
            None => return Err(AppError::InvalidPlanVersion("missing".to_string())),
        }

        let plan: Plan = serde_json::from_value(doc)
            .map_err(|e| validation_error(format!("Malformed plan: {}", e)))?;
        debug!("Parsed plan with {} steps", plan.steps.len());
        Ok(plan)
    }

    /// Load a plan file; format is chosen by extension
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, PlanFormat::from_path(path))
    }

    pub fn check_version(&self) -> AppResult<()> {
        if self.version != SUPPORTED_PLAN_VERSION {
            return Err(AppError::InvalidPlanVersion(self.version.to_string()));
        }
        Ok(())
    }

    pub fn safety(&self) -> SafetySpec {
        self.safety.clone().unwrap_or_default()
    }

    /// Extensions requested via `dependencies: ["extension:pgcrypto"]`
    pub fn extensions(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter_map(|d| d.strip_prefix("extension:"))
            .map(str::trim)
            .collect()
    }

    /// Full pre-flight validation; nothing has side effects until this passes
    pub fn validate(&self) -> AppResult<()> {
        self.check_version()?;

        for ext in self.extensions() {
            crate::sql::ensure_identifier(ext, "Extension")?;
        }

        let synth = PolicySynthesizer::new();
        let mut function_names = HashSet::new();
        let mut own_cols: HashMap<String, (PolicyPreset, String)> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            let context = format!("step {} ({})", i + 1, step.kind());
            let result = match step {
                Step::Table(t) => t.validate(),
                Step::Policy(p) => p.validate(),
                Step::Function(f) => f.validate(),
                Step::Realtime(r) => r.validate(),
                Step::Index(ix) => ix.validate(),
                Step::Seed(s) => s.validate(),
                Step::Note(_) => Ok(()),
            };
            result.map_err(|e| map_validation(&context, e))?;

            match step {
                Step::Table(t) => {
                    let pks = t.columns.iter().filter(|c| c.pk).count();
                    if pks > 1 {
                        return Err(validation_error(format!(
                            "{}: table {} declares {} primary key columns; only a single-column primary key is supported",
                            context, t.name, pks
                        )));
                    }
                    let mut seen = HashSet::new();
                    for col in &t.columns {
                        if !seen.insert(col.name.as_str()) {
                            return Err(validation_error(format!(
                                "{}: duplicate column {} in table {}",
                                context, col.name, t.name
                            )));
                        }
                    }
                    synth.validate_layered(&t.name, &t.policies)?;
                    for rule in &t.policies {
                        check_own_col(&mut own_cols, &t.name, rule)?;
                    }
                }
                Step::Policy(p) => {
                    let rule = p.rule();
                    synth.validate(&p.table, &rule)?;
                    check_own_col(&mut own_cols, &p.table, &rule)?;
                }
                Step::Function(f) => {
                    if !function_names.insert(f.name.as_str()) {
                        return Err(validation_error(format!("{}: duplicate function {}", context, f.name)));
                    }
                }
                Step::Seed(s) => {
                    for row in &s.rows {
                        for key in row.keys() {
                            crate::sql::ensure_identifier(key, "Seed column")?;
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(verification) = &self.verification {
            for check in &verification.rls {
                crate::sql::ensure_identifier(&check.table, "RLS check table")?;
                crate::sql::ensure_identifier(&check.owner_col, "RLS check owner column")?;
            }
            ensure_relative_dir(&verification.tests_dir, "verification.testsDir")?;
        }
        if let Some(sdk) = &self.sdk {
            ensure_relative_dir(&sdk.out_dir, "sdk.outDir")?;
        }
        Ok(())
    }

    /// Tables created by this plan, in step order
    pub fn tables(&self) -> impl Iterator<Item = &TableStep> {
        self.steps.iter().filter_map(|s| match s {
            Step::Table(t) => Some(t),
            _ => None,
        })
    }
}

/// `*_own` policies are created once per table, so every preset that emits
/// them must name the same owner column across the whole plan
fn check_own_col(seen: &mut HashMap<String, (PolicyPreset, String)>, table: &str, rule: &PolicyRule) -> AppResult<()> {
    let Some(col) = rule.own_policy_col() else {
        return Ok(());
    };
    match seen.get(table) {
        Some((first, first_col)) if first_col != col => {
            Err(owner_col_conflict(table, *first, first_col, rule.preset, col))
        }
        Some(_) => Ok(()),
        None => {
            seen.insert(table.to_string(), (rule.preset, col.to_string()));
            Ok(())
        }
    }
}

/// Generated files land under the project root; no absolute paths, no `..`
fn ensure_relative_dir(dir: &str, field: &str) -> AppResult<()> {
    if dir.trim().is_empty() {
        return Err(validation_error(format!("{} must not be empty", field)));
    }
    let escapes = Path::new(dir)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(validation_error(format!(
            "{} must be a relative path inside the project: {}",
            field, dir
        )));
    }
    Ok(())
}
