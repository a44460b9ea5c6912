//! Plan steps
//!
//! On disk a step is `{kind: <kind>, <kind>: {...payload}}`. Deserialization goes
//! through [`RawStep`] so that a step with zero, several, or a mismatched
//! payload is rejected instead of silently picking one.

use crate::policy::{PolicyOptions, PolicyPreset, PolicyRule};
use crate::sql::{validate_column_type, validate_default_expr, validate_identifier, validate_identifier_list};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Table,
    Policy,
    Function,
    Realtime,
    Index,
    Seed,
    Note,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Table => "table",
            StepKind::Policy => "policy",
            StepKind::Function => "function",
            StepKind::Realtime => "realtime",
            StepKind::Index => "index",
            StepKind::Seed => "seed",
            StepKind::Note => "note",
        }
    }

    /// Coarse ordering tag carried by migrations for future batching
    pub fn order_tag(&self) -> u8 {
        match self {
            StepKind::Table => 1,
            StepKind::Policy => 2,
            StepKind::Realtime => 3,
            StepKind::Index => 4,
            StepKind::Seed => 5,
            StepKind::Function | StepKind::Note => 0,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column definition inside a table step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ColumnSpec {
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[serde(rename = "type")]
    #[validate(custom(function = "validate_column_type"))]
    pub data_type: String,

    #[serde(default)]
    pub pk: bool,

    #[serde(default)]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_default_expr"))]
    pub default: Option<String>,

    #[serde(default)]
    pub unique: bool,

    /// `table` or `table(column)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_reference"))]
    pub references: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_on_delete"))]
    pub on_delete: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            pk: false,
            nullable: false,
            default: None,
            unique: false,
            references: None,
            on_delete: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.pk = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// pk implies NOT NULL regardless of `nullable`
    pub fn is_not_null(&self) -> bool {
        self.pk || !self.nullable
    }

    /// Split `references` into (table, column); column defaults to `id`
    pub fn reference_target(&self) -> Option<(String, String)> {
        self.references.as_deref().map(parse_reference)
    }
}

fn parse_reference(reference: &str) -> (String, String) {
    match reference.split_once('(') {
        Some((table, rest)) => (
            table.trim().to_string(),
            rest.trim_end_matches(')').trim().to_string(),
        ),
        None => (reference.trim().to_string(), "id".to_string()),
    }
}

fn validate_reference(reference: &str) -> Result<(), ValidationError> {
    let (table, column) = parse_reference(reference);
    validate_identifier(&table)?;
    validate_identifier(&column)
}

fn validate_on_delete(action: &str) -> Result<(), ValidationError> {
    match action.to_ascii_uppercase().as_str() {
        "CASCADE" | "RESTRICT" | "SET NULL" | "SET DEFAULT" | "NO ACTION" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_on_delete");
            err.message = Some(format!("unsupported ON DELETE action '{}'", action).into());
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableStep {
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[validate(length(min = 1, message = "a table needs at least one column"))]
    #[validate(nested)]
    pub columns: Vec<ColumnSpec>,

    /// Presets compiled inline with the table
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyRule>,

    /// Enable RLS even without policies (deny-all until policies arrive)
    #[serde(default)]
    pub rls: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TableStep {
    pub fn primary_key(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.pk)
    }
}

/// Access control declared separately from table creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyStep {
    #[validate(custom(function = "validate_identifier"))]
    pub table: String,
    pub preset: PolicyPreset,
    #[serde(default)]
    pub options: PolicyOptions,
}

impl PolicyStep {
    pub fn rule(&self) -> PolicyRule {
        PolicyRule::with_options(self.preset, self.options.clone())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FunctionStep {
    #[validate(regex(path = *crate::plan::FUNCTION_NAME, message = "function names must match ^[a-z][a-z0-9_-]*$"))]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Reject calls without a caller identity
    #[serde(default = "default_true")]
    pub auth: bool,

    /// Environment variables the handler reads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Tables the handler works with, listed in the scaffold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(custom(function = "validate_identifier_list"))]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeEvent {
    Insert,
    Update,
    Delete,
}

impl RealtimeEvent {
    pub fn keyword(&self) -> &'static str {
        match self {
            RealtimeEvent::Insert => "INSERT",
            RealtimeEvent::Update => "UPDATE",
            RealtimeEvent::Delete => "DELETE",
        }
    }
}

fn default_events() -> Vec<RealtimeEvent> {
    vec![RealtimeEvent::Insert, RealtimeEvent::Update, RealtimeEvent::Delete]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RealtimeStep {
    #[validate(custom(function = "validate_identifier"))]
    pub table: String,

    /// NOTIFY channel; defaults to `realtime:<table>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(regex(path = *crate::plan::CHANNEL_NAME, message = "channel names may contain [a-z0-9_:.-] only"))]
    pub channel: Option<String>,

    #[serde(default = "default_events")]
    #[validate(length(min = 1, message = "at least one realtime event is required"))]
    pub events: Vec<RealtimeEvent>,
}

impl RealtimeStep {
    pub fn channel_name(&self) -> String {
        self.channel
            .clone()
            .unwrap_or_else(|| format!("realtime:{}", self.table))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexStep {
    #[validate(custom(function = "validate_identifier"))]
    pub table: String,

    #[validate(length(min = 1, message = "an index needs at least one column"))]
    #[validate(custom(function = "validate_identifier_list"))]
    pub columns: Vec<String>,

    #[serde(default)]
    pub unique: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_identifier"))]
    pub name: Option<String>,
}

impl IndexStep {
    pub fn index_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("idx_{}_{}", self.table, self.columns.join("_")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeedStep {
    #[validate(custom(function = "validate_identifier"))]
    pub table: String,

    #[validate(length(min = 1, message = "a seed step needs at least one row"))]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoteStep {
    pub text: String,
}

/// One unit of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum Step {
    Table(TableStep),
    Policy(PolicyStep),
    Function(FunctionStep),
    Realtime(RealtimeStep),
    Index(IndexStep),
    Seed(SeedStep),
    Note(NoteStep),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Table(_) => StepKind::Table,
            Step::Policy(_) => StepKind::Policy,
            Step::Function(_) => StepKind::Function,
            Step::Realtime(_) => StepKind::Realtime,
            Step::Index(_) => StepKind::Index,
            Step::Seed(_) => StepKind::Seed,
            Step::Note(_) => StepKind::Note,
        }
    }
}

/// Wire form of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStep {
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<SeedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<NoteStep>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let kind = raw.kind;
        let mut found: Vec<Step> = Vec::new();
        found.extend(raw.table.map(Step::Table));
        found.extend(raw.policy.map(Step::Policy));
        found.extend(raw.function.map(Step::Function));
        found.extend(raw.realtime.map(Step::Realtime));
        found.extend(raw.index.map(Step::Index));
        found.extend(raw.seed.map(Step::Seed));
        found.extend(raw.note.map(Step::Note));

        if found.len() != 1 {
            return Err(format!(
                "step of kind '{}' must carry exactly one payload, found {}",
                kind,
                found.len()
            ));
        }
        let step = found.remove(0);
        if step.kind() != kind {
            return Err(format!(
                "step of kind '{}' carries a '{}' payload",
                kind,
                step.kind()
            ));
        }
        Ok(step)
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let mut raw = RawStep {
            kind: step.kind(),
            table: None,
            policy: None,
            function: None,
            realtime: None,
            index: None,
            seed: None,
            note: None,
        };
        match step {
            Step::Table(p) => raw.table = Some(p),
            Step::Policy(p) => raw.policy = Some(p),
            Step::Function(p) => raw.function = Some(p),
            Step::Realtime(p) => raw.realtime = Some(p),
            Step::Index(p) => raw.index = Some(p),
            Step::Seed(p) => raw.seed = Some(p),
            Step::Note(p) => raw.note = Some(p),
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_payload_must_match_kind() {
        let err = serde_json::from_str::<Step>(r#"{"kind": "index", "note": {"text": "hi"}}"#).unwrap_err();
        assert!(err.to_string().contains("carries a 'note' payload"));

        let err = serde_json::from_str::<Step>(r#"{"kind": "note"}"#).unwrap_err();
        assert!(err.to_string().contains("found 0"));

        let err = serde_json::from_str::<Step>(
            r#"{"kind": "note", "note": {"text": "a"}, "index": {"table": "t", "columns": ["a"]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn test_table_step_parses() {
        let step: Step = serde_json::from_str(
            r#"{"kind": "table", "table": {"name": "todos", "columns": [
                {"name": "id", "type": "uuid", "pk": true, "default": "gen_random_uuid()"},
                {"name": "owner", "type": "uuid", "references": "profiles(user_id)", "onDelete": "cascade"},
                {"name": "title", "type": "text"}
            ], "policies": [{"preset": "owner", "options": {"ownerCol": "owner"}}]}}"#,
        )
        .unwrap();
        let Step::Table(table) = step else { panic!("expected table") };
        assert_eq!(table.primary_key().unwrap().name, "id");
        assert_eq!(
            table.columns[1].reference_target(),
            Some(("profiles".to_string(), "user_id".to_string()))
        );
        assert_eq!(table.policies[0].preset, PolicyPreset::Owner);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_reference_defaults_to_id() {
        let mut col = ColumnSpec::new("author", "uuid");
        col.references = Some("users".to_string());
        assert_eq!(col.reference_target(), Some(("users".to_string(), "id".to_string())));
    }

    #[test]
    fn test_pk_implies_not_null() {
        let col = ColumnSpec::new("id", "uuid").primary_key().nullable();
        assert!(col.is_not_null());
        assert!(!ColumnSpec::new("bio", "text").nullable().is_not_null());
    }

    #[test]
    fn test_column_validation() {
        let mut col = ColumnSpec::new("Bad Name", "text");
        assert!(col.validate().is_err());
        col.name = "ok".to_string();
        col.on_delete = Some("explode".to_string());
        assert!(col.validate().is_err());
        col.on_delete = Some("set null".to_string());
        assert!(col.validate().is_ok());
    }

    #[test]
    fn test_realtime_defaults() {
        let step: RealtimeStep = serde_json::from_str(r#"{"table": "messages"}"#).unwrap();
        assert_eq!(step.events.len(), 3);
        assert_eq!(step.channel_name(), "realtime:messages");
    }

    #[test]
    fn test_index_name() {
        let step = IndexStep {
            table: "todos".to_string(),
            columns: vec!["user_id".to_string(), "done".to_string()],
            unique: false,
            name: None,
        };
        assert_eq!(step.index_name(), "idx_todos_user_id_done");
    }
}
