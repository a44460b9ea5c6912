//! Plan Compiler
//!
//! Translates a validated [`Plan`] into ordered migration files, function
//! scaffolds, an optional TypeScript SDK and pgTAP tests. Steps compile in
//! array order; there is no dependency resolution, so a plan that indexes a
//! table before creating it compiles (with a warning) and fails at apply time.

pub mod ddl;
pub mod function;
pub mod pgtap;
pub mod sdk;

use crate::error::AppResult;
use crate::manifest::ProjectManifest;
use crate::plan::{Plan, Step, StepKind, TableStep};
use crate::policy::identity::{AuthSchemaIdentity, CallerIdentity, IdentityKind};
use crate::policy::{PolicyPreset, PolicyRule, PolicySynthesizer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Name of the migration that installs the caller identity functions
pub const IDENTITY_MIGRATION: &str = "000_caller_identity.sql";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFile {
    /// `<NNN>_<description>.sql`
    pub name: String,
    pub content: String,
    /// Coarse ordering tag (extension/identity 0, table 1 ... seed 5)
    pub order: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionFile {
    pub name: String,
    /// Relative to the functions directory
    pub path: String,
    pub content: String,
}

/// SDK and test output, path relative to the project root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutput {
    pub migrations: Vec<MigrationFile>,
    pub functions: Vec<FunctionFile>,
    pub sdk_files: Vec<GeneratedFile>,
    pub test_files: Vec<GeneratedFile>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Emit `000_caller_identity.sql` ahead of everything else
    pub install_identity: bool,
    /// Identity the policy predicates are rendered against
    pub identity: IdentityKind,
    /// What earlier applies left behind
    pub existing: Option<ProjectManifest>,
}

/// Replace `{{key}}` placeholders
pub(crate) fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Compile with default options
pub fn compile(plan: &Plan) -> AppResult<CompileOutput> {
    compile_with(plan, &CompileOptions::default())
}

pub fn compile_with(plan: &Plan, options: &CompileOptions) -> AppResult<CompileOutput> {
    match options.identity {
        IdentityKind::Claims => PlanCompiler::new(PolicySynthesizer::new()).compile(plan, options),
        IdentityKind::AuthSchema => {
            PlanCompiler::new(PolicySynthesizer::with_identity(AuthSchemaIdentity)).compile(plan, options)
        }
    }
}

/// Compiler parameterized over the caller identity the policies use
pub struct PlanCompiler<I: CallerIdentity> {
    synth: PolicySynthesizer<I>,
}

/// Running state while walking the steps
struct Walk<'a> {
    out: CompileOutput,
    /// Numbered migrations emitted so far
    numbered: usize,
    existing: Option<&'a ProjectManifest>,
    created: HashSet<String>,
    presets: HashMap<String, Vec<PolicyPreset>>,
    policy_names: HashMap<String, Vec<String>>,
}

impl Walk<'_> {
    fn push_migration(&mut self, description: &str, content: String, order: u8) {
        self.numbered += 1;
        let name = format!("{:03}_{}.sql", self.numbered, description);
        debug!("Compiled migration {} ({} bytes)", name, content.len());
        self.out.migrations.push(MigrationFile { name, content, order });
    }

    fn warn(&mut self, msg: String) {
        if !self.out.warnings.contains(&msg) {
            warn!("{}", msg);
            self.out.warnings.push(msg);
        }
    }

    fn table_known(&self, table: &str) -> bool {
        self.created.contains(table) || self.existing.map(|m| m.has_table(table)).unwrap_or(false)
    }

    fn check_target(&mut self, kind: StepKind, table: &str) {
        if !self.table_known(table) {
            self.warn(format!(
                "{} step targets table {} which is neither created earlier in this plan nor recorded in the project manifest",
                kind, table
            ));
        }
    }

    fn record_policies(&mut self, table: &str, rules: &[PolicyRule], names: Vec<String>) {
        let seen = self.presets.entry(table.to_string()).or_default();
        let public_before = seen.contains(&PolicyPreset::PublicRead);
        for rule in rules {
            if public_before && matches!(rule.preset, PolicyPreset::Owner | PolicyPreset::TeamScope) {
                let msg = format!(
                    "{} policy on {} revokes the anon SELECT granted by an earlier public_read; layer them in one table step to keep public reads",
                    rule.preset, table
                );
                if !self.out.warnings.contains(&msg) {
                    warn!("{}", msg);
                    self.out.warnings.push(msg);
                }
            }
            if !seen.contains(&rule.preset) {
                seen.push(rule.preset);
            }
        }
        let all = self.policy_names.entry(table.to_string()).or_default();
        for name in names {
            if !all.contains(&name) {
                all.push(name);
            }
        }
    }
}

impl<I: CallerIdentity> PlanCompiler<I> {
    pub fn new(synth: PolicySynthesizer<I>) -> Self {
        Self { synth }
    }

    pub fn compile(&self, plan: &Plan, options: &CompileOptions) -> AppResult<CompileOutput> {
        plan.validate()?;

        let mut walk = Walk {
            out: CompileOutput::default(),
            numbered: 0,
            existing: options.existing.as_ref(),
            created: HashSet::new(),
            presets: HashMap::new(),
            policy_names: HashMap::new(),
        };

        if let Some(manifest) = walk.existing {
            for (name, record) in &manifest.tables {
                walk.presets.insert(name.clone(), record.presets.clone());
            }
        }

        if options.install_identity {
            let sql = self.synth.identity().install_sql();
            if !sql.is_empty() {
                walk.out.migrations.push(MigrationFile {
                    name: IDENTITY_MIGRATION.to_string(),
                    content: sql,
                    order: 0,
                });
            }
        }

        let extensions = plan.extensions();
        if !extensions.is_empty() {
            let sql: String = extensions
                .iter()
                .map(|ext| format!("CREATE EXTENSION IF NOT EXISTS \"{}\";\n", ext))
                .collect();
            walk.push_migration("extensions", sql, 0);
        }

        for step in &plan.steps {
            self.compile_step(step, &mut walk)?;
        }

        if let Some(sdk_spec) = &plan.sdk {
            let mut tables: Vec<sdk::SdkTable<'_>> = Vec::new();
            let created: Vec<&TableStep> = plan.tables().collect();
            if let Some(manifest) = walk.existing {
                for (name, record) in &manifest.tables {
                    if !created.iter().any(|t| &t.name == name) && !record.columns.is_empty() {
                        tables.push(sdk::SdkTable {
                            name,
                            columns: &record.columns,
                        });
                    }
                }
            }
            tables.extend(created.iter().map(|t| sdk::SdkTable {
                name: &t.name,
                columns: &t.columns,
            }));
            walk.out.sdk_files = sdk::generate(&tables, sdk_spec, &plan.summary);
        }

        if let Some(verification) = plan.verification.as_ref().filter(|v| v.generate_tests) {
            for table in plan.tables() {
                let names = walk.policy_names.get(&table.name).cloned().unwrap_or_default();
                walk.out
                    .test_files
                    .push(pgtap::table_test(table, &names, &verification.tests_dir));
            }
        }

        info!(
            "Compiled plan: {} migrations, {} functions, {} warnings",
            walk.out.migrations.len(),
            walk.out.functions.len(),
            walk.out.warnings.len()
        );
        Ok(walk.out)
    }

    fn compile_step(&self, step: &Step, walk: &mut Walk<'_>) -> AppResult<()> {
        match step {
            Step::Table(table) => {
                if walk.existing.map(|m| m.has_table(&table.name)).unwrap_or(false) {
                    walk.warn(format!(
                        "table {} already exists in the project manifest; CREATE TABLE IF NOT EXISTS will leave its columns unchanged",
                        table.name
                    ));
                }
                walk.created.insert(table.name.clone());

                let mut sql = ddl::create_table_sql(table);
                if !table.policies.is_empty() {
                    let policies = self.synth.generate_layered(&table.name, &table.policies)?;
                    sql.push('\n');
                    sql.push_str(&policies.sql);
                    for w in policies.warnings {
                        walk.warn(w);
                    }
                    walk.record_policies(&table.name, &table.policies, policies.policy_names);
                } else if table.rls {
                    sql.push('\n');
                    sql.push_str(&ddl::enable_rls_sql(&table.name));
                    walk.warn(format!(
                        "table {} has row level security enabled but no policies: every non-bypass role is denied",
                        table.name
                    ));
                }
                walk.push_migration(&format!("create_{}", table.name), sql, StepKind::Table.order_tag());
            }
            Step::Policy(policy) => {
                walk.check_target(StepKind::Policy, &policy.table);
                let rule = policy.rule();
                let out = self.synth.generate(&policy.table, rule.preset, &rule.options)?;
                for w in out.warnings {
                    walk.warn(w);
                }
                walk.record_policies(&policy.table, std::slice::from_ref(&rule), out.policy_names);
                walk.push_migration(
                    &format!("policy_{}_{}", policy.table, policy.preset),
                    out.sql,
                    StepKind::Policy.order_tag(),
                );
            }
            Step::Function(f) => {
                walk.out.functions.push(function::scaffold(f));
            }
            Step::Realtime(r) => {
                walk.check_target(StepKind::Realtime, &r.table);
                walk.push_migration(
                    &format!("realtime_{}", r.table),
                    ddl::realtime_sql(r),
                    StepKind::Realtime.order_tag(),
                );
            }
            Step::Index(ix) => {
                walk.check_target(StepKind::Index, &ix.table);
                walk.push_migration(
                    &format!("index_{}_{}", ix.table, ix.columns.join("_")),
                    ddl::create_index_sql(ix),
                    StepKind::Index.order_tag(),
                );
            }
            Step::Seed(seed) => {
                walk.check_target(StepKind::Seed, &seed.table);
                walk.push_migration(
                    &format!("seed_{}", seed.table),
                    ddl::seed_sql(seed),
                    StepKind::Seed.order_tag(),
                );
            }
            Step::Note(note) => {
                debug!("Plan note: {}", note.text);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::manifest::TableRecord;
    use crate::plan::{ColumnSpec, PlanFormat};
    use crate::policy::identity::AuthSchemaIdentity;
    use pretty_assertions::assert_eq;

    fn plan(yaml: &str) -> Plan {
        Plan::parse(yaml, PlanFormat::Yaml).unwrap()
    }

    const TABLE_AND_OWNER: &str = r#"
version: 1
summary: todos
steps:
  - kind: table
    table:
      name: todos
      columns:
        - { name: id, type: uuid, pk: true }
        - { name: name, type: text }
  - kind: policy
    policy:
      table: todos
      preset: owner
      options: { ownerCol: user_id }
"#;

    #[test]
    fn test_table_plus_owner_policy_yields_two_migrations() {
        let out = compile(&plan(TABLE_AND_OWNER)).unwrap();
        assert_eq!(out.migrations.len(), 2);

        assert_eq!(out.migrations[0].name, "001_create_todos.sql");
        assert_eq!(out.migrations[0].order, 1);
        assert!(out.migrations[0].content.contains("CREATE TABLE IF NOT EXISTS \"todos\""));

        assert_eq!(out.migrations[1].name, "002_policy_todos_owner.sql");
        assert_eq!(out.migrations[1].order, 2);
        assert!(out.migrations[1].content.contains("CREATE POLICY select_own"));
        assert!(out.migrations[1].content.contains("\"user_id\" = caller_id()"));

        assert!(out.functions.is_empty());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let p = plan(TABLE_AND_OWNER);
        assert_eq!(compile(&p).unwrap().migrations, compile(&p).unwrap().migrations);
    }

    #[test]
    fn test_invalid_plan_produces_nothing() {
        let bad = TABLE_AND_OWNER.replace("name: todos", "name: \"Todos\"");
        let err = compile(&plan(&bad)).unwrap_err();
        assert!(matches!(err, AppError::IdentifierInvalid(_)));
    }

    #[test]
    fn test_identity_and_extensions_come_first() {
        let text = format!("{}dependencies: [\"extension:pgcrypto\"]\n", TABLE_AND_OWNER);
        let options = CompileOptions {
            install_identity: true,
            existing: None,
            ..Default::default()
        };
        let out = compile_with(&plan(&text), &options).unwrap();
        let names: Vec<&str> = out.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "000_caller_identity.sql",
                "001_extensions.sql",
                "002_create_todos.sql",
                "003_policy_todos_owner.sql"
            ]
        );
        assert!(out.migrations[1].content.contains("CREATE EXTENSION IF NOT EXISTS \"pgcrypto\";"));
        assert_eq!(out.migrations[1].order, 0);
    }

    #[test]
    fn test_identity_skipped_when_platform_provides_it() {
        let options = CompileOptions {
            install_identity: true,
            existing: None,
            ..Default::default()
        };
        let out = PlanCompiler::new(PolicySynthesizer::with_identity(AuthSchemaIdentity))
            .compile(&plan(TABLE_AND_OWNER), &options)
            .unwrap();
        assert_eq!(out.migrations[0].name, "001_create_todos.sql");
        assert!(out.migrations[1].content.contains("\"user_id\" = auth.uid()"));
    }

    #[test]
    fn test_identity_setting_selects_predicates() {
        let options = CompileOptions {
            install_identity: true,
            identity: IdentityKind::AuthSchema,
            existing: None,
        };
        let out = compile_with(&plan(TABLE_AND_OWNER), &options).unwrap();
        assert_eq!(out.migrations[0].name, "001_create_todos.sql");
        assert!(out.migrations[1].content.contains("\"user_id\" = auth.uid()"));
        assert!(!out.migrations[1].content.contains("caller_id()"));

        let options = CompileOptions {
            install_identity: true,
            ..Default::default()
        };
        let out = compile_with(&plan(TABLE_AND_OWNER), &options).unwrap();
        assert_eq!(out.migrations[0].name, IDENTITY_MIGRATION);
        assert!(out.migrations[0].content.contains("CREATE OR REPLACE FUNCTION caller_id()"));
        assert!(out.migrations[2].content.contains("\"user_id\" = caller_id()"));
    }

    #[test]
    fn test_conflicting_owner_columns_compile_nothing() {
        let text = TABLE_AND_OWNER.replace(
            "        - { name: name, type: text }",
            "        - { name: name, type: text }\n      policies: [{ preset: public_read }]",
        );
        let text = text.replace("ownerCol: user_id", "ownerCol: author_id");
        let err = compile(&plan(&text)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_every_step_kind() {
        let out = compile(&plan(
            r#"
version: 1
summary: chat
steps:
  - kind: table
    table:
      name: messages
      columns:
        - { name: id, type: bigserial, pk: true }
        - { name: user_id, type: uuid }
        - { name: body, type: text }
      policies:
        - { preset: public_read }
        - { preset: admin_override }
  - kind: realtime
    realtime: { table: messages, events: [insert] }
  - kind: index
    index: { table: messages, columns: [user_id] }
  - kind: seed
    seed:
      table: messages
      rows:
        - { user_id: "00000000-0000-0000-0000-000000000001", body: "hello" }
  - kind: function
    function: { name: moderate, env: [OPENAI_KEY] }
  - kind: note
    note: { text: nothing to emit }
"#,
        ))
        .unwrap();

        let names: Vec<&str> = out.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "001_create_messages.sql",
                "002_realtime_messages.sql",
                "003_index_messages_user_id.sql",
                "004_seed_messages.sql"
            ]
        );
        let orders: Vec<u8> = out.migrations.iter().map(|m| m.order).collect();
        assert_eq!(orders, vec![1, 3, 4, 5]);

        let table_sql = &out.migrations[0].content;
        assert!(table_sql.contains("GRANT ALL ON \"messages\" TO service_role;"));
        assert!(table_sql.contains("CREATE POLICY select_public"));
        assert!(table_sql.contains("CREATE POLICY select_admin"));
        assert!(table_sql.contains("GRANT SELECT ON \"messages\" TO anon;"));

        assert_eq!(out.functions.len(), 1);
        assert_eq!(out.functions[0].path, "moderate/index.ts");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_rls_without_policies_warns() {
        let out = compile(&plan(
            r#"
version: 1
summary: locked
steps:
  - kind: table
    table:
      name: secrets
      rls: true
      columns: [{ name: id, type: uuid, pk: true }]
"#,
        ))
        .unwrap();
        assert!(out.migrations[0].content.contains("ALTER TABLE \"secrets\" ENABLE ROW LEVEL SECURITY;"));
        assert!(!out.migrations[0].content.contains("CREATE POLICY"));
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("no policies"));
    }

    #[test]
    fn test_unknown_target_warns_unless_manifest_has_it() {
        let text = r#"
version: 1
summary: index only
steps:
  - kind: index
    index: { table: orders, columns: [created_at] }
"#;
        let out = compile(&plan(text)).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("orders"));

        let mut manifest = ProjectManifest::default();
        manifest.tables.insert(
            "orders".to_string(),
            TableRecord {
                columns: vec![ColumnSpec::new("id", "uuid").primary_key()],
                ..Default::default()
            },
        );
        let options = CompileOptions {
            install_identity: false,
            existing: Some(manifest),
            ..Default::default()
        };
        let out = compile_with(&plan(text), &options).unwrap();
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_recreating_manifest_table_warns() {
        let mut manifest = ProjectManifest::default();
        manifest.tables.insert("todos".to_string(), TableRecord::default());
        let options = CompileOptions {
            install_identity: false,
            existing: Some(manifest),
            ..Default::default()
        };
        let out = compile_with(&plan(TABLE_AND_OWNER), &options).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("already exists in the project manifest"));
    }

    #[test]
    fn test_owner_after_public_read_warns_about_anon() {
        let out = compile(&plan(
            r#"
version: 1
summary: posts
steps:
  - kind: table
    table:
      name: posts
      columns: [{ name: id, type: uuid, pk: true }, { name: user_id, type: uuid }]
  - kind: policy
    policy: { table: posts, preset: public_read }
  - kind: policy
    policy: { table: posts, preset: owner }
"#,
        ))
        .unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("revokes the anon SELECT"));
    }

    #[test]
    fn test_sdk_and_tests_generated() {
        let text = format!(
            "{}sdk: {{ language: typescript, outDir: client }}\nverification: {{ generateTests: true }}\n",
            TABLE_AND_OWNER
        );
        let out = compile(&plan(&text)).unwrap();
        let sdk: Vec<&str> = out.sdk_files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(sdk, vec!["client/types.ts", "client/tables.ts"]);

        assert_eq!(out.test_files.len(), 1);
        assert_eq!(out.test_files[0].path, "tests/todos.test.sql");
        assert!(out.test_files[0].content.contains("'select_own', 'insert_own', 'update_own', 'delete_own'"));
    }

    #[test]
    fn test_render_placeholders() {
        assert_eq!(render("a {{x}} b {{x}}", &[("x", "1".to_string())]), "a 1 b 1");
    }
}
