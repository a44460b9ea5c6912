//! Policy Synthesizer
//!
//! Turns a table name plus one or more presets into idempotent row-level
//! security SQL. Every policy is `AS PERMISSIVE`, so presets layered on the same
//! table OR-combine: adding `admin_override` on top of `team_scope` widens
//! access for admins without touching the team predicates. Every
//! `CREATE POLICY` sits behind a `pg_policies` existence check, so re-running
//! the output is a no-op.

pub mod identity;

use crate::error::AppError;
use crate::sql::{ensure_identifier, quote_ident};
use identity::{CallerIdentity, ClaimsIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Schema the generated policies live in
pub const POLICY_SCHEMA: &str = "public";

const DEFAULT_OWNER_COL: &str = "user_id";
const DEFAULT_ORG_COL: &str = "org_id";

/// Named, parameterized row-level-security templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPreset {
    /// Rows belong to the caller who owns them
    Owner,
    /// Anyone (including anon) reads, owners write
    PublicRead,
    /// Members of the owning organisation read; writes scoped to the org
    TeamScope,
    /// Admins bypass every row check; meant to be layered on another preset
    AdminOverride,
}

impl PolicyPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPreset::Owner => "owner",
            PolicyPreset::PublicRead => "public_read",
            PolicyPreset::TeamScope => "team_scope",
            PolicyPreset::AdminOverride => "admin_override",
        }
    }

    /// Presets that emit `insert_own`, `update_own` and `delete_own`
    fn shares_own_policies(&self) -> bool {
        matches!(self, PolicyPreset::Owner | PolicyPreset::PublicRead)
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed option set shared by all presets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_col: Option<String>,
    #[serde(default)]
    pub add_owner_col: bool,
    #[serde(default)]
    pub add_org_col: bool,
}

impl PolicyOptions {
    /// Owner column the preset compares against, if it uses one.
    /// `team_scope` only scopes writes to an owner when one is given.
    pub fn owner_col_for(&self, preset: PolicyPreset) -> Option<&str> {
        match preset {
            PolicyPreset::Owner | PolicyPreset::PublicRead => {
                Some(self.owner_col.as_deref().unwrap_or(DEFAULT_OWNER_COL))
            }
            PolicyPreset::TeamScope => match (&self.owner_col, self.add_owner_col) {
                (Some(col), _) => Some(col.as_str()),
                (None, true) => Some(DEFAULT_OWNER_COL),
                (None, false) => None,
            },
            PolicyPreset::AdminOverride => None,
        }
    }

    pub fn org_col(&self) -> &str {
        self.org_col.as_deref().unwrap_or(DEFAULT_ORG_COL)
    }
}

/// One preset applied to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyRule {
    pub preset: PolicyPreset,
    #[serde(default)]
    pub options: PolicyOptions,
}

impl PolicyRule {
    pub fn new(preset: PolicyPreset) -> Self {
        Self {
            preset,
            options: PolicyOptions::default(),
        }
    }

    pub fn with_options(preset: PolicyPreset, options: PolicyOptions) -> Self {
        Self { preset, options }
    }

    /// Owner column behind the `*_own` policies, for the presets that emit them
    pub fn own_policy_col(&self) -> Option<&str> {
        if self.preset.shares_own_policies() {
            Some(self.options.owner_col_for(self.preset).unwrap_or(DEFAULT_OWNER_COL))
        } else {
            None
        }
    }
}

/// `*_own` policies already exist on `table` with a different owner column
pub fn owner_col_conflict(table: &str, first: PolicyPreset, first_col: &str, second: PolicyPreset, col: &str) -> AppError {
    AppError::Validation(format!(
        "{} on {} uses owner column {} but {} already uses {}; layered owner presets must share one ownerCol",
        second, table, col, first, first_col
    ))
}

/// Output of the synthesizer
#[derive(Debug, Clone, Default)]
pub struct PolicySql {
    pub sql: String,
    /// Names of every policy the SQL may create, in emission order
    pub policy_names: Vec<String>,
    pub warnings: Vec<String>,
}

impl fmt::Display for PolicySql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Select,
    Insert,
    Update,
    Delete,
}

impl Verb {
    fn keyword(&self) -> &'static str {
        match self {
            Verb::Select => "SELECT",
            Verb::Insert => "INSERT",
            Verb::Update => "UPDATE",
            Verb::Delete => "DELETE",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Verb::Select => "select",
            Verb::Insert => "insert",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

/// A single permissive policy before rendering
struct PolicyDef {
    name: String,
    verb: Verb,
    /// `TO` role list; None means PUBLIC
    roles: Option<&'static str>,
    predicate: String,
}

/// Synthesizes RLS SQL through a [`CallerIdentity`] capability
pub struct PolicySynthesizer<I: CallerIdentity = ClaimsIdentity> {
    identity: I,
}

impl PolicySynthesizer<ClaimsIdentity> {
    pub fn new() -> Self {
        Self {
            identity: ClaimsIdentity::default(),
        }
    }
}

impl Default for PolicySynthesizer<ClaimsIdentity> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: CallerIdentity> PolicySynthesizer<I> {
    pub fn with_identity(identity: I) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &I {
        &self.identity
    }

    /// Reject malformed identifiers before any SQL is produced
    pub fn validate(&self, table: &str, rule: &PolicyRule) -> Result<(), AppError> {
        ensure_identifier(table, "Table")?;
        if let Some(col) = &rule.options.owner_col {
            ensure_identifier(col, "Owner column")?;
        }
        if let Some(col) = &rule.options.org_col {
            ensure_identifier(col, "Org column")?;
        }
        Ok(())
    }

    /// Validate every rule, then require the presets that share the
    /// `*_own` policy names to agree on the owner column
    pub fn validate_layered(&self, table: &str, rules: &[PolicyRule]) -> Result<(), AppError> {
        let mut own: Option<(PolicyPreset, &str)> = None;
        for rule in rules {
            self.validate(table, rule)?;
            let Some(col) = rule.own_policy_col() else {
                continue;
            };
            match own {
                Some((first, first_col)) if first_col != col => {
                    return Err(owner_col_conflict(table, first, first_col, rule.preset, col));
                }
                Some(_) => {}
                None => own = Some((rule.preset, col)),
            }
        }
        Ok(())
    }

    /// Generate SQL for a single preset
    pub fn generate(&self, table: &str, preset: PolicyPreset, options: &PolicyOptions) -> Result<PolicySql, AppError> {
        self.generate_layered(table, &[PolicyRule::with_options(preset, options.clone())])
    }

    /// Generate SQL for several presets on one table, with one merged grant section
    pub fn generate_layered(&self, table: &str, rules: &[PolicyRule]) -> Result<PolicySql, AppError> {
        if rules.is_empty() {
            return Err(AppError::Validation(format!("No policy presets given for table {}", table)));
        }
        self.validate_layered(table, rules)?;

        let t = quote_ident(table);
        let mut out = PolicySql::default();
        let mut sections: Vec<String> = Vec::new();

        // (a) auto-created supporting columns
        let mut added: Vec<String> = Vec::new();
        for rule in rules {
            let opts = &rule.options;
            if opts.add_owner_col {
                let col = opts
                    .owner_col_for(rule.preset)
                    .or(opts.owner_col.as_deref())
                    .unwrap_or(DEFAULT_OWNER_COL);
                if !added.iter().any(|c| c == col) {
                    sections.push(self.add_column_sql(table, col, &self.identity.id_expr()));
                    added.push(col.to_string());
                }
            }
            if opts.add_org_col {
                let col = opts.org_col();
                if !added.iter().any(|c| c == col) {
                    sections.push(self.add_column_sql(table, col, &self.identity.org_expr()));
                    added.push(col.to_string());
                }
            }
        }

        // (b) enable RLS
        sections.push(format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY;", t));

        // (c) guarded permissive policies
        for rule in rules {
            if rule.preset == PolicyPreset::TeamScope && rule.options.owner_col_for(rule.preset).is_none() {
                let msg = format!(
                    "team_scope on {} has no ownerCol: any member of the org may insert, update and delete every org row",
                    table
                );
                warn!("{}", msg);
                out.warnings.push(msg);
            }
            for def in self.policy_defs(rule) {
                if out.policy_names.contains(&def.name) {
                    continue;
                }
                sections.push(self.guarded_policy_sql(table, &def));
                out.policy_names.push(def.name);
            }
        }

        // (d) grants
        sections.push(self.grants_sql(&t, rules));

        // (e) documentation
        sections.push(self.doc_comment(table, rules));

        out.sql = sections.join("\n\n");
        out.sql.push('\n');

        debug!(
            "Generated {} policies for {} ({} bytes)",
            out.policy_names.len(),
            table,
            out.sql.len()
        );
        Ok(out)
    }

    fn add_column_sql(&self, table: &str, col: &str, default_expr: &str) -> String {
        format!(
            "ALTER TABLE {t} ADD COLUMN IF NOT EXISTS {c} uuid DEFAULT {d};\n\
             CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {t}({c});",
            t = quote_ident(table),
            c = quote_ident(col),
            d = default_expr,
            table = table,
            col = col,
        )
    }

    fn policy_defs(&self, rule: &PolicyRule) -> Vec<PolicyDef> {
        let opts = &rule.options;
        let id = self.identity.id_expr();
        let org = self.identity.org_expr();
        let admin = self.identity.is_admin_expr();

        let owned = |name_suffix: &str, owner: &str| -> Vec<PolicyDef> {
            let predicate = format!("{} = {}", quote_ident(owner), id);
            [Verb::Insert, Verb::Update, Verb::Delete]
                .into_iter()
                .map(|verb| PolicyDef {
                    name: format!("{}_{}", verb.prefix(), name_suffix),
                    verb,
                    roles: Some("authenticated"),
                    predicate: predicate.clone(),
                })
                .collect()
        };

        match rule.preset {
            PolicyPreset::Owner => {
                let owner = opts.owner_col_for(rule.preset).unwrap_or(DEFAULT_OWNER_COL);
                let mut defs = vec![PolicyDef {
                    name: "select_own".to_string(),
                    verb: Verb::Select,
                    roles: Some("authenticated"),
                    predicate: format!("{} = {}", quote_ident(owner), id),
                }];
                defs.extend(owned("own", owner));
                defs
            }
            PolicyPreset::PublicRead => {
                let owner = opts.owner_col_for(rule.preset).unwrap_or(DEFAULT_OWNER_COL);
                let mut defs = vec![PolicyDef {
                    name: "select_public".to_string(),
                    verb: Verb::Select,
                    roles: None,
                    predicate: "true".to_string(),
                }];
                defs.extend(owned("own", owner));
                defs
            }
            PolicyPreset::TeamScope => {
                let org_match = format!("{} = {}", quote_ident(opts.org_col()), org);
                let write = match opts.owner_col_for(rule.preset) {
                    Some(owner) => format!("{} AND {} = {}", org_match, quote_ident(owner), id),
                    None => org_match.clone(),
                };
                let read = format!("{} OR {}", org_match, admin);
                [Verb::Select, Verb::Insert, Verb::Update, Verb::Delete]
                    .into_iter()
                    .map(|verb| PolicyDef {
                        name: format!("{}_team", verb.prefix()),
                        verb,
                        roles: Some("authenticated"),
                        predicate: if verb == Verb::Select { read.clone() } else { write.clone() },
                    })
                    .collect()
            }
            PolicyPreset::AdminOverride => [Verb::Select, Verb::Insert, Verb::Update, Verb::Delete]
                .into_iter()
                .map(|verb| PolicyDef {
                    name: format!("{}_admin", verb.prefix()),
                    verb,
                    roles: Some("authenticated"),
                    predicate: admin.clone(),
                })
                .collect(),
        }
    }

    fn guarded_policy_sql(&self, table: &str, def: &PolicyDef) -> String {
        let clauses = match def.verb {
            Verb::Select | Verb::Delete => format!("USING ({})", def.predicate),
            Verb::Insert => format!("WITH CHECK ({})", def.predicate),
            Verb::Update => format!("USING ({p}) WITH CHECK ({p})", p = def.predicate),
        };
        let roles = def.roles.map(|r| format!(" TO {}", r)).unwrap_or_default();

        format!(
            "DO $$\n\
             BEGIN\n\
             \x20   IF NOT EXISTS (\n\
             \x20       SELECT 1 FROM pg_policies\n\
             \x20       WHERE schemaname = '{schema}' AND tablename = '{table}' AND policyname = '{name}'\n\
             \x20   ) THEN\n\
             \x20       CREATE POLICY {name} ON {t} AS PERMISSIVE FOR {verb}{roles} {clauses};\n\
             \x20   END IF;\n\
             END\n\
             $$;",
            schema = POLICY_SCHEMA,
            table = table,
            name = def.name,
            t = quote_ident(table),
            verb = def.verb.keyword(),
            roles = roles,
            clauses = clauses,
        )
    }

    fn grants_sql(&self, t: &str, rules: &[PolicyRule]) -> String {
        let has = |p: PolicyPreset| rules.iter().any(|r| r.preset == p);
        let mut lines = vec![format!("GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO authenticated;", t)];

        if has(PolicyPreset::PublicRead) {
            lines.push(format!("GRANT SELECT ON {} TO anon;", t));
            // Default grants already block these; revoke explicitly anyway
            lines.push(format!("REVOKE INSERT, UPDATE, DELETE ON {} FROM anon;", t));
        } else if has(PolicyPreset::Owner) || has(PolicyPreset::TeamScope) {
            lines.push(format!("REVOKE ALL ON {} FROM anon;", t));
        }
        // admin_override alone leaves anon grants to the preset it is layered on

        lines.join("\n")
    }

    fn doc_comment(&self, table: &str, rules: &[PolicyRule]) -> String {
        let mut lines = vec![format!(
            "-- Access contract for {} (permissive policies, OR-combined):",
            quote_ident(table)
        )];
        for rule in rules {
            let opts = &rule.options;
            let line = match rule.preset {
                PolicyPreset::Owner => format!(
                    "--   owner: callers see and modify only rows where {} = {}; anon has no access",
                    quote_ident(opts.owner_col_for(rule.preset).unwrap_or(DEFAULT_OWNER_COL)),
                    self.identity.id_expr()
                ),
                PolicyPreset::PublicRead => format!(
                    "--   public_read: everyone may read; writes require {} = {}",
                    quote_ident(opts.owner_col_for(rule.preset).unwrap_or(DEFAULT_OWNER_COL)),
                    self.identity.id_expr()
                ),
                PolicyPreset::TeamScope => match opts.owner_col_for(rule.preset) {
                    Some(owner) => format!(
                        "--   team_scope: org members read rows of their org ({}); writes also require {} = {}",
                        quote_ident(opts.org_col()),
                        quote_ident(owner),
                        self.identity.id_expr()
                    ),
                    None => format!(
                        "--   team_scope: org members read and write every row of their org ({})",
                        quote_ident(opts.org_col())
                    ),
                },
                PolicyPreset::AdminOverride => format!(
                    "--   admin_override: {} bypasses every row check",
                    self.identity.is_admin_expr()
                ),
            };
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::AuthSchemaIdentity;
    use pretty_assertions::assert_eq;

    fn owner_opts(col: &str) -> PolicyOptions {
        PolicyOptions {
            owner_col: Some(col.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_table_rejected_before_sql() {
        let synth = PolicySynthesizer::new();
        let err = synth
            .generate("todos; DROP TABLE users", PolicyPreset::Owner, &PolicyOptions::default())
            .unwrap_err();
        assert!(matches!(err, AppError::IdentifierInvalid(_)));

        let err = synth
            .generate("todos", PolicyPreset::Owner, &owner_opts("user id"))
            .unwrap_err();
        assert!(matches!(err, AppError::IdentifierInvalid(_)));
    }

    #[test]
    fn test_every_create_policy_is_guarded_and_permissive() {
        let synth = PolicySynthesizer::new();
        for preset in [
            PolicyPreset::Owner,
            PolicyPreset::PublicRead,
            PolicyPreset::TeamScope,
            PolicyPreset::AdminOverride,
        ] {
            let out = synth.generate("todos", preset, &PolicyOptions::default()).unwrap();
            let creates = out.sql.matches("CREATE POLICY").count();
            assert_eq!(creates, 4, "{}", preset);
            assert_eq!(out.sql.matches("IF NOT EXISTS (").count(), creates, "{}", preset);
            assert_eq!(out.sql.matches("AS PERMISSIVE").count(), creates, "{}", preset);
            assert!(!out.sql.contains("RESTRICTIVE"), "{}", preset);
            assert!(out.sql.contains("ENABLE ROW LEVEL SECURITY"));
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let synth = PolicySynthesizer::new();
        let a = synth.generate("notes", PolicyPreset::TeamScope, &owner_opts("author_id")).unwrap();
        let b = synth.generate("notes", PolicyPreset::TeamScope, &owner_opts("author_id")).unwrap();
        assert_eq!(a.sql, b.sql);
    }

    #[test]
    fn test_owner_preset_predicates() {
        let out = PolicySynthesizer::new()
            .generate("todos", PolicyPreset::Owner, &owner_opts("user_id"))
            .unwrap();
        assert!(out.sql.contains(
            "CREATE POLICY select_own ON \"todos\" AS PERMISSIVE FOR SELECT TO authenticated USING (\"user_id\" = caller_id());"
        ));
        assert!(out.sql.contains("FOR INSERT TO authenticated WITH CHECK (\"user_id\" = caller_id())"));
        assert!(out
            .sql
            .contains("FOR UPDATE TO authenticated USING (\"user_id\" = caller_id()) WITH CHECK (\"user_id\" = caller_id())"));
        assert!(out.sql.contains("REVOKE ALL ON \"todos\" FROM anon;"));
        assert_eq!(out.policy_names, vec!["select_own", "insert_own", "update_own", "delete_own"]);
    }

    #[test]
    fn test_public_read_grants() {
        let out = PolicySynthesizer::new()
            .generate("posts", PolicyPreset::PublicRead, &PolicyOptions::default())
            .unwrap();
        assert!(out
            .sql
            .contains("CREATE POLICY select_public ON \"posts\" AS PERMISSIVE FOR SELECT USING (true);"));
        assert!(out.sql.contains("GRANT SELECT ON \"posts\" TO anon;"));
        assert!(out.sql.contains("REVOKE INSERT, UPDATE, DELETE ON \"posts\" FROM anon;"));
        assert!(!out.sql.contains("REVOKE ALL ON \"posts\" FROM anon"));
        assert!(!out.sql.contains("GRANT INSERT ON \"posts\" TO anon"));
    }

    #[test]
    fn test_team_scope_without_owner_warns() {
        let out = PolicySynthesizer::new()
            .generate("projects", PolicyPreset::TeamScope, &PolicyOptions::default())
            .unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.sql.contains("USING (\"org_id\" = caller_org() OR caller_is_admin())"));
        assert!(out.sql.contains("FOR DELETE TO authenticated USING (\"org_id\" = caller_org());"));
    }

    #[test]
    fn test_team_scope_with_owner_scopes_writes() {
        let out = PolicySynthesizer::new()
            .generate("projects", PolicyPreset::TeamScope, &owner_opts("created_by"))
            .unwrap();
        assert!(out.warnings.is_empty());
        assert!(out
            .sql
            .contains("WITH CHECK (\"org_id\" = caller_org() AND \"created_by\" = caller_id())"));
    }

    #[test]
    fn test_team_scope_plus_admin_override_layer() {
        let rules = vec![
            PolicyRule::with_options(PolicyPreset::TeamScope, owner_opts("created_by")),
            PolicyRule::new(PolicyPreset::AdminOverride),
        ];
        let out = PolicySynthesizer::new().generate_layered("projects", &rules).unwrap();

        // Admin read is its own permissive policy, so it ORs with the team predicate
        assert!(out
            .sql
            .contains("CREATE POLICY select_admin ON \"projects\" AS PERMISSIVE FOR SELECT TO authenticated USING (caller_is_admin());"));
        assert!(out.policy_names.contains(&"select_team".to_string()));
        assert_eq!(out.sql.matches("ENABLE ROW LEVEL SECURITY").count(), 1);
        assert_eq!(out.sql.matches("CREATE POLICY").count(), 8);
    }

    #[test]
    fn test_admin_override_alone_leaves_anon_grants() {
        let out = PolicySynthesizer::new()
            .generate("posts", PolicyPreset::AdminOverride, &PolicyOptions::default())
            .unwrap();
        assert!(!out.sql.contains("FROM anon"));
        assert!(!out.sql.contains("TO anon"));
    }

    #[test]
    fn test_layered_owner_and_public_read_dedupes_writes() {
        let rules = vec![PolicyRule::new(PolicyPreset::PublicRead), PolicyRule::new(PolicyPreset::Owner)];
        let out = PolicySynthesizer::new().generate_layered("posts", &rules).unwrap();
        assert_eq!(out.sql.matches("CREATE POLICY insert_own").count(), 1);
        // public_read wins the anon decision inside one layered block
        assert!(out.sql.contains("GRANT SELECT ON \"posts\" TO anon;"));
        assert!(!out.sql.contains("REVOKE ALL ON \"posts\" FROM anon"));
    }

    #[test]
    fn test_layered_owner_columns_must_agree() {
        let rules = vec![
            PolicyRule::new(PolicyPreset::PublicRead),
            PolicyRule::with_options(PolicyPreset::Owner, owner_opts("author_id")),
        ];
        let synth = PolicySynthesizer::new();
        let err = synth.generate_layered("posts", &rules).unwrap_err();
        match err {
            AppError::Validation(msg) => {
                assert!(msg.contains("author_id"));
                assert!(msg.contains("user_id"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let rules = vec![
            PolicyRule::with_options(PolicyPreset::PublicRead, owner_opts("author_id")),
            PolicyRule::with_options(PolicyPreset::Owner, owner_opts("author_id")),
        ];
        let out = synth.generate_layered("posts", &rules).unwrap();
        assert!(out.sql.contains("WITH CHECK (\"author_id\" = caller_id())"));
        assert!(!out.sql.contains("\"user_id\""));

        // team_scope writes go through *_team policies, so its ownerCol may differ
        let rules = vec![
            PolicyRule::new(PolicyPreset::Owner),
            PolicyRule::with_options(PolicyPreset::TeamScope, owner_opts("created_by")),
        ];
        assert!(synth.validate_layered("posts", &rules).is_ok());
    }

    #[test]
    fn test_auto_created_columns_come_first() {
        let opts = PolicyOptions {
            add_owner_col: true,
            add_org_col: true,
            ..Default::default()
        };
        let out = PolicySynthesizer::new()
            .generate("docs", PolicyPreset::TeamScope, &opts)
            .unwrap();
        let add = out.sql.find("ADD COLUMN IF NOT EXISTS \"user_id\" uuid DEFAULT caller_id()").unwrap();
        let org = out.sql.find("ADD COLUMN IF NOT EXISTS \"org_id\" uuid DEFAULT caller_org()").unwrap();
        let enable = out.sql.find("ENABLE ROW LEVEL SECURITY").unwrap();
        assert!(add < enable && org < enable);
        assert!(out.sql.contains("CREATE INDEX IF NOT EXISTS idx_docs_org_id ON \"docs\"(\"org_id\");"));
        // addOwnerCol makes the owner column part of the write predicate
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_section_order() {
        let out = PolicySynthesizer::new()
            .generate("todos", PolicyPreset::Owner, &PolicyOptions::default())
            .unwrap();
        let enable = out.sql.find("ENABLE ROW LEVEL SECURITY").unwrap();
        let policy = out.sql.find("CREATE POLICY").unwrap();
        let grant = out.sql.find("GRANT SELECT, INSERT").unwrap();
        let doc = out.sql.find("-- Access contract").unwrap();
        assert!(enable < policy && policy < grant && grant < doc);
    }

    #[test]
    fn test_custom_identity_capability() {
        let out = PolicySynthesizer::with_identity(AuthSchemaIdentity)
            .generate("todos", PolicyPreset::Owner, &PolicyOptions::default())
            .unwrap();
        assert!(out.sql.contains("USING (\"user_id\" = auth.uid())"));
        assert!(!out.sql.contains("caller_id()"));
    }

    #[test]
    fn test_unknown_option_rejected_when_parsing() {
        let parsed: Result<PolicyOptions, _> = serde_json::from_str(r#"{"ownerCol": "a", "bogus": true}"#);
        assert!(parsed.is_err());
        let parsed: PolicyOptions = serde_json::from_str(r#"{"ownerCol": "a", "addOrgCol": true}"#).unwrap();
        assert_eq!(parsed.owner_col.as_deref(), Some("a"));
        assert!(parsed.add_org_col);
    }
}
