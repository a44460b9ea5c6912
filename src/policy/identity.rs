//! Caller identity capability
//!
//! Generated predicates never reach for an ambient global: they are rendered
//! through a [`CallerIdentity`] implementation, which names the SQL
//! expressions for "who is calling", "which org are they in" and "are they an
//! admin", and knows how to install those functions if the database does not
//! already provide them.

use serde::{Deserialize, Serialize};

/// Which [`CallerIdentity`] a project compiles its policies against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// [`ClaimsIdentity`]: `caller_id()` and friends, installed by the compiler
    #[default]
    Claims,
    /// [`AuthSchemaIdentity`]: the platform's `auth.uid()` / `auth.jwt()`
    AuthSchema,
}

/// SQL expressions the policy synthesizer may embed in predicates
pub trait CallerIdentity {
    /// Expression yielding the caller's id (uuid), NULL for anonymous callers
    fn id_expr(&self) -> String;

    /// Expression yielding the caller's organisation id (uuid)
    fn org_expr(&self) -> String;

    /// Boolean expression, true when the caller is an administrator
    fn is_admin_expr(&self) -> String;

    /// DDL that installs the functions above; empty when the platform ships them
    fn install_sql(&self) -> String;
}

/// Reads identity from the JWT claims the REST layer stores in
/// `request.jwt.claims` (`sub`, `org_id`, `is_admin`)
#[derive(Debug, Clone)]
pub struct ClaimsIdentity {
    pub claims_setting: String,
}

impl Default for ClaimsIdentity {
    fn default() -> Self {
        Self {
            claims_setting: "request.jwt.claims".to_string(),
        }
    }
}

impl ClaimsIdentity {
    fn claim(&self, key: &str) -> String {
        format!(
            "nullif(current_setting('{}', true), '')::jsonb ->> '{}'",
            self.claims_setting, key
        )
    }
}

impl CallerIdentity for ClaimsIdentity {
    fn id_expr(&self) -> String {
        "caller_id()".to_string()
    }

    fn org_expr(&self) -> String {
        "caller_org()".to_string()
    }

    fn is_admin_expr(&self) -> String {
        "caller_is_admin()".to_string()
    }

    fn install_sql(&self) -> String {
        format!(
            "-- Caller identity functions used by row-level security predicates\n\
             CREATE OR REPLACE FUNCTION caller_id() RETURNS uuid\n\
             LANGUAGE sql STABLE AS $$\n    SELECT ({})::uuid\n$$;\n\n\
             CREATE OR REPLACE FUNCTION caller_org() RETURNS uuid\n\
             LANGUAGE sql STABLE AS $$\n    SELECT ({})::uuid\n$$;\n\n\
             CREATE OR REPLACE FUNCTION caller_is_admin() RETURNS boolean\n\
             LANGUAGE sql STABLE AS $$\n    SELECT coalesce(({})::boolean, false)\n$$;\n\n\
             GRANT EXECUTE ON FUNCTION caller_id(), caller_org(), caller_is_admin() TO anon, authenticated;\n",
            self.claim("sub"),
            self.claim("org_id"),
            self.claim("is_admin"),
        )
    }
}

/// For platforms that already expose `auth.uid()` and `auth.jwt()`
#[derive(Debug, Clone, Default)]
pub struct AuthSchemaIdentity;

impl CallerIdentity for AuthSchemaIdentity {
    fn id_expr(&self) -> String {
        "auth.uid()".to_string()
    }

    fn org_expr(&self) -> String {
        "(auth.jwt() ->> 'org_id')::uuid".to_string()
    }

    fn is_admin_expr(&self) -> String {
        "coalesce((auth.jwt() ->> 'is_admin')::boolean, false)".to_string()
    }

    fn install_sql(&self) -> String {
        String::new()
    }
}
