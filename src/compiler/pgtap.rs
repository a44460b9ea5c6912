//! pgTAP test generation, one file per table the plan creates

use super::GeneratedFile;
use crate::plan::TableStep;
use crate::policy::POLICY_SCHEMA;
use crate::sql::quote_literal;

/// `policies` are every policy name the plan declares for the table
pub fn table_test(table: &TableStep, policies: &[String], tests_dir: &str) -> GeneratedFile {
    let schema = quote_literal(POLICY_SCHEMA);
    let t = quote_literal(&table.name);
    let mut checks: Vec<String> = Vec::new();

    checks.push(format!(
        "SELECT has_table({}, {}, {});",
        schema,
        t,
        quote_literal(&format!("table {} exists", table.name))
    ));
    for col in &table.columns {
        checks.push(format!(
            "SELECT has_column({}, {}, {}, {});",
            schema,
            t,
            quote_literal(&col.name),
            quote_literal(&format!("{}.{} exists", table.name, col.name))
        ));
    }
    if let Some(pk) = table.primary_key() {
        checks.push(format!(
            "SELECT col_is_pk({}, {}, {}, {});",
            schema,
            t,
            quote_literal(&pk.name),
            quote_literal(&format!("{}.{} is the primary key", table.name, pk.name))
        ));
    }
    if table.rls || !policies.is_empty() {
        checks.push(format!(
            "SELECT ok(\n    (SELECT relrowsecurity FROM pg_class WHERE oid = {}::regclass),\n    {}\n);",
            quote_literal(&format!("{}.{}", POLICY_SCHEMA, table.name)),
            quote_literal(&format!("row level security is enabled on {}", table.name))
        ));
    }
    if !policies.is_empty() {
        let names: Vec<String> = policies.iter().map(|p| quote_literal(p)).collect();
        checks.push(format!(
            "SELECT policies_are({}, {}, ARRAY[{}], {});",
            schema,
            t,
            names.join(", "),
            quote_literal(&format!("{} carries exactly the declared policies", table.name))
        ));
    }

    let content = format!(
        "-- pgTAP checks for {table}\nBEGIN;\nSELECT plan({count});\n\n{checks}\n\nSELECT * FROM finish();\nROLLBACK;\n",
        table = table.name,
        count = checks.len(),
        checks = checks.join("\n"),
    );

    GeneratedFile {
        path: format!("{}/{}.test.sql", tests_dir.trim_end_matches('/'), table.name),
        content,
    }
}
