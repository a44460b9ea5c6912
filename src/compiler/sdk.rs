//! TypeScript SDK generation

use super::GeneratedFile;
use crate::plan::{ColumnSpec, SdkSpec};

/// A table as the SDK sees it
pub struct SdkTable<'a> {
    pub name: &'a str,
    pub columns: &'a [ColumnSpec],
}

/// Map a PostgreSQL column type to a TypeScript type
pub fn ts_type(pg_type: &str) -> String {
    let t = pg_type.trim().to_ascii_lowercase();
    if let Some(inner) = t.strip_suffix("[]") {
        return format!("{}[]", ts_type(inner));
    }
    let base = t.split('(').next().unwrap_or(&t).trim();
    match base {
        "smallint" | "integer" | "int" | "int2" | "int4" | "bigint" | "int8" | "serial" | "bigserial"
        | "smallserial" | "real" | "float4" | "float8" | "double precision" | "numeric" | "decimal" => {
            "number".to_string()
        }
        "boolean" | "bool" => "boolean".to_string(),
        "json" | "jsonb" => "Json".to_string(),
        _ => "string".to_string(),
    }
}

fn pascal_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn types_ts(tables: &[SdkTable<'_>], summary: &str) -> String {
    let mut out = format!(
        "// Generated by schemaflow for: {}\n// Do not edit by hand; re-run `schemaflow plan`.\n\n\
         export type Json = string | number | boolean | null | Json[] | {{ [key: string]: Json }};\n",
        summary.replace('\n', " ")
    );

    for table in tables {
        let type_name = pascal_case(table.name);

        out.push_str(&format!("\nexport interface {}Row {{\n", type_name));
        for col in table.columns {
            let nullable = if col.is_not_null() { "" } else { " | null" };
            out.push_str(&format!("  {}: {}{};\n", col.name, ts_type(&col.data_type), nullable));
        }
        out.push_str("}\n");

        out.push_str(&format!("\nexport interface {}Insert {{\n", type_name));
        for col in table.columns {
            let optional = col.pk || col.default.is_some() || col.nullable;
            let nullable = if col.is_not_null() { "" } else { " | null" };
            out.push_str(&format!(
                "  {}{}: {}{};\n",
                col.name,
                if optional { "?" } else { "" },
                ts_type(&col.data_type),
                nullable
            ));
        }
        out.push_str("}\n");
    }

    out.push_str("\nexport interface Tables {\n");
    for table in tables {
        let type_name = pascal_case(table.name);
        out.push_str(&format!(
            "  {}: {{ Row: {t}Row; Insert: {t}Insert }};\n",
            table.name,
            t = type_name
        ));
    }
    out.push_str("}\n");
    out
}

fn tables_ts(tables: &[SdkTable<'_>]) -> String {
    let mut out = String::from("// Generated by schemaflow. Do not edit by hand.\n\nexport const TABLES = {\n");
    for table in tables {
        let cols: Vec<String> = table.columns.iter().map(|c| format!("\"{}\"", c.name)).collect();
        out.push_str(&format!("  {}: [{}],\n", table.name, cols.join(", ")));
    }
    out.push_str("} as const;\n\nexport type TableName = keyof typeof TABLES;\n");
    out
}

pub fn generate(tables: &[SdkTable<'_>], spec: &SdkSpec, summary: &str) -> Vec<GeneratedFile> {
    let dir = spec.out_dir.trim_end_matches('/');
    vec![
        GeneratedFile {
            path: format!("{}/types.ts", dir),
            content: types_ts(tables, summary),
        },
        GeneratedFile {
            path: format!("{}/tables.ts", dir),
            content: tables_ts(tables),
        },
    ]
}
