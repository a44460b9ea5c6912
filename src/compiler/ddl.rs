//! DDL generation for table, realtime, index and seed steps

use crate::plan::{ColumnSpec, IndexStep, RealtimeStep, SeedStep, TableStep};
use crate::sql::{quote_ident, quote_literal};
use serde_json::Value;

/// Roles the REST layer switches into
pub const AUTHENTICATED_ROLE: &str = "authenticated";
pub const SERVICE_ROLE: &str = "service_role";

fn column_sql(col: &ColumnSpec) -> String {
    let mut def = format!("    {} {}", quote_ident(&col.name), col.data_type.trim());
    if col.pk {
        def.push_str(" PRIMARY KEY");
    }
    if let Some(ref default) = col.default {
        def.push_str(&format!(" DEFAULT {}", default.trim()));
    }
    // pk already implies NOT NULL
    if !col.pk && !col.nullable {
        def.push_str(" NOT NULL");
    }
    if col.unique && !col.pk {
        def.push_str(" UNIQUE");
    }
    if let Some((table, column)) = col.reference_target() {
        def.push_str(&format!(" REFERENCES {}({})", quote_ident(&table), quote_ident(&column)));
        if let Some(ref action) = col.on_delete {
            def.push_str(&format!(" ON DELETE {}", action.to_ascii_uppercase()));
        }
    }
    def
}

/// `CREATE TABLE IF NOT EXISTS` plus baseline grants
pub fn create_table_sql(table: &TableStep) -> String {
    let t = quote_ident(&table.name);
    let columns: Vec<String> = table.columns.iter().map(column_sql).collect();

    let mut sql = format!("-- Table: {}\n", table.name);
    sql.push_str(&format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n", t, columns.join(",\n")));

    if let Some(ref description) = table.description {
        sql.push_str(&format!("\nCOMMENT ON TABLE {} IS {};\n", t, quote_literal(description)));
    }

    sql.push_str(&format!(
        "\nGRANT ALL ON {t} TO {service};\nGRANT SELECT, INSERT, UPDATE, DELETE ON {t} TO {auth};\n",
        t = t,
        service = SERVICE_ROLE,
        auth = AUTHENTICATED_ROLE,
    ));
    sql
}

/// RLS with no policies: nobody but the table owner and bypass roles see rows
pub fn enable_rls_sql(table: &str) -> String {
    format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY;\n", quote_ident(table))
}

pub fn create_index_sql(index: &IndexStep) -> String {
    let cols: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {}({});\n",
        if index.unique { "UNIQUE " } else { "" },
        index.index_name(),
        quote_ident(&index.table),
        cols.join(", ")
    )
}

pub fn notify_function_name(table: &str) -> String {
    format!("notify_{}_changes", table)
}

/// Trigger that publishes each changed row on a NOTIFY channel for the relay
pub fn realtime_sql(step: &RealtimeStep) -> String {
    let t = quote_ident(&step.table);
    let function = notify_function_name(&step.table);
    let trigger = format!("{}_realtime", step.table);
    let events: Vec<&str> = step.events.iter().map(|e| e.keyword()).collect();

    format!(
        "-- Realtime: publish {table} changes on {channel}\n\
         -- NOTIFY payloads are capped at 8000 bytes; very wide rows are truncated by the relay contract\n\
         CREATE OR REPLACE FUNCTION {function}() RETURNS trigger\n\
         LANGUAGE plpgsql AS $$\n\
         DECLARE\n\
         \x20   payload json;\n\
         BEGIN\n\
         \x20   payload := json_build_object(\n\
         \x20       'table', TG_TABLE_NAME,\n\
         \x20       'op', TG_OP,\n\
         \x20       'row', CASE WHEN TG_OP = 'DELETE' THEN row_to_json(OLD) ELSE row_to_json(NEW) END\n\
         \x20   );\n\
         \x20   PERFORM pg_notify({channel_lit}, payload::text);\n\
         \x20   RETURN NULL;\n\
         END;\n\
         $$;\n\
         \n\
         DROP TRIGGER IF EXISTS {trigger} ON {t};\n\
         CREATE TRIGGER {trigger}\n\
         \x20   AFTER {events} ON {t}\n\
         \x20   FOR EACH ROW EXECUTE FUNCTION {function}();\n",
        table = step.table,
        channel = step.channel_name(),
        channel_lit = quote_literal(&step.channel_name()),
        function = function,
        trigger = trigger,
        t = t,
        events = events.join(" OR "),
    )
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => format!("{}::jsonb", quote_literal(&value.to_string())),
    }
}

/// Conflict-ignoring insert of literal rows
pub fn seed_sql(step: &SeedStep) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for row in &step.rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let rows: Vec<String> = step
        .rows
        .iter()
        .map(|row| {
            let values: Vec<String> = columns
                .iter()
                .map(|c| row.get(*c).map(literal).unwrap_or_else(|| "DEFAULT".to_string()))
                .collect();
            format!("    ({})", values.join(", "))
        })
        .collect();

    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "-- Seed: {} row(s) for {}\nINSERT INTO {} ({}) VALUES\n{}\nON CONFLICT DO NOTHING;\n",
        step.rows.len(),
        step.table,
        quote_ident(&step.table),
        cols.join(", "),
        rows.join(",\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RealtimeEvent;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn todos() -> TableStep {
        let mut id = ColumnSpec::new("id", "uuid").primary_key();
        id.default = Some("gen_random_uuid()".to_string());
        let mut owner = ColumnSpec::new("user_id", "uuid");
        owner.references = Some("profiles".to_string());
        owner.on_delete = Some("cascade".to_string());
        let mut slug = ColumnSpec::new("slug", "text");
        slug.unique = true;
        TableStep {
            name: "todos".to_string(),
            columns: vec![id, owner, slug, ColumnSpec::new("note", "text").nullable()],
            policies: vec![],
            rls: false,
            description: Some("User's todo items".to_string()),
        }
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(&todos());
        assert_eq!(
            sql,
            "-- Table: todos\n\
             CREATE TABLE IF NOT EXISTS \"todos\" (\n\
             \x20   \"id\" uuid PRIMARY KEY DEFAULT gen_random_uuid(),\n\
             \x20   \"user_id\" uuid NOT NULL REFERENCES \"profiles\"(\"id\") ON DELETE CASCADE,\n\
             \x20   \"slug\" text NOT NULL UNIQUE,\n\
             \x20   \"note\" text\n\
             );\n\
             \n\
             COMMENT ON TABLE \"todos\" IS 'User''s todo items';\n\
             \n\
             GRANT ALL ON \"todos\" TO service_role;\n\
             GRANT SELECT, INSERT, UPDATE, DELETE ON \"todos\" TO authenticated;\n"
        );
    }

    #[test]
    fn test_index_sql() {
        let step = IndexStep {
            table: "todos".to_string(),
            columns: vec!["user_id".to_string(), "slug".to_string()],
            unique: true,
            name: None,
        };
        assert_eq!(
            create_index_sql(&step),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_todos_user_id_slug ON \"todos\"(\"user_id\", \"slug\");\n"
        );
    }

    #[test]
    fn test_seed_sql_fills_missing_columns_with_default() {
        let rows = vec![
            json!({"code": "us", "name": "United States"}),
            json!({"code": "ci", "name": "Côte d'Ivoire", "meta": {"tz": ["UTC"]}}),
        ];
        let step = SeedStep {
            table: "countries".to_string(),
            rows: rows
                .into_iter()
                .map(|v| v.as_object().cloned().unwrap())
                .collect(),
        };
        let sql = seed_sql(&step);
        assert!(sql.contains("INSERT INTO \"countries\" (\"code\", \"name\", \"meta\") VALUES"));
        assert!(sql.contains("('us', 'United States', DEFAULT)"));
        assert!(sql.contains("('ci', 'Côte d''Ivoire', '{\"tz\":[\"UTC\"]}'::jsonb)"));
        assert!(sql.trim_end().ends_with("ON CONFLICT DO NOTHING;"));
    }

    #[test]
    fn test_realtime_sql() {
        let step = RealtimeStep {
            table: "messages".to_string(),
            channel: None,
            events: vec![RealtimeEvent::Insert, RealtimeEvent::Delete],
        };
        let sql = realtime_sql(&step);
        assert!(sql.contains("CREATE OR REPLACE FUNCTION notify_messages_changes() RETURNS trigger"));
        assert!(sql.contains("PERFORM pg_notify('realtime:messages', payload::text);"));
        assert!(sql.contains("DROP TRIGGER IF EXISTS messages_realtime ON \"messages\";"));
        assert!(sql.contains("AFTER INSERT OR DELETE ON \"messages\""));
    }
}
