//! Function scaffolds
//!
//! Each function step becomes `<name>/index.ts`, a handler for the external
//! function runtime. The runtime passes `ctx = {caller, env, log, request}`;
//! the scaffold enforces the declared auth requirement, checks the declared
//! environment variables and short-circuits on `{"dryRun": true}` so that
//! verification can smoke-test it without side effects.

use super::{render, FunctionFile};
use crate::plan::FunctionStep;

const HANDLER_TEMPLATE: &str = r#"// Function: {{name}}
// {{description}}

export interface Caller {
  id: string;
  orgId: string | null;
  isAdmin: boolean;
}

export interface HandlerContext {
  caller: Caller | null;
  env: Record<string, string | undefined>;
  log: (level: "debug" | "info" | "warn" | "error", message: string, fields?: Record<string, unknown>) => void;
  request: { method: string; body: Record<string, unknown> | null };
}

const FUNCTION_NAME = "{{name}}";
const REQUIRED_ENV: readonly string[] = [{{env}}];
const TABLES: readonly string[] = [{{tables}}];

export default async function handler(ctx: HandlerContext): Promise<unknown> {
{{auth_guard}}
  const missing = REQUIRED_ENV.filter((key) => !ctx.env[key]);
  if (missing.length > 0) {
    ctx.log("error", "missing environment variables", { function: FUNCTION_NAME, missing });
    return { status: 500, error: `missing environment variables: ${missing.join(", ")}` };
  }

  if (ctx.request.body?.dryRun === true) {
    ctx.log("info", "dry run", { function: FUNCTION_NAME });
    return { status: 200, ok: true, dryRun: true, function: FUNCTION_NAME, tables: TABLES };
  }

  ctx.log("info", "invoked", { function: FUNCTION_NAME, caller: ctx.caller?.id ?? null });

  // Handler body goes here.
  return { status: 200, ok: true, function: FUNCTION_NAME };
}
"#;

const AUTH_GUARD: &str = r#"  if (!ctx.caller) {
    ctx.log("warn", "rejected anonymous call", { function: FUNCTION_NAME });
    return { status: 401, error: "authentication required" };
  }
"#;

fn string_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn scaffold(step: &FunctionStep) -> FunctionFile {
    let description = step
        .description
        .as_deref()
        .unwrap_or("Generated handler")
        .replace('\n', " ");
    let content = render(
        HANDLER_TEMPLATE,
        &[
            ("name", step.name.clone()),
            ("description", description),
            ("env", string_list(&step.env)),
            ("tables", string_list(&step.tables)),
            ("auth_guard", if step.auth { AUTH_GUARD.to_string() } else { String::new() }),
        ],
    );

    FunctionFile {
        name: step.name.clone(),
        path: format!("{}/index.ts", step.name),
        content,
    }
}
