//! SchemaFlow CLI
//!
//! ```bash
//! schemaflow plan --file plan.yaml            # compile and stage only
//! schemaflow apply --file plan.yaml --atomic  # snapshot, migrate, deploy, verify
//! schemaflow rollback --last
//! schemaflow template package ./templates/todo --out dist/todo.tar.gz
//! schemaflow template install dist/todo.tar.gz --sha256 <hex> --dest ./todo
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use schemaflow_deploy::apply::{ApplyEngine, ApplyOptions, ApplyReport};
use schemaflow_deploy::compiler::compile_with;
use schemaflow_deploy::config::Settings;
use schemaflow_deploy::db::PgDatabase;
use schemaflow_deploy::error::AppResult;
use schemaflow_deploy::manifest::ProjectManifest;
use schemaflow_deploy::plan::Plan;
use schemaflow_deploy::rollback::RollbackEngine;
use schemaflow_deploy::staging::{write_generated, StagingArea};
use schemaflow_deploy::template;
use schemaflow_deploy::verify::VerificationEngine;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "schemaflow")]
#[command(version)]
#[command(about = "Compile, apply and roll back declarative PostgreSQL plans")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a plan and stage its artifacts without touching the database
    Plan {
        #[arg(short, long)]
        file: PathBuf,

        /// Overwrite staged and generated files
        #[arg(long)]
        force: bool,
    },

    /// Snapshot, migrate, deploy functions and verify
    Apply {
        #[arg(short, long)]
        file: PathBuf,

        /// Overwrite live artifacts and bypass safety.requireForce
        #[arg(long)]
        force: bool,

        /// Skip the plan's verification block
        #[arg(long)]
        no_verify: bool,

        /// Run every migration in one transaction
        #[arg(long)]
        atomic: bool,
    },

    /// Restore the schema from the latest pre-apply snapshot
    Rollback {
        #[arg(long, required = true)]
        last: bool,
    },

    /// Package, install or validate templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    Package {
        dir: PathBuf,

        /// Archive path (default: <name>.tar.gz)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Install {
        archive: PathBuf,

        /// Expected SHA-256 (hex, or the contents of the .sha256 file)
        #[arg(long)]
        sha256: String,

        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },
    Validate {
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error[CONFIG_ERROR]: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli, settings).await {
        Ok(code) => code,
        Err(e) => {
            e.log();
            eprintln!("error[{}]: {}", e.code(), e);
            if let Some(hint) = e.hint() {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,schemaflow_deploy=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

fn load_settings() -> anyhow::Result<Settings> {
    let settings = Settings::load().context("loading configuration")?;
    info!("Configuration loaded (project root {})", settings.project.root.display());
    Ok(settings)
}

fn print<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> AppResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

async fn run(cli: Cli, settings: Settings) -> AppResult<ExitCode> {
    let json = cli.json;
    match cli.command {
        Commands::Plan { file, force } => cmd_plan(&settings, file, force, json),
        Commands::Apply {
            file,
            force,
            no_verify,
            atomic,
        } => {
            let options = ApplyOptions {
                force,
                verify: !no_verify,
                atomic,
            };
            cmd_apply(&settings, file, options, json).await
        }
        Commands::Rollback { .. } => cmd_rollback(&settings, json).await,
        Commands::Template { command } => cmd_template(command, json),
    }
}

fn cmd_plan(settings: &Settings, file: PathBuf, force: bool, json: bool) -> AppResult<ExitCode> {
    let project = &settings.project;
    let plan = Plan::load(&file)?;
    let existing = ProjectManifest::load(&project.manifest_path())?;
    let output = compile_with(&plan, &project.compile_options(existing))?;

    let staged = StagingArea::new(project.staging_dir()).stage(&output, force)?;
    let generated: Vec<_> = output.sdk_files.iter().chain(output.test_files.iter()).cloned().collect();
    let written = write_generated(project, &generated, force)?;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct PlanSummary<'a> {
        migrations: Vec<&'a str>,
        functions: Vec<&'a str>,
        generated: Vec<String>,
        warnings: &'a [String],
    }
    let summary = PlanSummary {
        migrations: output.migrations.iter().map(|m| m.name.as_str()).collect(),
        functions: output.functions.iter().map(|f| f.name.as_str()).collect(),
        generated: written.iter().map(|p| p.display().to_string()).collect(),
        warnings: &output.warnings,
    };

    print(json, &summary, || {
        println!("Staged {} migrations and {} functions", staged.migrations.len(), staged.functions.len());
        for name in &summary.migrations {
            println!("  migration  {}", name);
        }
        for name in &summary.functions {
            println!("  function   {}", name);
        }
        for path in &summary.generated {
            println!("  generated  {}", path);
        }
        for warning in summary.warnings {
            println!("warning: {}", warning);
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

fn print_apply(report: &ApplyReport) {
    println!(
        "Apply {} (phase {}, {}ms)",
        if report.success { "succeeded" } else { "failed" },
        report.phase,
        report.duration_ms
    );
    if let Some(snapshot) = &report.snapshot {
        println!("  snapshot   {}", snapshot.id);
    }
    for name in &report.applied_migrations {
        println!("  applied    {}", name);
    }
    for name in &report.skipped_migrations {
        println!("  skipped    {}", name);
    }
    for name in &report.failed_migrations {
        println!("  failed     {}", name);
    }
    for name in &report.deployed_functions {
        println!("  function   {}", name);
    }
    if let Some(verification) = &report.verification {
        println!("  verify     {} passed, {} failed", verification.passed, verification.failed);
        for probe in verification.failures() {
            println!("    x {}: {}", probe.name, probe.detail);
        }
    }
    for issue in &report.errors {
        println!("error[{}] {}: {}", issue.code, issue.target, issue.message);
    }
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
}

async fn cmd_apply(settings: &Settings, file: PathBuf, options: ApplyOptions, json: bool) -> AppResult<ExitCode> {
    let plan = Plan::load(&file)?;
    info!("Connecting to {}", settings.database.to_display_string());
    let db = PgDatabase::connect(&settings.database).await?;

    let verifier = match &settings.services.api_url {
        Some(_) if options.verify && plan.verification.is_some() => Some(VerificationEngine::new(&settings.services)?),
        _ => None,
    };
    let mut engine = ApplyEngine::new(&settings.project, &db);
    if let Some(verifier) = &verifier {
        engine = engine.with_verifier(verifier);
    }

    let report = engine.apply(&plan, &options).await?;
    print(json, &report, || print_apply(&report))?;
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        if report.snapshot.is_some() {
            warn!("Apply did not complete; `schemaflow rollback --last` restores the pre-apply schema");
        }
        ExitCode::FAILURE
    })
}

async fn cmd_rollback(settings: &Settings, json: bool) -> AppResult<ExitCode> {
    let db = PgDatabase::connect(&settings.database).await?;
    let report = RollbackEngine::new(&settings.project, &db).rollback_last().await?;
    print(json, &report, || {
        println!(
            "Restored schema from {} ({})",
            report.snapshot.id,
            report.snapshot.taken_at.to_rfc3339()
        );
        for name in &report.rewound_migrations {
            println!("  undone     {}", name);
        }
        for warning in &report.warnings {
            println!("warning: {}", warning);
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_template(command: TemplateCommands, json: bool) -> AppResult<ExitCode> {
    match command {
        TemplateCommands::Package { dir, out } => {
            let out = match out {
                Some(out) => out,
                None => PathBuf::from(format!("{}.tar.gz", template::validate_dir(&dir)?.name)),
            };
            let info = template::package(&dir, &out)?;
            print(json, &info, || {
                println!("{}  {} ({} bytes)", info.checksum, info.path.display(), info.size_bytes);
            })?;
        }
        TemplateCommands::Install { archive, sha256, dest } => {
            let manifest = template::install(&archive, &sha256, &dest, template::PLATFORM_VERSION)?;
            print(json, &manifest, || {
                println!("Installed {} ({}) into {}", manifest.name, manifest.category, dest.display());
            })?;
        }
        TemplateCommands::Validate { dir } => {
            let manifest = template::validate_dir(&dir)?;
            print(json, &manifest, || {
                println!("{} is a valid template: {}", manifest.name, manifest.description);
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

