//! bcasl - pre-compilation plugin pipeline.
//!
//! Runs the configured plugins against a workspace and exits with the
//! verdict: 0 when compilation may proceed, 2 when a plugin aborted the
//! build, 1 on setup errors.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bcasl::core::{describe_priority, Phase, PipelineReport, PipelineRunner, PluginStatus};
use bcasl::plugin::{builtin, serve_worker, WorkerCommand};
use bcasl::{WorkspaceConfig, APP_NAME};

/// Pre-compilation plugin pipeline
#[derive(Parser)]
#[command(name = "bcasl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline against a workspace
    Run {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: String,

        /// Directory holding plugin packages
        #[arg(short, long)]
        plugins_dir: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List the plugins available to a workspace
    List {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: String,

        /// Directory holding plugin packages
        #[arg(short, long)]
        plugins_dir: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show the resolved execution order
    Order {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: String,

        /// Directory holding plugin packages
        #[arg(short, long)]
        plugins_dir: Option<String>,
    },

    /// Write a starter bcasl.yml
    Init {
        /// Workspace directory
        #[arg(default_value = ".")]
        workspace: String,

        /// Directory holding plugin packages
        #[arg(short, long)]
        plugins_dir: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Serve one isolated plugin run (internal)
    #[command(hide = true)]
    SandboxWorker,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries reports and worker output.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run { workspace, plugins_dir, format } => {
            cmd_run(&workspace, plugins_dir.as_deref(), format)
        }
        Commands::List { workspace, plugins_dir, format } => {
            cmd_list(&workspace, plugins_dir.as_deref(), format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Order { workspace, plugins_dir } => {
            cmd_order(&workspace, plugins_dir.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { workspace, plugins_dir, force } => {
            cmd_init(&workspace, plugins_dir.as_deref(), force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::SandboxWorker => Ok(cmd_sandbox_worker()),
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Explicit plugin directory, else the user's plugin directory if present.
fn plugins_dir(explicit: Option<&str>) -> Option<PathBuf> {
    match explicit {
        Some(dir) => Some(expand(dir)),
        None => dirs::data_dir().map(|d| d.join(APP_NAME).join("plugins")).filter(|d| d.is_dir()),
    }
}

fn runner(workspace: &str, explicit_plugins: Option<&str>) -> PipelineRunner {
    let mut runner = PipelineRunner::new(expand(workspace))
        .catalog(builtin::catalog())
        .host_worker(WorkerCommand::host_worker().ok());
    if let Some(dir) = plugins_dir(explicit_plugins) {
        tracing::debug!(dir = %dir.display(), "using plugin directory");
        runner = runner.plugins_dir(dir);
    }
    runner
}

fn cmd_run(workspace: &str, plugins: Option<&str>, format: Format) -> Result<ExitCode> {
    let report = runner(workspace, plugins).run()?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&report)?;
            println!("{json}");
        }
        Format::Text => print_report(&report),
    }

    Ok(if report.is_proceed() { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

fn status_icon(status: PluginStatus) -> &'static str {
    match status {
        PluginStatus::Succeeded => "✓",
        PluginStatus::Failed | PluginStatus::TimedOut => "✗",
        PluginStatus::Vetoed => "⛔",
        PluginStatus::Skipped => "-",
        PluginStatus::Pending | PluginStatus::Running => "…",
    }
}

fn print_report(report: &PipelineReport) {
    for warning in &report.diagnostics {
        println!("warning: {warning}");
    }

    for outcome in &report.outcomes {
        println!(
            "{} {} [{}] {} ms{}",
            status_icon(outcome.status),
            outcome.plugin_id,
            outcome.status,
            outcome.duration.as_millis(),
            outcome.message.as_deref().map(|m| format!(" - {m}")).unwrap_or_default()
        );
        for line in &outcome.logs {
            println!("    {line}");
        }
    }

    if let Some(path) = &report.workspace_switch {
        println!("workspace switch requested: {}", path.display());
    }
    println!("\n{}", report.summary());
    println!("Verdict: {}", report.verdict);
}

fn cmd_list(workspace: &str, plugins: Option<&str>, format: Format) -> Result<()> {
    let plan = runner(workspace, plugins).plan()?;

    match format {
        Format::Json => {
            let entries: Vec<_> = plan
                .registry
                .records()
                .map(|record| {
                    let meta = record.metadata();
                    serde_json::json!({
                        "id": meta.id(),
                        "name": meta.name(),
                        "version": meta.version(),
                        "description": meta.description(),
                        "tags": meta.tags(),
                        "requires": meta.requires(),
                        "enabled": record.enabled,
                        "priority": record.priority,
                        "origin": record.origin(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Format::Text => {
            for record in plan.registry.records() {
                let meta = record.metadata();
                println!(
                    "{} {} {} - {}{}",
                    if record.enabled { "●" } else { "○" },
                    meta.id(),
                    meta.version(),
                    meta.description(),
                    if record.enabled { "" } else { " (disabled)" }
                );
            }
            for problem in &plan.diagnostics {
                println!("warning: {problem}");
            }
            println!("\nTotal: {} plugins", plan.registry.len());
        }
    }

    Ok(())
}

fn cmd_order(workspace: &str, plugins: Option<&str>) -> Result<()> {
    let plan = runner(workspace, plugins).plan()?;

    for (idx, id) in plan.order.order.iter().enumerate() {
        let Some(record) = plan.registry.get(id) else {
            continue;
        };
        let tags = record.metadata().tags();
        let deps: Vec<&str> = plan.order.dependencies_of(id).collect();
        print!("{:>2}. [{}] {}", idx + 1, record.priority, describe_priority(id, tags));
        if deps.is_empty() {
            println!();
        } else {
            println!(" (after {})", deps.join(", "));
        }
    }
    for warning in &plan.order.warnings {
        println!("warning: {warning}");
    }

    let unphased = plan
        .order
        .order
        .iter()
        .filter_map(|id| plan.registry.get(id))
        .filter(|r| Phase::for_tags(r.metadata().tags()) == Phase::Default)
        .count();
    println!("\nTotal: {} plugins ({} without a known phase)", plan.order.len(), unphased);

    Ok(())
}

fn cmd_init(workspace: &str, plugins: Option<&str>, force: bool) -> Result<()> {
    let plan = runner(workspace, plugins).plan()?;
    let root: &Path = &plan.workspace;

    if let Some(existing) = WorkspaceConfig::find(root) {
        if !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                existing.display()
            );
        }
    }

    let config = WorkspaceConfig::generate_default(root, &plan.registry);
    let path = config.save(root).context("failed to write configuration")?;
    println!("Created {}", path.display());
    println!("  required files: {}", config.required_files.len());
    println!("  plugins: {}", config.plugin_order.join(", "));

    Ok(())
}

fn cmd_sandbox_worker() -> ExitCode {
    let code = serve_worker(&builtin::catalog(), io::stdin().lock(), &mut io::stdout(), &mut io::stderr());
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
