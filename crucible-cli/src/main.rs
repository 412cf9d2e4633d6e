//! Crucible CLI — prepare, finalize, and maintain debate runs.

mod env;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crucible_core::{
    allocate_iterations, cleanup_runs, format_bytes, generate_rerun_instructions,
    generate_scope_instructions, load_cleanup_settings, load_scopes_config, output_root,
    prepare_run, CleanupReport, FinalizeOptions, Phase,
};

#[derive(Parser, Debug)]
#[command(name = "crucible", version, about = "Multi-agent debate runs for vetting proposals")]
struct Cli {
    /// Project root (defaults to CRUCIBLE_ROOT, then the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new run directory with instructions.
    Prepare {
        /// Phase to run (market/design/tech/studio).
        #[arg(long)]
        phase: String,
        /// Idea/objective text that seeds the run.
        #[arg(long)]
        text: String,
        /// Budget cap (only used by the studio phase).
        #[arg(long, default_value = "$0-20/mo")]
        budget: String,
        /// Iteration cap for the Advocate/Contrarian loop.
        #[arg(long, default_value_t = 3)]
        max_iterations: u32,
        /// Skip the automatic cleanup pass that enforces age/size budgets.
        #[arg(long)]
        skip_cleanup: bool,
        /// Preview cleanup deletions without removing any files.
        #[arg(long)]
        cleanup_dry_run: bool,
    },
    /// Mark an existing run as completed and refresh the index.
    Finalize {
        /// Phase the run belongs to.
        #[arg(long)]
        phase: String,
        /// Run identifier created via `prepare`.
        #[arg(long)]
        run_id: String,
        /// Final status label.
        #[arg(long, default_value = "COMPLETED")]
        status: String,
        /// Override summary path recorded in the index.
        #[arg(long)]
        summary: Option<String>,
        /// Final verdict (APPROVED/REJECTED/N/A).
        #[arg(long)]
        verdict: Option<String>,
        /// Number of iterations executed.
        #[arg(long)]
        iterations_run: Option<u32>,
        /// Optional hours spent on this run.
        #[arg(long)]
        hours: Option<f64>,
        /// Optional cost (in USD) attributed to this run.
        #[arg(long)]
        cost: Option<f64>,
    },
    /// Manually enforce cleanup thresholds.
    Cleanup {
        /// Report what would be deleted without removing files.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the scope-based iteration plan for a scopes config.
    Scopes {
        /// Path to the scopes TOML file.
        #[arg(long, default_value = ".crucible/scopes.toml")]
        config: PathBuf,
        /// Total iteration budget overriding the config's own total.
        #[arg(long)]
        total_budget: Option<i64>,
    },
    /// Print rerun instructions from the latest rejection in a run dir.
    Rerun {
        /// Run directory to inspect.
        #[arg(long)]
        run_dir: PathBuf,
        /// Studio role to scope the search to.
        #[arg(long)]
        role: Option<String>,
    },
    /// Show the resolved model candidate priority and health tuning.
    Models,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let root = resolve_root(cli.root.clone());

    match cli.command {
        Command::Prepare {
            phase,
            text,
            budget,
            max_iterations,
            skip_cleanup,
            cleanup_dry_run,
        } => {
            let phase: Phase = phase.parse()?;

            let skip = skip_cleanup || env::env_flag("CRUCIBLE_SKIP_CLEANUP");
            let dry = cleanup_dry_run || env::env_flag("CRUCIBLE_CLEANUP_DRY_RUN");
            if !skip {
                run_cleanup(&root, dry)?;
            }

            let prepared = prepare_run(&root, phase, &text, &budget, max_iterations, Utc::now())
                .context("failed to prepare run")?;
            println!("Prepared {} ({})", prepared.run_id, phase);
            println!("- Run directory: {}", prepared.run_dir.display());
            println!("- Instructions: {}", prepared.instructions_path.display());
        }
        Command::Finalize {
            phase,
            run_id,
            status,
            summary,
            verdict,
            iterations_run,
            hours,
            cost,
        } => {
            let phase: Phase = phase.parse()?;
            let meta = crucible_core::finalize_run(
                &root,
                phase,
                &run_id,
                FinalizeOptions {
                    status,
                    summary,
                    verdict,
                    iterations_run,
                    hours,
                    cost,
                },
            )
            .context("failed to finalize run")?;
            println!("Finalized {} ({}) → {}", meta.run_id, phase, meta.status);
        }
        Command::Cleanup { dry_run } => {
            run_cleanup(&root, dry_run || env::env_flag("CRUCIBLE_CLEANUP_DRY_RUN"))?;
        }
        Command::Scopes {
            config,
            total_budget,
        } => {
            let scopes = load_scopes_config(&config)
                .with_context(|| format!("failed to load scopes from {}", config.display()))?;
            let allocations = allocate_iterations(&scopes, total_budget);
            print!("{}", generate_scope_instructions(&scopes, &allocations));
        }
        Command::Rerun { run_dir, role } => {
            let instructions = generate_rerun_instructions(&run_dir, role.as_deref())
                .context("failed to inspect run directory")?;
            println!("{}", instructions);
        }
        Command::Models => {
            let candidates = env::configured_model_candidates();
            let config = env::health_config_from_env();
            println!("Model candidate priority:");
            for (i, candidate) in candidates.iter().enumerate() {
                println!("  {}. {}", i + 1, candidate);
            }
            println!(
                "Cooldown: default {}s, floor {}s",
                config.default_cooldown.as_secs(),
                config.min_cooldown.as_secs()
            );
            println!(
                "Overheat: {}s on status {:?}",
                config.overheat_cooldown.as_secs(),
                config.overheat_status_codes
            );
            println!("Low-headroom warn ratio: {}", config.warn_ratio);
        }
    }

    Ok(())
}

fn resolve_root(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var("CRUCIBLE_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn run_cleanup(root: &Path, dry_run: bool) -> Result<()> {
    let settings = load_cleanup_settings(root).context("failed to load cleanup settings")?;
    let report = cleanup_runs(&output_root(root), settings, None, dry_run);
    log_cleanup_report(&report);
    Ok(())
}

fn log_cleanup_report(report: &CleanupReport) {
    if report.total_runs == 0 {
        println!("Cleanup: no prior runs detected.");
        return;
    }

    println!(
        "Cleanup: scanned {} runs ({})",
        report.total_runs,
        format_bytes(report.total_size_bytes)
    );
    if report.deletions.is_empty() {
        println!("- No deletions required.");
    } else {
        let reasons = report
            .reasons_summary()
            .iter()
            .map(|(reason, count)| format!("{}={}", reason, count))
            .collect::<Vec<_>>()
            .join(", ");
        let verb = if report.dry_run { "Would remove" } else { "Removed" };
        println!(
            "- {} {} runs ({}) [{}]",
            verb,
            report.deletions.len(),
            format_bytes(report.freed_bytes()),
            reasons
        );
    }
    for message in &report.errors {
        println!("- Cleanup warning: {}", message);
    }
}
