//! branchsync command-line tool.
//!
//! Provides subcommands for synchronizing the configured branch set,
//! inspecting its status, publishing it, and generating / validating the
//! configuration file.

mod render;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use tracing_subscriber::EnvFilter;

use branchsync_core::config::{AppConfig, TEMPLATE};
use branchsync_core::{SyncEngine, SyncError};

/// Exit status for a run halted on conflicts that need an operator.
const EXIT_NEEDS_HUMAN: u8 = 2;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// branchsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "branchsync",
    version,
    about = "Keep dependent maintainer branches in sync with their upstreams"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// (default: <config dir>/branchsync/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace). RUST_LOG overrides this.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, refresh leaf branches and rebuild integration branches.
    #[command(alias = "update")]
    Sync {
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show whether every maintained branch is up to date (read-only).
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Push the configured refspecs to their remotes.
    Publish {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path (default: the configuration path).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let needs_human = e
                .downcast_ref::<SyncError>()
                .is_some_and(SyncError::needs_human);
            if needs_human {
                ExitCode::from(EXIT_NEEDS_HUMAN)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()
            .context("cannot determine the configuration directory; pass --config")?,
    };

    match cli.command {
        Commands::Init { output } => {
            init_tracing(cli.verbose, None);
            cmd_init(output.as_deref().unwrap_or(&config_path))
        }
        Commands::Validate => {
            init_tracing(cli.verbose, None);
            cmd_validate(&config_path)
        }
        command => {
            let config = AppConfig::load_and_validate(&config_path)
                .with_context(|| format!("failed to load {}", config_path.display()))?;
            init_tracing(cli.verbose, Some(&config.repository.log_level));

            match command {
                Commands::Sync { json } => cmd_sync(&config, json).await,
                Commands::Status { json } => cmd_status(&config, json).await,
                Commands::Publish { yes } => cmd_publish(&config, yes).await,
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// `RUST_LOG` wins; otherwise `-v`/`-vv`; otherwise the configured level for
/// this tool's crates and `warn` for everything else.
fn init_tracing(verbose: u8, config_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => config_level.unwrap_or("info"),
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("warn,branchsync_core={level},branchsync={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_sync(config: &AppConfig, json: bool) -> Result<()> {
    let mut engine = SyncEngine::from_config(config).context("failed to open repository")?;
    let report = engine
        .synchronize()
        .await
        .context("synchronization halted")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render::print_report(&report);
    }
    Ok(())
}

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config).context("failed to open repository")?;
    let rows = engine.status().await.context("failed to read branch status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("{}", style::header("branchsync status"));
    println!("  {}", style::dim(&config.repo_path().display().to_string()));
    println!();
    if rows.is_empty() {
        println!("No branches configured.");
    } else {
        println!("{}", render::status_table(&rows));
    }
    println!();
    Ok(())
}

async fn cmd_publish(config: &AppConfig, yes: bool) -> Result<()> {
    if config.publish.is_empty() {
        println!("{}", style::warn("No [[publish]] targets configured."));
        return Ok(());
    }

    println!();
    println!("{}", style::header("Publishing"));
    for target in &config.publish {
        let mode = if target.force { " (forced)" } else { "" };
        println!("  {}{}", style::branch(&target.remote), style::dim(mode));
        for refspec in &target.refspecs {
            println!("    {refspec}");
        }
    }
    println!();

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Push these refs?")
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !confirmed {
            println!("{}", style::warn("Publish cancelled. Nothing was pushed."));
            return Ok(());
        }
    }

    let mut engine = SyncEngine::from_config(config).context("failed to open repository")?;
    let pushed = engine.publish().await.context("publish failed")?;
    for remote in pushed {
        println!("{}", style::success(&format!("pushed to {remote}")));
    }
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;

        if !overwrite {
            println!(
                "{}",
                style::warn("Init cancelled. Existing file was not modified.")
            );
            return Ok(());
        }
    }

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, TEMPLATE).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point [repository] path at your working clone");
    println!("  2. Describe your mirrors, forward and integration branches");
    println!(
        "  3. Validate with: branchsync validate --config {}",
        output.display()
    );
    println!("  4. Run: branchsync sync --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    match config.validate() {
        Ok(()) => {
            println!("  {}", style::success("Branch relationships are valid"));
        }
        Err(e) => {
            println!("  {}", style::error(&format!("Validation error: {e}")));
            anyhow::bail!("configuration validation failed");
        }
    }

    let repo = config.repo_path();
    if repo.join(".git").exists() || repo.join("HEAD").exists() {
        println!("  {}", style::success("Repository found"));
    } else {
        println!(
            "  {}",
            style::warn(&format!("No git repository at {}", repo.display()))
        );
    }

    println!();
    println!("Configuration summary:");
    println!("  Repository      : {}", repo.display());
    println!("  Command timeout : {}s", config.repository.command_timeout_secs);
    println!(
        "  Fetch attempts  : {} ({}s apart)",
        config.repository.fetch_attempts, config.repository.fetch_backoff_secs
    );
    println!("  Mirrors         : {}", config.mirrors.len());
    println!("  Tags            : {}", config.tags.len());
    println!("  Forward branches: {}", config.forwards.len());
    println!("  Top-level       : {}", config.top_level.len());
    println!(
        "  Integration     : {} testing, {} queue",
        config.testing.len(),
        config.queue.len()
    );
    println!("  Publish targets : {}", config.publish.len());
    println!();
    println!("Configuration is valid.");

    Ok(())
}
