//! Command-line host for the trusted updater.
//!
//! Loads an updater configuration, checks for a newer release and, on
//! request, downloads and applies it.

use std::path::PathBuf;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};
use trusted_updater::{
    ApplyRequest, Channel, ConfirmationHandler, UpdateCandidate, UpdateClient, UpdaterConfig,
};

/// Command-line arguments for the update host
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Updater configuration (JSON)
    #[arg(short, long, default_value = "updater.json")]
    config: PathBuf,

    /// Pinned root document used when no root has been cached yet
    #[arg(long)]
    bootstrap_root: Option<PathBuf>,

    /// Pre-release channel to follow (a, b or rc); stable only when omitted
    #[arg(long)]
    channel: Option<Channel>,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report whether a newer release is available
    Check,

    /// Download and install the newest release
    Apply {
        /// Install without asking for confirmation
        #[arg(short = 'y', long, default_value_t = false)]
        skip_confirmation: bool,

        /// Remove everything in the install directory that is not excluded
        #[arg(long, default_value_t = false)]
        purge: bool,

        /// Path (relative to the install directory) kept by --purge
        #[arg(long = "exclude")]
        exclude: Vec<PathBuf>,
    },

    /// Show what --purge would delete, without changing anything
    Plan {
        #[arg(long = "exclude")]
        exclude: Vec<PathBuf>,
    },
}

/// Asks on the terminal before installing.
struct StdinConfirmation;

#[async_trait]
impl ConfirmationHandler for StdinConfirmation {
    async fn confirm(&self, candidate: &UpdateCandidate) -> bool {
        let mut stdout = tokio::io::stdout();
        let prompt = format!("Install version {}? [y/N] ", candidate.version());
        if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut answer = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut answer).await {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

fn render_progress(downloaded: u64, expected: u64) {
    let percent = if expected == 0 {
        100
    } else {
        downloaded.saturating_mul(100) / expected
    };
    eprint!("\rdownloading: {percent:>3}% ({downloaded}/{expected} bytes)");
    if downloaded >= expected {
        eprintln!();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug,trusted_updater=debug")
    } else {
        EnvFilter::new("info,trusted_updater=info")
    };
    fmt().with_env_filter(filter).init();

    let config = UpdaterConfig::from_json_file(&args.config)?;
    let mut builder = UpdateClient::builder(config)
        .with_progress_hook(render_progress)
        .with_confirmation(StdinConfirmation);
    if let Some(path) = &args.bootstrap_root {
        builder = builder.bootstrap_root(std::fs::read(path)?);
    }
    let client = builder.build()?;
    tracing::info!("installed version: {}", client.installed_version());

    let command = args.command.unwrap_or(Commands::Check);
    if let Commands::Plan { exclude } = &command {
        let plan = client.plan_purge(exclude)?;
        for path in &plan.delete {
            println!("delete {}", path.display());
        }
        for path in &plan.keep {
            println!("keep   {}", path.display());
        }
        return Ok(());
    }

    let candidate = match client.check_for_updates(args.channel).await {
        Ok(Some(candidate)) => candidate,
        Ok(None) => {
            println!("Already up to date.");
            return Ok(());
        }
        Err(err) if err.is_unavailable() => {
            tracing::warn!("update server unavailable: {err}");
            println!("No update available right now.");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    println!(
        "Version {} is available ({} bytes).",
        candidate.version(),
        candidate.total_length()
    );
    for change in candidate.changes() {
        println!("  - {change}");
    }
    match client.release_notes(&candidate).await {
        Ok(Some(notes)) => println!("\n{notes}"),
        Ok(None) => {}
        Err(err) => tracing::warn!("release notes unavailable: {err}"),
    }

    if let Commands::Apply {
        skip_confirmation,
        purge,
        exclude,
    } = command
    {
        let outcome = client
            .download_and_apply_update(ApplyRequest {
                purge,
                exclude_from_purge: exclude,
                skip_confirmation,
            })
            .await?;
        println!(
            "Updated {} from {} to {}.",
            outcome.install_dir.display(),
            outcome.previous_version,
            outcome.new_version
        );
    }

    Ok(())
}
