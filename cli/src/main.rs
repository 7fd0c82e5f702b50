use anyhow::Context;
use clap::{Parser, Subcommand};
use ferry_core::assessment::AssessmentEngine;
use ferry_core::report::format_bytes;
use ferry_core::{DriveDiscovery, MigrationAssessment, MigrationConfig, MigrationManager};
use ferry_platform::{PlatformCommandRunner, PlatformDriveDiscovery, PlatformSpaceProbe};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Migrate data drives between filesystems", long_about = None)]
struct Cli {
    /// JSON config file; defaults apply to every field it leaves out
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List drives
    Drives,
    /// Scan a source drive without creating a plan
    Assess {
        /// Source device, e.g. /dev/sdb1
        source: String,
    },
    /// Assess the source and store a migration plan
    Plan {
        source: String,
        /// One or more target devices; the first receives the data
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Plan and run a migration, following its progress
    Migrate {
        source: String,
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        id: Option<String>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Run a stored plan
    Start {
        id: String,
    },
    /// Undo a completed or failed migration
    Rollback {
        id: String,
    },
    /// Progress and health of one migration
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Full report for one migration
    Report {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Totals over every known migration
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List known migrations
    List,
    /// Forget a finished migration and delete its state files
    Cleanup {
        id: String,
        /// Also delete the configuration backup
        #[arg(long)]
        remove_backup: bool,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MigrationConfig> {
    match path {
        Some(path) => MigrationConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(MigrationConfig::default()),
    }
}

/// Whether a command may change migration state. Read-only commands never
/// write snapshots, so they are safe next to a run in another shell.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadOnly,
    Modify,
}

async fn build_manager(
    config: MigrationConfig,
    access: Access,
) -> anyhow::Result<Arc<MigrationManager>> {
    let runner = PlatformCommandRunner::new(&config);
    let manager = MigrationManager::new(
        config,
        Arc::new(PlatformDriveDiscovery),
        Arc::new(runner),
        Arc::new(PlatformSpaceProbe),
    )?;
    let restored = manager.load_persisted().await?;
    tracing::debug!("Loaded {} migrations from {}", restored, manager.work_dir().root().display());
    if access == Access::Modify {
        for id in manager.recover_interrupted().await? {
            println!("Migration {} was interrupted and is now marked failed.", id);
        }
    }
    Ok(Arc::new(manager))
}

fn print_assessment(assessment: &MigrationAssessment) {
    println!("Source: {}", assessment.source.device);
    println!("  Files: {}", assessment.total_files);
    println!("  Data: {}", format_bytes(assessment.total_size_bytes));
    println!("  Space required: {}", format_bytes(assessment.space_required_bytes));
    println!("  Estimated duration: {:.1} hours", assessment.estimated_duration_hours);
    println!("  Integrity samples: {}", assessment.integrity_samples.len());
    if !assessment.compatibility_issues.is_empty() {
        println!("  Compatibility issues ({}):", assessment.compatibility_issues.len());
        for issue in assessment.compatibility_issues.iter().take(20) {
            println!("    - {}", issue);
        }
        if assessment.compatibility_issues.len() > 20 {
            println!("    ... and {} more", assessment.compatibility_issues.len() - 20);
        }
    }
    if !assessment.recommendations.is_empty() {
        println!("  Recommendations:");
        for recommendation in &assessment.recommendations {
            println!("    - {}", recommendation);
        }
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    println!("{}", prompt);
    print!("Type 'yes' to continue: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

/// Start the run and print progress until it finishes.
async fn follow(manager: &Arc<MigrationManager>, id: &str) -> anyhow::Result<()> {
    manager.start(id).await?;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let snapshot = manager.progress(id).await?;
        let remaining = snapshot
            .estimated_remaining_seconds
            .map(|s| format!(", ~{}h {:02}m left", s / 3600, (s % 3600) / 60))
            .unwrap_or_default();
        print!(
            "\r{}: {}/{} files ({:.1}%), {} copied{}    ",
            snapshot.status,
            snapshot.files_migrated,
            snapshot.total_files,
            snapshot.files_percent,
            format_bytes(snapshot.bytes_migrated),
            remaining
        );
        io::stdout().flush()?;
        if snapshot.status.is_terminal() {
            println!();
            break;
        }
    }

    println!("{}", manager.report(id).await?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Drives => {
            let drives = PlatformDriveDiscovery.discover_drives().await?;
            if drives.is_empty() {
                println!("No drives found.");
            }
            for drive in drives {
                println!("{}", drive.device);
                println!("  Size: {}", format_bytes(drive.size_bytes));
                println!("  Filesystem: {}", drive.filesystem.as_deref().unwrap_or("-"));
                if let Some(label) = &drive.label {
                    println!("  Label: {}", label);
                }
                if let Some(uuid) = &drive.uuid {
                    println!("  UUID: {}", uuid);
                }
                if let Some(mount_point) = &drive.mount_point {
                    println!("  Mounted at: {}", mount_point.display());
                }
                println!("  Role: {}", drive.role);
                println!("  Health: {}", drive.health);
                println!();
            }
        }
        Commands::Assess { source } => {
            let drives = PlatformDriveDiscovery.discover_drives().await?;
            let drive = drives
                .into_iter()
                .find(|d| d.device == source)
                .ok_or_else(|| anyhow::anyhow!("Drive not found: {}", source))?;
            let engine = AssessmentEngine::new(&config);
            let assessment = tokio::task::spawn_blocking(move || engine.assess(&drive)).await??;
            print_assessment(&assessment);
        }
        Commands::Plan { source, targets, id } => {
            let manager = build_manager(config, Access::Modify).await?;
            let id = manager.create_plan(&source, &targets, id).await?;
            print_assessment(&manager.metadata(&id)?.assessment);
            println!("\nPlan {} is ready. Run it with 'ferry start {}'.", id, id);
        }
        Commands::Migrate { source, targets, id, yes } => {
            let manager = build_manager(config, Access::Modify).await?;
            let id = manager.create_plan(&source, &targets, id).await?;
            let metadata = manager.metadata(&id)?;
            print_assessment(&metadata.assessment);

            let to_format: Vec<&str> = metadata
                .targets
                .iter()
                .filter(|t| !t.has_filesystem(&metadata.target_filesystem))
                .map(|t| t.device.as_str())
                .collect();
            if !to_format.is_empty() && !yes {
                let prompt = format!(
                    "\nWARNING: {} will be formatted as {}. ALL DATA on them will be ERASED.",
                    to_format.join(", "),
                    metadata.target_filesystem
                );
                if !confirm(&prompt)? {
                    println!("Migration cancelled. Plan {} is kept.", id);
                    return Ok(());
                }
            }
            follow(&manager, &id).await?;
        }
        Commands::Start { id } => {
            let manager = build_manager(config, Access::Modify).await?;
            follow(&manager, &id).await?;
        }
        Commands::Rollback { id } => {
            let manager = build_manager(config, Access::Modify).await?;
            manager.rollback(&id).await?;
            println!("Migration {} rolled back.", id);
        }
        Commands::Status { id, json } => {
            let manager = build_manager(config, Access::ReadOnly).await?;
            let progress = manager.progress(&id).await?;
            let health = manager.health(&id).await?;
            if json {
                let value = serde_json::json!({ "progress": progress, "health": health });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Migration {}: {}", id, progress.status);
                println!(
                    "  Files: {}/{} ({:.1}%)",
                    progress.files_migrated, progress.total_files, progress.files_percent
                );
                println!(
                    "  Data: {}/{} ({:.1}%)",
                    format_bytes(progress.bytes_migrated),
                    format_bytes(progress.total_bytes),
                    progress.bytes_percent
                );
                if let Some(eta) = progress.estimated_completion {
                    println!("  Estimated completion: {}", eta.to_rfc3339());
                }
                println!("  Health: {}", health.status);
                for issue in &health.issues {
                    println!("    - {}", issue);
                }
            }
        }
        Commands::Report { id, json } => {
            let manager = build_manager(config, Access::ReadOnly).await?;
            let report = manager.report(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
        }
        Commands::Stats { json } => {
            let manager = build_manager(config, Access::ReadOnly).await?;
            let stats = manager.statistics().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Migrations: {}", stats.total_migrations);
                for (status, count) in &stats.by_status {
                    println!("  {}: {}", status, count);
                }
                println!("Files migrated: {}", stats.total_files_migrated);
                println!("Data migrated: {}", format_bytes(stats.total_bytes_migrated));
                if let Some(secs) = stats.average_duration_seconds {
                    println!("Average duration: {:.1} hours", secs / 3600.0);
                }
                if let Some(rate) = stats.average_success_rate {
                    println!("Average success rate: {:.1}%", rate * 100.0);
                }
            }
        }
        Commands::List => {
            let manager = build_manager(config, Access::ReadOnly).await?;
            let records = manager.list().await;
            if records.is_empty() {
                println!("No migrations.");
            }
            for record in records {
                println!(
                    "{}  {:<12} {} -> {}  {}/{} files",
                    record.migration_id,
                    record.status.to_string(),
                    record.source_device,
                    record.target_devices.join(","),
                    record.files_migrated,
                    record.total_files
                );
            }
        }
        Commands::Cleanup { id, remove_backup } => {
            let manager = build_manager(config, Access::Modify).await?;
            manager.cleanup(&id, remove_backup).await?;
            println!("Migration {} cleaned up.", id);
        }
    }

    Ok(())
}
