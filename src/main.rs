use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repovault::config::LoggingConfig;
use repovault::health::CheckResult;
use repovault::{
    daemon, retention, ArchiveStore, BackupOrchestrator, Config, DriveClient, GitHubClient,
    HealthCheck, RepositoryLister, RunHistory, TriggerSource,
};

#[derive(Parser)]
#[command(name = "repovault")]
#[command(about = "Scheduled GitHub repository backups to Google Drive")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run one backup now
    Run,

    /// List repositories that would be backed up
    List {
        /// Show repository details
        #[arg(long)]
        details: bool,
    },

    /// List archives stored on Google Drive
    Archives,

    /// Delete remote archives older than the retention window
    Sweep {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Share a remote archive with another account
    Share {
        /// Drive file id
        file_id: String,

        /// Email address to share with
        email: String,

        /// Permission role
        #[arg(long, default_value = "reader")]
        role: String,
    },

    /// Manage Google Drive credentials
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Run the scheduler and HTTP control surface
    Serve,

    /// Show past backup runs
    History {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Show per-repository outcomes of one run
        #[arg(long)]
        run: Option<i64>,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Exchange the refresh token for a new access token
    Refresh,

    /// Test GitHub and Google Drive authentication
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_logging(cli.verbose, &LoggingConfig::default())?;
        return cmd_init(cli.config, force);
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting RepoVault v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Run => cmd_run(&config).await,
        Commands::List { details } => cmd_list(details, &config).await,
        Commands::Archives => cmd_archives(&config).await,
        Commands::Sweep { dry_run } => cmd_sweep(dry_run, &config).await,
        Commands::Share {
            file_id,
            email,
            role,
        } => cmd_share(&file_id, &email, &role, &config).await,
        Commands::Auth { auth_command } => cmd_auth(auth_command, &config).await,
        Commands::Serve => daemon::run_service(config).await,
        Commands::History { limit, run } => cmd_history(limit, run, &config),
        Commands::Doctor => cmd_doctor(&config).await,
    }
}

/// Initialize logging: RUST_LOG, else --verbose, else logging.level
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid logging level: {}", level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "full" {
        registry.with(fmt::layer()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    Config::default().save(&path)?;

    println!("✅ RepoVault initialized successfully!");
    println!("   Config: {}", path.display());
    println!("   Next: set GITHUB_TOKEN and the GOOGLE_* credentials, then run 'repovault doctor'");
    Ok(())
}

async fn cmd_run(config: &Config) -> Result<()> {
    let orchestrator = BackupOrchestrator::from_config(config)?;

    println!("🚀 Starting backup...");
    let summary = orchestrator.run(TriggerSource::Manual).await?;

    println!("\n🎉 Backup Complete!");
    println!("   📊 Total repositories: {}", summary.total);
    println!("   ✅ Succeeded: {}", summary.succeeded);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   🗑️  Expired archives deleted: {}", summary.sweep.deleted.len());
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failed > 0 {
        println!("\n🔍 Failed Repositories:");
        for outcome in summary.outcomes.iter().filter(|o| !o.succeeded()) {
            println!(
                "   ❌ {}: {}",
                outcome.repository,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

async fn cmd_list(details: bool, config: &Config) -> Result<()> {
    let github = GitHubClient::new(config)?;
    let repositories = github.list_repositories().await?;

    println!("Repositories ({}): ", repositories.len());
    for repo in repositories {
        if details {
            println!("📁 {}", repo.full_name());
            println!("   🔒 Private: {}", repo.private);
            println!("   🌿 Branch: {}", repo.branch());
            if let Some(updated) = repo.updated_at {
                println!("   🕒 Updated: {}", updated.format("%Y-%m-%d"));
            }
            println!();
        } else {
            println!("  📁 {}", repo.full_name());
        }
    }

    Ok(())
}

async fn cmd_archives(config: &Config) -> Result<()> {
    let drive = DriveClient::from_config(config)?;
    let archives = drive.list_archives().await?;

    println!("Archives ({}): ", archives.len());
    for archive in archives {
        let modified = archive
            .last_modified()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("  📦 {}  {}  ({})", archive.name, modified, archive.id);
    }

    Ok(())
}

async fn cmd_sweep(dry_run: bool, config: &Config) -> Result<()> {
    let drive = DriveClient::from_config(config)?;
    let window = config.retention_window()?;

    let report = retention::sweep(&drive, window, Utc::now(), dry_run).await?;

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    for name in &report.deleted {
        println!("   🗑️  {} {}", verb, name);
    }
    for (name, error) in &report.errors {
        println!("   ❌ {}: {}", name, error);
    }
    println!(
        "\n📈 {} archives: {} expired, {} kept, {} errors",
        report.total(),
        report.deleted.len(),
        report.kept,
        report.errors.len()
    );

    Ok(())
}

async fn cmd_share(file_id: &str, email: &str, role: &str, config: &Config) -> Result<()> {
    let drive = DriveClient::from_config(config)?;
    let permission = drive.grant_permission(file_id, email, role).await?;

    println!("✅ Shared {} with {} as {} (permission {})", file_id, email, role, permission);
    Ok(())
}

async fn cmd_auth(auth_command: AuthCommands, config: &Config) -> Result<()> {
    match auth_command {
        AuthCommands::Refresh => {
            let drive = DriveClient::from_config(config)?;
            drive.broker().refresh().await?;
            println!("✅ Access token refreshed");
            println!("   Saved to: {}", drive.broker().token_file().display());
        }
        AuthCommands::Test => {
            match GitHubClient::new(config) {
                Ok(client) => match client.whoami().await {
                    Ok(login) => println!("✅ GitHub authentication successful (Username: {})", login),
                    Err(e) => println!("❌ GitHub authentication failed: {:#}", e),
                },
                Err(e) => println!("❌ GitHub authentication failed: {:#}", e),
            }

            let drive = DriveClient::from_config(config)?;
            match drive.verify_access().await {
                Ok(()) => println!("✅ Google Drive access verified"),
                Err(e) => println!("❌ Google Drive access failed: {:#}", e),
            }
        }
    }

    Ok(())
}

fn cmd_history(limit: usize, run: Option<i64>, config: &Config) -> Result<()> {
    let history = RunHistory::open_at(Path::new(&config.history.database))?;

    if let Some(run_id) = run {
        let record = history
            .get_run(run_id)?
            .with_context(|| format!("Run #{} not found", run_id))?;
        println!(
            "Run #{} ({}, {}) started {}",
            record.id,
            record.trigger,
            record.phase,
            record.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        for event in history.outcomes_for_run(run_id)? {
            match &event.error {
                None => println!(
                    "   ✅ {} via {}",
                    event.repository,
                    event.strategy.as_deref().unwrap_or("unknown")
                ),
                Some(error) => println!("   ❌ {}: {}", event.repository, error),
            }
        }
        return Ok(());
    }

    let runs = history.recent_runs(limit)?;
    if runs.is_empty() {
        println!("No backup runs recorded yet");
        return Ok(());
    }

    for record in runs {
        let icon = match record.phase.as_str() {
            "completed" if record.failed == 0 => "✅",
            "completed" => "⚠️ ",
            "failed" => "❌",
            _ => "⏳",
        };
        println!(
            "{} #{} {} [{}] {} ok, {} failed{}",
            icon,
            record.id,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.trigger,
            record.processed,
            record.failed,
            record
                .error
                .as_deref()
                .map(|e| format!(" - {}", e))
                .unwrap_or_default()
        );
    }

    Ok(())
}

async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 RepoVault System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
