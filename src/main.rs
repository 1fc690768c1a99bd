use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taskmate::application::bootstrap::{BootstrapResult, bootstrap_workspace};
use taskmate::application::calendar_sync::CalendarSyncService;
use taskmate::application::dispatch::{Scheduler, SharedCalendarSync};
use taskmate::infrastructure::calendar_transport::{HttpCalendarTransport, RemoteCalendarTransport};
use taskmate::infrastructure::logging::init_logging;
use taskmate::infrastructure::notifier::{LogNotifier, Notifier, WebhookNotifier};
use taskmate::infrastructure::rule_store::RuleStore;
use taskmate::infrastructure::sqlite_rule_store::SqliteRuleStore;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "taskmate")]
#[command(about = "Reminder scheduler with remote calendar reconciliation")]
struct Cli {
    /// Workspace holding config/, state/ and logs/
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch loop until interrupted
    Run,
    /// Pull from and push to the remote calendar once
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let workspace = bootstrap_workspace(&cli.root)
        .with_context(|| format!("failed to prepare workspace {}", cli.root.display()))?;
    init_logging(Some(&workspace.logs_dir), cli.verbose).context("failed to set up logging")?;
    info!(
        root = %workspace.workspace_root.display(),
        database = %workspace.database_path.display(),
        "workspace ready"
    );

    let store: Arc<dyn RuleStore> = Arc::new(SqliteRuleStore::new(&workspace.database_path));
    match cli.command {
        Commands::Run => run(&workspace, store).await,
        Commands::Sync => sync_once(&workspace, store).await,
    }
}

fn calendar_sync(
    workspace: &BootstrapResult,
    store: Arc<dyn RuleStore>,
) -> Result<Option<SharedCalendarSync>> {
    let app = &workspace.config.app;
    let calendar = &workspace.config.calendar;
    if !calendar.enabled {
        return Ok(None);
    }

    let settings = app.scheduler_config(calendar)?;
    let token = calendar.access_token.as_deref().unwrap_or_default();
    let transport: Arc<dyn RemoteCalendarTransport> = Arc::new(
        HttpCalendarTransport::new(&calendar.base_url, token)?.with_time_zone(&app.timezone),
    );
    Ok(Some(
        CalendarSyncService::new(
            transport,
            store,
            calendar.path.clone(),
            settings.timezone,
            calendar.sync_window_months,
        )
        .with_call_timeout(settings.calendar_timeout),
    ))
}

async fn run(workspace: &BootstrapResult, store: Arc<dyn RuleStore>) -> Result<()> {
    let app = &workspace.config.app;
    let settings = app.scheduler_config(&workspace.config.calendar)?;

    let notifier: Arc<dyn Notifier> = match app.notifier.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => {
            warn!("no webhook configured; notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let mut scheduler = Scheduler::new(Arc::clone(&store), notifier, settings);
    if let Some(sync) = calendar_sync(workspace, store)? {
        let recipient = workspace.config.calendar.report_recipient.clone();
        scheduler = scheduler.with_calendar_sync(Arc::new(sync), recipient);
    }

    let handle = scheduler.start();
    println!("taskmate running; press Ctrl-C to stop");
    shutdown_signal().await?;
    info!("shutdown requested");
    handle.stop().await?;
    Ok(())
}

async fn sync_once(workspace: &BootstrapResult, store: Arc<dyn RuleStore>) -> Result<()> {
    let Some(sync) = calendar_sync(workspace, store)? else {
        bail!("calendar sync is disabled in config/calendar.json");
    };

    let pulled = sync.sync_from_remote().await.context("calendar pull failed")?;
    println!("{}", pulled.summary());
    for error in &pulled.errors {
        println!("  {error}");
    }

    let pushed = sync.sync_to_remote().await.context("calendar push failed")?;
    println!("{}", pushed.summary());
    for error in &pushed.errors {
        println!("  {error}");
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for Ctrl-C")?;
        }
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")
}
