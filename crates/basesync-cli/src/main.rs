use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use basesync_core::{Phase, Snapshot, StatusEvent, StatusKind, StatusLog};
use basesync_storage::{AirtableConfig, AirtableTransport, StateStore};
use basesync_sync::{IdentityTransform, SessionState, SyncConfig, SyncEvent, SyncSession};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod tables;

use tables::TableRegistry;

const DEFAULT_TABLES: &str = "tables.yaml";
const DEFAULT_STATE: &str = ".basesync/state.json";
const DEFAULT_OUTPUT: &str = "snapshot.json";
/// Every five minutes; the scheduler expects a leading seconds field.
const DEFAULT_WATCH_CRON: &str = "0 */5 * * * *";

type Session = SyncSession<IdentityTransform>;

#[derive(Debug, Parser)]
#[command(name = "basesync")]
#[command(about = "Incrementally mirror remote tables into a local snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and write the snapshot.
    Sync(SessionArgs),
    /// Run sync cycles on a cron schedule until interrupted.
    Watch {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, default_value = DEFAULT_WATCH_CRON)]
        cron: String,
    },
    /// Print the status log from a state file.
    Log {
        #[arg(long, default_value = DEFAULT_STATE)]
        state: PathBuf,
        /// Print every raw event instead of the collapsed view.
        #[arg(long)]
        raw: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct SessionArgs {
    #[arg(long, default_value = DEFAULT_TABLES)]
    tables: PathBuf,
    #[arg(long, default_value = DEFAULT_STATE)]
    state: PathBuf,
    #[arg(long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,
    /// Discard the stored snapshot and cursor before the first cycle.
    #[arg(long)]
    reset: bool,
}

impl Default for SessionArgs {
    fn default() -> Self {
        Self {
            tables: PathBuf::from(DEFAULT_TABLES),
            state: PathBuf::from(DEFAULT_STATE),
            output: PathBuf::from(DEFAULT_OUTPUT),
            reset: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Sync(SessionArgs::default()))
    {
        Commands::Sync(args) => {
            let mut runner = Runner::open(&args).await?;
            let snapshot = runner.run_once().await?;
            println!(
                "sync complete: tables={} records={} output={}",
                snapshot.len(),
                basesync_core::total_records(&snapshot),
                args.output.display()
            );
        }
        Commands::Watch { session, cron } => watch(&session, &cron).await?,
        Commands::Log { state, raw } => {
            for line in render_log(&state, raw).await? {
                println!("{line}");
            }
        }
    }

    Ok(())
}

/// A session plus the files it reads from and writes to.
struct Runner {
    session: Session,
    state: StateStore,
    output: StateStore,
}

impl Runner {
    async fn open(args: &SessionArgs) -> Result<Self> {
        let registry = TableRegistry::load(&args.tables).await?;
        let transport = AirtableTransport::new(AirtableConfig::from_env()?)?;
        let state = StateStore::new(&args.state);
        let restored: SessionState<Snapshot> = state.load().await?.unwrap_or_default();
        if !restored.log.is_empty() {
            info!(path = %args.state.display(), events = restored.log.len(), "restored session state");
        }

        let session = SyncSession::restore(
            SyncConfig::from_env(),
            registry.resources(),
            Arc::new(transport),
            IdentityTransform,
            restored,
        )
        .context("invalid sync configuration")?;
        if args.reset {
            session.request_reset();
        }

        Ok(Self::new(session, state, StateStore::new(&args.output)))
    }

    fn new(session: Session, state: StateStore, output: StateStore) -> Self {
        Self {
            session,
            state,
            output,
        }
    }

    /// Runs a cycle and persists state whether or not it succeeded.
    async fn run_once(&mut self) -> Result<Snapshot> {
        let outcome = self.session.run_cycle().await;
        self.state
            .save(&self.session.export_state())
            .await
            .context("persisting session state")?;

        let snapshot = outcome?;
        self.output
            .save(&snapshot)
            .await
            .context("writing snapshot")?;
        Ok(snapshot)
    }
}

async fn watch(args: &SessionArgs, cron: &str) -> Result<()> {
    let runner = Runner::open(args).await?;
    let mut events = runner.session.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::Status(event) => info!(uid = event.uid, "{}", describe(&event.status)),
                SyncEvent::Progress(count) => debug!(count, "records fetched"),
            }
        }
    });

    let runner = Arc::new(Mutex::new(runner));
    // Built before the first cycle so a bad expression fails fast.
    let job = watch_job(cron, Arc::clone(&runner))?;
    trigger(&runner).await;

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "watching for changes; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn watch_job(cron: &str, runner: Arc<Mutex<Runner>>) -> Result<Job> {
    Job::new_async(cron, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            trigger(&runner).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))
}

/// Runs one cycle unless another is still in progress. Returns whether it ran.
async fn trigger(runner: &Mutex<Runner>) -> bool {
    let Ok(mut runner) = runner.try_lock() else {
        warn!("previous cycle still running; skipping trigger");
        return false;
    };
    if let Err(err) = runner.run_once().await {
        error!("scheduled cycle failed: {err:#}");
    }
    true
}

#[derive(Debug, Default, Deserialize)]
struct PersistedLog {
    #[serde(default)]
    log: Vec<StatusEvent>,
}

async fn render_log(path: &Path, raw: bool) -> Result<Vec<String>> {
    let persisted: PersistedLog = StateStore::new(path)
        .load()
        .await?
        .with_context(|| format!("no state file at {}", path.display()))?;
    let log = StatusLog::restore(persisted.log);

    let lines: Vec<String> = if raw {
        log.events().map(|event| format_event(event, 1)).collect()
    } else {
        log.collapsed()
            .iter()
            .map(|entry| format_event(&entry.event, entry.repeat_count))
            .collect()
    };
    Ok(lines)
}

fn format_event(event: &StatusEvent, repeat_count: u32) -> String {
    let mut line = format!("{} #{} {}", event.at, event.uid, describe(&event.status));
    if repeat_count > 1 {
        line.push_str(&format!(" (x{repeat_count})"));
    }
    line
}

fn describe(status: &StatusKind) -> String {
    match status {
        StatusKind::Success(counts) => format!(
            "success: {} created, {} updated",
            counts.created_count, counts.updated_count
        ),
        StatusKind::Errored { err } => match err.when {
            Some(Phase::Fetching) => format!("errored while fetching: {}", err.message),
            Some(Phase::Parsing) => format!("errored while parsing: {}", err.message),
            None => format!("errored: {}", err.message),
        },
        StatusKind::RateLimited { resumes_at } => format!("ratelimited until {resumes_at}"),
        other => other.name().to_string(),
    }
}
