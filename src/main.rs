use std::{fmt, io::stdout, process::ExitCode, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use flexi_logger::Logger;
#[allow(unused_imports)]
use log::{error, info, warn};
use nix::{sys::signal::Signal, unistd::Pid};
use tokio_util::sync::CancellationToken;

mod base_branch;
mod comments;
mod config;
mod developer;
mod errors;
mod git;
mod lock;
mod model;
mod planner;
mod pool;
mod process;
mod prompt;
mod providers;
mod repo_cache;
mod router;
mod status;
mod store;
mod util;
mod worker;
mod workspace;

use crate::{
    base_branch::BaseBranchResolver,
    config::Config,
    git::GitService,
    lock::GitOpLock,
    planner::Planner,
    pool::WorkerPool,
    providers::{create_board_service, create_pull_request_service},
    repo_cache::RepositoryCache,
    router::TaskRouter,
    status::StatusReport,
    store::{JsonStateStore, StateStore},
    util::{DisplayablePathBuf, ErrGroup},
    workspace::WorkspaceManager,
};

#[derive(Parser)]
#[command(version, about = "Runs an AI developer team against a project board")]
struct Args {
    /// Path to the TOML config. Defaults to the platform config directory.
    #[arg(long, short)]
    config: Option<DisplayablePathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the reconciliation loop and worker pool.
    Run,
    /// Print pool and planner state from the persisted snapshots.
    Status,
    /// Run exactly one reconciliation pass, then exit.
    ForceSync,
    /// Ask a running `run` process to shut down.
    Shutdown,
    /// Print the JSON schema of the config file.
    DumpSchema,
}

const PID_FILE: &str = "foreman.pid";

// Marker context distinguishing "died while running" (exit code 2) from
// "never got going" (exit code 1).
#[derive(Debug)]
struct RuntimeFatal;

impl fmt::Display for RuntimeFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime failure")
    }
}

// The full component stack behind `run` and `force-sync`.
struct Orchestrator {
    config: Config,
    store: Arc<dyn StateStore>,
    lock: Arc<GitOpLock>,
    pool: Arc<WorkerPool>,
    planner: Arc<Planner>,
}

impl Orchestrator {
    async fn build(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn StateStore> =
            Arc::new(JsonStateStore::open(&config.data_dir).context("opening state store")?);
        let git = GitService::new(
            &config.git_binary,
            config.remote_base.clone(),
            std::time::Duration::from_millis(config.git_operation_timeout_ms),
        );
        let lock = GitOpLock::new(config.lock_timeout());
        let repo_cache = Arc::new(RepositoryCache::new(
            git.clone(),
            lock.clone(),
            &config.workspace_root,
            config.repository_cache_timeout(),
        ));
        let workspace_manager = Arc::new(WorkspaceManager::new(
            git,
            lock.clone(),
            repo_cache,
            store.clone(),
            &config.workspace_root,
        ));
        let board = create_board_service(config.provider, &config.data_dir)
            .context("constructing board service")?;
        let prs = create_pull_request_service(config.provider)
            .context("constructing pull request service")?;
        let base_branch = Arc::new(BaseBranchResolver::new(prs.clone()));

        let pool = WorkerPool::new(
            config.clone(),
            store.clone(),
            workspace_manager.clone(),
            base_branch,
        );
        pool.initialize_pool()
            .await
            .context("initializing worker pool")?;

        let router = TaskRouter::new(pool.clone(), workspace_manager.clone(), store.clone());
        let planner = Arc::new(
            Planner::new(
                config.clone(),
                board,
                prs,
                router,
                store.clone(),
                workspace_manager,
            )
            .await,
        );
        Ok(Self {
            config,
            store,
            lock,
            pool,
            planner,
        })
    }

    async fn run(self) -> anyhow::Result<()> {
        let pid_path = self.config.data_dir.join(PID_FILE);
        tokio::fs::write(&pid_path, std::process::id().to_string())
            .await
            .with_context(|| format!("writing pid file {:?}", pid_path))?;

        let ct = CancellationToken::new();
        let mut group = ErrGroup::new(ct.clone());
        group.spawn(self.planner.clone().run(ct.clone()));
        group.spawn(self.lock.clone().run_sweeper(ct.clone()));
        group.spawn(self.pool.clone().run_sweeper(ct.clone()));
        {
            // Either termination signal cancels everything. The planner
            // finishes its current tick first since tick() holds the runtime
            // mutex until it's done.
            let ct = ct.clone();
            group.spawn(async move {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
                let mut sigint =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
                tokio::select! {
                    _ = sigterm.recv() => info!("got SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("got SIGINT, shutting down"),
                    _ = ct.cancelled() => (),
                }
                ct.cancel();
                Ok(())
            });
        }

        let result = group.wait().await;
        // In-flight developer subprocesses get to finish naturally on a clean
        // shutdown; a crash takes them down with us so they can't squat on
        // the workspaces.
        self.pool.shutdown();
        self.planner.shutdown();
        if result.is_err() {
            self.pool.cleanup().await;
        }
        for held in self.lock.held_locks() {
            warn!(
                "git lock still held at shutdown: {} ({}, {:?})",
                held.repo_id, held.operation, held.held_for
            );
        }
        tokio::fs::remove_file(&pid_path).await.ok();
        result.map_err(|e| e.context(RuntimeFatal))
    }
}

async fn shutdown_running_instance(config: &Config) -> anyhow::Result<()> {
    let pid_path = config.data_dir.join(PID_FILE);
    let content = tokio::fs::read_to_string(&pid_path)
        .await
        .with_context(|| format!("reading pid file {:?} (is `run` active?)", pid_path))?;
    let pid: i32 = content.trim().parse().context("parsing pid file")?;
    nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("signalling pid {}", pid))?;
    println!("sent SIGTERM to {}", pid);
    Ok(())
}

async fn run_command(args: Args) -> anyhow::Result<()> {
    if let Command::DumpSchema = args.command {
        // No config needed for this one.
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config_path = args.config.as_ref().map(|p| p.0.clone());
    let config = Config::load(config_path.as_ref()).context("loading configuration")?;

    match args.command {
        Command::Run => {
            let orchestrator = Orchestrator::build(config).await?;
            orchestrator.run().await
        }
        Command::ForceSync => {
            let orchestrator = Orchestrator::build(config).await?;
            orchestrator.planner.force_sync().await;
            let report = StatusReport::gather(orchestrator.store.as_ref()).await;
            report.render(&mut stdout())?;
            Ok(())
        }
        Command::Status => {
            let store = JsonStateStore::open(&config.data_dir).context("opening state store")?;
            let report = StatusReport::gather(&store).await;
            report.render(&mut stdout())?;
            Ok(())
        }
        Command::Shutdown => shutdown_running_instance(&config).await,
        Command::DumpSchema => unreachable!("handled above"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _logger = match Logger::try_with_str(&args.log_level).and_then(|l| l.start()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("couldn't initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run_command(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if e.is::<RuntimeFatal>() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
