use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures::future::join_all;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    base_branch::BaseBranchResolver,
    config::Config,
    developer::{create_developer, Developer},
    errors::{OrchestratorError, OrchestratorResult},
    model::{TaskId, WorkerId, WorkerStatus, WorkerTask},
    store::StateStore,
    util::ResultExt as _,
    worker::{ExecutionOutcome, Worker},
    workspace::WorkspaceManager,
};

// How each worker gets its developer. Injected so tests can hand every worker
// the same scripted mock; the production factory builds a fresh instance per
// worker so a hung subprocess only ever poisons its own worker.
pub type DeveloperFactory =
    Box<dyn Fn(&Config) -> anyhow::Result<Arc<dyn Developer>> + Send + Sync>;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

// Give a stopped worker's task this many recovery rounds before writing the
// task off and freeing the worker.
const MAX_RECOVERY_ATTEMPTS: u32 = 2;

// Bounded set of workers plus the machinery to restore them from a snapshot,
// hand them out, run their assignments to completion, and reap the idle and
// the stuck. All bookkeeping sits behind one mutex; executions themselves run
// on spawned tasks, one per busy worker.
pub struct WorkerPool {
    config: Config,
    store: Arc<dyn StateStore>,
    workspace_manager: Arc<WorkspaceManager>,
    base_branch: Arc<BaseBranchResolver>,
    developer_factory: DeveloperFactory,
    workers: Mutex<Vec<Arc<Worker>>>,
    // Outcomes of finished executions, keyed by task, consumed by the router
    // when the planner next asks about the task.
    finished: Mutex<HashMap<TaskId, ExecutionOutcome>>,
    next_worker_seq: AtomicU64,
    accepting: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        workspace_manager: Arc<WorkspaceManager>,
        base_branch: Arc<BaseBranchResolver>,
    ) -> Arc<Self> {
        Self::with_developer_factory(
            config,
            store,
            workspace_manager,
            base_branch,
            Box::new(create_developer),
        )
    }

    pub fn with_developer_factory(
        config: Config,
        store: Arc<dyn StateStore>,
        workspace_manager: Arc<WorkspaceManager>,
        base_branch: Arc<BaseBranchResolver>,
        developer_factory: DeveloperFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            workspace_manager,
            base_branch,
            developer_factory,
            workers: Mutex::new(Vec::new()),
            finished: Mutex::new(HashMap::new()),
            next_worker_seq: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        })
    }

    fn build_worker(&self, id: WorkerId) -> anyhow::Result<Arc<Worker>> {
        let developer = (self.developer_factory)(&self.config)?;
        developer.set_timeout(self.config.developer_timeout());
        Ok(Arc::new(Worker::new(
            id.clone(),
            developer,
            self.workspace_manager.clone(),
            self.base_branch.clone(),
            self.store.clone(),
            self.config.workspace_root.join("workers").join(id.as_str()),
        )))
    }

    fn fresh_worker_id(&self) -> WorkerId {
        WorkerId::new(format!(
            "worker-{}",
            self.next_worker_seq.fetch_add(1, Ordering::SeqCst)
        ))
    }

    // Restore persisted workers, dropping any record we can't bring back to
    // life, then top up to min_workers. Never exceeds max_workers even if the
    // snapshot somehow does.
    pub async fn initialize_pool(&self) -> anyhow::Result<()> {
        let records = self.store.list_workers().await;
        let mut restored = Vec::new();
        let mut max_seq = 0u64;
        for record in records {
            if restored.len() >= self.config.max_workers {
                warn!(
                    "snapshot holds more workers than max_workers, dropping {}",
                    record.id
                );
                self.store.remove_worker(&record.id).await?;
                continue;
            }
            // Track the numbering so fresh workers don't collide with
            // restored ones.
            if let Some(seq) = record
                .id
                .as_str()
                .strip_prefix("worker-")
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_seq = max_seq.max(seq);
            }
            match (self.developer_factory)(&self.config) {
                Ok(developer) => {
                    developer.set_timeout(self.config.developer_timeout());
                    let worker = Arc::new(Worker::from_record(
                        record,
                        developer,
                        self.workspace_manager.clone(),
                        self.base_branch.clone(),
                        self.store.clone(),
                    ));
                    info!(
                        "restored {} ({}, task {:?})",
                        worker.id(),
                        worker.status(),
                        worker.current_task_id()
                    );
                    restored.push(worker);
                }
                Err(e) => {
                    // A record we can't restore is useless at best and a
                    // zombie at worst; drop it from the snapshot.
                    warn!("couldn't restore worker {}: {:#}, removing", record.id, e);
                    self.store.remove_worker(&record.id).await?;
                }
            }
        }
        self.next_worker_seq.store(max_seq + 1, Ordering::SeqCst);

        while restored.len() < self.config.min_workers {
            let worker = self.build_worker(self.fresh_worker_id())?;
            self.store.save_worker(worker.snapshot()).await?;
            restored.push(worker);
        }
        info!("pool initialized with {} workers", restored.len());
        *self.workers.lock() = restored;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn workers_snapshot(&self) -> Vec<Arc<Worker>> {
        self.workers.lock().clone()
    }

    // Any IDLE worker, lazily growing the pool if everyone's busy and there's
    // headroom. None means the pool is saturated; callers surface that as
    // NoAvailableWorker and the planner retries next tick.
    pub async fn get_available_worker(&self) -> anyhow::Result<Option<Arc<Worker>>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let new_worker = {
            let workers = self.workers.lock();
            if let Some(worker) = workers
                .iter()
                .find(|w| w.status() == WorkerStatus::Idle)
            {
                return Ok(Some(worker.clone()));
            }
            if workers.len() >= self.config.max_workers {
                return Ok(None);
            }
            // Build outside the lock? Construction is cheap and infallible
            // except for config problems, keep it simple and do it here.
            drop(workers);
            self.build_worker(self.fresh_worker_id())?
        };
        self.store.save_worker(new_worker.snapshot()).await?;
        let mut workers = self.workers.lock();
        // Racing creators could both have seen headroom; re-check rather than
        // blow the cap.
        if workers.len() >= self.config.max_workers {
            drop(workers);
            self.store.remove_worker(new_worker.id()).await?;
            return Ok(self.workers.lock().iter().find(|w| w.status() == WorkerStatus::Idle).cloned());
        }
        workers.push(new_worker.clone());
        info!("created {} (pool now {})", new_worker.id(), workers.len());
        Ok(Some(new_worker))
    }

    pub fn get_worker_by_task_id(&self, task_id: &TaskId) -> Option<Arc<Worker>> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.current_task_id().as_ref() == Some(task_id))
            .cloned()
    }

    pub fn get_worker(&self, worker_id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.id() == worker_id)
            .cloned()
    }

    // Assign and immediately start execution. Acceptance rules and rollback
    // live in Worker::assign_task; this adds the shutdown gate and the
    // fire-and-forget execution task.
    pub async fn assign_worker_task(
        self: &Arc<Self>,
        worker_id: &WorkerId,
        task: WorkerTask,
    ) -> OrchestratorResult<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::NoAvailableWorker);
        }
        let worker = self
            .get_worker(worker_id)
            .ok_or_else(|| OrchestratorError::NoWorkerForTask {
                task_id: task.task_id.to_string(),
            })?;
        let was_waiting = worker.status() == WorkerStatus::Waiting;
        worker.assign_task(task).await?;
        // A feedback refresh of an already-WAITING worker must not spawn a
        // second execution; the pending one will pick up the replaced task.
        if !was_waiting {
            self.spawn_execution(worker);
        }
        Ok(())
    }

    fn spawn_execution(self: &Arc<Self>, worker: Arc<Worker>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let outcome = worker.execute().await;
            debug!(
                "{} finished task {} ({})",
                outcome.worker_id,
                outcome.task_id,
                if outcome.output.is_ok() { "ok" } else { "failed" }
            );
            pool.finished.lock().insert(outcome.task_id.clone(), outcome);
        });
    }

    // Consume the recorded outcome for a task, if its execution has finished.
    pub fn take_finished(&self, task_id: &TaskId) -> Option<ExecutionOutcome> {
        self.finished.lock().remove(task_id)
    }

    pub async fn release_worker(&self, worker_id: &WorkerId) -> OrchestratorResult<()> {
        let worker = self
            .get_worker(worker_id)
            .ok_or_else(|| OrchestratorError::NoWorkerForTask {
                task_id: "-".to_owned(),
            })?;
        worker.release().await;
        Ok(())
    }

    // STOPPED workers whose cool-off has elapsed get their task re-dispatched
    // (STOPPED -> WAITING -> execute). A task that keeps stopping its worker
    // gets dropped after MAX_RECOVERY_ATTEMPTS; the failure is left in the
    // finished map so the planner sees an ERROR on its next status check.
    pub async fn recover_stopped_workers(self: &Arc<Self>) {
        let now = Utc::now();
        let recovery_timeout =
            chrono::Duration::from_std(self.config.worker_recovery_timeout()).unwrap();
        let candidates: Vec<Arc<Worker>> = self
            .workers
            .lock()
            .iter()
            .filter(|w| {
                w.status() == WorkerStatus::Stopped
                    && now.signed_duration_since(w.last_active_at()) > recovery_timeout
            })
            .cloned()
            .collect();

        for worker in candidates {
            let Some(task_id) = worker.current_task_id() else {
                worker.release().await;
                continue;
            };
            if worker.recovery_attempts() >= MAX_RECOVERY_ATTEMPTS {
                let reason = format!(
                    "giving up on task {} after {} recovery attempts: {}",
                    task_id,
                    worker.recovery_attempts(),
                    worker.last_error().unwrap_or_else(|| "unknown error".to_owned()),
                );
                error!("{}: {}", worker.id(), reason);
                self.finished.lock().insert(
                    task_id.clone(),
                    ExecutionOutcome {
                        task_id,
                        worker_id: worker.id().clone(),
                        output: Err(reason),
                    },
                );
                worker.release().await;
                continue;
            }
            info!("recovering {} (task {})", worker.id(), task_id);
            match worker.recover().await {
                Ok(()) => self.spawn_execution(worker),
                Err(e) => warn!("couldn't recover {}: {}", worker.id(), e),
            }
        }
    }

    // Shrink the pool by destroying workers that have sat IDLE past the
    // timeout, never going below min_persistent_workers.
    pub async fn evict_idle_workers(&self) {
        let idle_timeout = chrono::Duration::from_std(self.config.idle_timeout()).unwrap();
        let now = Utc::now();
        let evictees: Vec<Arc<Worker>> = {
            let workers = self.workers.lock();
            let mut keep = workers.len();
            let mut evictees = Vec::new();
            for worker in workers.iter() {
                if keep <= self.config.min_persistent_workers {
                    break;
                }
                if worker.status() == WorkerStatus::Idle
                    && now.signed_duration_since(worker.last_active_at()) > idle_timeout
                {
                    evictees.push(worker.clone());
                    keep -= 1;
                }
            }
            evictees
        };
        for worker in evictees {
            // Re-check and remove under the pool lock so a worker that
            // get_available_worker is about to hand out can't be evicted
            // between the scan and here.
            {
                let mut workers = self.workers.lock();
                if worker.status() != WorkerStatus::Idle {
                    continue;
                }
                workers.retain(|w| w.id() != worker.id());
            }
            info!("evicting idle {}", worker.id());
            self.store
                .remove_worker(worker.id())
                .await
                .or_log_error("removing evicted worker from store");
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, ct: CancellationToken) -> anyhow::Result<()> {
        loop {
            select! {
                _ = ct.cancelled() => return Ok(()),
                _ = sleep(SWEEP_INTERVAL) => {
                    self.recover_stopped_workers().await;
                    self.evict_idle_workers().await;
                }
            }
        }
    }

    // Stop handing out workers and accepting assignments. In-flight developer
    // subprocesses are left to finish naturally; cleanup() is the forceful
    // variant.
    pub fn shutdown(&self) {
        info!("pool shutting down, refusing new assignments");
        self.accepting.store(false, Ordering::SeqCst);
    }

    // Forcefully terminate whatever the developers are running. The kills
    // each involve a SIGTERM grace period, so run them concurrently rather
    // than serialising the waits.
    pub async fn cleanup(&self) {
        self.shutdown();
        let workers = self.workers_snapshot();
        join_all(workers.iter().map(|w| w.cleanup_developer())).await;
    }
}
