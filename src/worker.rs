use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    base_branch::BaseBranchResolver,
    developer::Developer,
    errors::{OrchestratorError, OrchestratorResult},
    model::{
        DeveloperOutput, TaskId, WorkerAction, WorkerId, WorkerRecord, WorkerStatus, WorkerTask,
    },
    prompt::generate_prompt,
    store::StateStore,
    util::ResultExt as _,
    workspace::WorkspaceManager,
};

// The mutable heart of a worker, always accessed under the mutex. Transitions
// are check-and-set in one critical section so concurrent assignment attempts
// can't both succeed.
#[derive(Debug, Clone)]
struct WorkerCore {
    status: WorkerStatus,
    current_task: Option<WorkerTask>,
    last_active_at: DateTime<Utc>,
    recovery_attempts: u32,
    last_error: Option<String>,
}

// What one execution produced, handed back to the pool for the router to
// report on.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub output: Result<DeveloperOutput, String>,
}

pub struct Worker {
    id: WorkerId,
    developer: Arc<dyn Developer>,
    workspace_manager: Arc<WorkspaceManager>,
    base_branch: Arc<BaseBranchResolver>,
    store: Arc<dyn StateStore>,
    workspace_dir: PathBuf,
    created_at: DateTime<Utc>,
    core: Mutex<WorkerCore>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        developer: Arc<dyn Developer>,
        workspace_manager: Arc<WorkspaceManager>,
        base_branch: Arc<BaseBranchResolver>,
        store: Arc<dyn StateStore>,
        workspace_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            developer,
            workspace_manager,
            base_branch,
            store,
            workspace_dir,
            created_at: Utc::now(),
            core: Mutex::new(WorkerCore {
                status: WorkerStatus::Idle,
                current_task: None,
                last_active_at: Utc::now(),
                recovery_attempts: 0,
                last_error: None,
            }),
        }
    }

    // Rebuild from a persisted record. Any restored in-flight work lands in
    // STOPPED: the subprocess is gone, so the honest state is "was doing
    // something, isn't anymore", and the recovery sweeper takes it from
    // there.
    pub fn from_record(
        record: WorkerRecord,
        developer: Arc<dyn Developer>,
        workspace_manager: Arc<WorkspaceManager>,
        base_branch: Arc<BaseBranchResolver>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let status = if record.current_task.is_some() {
            WorkerStatus::Stopped
        } else {
            WorkerStatus::Idle
        };
        Self {
            id: record.id,
            developer,
            workspace_manager,
            base_branch,
            store,
            workspace_dir: record.workspace_dir,
            created_at: record.created_at,
            core: Mutex::new(WorkerCore {
                status,
                current_task: record.current_task,
                last_active_at: Utc::now(),
                recovery_attempts: record.recovery_attempts,
                last_error: None,
            }),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.core.lock().status
    }

    pub fn current_task(&self) -> Option<WorkerTask> {
        self.core.lock().current_task.clone()
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        self.core.lock().current_task.as_ref().map(|t| t.task_id.clone())
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.core.lock().last_active_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.core.lock().last_error.clone()
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.core.lock().recovery_attempts
    }

    // Forcefully terminate anything this worker's developer has running.
    pub async fn cleanup_developer(&self) {
        self.developer.cleanup().await;
    }

    pub fn snapshot(&self) -> WorkerRecord {
        let core = self.core.lock();
        WorkerRecord {
            id: self.id.clone(),
            status: core.status,
            current_task: core.current_task.clone(),
            workspace_dir: self.workspace_dir.clone(),
            developer_type: self.developer.developer_type(),
            created_at: self.created_at,
            last_active_at: core.last_active_at,
            recovery_attempts: core.recovery_attempts,
        }
    }

    // Acceptance rules: from IDLE, anything; from WAITING, only a feedback
    // refresh for the task already held. Everything else is WorkerBusy. The
    // core mutation and the persistence are atomic from the caller's point
    // of view: if persisting fails the in-memory state is rolled back.
    pub async fn assign_task(&self, task: WorkerTask) -> OrchestratorResult<()> {
        let previous = {
            let mut core = self.core.lock();
            let acceptable = match (core.status, &core.current_task) {
                (WorkerStatus::Idle, _) => true,
                (WorkerStatus::Waiting, Some(current)) => {
                    task.action == WorkerAction::ProcessFeedback
                        && current.task_id == task.task_id
                }
                _ => false,
            };
            if !acceptable {
                return Err(OrchestratorError::WorkerBusy {
                    worker_id: self.id.to_string(),
                });
            }
            let previous = core.clone();
            core.status = WorkerStatus::Waiting;
            core.current_task = Some(task);
            core.last_active_at = Utc::now();
            previous
        };

        if let Err(e) = self.persist().await {
            let mut core = self.core.lock();
            *core = previous;
            return Err(OrchestratorError::Provider(
                e.context("persisting task assignment"),
            ));
        }
        Ok(())
    }

    // Force back to IDLE, dropping whatever was held. Used by the router when
    // a task's board item disappeared and by explicit release.
    pub async fn release(&self) {
        {
            let mut core = self.core.lock();
            core.status = WorkerStatus::Idle;
            core.current_task = None;
            core.last_error = None;
            core.last_active_at = Utc::now();
        }
        self.persist().await.or_log_error("persisting worker release");
    }

    // STOPPED -> WAITING with the same task, re-shaped for resumption. The
    // caller (the pool's recovery sweeper) owns the decision of *when*.
    pub async fn recover(&self) -> OrchestratorResult<()> {
        {
            let mut core = self.core.lock();
            if core.status != WorkerStatus::Stopped {
                return Err(OrchestratorError::WorkerBusy {
                    worker_id: self.id.to_string(),
                });
            }
            let Some(task) = core.current_task.take() else {
                // Stopped with no task: nothing to resume, just become useful
                // again.
                core.status = WorkerStatus::Idle;
                core.last_active_at = Utc::now();
                return Ok(());
            };
            // A brand-new task that died gets resumed, not restarted: the
            // workspace (and possibly pushed commits) may already exist.
            let action = match task.action {
                WorkerAction::StartNewTask => WorkerAction::ResumeTask,
                other => other,
            };
            core.current_task = Some(WorkerTask {
                action,
                assigned_at: Utc::now(),
                ..task
            });
            core.status = WorkerStatus::Waiting;
            core.recovery_attempts += 1;
            core.last_active_at = Utc::now();
        }
        self.persist().await.or_log_error("persisting worker recovery");
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        self.store.save_worker(self.snapshot()).await
    }

    // The whole WORKING phase: prepare workspace, build prompt, run the
    // developer, classify the result. Success lands back in IDLE; any
    // failure lands in STOPPED with the task retained for recovery.
    pub async fn execute(&self) -> ExecutionOutcome {
        let task = {
            let mut core = self.core.lock();
            match (core.status, core.current_task.clone()) {
                (WorkerStatus::Waiting, Some(task)) => {
                    core.status = WorkerStatus::Working;
                    core.last_active_at = Utc::now();
                    task
                }
                (status, _) => {
                    // Don't touch state; this is a caller bug, not a worker
                    // failure.
                    error!("{}: execute() called in {:?}", self.id, status);
                    return ExecutionOutcome {
                        task_id: TaskId::new("unknown"),
                        worker_id: self.id.clone(),
                        output: Err(format!("worker not ready to execute (status {status})")),
                    };
                }
            }
        };
        self.persist().await.or_log_error("persisting WORKING transition");

        info!(
            "{}: executing {:?} for task {} in {}",
            self.id, task.action, task.task_id, task.repository_id
        );
        match self.run_task(&task).await {
            Ok(output) if output.result.success => {
                {
                    let mut core = self.core.lock();
                    core.status = WorkerStatus::Idle;
                    core.current_task = None;
                    core.last_error = None;
                    core.recovery_attempts = 0;
                    core.last_active_at = Utc::now();
                }
                self.persist().await.or_log_error("persisting task completion");
                info!(
                    "{}: task {} completed (pr: {:?})",
                    self.id, task.task_id, output.result.pr_link
                );
                ExecutionOutcome {
                    task_id: task.task_id,
                    worker_id: self.id.clone(),
                    output: Ok(output),
                }
            }
            Ok(output) => {
                let reason = output
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| "developer reported failure".to_owned());
                self.stop_with_error(&reason).await;
                ExecutionOutcome {
                    task_id: task.task_id,
                    worker_id: self.id.clone(),
                    output: Err(reason),
                }
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                self.stop_with_error(&reason).await;
                ExecutionOutcome {
                    task_id: task.task_id,
                    worker_id: self.id.clone(),
                    output: Err(reason),
                }
            }
        }
    }

    async fn stop_with_error(&self, reason: &str) {
        warn!("{}: stopping: {}", self.id, reason);
        {
            let mut core = self.core.lock();
            core.status = WorkerStatus::Stopped;
            core.last_error = Some(reason.to_owned());
            core.last_active_at = Utc::now();
            // current_task deliberately retained for recovery.
        }
        self.persist().await.or_log_error("persisting STOPPED transition");
    }

    async fn run_task(&self, task: &WorkerTask) -> anyhow::Result<DeveloperOutput> {
        // Phase 1: workspace. Reuse a valid worktree (reassignment case),
        // build it otherwise.
        let info = self
            .workspace_manager
            .create_workspace(&task.task_id, &task.repository_id)
            .await
            .map_err(|e| OrchestratorError::WorkspaceSetup {
                task_id: task.task_id.to_string(),
                reason: format!("{:#}", e),
            })?;
        if !self.workspace_manager.is_worktree_valid(&info).await {
            let base = self
                .base_branch
                .resolve(&task.repository_id, &task.board_item)
                .await;
            self.workspace_manager
                .setup_worktree(&info, Some(&base))
                .await
                .map_err(|e| OrchestratorError::WorkspaceSetup {
                    task_id: task.task_id.to_string(),
                    reason: format!("{:#}", e),
                })?;
        }

        // Phase 2: prompt.
        let prompt = generate_prompt(task, &info.workspace_dir)
            .await
            .context("generating prompt")?;

        // Phases 3 and 4: the developer runs and its transcript comes back
        // parsed. Timeout (including process-group kill) is handled inside
        // the developer.
        self.developer
            .execute_prompt(&prompt, &info.workspace_dir)
            .await
    }
}


#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::test_utils::WorkerFixture;
    use super::*;
    use crate::developer::MockBehavior;

    #[tokio::test]
    async fn test_assign_from_idle_and_busy_rejection() {
        let f = WorkerFixture::new().await;
        let worker = f.worker("worker-1");
        assert_that!(worker.status(), eq(WorkerStatus::Idle));

        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();
        assert_that!(worker.status(), eq(WorkerStatus::Waiting));
        assert_that!(worker.current_task_id(), some(eq(&TaskId::new("item-1"))));

        // Different task while WAITING: rejected, state untouched.
        let busy_err = worker
            .assign_task(f.worker_task("item-2", WorkerAction::StartNewTask))
            .await
            .expect_err("should be busy");
        assert_that!(busy_err.to_string(), contains_substring("busy"));
        assert_that!(worker.current_task_id(), some(eq(&TaskId::new("item-1"))));

        // Same task but non-feedback action while WAITING: also rejected.
        assert_that!(
            worker
                .assign_task(f.worker_task("item-1", WorkerAction::MergeRequest))
                .await,
            err(anything())
        );
    }

    #[tokio::test]
    async fn test_feedback_replaces_current_task_while_waiting() {
        let f = WorkerFixture::new().await;
        let worker = f.worker("worker-1");
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();

        let mut feedback = f.worker_task("item-1", WorkerAction::ProcessFeedback);
        feedback.pull_request_url = Some("https://github.com/octo/website/pull/42".to_owned());
        worker.assign_task(feedback).await.unwrap();

        assert_that!(worker.status(), eq(WorkerStatus::Waiting));
        let task = worker.current_task().unwrap();
        assert_that!(task.action, eq(WorkerAction::ProcessFeedback));
        assert_that!(task.pull_request_url, some(anything()));
    }

    #[tokio::test]
    async fn test_execute_happy_path() {
        let f = WorkerFixture::new().await;
        let worker = f.worker("worker-1");
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();

        let outcome = worker.execute().await;
        let output = outcome.output.expect("execution should succeed");
        assert_that!(
            output.result.pr_link,
            some(contains_substring("/pull/42"))
        );
        assert_that!(worker.status(), eq(WorkerStatus::Idle));
        assert_that!(worker.current_task(), none());

        // The workspace was really materialised and handed to the developer.
        let info = f.store.get_workspace(&TaskId::new("item-1")).await.unwrap();
        assert_that!(f.workspace_manager.is_worktree_valid(&info).await, eq(true));
        let prompts = f.developer.prompts();
        assert_that!(prompts, len(eq(1)));
        assert_that!(prompts[0], contains_substring("octo/website"));
    }

    #[tokio::test]
    async fn test_execute_failure_stops_and_keeps_task() {
        let f = WorkerFixture::new().await;
        f.developer.enqueue(MockBehavior::Fail {
            error: "compile error".to_owned(),
        });
        let worker = f.worker("worker-1");
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();

        let outcome = worker.execute().await;
        assert_that!(outcome.output, err(contains_substring("compile error")));
        assert_that!(worker.status(), eq(WorkerStatus::Stopped));
        // The task is retained so recovery can resume it.
        assert_that!(worker.current_task_id(), some(eq(&TaskId::new("item-1"))));
        assert_that!(worker.last_error(), some(contains_substring("compile error")));
    }

    #[tokio::test]
    async fn test_recover_turns_start_into_resume() {
        let f = WorkerFixture::new().await;
        f.developer.enqueue(MockBehavior::Fail {
            error: "boom".to_owned(),
        });
        let worker = f.worker("worker-1");
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();
        let _ = worker.execute().await;
        assert_that!(worker.status(), eq(WorkerStatus::Stopped));

        worker.recover().await.unwrap();
        assert_that!(worker.status(), eq(WorkerStatus::Waiting));
        let task = worker.current_task().unwrap();
        assert_that!(task.action, eq(WorkerAction::ResumeTask));
        assert_that!(worker.recovery_attempts(), eq(1));

        // And a second execution on the reused workspace succeeds.
        let outcome = worker.execute().await;
        assert_that!(outcome.output, ok(anything()));
        assert_that!(worker.status(), eq(WorkerStatus::Idle));
        assert_that!(worker.recovery_attempts(), eq(0));
    }

    #[tokio::test]
    async fn test_restore_from_record_lands_in_stopped() {
        let f = WorkerFixture::new().await;
        let worker = f.worker("worker-1");
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();
        let record = worker.snapshot();

        let restored = Worker::from_record(
            record,
            f.developer.clone(),
            f.workspace_manager.clone(),
            f.base_branch.clone(),
            f.store.clone(),
        );
        // The in-flight subprocess is gone, so restored work is STOPPED until
        // the recovery sweeper picks it up.
        assert_that!(restored.status(), eq(WorkerStatus::Stopped));
        assert_that!(restored.current_task_id(), some(eq(&TaskId::new("item-1"))));
    }

    // A developer that never returns: the process group gets killed at the
    // deadline, the worker stops, and recovery re-runs the task in the same
    // workspace. The fake CLI sleeps forever on its first run and succeeds on
    // the second, keyed off a marker file in the (reused) worktree.
    #[tokio::test]
    async fn test_timeout_then_recovery_reuses_workspace() {
        use crate::developer::CliDeveloper;
        use crate::model::DeveloperType;
        use std::time::Duration;

        let f = WorkerFixture::new().await;
        let script = "if [ -f .resumed ]; then \
                          echo https://github.com/octo/website/pull/42; \
                      else \
                          touch .resumed; sleep 600; \
                      fi";
        let developer = Arc::new(CliDeveloper::new(
            DeveloperType::Claude,
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                script.to_owned(),
                "sh".to_owned(),
            ],
            Duration::from_millis(300),
        ));
        let worker = Worker::new(
            WorkerId::new("worker-1"),
            developer,
            f.workspace_manager.clone(),
            f.base_branch.clone(),
            f.store.clone(),
            PathBuf::from("/unused"),
        );
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();

        let outcome = worker.execute().await;
        assert_that!(outcome.output, err(contains_substring("did not finish")));
        assert_that!(worker.status(), eq(WorkerStatus::Stopped));

        worker.recover().await.unwrap();
        assert_that!(
            worker.current_task().unwrap().action,
            eq(WorkerAction::ResumeTask)
        );
        let outcome = worker.execute().await;
        let output = outcome.output.expect("resumed run should succeed");
        assert_that!(output.result.pr_link, some(contains_substring("/pull/42")));
        assert_that!(worker.status(), eq(WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn test_release_clears_everything() {
        let f = WorkerFixture::new().await;
        let worker = f.worker("worker-1");
        worker
            .assign_task(f.worker_task("item-1", WorkerAction::StartNewTask))
            .await
            .unwrap();
        worker.release().await;
        assert_that!(worker.status(), eq(WorkerStatus::Idle));
        assert_that!(worker.current_task(), none());
    }
}
