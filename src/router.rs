use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools as _;
#[allow(unused_imports)]
use log::{debug, info, warn};

use crate::{
    errors::OrchestratorError,
    model::{
        PrComment, RequestAction, TaskId, TaskRequest, TaskResponse, WorkerAction, WorkerStatus,
        WorkerTask,
    },
    pool::WorkerPool,
    store::StateStore,
    workspace::WorkspaceManager,
};

// Priorities for contended reassignment: a task whose workspace is still
// valid resumes cheaply and shouldn't lose its worker to a task that needs a
// full setup.
const PRIORITY_VALID_WORKSPACE: u32 = 10;
const PRIORITY_NO_WORKSPACE: u32 = 5;

// Turns the planner's requests into worker assignments (or refusals). Holds
// no state of its own: everything it decides on is readable from the pool and
// the store, which keeps routing decisions consistent with what the sweepers
// are doing concurrently.
pub struct TaskRouter {
    pool: Arc<WorkerPool>,
    workspace_manager: Arc<WorkspaceManager>,
    store: Arc<dyn StateStore>,
}

impl TaskRouter {
    pub fn new(
        pool: Arc<WorkerPool>,
        workspace_manager: Arc<WorkspaceManager>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            pool,
            workspace_manager,
            store,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    async fn reassignment_priority(&self, task_id: &TaskId) -> u32 {
        match self.store.get_workspace(task_id).await {
            Some(info) if self.workspace_manager.is_worktree_valid(&info).await => {
                PRIORITY_VALID_WORKSPACE
            }
            _ => PRIORITY_NO_WORKSPACE,
        }
    }

    // Route a lane's worth of requests. Higher-priority requests go first so
    // that when idle workers are scarce, tasks with live workspaces win; the
    // sort is stable, so equal priorities keep their board order.
    pub async fn route_batch(&self, requests: Vec<TaskRequest>) -> Vec<TaskResponse> {
        let mut prioritized = Vec::with_capacity(requests.len());
        for request in requests {
            let priority = self.reassignment_priority(&request.task_id).await;
            prioritized.push((priority, request));
        }
        let ordered: Vec<TaskRequest> = prioritized
            .into_iter()
            .sorted_by_key(|(priority, _)| std::cmp::Reverse(*priority))
            .map(|(_, request)| request)
            .collect();

        let mut responses = Vec::with_capacity(ordered.len());
        for request in ordered {
            responses.push(self.route(request).await);
        }
        responses
    }

    pub async fn route(&self, request: TaskRequest) -> TaskResponse {
        match request.action {
            RequestAction::StartNewTask => self.start_new_task(request).await,
            RequestAction::CheckStatus => self.check_status(request).await,
            RequestAction::ProcessFeedback => self.process_feedback(request).await,
            RequestAction::RequestMerge => self.request_merge(request).await,
        }
    }

    fn worker_task(request: &TaskRequest, action: WorkerAction, comments: Vec<PrComment>) -> WorkerTask {
        WorkerTask {
            task_id: request.task_id.clone(),
            action,
            repository_id: request.repository_id.clone(),
            board_item: request.board_item.clone(),
            pull_request_url: request.pull_request_url.clone(),
            comments,
            assigned_at: Utc::now(),
        }
    }

    // Map assignment failures onto the response vocabulary: pool/worker
    // saturation is an expected REJECTED (planner retries next tick),
    // anything else is an ERROR.
    fn assignment_response(task_id: TaskId, result: Result<(), OrchestratorError>) -> TaskResponse {
        match result {
            Ok(()) => TaskResponse::accepted(task_id),
            Err(
                e @ (OrchestratorError::WorkerBusy { .. } | OrchestratorError::NoAvailableWorker),
            ) => TaskResponse::rejected(task_id, e.to_string()),
            Err(e) => TaskResponse::error(task_id, format!("{:#}", e)),
        }
    }

    async fn assign_to_idle(
        &self,
        request: &TaskRequest,
        action: WorkerAction,
        comments: Vec<PrComment>,
    ) -> TaskResponse {
        let worker = match self.pool.get_available_worker().await {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                return TaskResponse::rejected(
                    request.task_id.clone(),
                    OrchestratorError::NoAvailableWorker.to_string(),
                )
            }
            Err(e) => return TaskResponse::error(request.task_id.clone(), format!("{:#}", e)),
        };
        let task = Self::worker_task(request, action, comments);
        let result = self
            .pool
            .assign_worker_task(&worker.id().clone(), task)
            .await;
        Self::assignment_response(request.task_id.clone(), result)
    }

    async fn start_new_task(&self, request: TaskRequest) -> TaskResponse {
        if self.pool.get_worker_by_task_id(&request.task_id).is_some() {
            return TaskResponse::rejected(
                request.task_id,
                "task already assigned to a worker",
            );
        }
        self.assign_to_idle(&request, WorkerAction::StartNewTask, vec![])
            .await
    }

    async fn check_status(&self, request: TaskRequest) -> TaskResponse {
        // A finished execution outranks everything else: the worker already
        // moved on, the outcome is what the planner needs.
        if let Some(outcome) = self.pool.take_finished(&request.task_id) {
            return match outcome.output {
                Ok(output) => TaskResponse::completed(request.task_id, output.result.pr_link),
                Err(reason) => TaskResponse::error(request.task_id, reason),
            };
        }

        if let Some(worker) = self.pool.get_worker_by_task_id(&request.task_id) {
            let message = match worker.status() {
                WorkerStatus::Working => "executing".to_owned(),
                WorkerStatus::Waiting => "queued for execution".to_owned(),
                // Not an ERROR: the recovery sweeper owns this worker now and
                // reverting the board would fight it.
                WorkerStatus::Stopped => "stopped, awaiting recovery".to_owned(),
                WorkerStatus::Idle => "idle".to_owned(),
            };
            return TaskResponse::in_progress(request.task_id, message);
        }

        // Nobody holds the task. If its workspace survived (reassignment
        // after eviction or restart), put an idle worker back on it.
        match self.store.get_workspace(&request.task_id).await {
            Some(info) if self.workspace_manager.is_worktree_valid(&info).await => {
                let response = self
                    .assign_to_idle(&request, WorkerAction::ResumeTask, vec![])
                    .await;
                match response.status {
                    crate::model::ResponseStatus::Accepted => {
                        TaskResponse::in_progress(response.task_id, "reassigned")
                    }
                    _ => response,
                }
            }
            _ => TaskResponse::error(request.task_id, "no workspace found"),
        }
    }

    async fn process_feedback(&self, request: TaskRequest) -> TaskResponse {
        if let Some(worker) = self.pool.get_worker_by_task_id(&request.task_id) {
            return match worker.status() {
                WorkerStatus::Working => {
                    TaskResponse::rejected(request.task_id, "worker busy executing")
                }
                WorkerStatus::Stopped => {
                    TaskResponse::rejected(request.task_id, "worker stopped, awaiting recovery")
                }
                // WAITING: refresh the pending assignment with the union of
                // comments. Dedup by id, earlier instance wins.
                _ => {
                    let existing = worker
                        .current_task()
                        .map(|t| t.comments)
                        .unwrap_or_default();
                    let merged: Vec<PrComment> = existing
                        .into_iter()
                        .chain(request.comments.iter().cloned())
                        .unique_by(|c| c.id.clone())
                        .collect();
                    let task =
                        Self::worker_task(&request, WorkerAction::ProcessFeedback, merged);
                    let result = self
                        .pool
                        .assign_worker_task(&worker.id().clone(), task)
                        .await;
                    Self::assignment_response(request.task_id, result)
                }
            };
        }
        let comments = request.comments.clone();
        self.assign_to_idle(&request, WorkerAction::ProcessFeedback, comments)
            .await
    }

    async fn request_merge(&self, request: TaskRequest) -> TaskResponse {
        if let Some(worker) = self.pool.get_worker_by_task_id(&request.task_id) {
            // Whatever it's doing, it isn't mergeable right now.
            return TaskResponse::rejected(
                request.task_id,
                format!("worker {} still holds the task", worker.id()),
            );
        }
        self.assign_to_idle(&request, WorkerAction::MergeRequest, vec![])
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use googletest::prelude::*;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        config::test_utils::test_config,
        developer::MockBehavior,
        model::{test_utils::comment, ResponseStatus},
        worker::test_utils::WorkerFixture,
    };

    struct RouterFixture {
        inner: WorkerFixture,
        pool: Arc<WorkerPool>,
        router: TaskRouter,
    }

    async fn router_fixture(tweak: impl FnOnce(&mut crate::config::Config)) -> RouterFixture {
        let inner = WorkerFixture::new().await;
        let mut config = test_config(inner._base.path());
        tweak(&mut config);
        let pool = WorkerPool::with_developer_factory(
            config,
            inner.store.clone(),
            inner.workspace_manager.clone(),
            inner.base_branch.clone(),
            inner.shared_developer_factory(),
        );
        pool.initialize_pool().await.unwrap();
        let router = TaskRouter::new(
            pool.clone(),
            inner.workspace_manager.clone(),
            inner.store.clone(),
        );
        RouterFixture {
            inner,
            pool,
            router,
        }
    }

    fn request(f: &RouterFixture, task_id: &str, action: RequestAction) -> TaskRequest {
        let wt = f.inner.worker_task(task_id, WorkerAction::StartNewTask);
        TaskRequest {
            task_id: wt.task_id,
            action,
            repository_id: wt.repository_id,
            board_item: wt.board_item,
            pull_request_url: Some("https://github.com/octo/website/pull/42".to_owned()),
            comments: vec![],
        }
    }

    async fn wait_for_finished(f: &RouterFixture, task_id: &str) {
        for _ in 0..500 {
            if f.pool.get_worker_by_task_id(&TaskId::new(task_id)).is_none() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task_id);
    }

    #[tokio::test]
    async fn test_start_new_task_accepted_then_duplicate_rejected() {
        let f = router_fixture(|_| {}).await;
        f.inner.developer.enqueue(MockBehavior::Hang);
        let response = f
            .router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        assert_that!(response.status, eq(ResponseStatus::Accepted));

        let response = f
            .router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        assert_that!(response.status, eq(ResponseStatus::Rejected));
    }

    #[tokio::test]
    async fn test_start_new_task_rejected_when_saturated() {
        let f = router_fixture(|c| c.max_workers = 1).await;
        f.inner.developer.enqueue(MockBehavior::Hang);
        f.router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        let response = f
            .router
            .route(request(&f, "item-2", RequestAction::StartNewTask))
            .await;
        assert_that!(response.status, eq(ResponseStatus::Rejected));
        assert_that!(response.message, some(contains_substring("no available worker")));
    }

    #[tokio::test]
    async fn test_check_status_no_worker_no_workspace() {
        let f = router_fixture(|_| {}).await;
        let response = f
            .router
            .route(request(&f, "ghost", RequestAction::CheckStatus))
            .await;
        assert_that!(response.status, eq(ResponseStatus::Error));
        assert_that!(response.message, some(eq(&"no workspace found".to_owned())));
    }

    #[tokio::test]
    async fn test_check_status_completed_with_pr() {
        let f = router_fixture(|_| {}).await;
        f.router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        wait_for_finished(&f, "item-1").await;

        let response = f
            .router
            .route(request(&f, "item-1", RequestAction::CheckStatus))
            .await;
        assert_that!(response.status, eq(ResponseStatus::Completed));
        assert_that!(
            response.pull_request_url,
            some(contains_substring("/pull/42"))
        );
    }

    #[tokio::test]
    async fn test_check_status_working() {
        let f = router_fixture(|_| {}).await;
        f.inner.developer.enqueue(MockBehavior::Hang);
        f.router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        // Give the execution task a moment to flip WAITING -> WORKING.
        sleep(Duration::from_millis(50)).await;
        let response = f
            .router
            .route(request(&f, "item-1", RequestAction::CheckStatus))
            .await;
        assert_that!(response.status, eq(ResponseStatus::InProgress));
    }

    #[tokio::test]
    async fn test_check_status_reassigns_valid_workspace() {
        let f = router_fixture(|_| {}).await;
        // Materialise a workspace by running a task to completion, then
        // pretend we forgot about it (fresh pool knows no worker for it).
        f.router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        wait_for_finished(&f, "item-1").await;
        f.pool.take_finished(&TaskId::new("item-1"));

        let response = f
            .router
            .route(request(&f, "item-1", RequestAction::CheckStatus))
            .await;
        assert_that!(response.status, eq(ResponseStatus::InProgress));
        assert_that!(response.message, some(eq(&"reassigned".to_owned())));
        // And the worker really holds a RESUME_TASK assignment.
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        let action = worker.current_task().map(|t| t.action);
        // The execution may already have finished; accept either in-flight
        // resume or completion.
        if let Some(action) = action {
            assert_that!(action, eq(WorkerAction::ResumeTask));
        }
    }

    #[tokio::test]
    async fn test_process_feedback_busy_worker_rejected() {
        let f = router_fixture(|_| {}).await;
        f.inner.developer.enqueue(MockBehavior::Hang);
        f.router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        sleep(Duration::from_millis(50)).await;

        let mut req = request(&f, "item-1", RequestAction::ProcessFeedback);
        req.comments = vec![comment("c1", "alice", "fix this")];
        let response = f.router.route(req).await;
        assert_that!(response.status, eq(ResponseStatus::Rejected));
        assert_that!(response.message, some(contains_substring("busy")));
    }

    #[tokio::test]
    async fn test_process_feedback_fresh_worker_when_none() {
        let f = router_fixture(|_| {}).await;
        f.inner.developer.enqueue(MockBehavior::Hang);
        let mut req = request(&f, "item-1", RequestAction::ProcessFeedback);
        req.comments = vec![comment("c3", "alice", "address this")];
        let response = f.router.route(req).await;
        assert_that!(response.status, eq(ResponseStatus::Accepted));
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        let task = worker.current_task().unwrap();
        assert_that!(task.action, eq(WorkerAction::ProcessFeedback));
        assert_that!(task.comments, len(eq(1)));
    }

    #[tokio::test]
    async fn test_request_merge_allocates_idle_worker() {
        let f = router_fixture(|_| {}).await;
        f.inner.developer.enqueue(MockBehavior::Hang);
        let response = f
            .router
            .route(request(&f, "item-1", RequestAction::RequestMerge))
            .await;
        assert_that!(response.status, eq(ResponseStatus::Accepted));
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        assert_that!(
            worker.current_task().unwrap().action,
            eq(WorkerAction::MergeRequest)
        );
    }

    // One idle worker, two feedback requests: the task with a valid workspace
    // wins the worker; the other gets rejected and will retry next tick.
    #[tokio::test]
    async fn test_route_batch_prefers_valid_workspace() {
        let f = router_fixture(|c| c.max_workers = 1).await;
        // Create a real workspace for item-1.
        f.router
            .route(request(&f, "item-1", RequestAction::StartNewTask))
            .await;
        wait_for_finished(&f, "item-1").await;
        f.pool.take_finished(&TaskId::new("item-1"));
        f.inner.developer.enqueue(MockBehavior::Hang);

        // item-0 sorts first in board order but has no workspace.
        let responses = f
            .router
            .route_batch(vec![
                request(&f, "item-0", RequestAction::ProcessFeedback),
                request(&f, "item-1", RequestAction::ProcessFeedback),
            ])
            .await;
        // Responses come back in routing (priority) order: item-1 first.
        assert_that!(responses[0].task_id, eq(&TaskId::new("item-1")));
        assert_that!(responses[0].status, eq(ResponseStatus::Accepted));
        assert_that!(responses[1].task_id, eq(&TaskId::new("item-0")));
        assert_that!(responses[1].status, eq(ResponseStatus::Rejected));
    }
}
