use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::{select, sync::Mutex, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    comments::FilterOptions,
    config::Config,
    model::{
        PlannerErrorEntry, PlannerState, PrState, ProjectBoardItem, RepoId, RequestAction,
        ResponseStatus, Task, TaskId, TaskRequest, TaskResponse, TaskStatus,
    },
    providers::{parse_pr_url, ProjectBoardService, PullRequestService},
    router::TaskRouter,
    store::StateStore,
    util::{ResultExt as _, RingBuffer},
    workspace::WorkspaceManager,
};

const ERROR_RING_CAPACITY: usize = 64;

// Everything the tick mutates, behind one async mutex so an iteration can
// never be re-entered (force_sync racing the timer included).
struct PlannerRuntime {
    state: PlannerState,
    errors: RingBuffer<PlannerErrorEntry>,
    // Consecutive terminal-ish failures per task. Hitting max_task_attempts
    // sends the board item back to TODO.
    failure_counts: HashMap<TaskId, u32>,
}

// The reconciliation loop: every tick, walk the TODO / IN_PROGRESS /
// IN_REVIEW lanes in that order and push each item one step along. All
// external effects go through the board/PR services and the router; the
// planner itself only owns cursors, error history, and retry counts.
pub struct Planner {
    config: Config,
    board: Arc<dyn ProjectBoardService>,
    prs: Arc<dyn PullRequestService>,
    router: TaskRouter,
    store: Arc<dyn StateStore>,
    workspace_manager: Arc<WorkspaceManager>,
    runtime: Mutex<PlannerRuntime>,
    is_running: AtomicBool,
}

impl Planner {
    pub async fn new(
        config: Config,
        board: Arc<dyn ProjectBoardService>,
        prs: Arc<dyn PullRequestService>,
        router: TaskRouter,
        store: Arc<dyn StateStore>,
        workspace_manager: Arc<WorkspaceManager>,
    ) -> Self {
        let state = store.load_planner_state().await;
        let mut errors = RingBuffer::new(ERROR_RING_CAPACITY);
        for entry in &state.recent_errors {
            errors.push(entry.clone());
        }
        Self {
            config,
            board,
            prs,
            router,
            store,
            workspace_manager,
            runtime: Mutex::new(PlannerRuntime {
                state,
                errors,
                failure_counts: HashMap::new(),
            }),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    pub async fn run(self: Arc<Self>, ct: CancellationToken) -> anyhow::Result<()> {
        self.is_running.store(true, Ordering::SeqCst);
        match self.board.get_board(&self.config.board_id).await {
            Ok(board) => info!("reconciling board {:?} ({})", board.name, board.id),
            // Not fatal; the provider may just be warming up. Lane listing
            // failures get recorded per tick anyway.
            Err(e) => warn!("couldn't describe board {}: {:#}", self.config.board_id, e),
        }
        info!(
            "planner running, tick interval {:?}",
            self.config.monitoring_interval()
        );
        loop {
            select! {
                _ = ct.cancelled() => {
                    self.shutdown();
                    return Ok(());
                }
                _ = sleep(self.config.monitoring_interval()) => {}
            }
            if !self.is_running.load(Ordering::SeqCst) {
                debug!("planner stopped, skipping tick");
                return Ok(());
            }
            self.tick().await;
        }
    }

    // Drain one reconciliation pass synchronously.
    pub async fn force_sync(&self) {
        self.tick().await;
    }

    async fn tick(&self) {
        let mut runtime = self.runtime.lock().await;
        debug!("planner tick");
        self.handle_new_tasks(&mut runtime).await;
        self.handle_in_progress_tasks(&mut runtime).await;
        self.handle_review_tasks(&mut runtime).await;
        self.handle_vanished_tasks(&mut runtime).await;
        runtime.state.last_sync_time = Some(Utc::now());
        runtime.state.recent_errors = runtime.errors.to_vec();
        self.store
            .save_planner_state(runtime.state.clone())
            .await
            .or_log_error("persisting planner state");
    }

    fn record_error(runtime: &mut PlannerRuntime, task_id: Option<&TaskId>, message: String) {
        warn!(
            "planner error{}: {}",
            task_id.map(|t| format!(" (task {})", t)).unwrap_or_default(),
            message
        );
        runtime.errors.push(PlannerErrorEntry {
            at: Utc::now(),
            task_id: task_id.cloned(),
            message,
        });
    }

    // Which repository an item belongs to, honouring the configured default
    // and the repository filter. None means "skip this item" and the reason
    // is already logged.
    fn resolve_repository(&self, item: &ProjectBoardItem) -> Option<RepoId> {
        let repo = match item.repository() {
            Some(raw) => match raw.parse::<RepoId>() {
                Ok(repo) => Some(repo),
                Err(e) => {
                    warn!("item {}: bad repository {:?}: {}", item.id, raw, e);
                    None
                }
            },
            None => self.config.default_repository(),
        }?;
        if !self.config.repository_allowed(&repo) {
            warn!("item {}: repository {} filtered out", item.id, repo);
            return None;
        }
        Some(repo)
    }

    // Write the lane change and read our own write. A stale read-back is
    // logged and otherwise trusted to converge; the boards this runs against
    // are eventually consistent and re-asserting the status every tick would
    // fight them.
    async fn update_board_status(
        &self,
        item_id: &TaskId,
        new_status: TaskStatus,
    ) -> anyhow::Result<()> {
        let updated = self.board.update_item_status(item_id, new_status).await?;
        if updated.status != new_status {
            warn!(
                "board reports {} for {} right after we set {}; assuming eventual consistency",
                updated.status, item_id, new_status
            );
        }
        Ok(())
    }

    async fn ensure_task_record(&self, item: &ProjectBoardItem) -> anyhow::Result<Task> {
        if let Some(task) = self.store.get_task(&item.id).await {
            return Ok(task);
        }
        let now = Utc::now();
        let task = Task {
            id: item.id.clone(),
            title: item.title.clone(),
            status: item.status,
            priority: item
                .metadata
                .get("priority")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            assigned_worker_id: None,
            pull_request_url: item.pull_request_urls.first().cloned(),
            processed_comment_ids: Default::default(),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_task(task.clone()).await?;
        Ok(task)
    }

    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) {
        if let Some(mut task) = self.store.get_task(task_id).await {
            task.status = status;
            // Keep the record's idea of "who has this" in sync with the pool.
            task.assigned_worker_id = self
                .router
                .pool()
                .get_worker_by_task_id(task_id)
                .map(|w| w.id().clone());
            task.updated_at = Utc::now();
            self.store
                .upsert_task(task)
                .await
                .or_log_error("persisting task status");
        }
    }

    // Lane 1: TODO items we aren't working on yet get a worker. ACCEPTED
    // moves the board; REJECTED (pool saturated) leaves the item for the next
    // tick.
    async fn handle_new_tasks(&self, runtime: &mut PlannerRuntime) {
        let items = match self
            .board
            .get_items(&self.config.board_id, Some(TaskStatus::Todo))
            .await
        {
            Ok(items) => items,
            Err(e) => {
                Self::record_error(runtime, None, format!("listing TODO lane: {:#}", e));
                return;
            }
        };

        let mut requests = Vec::new();
        for item in items {
            if runtime.state.active_tasks.contains(&item.id) {
                continue;
            }
            let Some(repo) = self.resolve_repository(&item) else {
                continue;
            };
            if let Err(e) = self.ensure_task_record(&item).await {
                Self::record_error(
                    runtime,
                    Some(&item.id),
                    format!("creating task record: {:#}", e),
                );
                continue;
            }
            requests.push(TaskRequest {
                task_id: item.id.clone(),
                action: RequestAction::StartNewTask,
                repository_id: repo,
                board_item: item,
                pull_request_url: None,
                comments: vec![],
            });
        }
        if requests.is_empty() {
            return;
        }

        for response in self.router.route_batch(requests).await {
            match response.status {
                ResponseStatus::Accepted => {
                    info!("task {} accepted, moving to IN_PROGRESS", response.task_id);
                    if let Err(e) = self
                        .update_board_status(&response.task_id, TaskStatus::InProgress)
                        .await
                    {
                        Self::record_error(
                            runtime,
                            Some(&response.task_id),
                            format!("advancing board to IN_PROGRESS: {:#}", e),
                        );
                        continue;
                    }
                    self.set_task_status(&response.task_id, TaskStatus::InProgress)
                        .await;
                    runtime.state.active_tasks.insert(response.task_id);
                }
                ResponseStatus::Rejected => {
                    debug!(
                        "task {} rejected ({:?}), retrying next tick",
                        response.task_id, response.message
                    );
                }
                _ => Self::record_error(
                    runtime,
                    Some(&response.task_id),
                    format!("unexpected start response: {:?}", response.message),
                ),
            }
        }
    }

    // Lane 2: IN_PROGRESS items get a status check. COMPLETED attaches the PR
    // and advances the lane; repeated ERROR sends the item back to TODO.
    async fn handle_in_progress_tasks(&self, runtime: &mut PlannerRuntime) {
        let items = match self
            .board
            .get_items(&self.config.board_id, Some(TaskStatus::InProgress))
            .await
        {
            Ok(items) => items,
            Err(e) => {
                Self::record_error(runtime, None, format!("listing IN_PROGRESS lane: {:#}", e));
                return;
            }
        };

        let mut requests = Vec::new();
        for item in items {
            let Some(repo) = self.resolve_repository(&item) else {
                continue;
            };
            requests.push(TaskRequest {
                task_id: item.id.clone(),
                action: RequestAction::CheckStatus,
                repository_id: repo,
                pull_request_url: item.pull_request_urls.first().cloned(),
                board_item: item,
                comments: vec![],
            });
        }
        if requests.is_empty() {
            return;
        }

        for response in self.router.route_batch(requests).await {
            match response.status {
                ResponseStatus::Completed => {
                    self.complete_in_progress(runtime, response).await;
                }
                ResponseStatus::InProgress | ResponseStatus::Accepted => (),
                ResponseStatus::Rejected => debug!(
                    "status check for {} rejected: {:?}",
                    response.task_id, response.message
                ),
                ResponseStatus::Error => {
                    let message = response
                        .message
                        .unwrap_or_else(|| "unknown error".to_owned());
                    Self::record_error(runtime, Some(&response.task_id), message);
                    self.bump_failure(runtime, &response.task_id).await;
                }
            }
        }
    }

    async fn complete_in_progress(&self, runtime: &mut PlannerRuntime, response: TaskResponse) {
        let Some(pr_url) = response.pull_request_url.clone() else {
            // The developer claims success but never produced a PR link.
            // Warn and count it; the retry path will resume the workspace.
            Self::record_error(
                runtime,
                Some(&response.task_id),
                "completed without a pull request URL".to_owned(),
            );
            self.bump_failure(runtime, &response.task_id).await;
            return;
        };
        info!(
            "task {} produced {}, moving to IN_REVIEW",
            response.task_id, pr_url
        );
        if let Err(e) = self
            .board
            .add_pull_request_to_item(&response.task_id, &pr_url)
            .await
        {
            Self::record_error(
                runtime,
                Some(&response.task_id),
                format!("attaching PR to board item: {:#}", e),
            );
            return;
        }
        if let Err(e) = self
            .update_board_status(&response.task_id, TaskStatus::InReview)
            .await
        {
            Self::record_error(
                runtime,
                Some(&response.task_id),
                format!("advancing board to IN_REVIEW: {:#}", e),
            );
            return;
        }
        if let Some(mut task) = self.store.get_task(&response.task_id).await {
            task.status = TaskStatus::InReview;
            task.pull_request_url = Some(pr_url);
            task.updated_at = Utc::now();
            self.store
                .upsert_task(task)
                .await
                .or_log_error("persisting IN_REVIEW task");
        }
        runtime.failure_counts.remove(&response.task_id);
    }

    async fn bump_failure(&self, runtime: &mut PlannerRuntime, task_id: &TaskId) {
        let count = runtime
            .failure_counts
            .entry(task_id.clone())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        if *count < self.config.max_task_attempts {
            return;
        }
        warn!(
            "task {} failed {} times, reverting to TODO",
            task_id, count
        );
        runtime.failure_counts.remove(task_id);
        runtime.state.active_tasks.remove(task_id);
        if let Err(e) = self.update_board_status(task_id, TaskStatus::Todo).await {
            Self::record_error(
                runtime,
                Some(task_id),
                format!("reverting board to TODO: {:#}", e),
            );
            return;
        }
        self.set_task_status(task_id, TaskStatus::Todo).await;
    }

    // Lane 3: IN_REVIEW items. Approved PRs get a merge; everything else gets
    // its fresh review comments fed back to a worker, with the per-task
    // cursor and processed-id set keeping feedback exactly-once.
    async fn handle_review_tasks(&self, runtime: &mut PlannerRuntime) {
        let items = match self
            .board
            .get_items(&self.config.board_id, Some(TaskStatus::InReview))
            .await
        {
            Ok(items) => items,
            Err(e) => {
                Self::record_error(runtime, None, format!("listing IN_REVIEW lane: {:#}", e));
                return;
            }
        };

        for item in items {
            if let Err(e) = self.review_one(runtime, &item).await {
                Self::record_error(runtime, Some(&item.id), format!("{:#}", e));
            }
        }
    }

    async fn review_one(
        &self,
        runtime: &mut PlannerRuntime,
        item: &ProjectBoardItem,
    ) -> anyhow::Result<()> {
        let Some(repo) = self.resolve_repository(item) else {
            return Ok(());
        };
        // The item may have entered review before we ever saw it (restart, or
        // a human moved it); the processed-id bookkeeping needs a record.
        self.ensure_task_record(item).await?;
        let pr_url = match item.pull_request_urls.first().cloned() {
            Some(url) => url,
            None => match self.store.get_task(&item.id).await.and_then(|t| t.pull_request_url) {
                Some(url) => url,
                None => {
                    warn!("item {} is IN_REVIEW without a PR URL", item.id);
                    return Ok(());
                }
            },
        };
        let Some((pr_repo, number)) = parse_pr_url(&pr_url) else {
            warn!("item {}: unparseable PR URL {:?}", item.id, pr_url);
            return Ok(());
        };

        let pr = self.prs.get_pull_request(&pr_repo, number).await?;
        match pr.state {
            PrState::Merged => {
                info!("PR for {} merged, task done", item.id);
                self.finish_task(runtime, &item.id).await;
                return Ok(());
            }
            PrState::Closed => {
                // Closed without merging: someone decided against this work.
                // Done from our perspective; restarting it is a human call.
                info!("PR for {} closed unmerged, retiring task", item.id);
                self.finish_task(runtime, &item.id).await;
                return Ok(());
            }
            PrState::Open => (),
        }

        if self.prs.is_approved(&pr_repo, number).await? {
            let response = self
                .router
                .route(TaskRequest {
                    task_id: item.id.clone(),
                    action: RequestAction::RequestMerge,
                    repository_id: repo,
                    board_item: item.clone(),
                    pull_request_url: Some(pr_url),
                    comments: vec![],
                })
                .await;
            if response.status == ResponseStatus::Rejected {
                debug!(
                    "merge of {} deferred: {:?}",
                    response.task_id, response.message
                );
            }
            return Ok(());
        }

        // Not approved: look for fresh feedback.
        let since = runtime
            .state
            .comment_cursors
            .get(&item.id)
            .copied()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let options = FilterOptions {
            exclude_author: true,
            allowed_bots: self.config.allowed_bots.clone(),
        };
        let comments = self
            .prs
            .get_new_comments(&pr_repo, number, since, Some(&options))
            .await?;

        // Belt and braces on top of the cursor: never re-feed an id we've
        // already acknowledged, even if the cursor regressed (it shouldn't).
        let processed = self
            .store
            .get_task(&item.id)
            .await
            .map(|t| t.processed_comment_ids)
            .unwrap_or_default();
        let fresh: Vec<_> = comments
            .into_iter()
            .filter(|c| !processed.contains(&c.id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let newest = fresh.iter().map(|c| c.created_at).max().unwrap_or(since);
        let ids: Vec<String> = fresh.iter().map(|c| c.id.clone()).collect();
        info!("feeding {} new comments back for {}", fresh.len(), item.id);
        let response = self
            .router
            .route(TaskRequest {
                task_id: item.id.clone(),
                action: RequestAction::ProcessFeedback,
                repository_id: repo,
                board_item: item.clone(),
                pull_request_url: Some(pr_url),
                comments: fresh,
            })
            .await;
        match response.status {
            ResponseStatus::Accepted | ResponseStatus::Completed => {
                // Acknowledge everywhere, then advance the cursor, in that
                // order: a crash in between re-feeds nothing (ids are
                // recorded) and only costs a redundant fetch.
                self.store.mark_comments_processed(&item.id, &ids).await?;
                self.prs
                    .mark_comments_as_processed(&ids)
                    .await
                    .or_log_error("acknowledging comments with provider");
                runtime.state.comment_cursors.insert(item.id.clone(), newest);
            }
            ResponseStatus::Rejected => {
                // Worker busy; cursor stays put so next tick retries the same
                // comments.
                debug!(
                    "feedback for {} deferred: {:?}",
                    response.task_id, response.message
                );
            }
            _ => Self::record_error(
                runtime,
                Some(&response.task_id),
                format!("feedback routing failed: {:?}", response.message),
            ),
        }
        Ok(())
    }

    async fn finish_task(&self, runtime: &mut PlannerRuntime, task_id: &TaskId) {
        self.update_board_status(task_id, TaskStatus::Done)
            .await
            .or_log_error("advancing board to DONE");
        self.set_task_status(task_id, TaskStatus::Done).await;
        runtime.state.active_tasks.remove(task_id);
        runtime.state.processed_tasks.insert(task_id.clone());
        runtime.state.comment_cursors.remove(task_id);
        runtime.failure_counts.remove(task_id);
        self.workspace_manager
            .cleanup_workspace(task_id)
            .await
            .or_log_error("cleaning up finished workspace");
    }

    // Task records whose board item vanished get garbage-collected once no
    // worker references them.
    async fn handle_vanished_tasks(&self, runtime: &mut PlannerRuntime) {
        let items = match self.board.get_items(&self.config.board_id, None).await {
            Ok(items) => items,
            Err(e) => {
                Self::record_error(runtime, None, format!("listing board: {:#}", e));
                return;
            }
        };
        let on_board: std::collections::HashSet<&TaskId> = items.iter().map(|i| &i.id).collect();
        for task in self.store.list_tasks().await {
            if on_board.contains(&task.id) {
                continue;
            }
            if let Some(worker) = self.router.pool().get_worker_by_task_id(&task.id) {
                // A live execution gets to finish; a stopped one is pointless
                // now that nobody wants the result, so free the worker.
                if worker.status() != crate::model::WorkerStatus::Stopped {
                    continue;
                }
                info!(
                    "releasing {} from vanished task {}",
                    worker.id(),
                    task.id
                );
                self.router
                    .pool()
                    .release_worker(&worker.id().clone())
                    .await
                    .or_log_error("releasing worker from vanished task");
            }
            info!("board item {} vanished, dropping task record", task.id);
            self.workspace_manager
                .cleanup_workspace(&task.id)
                .await
                .or_log_error("cleaning up vanished task workspace");
            self.store
                .remove_task(&task.id)
                .await
                .or_log_error("removing vanished task");
            runtime.state.active_tasks.remove(&task.id);
            runtime.state.comment_cursors.remove(&task.id);
        }
    }

    pub async fn planner_state(&self) -> PlannerState {
        self.runtime.lock().await.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use googletest::prelude::*;

    use super::*;
    use crate::{
        config::test_utils::test_config,
        developer::MockBehavior,
        model::{test_utils::board_item, PrComment, PullRequest, WorkerStatus},
        pool::WorkerPool,
        providers::{InMemoryBoardService, InMemoryPullRequestService},
        worker::test_utils::WorkerFixture,
    };

    struct PlannerFixture {
        inner: WorkerFixture,
        board: Arc<InMemoryBoardService>,
        pool: Arc<WorkerPool>,
        planner: Planner,
    }

    async fn planner_fixture(tweak: impl FnOnce(&mut Config)) -> PlannerFixture {
        let inner = WorkerFixture::new().await;
        let mut config = test_config(inner._base.path());
        tweak(&mut config);
        let board = Arc::new(InMemoryBoardService::new());
        let pool = WorkerPool::with_developer_factory(
            config.clone(),
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
        let planner = Planner::new(
            config,
            board.clone(),
            inner.pr_service.clone(),
            router,
            inner.store.clone(),
            inner.workspace_manager.clone(),
        )
        .await;
        PlannerFixture {
            inner,
            board,
            pool,
            planner,
        }
    }

    fn seed_pr(prs: &InMemoryPullRequestService, repo: &RepoId, number: u64, author: &str) {
        prs.add_pull_request(PullRequest {
            repository_id: repo.clone(),
            number,
            url: format!("https://github.com/{}/pull/{}", repo, number),
            title: "change".to_owned(),
            author: author.to_owned(),
            state: PrState::Open,
            base_branch: None,
        });
    }

    async fn wait_for_idle_pool(pool: &Arc<WorkerPool>) {
        for _ in 0..500 {
            if pool
                .workers_snapshot()
                .iter()
                .all(|w| w.status() == WorkerStatus::Idle)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never went idle");
    }

    // Scenario A: TODO item picked up, board advanced, PR attached, lane
    // moved to IN_REVIEW.
    #[tokio::test]
    async fn test_new_task_happy_path() {
        let f = planner_fixture(|_| {}).await;
        f.board.add_item(board_item("item-1", TaskStatus::Todo));
        let dev_repo = f.inner.repo.clone();
        f.inner.pr_service.set_default_branch(&dev_repo, "main");

        // Tick 1: item accepted and moved to IN_PROGRESS.
        f.planner.force_sync().await;
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::InProgress)
        );

        // Let the (mock) developer finish, then tick 2: COMPLETED with a PR
        // URL; board gets the PR and moves to IN_REVIEW.
        wait_for_idle_pool(&f.pool).await;
        f.planner.force_sync().await;
        let item = f.board.item(&TaskId::new("item-1")).unwrap();
        assert_that!(item.status, eq(TaskStatus::InReview));
        assert_that!(
            item.pull_request_urls,
            contains(contains_substring("/pull/42"))
        );
        let task = f.inner.store.get_task(&TaskId::new("item-1")).await.unwrap();
        assert_that!(task.status, eq(TaskStatus::InReview));
        assert_that!(task.pull_request_url, some(contains_substring("/pull/42")));
    }

    // Property 7: ticks with no external change emit no duplicate work.
    #[tokio::test]
    async fn test_idempotent_ticks() {
        let f = planner_fixture(|_| {}).await;
        f.board.add_item(board_item("item-1", TaskStatus::Todo));
        f.inner.developer.enqueue(MockBehavior::Hang);

        f.planner.force_sync().await;
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        let assigned_at = worker.current_task().unwrap().assigned_at;

        // More ticks while the task hangs in WORKING: no reassignment, no new
        // workers, board stays put.
        f.planner.force_sync().await;
        f.planner.force_sync().await;
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        assert_that!(worker.current_task().unwrap().assigned_at, eq(assigned_at));
        assert_that!(f.pool.worker_count(), eq(1));
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::InProgress)
        );
    }

    // Scenario C: first feedback round processes c1+c2; c3 arriving later is
    // the only thing in round two.
    #[tokio::test]
    async fn test_comment_deduplication() {
        let f = planner_fixture(|_| {}).await;
        let repo = f.inner.repo.clone();
        let mut item = board_item("item-1", TaskStatus::InReview);
        item.pull_request_urls = vec!["https://github.com/octo/website/pull/42".to_owned()];
        f.board.add_item(item);
        seed_pr(&f.inner.pr_service, &repo, 42, "ai-dev");

        let t = |minute: u32| Utc.with_ymd_and_hms(2024, 5, 4, 12, minute, 0).unwrap();
        f.inner.pr_service.add_comment(
            &repo,
            42,
            PrComment {
                id: "c1".into(),
                author: "alice".into(),
                body: "rename".into(),
                created_at: t(1),
            },
        );
        f.inner.pr_service.add_comment(
            &repo,
            42,
            PrComment {
                id: "c2".into(),
                author: "bob".into(),
                body: "test this".into(),
                created_at: t(2),
            },
        );

        // Tick 1: both comments go to a worker.
        f.inner.developer.enqueue(MockBehavior::Hang);
        f.planner.force_sync().await;
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        let task = worker.current_task().unwrap();
        let ids: Vec<&str> = task.comments.iter().map(|c| c.id.as_str()).collect();
        assert_that!(ids, eq(&vec!["c1", "c2"]));
        // Both acknowledged.
        let record = f.inner.store.get_task(&TaskId::new("item-1")).await.unwrap();
        assert_that!(record.processed_comment_ids.len(), eq(2));
        assert_that!(
            f.inner.pr_service.processed_ids().len(),
            eq(2)
        );

        // c3 arrives while round one is still hanging; free the worker so
        // the next round can take it.
        worker.release().await;
        f.inner.pr_service.add_comment(
            &repo,
            42,
            PrComment {
                id: "c3".into(),
                author: "alice".into(),
                body: "one more".into(),
                created_at: t(10),
            },
        );
        f.inner.developer.enqueue(MockBehavior::Hang);
        f.planner.force_sync().await;
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        let task = worker.current_task().unwrap();
        let ids: Vec<&str> = task.comments.iter().map(|c| c.id.as_str()).collect();
        assert_that!(ids, eq(&vec!["c3"]));

        // Cursor advanced to the newest processed comment.
        let state = f.planner.planner_state().await;
        assert_that!(
            state.comment_cursors.get(&TaskId::new("item-1")),
            some(eq(&t(10)))
        );
    }

    // Approved PR: the planner asks for a merge instead of feedback, and once
    // the PR reports merged the task is retired and its workspace cleaned up.
    #[tokio::test]
    async fn test_approval_drives_merge_then_done() {
        let f = planner_fixture(|_| {}).await;
        let repo = f.inner.repo.clone();
        let mut item = board_item("item-1", TaskStatus::InReview);
        item.pull_request_urls = vec!["https://github.com/octo/website/pull/42".to_owned()];
        f.board.add_item(item);
        seed_pr(&f.inner.pr_service, &repo, 42, "ai-dev");
        f.inner.pr_service.add_review(
            &repo,
            42,
            crate::model::PrReview {
                reviewer: "alice".into(),
                state: crate::model::ReviewState::Approved,
                submitted_at: Utc::now(),
            },
        );

        f.inner.developer.enqueue(MockBehavior::Hang);
        f.planner.force_sync().await;
        let worker = f.pool.get_worker_by_task_id(&TaskId::new("item-1")).unwrap();
        assert_that!(
            worker.current_task().unwrap().action,
            eq(crate::model::WorkerAction::MergeRequest)
        );

        // The merge "lands": PR flips to merged, worker freed.
        worker.release().await;
        f.inner.pr_service.add_pull_request(PullRequest {
            repository_id: repo.clone(),
            number: 42,
            url: "https://github.com/octo/website/pull/42".to_owned(),
            title: "change".to_owned(),
            author: "ai-dev".to_owned(),
            state: PrState::Merged,
            base_branch: None,
        });
        f.planner.force_sync().await;
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::Done)
        );
        let state = f.planner.planner_state().await;
        assert_that!(
            state.processed_tasks.contains(&TaskId::new("item-1")),
            eq(true)
        );
    }

    // Repeated errors on an IN_PROGRESS item whose worker and workspace are
    // gone: after max_task_attempts the lane reverts to TODO.
    #[tokio::test]
    async fn test_repeated_errors_revert_to_todo() {
        let f = planner_fixture(|c| c.max_task_attempts = 2).await;
        // IN_PROGRESS on the board, but nothing in the pool and no workspace:
        // CHECK_STATUS yields ERROR("no workspace found") every tick.
        f.board.add_item(board_item("item-1", TaskStatus::InProgress));

        f.planner.force_sync().await;
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::InProgress)
        );
        f.planner.force_sync().await;
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::Todo)
        );
        // The failures are on the record.
        let state = f.planner.planner_state().await;
        assert_that!(state.recent_errors.len(), ge(2));
    }

    // Scenario F: the board applies our write but serves a stale read. The
    // planner logs and carries on as if it succeeded.
    #[tokio::test]
    async fn test_laggy_board_update_treated_as_success() {
        let f = planner_fixture(|_| {}).await;
        f.board.add_item(board_item("item-1", TaskStatus::Todo));
        f.board.set_laggy(true);

        f.planner.force_sync().await;
        // The stale read-back didn't stop the planner from tracking the task
        // as started.
        let state = f.planner.planner_state().await;
        assert_that!(state.active_tasks.contains(&TaskId::new("item-1")), eq(true));
        // And the mutation did land on the board.
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::InProgress)
        );
    }

    #[tokio::test]
    async fn test_vanished_item_garbage_collected() {
        let f = planner_fixture(|_| {}).await;
        f.board.add_item(board_item("item-1", TaskStatus::Todo));
        f.planner.force_sync().await;
        wait_for_idle_pool(&f.pool).await;

        // Task record exists, then the item disappears from the board.
        assert_that!(
            f.inner.store.get_task(&TaskId::new("item-1")).await,
            some(anything())
        );
        // Simulate deletion by loading an empty item list.
        let empty: Vec<crate::model::ProjectBoardItem> = vec![];
        let path = f.inner._base.path().join("empty-board.json");
        std::fs::write(&path, serde_json::to_string(&empty).unwrap()).unwrap();
        f.board.load_items(&path).unwrap();

        f.planner.force_sync().await;
        assert_that!(f.inner.store.get_task(&TaskId::new("item-1")).await, none());
        assert_that!(
            f.inner.store.get_workspace(&TaskId::new("item-1")).await,
            none()
        );
    }

    // Pool saturation: the rejected item stays in TODO and gets picked up on
    // a later tick once capacity frees.
    #[tokio::test]
    async fn test_rejected_item_retried_next_tick() {
        let f = planner_fixture(|c| c.max_workers = 1).await;
        f.board.add_item(board_item("item-1", TaskStatus::Todo));
        f.board.add_item(board_item("item-2", TaskStatus::Todo));
        f.inner.developer.enqueue(MockBehavior::Hang);

        f.planner.force_sync().await;
        // One accepted, one left behind.
        let statuses: Vec<TaskStatus> = ["item-1", "item-2"]
            .iter()
            .map(|id| f.board.item(&TaskId::new(*id)).unwrap().status)
            .collect();
        assert_that!(
            statuses
                .iter()
                .filter(|s| **s == TaskStatus::InProgress)
                .count(),
            eq(1)
        );
        assert_that!(
            statuses.iter().filter(|s| **s == TaskStatus::Todo).count(),
            eq(1)
        );

        // Capacity frees up; the straggler starts on the next tick.
        let busy = f
            .pool
            .workers_snapshot()
            .into_iter()
            .find(|w| w.current_task_id().is_some())
            .unwrap();
        busy.release().await;
        f.planner.force_sync().await;
        let leftover: Vec<TaskStatus> = ["item-1", "item-2"]
            .iter()
            .map(|id| f.board.item(&TaskId::new(*id)).unwrap().status)
            .filter(|s| *s == TaskStatus::Todo)
            .collect();
        assert_that!(leftover, empty());
    }

    #[tokio::test]
    async fn test_repository_filter_skips_items() {
        let f = planner_fixture(|c| {
            c.repository_filter = vec!["octo/allowed".to_owned()];
        })
        .await;
        f.board.add_item(board_item("item-1", TaskStatus::Todo));
        f.planner.force_sync().await;
        // Item's metadata points at octo/website, which is filtered out.
        assert_that!(
            f.board.item(&TaskId::new("item-1")).unwrap().status,
            eq(TaskStatus::Todo)
        );
        assert_that!(f.pool.get_worker_by_task_id(&TaskId::new("item-1")), none());
    }
}
