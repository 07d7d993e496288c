use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    git::GitService,
    lock::{GitOpLock, GitOperation},
    model::{RepoId, TaskId, WorkspaceInfo},
    repo_cache::RepositoryCache,
    store::StateStore,
    util::ResultExt as _,
};

// One working tree per task, at workspaceRoot/work/<taskId>, on a branch
// derived from the task id. Creation and destruction are serialised per task;
// different tasks only contend at the git layer (per-repo lock).
pub struct WorkspaceManager {
    git: GitService,
    lock: Arc<GitOpLock>,
    repo_cache: Arc<RepositoryCache>,
    store: Arc<dyn StateStore>,
    workspace_root: PathBuf,
    task_locks: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

// Task ids come from the board, so they can contain anything. Paths and
// branch names can't.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl WorkspaceManager {
    pub fn new(
        git: GitService,
        lock: Arc<GitOpLock>,
        repo_cache: Arc<RepositoryCache>,
        store: Arc<dyn StateStore>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            git,
            lock,
            repo_cache,
            store,
            workspace_root: workspace_root.into(),
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_path(&self, task_id: &TaskId) -> PathBuf {
        self.workspace_root
            .join("work")
            .join(sanitize(task_id.as_str()))
    }

    pub fn branch_name(&self, task_id: &TaskId) -> String {
        format!("task/{}", sanitize(task_id.as_str()))
    }

    async fn task_lock(&self, task_id: &TaskId) -> Arc<Mutex<()>> {
        self.task_locks
            .lock()
            .await
            .entry(task_id.clone())
            .or_default()
            .clone()
    }

    // Allocate (or return the existing) workspace record. Deliberately does
    // NOT create the worktree; that happens in setup_worktree once the base
    // branch is known.
    pub async fn create_workspace(
        &self,
        task_id: &TaskId,
        repo: &RepoId,
    ) -> anyhow::Result<WorkspaceInfo> {
        let task_lock = self.task_lock(task_id).await;
        let _held = task_lock.lock().await;

        if let Some(existing) = self.store.get_workspace(task_id).await {
            debug!("reusing workspace record for {}", task_id);
            return Ok(existing);
        }
        let info = WorkspaceInfo {
            task_id: task_id.clone(),
            repository_id: repo.clone(),
            workspace_dir: self.workspace_path(task_id),
            branch_name: self.branch_name(task_id),
            worktree_created: false,
            created_at: Utc::now(),
        };
        self.store
            .save_workspace(info.clone())
            .await
            .context("persisting new workspace")?;
        Ok(info)
    }

    // True iff the directory exists and contains a .git *file* pointing at
    // the parent repo. A .git directory means somebody put a full clone
    // where our worktree should be; that's not ours, treat it as invalid.
    pub async fn is_worktree_valid(&self, info: &WorkspaceInfo) -> bool {
        let git_pointer = info.workspace_dir.join(".git");
        match tokio::fs::read_to_string(&git_pointer).await {
            Ok(content) => content.starts_with("gitdir:"),
            Err(_) => false,
        }
    }

    // Materialise the worktree for a workspace record. Idempotent: a valid
    // existing worktree is left alone, which is what makes reassignment
    // cheap.
    pub async fn setup_worktree(
        &self,
        info: &WorkspaceInfo,
        base_branch: Option<&str>,
    ) -> anyhow::Result<()> {
        let repo = &info.repository_id;
        let repo_path = self.repo_cache.ensure_repository(repo, false).await?;

        self.lock
            .with_lock(repo, GitOperation::Worktree, || async {
                if self.is_worktree_valid(info).await {
                    debug!("worktree for {} already valid", info.task_id);
                    return Ok(());
                }
                // Clear out wreckage from an earlier attempt: a half-created
                // directory, a stale worktree registration, a leftover
                // branch. Each of these is individually allowed to not exist.
                if info.workspace_dir.exists() {
                    warn!(
                        "removing invalid workspace dir {:?}",
                        info.workspace_dir
                    );
                    tokio::fs::remove_dir_all(&info.workspace_dir).await?;
                }
                self.git
                    .prune_worktrees(&repo_path)
                    .await
                    .or_log_error("pruning worktrees");
                self.git
                    .delete_branch(&repo_path, &info.branch_name)
                    .await
                    .or_log_error("deleting stale task branch");

                if let Some(parent) = info.workspace_dir.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.git
                    .create_worktree(
                        &repo_path,
                        &info.branch_name,
                        &info.workspace_dir,
                        base_branch,
                    )
                    .await
                    .with_context(|| format!("creating worktree for {}", info.task_id))?;
                Ok(())
            })
            .await?;

        self.repo_cache.add_worktree(repo, &info.workspace_dir);
        let mut updated = info.clone();
        updated.worktree_created = true;
        self.store
            .save_workspace(updated)
            .await
            .context("persisting worktree creation")?;
        Ok(())
    }

    // Tear down whatever exists: worktree registration, directory, record.
    // Absent pieces are fine; cleanup has to be safe to re-run after any
    // partial failure.
    pub async fn cleanup_workspace(&self, task_id: &TaskId) -> anyhow::Result<()> {
        let task_lock = self.task_lock(task_id).await;
        let _held = task_lock.lock().await;

        let Some(info) = self.store.get_workspace(task_id).await else {
            debug!("no workspace record for {}, nothing to clean up", task_id);
            return Ok(());
        };
        let repo = &info.repository_id;
        let repo_path = self.repo_cache.local_path(repo);

        self.lock
            .with_lock(repo, GitOperation::Worktree, || async {
                if info.workspace_dir.exists() {
                    self.git
                        .remove_worktree(&repo_path, &info.workspace_dir)
                        .await
                        .or_log_error("removing worktree via git");
                }
                // git worktree remove takes the directory with it on success,
                // but not if the repo was already gone.
                match tokio::fs::remove_dir_all(&info.workspace_dir).await {
                    Ok(()) => (),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                    Err(e) => return Err(e).context("removing workspace dir"),
                }
                Ok(())
            })
            .await?;

        self.repo_cache.remove_worktree(repo, &info.workspace_dir);
        self.store.remove_workspace(task_id).await?;
        info!("cleaned up workspace for {}", task_id);
        Ok(())
    }
}
