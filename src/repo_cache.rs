use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    git::GitService,
    lock::{GitOpLock, GitOperation},
    model::{RepoId, RepositoryState},
    util::ResultExt as _,
};

// Owns the one local clone per repository that every worktree hangs off.
// Clone and fetch go through GitOpLock, so two workers racing to materialise
// the same new repository produce exactly one clone; the loser of the race
// finds the clone already there when it gets the lock.
pub struct RepositoryCache {
    git: GitService,
    lock: Arc<GitOpLock>,
    workspace_root: PathBuf,
    cache_timeout: Duration,
    // Clone/fetch bookkeeping. Not persisted: on restart the clones are
    // re-discovered on disk and the fetch staleness window simply restarts.
    repos: Mutex<HashMap<RepoId, RepositoryState>>,
}

impl RepositoryCache {
    pub fn new(
        git: GitService,
        lock: Arc<GitOpLock>,
        workspace_root: impl Into<PathBuf>,
        cache_timeout: Duration,
    ) -> Self {
        Self {
            git,
            lock,
            workspace_root: workspace_root.into(),
            cache_timeout,
            repos: Mutex::new(HashMap::new()),
        }
    }

    // Deterministic: workspaceRoot/repos/<owner>/<name>. Everything else
    // (worktree paths, cleanup, restore-after-restart) depends on being able
    // to recompute this.
    pub fn local_path(&self, repo: &RepoId) -> PathBuf {
        self.workspace_root
            .join("repos")
            .join(repo.owner())
            .join(repo.name())
    }

    fn state_snapshot(&self, repo: &RepoId) -> RepositoryState {
        self.repos
            .lock()
            .get(repo)
            .cloned()
            .unwrap_or_else(|| RepositoryState {
                id: repo.clone(),
                local_path: self.local_path(repo),
                last_fetch_at: None,
                is_cloned: false,
                active_worktrees: Default::default(),
            })
    }

    // Guarantee a usable clone at the deterministic path, freshened if it's
    // older than the cache window (or the caller insists).
    pub async fn ensure_repository(
        &self,
        repo: &RepoId,
        force_update: bool,
    ) -> anyhow::Result<PathBuf> {
        let path = self.local_path(repo);
        let state = self.state_snapshot(repo);

        // Pick the operation for reporting purposes; acquisition is per-repo
        // either way. The decision gets re-made under the lock since another
        // worker may have cloned while we waited.
        let op = if state.is_cloned {
            GitOperation::Fetch
        } else {
            GitOperation::Clone
        };

        self.lock
            .with_lock(repo, op, || async {
                let on_disk = self.git.is_valid_repository(&path).await;
                if !on_disk {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let url = self.git.remote_url(repo);
                    self.git.clone_repository(&url, &path).await?;
                    let mut repos = self.repos.lock();
                    let entry = repos.entry(repo.clone()).or_insert_with(|| RepositoryState {
                        id: repo.clone(),
                        local_path: path.clone(),
                        last_fetch_at: None,
                        is_cloned: false,
                        active_worktrees: Default::default(),
                    });
                    entry.is_cloned = true;
                    entry.last_fetch_at = Some(Utc::now());
                    return Ok(());
                }

                // Already cloned (possibly by whoever held the lock before
                // us, possibly by a previous run of this process).
                let stale = {
                    let mut repos = self.repos.lock();
                    let entry = repos.entry(repo.clone()).or_insert_with(|| RepositoryState {
                        id: repo.clone(),
                        local_path: path.clone(),
                        last_fetch_at: None,
                        is_cloned: true,
                        active_worktrees: Default::default(),
                    });
                    entry.is_cloned = true;
                    match entry.last_fetch_at {
                        None => true,
                        Some(at) => {
                            let age = Utc::now().signed_duration_since(at);
                            age.to_std().map_or(true, |age| age > self.cache_timeout)
                        }
                    }
                };
                if force_update || stale {
                    self.git.fetch(&path).await?;
                    // Fast-forward the clone's checked-out branch too; new
                    // worktrees base off local branch names, not origin/*.
                    match self.git.current_branch(&path).await {
                        Ok(branch) => self
                            .git
                            .pull_branch(&path, &branch)
                            .await
                            .or_log_error("updating default branch after fetch"),
                        Err(e) => warn!("couldn't determine default branch of {}: {:#}", repo, e),
                    }
                    if let Some(entry) = self.repos.lock().get_mut(repo) {
                        entry.last_fetch_at = Some(Utc::now());
                    }
                } else {
                    debug!("clone of {} is fresh, skipping fetch", repo);
                }
                Ok(())
            })
            .await?;

        Ok(path)
    }

    // Bookkeeping only. The git worktree calls happen in WorkspaceManager;
    // this just tracks which paths hang off which clone so status can report
    // it and cleanup can sanity-check.
    pub fn add_worktree(&self, repo: &RepoId, path: &Path) {
        let mut repos = self.repos.lock();
        let local_path = self.local_path(repo);
        let entry = repos.entry(repo.clone()).or_insert_with(|| RepositoryState {
            id: repo.clone(),
            local_path,
            last_fetch_at: None,
            is_cloned: true,
            active_worktrees: Default::default(),
        });
        entry.active_worktrees.insert(path.to_owned());
    }

    pub fn remove_worktree(&self, repo: &RepoId, path: &Path) {
        if let Some(entry) = self.repos.lock().get_mut(repo) {
            entry.active_worktrees.remove(path);
        }
    }
}
