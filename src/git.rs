use std::path::{Path, PathBuf};
use std::process;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;

use crate::errors::OrchestratorError;
use crate::model::RepoId;
use crate::process::{CommandExt, OutputExt};

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a Command, that holds a semaphore for as long as the process
// exists. Just delegates enough methods to allow you to use it without
// letting you drop the semaphore until the process has terminated (which
// hopefully implies the stdio pipes have been closed...).
// This exists to try and avoid running into file descriptor exhaustion, without
// needing any retry logic that would risk creating livelocks.
#[derive(Debug)]
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    async fn output(&mut self) -> std::io::Result<process::Output> {
        self.command.output().await
    }
}

// Thin wrapper over the git binary. Knows nothing about locks or workspaces;
// RepositoryCache and WorkspaceManager are responsible for not calling this
// concurrently in ways git can't handle.
#[derive(Debug, Clone)]
pub struct GitService {
    git_binary: PathBuf,
    remote_base: String,
    operation_timeout: Duration,
}

impl GitService {
    pub fn new(
        git_binary: impl Into<PathBuf>,
        remote_base: impl Into<String>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            git_binary: git_binary.into(),
            remote_base: remote_base.into(),
            operation_timeout,
        }
    }

    // URL a repository gets cloned from. remote_base is normally a https://
    // host prefix but local paths work too, which is what the tests use.
    pub fn remote_url(&self, repo: &RepoId) -> String {
        format!("{}/{}", self.remote_base.trim_end_matches('/'), repo)
    }

    async fn git(&self, dir: Option<&Path>, args: Vec<String>) -> GitCommand {
        let mut cmd = Command::new(&self.git_binary);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(&args);
        // Separate process group means the child doesn't get SIGINT if the
        // user Ctrl-C's the terminal. We are trusting that git won't get stuck
        // and prevent us from shutting down.
        cmd.process_group(0);
        GitCommand {
            _permit: COMMAND_SEM.acquire().await.unwrap(),
            command: cmd,
        }
    }

    // Run a git command with the configured hard deadline. Git hanging on a
    // dead remote must not wedge a worker forever; the lock layer above us
    // would eventually "expire" the lock and then two gits would be fighting
    // over one repo.
    async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        what: &str,
    ) -> anyhow::Result<process::Output> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut cmd = self.git(dir, args).await;
        // Failures come back as the Git error kind so the planner treats them
        // as transient (retry next tick) rather than terminal for the task.
        match timeout(self.operation_timeout, cmd.execute()).await {
            Err(_) => Err(OrchestratorError::Git(anyhow!(
                "{} timed out after {:?}",
                what,
                self.operation_timeout
            ))
            .into()),
            Ok(result) => {
                result.map_err(|e| OrchestratorError::Git(e.context(what.to_owned())).into())
            }
        }
    }

    pub async fn clone_repository(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let dest_str = dest
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 clone destination {:?}", dest))?;
        info!("cloning {} into {:?}", url, dest);
        self.run(None, &["clone", url, dest_str], "'git clone' failed")
            .await?;
        Ok(())
    }

    pub async fn fetch(&self, repo_path: &Path) -> anyhow::Result<()> {
        debug!("fetching {:?}", repo_path);
        self.run(
            Some(repo_path),
            &["fetch", "--all", "--prune"],
            "'git fetch' failed",
        )
        .await?;
        Ok(())
    }

    pub async fn pull_branch(&self, repo_path: &Path, branch: &str) -> anyhow::Result<()> {
        self.run(
            Some(repo_path),
            &["pull", "origin", branch],
            "'git pull' failed",
        )
        .await?;
        Ok(())
    }

    // Add a worktree at worktree_path on a fresh branch. base None means
    // whatever HEAD is in the parent clone.
    pub async fn create_worktree(
        &self,
        repo_path: &Path,
        branch_name: &str,
        worktree_path: &Path,
        base_branch: Option<&str>,
    ) -> anyhow::Result<()> {
        let worktree_str = worktree_path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 worktree path {:?}", worktree_path))?;
        let mut args = vec!["worktree", "add", "-b", branch_name, worktree_str];
        if let Some(base) = base_branch {
            args.push(base);
        }
        info!(
            "adding worktree {:?} (branch {}, base {:?})",
            worktree_path, branch_name, base_branch
        );
        self.run(Some(repo_path), &args, "'git worktree add' failed")
            .await?;
        Ok(())
    }

    pub async fn remove_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
    ) -> anyhow::Result<()> {
        let worktree_str = worktree_path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 worktree path {:?}", worktree_path))?;
        // Double --force means remove it even if we were in the middle of
        // creating it.
        self.run(
            Some(repo_path),
            &["worktree", "remove", "--force", "--force", worktree_str],
            "'git worktree remove' failed",
        )
        .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo_path: &Path, branch: &str) -> anyhow::Result<()> {
        self.run(
            Some(repo_path),
            &["branch", "-D", branch],
            "'git branch -D' failed",
        )
        .await?;
        Ok(())
    }

    // Drop bookkeeping for worktrees whose directories are already gone.
    // Without this, a crashed cleanup leaves git refusing to reuse the path.
    pub async fn prune_worktrees(&self, repo_path: &Path) -> anyhow::Result<()> {
        self.run(
            Some(repo_path),
            &["worktree", "prune"],
            "'git worktree prune' failed",
        )
        .await?;
        Ok(())
    }

    pub async fn is_valid_repository(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        let mut cmd = self
            .git(
                Some(path),
                vec!["rev-parse".to_owned(), "--git-dir".to_owned()],
            )
            .await;
        match timeout(self.operation_timeout, cmd.output()).await {
            Err(_) => {
                warn!("'git rev-parse' timed out probing {:?}", path);
                false
            }
            Ok(Err(e)) => {
                warn!("couldn't run git to probe {:?}: {}", path, e);
                false
            }
            Ok(Ok(output)) => output.status.success(),
        }
    }

    // Branch currently checked out at path, for reconciling restored
    // workspace records against reality.
    pub async fn current_branch(&self, path: &Path) -> anyhow::Result<String> {
        let output = self
            .run(
                Some(path),
                &["rev-parse", "--abbrev-ref", "HEAD"],
                "'git rev-parse --abbrev-ref' failed",
            )
            .await?;
        // Sanity: exit code was checked by run().
        let _ = output.code_not_killed()?;
        Ok(String::from_utf8(output.stdout)
            .context("non utf-8 branch name")?
            .trim()
            .to_owned())
    }
}

#[cfg(test)]
pub mod test_utils {
    use tempfile::TempDir;

    use super::*;

    // Repository with one commit in a temporary directory, torn down on drop.
    #[derive(Debug)]
    pub struct TempRepo {
        temp_dir: TempDir,
        git: GitService,
    }

    impl TempRepo {
        pub async fn new() -> anyhow::Result<Self> {
            let temp_dir = TempDir::with_prefix("fixture-").expect("couldn't make tempdir");
            let git = GitService::new("git", "unused://", Duration::from_secs(30));
            let zelf = Self { temp_dir, git };
            zelf.run(&["init", "--initial-branch", "main"]).await?;
            zelf.commit("initial commit").await?;
            Ok(zelf)
        }

        pub fn path(&self) -> &Path {
            self.temp_dir.path()
        }

        pub fn git(&self) -> &GitService {
            &self.git
        }

        pub async fn run(&self, args: &[&str]) -> anyhow::Result<()> {
            self.git
                .run(Some(self.path()), args, "git fixture command failed")
                .await?;
            Ok(())
        }

        pub async fn commit(&self, message: &str) -> anyhow::Result<()> {
            self.run(&[
                "-c",
                "user.email=fixture@example.com",
                "-c",
                "user.name=Fixture",
                "commit",
                "--allow-empty",
                "-m",
                message,
            ])
            .await
        }

        pub async fn create_branch(&self, name: &str) -> anyhow::Result<()> {
            self.run(&["branch", name]).await
        }
    }

    // Initialize a single-commit repository at an exact path, for tests that
    // need a repo to sit where a remote_base/owner/name URL will resolve.
    pub async fn init_repo_at(git: &GitService, path: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(path).await?;
        git.run(
            None,
            &["init", "--initial-branch", "main", path.to_str().unwrap()],
            "'git init' failed",
        )
        .await?;
        git.run(
            Some(path),
            &[
                "-c",
                "user.email=fixture@example.com",
                "-c",
                "user.name=Fixture",
                "commit",
                "--allow-empty",
                "-m",
                "initial commit",
            ],
            "'git commit' failed",
        )
        .await?;
        Ok(())
    }
}
