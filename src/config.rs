use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context as _;
use directories::ProjectDirs;
#[allow(unused_imports)]
use log::debug;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::{
    comments::DEFAULT_ALLOWED_BOTS,
    errors::{OrchestratorError, OrchestratorResult},
    model::{DeveloperType, RepoId},
    providers::ProviderKind,
};

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identifier of the project board to reconcile against.
    pub board_id: String,
    /// Which provider adapters to construct for the board and PR services.
    #[serde(default)]
    pub provider: ProviderKind,
    /// Repository ("owner/name") used for board items that don't carry one in
    /// their metadata.
    #[serde(default)]
    pub repository: Option<String>,
    /// If nonempty, board items resolving to repositories not in this list
    /// are skipped (with a warning).
    #[serde(default)]
    pub repository_filter: Vec<String>,
    /// Where clones and per-task worktrees live.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Where state snapshots and the pid file live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_git_binary")]
    pub git_binary: PathBuf,
    /// Base URL that "owner/name" gets appended to when cloning.
    #[serde(default = "default_remote_base")]
    pub remote_base: String,
    #[serde(default = "default_developer_type")]
    pub developer_type: DeveloperType,
    /// Override for the developer CLI invocation. The prompt file path gets
    /// appended as the final argument.
    #[serde(default)]
    pub developer_command: Option<Vec<String>>,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Idle eviction never shrinks the pool below this.
    #[serde(default = "default_min_persistent_workers")]
    pub min_persistent_workers: usize,
    /// Workers idle longer than this get destroyed (subject to
    /// min_persistent_workers).
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    /// How long a STOPPED worker sits before the recovery sweeper re-dispatches
    /// its task.
    #[serde(default = "default_worker_recovery_timeout_ms")]
    pub worker_recovery_timeout_ms: u64,
    #[serde(default = "default_git_operation_timeout_ms")]
    pub git_operation_timeout_ms: u64,
    /// A clone younger than this is not re-fetched by ensure_repository.
    #[serde(default = "default_repository_cache_timeout_ms")]
    pub repository_cache_timeout_ms: u64,
    /// Age past which a held git lock is considered leaked and reclaimed.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Hard deadline for one developer subprocess invocation. On expiry the
    /// process group is SIGTERMed, then SIGKILLed after a grace period.
    #[serde(default = "default_developer_timeout_ms")]
    pub developer_timeout_ms: u64,
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,
    /// Bot authors whose PR comments are still fed back to developers.
    #[serde(default = "default_allowed_bots")]
    pub allowed_bots: Vec<String>,
    /// After this many terminal failures on one task the planner sends its
    /// board item back to TODO.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "foreman")
}

fn default_workspace_root() -> PathBuf {
    project_dirs()
        .map(|d| d.data_local_dir().join("workspaces"))
        .unwrap_or_else(|| PathBuf::from(".foreman/workspaces"))
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_local_dir().join("state"))
        .unwrap_or_else(|| PathBuf::from(".foreman/state"))
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_remote_base() -> String {
    "https://github.com".to_owned()
}

fn default_developer_type() -> DeveloperType {
    DeveloperType::Claude
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    5
}

fn default_min_persistent_workers() -> usize {
    1
}

fn default_idle_timeout_minutes() -> u64 {
    30
}

fn default_worker_recovery_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_git_operation_timeout_ms() -> u64 {
    60 * 1000
}

fn default_repository_cache_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_lock_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_developer_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_monitoring_interval_ms() -> u64 {
    30 * 1000
}

fn default_allowed_bots() -> Vec<String> {
    DEFAULT_ALLOWED_BOTS.iter().map(|s| s.to_string()).collect()
}

fn default_max_task_attempts() -> u32 {
    3
}

impl Config {
    pub fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.clone(),
            None => project_dirs()
                .map(|d| d.config_dir().join("config.toml"))
                .context("couldn't determine default config location")?,
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading config from {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    // All the "this can never work" checks. Failing here is fatal, the CLI
    // exits 1 before any component gets constructed.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.max_workers == 0 {
            return Err(OrchestratorError::Misconfigured(
                "max_workers must be at least 1".to_owned(),
            ));
        }
        if self.max_workers < self.min_workers {
            return Err(OrchestratorError::Misconfigured(format!(
                "max_workers ({}) < min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.min_persistent_workers > self.max_workers {
            return Err(OrchestratorError::Misconfigured(format!(
                "min_persistent_workers ({}) > max_workers ({})",
                self.min_persistent_workers, self.max_workers
            )));
        }
        if self.board_id.trim().is_empty() {
            return Err(OrchestratorError::Misconfigured(
                "board_id must not be empty".to_owned(),
            ));
        }
        if self.monitoring_interval_ms == 0 {
            return Err(OrchestratorError::Misconfigured(
                "monitoring_interval_ms must be nonzero".to_owned(),
            ));
        }
        // These are parsed for effect: a malformed entry should fail startup,
        // not get silently skipped forever at runtime.
        if let Some(repo) = &self.repository {
            repo.parse::<RepoId>()?;
        }
        for entry in &self.repository_filter {
            entry.parse::<RepoId>()?;
        }
        Ok(())
    }

    pub fn default_repository(&self) -> Option<RepoId> {
        // Validated at load time, so the parse can't fail here.
        self.repository.as_ref().and_then(|r| r.parse().ok())
    }

    pub fn repository_allowed(&self, repo: &RepoId) -> bool {
        self.repository_filter.is_empty()
            || self
                .repository_filter
                .iter()
                .any(|f| f == &repo.to_string())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn developer_timeout(&self) -> Duration {
        Duration::from_millis(self.developer_timeout_ms)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn worker_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_recovery_timeout_ms)
    }

    pub fn repository_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.repository_cache_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::path::Path;

    use super::*;

    // A config with short timeouts pointed at a temp directory. Most tests
    // want exactly this and then tweak a field or two.
    pub fn test_config(root: &Path) -> Config {
        let mut config: Config = toml::from_str("board_id = \"board-1\"").unwrap();
        config.workspace_root = root.join("workspaces");
        config.data_dir = root.join("state");
        config.repository = Some("octo/website".to_owned());
        config.developer_type = DeveloperType::Mock;
        config.monitoring_interval_ms = 50;
        config.lock_timeout_ms = 2000;
        config.worker_recovery_timeout_ms = 100;
        config.developer_timeout_ms = 5000;
        config
    }
}
