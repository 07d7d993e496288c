use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    process::Stdio,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use tokio::{process::Command, time::timeout};

use crate::{
    config::Config,
    errors::OrchestratorError,
    model::{DeveloperOutput, DeveloperResult, DeveloperType},
    process::terminate_group,
};

// How long a SIGTERMed developer gets to die before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Developer: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;

    // One full run of the developer against a workspace. Returning Ok with
    // result.success == false means the developer ran and failed; Err means
    // we couldn't run it properly at all (spawn failure, timeout).
    async fn execute_prompt(
        &self,
        prompt: &str,
        workspace_dir: &Path,
    ) -> anyhow::Result<DeveloperOutput>;

    // Terminate anything the developer left running.
    async fn cleanup(&self);

    async fn is_available(&self) -> bool;

    fn set_timeout(&self, timeout: Duration);

    fn developer_type(&self) -> DeveloperType;
}

// Constructs the configured developer. One instance per worker; they share
// nothing, so a hung subprocess only ever poisons its own worker.
pub fn create_developer(config: &Config) -> anyhow::Result<Arc<dyn Developer>> {
    match config.developer_type {
        DeveloperType::Mock => Ok(Arc::new(MockDeveloper::new())),
        kind @ (DeveloperType::Claude | DeveloperType::Gemini) => {
            let argv = match &config.developer_command {
                Some(argv) if !argv.is_empty() => argv.clone(),
                Some(_) => anyhow::bail!("developer_command must not be empty"),
                None => default_argv(kind),
            };
            Ok(Arc::new(CliDeveloper::new(
                kind,
                argv,
                config.developer_timeout(),
            )))
        }
    }
}

fn default_argv(kind: DeveloperType) -> Vec<String> {
    let argv: &[&str] = match kind {
        DeveloperType::Claude => &["claude", "-p", "--dangerously-skip-permissions"],
        DeveloperType::Gemini => &["gemini", "--yolo", "-p"],
        DeveloperType::Mock => unreachable!("mock has no argv"),
    };
    argv.iter().map(|s| s.to_string()).collect()
}

// Developer backed by an actual code-generation CLI. The prompt is appended
// as the final argument and the process runs in the workspace, in its own
// process group so a timeout can take out the whole tree.
pub struct CliDeveloper {
    kind: DeveloperType,
    argv: Vec<String>,
    timeout: Mutex<Duration>,
    // pids of in-flight subprocesses, for cleanup().
    active_pids: Mutex<HashSet<u32>>,
}

impl CliDeveloper {
    pub fn new(kind: DeveloperType, argv: Vec<String>, run_timeout: Duration) -> Self {
        assert!(!argv.is_empty());
        Self {
            kind,
            argv,
            timeout: Mutex::new(run_timeout),
            active_pids: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl Developer for CliDeveloper {
    async fn initialize(&self) -> anyhow::Result<()> {
        if !self.is_available().await {
            anyhow::bail!("developer CLI {:?} not runnable", self.argv[0]);
        }
        Ok(())
    }

    async fn execute_prompt(
        &self,
        prompt: &str,
        workspace_dir: &Path,
    ) -> anyhow::Result<DeveloperOutput> {
        let run_timeout = *self.timeout.lock();
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .arg(prompt)
            .current_dir(workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.process_group(0);

        info!(
            "running {} developer in {:?} (timeout {:?})",
            self.kind, workspace_dir, run_timeout
        );
        let child = cmd
            .spawn()
            .with_context(|| format!("spawning developer {:?}", self.argv[0]))?;
        let pid = child.id().context("developer child already reaped")?;
        self.active_pids.lock().insert(pid);

        let result = timeout(run_timeout, child.wait_with_output()).await;
        self.active_pids.lock().remove(&pid);

        match result {
            Err(_) => {
                // The child is still out there; dropping the future didn't
                // signal it. Kill the whole group so shells and helpers it
                // forked die with it.
                warn!("developer timed out after {:?}, killing group {}", run_timeout, pid);
                terminate_group(pid, SHUTDOWN_GRACE).await;
                Err(OrchestratorError::DeveloperTimeout {
                    timeout_ms: run_timeout.as_millis() as u64,
                }
                .into())
            }
            Ok(Err(e)) => Err(OrchestratorError::DeveloperCrashed {
                reason: format!("waiting for developer subprocess: {}", e),
            }
            .into()),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let mut parsed = parse_transcript(&stdout);
                if !output.status.success() {
                    parsed.result.success = false;
                    // Keep the tail; developer CLIs love to dump their whole
                    // world on the way down and the start is rarely the
                    // interesting bit.
                    let tail: String = stderr.chars().rev().take(2000).collect::<Vec<_>>()
                        .into_iter().rev().collect();
                    parsed.result.error = Some(format!(
                        "developer exited with {:?}: {}",
                        output.status.code(),
                        tail.trim()
                    ));
                }
                parsed
                    .metadata
                    .insert("developer_type".to_owned(), self.kind.to_string());
                Ok(parsed)
            }
        }
    }

    async fn cleanup(&self) {
        let pids: Vec<u32> = self.active_pids.lock().iter().copied().collect();
        for pid in pids {
            info!("cleanup: terminating developer process group {}", pid);
            terminate_group(pid, SHUTDOWN_GRACE).await;
        }
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.argv[0])
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn set_timeout(&self, run_timeout: Duration) {
        *self.timeout.lock() = run_timeout;
    }

    fn developer_type(&self) -> DeveloperType {
        self.kind
    }
}

static PR_LINK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+/pull/\d+").unwrap());
static COMMIT_HASH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{40}\b").unwrap());
static MODIFIED_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // Two shapes show up in practice: "modified: path" out of git status, and
    // "+++ b/path" out of diffs.
    Regex::new(r"(?m)^\s*(?:modified:\s+(\S+)|\+\+\+ b/(\S+))").unwrap()
});

// Scrape the interesting facts out of a raw developer transcript. All
// heuristic: the transcript is free-form text, these are just the patterns
// the CLIs reliably emit.
pub fn parse_transcript(raw: &str) -> DeveloperOutput {
    let pr_link = PR_LINK_REGEX
        .find(raw)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_owned());
    let commit_hash = COMMIT_HASH_REGEX.find(raw).map(|m| m.as_str().to_owned());

    let executed_commands: Vec<String> = raw
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("$ "))
        .map(|cmd| cmd.trim().to_owned())
        .filter(|cmd| !cmd.is_empty())
        .collect();

    let mut modified_files: Vec<std::path::PathBuf> = Vec::new();
    for captures in MODIFIED_FILE_REGEX.captures_iter(raw) {
        if let Some(m) = captures.get(1).or_else(|| captures.get(2)) {
            let path = std::path::PathBuf::from(m.as_str());
            if !modified_files.contains(&path) {
                modified_files.push(path);
            }
        }
    }

    DeveloperOutput {
        raw_output: raw.to_owned(),
        result: DeveloperResult {
            success: true,
            pr_link,
            commit_hash,
            error: None,
        },
        executed_commands,
        modified_files,
        metadata: Default::default(),
    }
}

// Scriptable fake for tests and for `provider = "mock"` smoke runs. Each
// queued behaviour feeds one execute_prompt call; an empty queue succeeds
// with a synthesized PR link.
pub struct MockDeveloper {
    prompts: Mutex<Vec<String>>,
    script: Mutex<VecDeque<MockBehavior>>,
    timeout: Mutex<Duration>,
}

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Succeed { pr_link: Option<String> },
    Fail { error: String },
    // Sleeps past any reasonable test timeout to exercise the timeout path.
    Hang,
}

impl Default for MockDeveloper {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDeveloper {
    pub fn new() -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            timeout: Mutex::new(Duration::from_secs(600)),
        }
    }

    pub fn enqueue(&self, behavior: MockBehavior) {
        self.script.lock().push_back(behavior);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Developer for MockDeveloper {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute_prompt(
        &self,
        prompt: &str,
        _workspace_dir: &Path,
    ) -> anyhow::Result<DeveloperOutput> {
        self.prompts.lock().push(prompt.to_owned());
        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockBehavior::Succeed { pr_link: None });
        match behavior {
            MockBehavior::Succeed { pr_link } => {
                let pr_link = pr_link
                    .or_else(|| Some("https://github.com/octo/website/pull/42".to_owned()));
                Ok(DeveloperOutput {
                    raw_output: "mock run complete".to_owned(),
                    result: DeveloperResult {
                        success: true,
                        pr_link,
                        commit_hash: None,
                        error: None,
                    },
                    ..Default::default()
                })
            }
            MockBehavior::Fail { error } => Ok(DeveloperOutput {
                raw_output: format!("mock failure: {}", error),
                result: DeveloperResult {
                    success: false,
                    pr_link: None,
                    commit_hash: None,
                    error: Some(error),
                },
                ..Default::default()
            }),
            MockBehavior::Hang => {
                let run_timeout = *self.timeout.lock();
                tokio::time::sleep(run_timeout.saturating_add(Duration::from_secs(3600))).await;
                Err(OrchestratorError::DeveloperTimeout {
                    timeout_ms: run_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    async fn cleanup(&self) {}

    async fn is_available(&self) -> bool {
        true
    }

    fn set_timeout(&self, run_timeout: Duration) {
        *self.timeout.lock() = run_timeout;
    }

    fn developer_type(&self) -> DeveloperType {
        DeveloperType::Mock
    }
}
