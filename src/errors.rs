use std::path::PathBuf;

use thiserror::Error;

// Broad classification of orchestration failures. This is deliberately a
// separate axis from the error type itself: callers almost never care which
// exact thing went wrong, they care whether to retry now, retry next tick,
// give up on the task, or give up on the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Retry locally with bounded attempts (lock contention, flaky network).
    Transient,
    // Surface to the planner, it will retry on its next tick.
    Recoverable,
    // The task is a lost cause for now; after enough of these the planner
    // sends its board item back to TODO.
    TerminalPerTask,
    // Abort the whole process.
    Fatal,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("timed out acquiring git lock for {repo_id} ({operation})")]
    LockAcquireTimeout { repo_id: String, operation: String },

    #[error("worker {worker_id} is busy")]
    WorkerBusy { worker_id: String },

    #[error("no available worker")]
    NoAvailableWorker,

    #[error("no worker holds task {task_id}")]
    NoWorkerForTask { task_id: String },

    #[error("developer did not finish within {timeout_ms}ms")]
    DeveloperTimeout { timeout_ms: u64 },

    #[error("developer subprocess failed: {reason}")]
    DeveloperCrashed { reason: String },

    #[error("workspace setup failed for task {task_id}: {reason}")]
    WorkspaceSetup { task_id: String, reason: String },

    #[error("malformed repository id {0:?} (want \"owner/name\")")]
    MalformedRepoId(String),

    #[error("state file {path} is corrupted: {source}")]
    CorruptStateFile {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Misconfigured(String),

    #[error("git operation failed: {0}")]
    Git(anyhow::Error),

    #[error("provider API error: {0}")]
    Provider(anyhow::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        use OrchestratorError::*;
        match self {
            LockAcquireTimeout { .. } | Git(_) | Provider(_) => ErrorKind::Transient,
            WorkerBusy { .. }
            | NoAvailableWorker
            | NoWorkerForTask { .. }
            | DeveloperTimeout { .. } => ErrorKind::Recoverable,
            DeveloperCrashed { .. } | WorkspaceSetup { .. } => ErrorKind::TerminalPerTask,
            MalformedRepoId(_) | CorruptStateFile { .. } | Misconfigured(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// Most plumbing hands around anyhow errors; when one reaches a decision point
// (retry? next tick? give up?) we dig the typed error back out. Anything that
// isn't one of ours gets the planner's default treatment: retry next tick.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<OrchestratorError>()
        .map(|e| e.kind())
        .unwrap_or(ErrorKind::Recoverable)
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(
        OrchestratorError::LockAcquireTimeout {
            repo_id: "a/b".into(),
            operation: "clone".into()
        },
        ErrorKind::Transient; "lock timeout is transient")]
    #[test_case(OrchestratorError::NoAvailableWorker, ErrorKind::Recoverable; "pool exhaustion is recoverable")]
    #[test_case(
        OrchestratorError::DeveloperCrashed { reason: "exit 1".into() },
        ErrorKind::TerminalPerTask; "crash is terminal per task")]
    #[test_case(
        OrchestratorError::Misconfigured("max_workers < min_workers".into()),
        ErrorKind::Fatal; "misconfiguration is fatal")]
    fn test_kinds(err: OrchestratorError, want: ErrorKind) {
        assert_that!(err.kind(), eq(want));
    }

    #[googletest::test]
    fn test_display_names_the_key() {
        let err = OrchestratorError::LockAcquireTimeout {
            repo_id: "octo/website".into(),
            operation: "worktree".into(),
        };
        expect_that!(err.to_string(), contains_substring("octo/website"));
        expect_that!(err.to_string(), contains_substring("worktree"));
    }
}
