use core::fmt;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    path::PathBuf,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

// My attempt at newtypery for the various opaque IDs floating around this
// system. Tasks, workers and repositories all get identified by strings that
// come from outside; mixing them up compiles fine and then routes someone
// else's pull request, so we don't pass bare Strings around.

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// "owner/name" on the code host. Parsing is the only way to construct one, so
// holding a RepoId means the shape already checked out.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoId {
    owner: String,
    name: String,
}

impl RepoId {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepoId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    owner: owner.to_owned(),
                    name: name.to_owned(),
                })
            }
            _ => Err(OrchestratorError::MalformedRepoId(s.to_owned())),
        }
    }
}

impl TryFrom<String> for RepoId {
    type Error = OrchestratorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RepoId> for String {
    fn from(r: RepoId) -> String {
        r.to_string()
    }
}

impl Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

// Board lanes. These double as the status of our internal Task records since
// the planner's whole job is keeping the two in sync.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "TODO",
            Self::InProgress => "IN_PROGRESS",
            Self::InReview => "IN_REVIEW",
            Self::Done => "DONE",
        };
        write!(f, "{}", s)
    }
}

// A unit of work as we track it, created the first time the planner sees a
// TODO board item it doesn't know about. Only the state store mutates these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub assigned_worker_id: Option<WorkerId>,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    // Grows monotonically; a comment id in here is never fed to a developer
    // again. BTreeSet so snapshots serialize in a stable order.
    #[serde(default)]
    pub processed_comment_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Waiting,
    Working,
    Stopped,
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Waiting => "WAITING",
            Self::Working => "WORKING",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerAction {
    StartNewTask,
    ResumeTask,
    ProcessFeedback,
    MergeRequest,
}

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeveloperType {
    Claude,
    Gemini,
    Mock,
}

impl Display for DeveloperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Mock => "mock",
        };
        write!(f, "{}", s)
    }
}

// The assignment a worker is holding. Immutable once handed over; a feedback
// round replaces the whole thing rather than mutating it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: TaskId,
    pub action: WorkerAction,
    pub repository_id: RepoId,
    pub board_item: ProjectBoardItem,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub comments: Vec<PrComment>,
    pub assigned_at: DateTime<Utc>,
}

// The persisted face of a worker. The live Worker object in the pool is
// rebuilt from one of these on startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task: Option<WorkerTask>,
    pub workspace_dir: PathBuf,
    pub developer_type: DeveloperType,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    // How many times the recovery sweeper has re-dispatched this worker's
    // current task. Bounded; see WorkerPool::recover_stopped_workers.
    #[serde(default)]
    pub recovery_attempts: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub task_id: TaskId,
    pub repository_id: RepoId,
    pub workspace_dir: PathBuf,
    pub branch_name: String,
    pub worktree_created: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryState {
    pub id: RepoId,
    pub local_path: PathBuf,
    #[serde(default)]
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub is_cloned: bool,
    #[serde(default)]
    pub active_worktrees: BTreeSet<PathBuf>,
}

// Planner bookkeeping that has to survive restarts. Notably the per-task
// comment cursors: lose one of those and the next tick re-feeds a PR's whole
// comment history to a developer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlannerState {
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_tasks: BTreeSet<TaskId>,
    #[serde(default)]
    pub active_tasks: BTreeSet<TaskId>,
    #[serde(default)]
    pub comment_cursors: BTreeMap<TaskId, DateTime<Utc>>,
    #[serde(default)]
    pub recent_errors: Vec<PlannerErrorEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannerErrorEntry {
    pub at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub message: String,
}

// Read-only projection of a board item. We never write through this type;
// mutations go via ProjectBoardService.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectBoardItem {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub pull_request_urls: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProjectBoardItem {
    // Which repository this item wants work done in. The board doesn't have a
    // first-class field for this so it travels in metadata.
    pub fn repository(&self) -> Option<&str> {
        self.metadata.get("repository").map(String::as_str)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub repository_id: RepoId,
    pub number: u64,
    pub url: String,
    pub title: String,
    pub author: String,
    pub state: PrState,
    #[serde(default)]
    pub base_branch: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrReview {
    pub reviewer: String,
    pub state: ReviewState,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrComment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// What the planner asks the router to do.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestAction {
    StartNewTask,
    CheckStatus,
    ProcessFeedback,
    RequestMerge,
}

#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub action: RequestAction,
    pub repository_id: RepoId,
    pub board_item: ProjectBoardItem,
    pub pull_request_url: Option<String>,
    pub comments: Vec<PrComment>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResponseStatus {
    Accepted,
    Rejected,
    Completed,
    InProgress,
    Error,
}

#[derive(Clone, Debug)]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub status: ResponseStatus,
    pub message: Option<String>,
    pub pull_request_url: Option<String>,
}

impl TaskResponse {
    pub fn accepted(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Accepted,
            message: None,
            pull_request_url: None,
        }
    }

    pub fn rejected(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Rejected,
            message: Some(reason.into()),
            pull_request_url: None,
        }
    }

    pub fn completed(task_id: TaskId, pull_request_url: Option<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Completed,
            message: None,
            pull_request_url,
        }
    }

    pub fn in_progress(task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::InProgress,
            message: Some(message.into()),
            pull_request_url: None,
        }
    }

    pub fn error(task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Error,
            message: Some(message.into()),
            pull_request_url: None,
        }
    }
}

// What came back from one developer invocation, parsed out of the raw
// transcript by developer::parse_transcript.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeveloperOutput {
    pub raw_output: String,
    pub result: DeveloperResult,
    #[serde(default)]
    pub executed_commands: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<PathBuf>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeveloperResult {
    pub success: bool,
    #[serde(default)]
    pub pr_link: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}


#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("octo/website", true; "plain")]
    #[test_case("octo/web.site", true; "dots are fine")]
    #[test_case("noslash", false; "missing slash")]
    #[test_case("/name", false; "empty owner")]
    #[test_case("owner/", false; "empty name")]
    #[test_case("a/b/c", false; "too many segments")]
    fn test_repo_id_parse(input: &str, ok: bool) {
        assert_that!(input.parse::<RepoId>().is_ok(), eq(ok));
    }

    #[googletest::test]
    fn test_repo_id_round_trips_through_serde() {
        let repo: RepoId = "octo/website".parse().unwrap();
        let json = serde_json::to_string(&repo).unwrap();
        assert_that!(json, eq("\"octo/website\""));
        let back: RepoId = serde_json::from_str(&json).unwrap();
        assert_that!(back, eq(&repo));
    }

    #[googletest::test]
    fn test_task_status_wire_format() {
        // The board speaks SCREAMING_SNAKE, make sure we do too.
        assert_that!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            eq("\"IN_PROGRESS\"")
        );
        assert_that!(
            serde_json::from_str::<TaskStatus>("\"IN_REVIEW\"").unwrap(),
            eq(TaskStatus::InReview)
        );
    }

    #[googletest::test]
    fn test_board_item_repository_from_metadata() {
        let item = test_utils::board_item("item-1", TaskStatus::Todo);
        assert_that!(item.repository(), some(eq("octo/website")));
    }

    // The persisted records have to survive a serialize/deserialize cycle
    // bit-for-bit; this is what restart recovery leans on.
    #[googletest::test]
    fn test_worker_record_round_trip() {
        let record = WorkerRecord {
            id: WorkerId::new("worker-3"),
            status: WorkerStatus::Waiting,
            current_task: Some(WorkerTask {
                task_id: TaskId::new("item-1"),
                action: WorkerAction::ProcessFeedback,
                repository_id: "octo/website".parse().unwrap(),
                board_item: test_utils::board_item("item-1", TaskStatus::InReview),
                pull_request_url: Some("https://github.com/octo/website/pull/42".to_owned()),
                comments: vec![test_utils::comment("c9", "alice", "nit")],
                assigned_at: test_utils::some_time(),
            }),
            workspace_dir: "/data/work/item-1".into(),
            developer_type: DeveloperType::Claude,
            created_at: test_utils::some_time(),
            last_active_at: test_utils::some_time(),
            recovery_attempts: 1,
        };
        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: WorkerRecord = serde_json::from_str(&json).unwrap();
        pretty_assertions::assert_eq!(serde_json::to_string_pretty(&back).unwrap(), json);
        assert_that!(back.current_task.unwrap().comments, len(eq(1)));
    }

    // Old snapshots may lack newer optional fields; they must still load.
    #[googletest::test]
    fn test_workspace_info_defaults_tolerated() {
        let json = r#"{
            "task_id": "item-1",
            "repository_id": "octo/website",
            "workspace_dir": "/data/work/item-1",
            "branch_name": "task/item-1",
            "worktree_created": false,
            "created_at": "2024-05-04T12:00:00Z"
        }"#;
        let info: WorkspaceInfo = serde_json::from_str(json).unwrap();
        assert_that!(info.branch_name, eq("task/item-1"));

        let json = r#"{"id": "item-1", "title": "t", "status": "TODO",
                       "created_at": "2024-05-04T12:00:00Z",
                       "updated_at": "2024-05-04T12:00:00Z"}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_that!(task.processed_comment_ids, empty());
        assert_that!(task.pull_request_url, none());
    }
}
