use std::{
    collections::BTreeMap,
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::{
    errors::OrchestratorError,
    model::{PlannerState, Task, TaskId, WorkerId, WorkerRecord, WorkspaceInfo},
};

// Owner of every durable record. Implementations must make each mutation
// visible to a subsequent crash-restart (that's the whole point); the JSON
// implementation below does that by rewriting the relevant snapshot file on
// every mutation, atomically.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn list_tasks(&self) -> Vec<Task>;
    async fn get_task(&self, id: &TaskId) -> Option<Task>;
    async fn upsert_task(&self, task: Task) -> anyhow::Result<()>;
    async fn remove_task(&self, id: &TaskId) -> anyhow::Result<()>;
    // The processed set only ever grows. updated_at moves with it.
    async fn mark_comments_processed(
        &self,
        id: &TaskId,
        comment_ids: &[String],
    ) -> anyhow::Result<()>;

    async fn list_workers(&self) -> Vec<WorkerRecord>;
    async fn save_worker(&self, record: WorkerRecord) -> anyhow::Result<()>;
    async fn remove_worker(&self, id: &WorkerId) -> anyhow::Result<()>;

    async fn list_workspaces(&self) -> Vec<WorkspaceInfo>;
    async fn get_workspace(&self, task_id: &TaskId) -> Option<WorkspaceInfo>;
    async fn save_workspace(&self, info: WorkspaceInfo) -> anyhow::Result<()>;
    async fn remove_workspace(&self, task_id: &TaskId) -> anyhow::Result<()>;

    async fn load_planner_state(&self) -> PlannerState;
    async fn save_planner_state(&self, state: PlannerState) -> anyhow::Result<()>;
}

const TASKS_FILE: &str = "tasks.json";
const WORKERS_FILE: &str = "workers.json";
const WORKSPACES_FILE: &str = "workspaces.json";
const PLANNER_FILE: &str = "planner-state.json";

// Write-tmp-then-rename. The tempfile lives in the destination directory so
// the rename can't cross filesystems.
fn write_atomically<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("state file {:?} has no parent dir", path))?;
    let mut tmp = NamedTempFile::new_in(dir).context("creating temp state file")?;
    serde_json::to_writer_pretty(&mut tmp, value).context("serializing state")?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all().context("syncing state file")?;
    tmp.persist(path)
        .with_context(|| format!("renaming into {:?}", path))?;
    Ok(())
}

// Missing file means first run: empty state. Unparseable file means the
// snapshot is damaged, and limping on would silently orphan workers and
// workspaces, so that's fatal.
fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    match std::fs::read_to_string(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("reading state file {:?}", path)),
        Ok(content) => serde_json::from_str(&content).map_err(|source| {
            OrchestratorError::CorruptStateFile {
                path: path.to_owned(),
                source,
            }
            .into()
        }),
    }
}

// Snapshot-file-backed store. Records live in memory, keyed maps for cheap
// lookup; every mutation rewrites the owning file before returning. The
// per-collection mutexes serialise writers so two mutations can't interleave
// their map-update and file-write steps.
pub struct JsonStateStore {
    data_dir: PathBuf,
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    workers: Mutex<BTreeMap<WorkerId, WorkerRecord>>,
    workspaces: Mutex<BTreeMap<TaskId, WorkspaceInfo>>,
    planner: Mutex<PlannerState>,
}

impl JsonStateStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {:?}", data_dir))?;

        let tasks: Vec<Task> = read_or_default(&data_dir.join(TASKS_FILE))?;
        let workers: Vec<WorkerRecord> = read_or_default(&data_dir.join(WORKERS_FILE))?;
        let workspaces: Vec<WorkspaceInfo> = read_or_default(&data_dir.join(WORKSPACES_FILE))?;
        let planner: PlannerState = read_or_default(&data_dir.join(PLANNER_FILE))?;

        info!(
            "loaded state: {} tasks, {} workers, {} workspaces",
            tasks.len(),
            workers.len(),
            workspaces.len()
        );

        Ok(Self {
            data_dir,
            tasks: Mutex::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
            workers: Mutex::new(workers.into_iter().map(|w| (w.id.clone(), w)).collect()),
            workspaces: Mutex::new(
                workspaces
                    .into_iter()
                    .map(|w| (w.task_id.clone(), w))
                    .collect(),
            ),
            planner: Mutex::new(planner),
        })
    }

    fn flush_tasks(&self, tasks: &BTreeMap<TaskId, Task>) -> anyhow::Result<()> {
        let list: Vec<&Task> = tasks.values().collect();
        write_atomically(&self.data_dir.join(TASKS_FILE), &list)
    }

    fn flush_workers(&self, workers: &BTreeMap<WorkerId, WorkerRecord>) -> anyhow::Result<()> {
        let list: Vec<&WorkerRecord> = workers.values().collect();
        write_atomically(&self.data_dir.join(WORKERS_FILE), &list)
    }

    fn flush_workspaces(
        &self,
        workspaces: &BTreeMap<TaskId, WorkspaceInfo>,
    ) -> anyhow::Result<()> {
        let list: Vec<&WorkspaceInfo> = workspaces.values().collect();
        write_atomically(&self.data_dir.join(WORKSPACES_FILE), &list)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().await.get(id).cloned()
    }

    async fn upsert_task(&self, task: Task) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id.clone(), task);
        self.flush_tasks(&tasks)
    }

    async fn remove_task(&self, id: &TaskId) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.remove(id).is_some() {
            self.flush_tasks(&tasks)?;
        }
        Ok(())
    }

    async fn mark_comments_processed(
        &self,
        id: &TaskId,
        comment_ids: &[String],
    ) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .with_context(|| format!("no task {} to mark comments on", id))?;
        task.processed_comment_ids
            .extend(comment_ids.iter().cloned());
        task.updated_at = Utc::now();
        self.flush_tasks(&tasks)
    }

    async fn list_workers(&self) -> Vec<WorkerRecord> {
        self.workers.lock().await.values().cloned().collect()
    }

    async fn save_worker(&self, record: WorkerRecord) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().await;
        workers.insert(record.id.clone(), record);
        self.flush_workers(&workers)
    }

    async fn remove_worker(&self, id: &WorkerId) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.remove(id).is_some() {
            self.flush_workers(&workers)?;
        }
        Ok(())
    }

    async fn list_workspaces(&self) -> Vec<WorkspaceInfo> {
        self.workspaces.lock().await.values().cloned().collect()
    }

    async fn get_workspace(&self, task_id: &TaskId) -> Option<WorkspaceInfo> {
        self.workspaces.lock().await.get(task_id).cloned()
    }

    async fn save_workspace(&self, info: WorkspaceInfo) -> anyhow::Result<()> {
        let mut workspaces = self.workspaces.lock().await;
        workspaces.insert(info.task_id.clone(), info);
        self.flush_workspaces(&workspaces)
    }

    async fn remove_workspace(&self, task_id: &TaskId) -> anyhow::Result<()> {
        let mut workspaces = self.workspaces.lock().await;
        if workspaces.remove(task_id).is_some() {
            self.flush_workspaces(&workspaces)?;
        }
        Ok(())
    }

    async fn load_planner_state(&self) -> PlannerState {
        self.planner.lock().await.clone()
    }

    async fn save_planner_state(&self, state: PlannerState) -> anyhow::Result<()> {
        let mut planner = self.planner.lock().await;
        *planner = state;
        write_atomically(&self.data_dir.join(PLANNER_FILE), &*planner)
    }
}

// All the semantics, none of the files. What the tests inject.
#[derive(Default)]
pub struct InMemoryStateStore {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    workers: Mutex<BTreeMap<WorkerId, WorkerRecord>>,
    workspaces: Mutex<BTreeMap<TaskId, WorkspaceInfo>>,
    planner: Mutex<PlannerState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().await.get(id).cloned()
    }

    async fn upsert_task(&self, task: Task) -> anyhow::Result<()> {
        self.tasks.lock().await.insert(task.id.clone(), task);
        Ok(())
    }

    async fn remove_task(&self, id: &TaskId) -> anyhow::Result<()> {
        self.tasks.lock().await.remove(id);
        Ok(())
    }

    async fn mark_comments_processed(
        &self,
        id: &TaskId,
        comment_ids: &[String],
    ) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .with_context(|| format!("no task {} to mark comments on", id))?;
        task.processed_comment_ids
            .extend(comment_ids.iter().cloned());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn list_workers(&self) -> Vec<WorkerRecord> {
        self.workers.lock().await.values().cloned().collect()
    }

    async fn save_worker(&self, record: WorkerRecord) -> anyhow::Result<()> {
        self.workers.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn remove_worker(&self, id: &WorkerId) -> anyhow::Result<()> {
        self.workers.lock().await.remove(id);
        Ok(())
    }

    async fn list_workspaces(&self) -> Vec<WorkspaceInfo> {
        self.workspaces.lock().await.values().cloned().collect()
    }

    async fn get_workspace(&self, task_id: &TaskId) -> Option<WorkspaceInfo> {
        self.workspaces.lock().await.get(task_id).cloned()
    }

    async fn save_workspace(&self, info: WorkspaceInfo) -> anyhow::Result<()> {
        self.workspaces
            .lock()
            .await
            .insert(info.task_id.clone(), info);
        Ok(())
    }

    async fn remove_workspace(&self, task_id: &TaskId) -> anyhow::Result<()> {
        self.workspaces.lock().await.remove(task_id);
        Ok(())
    }

    async fn load_planner_state(&self) -> PlannerState {
        self.planner.lock().await.clone()
    }

    async fn save_planner_state(&self, state: PlannerState) -> anyhow::Result<()> {
        *self.planner.lock().await = state;
        Ok(())
    }
}
