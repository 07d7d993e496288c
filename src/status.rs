use std::io::Write;

use anyhow::Context as _;
use colored::Colorize;
use itertools::Itertools as _;

use crate::{
    model::{PlannerState, Task, TaskStatus, WorkerRecord, WorkerStatus},
    store::StateStore,
};

// Point-in-time view of everything the snapshots know, for the `status`
// subcommand. Built from persisted state rather than live objects so it works
// whether or not a `run` process is active.
pub struct StatusReport {
    workers: Vec<WorkerRecord>,
    tasks: Vec<Task>,
    planner: PlannerState,
}

impl StatusReport {
    pub async fn gather(store: &dyn StateStore) -> Self {
        Self {
            workers: store.list_workers().await,
            tasks: store.list_tasks().await,
            planner: store.load_planner_state().await,
        }
    }

    pub fn render(&self, out: &mut impl Write) -> anyhow::Result<()> {
        writeln!(out, "{}", "Workers".bold())?;
        if self.workers.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for worker in self.workers.iter().sorted_by_key(|w| w.id.clone()) {
            let status = match worker.status {
                WorkerStatus::Idle => "IDLE".green(),
                WorkerStatus::Waiting => "WAITING".yellow(),
                WorkerStatus::Working => "WORKING".blue(),
                WorkerStatus::Stopped => "STOPPED".red(),
            };
            let task = worker
                .current_task
                .as_ref()
                .map(|t| format!(" task={} ({:?})", t.task_id, t.action))
                .unwrap_or_default();
            writeln!(
                out,
                "  {} [{}] {}{} last active {}",
                worker.id, worker.developer_type, status, task, worker.last_active_at
            )?;
        }

        writeln!(out, "{}", "Tasks".bold())?;
        if self.tasks.is_empty() {
            writeln!(out, "  (none)")?;
        }
        for task in self.tasks.iter().sorted_by_key(|t| t.id.clone()) {
            let status = match task.status {
                TaskStatus::Todo => "TODO".normal(),
                TaskStatus::InProgress => "IN_PROGRESS".yellow(),
                TaskStatus::InReview => "IN_REVIEW".blue(),
                TaskStatus::Done => "DONE".green(),
            };
            let pr = task
                .pull_request_url
                .as_deref()
                .map(|url| format!(" {}", url))
                .unwrap_or_default();
            writeln!(
                out,
                "  {} [{}]{} ({} comments processed)",
                task.id,
                status,
                pr,
                task.processed_comment_ids.len()
            )?;
        }

        writeln!(out, "{}", "Planner".bold())?;
        writeln!(
            out,
            "  last sync: {}",
            self.planner
                .last_sync_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_owned())
        )?;
        writeln!(
            out,
            "  active: {}  done: {}",
            self.planner.active_tasks.len(),
            self.planner.processed_tasks.len()
        )?;
        if !self.planner.recent_errors.is_empty() {
            writeln!(out, "  {}", "recent errors:".red())?;
            for entry in &self.planner.recent_errors {
                let task = entry
                    .task_id
                    .as_ref()
                    .map(|t| format!("[{}] ", t))
                    .unwrap_or_default();
                writeln!(out, "    {} {}{}", entry.at.to_rfc3339(), task, entry.message)?;
            }
        }
        out.flush().context("flushing status output")?;
        Ok(())
    }
}
