use std::path::Path;

use anyhow::Context as _;
use indoc::formatdoc;
use itertools::Itertools as _;
#[allow(unused_imports)]
use log::{debug, info};

use crate::model::{WorkerAction, WorkerTask};

// Above this, comment feedback moves out of the prompt into indexed context
// files in the workspace. Developer CLIs cope badly with giant argv-sized
// prompts, and the transcript stays readable this way.
const MAX_INLINE_CONTEXT: usize = 8 * 1024;

const CONTEXT_DIR: &str = ".foreman";

fn task_header(task: &WorkerTask) -> String {
    formatdoc! {"
        Repository: {repo}
        Task: {id} - {title}
        ",
        repo = task.repository_id,
        id = task.task_id,
        title = task.board_item.title,
    }
}

fn describe_item(task: &WorkerTask) -> String {
    match task.board_item.metadata.get("description") {
        Some(description) => format!("Description:\n{}\n", description),
        None => String::new(),
    }
}

// Build the prompt for one developer invocation. May write context files
// under <workspace>/.foreman/ when the feedback payload is large; the
// returned prompt then references them by path.
pub async fn generate_prompt(task: &WorkerTask, workspace_dir: &Path) -> anyhow::Result<String> {
    let prompt = match task.action {
        WorkerAction::StartNewTask => formatdoc! {"
            You are implementing a new task in the repository checked out in the current directory.

            {header}
            {description}
            Implement the task. Commit your work with clear messages and open a pull request
            against the repository's base branch. When you are done, print the pull request URL
            on its own line.
            ",
            header = task_header(task),
            description = describe_item(task),
        },
        WorkerAction::ResumeTask => formatdoc! {"
            You previously started the task below in this working tree but were interrupted.

            {header}
            {description}
            Inspect the current state of the branch (git status, git log) and carry on from
            where the work stopped. If a pull request does not exist yet, open one and print
            its URL on its own line.
            ",
            header = task_header(task),
            description = describe_item(task),
        },
        WorkerAction::ProcessFeedback => {
            let feedback = render_feedback(task, workspace_dir).await?;
            formatdoc! {"
                Reviewers left feedback on your pull request for the task below.

                {header}
                Pull request: {pr}

                {feedback}
                Address each point, commit, and push to the existing branch. Reply is not
                needed; the code change is the response.
                ",
                header = task_header(task),
                pr = task.pull_request_url.as_deref().unwrap_or("(unknown)"),
            }
        }
        WorkerAction::MergeRequest => formatdoc! {"
            The pull request for the task below has been approved.

            {header}
            Pull request: {pr}

            Merge it (prefer the repository's default merge style), confirm the merge
            succeeded, and print the merge commit hash on its own line.
            ",
            header = task_header(task),
            pr = task.pull_request_url.as_deref().unwrap_or("(unknown)"),
        },
    };
    Ok(prompt)
}

// Inline the comments when they're small; spill them to numbered files and
// reference those when they're not.
async fn render_feedback(task: &WorkerTask, workspace_dir: &Path) -> anyhow::Result<String> {
    let rendered: Vec<String> = task
        .comments
        .iter()
        .map(|c| format!("[{}] {}:\n{}", c.id, c.author, c.body))
        .collect();
    let total: usize = rendered.iter().map(String::len).sum();

    if total <= MAX_INLINE_CONTEXT {
        return Ok(format!("Feedback to address:\n\n{}\n", rendered.iter().join("\n\n")));
    }

    let context_dir = workspace_dir.join(CONTEXT_DIR);
    tokio::fs::create_dir_all(&context_dir)
        .await
        .context("creating prompt context dir")?;
    let mut index_lines = Vec::new();
    for (i, (comment, text)) in task.comments.iter().zip(&rendered).enumerate() {
        let file_name = format!("feedback-{:03}.md", i);
        tokio::fs::write(context_dir.join(&file_name), text)
            .await
            .with_context(|| format!("writing context file {}", file_name))?;
        index_lines.push(format!(
            "- {}/{} ({} by {})",
            CONTEXT_DIR, file_name, comment.id, comment.author
        ));
    }
    info!(
        "spilled {} feedback comments ({} bytes) to {:?}",
        task.comments.len(),
        total,
        context_dir
    );
    Ok(formatdoc! {"
        Feedback to address is in these files (read all of them):
        {index}
        ",
        index = index_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use googletest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::model::{
        test_utils::{board_item, comment},
        TaskId, TaskStatus,
    };

    fn worker_task(action: WorkerAction) -> WorkerTask {
        WorkerTask {
            task_id: TaskId::new("item-1"),
            action,
            repository_id: "octo/website".parse().unwrap(),
            board_item: board_item("item-1", TaskStatus::InProgress),
            pull_request_url: Some("https://github.com/octo/website/pull/42".to_owned()),
            comments: vec![],
            assigned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_new_task_prompt_names_the_work() {
        let dir = TempDir::new().unwrap();
        let task = worker_task(WorkerAction::StartNewTask);
        let prompt = generate_prompt(&task, dir.path()).await.unwrap();
        assert_that!(prompt, contains_substring("octo/website"));
        assert_that!(prompt, contains_substring("item item-1"));
        assert_that!(prompt, contains_substring("pull request"));
    }

    #[tokio::test]
    async fn test_feedback_inlined_when_small() {
        let dir = TempDir::new().unwrap();
        let mut task = worker_task(WorkerAction::ProcessFeedback);
        task.comments = vec![
            comment("c3", "alice", "rename this function"),
            comment("c4", "sonarcloud[bot]", "coverage dropped"),
        ];
        let prompt = generate_prompt(&task, dir.path()).await.unwrap();
        assert_that!(prompt, contains_substring("rename this function"));
        assert_that!(prompt, contains_substring("coverage dropped"));
        assert_that!(prompt, contains_substring("pull/42"));
        // Nothing spilled.
        assert_that!(dir.path().join(CONTEXT_DIR).exists(), eq(false));
    }

    #[tokio::test]
    async fn test_feedback_spills_to_indexed_files() {
        let dir = TempDir::new().unwrap();
        let mut task = worker_task(WorkerAction::ProcessFeedback);
        task.comments = vec![
            comment("c1", "alice", &"x".repeat(MAX_INLINE_CONTEXT)),
            comment("c2", "bob", "also this"),
        ];
        let prompt = generate_prompt(&task, dir.path()).await.unwrap();
        // The prompt points at the files instead of inlining the wall of text.
        let wall = "x".repeat(100);
        assert_that!(prompt, not(contains_substring(wall)));
        assert_that!(prompt, contains_substring(".foreman/feedback-000.md"));
        assert_that!(prompt, contains_substring(".foreman/feedback-001.md"));
        let spilled =
            std::fs::read_to_string(dir.path().join(CONTEXT_DIR).join("feedback-001.md")).unwrap();
        assert_that!(spilled, contains_substring("also this"));
    }

    #[tokio::test]
    async fn test_merge_prompt_references_pr() {
        let dir = TempDir::new().unwrap();
        let task = worker_task(WorkerAction::MergeRequest);
        let prompt = generate_prompt(&task, dir.path()).await.unwrap();
        assert_that!(prompt, contains_substring("approved"));
        assert_that!(prompt, contains_substring("pull/42"));
    }
}
