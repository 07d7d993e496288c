use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, warn};

use crate::{
    model::{ProjectBoardItem, RepoId},
    providers::PullRequestService,
};

// Picks the branch new work gets based on. Precedence: an explicit
// "base:<branch>" label on the board item, then whatever the code host says
// the repository's default branch is, then "main".
pub struct BaseBranchResolver {
    pr_service: Arc<dyn PullRequestService>,
}

const LABEL_PREFIX: &str = "base:";

impl BaseBranchResolver {
    pub fn new(pr_service: Arc<dyn PullRequestService>) -> Self {
        Self { pr_service }
    }

    pub async fn resolve(&self, repo: &RepoId, item: &ProjectBoardItem) -> String {
        if let Some(branch) = extract_base_label(&item.labels) {
            debug!("item {} pins base branch {:?} via label", item.id, branch);
            return branch;
        }
        match self.pr_service.default_branch(repo).await {
            Ok(Some(branch)) => return branch,
            Ok(None) => debug!("no default branch reported for {}", repo),
            // Nullable on failure: a flaky metadata lookup shouldn't block
            // starting a task, "main" is nearly always right anyway.
            Err(e) => warn!("couldn't look up default branch for {}: {:#}", repo, e),
        }
        "main".to_owned()
    }
}

// The prefix match is case-insensitive but the branch name itself is taken
// verbatim (branch names are case-sensitive). Slashes in the value are fine,
// "base:release/v2" means the release/v2 branch.
fn extract_base_label(labels: &[String]) -> Option<String> {
    labels.iter().find_map(|label| {
        let label = label.trim();
        if label.len() <= LABEL_PREFIX.len() || !label.is_char_boundary(LABEL_PREFIX.len()) {
            return None;
        }
        let (prefix, value) = label.split_at(LABEL_PREFIX.len());
        if !prefix.eq_ignore_ascii_case(LABEL_PREFIX) {
            return None;
        }
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_owned())
        }
    })
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_case::test_case;

    use super::*;
    use crate::{
        model::{test_utils::board_item, TaskStatus},
        providers::test_utils::InMemoryPullRequestService,
    };

    #[test_case(&["base:develop"], Some("develop"); "plain")]
    #[test_case(&["BASE:develop"], Some("develop"); "prefix case insensitive")]
    #[test_case(&["base: release/v2 "], Some("release/v2"); "trimmed, slashes kept")]
    #[test_case(&["base:"], None; "empty value")]
    #[test_case(&["based:develop"], None; "wrong prefix")]
    #[test_case(&["bug", "base:hotfix", "base:other"], Some("hotfix"); "first match wins")]
    #[test_case(&[], None; "no labels")]
    fn test_extract_base_label(labels: &[&str], want: Option<&str>) {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        assert_that!(extract_base_label(&labels), eq(&want.map(str::to_owned)));
    }

    #[tokio::test]
    async fn test_resolve_precedence() {
        let repo: RepoId = "octo/website".parse().unwrap();
        let prs = Arc::new(InMemoryPullRequestService::new());
        prs.set_default_branch(&repo, "trunk");
        let resolver = BaseBranchResolver::new(prs.clone());

        // Label beats the repo default.
        let mut item = board_item("item-1", TaskStatus::Todo);
        item.labels = vec!["base:develop".to_owned()];
        assert_that!(resolver.resolve(&repo, &item).await, eq("develop"));

        // No label: repo default.
        let item = board_item("item-2", TaskStatus::Todo);
        assert_that!(resolver.resolve(&repo, &item).await, eq("trunk"));

        // Unknown repo: fall through to "main".
        let other: RepoId = "octo/other".parse().unwrap();
        assert_that!(resolver.resolve(&other, &item).await, eq("main"));
    }
}
