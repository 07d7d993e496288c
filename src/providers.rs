use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::{
    comments::{filter_comments, FilterOptions},
    model::{
        PrComment, PrReview, PrState, ProjectBoardItem, PullRequest, RepoId, ReviewState, TaskId,
        TaskStatus,
    },
};

// Which concrete provider implementations to wire up. The core only ever sees
// the traits below; this enum exists so the selection is a config value
// instead of a build flag. Real code-host adapters live out of tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Mock,
}

// Read-only projection of the board itself.
#[derive(Clone, Debug)]
pub struct Board {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait ProjectBoardService: Send + Sync {
    async fn get_board(&self, board_id: &str) -> anyhow::Result<Board>;

    // status = None means all lanes.
    async fn get_items(
        &self,
        board_id: &str,
        status: Option<TaskStatus>,
    ) -> anyhow::Result<Vec<ProjectBoardItem>>;

    async fn update_item_status(
        &self,
        item_id: &TaskId,
        new_status: TaskStatus,
    ) -> anyhow::Result<ProjectBoardItem>;

    async fn add_pull_request_to_item(
        &self,
        item_id: &TaskId,
        url: &str,
    ) -> anyhow::Result<ProjectBoardItem>;
}

#[async_trait]
pub trait PullRequestService: Send + Sync {
    async fn get_pull_request(&self, repo: &RepoId, number: u64) -> anyhow::Result<PullRequest>;

    async fn list_pull_requests(
        &self,
        repo: &RepoId,
        state: Option<PrState>,
    ) -> anyhow::Result<Vec<PullRequest>>;

    async fn get_reviews(&self, repo: &RepoId, number: u64) -> anyhow::Result<Vec<PrReview>>;

    async fn get_comments(&self, repo: &RepoId, number: u64) -> anyhow::Result<Vec<PrComment>>;

    // Acknowledge comment ids so adapters that track read state on their side
    // can advance it. The in-memory adapter just records them.
    async fn mark_comments_as_processed(&self, ids: &[String]) -> anyhow::Result<()>;

    // The repository's default branch, None if the host doesn't say.
    async fn default_branch(&self, repo: &RepoId) -> anyhow::Result<Option<String>>;

    // Approved iff, taking only the latest review per reviewer, at least one
    // says APPROVED and none say CHANGES_REQUESTED. Adapters get this for
    // free from get_reviews; an adapter whose API has a native answer can
    // override.
    async fn is_approved(&self, repo: &RepoId, number: u64) -> anyhow::Result<bool> {
        let mut reviews = self.get_reviews(repo, number).await?;
        reviews.sort_by_key(|r| r.submitted_at);
        let mut latest: HashMap<String, ReviewState> = HashMap::new();
        for review in reviews {
            // COMMENTED doesn't supersede a verdict, it's just chatter.
            if review.state != ReviewState::Commented {
                latest.insert(review.reviewer, review.state);
            }
        }
        let any_approved = latest.values().any(|s| *s == ReviewState::Approved);
        let any_blocked = latest.values().any(|s| *s == ReviewState::ChangesRequested);
        Ok(any_approved && !any_blocked)
    }

    // Comments strictly newer than `since`, run through the standard filter.
    async fn get_new_comments(
        &self,
        repo: &RepoId,
        number: u64,
        since: DateTime<Utc>,
        filter_options: Option<&FilterOptions>,
    ) -> anyhow::Result<Vec<PrComment>> {
        let pr = self.get_pull_request(repo, number).await?;
        let comments: Vec<PrComment> = self
            .get_comments(repo, number)
            .await?
            .into_iter()
            .filter(|c| c.created_at > since)
            .collect();
        let default_options = FilterOptions::default();
        let options = filter_options.unwrap_or(&default_options);
        Ok(filter_comments(comments, &pr.author, options))
    }
}

static PR_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[^/]+/([^/\s]+)/([^/\s]+)/pull/(\d+)").unwrap()
});

// Pull "owner/name" and the PR number out of a pull request URL. We keep URLs
// as the canonical reference (that's what the board stores) and re-derive the
// API coordinates when needed.
pub fn parse_pr_url(url: &str) -> Option<(RepoId, u64)> {
    let captures = PR_URL_REGEX.captures(url)?;
    let repo: RepoId = format!("{}/{}", &captures[1], &captures[2]).parse().ok()?;
    let number: u64 = captures[3].parse().ok()?;
    Some((repo, number))
}

pub fn create_board_service(
    kind: ProviderKind,
    data_dir: &Path,
) -> anyhow::Result<Arc<dyn ProjectBoardService>> {
    match kind {
        ProviderKind::Mock => {
            let service = InMemoryBoardService::new();
            // A seed file makes mock runs do something visible. Absence is
            // the normal case.
            let seed = data_dir.join("mock-board.json");
            if seed.exists() {
                service.load_items(&seed)?;
                info!("seeded mock board from {:?}", seed);
            }
            Ok(Arc::new(service))
        }
    }
}

pub fn create_pull_request_service(
    kind: ProviderKind,
) -> anyhow::Result<Arc<dyn PullRequestService>> {
    match kind {
        ProviderKind::Mock => Ok(Arc::new(InMemoryPullRequestService::new())),
    }
}

// In-memory board. Doubles as the "mock" runtime provider and the test
// double, so its mutators are plain methods rather than test-only helpers.
#[derive(Default)]
pub struct InMemoryBoardService {
    items: Mutex<Vec<ProjectBoardItem>>,
    // When set, update_item_status applies the mutation but hands back the
    // pre-mutation item, imitating a board API with read-after-write lag.
    laggy: Mutex<bool>,
}

impl InMemoryBoardService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item: ProjectBoardItem) {
        self.items.lock().push(item);
    }

    pub fn set_laggy(&self, laggy: bool) {
        *self.laggy.lock() = laggy;
    }

    pub fn item(&self, id: &TaskId) -> Option<ProjectBoardItem> {
        self.items.lock().iter().find(|i| &i.id == id).cloned()
    }

    pub fn load_items(&self, path: &Path) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading board seed {:?}", path))?;
        let items: Vec<ProjectBoardItem> =
            serde_json::from_str(&content).with_context(|| format!("parsing {:?}", path))?;
        *self.items.lock() = items;
        Ok(())
    }
}

#[async_trait]
impl ProjectBoardService for InMemoryBoardService {
    async fn get_board(&self, board_id: &str) -> anyhow::Result<Board> {
        Ok(Board {
            id: board_id.to_owned(),
            name: format!("board {}", board_id),
        })
    }

    async fn get_items(
        &self,
        _board_id: &str,
        status: Option<TaskStatus>,
    ) -> anyhow::Result<Vec<ProjectBoardItem>> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect())
    }

    async fn update_item_status(
        &self,
        item_id: &TaskId,
        new_status: TaskStatus,
    ) -> anyhow::Result<ProjectBoardItem> {
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|i| &i.id == item_id)
            .with_context(|| format!("no board item {}", item_id))?;
        let stale = item.clone();
        item.status = new_status;
        if *self.laggy.lock() {
            Ok(stale)
        } else {
            Ok(item.clone())
        }
    }

    async fn add_pull_request_to_item(
        &self,
        item_id: &TaskId,
        url: &str,
    ) -> anyhow::Result<ProjectBoardItem> {
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|i| &i.id == item_id)
            .with_context(|| format!("no board item {}", item_id))?;
        if !item.pull_request_urls.iter().any(|u| u == url) {
            item.pull_request_urls.push(url.to_owned());
        }
        Ok(item.clone())
    }
}

#[derive(Default)]
pub struct InMemoryPullRequestService {
    prs: Mutex<HashMap<(RepoId, u64), PullRequest>>,
    reviews: Mutex<HashMap<(RepoId, u64), Vec<PrReview>>>,
    comments: Mutex<HashMap<(RepoId, u64), Vec<PrComment>>>,
    default_branches: Mutex<HashMap<RepoId, String>>,
    processed: Mutex<BTreeSet<String>>,
}

impl InMemoryPullRequestService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pull_request(&self, pr: PullRequest) {
        self.prs
            .lock()
            .insert((pr.repository_id.clone(), pr.number), pr);
    }

    pub fn add_review(&self, repo: &RepoId, number: u64, review: PrReview) {
        self.reviews
            .lock()
            .entry((repo.clone(), number))
            .or_default()
            .push(review);
    }

    pub fn add_comment(&self, repo: &RepoId, number: u64, comment: PrComment) {
        self.comments
            .lock()
            .entry((repo.clone(), number))
            .or_default()
            .push(comment);
    }

    pub fn set_default_branch(&self, repo: &RepoId, branch: &str) {
        self.default_branches
            .lock()
            .insert(repo.clone(), branch.to_owned());
    }

    pub fn processed_ids(&self) -> BTreeSet<String> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl PullRequestService for InMemoryPullRequestService {
    async fn get_pull_request(&self, repo: &RepoId, number: u64) -> anyhow::Result<PullRequest> {
        self.prs
            .lock()
            .get(&(repo.clone(), number))
            .cloned()
            .with_context(|| format!("no PR {}#{}", repo, number))
    }

    async fn list_pull_requests(
        &self,
        repo: &RepoId,
        state: Option<PrState>,
    ) -> anyhow::Result<Vec<PullRequest>> {
        let mut prs: Vec<PullRequest> = self
            .prs
            .lock()
            .values()
            .filter(|pr| &pr.repository_id == repo && state.map_or(true, |s| pr.state == s))
            .cloned()
            .collect();
        prs.sort_by_key(|pr| pr.number);
        Ok(prs)
    }

    async fn get_reviews(&self, repo: &RepoId, number: u64) -> anyhow::Result<Vec<PrReview>> {
        Ok(self
            .reviews
            .lock()
            .get(&(repo.clone(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_comments(&self, repo: &RepoId, number: u64) -> anyhow::Result<Vec<PrComment>> {
        Ok(self
            .comments
            .lock()
            .get(&(repo.clone(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_comments_as_processed(&self, ids: &[String]) -> anyhow::Result<()> {
        self.processed.lock().extend(ids.iter().cloned());
        Ok(())
    }

    async fn default_branch(&self, repo: &RepoId) -> anyhow::Result<Option<String>> {
        Ok(self.default_branches.lock().get(repo).cloned())
    }
}
