use core::fmt;
use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::OrchestratorError,
    model::RepoId,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum GitOperation {
    Clone,
    Fetch,
    Pull,
    Worktree,
}

impl Display for GitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clone => "clone",
            Self::Fetch => "fetch",
            Self::Pull => "pull",
            Self::Worktree => "worktree",
        };
        write!(f, "{}", s)
    }
}

const ACQUIRE_ATTEMPTS: u32 = 10;
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct HeldLock {
    operation: GitOperation,
    acquired_at: Instant,
    // Identifies one particular acquisition. If a lock expires and gets
    // reclaimed while the original holder's closure is somehow still running,
    // the original guard's drop must not release the new holder's lock.
    token: u64,
}

// One logical mutex per repository, with a TTL so a crashed-midway holder
// can't wedge the repo forever. Acquisition serialises on the repository
// alone: a fetch waits for an in-flight worktree add on the same repo. The
// operation is still recorded per-hold for reporting and log output.
pub struct GitOpLock {
    // Keyed by repo id string. Values are present iff the lock is held.
    held: Mutex<HashMap<String, HeldLock>>,
    next_token: Mutex<u64>,
    lock_timeout: Duration,
}

// Snapshot of one held lock, for the status command.
#[derive(Debug, Clone)]
pub struct HeldLockInfo {
    pub repo_id: String,
    pub operation: GitOperation,
    pub held_for: Duration,
}

struct LockGuard {
    lock: Arc<GitOpLock>,
    repo_key: String,
    token: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.lock.held.lock();
        match held.get(&self.repo_key) {
            Some(entry) if entry.token == self.token => {
                held.remove(&self.repo_key);
            }
            // Reclaimed from under us. The closure ran longer than the TTL,
            // which means lock_timeout is set shorter than a real git
            // operation can take. Worth shouting about.
            Some(_) => error!(
                "lock for {} was reclaimed while still in use; lock_timeout is too short",
                self.repo_key
            ),
            None => error!(
                "lock for {} vanished while held (double release?)",
                self.repo_key
            ),
        }
    }
}

impl GitOpLock {
    pub fn new(lock_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(HashMap::new()),
            next_token: Mutex::new(0),
            lock_timeout,
        })
    }

    // Run f while exclusively holding the lock for repo. The lock is released
    // however f exits; f's error comes back unchanged.
    pub async fn with_lock<T, F, Fut>(
        self: &Arc<Self>,
        repo: &RepoId,
        operation: GitOperation,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _guard = self.acquire(repo, operation).await?;
        f().await
    }

    async fn acquire(
        self: &Arc<Self>,
        repo: &RepoId,
        operation: GitOperation,
    ) -> anyhow::Result<LockGuard> {
        let repo_key = repo.to_string();
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            {
                let mut held = self.held.lock();
                let expired = match held.get(&repo_key) {
                    None => true,
                    Some(entry) => {
                        let age = entry.acquired_at.elapsed();
                        if age > self.lock_timeout {
                            warn!(
                                "reclaiming expired {} lock on {} (held {:?})",
                                entry.operation, repo_key, age
                            );
                            true
                        } else {
                            false
                        }
                    }
                };
                if expired {
                    let token = {
                        let mut next = self.next_token.lock();
                        *next += 1;
                        *next
                    };
                    held.insert(
                        repo_key.clone(),
                        HeldLock {
                            operation,
                            acquired_at: Instant::now(),
                            token,
                        },
                    );
                    debug!("acquired {} lock on {} (attempt {})", operation, repo_key, attempt);
                    return Ok(LockGuard {
                        lock: self.clone(),
                        repo_key,
                        token,
                    });
                }
            }
            // Holding the map mutex across this sleep would rather defeat the
            // point.
            sleep(ACQUIRE_RETRY_DELAY).await;
        }
        Err(OrchestratorError::LockAcquireTimeout {
            repo_id: repo_key,
            operation: operation.to_string(),
        }
        .into())
    }

    pub fn held_locks(&self) -> Vec<HeldLockInfo> {
        self.held
            .lock()
            .iter()
            .map(|(repo_id, entry)| HeldLockInfo {
                repo_id: repo_id.clone(),
                operation: entry.operation,
                held_for: entry.acquired_at.elapsed(),
            })
            .collect()
    }

    fn sweep(&self) {
        let mut held = self.held.lock();
        held.retain(|repo_key, entry| {
            let age = entry.acquired_at.elapsed();
            if age > self.lock_timeout {
                warn!(
                    "sweeper removing expired {} lock on {} (held {:?})",
                    entry.operation, repo_key, age
                );
                false
            } else {
                true
            }
        });
    }

    // Background garbage collection of leaked locks. The acquiring path also
    // reclaims, so this only matters for repos nobody is asking about.
    pub async fn run_sweeper(self: Arc<Self>, ct: CancellationToken) -> anyhow::Result<()> {
        loop {
            select! {
                _ = ct.cancelled() => return Ok(()),
                _ = sleep(SWEEP_INTERVAL) => self.sweep(),
            }
        }
    }
}
