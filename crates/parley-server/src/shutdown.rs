//! Staged shutdown of the relay's background tasks.
//!
//! The listener stops first. The hub then closes every session, so no new
//! sends or history reads can queue cache work. The backfill worker drains
//! what is already queued, and the janitor stops last. Each stage has its own
//! token and all stages share one deadline; whatever is still running when it
//! passes is aborted.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Background task groups, in the order they are stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Hub,
    Backfill,
    Janitor,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Hub, Stage::Backfill, Stage::Janitor];

    pub fn name(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Backfill => "backfill",
            Self::Janitor => "janitor",
        }
    }
}

pub struct ShutdownCoordinator {
    /// Watched by the HTTP listener.
    token: CancellationToken,
    hub: CancellationToken,
    backfill: CancellationToken,
    janitor: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            hub: CancellationToken::new(),
            backfill: CancellationToken::new(),
            janitor: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token for the tasks of one stage. It is cancelled only once every
    /// earlier stage has stopped.
    pub fn stage_token(&self, stage: Stage) -> CancellationToken {
        match stage {
            Stage::Hub => self.hub.clone(),
            Stage::Backfill => self.backfill.clone(),
            Stage::Janitor => self.janitor.clone(),
        }
    }

    /// Cancel the listener and every stage at once, without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
        for stage in Stage::ORDER {
            self.stage_token(stage).cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the listener, then each stage in [`Stage::ORDER`], waiting for a
    /// stage's tasks before cancelling the next. Everything shares a single
    /// `timeout`; tasks still running when it expires are aborted.
    pub async fn graceful_shutdown(&self, tasks: Vec<(Stage, JoinHandle<()>)>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + timeout;

        self.token.cancel();
        info!(
            task_count = tasks.len(),
            timeout_secs = timeout.as_secs(),
            "draining background tasks"
        );

        let aborts: Vec<_> = tasks.iter().map(|(_, h)| h.abort_handle()).collect();
        let mut remaining = tasks;
        for stage in Stage::ORDER {
            let (current, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|(s, _)| *s == stage);
            remaining = rest;

            self.stage_token(stage).cancel();
            let count = current.len();
            let drain = futures::future::join_all(current.into_iter().map(|(_, h)| h));
            if tokio::time::timeout_at(deadline, drain).await.is_err() {
                warn!(
                    stage = stage.name(),
                    "shutdown timed out after {timeout:?}, aborting remaining tasks"
                );
                self.shutdown();
                for handle in aborts {
                    handle.abort();
                }
                return;
            }
            debug!(stage = stage.name(), count, "stage stopped");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
