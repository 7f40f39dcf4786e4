//! Cache repopulation after a history read misses.
//!
//! Jobs go through a bounded queue to a single worker. A full queue drops the
//! job; the next miss on the same conversation will queue it again. Each job
//! merges into the cached list by message id, so several misses of one
//! conversation queued back to back still leave a single copy per message.

use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_cache::RecencyCache;
use parley_core::Message;

use crate::metrics as names;

enum Job {
    Fill { label: String, messages: Vec<Message> },
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct BackfillQueue {
    tx: mpsc::Sender<Job>,
}

impl BackfillQueue {
    /// Spawn the worker. It stops when `token` is cancelled or every queue
    /// handle is dropped.
    pub fn spawn(
        cache: RecencyCache,
        capacity: usize,
        job_timeout: Duration,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(worker(cache, rx, job_timeout, token));
        (Self { tx }, task)
    }

    /// Queue `messages` (oldest first) for re-insertion. Returns `false` when
    /// the job was dropped.
    pub fn enqueue(&self, label: impl Into<String>, messages: Vec<Message>) -> bool {
        let label = label.into();
        match self.tx.try_send(Job::Fill { label, messages }) {
            Ok(()) => true,
            Err(e) => {
                let label = match e.into_inner() {
                    Job::Fill { label, .. } => label,
                    Job::Barrier(_) => String::new(),
                };
                warn!(conversation = %label, "backfill queue full or stopped, dropping job");
                counter!(names::BACKFILL_DROPPED_TOTAL).increment(1);
                false
            }
        }
    }

    /// Wait until every job queued before this call has finished.
    pub async fn settle(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Barrier(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Runs jobs until cancelled, then refuses new ones and finishes whatever
/// was already queued.
async fn worker(
    cache: RecencyCache,
    mut rx: mpsc::Receiver<Job>,
    job_timeout: Duration,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            () = token.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        run_job(&cache, job, job_timeout).await;
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(job) = rx.recv().await {
        run_job(&cache, job, job_timeout).await;
        drained += 1;
    }
    debug!(drained, "backfill worker stopped");
}

async fn run_job(cache: &RecencyCache, job: Job, job_timeout: Duration) {
    match job {
        Job::Barrier(done) => {
            let _ = done.send(());
        }
        Job::Fill { label, messages } => {
            match tokio::time::timeout(job_timeout, cache.refill(&messages)).await {
                Ok(Ok(0)) => {
                    debug!(conversation = %label, "conversation already cached, skipping");
                }
                Ok(Ok(added)) => {
                    debug!(conversation = %label, added, "backfilled conversation");
                    counter!(names::BACKFILL_JOBS_TOTAL).increment(1);
                }
                Ok(Err(e)) => {
                    warn!(conversation = %label, error = %e, "backfill failed");
                    counter!(names::CACHE_ERRORS_TOTAL, "op" => "backfill").increment(1);
                }
                Err(_) => {
                    warn!(conversation = %label, timeout = ?job_timeout, "backfill timed out");
                    counter!(names::CACHE_ERRORS_TOTAL, "op" => "backfill").increment(1);
                }
            }
        }
    }
}
