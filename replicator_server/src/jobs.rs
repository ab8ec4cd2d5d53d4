//! In-process backfill dispatch: an mpsc queue plus a worker loop.

use async_trait::async_trait;
use replicator_core::models::BackfillJobId;
use replicator_core::store::traits::JobScheduler;
use replicator_core::{BackfillRunner, Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sends enqueued job ids to the worker spawned by [`spawn_backfill_worker`].
#[derive(Clone)]
pub struct ChannelJobScheduler {
    tx: mpsc::UnboundedSender<BackfillJobId>,
}

impl ChannelJobScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackfillJobId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobScheduler for ChannelJobScheduler {
    async fn enqueue_backfill(&self, job_id: BackfillJobId) -> Result<()> {
        self.tx
            .send(job_id)
            .map_err(|_| Error::StoreMessage("backfill worker is not running".to_string()))
    }
}

/// Runs queued jobs one at a time until the channel closes or `cancel` fires.
pub fn spawn_backfill_worker(
    runner: Arc<BackfillRunner>,
    mut rx: mpsc::UnboundedReceiver<BackfillJobId>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("backfill worker started");
        loop {
            let job_id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            match runner.run(job_id).await {
                Ok(job) => tracing::info!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    pages = job.pages_fetched,
                    items = job.items_upserted,
                    "backfill job finished"
                ),
                Err(Error::Cancelled) => {
                    tracing::info!(job_id = %job_id, "backfill job paused for shutdown");
                    break;
                }
                Err(err) => tracing::error!(job_id = %job_id, error = %err, "backfill job failed"),
            }
        }
        tracing::info!("backfill worker stopped");
    })
}
