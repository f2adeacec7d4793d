use crate::worker::{WorkMessage, Worker};
use anyhow::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Runs `workers_count` worker loops until `cancel_token` fires, logging
/// what each of them reports.
pub async fn serve(
    cancel_token: CancellationToken,
    worker: Worker,
    workers_count: u16,
) -> Result<WorkerStats, Error> {
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();

    let mut workers = vec![];
    for index in 0..workers_count.max(1) {
        let worker = worker.clone();
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let join_handle = tokio::spawn(
            async move {
                worker.start(cancel_token, send_to_server).await;
            }
            .instrument(info_span!("worker", index)),
        );
        workers.push(join_handle);
    }
    // The channel closes once every worker has stopped.
    drop(send_to_server);

    let mut stats = WorkerStats::default();
    while let Some(message) = recv_from_worker.recv().await {
        match message {
            WorkMessage::JobCompleted(job_id, asset_url) => {
                stats.completed += 1;
                info!(message = "Completed job", job_id = %job_id, asset_url = %asset_url);
            }
            WorkMessage::JobFailed(job_id, error_msg) => {
                stats.failed += 1;
                info!(message = "Failed job", job_id = %job_id, error = %error_msg);
            }
            WorkMessage::JobSkipped(job_id) => {
                stats.skipped += 1;
                debug!(message = "Skipped job", job_id = %job_id);
            }
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        message = "Server stopped.",
        completed = stats.completed,
        failed = stats.failed,
        skipped = stats.skipped
    );

    Ok(stats)
}
