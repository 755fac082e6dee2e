use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{FarmError, Result};
use crate::farm::backoff::Backoff;
use crate::farm::client::FarmClient;
use crate::farm::protocol::{JobOutcome, JobProgress};
use crate::farm::transfer::extract_bundle;
use crate::scheduler::job::{Job, JobId, JobOrigin, JobStatus, NodeId};
use crate::scheduler::manager::{QueueEvent, QueueManager};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub hostname: String,
    /// Advertised to the master; part of the node's identity.
    pub port: u16,
    pub heartbeat_interval: Duration,
    /// Wait between job requests when the pool had nothing for us.
    pub poll_interval: Duration,
    /// Parent folder for unpacked project bundles.
    pub work_dir: PathBuf,
    /// Largest unpacked bundle this node accepts.
    pub max_bundle_bytes: usize,
    pub backoff: Backoff,
}

/// A farm job this node is rendering. The bundle copy, if any, lives as
/// long as the entry.
struct HeldJob {
    _work_dir: Option<TempDir>,
}

/// Slave side of the farm: pulls jobs from the master into the local
/// queue and reports how they end.
///
/// Losing the master never stops the local queue; the agent keeps trying
/// to reconnect in the background.
pub struct FarmAgent {
    client: FarmClient,
    queue: QueueManager,
    config: AgentConfig,
    node_id: Mutex<Option<NodeId>>,
    heartbeat_ms: AtomicU64,
    held: Mutex<HashMap<JobId, HeldJob>>,
    slot_freed: Notify,
}

impl FarmAgent {
    pub fn new(client: FarmClient, queue: QueueManager, config: AgentConfig) -> Self {
        let heartbeat_ms = config.heartbeat_interval.as_millis() as u64;
        Self {
            client,
            queue,
            config,
            node_id: Mutex::new(None),
            heartbeat_ms: AtomicU64::new(heartbeat_ms.max(1)),
            held: Mutex::new(HashMap::new()),
            slot_freed: Notify::new(),
        }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub async fn node_id(&self) -> Option<NodeId> {
        self.node_id.lock().await.clone()
    }

    pub async fn held_jobs(&self) -> Vec<JobId> {
        self.held.lock().await.keys().copied().collect()
    }

    /// Run until `cancel` fires. In-flight renders are cancelled on exit.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let events = self.queue.subscribe();
        self.queue.start().await;

        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop(cancel.clone()));
        let fetch = tokio::spawn(Arc::clone(&self).fetch_loop(cancel.clone()));
        let completion = tokio::spawn(Arc::clone(&self).completion_loop(events, cancel.clone()));

        cancel.cancelled().await;
        tracing::info!("Farm agent stopping");
        let _ = tokio::join!(heartbeat, fetch, completion);
        self.queue.stop().await;
        Ok(())
    }

    /// Current node id, registering first if needed. `None` while the
    /// master is unreachable.
    async fn ensure_registered(&self, cancel: &CancellationToken) -> Option<NodeId> {
        let mut node_id = self.node_id.lock().await;
        if let Some(id) = node_id.as_ref() {
            return Some(id.clone());
        }
        let capacity = self.queue.max_concurrent();
        let result = self
            .config
            .backoff
            .retry("register", cancel, || {
                self.client
                    .register(&self.config.hostname, self.config.port, capacity)
            })
            .await;
        match result {
            Ok(resp) => {
                tracing::info!(
                    node_id = %resp.node_id,
                    master = %self.client.base_url(),
                    "Registered with farm master"
                );
                if resp.heartbeat_interval_ms > 0 {
                    self.heartbeat_ms
                        .store(resp.heartbeat_interval_ms, Ordering::Relaxed);
                }
                *node_id = Some(resp.node_id.clone());
                Some(resp.node_id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Farm master unreachable, rendering local queue only");
                None
            }
        }
    }

    /// The master no longer knows us (it restarted, or swept us offline):
    /// register again on the next attempt.
    async fn forget_if_unknown(&self, err: &FarmError) {
        if let FarmError::Api { status: 404 | 410, .. } = err {
            let old = self.node_id.lock().await.take();
            if let Some(old) = old {
                tracing::warn!(node_id = %old, "Master dropped this node, re-registering");
            }
        }
    }

    /// A round that ended without a node id never reached the master.
    async fn unregistered_failures(&self, failures: u32) -> u32 {
        if self.node_id().await.is_some() {
            0
        } else {
            failures.saturating_add(1)
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.load(Ordering::Relaxed))
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let wait = self
                .config
                .backoff
                .poll_delay(self.heartbeat_interval(), failures);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            match self.heartbeat_once(&cancel).await {
                Ok(()) => failures = self.unregistered_failures(failures).await,
                Err(e) => {
                    tracing::warn!(error = %e, failures, "Heartbeat failed");
                    failures = next_failure_count(failures, &e);
                    self.forget_if_unknown(&e).await;
                }
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    }

    /// Send one heartbeat and act on the cancellations it brings back.
    pub async fn heartbeat_once(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(node_id) = self.ensure_registered(cancel).await else {
            return Ok(());
        };
        let mut jobs = Vec::new();
        for job_id in self.held_jobs().await {
            let progress = self.queue.get(&job_id).await.map(|j| j.progress).unwrap_or(0.0);
            jobs.push(JobProgress { job_id, progress });
        }
        let resp = self.client.heartbeat(&node_id, jobs).await?;
        for job_id in resp.cancel_jobs {
            match self.queue.cancel(&job_id).await {
                Ok(()) => tracing::info!(job_id = %job_id, "Cancelled by farm master"),
                Err(FarmError::InvalidState {
                    status: JobStatus::Pending,
                    ..
                }) => self.drop_unstarted(&node_id, &job_id, cancel).await,
                Err(e) => tracing::debug!(job_id = %job_id, error = %e, "Remote cancel not applicable"),
            }
        }
        Ok(())
    }

    /// A cancelled farm job that never left the local queue: take it out
    /// and tell the master it is cancelled.
    async fn drop_unstarted(&self, node_id: &NodeId, job_id: &JobId, cancel: &CancellationToken) {
        let Some(held) = self.held.lock().await.remove(job_id) else {
            return;
        };
        if self.queue.remove(job_id).await.is_err() {
            // Admitted in the meantime; the completion path reports it.
            self.held.lock().await.insert(*job_id, held);
            let _ = self.queue.cancel(job_id).await;
            return;
        }
        tracing::info!(job_id = %job_id, "Cancelled by farm master before it started");
        self.report(node_id, job_id, JobOutcome::Cancelled, cancel).await;
        drop(held);
        self.slot_freed.notify_one();
    }

    async fn fetch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let wait = match self.fetch_once(&cancel).await {
                Ok(true) => {
                    failures = 0;
                    continue;
                }
                Ok(false) => {
                    failures = self.unregistered_failures(failures).await;
                    self.config
                        .backoff
                        .poll_delay(self.config.poll_interval, failures)
                }
                Err(e) => {
                    tracing::warn!(error = %e, failures, "Job request failed");
                    failures = next_failure_count(failures, &e);
                    self.forget_if_unknown(&e).await;
                    self.config
                        .backoff
                        .poll_delay(self.config.poll_interval, failures)
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.slot_freed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!("Fetch loop stopped");
    }

    /// Ask the master for one job if there is room. Returns whether a job
    /// was taken.
    pub async fn fetch_once(&self, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        if self.held.lock().await.len() >= self.queue.max_concurrent() {
            return Ok(false);
        }
        let Some(node_id) = self.ensure_registered(cancel).await else {
            return Ok(false);
        };
        let Some(job) = self.client.get_job(&node_id).await? else {
            return Ok(false);
        };
        if self.held.lock().await.contains_key(&job.id) {
            // Already rendering it from an earlier reservation.
            return Ok(true);
        }
        tracing::info!(job_id = %job.id, project = %job.project.display(), "Received farm job");
        if let Err(e) = self.accept(job.clone(), cancel).await {
            tracing::warn!(job_id = %job.id, error = %e, "Cannot run farm job");
            self.held.lock().await.remove(&job.id);
            self.report(
                &node_id,
                &job.id,
                JobOutcome::Failed {
                    error: e.to_string(),
                },
                cancel,
            )
            .await;
        }
        Ok(true)
    }

    /// Stage the job's project and hand the job to the local queue.
    async fn accept(&self, job: Job, cancel: &CancellationToken) -> Result<()> {
        let (project, work_dir) = match &job.transfer {
            Some(transfer) => {
                tokio::fs::create_dir_all(&self.config.work_dir).await?;
                let dir = tempfile::Builder::new()
                    .prefix("job-")
                    .tempdir_in(&self.config.work_dir)?;
                let bytes = self
                    .config
                    .backoff
                    .retry("download_bundle", cancel, || self.client.download_bundle(&job.id))
                    .await?;
                let dest = dir.path().to_path_buf();
                let limit = self.config.max_bundle_bytes;
                let files = tokio::task::spawn_blocking(move || extract_bundle(&bytes, &dest, limit))
                    .await
                    .map_err(|e| FarmError::Transfer(e.to_string()))??;
                tracing::debug!(job_id = %job.id, files, dir = %dir.path().display(), "Bundle unpacked");
                (dir.path().join(&transfer.project_entry), Some(dir))
            }
            None => (job.project.clone(), None),
        };

        self.held.lock().await.insert(
            job.id,
            HeldJob {
                _work_dir: work_dir,
            },
        );
        let mut local = Job::with_id(job.id, project, job.settings);
        local.origin = JobOrigin::Farm;
        self.queue.enqueue(local).await?;
        Ok(())
    }

    async fn completion_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<QueueEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(QueueEvent::StatusChanged { id, to, .. }) if to.is_terminal() => {
                        self.finish(&id, &cancel).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Queue events lagged, rechecking held jobs");
                        for id in self.held_jobs().await {
                            let done = self
                                .queue
                                .get(&id)
                                .await
                                .map(|j| j.status.is_terminal())
                                .unwrap_or(true);
                            if done {
                                self.finish(&id, &cancel).await;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Completion loop stopped");
    }

    /// Report a finished farm job, drop it from the local queue and delete
    /// its bundle copy.
    async fn finish(&self, id: &JobId, cancel: &CancellationToken) {
        let Some(held) = self.held.lock().await.remove(id) else {
            return;
        };
        let outcome = match self.queue.get(id).await {
            Some(job) => match job.status {
                JobStatus::Completed => JobOutcome::Completed,
                JobStatus::Cancelled => JobOutcome::Cancelled,
                _ => JobOutcome::Failed {
                    error: job.error.unwrap_or_else(|| "render failed".to_string()),
                },
            },
            None => JobOutcome::Failed {
                error: "job vanished from the local queue".to_string(),
            },
        };
        if let Some(node_id) = self.node_id().await {
            self.report(&node_id, id, outcome, cancel).await;
        } else {
            tracing::warn!(job_id = %id, "Not registered, farm result dropped");
        }
        if let Err(e) = self.queue.remove(id).await {
            tracing::debug!(job_id = %id, error = %e, "Could not remove finished farm job");
        }
        drop(held);
        self.slot_freed.notify_one();
    }

    async fn report(&self, node_id: &NodeId, job_id: &JobId, outcome: JobOutcome, cancel: &CancellationToken) {
        let result = self
            .config
            .backoff
            .retry("job_complete", cancel, || {
                self.client.job_complete(node_id, job_id, outcome.clone())
            })
            .await;
        match result {
            Ok(true) => tracing::info!(job_id = %job_id, "Farm job reported"),
            Ok(false) => tracing::info!(job_id = %job_id, "Master ignored the report"),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not report farm job");
                self.forget_if_unknown(&e).await;
            }
        }
    }
}

/// Consecutive transient failures after `err`. Anything else (the master
/// answered but refused) starts the count over.
fn next_failure_count(failures: u32, err: &FarmError) -> u32 {
    if err.is_transient() || matches!(err, FarmError::NodeOffline(_)) {
        failures.saturating_add(1)
    } else {
        0
    }
}
