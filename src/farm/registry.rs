use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::farm::protocol::{
    AddJobRequest, HeartbeatRequest, HeartbeatResponse, JobOutcome, JobProgress, NodeInfo,
    NodeState, QueueResponse, RegisterRequest, RegisterResponse, StatusResponse, SERVICE_NAME,
};
use crate::farm::transfer::TransferStore;
use crate::scheduler::job::{Job, JobId, JobStatus, NodeId, TransferInfo};

/// A render node as the master sees it.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub id: NodeId,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub capacity: usize,
    pub last_heartbeat: Instant,
    pub offline: bool,
    /// Jobs and progress from the last heartbeat.
    pub current_jobs: Vec<JobProgress>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl WorkerNode {
    fn new(id: NodeId, req: &RegisterRequest, address: &str) -> Self {
        Self {
            id,
            hostname: req.hostname.clone(),
            address: address.to_string(),
            port: req.port,
            capacity: req.capacity.max(1),
            last_heartbeat: Instant::now(),
            offline: false,
            current_jobs: Vec::new(),
            jobs_completed: 0,
            jobs_failed: 0,
        }
    }

    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < timeout
    }

    pub fn state(&self) -> NodeState {
        if self.offline {
            NodeState::Offline
        } else if self.current_jobs.is_empty() {
            NodeState::Online
        } else {
            NodeState::Rendering
        }
    }

    fn info(&self, now: Instant) -> NodeInfo {
        NodeInfo {
            node_id: self.id.clone(),
            hostname: self.hostname.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            state: self.state(),
            current_jobs: self.current_jobs.clone(),
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            last_seen_secs: now.saturating_duration_since(self.last_heartbeat).as_secs(),
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    job: Job,
    reserved_at: Option<Instant>,
    pinned_to: Option<NodeId>,
    cancel_requested: bool,
}

impl PoolEntry {
    fn held_by(&self, node: &NodeId) -> bool {
        self.job.status.is_active() && self.job.assigned_node.as_ref() == Some(node)
    }

    /// Take the job back from a node that lost it. A job whose cancel was
    /// already requested ends cancelled instead of going back in line.
    fn release(&mut self) -> Result<()> {
        self.reserved_at = None;
        if self.cancel_requested {
            self.cancel_requested = false;
            if self.job.status == JobStatus::Reserved {
                self.job.transition(JobStatus::Rendering)?;
            }
            self.job.transition(JobStatus::Cancelled)
        } else {
            self.job.transition(JobStatus::Pending)
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub offline: Vec<NodeId>,
    pub released: Vec<JobId>,
}

/// Master side of the farm: the node table and the shared job pool.
///
/// Writes to the pool are the reservation critical section; status reads
/// share the lock. When both locks are needed the pool is always taken
/// first.
pub struct FarmRegistry {
    pool: RwLock<Vec<PoolEntry>>,
    nodes: RwLock<HashMap<NodeId, WorkerNode>>,
    transfers: Option<TransferStore>,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
    reservation_timeout: Duration,
}

impl FarmRegistry {
    pub fn new(config: &FarmConfig) -> Self {
        Self {
            pool: RwLock::new(Vec::new()),
            nodes: RwLock::new(HashMap::new()),
            transfers: None,
            heartbeat_interval: config.heartbeat_interval(),
            liveness_timeout: config.liveness_timeout(),
            reservation_timeout: config.reservation_timeout(),
        }
    }

    pub fn with_transfers(mut self, store: TransferStore) -> Self {
        self.transfers = Some(store);
        self
    }

    pub fn transfers(&self) -> Option<&TransferStore> {
        self.transfers.as_ref()
    }

    /// Add a node and hand out a fresh id. A node registering again from
    /// the same address and port replaces its old record, and whatever the
    /// old record held goes back to the pool.
    pub async fn register(&self, req: RegisterRequest, address: &str) -> RegisterResponse {
        let mut pool = self.pool.write().await;
        let mut nodes = self.nodes.write().await;

        let stale: Vec<NodeId> = nodes
            .values()
            .filter(|n| n.address == address && n.port == req.port)
            .map(|n| n.id.clone())
            .collect();
        for old in stale {
            nodes.remove(&old);
            for entry in pool.iter_mut().filter(|e| e.held_by(&old)) {
                if let Err(e) = entry.release() {
                    tracing::error!(job_id = %entry.job.id, error = %e, "Failed to release job");
                }
            }
            tracing::info!(node_id = %old, "Node superseded by re-registration");
        }

        let id = NodeId::generate(&format!("{}:{}", address, req.port));
        nodes.insert(id.clone(), WorkerNode::new(id.clone(), &req, address));
        tracing::info!(
            node_id = %id,
            hostname = %req.hostname,
            capacity = req.capacity,
            "Node registered"
        );
        RegisterResponse {
            node_id: id,
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
        }
    }

    /// Refresh a node's liveness and progress. Confirms reservations the
    /// node reports as held and returns the jobs it should cancel: those
    /// with a cancel request, and those it reports but no longer holds.
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let mut pool = self.pool.write().await;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&req.node_id)
            .ok_or_else(|| FarmError::NodeNotFound(req.node_id.clone()))?;
        if node.offline {
            return Err(FarmError::NodeOffline(req.node_id.to_string()));
        }
        node.last_heartbeat = Instant::now();

        let mut held = Vec::new();
        let mut cancel_jobs = Vec::new();
        for report in &req.jobs {
            let holding = pool.iter().filter(|e| e.held_by(&req.node_id)).count();
            let Some(entry) = pool.iter_mut().find(|e| e.job.id == report.job_id) else {
                cancel_jobs.push(report.job_id);
                continue;
            };
            if !entry.held_by(&req.node_id) {
                // The node lost the job while out of touch. If it is still
                // waiting in the pool the node keeps it; otherwise it must stop.
                let adoptable = entry.job.status == JobStatus::Pending
                    && entry.pinned_to.as_ref().map_or(true, |p| *p == req.node_id)
                    && holding < node.capacity;
                if !adoptable {
                    tracing::warn!(
                        job_id = %report.job_id,
                        node_id = %req.node_id,
                        status = %entry.job.status,
                        "Node reports a job it no longer holds"
                    );
                    cancel_jobs.push(report.job_id);
                    continue;
                }
                entry.job.transition(JobStatus::Reserved)?;
                entry.job.assigned_node = Some(req.node_id.clone());
                tracing::info!(job_id = %report.job_id, node_id = %req.node_id, "Node resumed a released job");
            }
            if entry.job.status == JobStatus::Reserved {
                entry.job.transition(JobStatus::Rendering)?;
                entry.reserved_at = None;
                tracing::debug!(job_id = %entry.job.id, node_id = %req.node_id, "Reservation confirmed");
            }
            entry.job.progress = report.progress.clamp(0.0, 1.0);
            held.push(*report);
        }
        node.current_jobs = held;

        cancel_jobs.extend(
            pool.iter()
                .filter(|e| e.cancel_requested && e.held_by(&req.node_id))
                .map(|e| e.job.id),
        );
        Ok(HeartbeatResponse { cancel_jobs })
    }

    /// Reserve the next job for a node: a job pinned to it first, then the
    /// oldest unpinned pending job. `None` when nothing fits or the node is
    /// at capacity.
    pub async fn get_job(&self, node_id: &NodeId) -> Result<Option<Job>> {
        let mut pool = self.pool.write().await;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| FarmError::NodeNotFound(node_id.clone()))?;
        if node.offline {
            return Err(FarmError::NodeOffline(node_id.to_string()));
        }
        node.last_heartbeat = Instant::now();

        let held = pool.iter().filter(|e| e.held_by(node_id)).count();
        if held >= node.capacity {
            return Ok(None);
        }

        let pending = |e: &PoolEntry| e.job.status == JobStatus::Pending;
        let idx = pool
            .iter()
            .position(|e| pending(e) && e.pinned_to.as_ref() == Some(node_id))
            .or_else(|| pool.iter().position(|e| pending(e) && e.pinned_to.is_none()));
        let Some(idx) = idx else {
            return Ok(None);
        };

        let entry = &mut pool[idx];
        entry.job.transition(JobStatus::Reserved)?;
        entry.job.assigned_node = Some(node_id.clone());
        entry.reserved_at = Some(Instant::now());
        tracing::info!(job_id = %entry.job.id, node_id = %node_id, "Job reserved");
        Ok(Some(entry.job.clone()))
    }

    /// Record how a job ended. Returns whether the report changed anything:
    /// duplicates and reports from a node that no longer holds the job are
    /// accepted and ignored.
    pub async fn job_complete(&self, node_id: &NodeId, job_id: &JobId, outcome: JobOutcome) -> Result<bool> {
        let mut pool = self.pool.write().await;
        let idx = pool
            .iter()
            .position(|e| e.job.id == *job_id)
            .ok_or(FarmError::JobNotFound(*job_id))?;
        let entry = &mut pool[idx];

        if entry.job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, "Duplicate completion ignored");
            return Ok(false);
        }
        if !entry.held_by(node_id) {
            tracing::warn!(job_id = %job_id, node_id = %node_id, "Completion from a node that does not hold the job");
            return Ok(false);
        }

        if entry.job.status == JobStatus::Reserved {
            entry.job.transition(JobStatus::Rendering)?;
        }
        let failed = match &outcome {
            JobOutcome::Completed => {
                entry.job.transition(JobStatus::Completed)?;
                false
            }
            JobOutcome::Failed { error } => {
                entry.job.transition(JobStatus::Failed)?;
                entry.job.error = Some(error.clone());
                true
            }
            JobOutcome::Cancelled => {
                entry.job.transition(JobStatus::Cancelled)?;
                false
            }
        };
        entry.reserved_at = None;
        entry.cancel_requested = false;
        let bundled = entry.job.transfer.is_some();
        tracing::info!(job_id = %job_id, node_id = %node_id, status = %entry.job.status, "Farm job finished");

        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.current_jobs.retain(|j| j.job_id != *job_id);
            match (&outcome, failed) {
                (JobOutcome::Completed, _) => node.jobs_completed += 1,
                (_, true) => node.jobs_failed += 1,
                _ => {}
            }
        }
        drop(nodes);
        drop(pool);

        if bundled {
            if let Some(store) = &self.transfers {
                store.delete(job_id).await;
            }
        }
        Ok(true)
    }

    /// Put a job into the pool. Settings are checked here; the project
    /// path is only meaningful to the rendering node.
    pub async fn add_job(&self, req: AddJobRequest) -> Result<JobId> {
        req.settings.validate()?;
        if req.project.as_os_str().is_empty() {
            return Err(FarmError::Validation("empty project path".to_string()));
        }
        let mut pool = self.pool.write().await;
        if let Some(pin) = &req.pinned_to {
            if !self.nodes.read().await.contains_key(pin) {
                return Err(FarmError::NodeNotFound(pin.clone()));
            }
        }
        let id = req.job_id.unwrap_or_default();
        if pool.iter().any(|e| e.job.id == id) {
            return Err(FarmError::DuplicateJob(id));
        }

        let mut job = Job::with_id(id, req.project, req.settings);
        if req.bundled {
            let entry = job
                .project
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| FarmError::Validation("project path has no file name".to_string()))?;
            job.transfer = Some(TransferInfo {
                project_entry: entry,
            });
        }
        pool.push(PoolEntry {
            job,
            reserved_at: None,
            pinned_to: req.pinned_to,
            cancel_requested: false,
        });
        tracing::info!(job_id = %id, bundled = req.bundled, "Farm job added");
        Ok(id)
    }

    pub async fn get(&self, job_id: &JobId) -> Option<Job> {
        self.pool
            .read()
            .await
            .iter()
            .find(|e| e.job.id == *job_id)
            .map(|e| e.job.clone())
    }

    pub async fn status(&self) -> StatusResponse {
        let pool = self.pool.read().await;
        let nodes = self.nodes.read().await;
        let now = Instant::now();
        let mut node_list: Vec<NodeInfo> = nodes.values().map(|n| n.info(now)).collect();
        node_list.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.node_id.cmp(&b.node_id)));
        StatusResponse {
            service: SERVICE_NAME.to_string(),
            nodes: node_list,
            jobs: pool.iter().map(|e| e.job.clone()).collect(),
            pending: pool
                .iter()
                .filter(|e| e.job.status == JobStatus::Pending)
                .count(),
            active: pool.iter().filter(|e| e.job.status.is_active()).count(),
        }
    }

    pub async fn queue(&self) -> QueueResponse {
        let pool = self.pool.read().await;
        QueueResponse {
            pending: pool
                .iter()
                .filter(|e| e.job.status == JobStatus::Pending)
                .map(|e| e.job.clone())
                .collect(),
            active: pool
                .iter()
                .filter(|e| e.job.status.is_active())
                .map(|e| e.job.clone())
                .collect(),
        }
    }

    /// Ask the node holding a job to stop it. Delivered with the node's
    /// next heartbeat response.
    pub async fn request_cancel(&self, job_id: &JobId) -> Result<()> {
        let mut pool = self.pool.write().await;
        let entry = find_mut(&mut pool, job_id)?;
        if !entry.job.status.is_active() {
            return Err(FarmError::InvalidState {
                job_id: *job_id,
                status: entry.job.status,
                action: "cancel",
            });
        }
        entry.cancel_requested = true;
        tracing::info!(job_id = %job_id, node = ?entry.job.assigned_node, "Cancel requested");
        Ok(())
    }

    /// Pin a pending job to a node, or unpin it with `None`.
    pub async fn assign(&self, job_id: &JobId, node_id: Option<NodeId>) -> Result<()> {
        let mut pool = self.pool.write().await;
        if let Some(node) = &node_id {
            if !self.nodes.read().await.contains_key(node) {
                return Err(FarmError::NodeNotFound(node.clone()));
            }
        }
        let entry = find_mut(&mut pool, job_id)?;
        if entry.job.status != JobStatus::Pending {
            return Err(FarmError::InvalidState {
                job_id: *job_id,
                status: entry.job.status,
                action: "assign",
            });
        }
        tracing::info!(job_id = %job_id, node = ?node_id, "Job pinned");
        entry.pinned_to = node_id;
        Ok(())
    }

    pub async fn retry(&self, job_id: &JobId) -> Result<()> {
        let mut pool = self.pool.write().await;
        let entry = find_mut(&mut pool, job_id)?;
        if !matches!(entry.job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(FarmError::InvalidState {
                job_id: *job_id,
                status: entry.job.status,
                action: "retry",
            });
        }
        entry.job.transition(JobStatus::Pending)?;
        entry.job.retry_count += 1;
        entry.cancel_requested = false;
        Ok(())
    }

    pub async fn remove(&self, job_id: &JobId) -> Result<Job> {
        let mut pool = self.pool.write().await;
        let idx = pool
            .iter()
            .position(|e| e.job.id == *job_id)
            .ok_or(FarmError::JobNotFound(*job_id))?;
        let status = pool[idx].job.status;
        if status.is_active() {
            return Err(FarmError::InvalidState {
                job_id: *job_id,
                status,
                action: "remove",
            });
        }
        let entry = pool.remove(idx);
        drop(pool);
        if let Some(store) = &self.transfers {
            store.delete(job_id).await;
        }
        Ok(entry.job)
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Mark silent nodes offline and take their jobs back; release
    /// reservations never confirmed by a heartbeat.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut pool = self.pool.write().await;
        let mut nodes = self.nodes.write().await;

        for node in nodes.values_mut() {
            if !node.offline && !node.is_alive(now, self.liveness_timeout) {
                node.offline = true;
                node.current_jobs.clear();
                tracing::warn!(node_id = %node.id, hostname = %node.hostname, "Node offline");
                report.offline.push(node.id.clone());
            }
        }

        for entry in pool.iter_mut() {
            if !entry.job.status.is_active() {
                continue;
            }
            let owner_gone = entry
                .job
                .assigned_node
                .as_ref()
                .map(|n| nodes.get(n).map(|node| node.offline).unwrap_or(true))
                .unwrap_or(true);
            let reservation_expired = entry.job.status == JobStatus::Reserved
                && entry
                    .reserved_at
                    .map(|at| now.saturating_duration_since(at) >= self.reservation_timeout)
                    .unwrap_or(false);
            if owner_gone || reservation_expired {
                let job_id = entry.job.id;
                match entry.release() {
                    Ok(()) => {
                        tracing::info!(job_id = %job_id, owner_gone, reservation_expired, "Job released");
                        report.released.push(job_id);
                    }
                    Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to release job"),
                }
            }
        }
        report
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.offline.is_empty() || !report.released.is_empty() {
                        tracing::info!(
                            offline = report.offline.len(),
                            released = report.released.len(),
                            "Sweep finished"
                        );
                    }
                }
            }
        }
        tracing::debug!("Sweeper stopped");
    }
}

fn find_mut<'a>(pool: &'a mut [PoolEntry], job_id: &JobId) -> Result<&'a mut PoolEntry> {
    pool.iter_mut()
        .find(|e| e.job.id == *job_id)
        .ok_or(FarmError::JobNotFound(*job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderSettings;

    fn registry() -> FarmRegistry {
        FarmRegistry::new(&FarmConfig::default())
    }

    fn add_request(name: &str) -> AddJobRequest {
        AddJobRequest {
            job_id: None,
            project: format!("/shared/{}.moho", name).into(),
            settings: RenderSettings::default(),
            bundled: false,
            pinned_to: None,
        }
    }

    async fn node(reg: &FarmRegistry, host: &str) -> NodeId {
        reg.register(
            RegisterRequest {
                hostname: host.to_string(),
                port: 5581,
                capacity: 1,
            },
            host,
        )
        .await
        .node_id
    }

    #[tokio::test]
    async fn pool_order_and_capacity() {
        let reg = registry();
        let a = reg.add_job(add_request("a")).await.unwrap();
        let b = reg.add_job(add_request("b")).await.unwrap();
        let n = node(&reg, "10.0.0.2").await;

        let first = reg.get_job(&n).await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.status, JobStatus::Reserved);
        // Capacity 1: nothing more until the first job finishes.
        assert!(reg.get_job(&n).await.unwrap().is_none());

        assert!(reg.job_complete(&n, &a, JobOutcome::Completed).await.unwrap());
        let second = reg.get_job(&n).await.unwrap().unwrap();
        assert_eq!(second.id, b);
    }

    #[tokio::test]
    async fn pinned_jobs_go_to_their_node_first() {
        let reg = registry();
        let n1 = node(&reg, "10.0.0.2").await;
        let n2 = node(&reg, "10.0.0.3").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        let b = reg.add_job(add_request("b")).await.unwrap();
        reg.assign(&b, Some(n2.clone())).await.unwrap();

        assert_eq!(reg.get_job(&n2).await.unwrap().unwrap().id, b);
        assert_eq!(reg.get_job(&n1).await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn pinned_to_other_node_is_skipped() {
        let reg = registry();
        let n1 = node(&reg, "10.0.0.2").await;
        let n2 = node(&reg, "10.0.0.3").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        reg.assign(&a, Some(n2)).await.unwrap();
        assert!(reg.get_job(&n1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_confirms_and_delivers_cancel() {
        let reg = registry();
        let n = node(&reg, "10.0.0.2").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        reg.get_job(&n).await.unwrap();

        let resp = reg
            .heartbeat(HeartbeatRequest {
                node_id: n.clone(),
                jobs: vec![JobProgress {
                    job_id: a,
                    progress: 0.25,
                }],
            })
            .await
            .unwrap();
        assert!(resp.cancel_jobs.is_empty());
        let job = reg.get(&a).await.unwrap();
        assert_eq!(job.status, JobStatus::Rendering);
        assert_eq!(job.progress, 0.25);

        reg.request_cancel(&a).await.unwrap();
        let resp = reg
            .heartbeat(HeartbeatRequest {
                node_id: n.clone(),
                jobs: vec![],
            })
            .await
            .unwrap();
        assert_eq!(resp.cancel_jobs, vec![a]);

        assert!(reg.job_complete(&n, &a, JobOutcome::Cancelled).await.unwrap());
        assert_eq!(reg.get(&a).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_pending_is_rejected() {
        let reg = registry();
        let a = reg.add_job(add_request("a")).await.unwrap();
        assert!(matches!(
            reg.request_cancel(&a).await,
            Err(FarmError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn complete_from_reserved_and_duplicates() {
        let reg = registry();
        let n = node(&reg, "10.0.0.2").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        reg.get_job(&n).await.unwrap();

        let outcome = JobOutcome::Failed {
            error: "exit 1".into(),
        };
        assert!(reg.job_complete(&n, &a, outcome.clone()).await.unwrap());
        assert!(!reg.job_complete(&n, &a, outcome).await.unwrap());
        let job = reg.get(&a).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("exit 1"));

        let status = reg.status().await;
        assert_eq!(status.nodes[0].jobs_failed, 1);

        reg.retry(&a).await.unwrap();
        let job = reg.get(&a).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn reregistration_releases_old_jobs() {
        let reg = registry();
        let old = node(&reg, "10.0.0.2").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        reg.get_job(&old).await.unwrap();

        let new = node(&reg, "10.0.0.2").await;
        assert_ne!(old, new);
        assert_eq!(reg.get(&a).await.unwrap().status, JobStatus::Pending);
        assert!(matches!(
            reg.heartbeat(HeartbeatRequest {
                node_id: old,
                jobs: vec![]
            })
            .await,
            Err(FarmError::NodeNotFound(_))
        ));
        assert_eq!(reg.status().await.nodes.len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_reservation_expires() {
        let reg = FarmRegistry::new(&FarmConfig {
            liveness_timeout_ms: 120_000,
            ..FarmConfig::default()
        });
        let n = node(&reg, "10.0.0.2").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        reg.get_job(&n).await.unwrap();

        // Node still alive, reservation older than the timeout.
        let later = Instant::now() + Duration::from_secs(31);
        let report = reg.sweep_at(later).await;
        assert!(report.offline.is_empty());
        assert_eq!(report.released, vec![a]);
        assert_eq!(reg.get(&a).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn remove_rejects_active_jobs() {
        let reg = registry();
        let n = node(&reg, "10.0.0.2").await;
        let a = reg.add_job(add_request("a")).await.unwrap();
        reg.get_job(&n).await.unwrap();
        assert!(reg.remove(&a).await.is_err());
        reg.job_complete(&n, &a, JobOutcome::Completed).await.unwrap();
        assert_eq!(reg.remove(&a).await.unwrap().id, a);
        assert!(reg.get(&a).await.is_none());
    }

    #[tokio::test]
    async fn bundled_jobs_carry_their_entry() {
        let reg = registry();
        let mut req = add_request("shot");
        req.bundled = true;
        let id = reg.add_job(req).await.unwrap();
        let job = reg.get(&id).await.unwrap();
        assert_eq!(
            job.transfer,
            Some(TransferInfo {
                project_entry: "shot.moho".to_string()
            })
        );
    }
}
