use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::MAX_CONCURRENT_LIMIT;
use crate::error::{FarmError, Result};
use crate::render::{validate_project, RenderSettings};
use crate::scheduler::job::{Job, JobId, JobOrigin, JobStatus};
use crate::scheduler::queue::{Direction, JobQueue};
use crate::scheduler::snapshot::{read_queue_file, write_queue_file, SnapshotStore};
use crate::worker::{Compositor, RenderEvent, RenderRequest, Renderer};

const EVENT_CAPACITY: usize = 1024;

/// Everything observers can learn about a queue without polling it.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobAdded(JobId),
    JobRemoved(JobId),
    StatusChanged {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    Progress {
        id: JobId,
        progress: f32,
    },
    Output {
        id: JobId,
        line: String,
    },
    /// Nothing left to admit and nothing rendering.
    Drained,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub rendering: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct State {
    queue: JobQueue,
    running: bool,
    dispatcher_started: bool,
    /// Set while the queue has work in flight, cleared when `Drained` fires.
    busy: bool,
    active: HashMap<JobId, CancellationToken>,
}

struct Inner {
    state: Mutex<State>,
    store: Option<SnapshotStore>,
    /// Serializes snapshot writes so they land in mutation order.
    save_lock: Mutex<()>,
    renderer: Arc<dyn Renderer>,
    compositor: Option<Arc<dyn Compositor>>,
    max_concurrent: usize,
    events: broadcast::Sender<QueueEvent>,
    wake: Notify,
    shutdown: CancellationToken,
}

pub struct QueueManagerBuilder {
    renderer: Arc<dyn Renderer>,
    max_concurrent: usize,
    store: Option<SnapshotStore>,
    compositor: Option<Arc<dyn Compositor>>,
}

impl QueueManagerBuilder {
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn snapshot(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn compositor(mut self, compositor: Arc<dyn Compositor>) -> Self {
        self.compositor = Some(compositor);
        self
    }

    /// Restore the last snapshot (if any) and write a fresh one.
    ///
    /// An unreadable snapshot is set aside and the queue starts empty.
    /// Failing to write the initial snapshot is an error: a queue that
    /// cannot persist should not start.
    pub async fn open(self) -> Result<QueueManager> {
        if self.max_concurrent == 0 || self.max_concurrent > MAX_CONCURRENT_LIMIT {
            return Err(FarmError::Validation(format!(
                "max_concurrent must be 1-{}, got {}",
                MAX_CONCURRENT_LIMIT, self.max_concurrent
            )));
        }

        let mut queue = JobQueue::new();
        if let Some(store) = &self.store {
            match store.load().await {
                Ok(jobs) => queue = JobQueue::from_jobs(jobs),
                Err(FarmError::StateCorruption {
                    path,
                    preserved_at,
                    reason,
                }) => {
                    tracing::warn!(
                        path = %path.display(),
                        preserved_at = %preserved_at.display(),
                        reason = %reason,
                        "Queue snapshot unreadable, starting with an empty queue"
                    );
                }
                Err(e) => return Err(e),
            }
            let orphaned = queue.drop_farm_jobs();
            if !orphaned.is_empty() {
                // The master gets these back when the node registers again.
                tracing::warn!(jobs = ?orphaned, "Dropped farm jobs left by the previous run");
            }
            let recovered = queue.recover_interrupted();
            if recovered > 0 {
                tracing::info!(recovered, "Requeued jobs interrupted by the previous run");
            }
            store.save(queue.jobs()).await?;
            tracing::info!(
                path = %store.path().display(),
                jobs = queue.len(),
                "Queue restored"
            );
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(QueueManager {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue,
                    running: false,
                    dispatcher_started: false,
                    busy: false,
                    active: HashMap::new(),
                }),
                store: self.store,
                save_lock: Mutex::new(()),
                renderer: self.renderer,
                compositor: self.compositor,
                max_concurrent: self.max_concurrent,
                events,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// Handle to one machine's render queue. Cloning the handle shares the
/// queue; every mutation is written to the snapshot before it returns.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn builder(renderer: Arc<dyn Renderer>) -> QueueManagerBuilder {
        QueueManagerBuilder {
            renderer,
            max_concurrent: 1,
            store: None,
            compositor: None,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and append a project with its settings.
    pub async fn add(&self, project: impl Into<PathBuf>, settings: RenderSettings) -> Result<JobId> {
        self.enqueue(Job::new(project, settings)).await
    }

    /// Append a pending job. Fails on a bad project or settings, and on an
    /// id already in the queue.
    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        if job.status != JobStatus::Pending {
            return Err(FarmError::Validation(format!(
                "new jobs must be pending, got {}",
                job.status
            )));
        }
        job.settings.validate()?;
        validate_project(&job.project)?;

        let id = job.id;
        {
            let mut state = self.inner.state.lock().await;
            state.queue.push(job)?;
        }
        tracing::info!(job_id = %id, "Job queued");
        self.inner.persist().await;
        self.inner.emit(QueueEvent::JobAdded(id));
        self.inner.wake.notify_one();
        Ok(id)
    }

    pub async fn remove(&self, id: &JobId) -> Result<Job> {
        let job = self.inner.state.lock().await.queue.remove(id)?;
        self.inner.persist().await;
        self.inner.emit(QueueEvent::JobRemoved(*id));
        Ok(job)
    }

    /// Put a failed or cancelled job back in line.
    pub async fn retry(&self, id: &JobId) -> Result<()> {
        let from = {
            let mut state = self.inner.state.lock().await;
            let from = state
                .queue
                .get(id)
                .map(|j| j.status)
                .ok_or(FarmError::JobNotFound(*id))?;
            state.queue.retry(id)?;
            from
        };
        self.inner.persist().await;
        self.inner.emit(QueueEvent::StatusChanged {
            id: *id,
            from,
            to: JobStatus::Pending,
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    pub async fn duplicate(&self, id: &JobId) -> Result<JobId> {
        let new_id = self.inner.state.lock().await.queue.duplicate(id)?;
        self.inner.persist().await;
        self.inner.emit(QueueEvent::JobAdded(new_id));
        self.inner.wake.notify_one();
        Ok(new_id)
    }

    /// Move a job one place. Returns `false` (and changes nothing) at the
    /// ends of the queue.
    pub async fn reorder(&self, id: &JobId, direction: Direction) -> Result<bool> {
        let moved = self.inner.state.lock().await.queue.move_job(id, direction)?;
        if moved {
            self.inner.persist().await;
        }
        Ok(moved)
    }

    pub async fn update_settings(&self, id: &JobId, settings: RenderSettings) -> Result<()> {
        settings.validate()?;
        self.inner
            .state
            .lock()
            .await
            .queue
            .update_settings(id, settings)?;
        self.inner.persist().await;
        Ok(())
    }

    /// Stop a rendering job. The job turns `cancelled` once its renderer
    /// has exited.
    pub async fn cancel(&self, id: &JobId) -> Result<()> {
        let state = self.inner.state.lock().await;
        let job = state.queue.get(id).ok_or(FarmError::JobNotFound(*id))?;
        match state.active.get(id) {
            Some(token) => {
                tracing::info!(job_id = %id, "Cancel requested");
                token.cancel();
                Ok(())
            }
            None => Err(FarmError::InvalidState {
                job_id: *id,
                status: job.status,
                action: "cancel",
            }),
        }
    }

    pub async fn clear_finished(&self) -> usize {
        let removed = self.inner.state.lock().await.queue.clear_finished();
        if removed > 0 {
            self.inner.persist().await;
        }
        removed
    }

    pub async fn clear_all(&self) -> usize {
        let removed = self.inner.state.lock().await.queue.clear_all();
        if removed > 0 {
            self.inner.persist().await;
        }
        removed
    }

    /// Begin (or resume) admitting pending jobs.
    pub async fn start(&self) {
        let spawn_dispatcher = {
            let mut state = self.inner.state.lock().await;
            state.running = true;
            !std::mem::replace(&mut state.dispatcher_started, true)
        };
        if spawn_dispatcher {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.dispatch_loop().await });
        }
        tracing::info!(max_concurrent = self.inner.max_concurrent, "Queue started");
        self.inner.wake.notify_one();
    }

    /// Stop admitting new jobs; renders in flight run to completion.
    pub async fn pause(&self) {
        self.inner.state.lock().await.running = false;
        tracing::info!("Queue paused");
    }

    pub async fn resume(&self) {
        self.start().await;
    }

    /// Stop admitting and cancel everything in flight.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        state.running = false;
        for token in state.active.values() {
            token.cancel();
        }
        tracing::info!(cancelled = state.active.len(), "Queue stopped");
    }

    /// Stop the queue and its dispatcher for good.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.shutdown.cancel();
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.inner.state.lock().await.queue.get(id).cloned()
    }

    /// All jobs in queue order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.state.lock().await.queue.jobs().to_vec()
    }

    pub async fn counts(&self) -> QueueCounts {
        let state = self.inner.state.lock().await;
        let q = &state.queue;
        QueueCounts {
            pending: q.count(JobStatus::Pending),
            rendering: q.count(JobStatus::Rendering),
            completed: q.count(JobStatus::Completed),
            failed: q.count(JobStatus::Failed),
            cancelled: q.count(JobStatus::Cancelled),
        }
    }

    pub async fn active_jobs(&self) -> Vec<JobId> {
        self.inner.state.lock().await.active.keys().copied().collect()
    }

    /// True when nothing renders and nothing more will be admitted.
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.active.is_empty() && (!state.running || state.queue.next_pending().is_none())
    }

    /// Wait until [`is_idle`](Self::is_idle) holds.
    pub async fn wait_idle(&self) {
        let mut events = self.subscribe();
        loop {
            if self.is_idle().await {
                return;
            }
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }

    /// Write the queue to `path` in snapshot format.
    pub async fn export(&self, path: &Path) -> Result<usize> {
        let mut jobs = self.jobs().await;
        jobs.retain(|j| j.origin == JobOrigin::Local);
        write_queue_file(path, &jobs).await?;
        Ok(jobs.len())
    }

    /// Load the jobs of an exported queue. Without `append` the jobs that
    /// are not rendering are dropped first. Jobs that were rendering when
    /// exported come back pending; ids already present get a fresh one.
    pub async fn import(&self, path: &Path, append: bool) -> Result<usize> {
        let jobs = read_queue_file(path).await?;
        let mut added = Vec::with_capacity(jobs.len());
        {
            let mut state = self.inner.state.lock().await;
            if !append {
                state.queue.clear_all();
            }
            for mut job in jobs {
                job.recover_interrupted();
                job.origin = JobOrigin::Local;
                if state.queue.get(&job.id).is_some() {
                    job.id = JobId::new();
                }
                added.push(job.id);
                state.queue.push(job)?;
            }
        }
        self.inner.persist().await;
        for id in &added {
            self.inner.emit(QueueEvent::JobAdded(*id));
        }
        self.inner.wake.notify_one();
        Ok(added.len())
    }
}

impl Inner {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Write the current queue to the snapshot. Failures are logged: a
    /// running queue keeps going even if the disk does not.
    async fn persist(&self) {
        let Some(store) = &self.store else { return };
        let _guard = self.save_lock.lock().await;
        let jobs: Vec<Job> = self
            .state
            .lock()
            .await
            .queue
            .jobs()
            .iter()
            .filter(|j| j.origin == JobOrigin::Local)
            .cloned()
            .collect();
        if let Err(e) = store.save(&jobs).await {
            tracing::error!(path = %store.path().display(), error = %e, "Failed to save queue snapshot");
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            self.admit().await;
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        tracing::debug!("Queue dispatcher stopped");
    }

    /// Start pending jobs in queue order until the concurrency bound is hit.
    async fn admit(self: &Arc<Self>) {
        let mut started = Vec::new();
        let mut drained = false;
        {
            let mut state = self.state.lock().await;
            if state.running {
                while state.active.len() < self.max_concurrent {
                    let Some(id) = state.queue.next_pending() else {
                        break;
                    };
                    let Some(job) = state.queue.get_mut(&id) else {
                        break;
                    };
                    if let Err(e) = job.transition(JobStatus::Rendering) {
                        tracing::error!(job_id = %id, error = %e, "Cannot start job");
                        break;
                    }
                    let job = job.clone();
                    let token = self.shutdown.child_token();
                    state.active.insert(id, token.clone());
                    state.busy = true;
                    started.push((job, token));
                }
            }
            if state.busy && state.active.is_empty() && started.is_empty() {
                let more = state.running && state.queue.next_pending().is_some();
                if !more {
                    state.busy = false;
                    drained = true;
                }
            }
        }

        if !started.is_empty() {
            self.persist().await;
        }
        for (job, token) in started {
            tracing::info!(job_id = %job.id, project = %job.project.display(), "Render admitted");
            self.emit(QueueEvent::StatusChanged {
                id: job.id,
                from: JobStatus::Pending,
                to: JobStatus::Rendering,
            });
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_job(job, token).await });
        }
        if drained {
            tracing::info!("Queue drained");
            self.emit(QueueEvent::Drained);
        }
    }

    async fn run_job(self: Arc<Self>, job: Job, cancel: CancellationToken) {
        let id = job.id;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = RenderRequest {
            job_id: id,
            project: job.project.clone(),
            settings: job.settings.clone(),
        };
        let renderer = Arc::clone(&self.renderer);
        let render = renderer.render(request, tx, cancel);
        tokio::pin!(render);

        let result = loop {
            tokio::select! {
                result = &mut render => break result,
                Some(event) = rx.recv() => self.on_render_event(id, event).await,
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.on_render_event(id, event).await;
        }

        self.finish_job(id, result.map(|_| ())).await;
    }

    async fn on_render_event(&self, id: JobId, event: RenderEvent) {
        match event {
            RenderEvent::Progress(progress) => {
                if let Some(job) = self.state.lock().await.queue.get_mut(&id) {
                    job.progress = progress.clamp(0.0, 1.0);
                }
                self.emit(QueueEvent::Progress { id, progress });
            }
            RenderEvent::Output(line) | RenderEvent::Status(line) => {
                tracing::debug!(job_id = %id, "{}", line);
                self.emit(QueueEvent::Output { id, line });
            }
            RenderEvent::LogFile(path) => {
                if let Some(job) = self.state.lock().await.queue.get_mut(&id) {
                    job.log_path = Some(path);
                }
            }
        }
    }

    async fn finish_job(self: &Arc<Self>, id: JobId, result: Result<()>) {
        let (next, error) = match result {
            Ok(()) => (JobStatus::Completed, None),
            Err(FarmError::RendererCancelled) => (JobStatus::Cancelled, None),
            Err(e) => (JobStatus::Failed, Some(e.to_string())),
        };

        let mut compose = None;
        let from = {
            let mut state = self.state.lock().await;
            state.active.remove(&id);
            let Some(job) = state.queue.get_mut(&id) else {
                return;
            };
            let from = job.status;
            if let Err(e) = job.transition(next) {
                tracing::error!(job_id = %id, error = %e, "Job finished in an unexpected state");
                return;
            }
            job.error = error.clone();
            if next == JobStatus::Completed
                && job.settings.compose_layers
                && job.settings.layer_comp.is_some()
            {
                compose = Some(job.clone());
            }
            from
        };

        match (&next, &error) {
            (JobStatus::Failed, Some(e)) => tracing::warn!(job_id = %id, error = %e, "Render failed"),
            _ => tracing::info!(job_id = %id, status = %next, "Render finished"),
        }
        self.persist().await;
        self.emit(QueueEvent::StatusChanged { id, from, to: next });

        if let (Some(job), Some(compositor)) = (compose, &self.compositor) {
            let line = match compositor.compose(&job).await {
                Ok(()) => "Layer comps composited".to_string(),
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Compositing failed");
                    format!("Compositing failed: {}", e)
                }
            };
            self.emit(QueueEvent::Output { id, line });
        }

        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::RenderSummary;
    use async_trait::async_trait;
    use std::time::Duration;

    struct InstantRenderer;

    #[async_trait]
    impl Renderer for InstantRenderer {
        async fn render(
            &self,
            _request: RenderRequest,
            events: mpsc::UnboundedSender<RenderEvent>,
            _cancel: CancellationToken,
        ) -> Result<RenderSummary> {
            let _ = events.send(RenderEvent::Progress(1.0));
            Ok(RenderSummary {
                elapsed: Duration::ZERO,
                log_path: None,
                compositions: 0,
            })
        }
    }

    fn project(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"project").unwrap();
        path
    }

    #[tokio::test]
    async fn rejects_bad_concurrency() {
        let result = QueueManager::builder(Arc::new(InstantRenderer))
            .max_concurrent(0)
            .open()
            .await;
        assert!(matches!(result, Err(FarmError::Validation(_))));
    }

    #[tokio::test]
    async fn enqueue_validates_project_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::builder(Arc::new(InstantRenderer))
            .open()
            .await
            .unwrap();

        let missing = qm
            .add(dir.path().join("nope.moho"), RenderSettings::default())
            .await;
        assert!(matches!(missing, Err(FarmError::Validation(_))));

        let wrong_ext = project(dir.path(), "notes.txt");
        assert!(qm.add(wrong_ext, RenderSettings::default()).await.is_err());

        let job = Job::new(project(dir.path(), "a.moho"), RenderSettings::default());
        let dup = job.clone();
        qm.enqueue(job).await.unwrap();
        assert!(matches!(
            qm.enqueue(dup).await,
            Err(FarmError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn cancel_pending_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::builder(Arc::new(InstantRenderer))
            .open()
            .await
            .unwrap();
        let id = qm
            .add(project(dir.path(), "a.moho"), RenderSettings::default())
            .await
            .unwrap();
        assert!(matches!(
            qm.cancel(&id).await,
            Err(FarmError::InvalidState {
                status: JobStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn runs_to_drained() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::builder(Arc::new(InstantRenderer))
            .open()
            .await
            .unwrap();
        let a = qm
            .add(project(dir.path(), "a.moho"), RenderSettings::default())
            .await
            .unwrap();
        assert!(qm.is_idle().await);

        qm.start().await;
        tokio::time::timeout(Duration::from_secs(5), qm.wait_idle())
            .await
            .unwrap();
        let job = qm.get(&a).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        qm.shutdown().await;
    }

    #[tokio::test]
    async fn farm_jobs_stay_out_of_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        let qm = QueueManager::builder(Arc::new(InstantRenderer))
            .snapshot(store.clone())
            .open()
            .await
            .unwrap();

        let local = qm
            .add(project(dir.path(), "mine.moho"), RenderSettings::default())
            .await
            .unwrap();
        let mut farm = Job::new(project(dir.path(), "theirs.moho"), RenderSettings::default());
        farm.origin = JobOrigin::Farm;
        qm.enqueue(farm).await.unwrap();
        assert_eq!(qm.jobs().await.len(), 2);

        let saved = store.load().await.unwrap();
        assert_eq!(saved.iter().map(|j| j.id).collect::<Vec<_>>(), vec![local]);
    }

    #[tokio::test]
    async fn restore_drops_farm_jobs_from_older_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        let mine = Job::new(project(dir.path(), "mine.moho"), RenderSettings::default());
        let mut theirs = Job::new(project(dir.path(), "theirs.moho"), RenderSettings::default());
        theirs.origin = JobOrigin::Farm;
        theirs.status = JobStatus::Rendering;
        store.save(&[mine.clone(), theirs]).await.unwrap();

        let qm = QueueManager::builder(Arc::new(InstantRenderer))
            .snapshot(store)
            .open()
            .await
            .unwrap();
        let jobs = qm.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, mine.id);
    }
}
