use crate::error::{FarmError, Result};
use crate::render::RenderSettings;
use crate::scheduler::job::{Job, JobId, JobOrigin, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Ordered render queue for one machine. Position is render order.
#[derive(Debug, Default, Clone)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self { jobs }
    }

    fn position(&self, id: &JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == *id)
    }

    fn index_of(&self, id: &JobId) -> Result<usize> {
        self.position(id).ok_or(FarmError::JobNotFound(*id))
    }

    /// Append a job. Ids are unique within the queue.
    pub fn push(&mut self, job: Job) -> Result<()> {
        if self.position(&job.id).is_some() {
            return Err(FarmError::DuplicateJob(job.id));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == *id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == *id)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Remove a job that is not currently rendering.
    pub fn remove(&mut self, id: &JobId) -> Result<Job> {
        let idx = self.index_of(id)?;
        let status = self.jobs[idx].status;
        if status.is_active() {
            return Err(FarmError::InvalidState {
                job_id: *id,
                status,
                action: "remove",
            });
        }
        Ok(self.jobs.remove(idx))
    }

    /// Swap a job with its neighbour. Returns `false` at the boundaries.
    pub fn move_job(&mut self, id: &JobId, direction: Direction) -> Result<bool> {
        let idx = self.index_of(id)?;
        let target = match direction {
            Direction::Up if idx > 0 => idx - 1,
            Direction::Down if idx + 1 < self.jobs.len() => idx + 1,
            _ => return Ok(false),
        };
        self.jobs.swap(idx, target);
        Ok(true)
    }

    /// Clone a job's project and settings into a new pending job placed
    /// right after the original.
    pub fn duplicate(&mut self, id: &JobId) -> Result<JobId> {
        let idx = self.index_of(id)?;
        let original = &self.jobs[idx];
        let copy = Job::new(original.project.clone(), original.settings.clone());
        let new_id = copy.id;
        self.jobs.insert(idx + 1, copy);
        Ok(new_id)
    }

    /// Put a failed or cancelled job back in line.
    pub fn retry(&mut self, id: &JobId) -> Result<()> {
        let job = self.get_mut(id).ok_or(FarmError::JobNotFound(*id))?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(FarmError::InvalidState {
                job_id: *id,
                status: job.status,
                action: "retry",
            });
        }
        job.transition(JobStatus::Pending)?;
        job.retry_count += 1;
        Ok(())
    }

    /// Replace the settings of a job that has not started rendering.
    pub fn update_settings(&mut self, id: &JobId, settings: RenderSettings) -> Result<()> {
        let job = self.get_mut(id).ok_or(FarmError::JobNotFound(*id))?;
        if job.status.is_active() {
            return Err(FarmError::InvalidState {
                job_id: *id,
                status: job.status,
                action: "edit",
            });
        }
        job.settings = settings;
        Ok(())
    }

    /// First pending job in queue order.
    pub fn next_pending(&self) -> Option<JobId> {
        self.jobs
            .iter()
            .find(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
    }

    /// Drop completed, failed and cancelled jobs. Returns how many went.
    pub fn clear_finished(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| !j.status.is_terminal());
        before - self.jobs.len()
    }

    /// Drop everything that is not rendering. Returns how many went.
    pub fn clear_all(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.status.is_active());
        before - self.jobs.len()
    }

    /// Reset jobs that were rendering when the previous process died.
    /// Drop jobs taken from a farm master. Returns their ids.
    pub fn drop_farm_jobs(&mut self) -> Vec<JobId> {
        let dropped = self
            .jobs
            .iter()
            .filter(|j| j.origin == JobOrigin::Farm)
            .map(|j| j.id)
            .collect();
        self.jobs.retain(|j| j.origin != JobOrigin::Farm);
        dropped
    }

    pub fn recover_interrupted(&mut self) -> usize {
        self.jobs
            .iter_mut()
            .map(|j| j.recover_interrupted())
            .filter(|recovered| *recovered)
            .count()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
