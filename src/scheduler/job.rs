use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FarmError, Result};
use crate::render::RenderSettings;

/// Stable job identifier, generated once and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First block of the uuid is what operators see in logs and tables.
        let s = self.0.to_string();
        if f.alternate() {
            write!(f, "{}", &s[..8])
        } else {
            write!(f, "{}", s)
        }
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Farm node identifier: the node's address plus a random token, so a node
/// that restarts on the same address never collides with its old record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn generate(address: &str) -> Self {
        Self(format!("{}-{:08x}", address, rand::random::<u32>()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// Farm only: claimed by a node, not yet confirmed by its heartbeat.
    Reserved,
    Rendering,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Reserved and rendering jobs are owned by a supervisor or a farm node.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Reserved | JobStatus::Rendering)
    }

    /// The job state machine. Local queues use
    /// `pending -> rendering -> {completed, failed, cancelled}` and
    /// `{failed, cancelled} -> pending`; the farm pool adds the `reserved`
    /// hop and the release edges back to `pending`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Rendering)
                | (Pending, Reserved)
                | (Reserved, Rendering)
                | (Reserved, Pending)
                | (Rendering, Pending)
                | (Rendering, Completed)
                | (Rendering, Failed)
                | (Rendering, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Reserved => write!(f, "reserved"),
            JobStatus::Rendering => write!(f, "rendering"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where a farm job's project files come from when they are not reachable
/// from the rendering node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Path of the project file relative to the bundle root.
    pub project_entry: String,
}

/// Whose job this is on the machine that renders it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    /// Queued by the user of this machine.
    #[default]
    Local,
    /// Taken from a farm master. The master owns it; it is never written
    /// to this machine's queue snapshot.
    Farm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project: PathBuf,
    pub settings: RenderSettings,
    pub status: JobStatus,
    /// Fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub assigned_node: Option<NodeId>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub transfer: Option<TransferInfo>,
    #[serde(default)]
    pub origin: JobOrigin,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(project: impl Into<PathBuf>, settings: RenderSettings) -> Self {
        Self::with_id(JobId::new(), project, settings)
    }

    pub fn with_id(id: JobId, project: impl Into<PathBuf>, settings: RenderSettings) -> Self {
        Self {
            id,
            project: project.into(),
            settings,
            status: JobStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            assigned_node: None,
            error: None,
            log_path: None,
            transfer: None,
            origin: JobOrigin::Local,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Project file name without extension, for display.
    pub fn project_name(&self) -> String {
        self.project
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Move the job to `next`, enforcing the state machine and maintaining
    /// the timing fields that go with each state.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FarmError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        match next {
            JobStatus::Pending => {
                self.progress = 0.0;
                self.error = None;
                self.assigned_node = None;
                self.started_at = None;
                self.finished_at = None;
            }
            JobStatus::Rendering => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobStatus::Completed => {
                self.progress = 1.0;
                self.finished_at = Some(Utc::now());
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                self.finished_at = Some(Utc::now());
            }
            JobStatus::Reserved => {}
        }
        self.status = next;
        Ok(())
    }

    /// A job read back from disk while marked rendering was interrupted by a
    /// crash; put it back in line instead of dropping it.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.status.is_active() {
            self.status = JobStatus::Pending;
            self.progress = 0.0;
            self.assigned_node = None;
            self.started_at = None;
            self.finished_at = None;
            true
        } else {
            false
        }
    }

    /// Wall-clock render time so far, or total once finished.
    pub fn elapsed(&self) -> chrono::Duration {
        match self.started_at {
            Some(start) => self.finished_at.unwrap_or_else(Utc::now) - start,
            None => chrono::Duration::zero(),
        }
    }

    /// Human readable elapsed time: `1h 2m 3s`, `2m 3s` or `3s`.
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed().num_seconds().max(0) as u64)
    }
}

pub fn format_elapsed(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
