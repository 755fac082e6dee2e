//! Records exchanged between farm nodes and the master over HTTP+JSON.
//!
//! Every payload is a named struct so fields can be added later without
//! breaking older nodes; optional fields carry `#[serde(default)]`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::render::RenderSettings;
use crate::scheduler::job::{Job, JobId, NodeId};

/// Carried by every status payload so discovery can tell a farm master
/// from any other HTTP server on the port.
pub const SERVICE_NAME: &str = "render-farm";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    /// Port the node listens on, part of its identity.
    #[serde(default)]
    pub port: u16,
    /// Jobs the node renders at once.
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: NodeId,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub progress: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    /// Jobs the node currently holds.
    #[serde(default)]
    pub jobs: Vec<JobProgress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Held jobs the master wants stopped.
    #[serde(default)]
    pub cancel_jobs: Vec<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetJobRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetJobResponse {
    pub job: Option<Job>,
}

/// How a farm job ended on its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleteRequest {
    pub node_id: NodeId,
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleteResponse {
    /// `false` when the report changed nothing: the job was already
    /// finished or no longer belongs to the reporting node.
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobRequest {
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub project: PathBuf,
    #[serde(default)]
    pub settings: RenderSettings,
    /// Project files were uploaded to the master as a bundle.
    #[serde(default)]
    pub bundled: bool,
    #[serde(default)]
    pub pinned_to: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Online,
    Rendering,
    Offline,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Online => write!(f, "online"),
            NodeState::Rendering => write!(f, "rendering"),
            NodeState::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub hostname: String,
    pub address: String,
    pub capacity: usize,
    pub state: NodeState,
    pub current_jobs: Vec<JobProgress>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Seconds since the last heartbeat.
    pub last_seen_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub service: String,
    pub nodes: Vec<NodeInfo>,
    pub jobs: Vec<Job>,
    pub pending: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueResponse {
    pub pending: Vec<Job>,
    pub active: Vec<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
