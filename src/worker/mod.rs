//! Render execution on this machine.
//!
//! - [`RenderSupervisor`]: launches the external renderer, follows its
//!   output and output folder, and turns the exit into a [`Result`].
//! - [`progress`]: output line classification and progress estimation.
//! - [`heartbeat`]: status lines for renders that have gone quiet.
//! - [`compose`]: optional post-processing of finished layer comps.
//!
//! The queue manager only sees the [`Renderer`] trait, so tests and other
//! backends can stand in for the real process.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::render::RenderSettings;
use crate::scheduler::job::JobId;

pub mod compose;
pub mod heartbeat;
pub mod progress;
pub mod supervisor;

pub use compose::{CommandCompositor, Compositor};
pub use supervisor::RenderSupervisor;

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub job_id: JobId,
    pub project: PathBuf,
    pub settings: RenderSettings,
}

/// What a render reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    Progress(f32),
    /// A renderer output line worth keeping.
    Output(String),
    /// A synthetic status line, e.g. while the renderer is quiet.
    Status(String),
    /// Per-job log file chosen for this attempt.
    LogFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RenderSummary {
    pub elapsed: Duration,
    pub log_path: Option<PathBuf>,
    pub compositions: u32,
}

/// Runs one render attempt to completion.
///
/// Implementations report through `events` and must return
/// [`FarmError::RendererCancelled`](crate::error::FarmError::RendererCancelled)
/// once `cancel` fires, after stopping all work for the attempt.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        request: RenderRequest,
        events: mpsc::UnboundedSender<RenderEvent>,
        cancel: CancellationToken,
    ) -> Result<RenderSummary>;
}
