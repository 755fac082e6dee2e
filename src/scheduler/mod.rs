//! Local job scheduling: the job model, the ordered queue, its snapshot
//! and the manager that runs it.

pub mod job;
pub mod manager;
pub mod queue;
pub mod snapshot;

pub use job::{Job, JobId, JobOrigin, JobStatus, NodeId};
pub use manager::{QueueCounts, QueueEvent, QueueManager, QueueManagerBuilder};
pub use queue::{Direction, JobQueue};
pub use snapshot::SnapshotStore;
