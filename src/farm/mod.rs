//! Master/slave render farm over HTTP+JSON.
//!
//! The master keeps the job pool in a [`FarmRegistry`] and serves it with
//! [`server::router`]. Slaves run a [`FarmAgent`] that pulls work into
//! their local queue. Projects that are not on shared storage travel as
//! zip bundles ([`transfer`]).

pub mod agent;
pub mod backoff;
pub mod client;
pub mod discovery;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transfer;

pub use agent::{AgentConfig, FarmAgent};
pub use backoff::Backoff;
pub use client::{FarmClient, SubmitOptions};
pub use registry::FarmRegistry;
pub use server::run_server;
