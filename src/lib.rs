pub mod config;
pub mod error;
pub mod farm;
pub mod render;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
