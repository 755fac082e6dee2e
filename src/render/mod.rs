//! Render settings and their mapping onto the renderer's command line.

pub mod args;
pub mod settings;

pub use args::render_args;
pub use settings::{validate_project, LayerComp, OutputFormat, RenderSettings};
