pub mod buildfile;
pub mod dockerfile;
pub mod error;
pub mod graph;
pub mod image;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod reproduce;
pub mod security;
pub mod stages;
pub mod validation;

pub use buildfile::Buildfile;
pub use error::PipelineError;
pub use image::RuntimeImage;
pub use pipeline::{PipelineExecutor, PipelineRun, PipelineState, StageRegistry};
