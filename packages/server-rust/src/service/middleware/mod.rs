//! Tower middleware layers for the execution pipeline.
//!
//! - [`metrics`]: Execution timing and outcome via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes the layers around the execution router

pub mod metrics;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use pipeline::{build_execution_pipeline, ExecutionPipeline};
