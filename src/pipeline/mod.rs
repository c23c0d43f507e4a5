//! Pipeline assembly, overlays, and execution.

mod builder;
mod executor;
mod metrics;
mod overlay;

#[cfg(test)]
mod executor_integration_tests;

pub use builder::{
    Binding, InputSource, Pipeline, PipelineBuilder, SourceRef, StageInstance,
};
pub use executor::{Executor, ExecutorConfig, RunState, RunSummary};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use overlay::{apply_dump_naming, apply_feature_toggle};
