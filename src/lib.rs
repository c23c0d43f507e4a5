//! Regional Pipeline Executor
//!
//! A configurable executor for fixed-topology streaming pipelines that
//! partition detector-style data into regions, route them to parallel
//! board processors, merge partial results deterministically, and dump
//! per-stage checkpoints for bit-exact comparison against hardware
//! reference traces.
//!
//! # Architecture
//!
//! The crate consists of:
//!
//! - **Region**: Immutable region maps and board groupings with
//!   copy-on-write variant cloning
//! - **Stage**: Descriptor registry plus the opaque handler seam for
//!   domain algorithms
//! - **Pipeline**: DAG assembly with topological validation, overlays,
//!   and the board-parallel executor
//! - **I/O**: Injected external feeds and deterministic dump output
//!
//! # Usage
//!
//! ```no_run
//! use regionpipe::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod record;
pub mod region;
pub mod stage;

pub use config::Config;
pub use error::{ConfigError, Error, ExecError, FeedError};
pub use io::{DumpRouter, DumpSpec, FeedSource, JsonFileFeeds, MemoryFeeds};
pub use pipeline::{
    apply_dump_naming, apply_feature_toggle, Executor, ExecutorConfig, Metrics, Pipeline,
    PipelineBuilder, RunState, RunSummary, SourceRef,
};
pub use region::{strided_regions, Board, BoardGrouping, Region, RegionMap};
pub use stage::{HandlerRegistry, SlotDecl, StageDescriptor, StageHandler, StageRegistry};

use crate::error::ConfigError as CfgErr;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Compile a declarative configuration into a validated pipeline.
///
/// Assembly order: region map, board grouping, stage registry (with
/// clones), builder (with bindings), then dump naming and feature
/// toggles as overlays.
pub fn compile_pipeline(config: &Config) -> Result<Pipeline, Error> {
    // Region map
    let mut map = RegionMap::new();
    for region in &config.topology.regions {
        map.define(region.id, region.boundaries.clone())?;
    }

    // Board grouping
    let mut boards = BoardGrouping::new(&map);
    for board in &config.topology.boards {
        let regions = match &board.strided {
            Some(spec) => strided_regions(spec.start, spec.len, spec.stride, spec.repeats),
            None => board.regions.clone(),
        };
        boards.group(board.id, regions)?;
    }

    tracing::info!(
        "Topology: {} regions, {}",
        map.len(),
        boards.coverage()
    );

    // Stage registry, base descriptors then clones
    let mut registry = StageRegistry::new();
    for stage in &config.stages {
        let inputs = stage
            .inputs
            .iter()
            .map(|s| SlotDecl::new(&s.slot, &s.ty))
            .collect();
        let outputs = stage
            .outputs
            .iter()
            .map(|s| SlotDecl::new(&s.slot, &s.ty))
            .collect();
        registry.register(StageDescriptor::new(
            &stage.name,
            &stage.kind,
            inputs,
            outputs,
            stage.params.clone(),
            stage.board_parallel,
        ))?;
    }
    for clone in &config.clones {
        registry.clone_stage(&clone.base, &clone.name, &clone.params)?;
    }

    // Pipeline assembly
    let feeds: BTreeMap<String, String> = config
        .feeds
        .iter()
        .map(|f| (f.name.clone(), f.ty.clone()))
        .collect();
    let mut builder = PipelineBuilder::new(
        Arc::new(map),
        Arc::new(boards),
        feeds,
        config.run_label.clone(),
    );

    for instance in &config.pipeline {
        let descriptor = registry.lookup(&instance.stage)?;
        let mut bindings = BTreeMap::new();
        for (slot, raw) in &instance.bindings {
            let source = SourceRef::parse(raw).ok_or_else(|| CfgErr::UnresolvedInput {
                stage: instance.stage.clone(),
                slot: slot.clone(),
                origin: raw.clone(),
            })?;
            bindings.insert(slot.clone(), source);
        }
        builder.add_stage(descriptor, &bindings)?;
    }

    let mut pipeline = builder.finalize()?;

    // Overlays: dump naming first, then feature toggles in order.
    if let Some(dump) = &config.output.dump {
        let stages: BTreeSet<String> = dump.stages.iter().cloned().collect();
        pipeline = apply_dump_naming(&pipeline, &stages, &dump.template)?;
    }
    for toggle in &config.toggles {
        pipeline =
            apply_feature_toggle(&pipeline, &toggle.stage, &toggle.flag, toggle.value.clone())?;
    }

    Ok(pipeline)
}

/// Run the full pipeline with the given configuration and the built-in
/// stage handlers.
pub async fn run_pipeline(config: Config) -> Result<RunSummary, Error> {
    let feeds = Arc::new(JsonFileFeeds::from_file(
        std::path::Path::new(&config.input.feed_path),
    )?);
    run_pipeline_with(config, Arc::new(HandlerRegistry::builtin()), feeds).await
}

/// Run the full pipeline with caller-supplied handlers and feeds.
pub async fn run_pipeline_with(
    config: Config,
    handlers: Arc<HandlerRegistry>,
    feeds: Arc<dyn FeedSource>,
) -> Result<RunSummary, Error> {
    tracing::info!("Starting regional pipeline run {}", config.run_label);

    let pipeline = compile_pipeline(&config)?;
    tracing::info!(
        "Pipeline compiled: {} stage instances, {} external feeds",
        pipeline.instances().len(),
        pipeline.referenced_feeds().len()
    );

    let executor_config = ExecutorConfig {
        board_concurrency: config.processing.board_concurrency,
        record_timeout: config.processing.record_timeout_ms.map(Duration::from_millis),
        output_dir: PathBuf::from(&config.output.directory),
        enable_metrics: config.processing.enable_metrics,
        metrics_interval_secs: config.processing.metrics_interval_secs,
        metrics_output_path: config.processing.metrics_output_path.clone(),
    };

    let mut executor = Executor::new(handlers, executor_config);
    executor.load(pipeline, feeds)?;
    let summary = executor.run(config.processing.max_records).await?;

    tracing::info!("Run complete: {}", summary);
    Ok(summary)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrel_config() -> Config {
        Config::from_yaml(
            r#"
run_label: smoke
input:
  feed_path: feeds.json
topology:
  regions:
    - {id: 0, boundaries: [-3.0, -1.5]}
    - {id: 1, boundaries: [-1.5, 0.0]}
    - {id: 2, boundaries: [0.0, 1.5]}
    - {id: 3, boundaries: [1.5, 3.0]}
  boards:
    - id: 0
      strided: {start: 0, len: 2, stride: 4, repeats: 1}
    - id: 1
      regions: [2, 3]
feeds:
  - {name: gtt_tracks, type: tracks}
stages:
  - name: track_conv
    kind: passthrough
    inputs: [{slot: raw, type: tracks}]
    outputs: [{slot: tracks, type: tracks}]
  - name: layer1
    kind: label
    inputs: [{slot: tracks, type: tracks}]
    outputs: [{slot: candidates, type: tracks}]
    params: {eta_splits: 2}
    board_parallel: true
clones:
  - base: layer1
    name: layer1_fine
    params: {eta_splits: 4}
pipeline:
  - stage: track_conv
    bindings: {raw: "feed:gtt_tracks"}
  - stage: layer1
    bindings: {tracks: "track_conv.tracks"}
  - stage: layer1_fine
    bindings: {tracks: "track_conv.tracks"}
toggles:
  - {stage: layer1, flag: eta_splits, value: 3}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_pipeline() {
        let pipeline = compile_pipeline(&barrel_config()).unwrap();
        assert_eq!(pipeline.instances().len(), 3);
        assert_eq!(pipeline.boards().len(), 2);
        assert_eq!(pipeline.region_map().len(), 4);

        // Toggle applied to layer1 only; the clone keeps its own override.
        assert_eq!(
            pipeline.instance("layer1").unwrap().descriptor().param("eta_splits"),
            Some(&serde_json::json!(3))
        );
        assert_eq!(
            pipeline
                .instance("layer1_fine")
                .unwrap()
                .descriptor()
                .param("eta_splits"),
            Some(&serde_json::json!(4))
        );
    }

    #[test]
    fn test_compile_rejects_unknown_clone_base() {
        let mut config = barrel_config();
        config.clones[0].base = "layer9".to_string();
        assert!(matches!(
            compile_pipeline(&config).unwrap_err(),
            Error::Config(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_compile_rejects_malformed_binding() {
        let mut config = barrel_config();
        config.pipeline[0]
            .bindings
            .insert("raw".to_string(), "gtt_tracks".to_string());
        assert!(matches!(
            compile_pipeline(&config).unwrap_err(),
            Error::Config(ConfigError::UnresolvedInput { .. })
        ));
    }

    #[test]
    fn test_compile_rejects_duplicate_board_region() {
        let mut config = barrel_config();
        config.topology.boards[1].regions = vec![1, 2];
        assert!(matches!(
            compile_pipeline(&config).unwrap_err(),
            Error::Config(ConfigError::DuplicateRegionAssignment { region: 1, .. })
        ));
    }

    #[test]
    fn test_compile_rejects_toggle_on_unknown_flag() {
        let mut config = barrel_config();
        config.toggles[0].flag = "eta_spltis".to_string();
        assert!(matches!(
            compile_pipeline(&config).unwrap_err(),
            Error::Config(ConfigError::UnknownParameter { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_pipeline_with_memory_feeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = barrel_config();
        config.output.directory = dir.path().to_string_lossy().to_string();
        config.processing.enable_metrics = false;

        let mut feeds = MemoryFeeds::new();
        feeds.insert(
            "gtt_tracks",
            vec![vec![
                serde_json::json!({"region": 0, "pt": 1.0}),
                serde_json::json!({"region": 2, "pt": 2.0}),
            ]],
        );

        let summary = run_pipeline_with(
            config,
            Arc::new(HandlerRegistry::builtin()),
            Arc::new(feeds),
        )
        .await
        .unwrap();
        assert_eq!(summary.records_processed, 1);
        assert_eq!(summary.stage_instances, 3);
    }

    #[tokio::test]
    async fn test_run_pipeline_missing_feed_file_is_feed_error() {
        let mut config = barrel_config();
        config.input.feed_path = "/nonexistent/feeds.json".to_string();

        let err = run_pipeline(config).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
