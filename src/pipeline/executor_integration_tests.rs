//! Integration tests for the executor at interface boundaries.
//!
//! Covers:
//! 1. Full pipeline runs with board-parallel and serialized stages
//! 2. Failure semantics (state machine, record index reporting)
//! 3. Dump determinism (two identical runs, byte-identical files)
//! 4. Per-record timeout handling

use crate::error::{ConfigError, Error, ExecError};
use crate::io::MemoryFeeds;
use crate::pipeline::{
    apply_dump_naming, Executor, ExecutorConfig, Pipeline, PipelineBuilder, RunState, SourceRef,
};
use crate::record::{Batch, SlotValues};
use crate::region::{strided_regions, BoardGrouping, RegionMap};
use crate::stage::{
    HandlerRegistry, SlotDecl, StageContext, StageDescriptor, StageError, StageHandler,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Nine-region map grouped into three strided boards.
fn barrel_topology() -> (Arc<RegionMap>, Arc<BoardGrouping>) {
    let mut map = RegionMap::new();
    for id in 0..9 {
        map.define(id, vec![-3.0, 0.0, 3.0]).unwrap();
    }
    let mut boards = BoardGrouping::new(&map);
    for board_id in 0..3 {
        boards
            .group(board_id, strided_regions(board_id * 3, 3, 3, 1))
            .unwrap();
    }
    (Arc::new(map), Arc::new(boards))
}

fn track_batch() -> Batch {
    (0..9u32)
        .map(|region| json!({"region": region, "pt": region as f64 + 0.5}))
        .collect()
}

fn feeds(records: usize) -> Arc<MemoryFeeds> {
    let mut feeds = MemoryFeeds::new();
    feeds.insert("gtt_tracks", (0..records).map(|_| track_batch()).collect());
    Arc::new(feeds)
}

/// track conversion (serial) → regional layer-1 (board-parallel) → layer-2 aggregation (serial)
fn build_pipeline() -> Pipeline {
    let (map, boards) = barrel_topology();
    let mut builder = PipelineBuilder::new(
        map,
        boards,
        BTreeMap::from([("gtt_tracks".to_string(), "tracks".to_string())]),
        "itest",
    );

    builder
        .add_stage(
            Arc::new(StageDescriptor::new(
                "track_conv",
                "passthrough",
                vec![SlotDecl::new("raw", "tracks")],
                vec![SlotDecl::new("tracks", "tracks")],
                BTreeMap::new(),
                false,
            )),
            &BTreeMap::from([("raw".to_string(), SourceRef::Feed("gtt_tracks".to_string()))]),
        )
        .unwrap();

    builder
        .add_stage(
            Arc::new(StageDescriptor::new(
                "layer1_barrel",
                "label",
                vec![SlotDecl::new("tracks", "tracks")],
                vec![SlotDecl::new("candidates", "tracks")],
                BTreeMap::new(),
                true,
            )),
            &BTreeMap::from([(
                "tracks".to_string(),
                SourceRef::StageOutput {
                    stage: "track_conv".to_string(),
                    slot: "tracks".to_string(),
                },
            )]),
        )
        .unwrap();

    builder
        .add_stage(
            Arc::new(StageDescriptor::new(
                "layer2",
                "merge",
                vec![SlotDecl::new("candidates", "tracks")],
                vec![SlotDecl::new("out", "tracks")],
                BTreeMap::new(),
                false,
            )),
            &BTreeMap::from([(
                "candidates".to_string(),
                SourceRef::StageOutput {
                    stage: "layer1_barrel".to_string(),
                    slot: "candidates".to_string(),
                },
            )]),
        )
        .unwrap();

    builder.finalize().unwrap()
}

fn executor(output_dir: &std::path::Path) -> Executor {
    Executor::new(
        Arc::new(HandlerRegistry::builtin()),
        ExecutorConfig {
            output_dir: output_dir.to_path_buf(),
            ..ExecutorConfig::default()
        },
    )
}

#[tokio::test]
async fn test_full_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut exec = executor(dir.path());
    assert_eq!(exec.state(), RunState::Idle);

    exec.load(build_pipeline(), feeds(3)).unwrap();
    assert_eq!(exec.state(), RunState::Loaded);

    let summary = exec.run(0).await.unwrap();
    assert_eq!(exec.state(), RunState::Completed);
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.stage_instances, 3);

    let snapshot = exec.metrics().snapshot();
    assert_eq!(snapshot.records_processed, 3);
    // 3 stages per record, 3 board tasks for the board-parallel one.
    assert_eq!(snapshot.stage_invocations, 9);
    assert_eq!(snapshot.board_tasks, 9);
}

#[tokio::test]
async fn test_max_records_bounds_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut exec = executor(dir.path());
    exec.load(build_pipeline(), feeds(5)).unwrap();

    let summary = exec.run(2).await.unwrap();
    assert_eq!(summary.records_processed, 2);
}

#[tokio::test]
async fn test_load_rejects_missing_feed() {
    let dir = tempfile::tempdir().unwrap();
    let mut exec = executor(dir.path());

    let empty = Arc::new(MemoryFeeds::new());
    let err = exec.load(build_pipeline(), empty).unwrap_err();
    assert!(matches!(
        err,
        Error::Exec(ExecError::MissingExternalFeed(ref name)) if name == "gtt_tracks"
    ));
    assert_eq!(exec.state(), RunState::Idle);
}

#[tokio::test]
async fn test_load_rejects_unknown_handler() {
    let dir = tempfile::tempdir().unwrap();
    let mut exec = Executor::new(
        Arc::new(HandlerRegistry::new()),
        ExecutorConfig {
            output_dir: dir.path().to_path_buf(),
            ..ExecutorConfig::default()
        },
    );

    let err = exec.load(build_pipeline(), feeds(1)).unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::UnknownHandler { .. })
    ));
}

#[tokio::test]
async fn test_run_requires_loaded_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut exec = executor(dir.path());
    let err = exec.run(0).await.unwrap_err();
    assert!(matches!(err, Error::Exec(ExecError::InvalidState { .. })));
}

/// Handler that fails on a chosen record index.
struct FailOn {
    record: u64,
}

impl StageHandler for FailOn {
    fn execute(
        &self,
        ctx: &StageContext<'_>,
        inputs: &SlotValues,
    ) -> Result<SlotValues, StageError> {
        if ctx.record == self.record {
            return Err(StageError::new("synthetic failure"));
        }
        crate::stage::Passthrough.execute(ctx, inputs)
    }
}

#[tokio::test]
async fn test_stage_failure_surfaces_record_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut handlers = HandlerRegistry::builtin();
    handlers.insert("flaky", Arc::new(FailOn { record: 1 }));

    let (map, boards) = barrel_topology();
    let mut builder = PipelineBuilder::new(
        map,
        boards,
        BTreeMap::from([("gtt_tracks".to_string(), "tracks".to_string())]),
        "itest",
    );
    builder
        .add_stage(
            Arc::new(StageDescriptor::new(
                "layer1_barrel",
                "flaky",
                vec![SlotDecl::new("tracks", "tracks")],
                vec![SlotDecl::new("candidates", "tracks")],
                BTreeMap::new(),
                true,
            )),
            &BTreeMap::from([(
                "tracks".to_string(),
                SourceRef::Feed("gtt_tracks".to_string()),
            )]),
        )
        .unwrap();
    let pipeline = builder.finalize().unwrap();

    let mut exec = Executor::new(
        Arc::new(handlers),
        ExecutorConfig {
            output_dir: dir.path().to_path_buf(),
            ..ExecutorConfig::default()
        },
    );
    exec.load(pipeline, feeds(3)).unwrap();

    let err = exec.run(0).await.unwrap_err();
    assert_eq!(exec.state(), RunState::Failed);
    assert!(matches!(
        err,
        Error::Exec(ExecError::Stage { record: 1, ref stage, .. }) if stage == "layer1_barrel"
    ));

    // Record 0 completed before the failure.
    let snapshot = exec.metrics().snapshot();
    assert_eq!(snapshot.records_processed, 1);
    assert_eq!(snapshot.records_failed, 1);
}

/// Handler that sleeps longer than any sane record budget.
struct Stall;

impl StageHandler for Stall {
    fn execute(
        &self,
        _ctx: &StageContext<'_>,
        _inputs: &SlotValues,
    ) -> Result<SlotValues, StageError> {
        std::thread::sleep(std::time::Duration::from_millis(200));
        Ok(SlotValues::new())
    }
}

#[tokio::test]
async fn test_record_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut handlers = HandlerRegistry::builtin();
    handlers.insert("stall", Arc::new(Stall));

    let (map, boards) = barrel_topology();
    let mut builder = PipelineBuilder::new(
        map,
        boards,
        BTreeMap::from([("gtt_tracks".to_string(), "tracks".to_string())]),
        "itest",
    );
    builder
        .add_stage(
            Arc::new(StageDescriptor::new(
                "slow",
                "stall",
                vec![SlotDecl::new("tracks", "tracks")],
                vec![],
                BTreeMap::new(),
                false,
            )),
            &BTreeMap::from([(
                "tracks".to_string(),
                SourceRef::Feed("gtt_tracks".to_string()),
            )]),
        )
        .unwrap();
    let pipeline = builder.finalize().unwrap();

    let mut exec = Executor::new(
        Arc::new(handlers),
        ExecutorConfig {
            output_dir: dir.path().to_path_buf(),
            record_timeout: Some(std::time::Duration::from_millis(20)),
            ..ExecutorConfig::default()
        },
    );
    exec.load(pipeline, feeds(1)).unwrap();

    let err = exec.run(0).await.unwrap_err();
    assert_eq!(exec.state(), RunState::Failed);
    assert!(matches!(
        err,
        Error::Exec(ExecError::RecordTimeout { record: 0, .. })
    ));
}

#[tokio::test]
async fn test_board_merge_is_deterministic_and_region_routed() {
    let dir = tempfile::tempdir().unwrap();
    let mut exec = executor(dir.path());
    exec.load(build_pipeline(), feeds(1)).unwrap();
    exec.run(0).await.unwrap();

    // All 9 input items routed through the boards and back out.
    let snapshot = exec.metrics().snapshot();
    assert_eq!(snapshot.board_tasks, 3);
    // track_conv: 9 in; layer1: 9 in; layer2: 9 in.
    assert_eq!(snapshot.items_in, 27);
}

async fn run_with_dumps(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let pipeline = build_pipeline();
    let stages = BTreeSet::from(["layer1_barrel".to_string(), "layer2".to_string()]);
    let pipeline = apply_dump_naming(&pipeline, &stages, "{run}_{stage}_{board}.dump").unwrap();

    let mut exec = executor(dir);
    exec.load(pipeline, feeds(2)).unwrap();
    exec.run(0).await.unwrap();

    let mut files: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().to_string(),
                std::fs::read(entry.path()).unwrap(),
            )
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

#[tokio::test]
async fn test_dump_files_per_stage_board_pair() {
    let dir = tempfile::tempdir().unwrap();
    let files = run_with_dumps(dir.path()).await;

    let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
    // Board-parallel stage: one file per board. Serial stage: one "all" file.
    assert_eq!(
        names,
        vec![
            "itest_layer1_barrel_0.dump",
            "itest_layer1_barrel_1.dump",
            "itest_layer1_barrel_2.dump",
            "itest_layer2_all.dump",
        ]
    );

    // Each dump carries both records, in order, newline-delimited.
    for (_, contents) in &files {
        let text = String::from_utf8(contents.clone()).unwrap();
        let records: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["record"], 0);
        assert_eq!(records[1]["record"], 1);
    }
}

#[tokio::test]
async fn test_dump_board_files_respect_region_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let files = run_with_dumps(dir.path()).await;

    let board0 = files
        .iter()
        .find(|(n, _)| n == "itest_layer1_barrel_0.dump")
        .unwrap();
    let text = String::from_utf8(board0.1.clone()).unwrap();
    let record: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    let items = record["slots"][0]["items"].as_array().unwrap();

    // Board 0 owns regions 0..3 only.
    assert_eq!(items.len(), 3);
    for item in items {
        let region = item["region"].as_u64().unwrap();
        assert!(region < 3, "region {region} leaked into board 0");
    }
}

#[tokio::test]
async fn test_dump_idempotence_byte_identical() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let files_a = run_with_dumps(dir_a.path()).await;
    let files_b = run_with_dumps(dir_b.path()).await;

    assert_eq!(files_a.len(), files_b.len());
    for ((name_a, bytes_a), (name_b, bytes_b)) in files_a.iter().zip(files_b.iter()) {
        assert_eq!(name_a, name_b);
        assert_eq!(bytes_a, bytes_b, "dump {name_a} differs between runs");
    }
}
