//! Pipeline execution.
//!
//! One run walks `Idle → Loaded → Running → {Completed, Failed}`.
//! Records are processed strictly in input order; within a record,
//! stages execute in pipeline order, fanning out per board where a
//! stage is declared board-parallel. A stage declared dumpable has its
//! outputs fully flushed to disk before any downstream stage consumes
//! them, which makes two runs over identical input byte-identical.

use crate::error::{ConfigError, Error, ExecError};
use crate::io::{DumpRouter, FeedSource, BOARD_ALL};
use crate::pipeline::{Binding, InputSource, Metrics, MetricsReporter, Pipeline, StageInstance};
use crate::record::{filter_for_regions, Batch, SlotValues};
use crate::region::Board;
use crate::stage::{HandlerRegistry, StageContext, StageDescriptor, StageHandler};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Executor run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loaded,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Loaded => "loaded",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent board tasks per board-parallel stage
    pub board_concurrency: usize,

    /// Optional per-record wall-clock budget
    pub record_timeout: Option<Duration>,

    /// Directory dump files are written under
    pub output_dir: PathBuf,

    /// Enable periodic progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    pub metrics_output_path: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            board_concurrency: 4,
            record_timeout: None,
            output_dir: PathBuf::from("."),
            enable_metrics: false,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

/// Work item for one board task of a board-parallel stage.
struct BoardTask {
    board: Board,
    inputs: SlotValues,
}

/// Executes a loaded pipeline over a record stream.
pub struct Executor {
    handlers: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    metrics: Arc<Metrics>,
    state: RunState,
    pipeline: Option<Arc<Pipeline>>,
    feeds: Option<Arc<dyn FeedSource>>,
    dumps: Option<Arc<DumpRouter>>,
}

impl Executor {
    pub fn new(handlers: Arc<HandlerRegistry>, config: ExecutorConfig) -> Self {
        Self {
            handlers,
            config,
            metrics: Metrics::new(),
            state: RunState::Idle,
            pipeline: None,
            feeds: None,
            dumps: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Bind a pipeline and its external feeds: `Idle → Loaded`.
    ///
    /// Every stage kind must have a registered handler and every
    /// referenced feed must be served by the source.
    pub fn load(
        &mut self,
        pipeline: Pipeline,
        feeds: Arc<dyn FeedSource>,
    ) -> Result<(), Error> {
        if self.state != RunState::Idle {
            return Err(ExecError::InvalidState {
                state: self.state.as_str(),
                expected: "idle",
            }
            .into());
        }

        for instance in pipeline.instances() {
            if !self.handlers.contains(instance.descriptor().kind()) {
                return Err(ConfigError::UnknownHandler {
                    stage: instance.name().to_string(),
                    kind: instance.descriptor().kind().to_string(),
                }
                .into());
            }
        }

        for feed in pipeline.referenced_feeds() {
            if !feeds.has_feed(&feed) {
                return Err(ExecError::MissingExternalFeed(feed).into());
            }
        }

        self.dumps = Some(Arc::new(DumpRouter::new(
            self.config.output_dir.clone(),
            pipeline.run_label(),
        )));
        self.pipeline = Some(Arc::new(pipeline));
        self.feeds = Some(feeds);
        self.state = RunState::Loaded;
        Ok(())
    }

    /// Process up to `max_records` records: `Loaded → Running → {Completed, Failed}`.
    ///
    /// `max_records == 0` means unbounded (all records the feed source
    /// serves). The first failing record aborts the run; dumps of
    /// already-completed records stay valid.
    pub async fn run(&mut self, max_records: u64) -> Result<RunSummary, Error> {
        if self.state != RunState::Loaded {
            return Err(ExecError::InvalidState {
                state: self.state.as_str(),
                expected: "loaded",
            }
            .into());
        }
        let pipeline = Arc::clone(self.pipeline.as_ref().ok_or(ExecError::InvalidState {
            state: "loaded without pipeline",
            expected: "loaded",
        })?);
        let feeds = Arc::clone(self.feeds.as_ref().ok_or(ExecError::InvalidState {
            state: "loaded without feeds",
            expected: "loaded",
        })?);

        self.state = RunState::Running;

        let total = feeds.num_records();
        let limit = if max_records == 0 {
            total
        } else {
            total.min(max_records)
        };

        tracing::info!(
            "Running {} stage instances over {} records ({} boards, concurrency {})",
            pipeline.instances().len(),
            limit,
            pipeline.boards().len(),
            self.config.board_concurrency
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                limit,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut result = Ok(());
        for record in 0..limit {
            let outcome = match self.config.record_timeout {
                Some(budget) => {
                    match tokio::time::timeout(
                        budget,
                        self.process_record(&pipeline, &feeds, record),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ExecError::RecordTimeout {
                            record,
                            budget_ms: budget.as_millis() as u64,
                        }
                        .into()),
                    }
                }
                None => self.process_record(&pipeline, &feeds, record).await,
            };

            match outcome {
                Ok(()) => self.metrics.add_record_processed(),
                Err(e) => {
                    self.metrics.add_record_failed();
                    result = Err(e);
                    break;
                }
            }
        }

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.config.enable_metrics {
            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        match result {
            Ok(()) => {
                self.state = RunState::Completed;
                Ok(RunSummary {
                    records_processed: limit,
                    stage_instances: pipeline.instances().len(),
                })
            }
            Err(e) => {
                self.state = RunState::Failed;
                tracing::error!("Run failed: {}", e);
                Err(e)
            }
        }
    }

    /// Execute all stage instances for one record.
    async fn process_record(
        &self,
        pipeline: &Arc<Pipeline>,
        feeds: &Arc<dyn FeedSource>,
        record: u64,
    ) -> Result<(), Error> {
        // Fetch every referenced feed once up front.
        let fetch_start = Instant::now();
        let mut feed_data: BTreeMap<String, Batch> = BTreeMap::new();
        for name in pipeline.referenced_feeds() {
            let batch = feeds.fetch(&name, record)?;
            feed_data.insert(name, batch);
        }
        self.metrics.add_feed_fetch_time(fetch_start.elapsed());

        let mut produced: Vec<SlotValues> = Vec::with_capacity(pipeline.instances().len());
        for instance in pipeline.instances() {
            let inputs = gather_inputs(instance.bindings(), &feed_data, &produced);
            self.metrics
                .add_items_in(inputs.values().map(|b| b.len() as u64).sum());

            let exec_start = Instant::now();
            let outputs = if instance.descriptor().board_parallel() {
                self.run_board_parallel(pipeline, instance, &inputs, record)
                    .await?
            } else {
                self.run_serial(instance, inputs.clone(), record).await?
            };
            self.metrics.add_stage_exec_time(exec_start.elapsed());
            self.metrics.add_stage_invocation();
            self.metrics
                .add_items_out(outputs.values().map(|b| b.len() as u64).sum());

            produced.push(outputs);
        }

        Ok(())
    }

    /// Run a serialized stage in one blocking invocation over full inputs.
    async fn run_serial(
        &self,
        instance: &StageInstance,
        inputs: SlotValues,
        record: u64,
    ) -> Result<SlotValues, Error> {
        let descriptor = Arc::clone(instance.descriptor());
        let handler = self.handler_for(&descriptor)?;

        let outputs = invoke_handler(handler, descriptor.clone(), None, inputs, record).await?;

        self.dump_outputs(&descriptor, BOARD_ALL, record, &outputs)
            .await?;
        Ok(outputs)
    }

    /// Fan a board-parallel stage out across boards and merge the results.
    ///
    /// Workers pull board tasks from a shared queue; the first failure
    /// raises an abort flag so queued tasks are abandoned while
    /// already-started tasks run to completion. Outputs merge in
    /// ascending board-id order; nothing is forwarded unless every board
    /// succeeded.
    async fn run_board_parallel(
        &self,
        pipeline: &Arc<Pipeline>,
        instance: &StageInstance,
        inputs: &SlotValues,
        record: u64,
    ) -> Result<SlotValues, Error> {
        let boards = pipeline.boards().boards();
        if boards.is_empty() {
            tracing::debug!(
                "Stage {} is board-parallel but no boards are grouped; running serialized",
                instance.name()
            );
            return self.run_serial(instance, inputs.clone(), record).await;
        }

        let descriptor = Arc::clone(instance.descriptor());
        let handler = self.handler_for(&descriptor)?;

        // Queue one task per board, in board order.
        let (work_tx, work_rx) = async_channel::bounded::<BoardTask>(boards.len());
        for board in boards {
            let task = BoardTask {
                board: board.clone(),
                inputs: inputs
                    .iter()
                    .map(|(slot, batch)| {
                        (slot.clone(), filter_for_regions(batch, board.regions()))
                    })
                    .collect(),
            };
            let _ = work_tx.send(task).await;
        }
        work_tx.close();

        let abort = Arc::new(AtomicBool::new(false));
        let workers = self.config.board_concurrency.max(1).min(boards.len());

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let abort = Arc::clone(&abort);
            let handler = Arc::clone(&handler);
            let descriptor = Arc::clone(&descriptor);
            let metrics = Arc::clone(&self.metrics);

            let handle = tokio::spawn(async move {
                let mut results: Vec<(u32, Result<SlotValues, Error>)> = Vec::new();
                while let Ok(task) = work_rx.recv().await {
                    // Abandon queued work once a sibling has failed.
                    if abort.load(Ordering::Acquire) {
                        break;
                    }
                    let board_id = task.board.id();
                    metrics.add_board_task();
                    let result = invoke_handler(
                        Arc::clone(&handler),
                        Arc::clone(&descriptor),
                        Some(task.board),
                        task.inputs,
                        record,
                    )
                    .await;
                    if result.is_err() {
                        abort.store(true, Ordering::Release);
                    }
                    results.push((board_id, result));
                }
                results
            });
            handles.push(handle);
        }

        let mut board_outputs: BTreeMap<u32, SlotValues> = BTreeMap::new();
        let mut first_error: Option<(u32, Error)> = None;
        for joined in join_all(handles).await {
            let results = joined.map_err(|e| ExecError::Stage {
                stage: descriptor.name().to_string(),
                record,
                message: format!("board worker panicked: {e}"),
            })?;
            for (board_id, result) in results {
                match result {
                    Ok(outputs) => {
                        board_outputs.insert(board_id, outputs);
                    }
                    Err(e) => {
                        let replace = first_error
                            .as_ref()
                            .map(|(id, _)| board_id < *id)
                            .unwrap_or(true);
                        if replace {
                            first_error = Some((board_id, e));
                        }
                    }
                }
            }
        }

        if let Some((_, e)) = first_error {
            return Err(e);
        }

        // Every board completed: dump per board, then merge in board order.
        for (board_id, outputs) in &board_outputs {
            self.dump_outputs(&descriptor, &board_id.to_string(), record, outputs)
                .await?;
        }

        let mut merged = SlotValues::new();
        for decl in descriptor.outputs() {
            let mut batch: Batch = Vec::new();
            for outputs in board_outputs.values() {
                if let Some(board_batch) = outputs.get(&decl.name) {
                    batch.extend(board_batch.iter().cloned());
                }
            }
            merged.insert(decl.name.clone(), batch);
        }
        Ok(merged)
    }

    fn handler_for(
        &self,
        descriptor: &Arc<StageDescriptor>,
    ) -> Result<Arc<dyn StageHandler>, Error> {
        self.handlers.get(descriptor.kind()).ok_or_else(|| {
            ConfigError::UnknownHandler {
                stage: descriptor.name().to_string(),
                kind: descriptor.kind().to_string(),
            }
            .into()
        })
    }

    /// Serialize a stage's outputs before anything downstream reads them.
    async fn dump_outputs(
        &self,
        descriptor: &StageDescriptor,
        board: &str,
        record: u64,
        outputs: &SlotValues,
    ) -> Result<(), Error> {
        let Some(spec) = descriptor.dump() else {
            return Ok(());
        };
        let Some(dumps) = self.dumps.as_ref() else {
            return Ok(());
        };

        // Output slots in declaration order.
        let slots: Vec<(String, Batch)> = descriptor
            .outputs()
            .iter()
            .map(|decl| {
                (
                    decl.name.clone(),
                    outputs.get(&decl.name).cloned().unwrap_or_default(),
                )
            })
            .collect();

        let write_start = Instant::now();
        let bytes = dumps
            .append(spec, descriptor.name(), board, record, &slots)
            .await
            .map_err(|source| ExecError::DumpIo { record, source })?;
        self.metrics.add_dump_write_time(write_start.elapsed());
        self.metrics.add_dump_record(bytes);
        Ok(())
    }
}

/// Gather a stage's input batches from feeds and earlier outputs.
fn gather_inputs(
    bindings: &[Binding],
    feed_data: &BTreeMap<String, Batch>,
    produced: &[SlotValues],
) -> SlotValues {
    bindings
        .iter()
        .map(|binding| {
            let batch = match &binding.source {
                InputSource::Feed(name) => feed_data.get(name).cloned().unwrap_or_default(),
                InputSource::Instance { instance, slot } => produced
                    .get(*instance)
                    .and_then(|outputs| outputs.get(slot))
                    .cloned()
                    .unwrap_or_default(),
            };
            (binding.slot.clone(), batch)
        })
        .collect()
}

/// Invoke a handler on the blocking pool.
async fn invoke_handler(
    handler: Arc<dyn StageHandler>,
    descriptor: Arc<StageDescriptor>,
    board: Option<Board>,
    inputs: SlotValues,
    record: u64,
) -> Result<SlotValues, Error> {
    let stage_name = descriptor.name().to_string();
    let result = tokio::task::spawn_blocking(move || {
        let ctx = StageContext {
            stage: &descriptor,
            board: board.as_ref(),
            record,
        };
        handler.execute(&ctx, &inputs)
    })
    .await;

    match result {
        Ok(Ok(outputs)) => Ok(outputs),
        Ok(Err(e)) => Err(ExecError::Stage {
            stage: stage_name,
            record,
            message: e.to_string(),
        }
        .into()),
        Err(e) => Err(ExecError::Stage {
            stage: stage_name,
            record,
            message: format!("handler panicked: {e}"),
        }
        .into()),
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Records processed to completion
    pub records_processed: u64,

    /// Stage instances in the pipeline
    pub stage_instances: usize,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed {} records through {} stage instances",
            self.records_processed, self.stage_instances
        )
    }
}
