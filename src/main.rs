//! Regional Pipeline Executor CLI
//!
//! Runs a configured regional pipeline over a feed file, with
//! deterministic per-stage dump output.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use regionpipe::{build_runtime, compile_pipeline, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "regionpipe")]
#[command(about = "Run a configurable regional pipeline over event records", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the maximum number of records (0 = all)
    #[arg(long, global = true)]
    max_records: Option<u64>,

    /// Override the dump output directory
    #[arg(long, global = true)]
    output_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Print the compiled topology without processing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        None | Some(Commands::Run) => run_command(cli.config, cli.max_records, cli.output_dir),

        Some(Commands::Analyze) => analyze_command(cli.config),

        Some(Commands::Validate) => validate_command(cli.config),

        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    };

    if let Err(err) = outcome {
        tracing::error!("{:#}", err);
        // Typed pipeline errors carry their exit code; anything else
        // (unreadable config, bad YAML) is a configuration failure.
        let code = err
            .downcast_ref::<regionpipe::Error>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run_command(
    config_path: PathBuf,
    max_records: Option<u64>,
    output_dir: Option<String>,
) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(n) = max_records {
        config.processing.max_records = n;
    }
    if let Some(dir) = output_dir {
        config.output.directory = dir;
    }

    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(async { run_pipeline(config).await })?;

    tracing::info!("{}", summary);
    Ok(())
}

fn analyze_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    let pipeline = compile_pipeline(&config)?;

    println!("\n=== Topology ===");
    println!("Regions: {}", pipeline.region_map().len());
    for board in pipeline.boards().boards() {
        println!("Board {}: regions {:?}", board.id(), board.regions());
    }
    let unassigned = pipeline.boards().unassigned_regions();
    if !unassigned.is_empty() {
        println!("Unassigned regions: {unassigned:?}");
    }
    println!("{}", pipeline.boards().coverage());

    println!("\n=== Feeds ===");
    for (name, ty) in pipeline.feeds() {
        let used = pipeline.referenced_feeds().contains(name);
        println!(
            "{name}: {ty}{}",
            if used { "" } else { " (declared, unused)" }
        );
    }

    println!("\n=== Pipeline ===");
    for instance in pipeline.instances() {
        let desc = instance.descriptor();
        println!(
            "#{} {} [{}]{}{}",
            instance.id(),
            instance.name(),
            desc.kind(),
            if desc.board_parallel() {
                " board-parallel"
            } else {
                ""
            },
            if desc.dump().is_some() { " dump" } else { "" },
        );
        for binding in instance.bindings() {
            let source = match &binding.source {
                regionpipe::pipeline::InputSource::Feed(name) => format!("feed:{name}"),
                regionpipe::pipeline::InputSource::Instance { instance, slot } => {
                    format!("#{instance}.{slot}")
                }
            };
            println!("    {} <- {} ({})", binding.slot, source, binding.ty);
        }
    }
    println!("================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    // A structurally valid config can still fail compilation; check both.
    compile_pipeline(&config)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Regional Pipeline Executor Configuration

# Label substituted for {run} in dump file names
run_label: "ttbar_pu200"

# === INPUT: Where event records come from ===
input:
  # JSON feed file: {"feeds": {"<name>": [[items of record 0], ...]}}
  feed_path: "feeds.json"

# === OUTPUT: Where dump files are written ===
output:
  directory: "dumps"

  # Enable per-stage dump output (one file per stage/board pair).
  # The template must contain {stage} and {board}; {run} is optional.
  dump:
    stages: [layer1_barrel]
    template: "{run}_{stage}_{board}.dump"

# === PROCESSING: Execution tuning ===
processing:
  # Concurrent board tasks per board-parallel stage
  board_concurrency: 4

  # Per-record wall-clock budget in milliseconds (omit for no budget)
  # record_timeout_ms: 5000

  # Maximum records to process (0 = all records in the feed file)
  max_records: 0

  # Tokio async worker threads (omit = num CPUs)
  # worker_threads: 8

  # Print throughput metrics during processing
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

# === TOPOLOGY: Regions and their board grouping ===
topology:
  # Nine barrel sectors; boundaries are eta edges, strictly increasing.
  regions:
    - {id: 0, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 1, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 2, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 3, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 4, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 5, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 6, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 7, boundaries: [-1.5, 0.0, 1.5]}
    - {id: 8, boundaries: [-1.5, 0.0, 1.5]}

  # Three boards, each owning every third sector run.
  boards:
    - id: 0
      strided: {start: 0, len: 3, stride: 3, repeats: 1}
    - id: 1
      strided: {start: 3, len: 3, stride: 3, repeats: 1}
    - id: 2
      strided: {start: 6, len: 3, stride: 3, repeats: 1}

# === FEEDS: External record sources ===
feeds:
  - {name: gtt_tracks, type: tracks}

# === STAGES: Descriptors (kind names a registered handler) ===
stages:
  - name: track_conv
    kind: passthrough
    inputs: [{slot: raw, type: tracks}]
    outputs: [{slot: tracks, type: tracks}]

  - name: layer1_barrel
    kind: label
    inputs: [{slot: tracks, type: tracks}]
    outputs: [{slot: candidates, type: tracks}]
    params: {eta_splits: 3}
    board_parallel: true

  - name: layer2
    kind: merge
    inputs: [{slot: candidates, type: tracks}]
    outputs: [{slot: out, type: tracks}]

# Clones derive a stage with overridden parameters; override keys must
# exist on the base stage.
# clones:
#   - base: layer1_barrel
#     name: layer1_barrel9
#     params: {eta_splits: 9}

# === PIPELINE: Ordered instances with input bindings ===
# Bindings: "feed:NAME" or "STAGE.SLOT" of an earlier instance.
pipeline:
  - stage: track_conv
    bindings: {raw: "feed:gtt_tracks"}
  - stage: layer1_barrel
    bindings: {tracks: "track_conv.tracks"}
  - stage: layer2
    bindings: {candidates: "layer1_barrel.candidates"}

# Feature toggles overlay parameter changes on the built pipeline.
# toggles:
#   - {stage: layer1_barrel, flag: eta_splits, value: 9}
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
