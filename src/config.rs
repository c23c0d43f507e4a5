//! Configuration for the regional pipeline executor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Label substituted into dump file names
    #[serde(default = "default_run_label")]
    pub run_label: String,

    /// Input configuration
    pub input: InputConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Region map and board grouping
    pub topology: TopologyConfig,

    /// External feed declarations
    #[serde(default)]
    pub feeds: Vec<FeedDecl>,

    /// Stage descriptors
    pub stages: Vec<StageConfig>,

    /// Stage clones with parameter overrides
    #[serde(default)]
    pub clones: Vec<CloneConfig>,

    /// Ordered stage instances with input bindings
    pub pipeline: Vec<InstanceConfig>,

    /// Feature toggles applied on top of the built pipeline
    #[serde(default)]
    pub toggles: Vec<ToggleConfig>,
}

/// Input data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Path to the JSON feed file
    pub feed_path: String,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory dump files are written under
    #[serde(default = "default_output_directory")]
    pub directory: String,

    /// Optional dump enablement
    #[serde(default)]
    pub dump: Option<DumpConfig>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            dump: None,
        }
    }
}

/// Dump enablement for a set of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Stage instance names to dump
    pub stages: Vec<String>,

    /// Path template with {run}/{stage}/{board} placeholders
    #[serde(default = "default_dump_template")]
    pub template: String,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of concurrent board tasks per board-parallel stage
    #[serde(default = "default_board_concurrency")]
    pub board_concurrency: usize,

    /// Per-record wall-clock budget in milliseconds (absent = no budget)
    #[serde(default)]
    pub record_timeout_ms: Option<u64>,

    /// Maximum records to process (0 = all records in the feed file)
    #[serde(default)]
    pub max_records: u64,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            board_concurrency: 4,
            record_timeout_ms: None,
            max_records: 0,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

/// Region map and board grouping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Regions in id order
    pub regions: Vec<RegionConfig>,

    /// Boards over those regions
    pub boards: Vec<BoardConfig>,
}

/// One region definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: u32,

    /// Strictly increasing boundary markers (e.g. eta edges)
    pub boundaries: Vec<f64>,
}

/// One board definition: either an explicit region list or a strided
/// generator, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub id: u32,

    /// Explicit ordered region ids
    #[serde(default)]
    pub regions: Vec<u32>,

    /// Generated region ids
    #[serde(default)]
    pub strided: Option<StridedSpec>,
}

/// Strided region id generator: `repeats` super-sectors of `stride`
/// regions each contribute the run `[start, start + len)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StridedSpec {
    pub start: u32,
    pub len: u32,
    pub stride: u32,
    pub repeats: u32,
}

/// External feed declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// One stage descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Handler kind implementing this stage
    pub kind: String,

    #[serde(default)]
    pub inputs: Vec<SlotConfig>,

    #[serde(default)]
    pub outputs: Vec<SlotConfig>,

    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Fan this stage out per board
    #[serde(default)]
    pub board_parallel: bool,
}

/// A typed slot declaration in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// A stage clone with parameter overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Name of the registered base stage
    pub base: String,

    /// Name of the derived stage
    pub name: String,

    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// One pipeline instance: a stage plus its input bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Registered stage name
    pub stage: String,

    /// Input slot to source (`feed:NAME` or `STAGE.SLOT`)
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
}

/// A feature toggle applied as an overlay after the pipeline is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleConfig {
    pub stage: String,
    pub flag: String,
    pub value: serde_json::Value,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the structural shape of the configuration.
    ///
    /// Cross-references (bindings, clones, toggles) are validated by the
    /// pipeline compiler with typed errors; this pass catches shapes
    /// serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.feed_path.is_empty() {
            anyhow::bail!("input.feed_path must be set");
        }
        if self.processing.board_concurrency == 0 {
            anyhow::bail!("Board concurrency must be > 0");
        }
        if self.topology.regions.is_empty() {
            anyhow::bail!("Topology must define at least one region");
        }
        if self.stages.is_empty() {
            anyhow::bail!("At least one stage must be defined");
        }
        if self.pipeline.is_empty() {
            anyhow::bail!("The pipeline must instantiate at least one stage");
        }
        for board in &self.topology.boards {
            match (&board.strided, board.regions.is_empty()) {
                (Some(_), false) => {
                    anyhow::bail!(
                        "Board {} specifies both explicit regions and a strided generator",
                        board.id
                    );
                }
                (None, true) => {
                    anyhow::bail!("Board {} specifies no regions", board.id);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_run_label() -> String { "run".to_string() }
fn default_output_directory() -> String { ".".to_string() }
fn default_dump_template() -> String { "{run}_{stage}_{board}.dump".to_string() }
fn default_board_concurrency() -> usize { 4 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
run_label: ttbar_pu200
input:
  feed_path: feeds.json
topology:
  regions:
    - id: 0
      boundaries: [-1.5, 0.0, 1.5]
  boards:
    - id: 0
      regions: [0]
feeds:
  - name: gtt_tracks
    type: tracks
stages:
  - name: track_conv
    kind: passthrough
    inputs:
      - slot: raw
        type: tracks
    outputs:
      - slot: tracks
        type: tracks
pipeline:
  - stage: track_conv
    bindings:
      raw: "feed:gtt_tracks"
"#
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.run_label, "ttbar_pu200");
        assert_eq!(config.topology.regions.len(), 1);
        assert_eq!(config.stages[0].inputs[0].slot, "raw");
        assert_eq!(config.pipeline[0].bindings["raw"], "feed:gtt_tracks");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.processing.board_concurrency, 4);
        assert_eq!(config.processing.max_records, 0);
        assert!(config.processing.enable_metrics);
        assert_eq!(config.output.directory, ".");
        assert!(config.output.dump.is_none());
    }

    #[test]
    fn test_validate_rejects_board_with_both_region_forms() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.topology.boards[0].strided = Some(StridedSpec {
            start: 0,
            len: 1,
            stride: 1,
            repeats: 1,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_board_without_regions() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.topology.boards[0].regions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.processing.board_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        let yaml = config.to_yaml().unwrap();
        let reparsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(reparsed.run_label, config.run_label);
        assert_eq!(reparsed.stages.len(), config.stages.len());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "input": {"feed_path": "feeds.json"},
            "topology": {
                "regions": [{"id": 0, "boundaries": [0.0, 1.0]}],
                "boards": [{"id": 0, "regions": [0]}]
            },
            "stages": [{"name": "s", "kind": "passthrough", "outputs": [{"slot": "out", "type": "t"}]}],
            "pipeline": [{"stage": "s"}]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.run_label, "run");
        assert!(config.validate().is_ok());
    }
}
