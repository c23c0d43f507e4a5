//! Error taxonomy for the regional pipeline executor.
//!
//! Two families, matching the lifecycle split:
//!
//! - [`ConfigError`]: anything detectable while assembling a pipeline,
//!   before the first record is processed. Fatal to the run.
//! - [`ExecError`]: failures while processing records. Fatal to the
//!   current record and the run; dumps of already-completed records
//!   stay valid.
//!
//! Feed access has its own [`FeedError`] since it maps to a distinct
//! process exit code.

use thiserror::Error;

/// Configuration and validation failures, all detected before `Running`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("region {region}: boundaries must be strictly increasing")]
    InvalidBoundary { region: u32 },

    #[error("region id {got} breaks contiguity (next id is {expected})")]
    NonContiguousRegionId { expected: u32, got: u32 },

    #[error("unknown region id {0}")]
    UnknownRegion(u32),

    #[error("region {region} assigned to both board {first} and board {second}")]
    DuplicateRegionAssignment { region: u32, first: u32, second: u32 },

    #[error("duplicate board id {0}")]
    DuplicateBoard(u32),

    #[error("duplicate stage name: {0}")]
    DuplicateStageName(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("stage {stage}: unknown parameter {param}")]
    UnknownParameter { stage: String, param: String },

    #[error("stage {stage}: no handler registered for kind {kind}")]
    UnknownHandler { stage: String, kind: String },

    #[error("stage {stage}: input slot {slot} cannot be resolved from {origin}")]
    UnresolvedInput {
        stage: String,
        slot: String,
        origin: String,
    },

    #[error(
        "stage {stage}: slot {slot} expects type {expected} but {origin} produces {actual}"
    )]
    SlotTypeMismatch {
        stage: String,
        slot: String,
        expected: String,
        actual: String,
        origin: String,
    },

    #[error("pipeline is not topologically valid: {0}")]
    CyclicOrUnresolvedDependency(String),

    #[error("dump template {template:?} is missing required placeholder {placeholder}")]
    TemplateMissingPlaceholder {
        template: String,
        placeholder: &'static str,
    },
}

/// Failures while processing records.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("stage {stage} failed on record {record}: {message}")]
    Stage {
        stage: String,
        record: u64,
        message: String,
    },

    #[error("record {record} exceeded the {budget_ms} ms budget")]
    RecordTimeout { record: u64, budget_ms: u64 },

    #[error("external feed not provided: {0}")]
    MissingExternalFeed(String),

    #[error("executor is {state} (expected {expected})")]
    InvalidState {
        state: &'static str,
        expected: &'static str,
    },

    #[error("dump write failed on record {record}")]
    DumpIo {
        record: u64,
        #[source]
        source: std::io::Error,
    },
}

/// External feed access failures.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("feed file {path}: {message}")]
    Malformed { path: String, message: String },

    #[error("unknown feed: {0}")]
    UnknownFeed(String),
}

/// Top-level error for library entry points, carrying the process exit code.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

impl Error {
    /// Process exit code for this error: 1 configuration, 2 execution, 3 feed I/O.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Exec(_) => 2,
            Error::Feed(_) => 3,
        }
    }
}
