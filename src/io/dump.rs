//! Deterministic per-stage dump files.
//!
//! When a stage's [`DumpSpec`] is enabled the executor serializes the
//! stage's outputs to one file per (stage, board) pair before any
//! downstream stage consumes them. Records are newline-delimited JSON
//! carrying the record index and the output slots in declaration order,
//! so a run can be diffed byte-for-byte against a hardware reference
//! trace.

use crate::error::ConfigError;
use crate::record::Batch;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const PLACEHOLDER_RUN: &str = "{run}";
pub const PLACEHOLDER_STAGE: &str = "{stage}";
pub const PLACEHOLDER_BOARD: &str = "{board}";

/// Board label used for stages without a board axis.
pub const BOARD_ALL: &str = "all";

/// Per-stage dump target template.
///
/// `{stage}` and `{board}` are required substitution points; `{run}` is
/// optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSpec {
    template: String,
}

impl DumpSpec {
    pub fn new(template: &str) -> Result<Self, ConfigError> {
        for placeholder in [PLACEHOLDER_STAGE, PLACEHOLDER_BOARD] {
            if !template.contains(placeholder) {
                return Err(ConfigError::TemplateMissingPlaceholder {
                    template: template.to_string(),
                    placeholder,
                });
            }
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Substitute run/stage/board into the template.
    pub fn render(&self, run: &str, stage: &str, board: &str) -> String {
        self.template
            .replace(PLACEHOLDER_RUN, run)
            .replace(PLACEHOLDER_STAGE, stage)
            .replace(PLACEHOLDER_BOARD, board)
    }
}

/// Routes dump appends to per-target files, serializing writers per target.
///
/// Concurrent board tasks never share a (stage, board) file, but the
/// per-target mutex holds the exclusivity invariant even if a caller
/// routes two appends to one path.
pub struct DumpRouter {
    dir: PathBuf,
    run_label: String,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DumpRouter {
    pub fn new(dir: impl Into<PathBuf>, run_label: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run_label: run_label.into(),
            locks: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve the target path for a (stage, board) pair.
    pub fn target_path(&self, spec: &DumpSpec, stage: &str, board: &str) -> PathBuf {
        self.dir.join(spec.render(&self.run_label, stage, board))
    }

    /// Append one record to the (stage, board) target and flush it.
    ///
    /// Output slots are written in declaration order. Returns the number
    /// of bytes appended.
    pub async fn append(
        &self,
        spec: &DumpSpec,
        stage: &str,
        board: &str,
        record: u64,
        slots: &[(String, Batch)],
    ) -> std::io::Result<u64> {
        let path = self.target_path(spec, stage, board);

        let slot_entries: Vec<serde_json::Value> = slots
            .iter()
            .map(|(name, items)| {
                serde_json::json!({
                    "slot": name,
                    "items": items,
                })
            })
            .collect();
        let line = serde_json::json!({
            "record": record,
            "slots": slot_entries,
        });
        let mut buf = line.to_string().into_bytes();
        buf.push(b'\n');

        let lock = self
            .locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;

        Ok(buf.len() as u64)
    }
}
