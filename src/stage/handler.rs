//! The opaque-algorithm seam.
//!
//! Domain algorithms (clustering, track fitting, vertexing) live behind
//! [`StageHandler`]; the executor only sees bound inputs in, bound
//! outputs out. A handler must be pure with respect to executor state:
//! same inputs, same outputs, no visibility into sibling stages.
//!
//! The built-ins cover wiring and verification runs; real deployments
//! register their own handlers under the descriptor `kind` they configure.

use crate::record::{Batch, SlotValues};
use crate::region::Board;
use crate::stage::StageDescriptor;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a stage implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Invocation context handed to a handler.
pub struct StageContext<'a> {
    /// The descriptor being executed (name, params, slot declarations).
    pub stage: &'a StageDescriptor,

    /// The board this invocation covers; `None` for serialized stages.
    pub board: Option<&'a Board>,

    /// Index of the record being processed.
    pub record: u64,
}

/// A black-box stage implementation.
pub trait StageHandler: Send + Sync {
    fn execute(&self, ctx: &StageContext<'_>, inputs: &SlotValues)
        -> Result<SlotValues, StageError>;
}

/// Handlers keyed by descriptor `kind`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert("passthrough", Arc::new(Passthrough));
        registry.insert("merge", Arc::new(Merge));
        registry.insert("label", Arc::new(Label));
        registry
    }

    pub fn insert(&mut self, kind: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }
}

/// Copies input slots to output slots by declaration position.
///
/// Surplus output slots receive empty batches.
pub struct Passthrough;

impl StageHandler for Passthrough {
    fn execute(
        &self,
        ctx: &StageContext<'_>,
        inputs: &SlotValues,
    ) -> Result<SlotValues, StageError> {
        let mut outputs = SlotValues::new();
        for (idx, out) in ctx.stage.outputs().iter().enumerate() {
            let batch = ctx
                .stage
                .inputs()
                .get(idx)
                .and_then(|slot| inputs.get(&slot.name))
                .cloned()
                .unwrap_or_default();
            outputs.insert(out.name.clone(), batch);
        }
        Ok(outputs)
    }
}

/// Concatenates every input batch, in input declaration order, into the
/// first declared output slot.
pub struct Merge;

impl StageHandler for Merge {
    fn execute(
        &self,
        ctx: &StageContext<'_>,
        inputs: &SlotValues,
    ) -> Result<SlotValues, StageError> {
        let out = ctx
            .stage
            .outputs()
            .first()
            .ok_or_else(|| StageError::new("merge stage declares no output slot"))?;

        let mut merged: Batch = Vec::new();
        for slot in ctx.stage.inputs() {
            if let Some(batch) = inputs.get(&slot.name) {
                merged.extend(batch.iter().cloned());
            }
        }

        let mut outputs = SlotValues::new();
        outputs.insert(out.name.clone(), merged);
        for extra in &ctx.stage.outputs()[1..] {
            outputs.insert(extra.name.clone(), Vec::new());
        }
        Ok(outputs)
    }
}

/// Passthrough that stamps each object item with the producing stage name.
pub struct Label;

impl StageHandler for Label {
    fn execute(
        &self,
        ctx: &StageContext<'_>,
        inputs: &SlotValues,
    ) -> Result<SlotValues, StageError> {
        let passed = Passthrough.execute(ctx, inputs)?;
        let outputs = passed
            .into_iter()
            .map(|(slot, batch)| {
                let batch = batch
                    .into_iter()
                    .map(|mut item| {
                        if let Some(obj) = item.as_object_mut() {
                            obj.insert(
                                "stage".to_string(),
                                serde_json::Value::String(ctx.stage.name().to_string()),
                            );
                        }
                        item
                    })
                    .collect();
                (slot, batch)
            })
            .collect();
        Ok(outputs)
    }
}
