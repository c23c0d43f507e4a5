//! Stage descriptors and the registry that owns them.
//!
//! Descriptors are immutable once registered. Near-identical pipeline
//! variants ("barrel" vs a nine-region re-split of it) are produced by
//! [`StageRegistry::clone_stage`], which validates every override key
//! against the base descriptor; a typo'd override is an error, never a
//! silent no-op.

use crate::error::ConfigError;
use crate::io::DumpSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Parameter values are schemaless JSON scalars/structures.
pub type ParamValue = serde_json::Value;

/// A typed input or output slot declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl SlotDecl {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// An immutable description of one processing stage.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    name: String,
    kind: String,
    inputs: Vec<SlotDecl>,
    outputs: Vec<SlotDecl>,
    params: Arc<BTreeMap<String, ParamValue>>,
    board_parallel: bool,
    dump: Option<DumpSpec>,
}

impl StageDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        inputs: Vec<SlotDecl>,
        outputs: Vec<SlotDecl>,
        params: BTreeMap<String, ParamValue>,
        board_parallel: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            inputs,
            outputs,
            params: Arc::new(params),
            board_parallel,
            dump: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn inputs(&self) -> &[SlotDecl] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SlotDecl] {
        &self.outputs
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn board_parallel(&self) -> bool {
        self.board_parallel
    }

    pub fn dump(&self) -> Option<&DumpSpec> {
        self.dump.as_ref()
    }

    pub fn input(&self, slot: &str) -> Option<&SlotDecl> {
        self.inputs.iter().find(|s| s.name == slot)
    }

    pub fn output(&self, slot: &str) -> Option<&SlotDecl> {
        self.outputs.iter().find(|s| s.name == slot)
    }

    /// Derive a descriptor with a new name and overridden parameters.
    ///
    /// Copy-on-write: untouched parameters share storage with the base;
    /// the base descriptor is never mutated. Every override key must be
    /// declared by the base.
    pub(crate) fn with_params(
        &self,
        name: String,
        overrides: &BTreeMap<String, ParamValue>,
    ) -> Result<StageDescriptor, ConfigError> {
        for key in overrides.keys() {
            if !self.params.contains_key(key) {
                return Err(ConfigError::UnknownParameter {
                    stage: self.name.clone(),
                    param: key.clone(),
                });
            }
        }

        let params = if overrides.is_empty() {
            Arc::clone(&self.params)
        } else {
            let mut params = (*self.params).clone();
            for (key, value) in overrides {
                params.insert(key.clone(), value.clone());
            }
            Arc::new(params)
        };

        Ok(StageDescriptor {
            name,
            kind: self.kind.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            params,
            board_parallel: self.board_parallel,
            dump: self.dump.clone(),
        })
    }

    /// Derive a descriptor with dump output enabled.
    pub(crate) fn with_dump(&self, spec: DumpSpec) -> StageDescriptor {
        let mut desc = self.clone();
        desc.dump = Some(spec);
        desc
    }
}

/// Registry of stage descriptors keyed by validated names.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<StageDescriptor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its name.
    pub fn register(
        &mut self,
        descriptor: StageDescriptor,
    ) -> Result<Arc<StageDescriptor>, ConfigError> {
        if self.stages.contains_key(descriptor.name()) {
            return Err(ConfigError::DuplicateStageName(descriptor.name().to_string()));
        }
        let descriptor = Arc::new(descriptor);
        self.stages
            .insert(descriptor.name().to_string(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Clone a registered stage under a new name with parameter overrides.
    pub fn clone_stage(
        &mut self,
        base: &str,
        new_name: &str,
        overrides: &BTreeMap<String, ParamValue>,
    ) -> Result<Arc<StageDescriptor>, ConfigError> {
        let base = self.lookup(base)?;
        if self.stages.contains_key(new_name) {
            return Err(ConfigError::DuplicateStageName(new_name.to_string()));
        }
        let derived = base.with_params(new_name.to_string(), overrides)?;
        self.register(derived)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<StageDescriptor>, ConfigError> {
        self.stages
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStage(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StageDescriptor>> {
        self.stages.values()
    }
}
