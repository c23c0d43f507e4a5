//! Pipeline assembly and topological validation.
//!
//! Stages are appended in execution order; every input slot must bind to
//! an external feed or an earlier instance's output, so forward
//! references are impossible by construction. `finalize` re-checks the
//! whole topology anyway: the pipeline that reaches the executor is
//! valid or it does not exist.

use crate::error::ConfigError;
use crate::region::{BoardGrouping, RegionMap};
use crate::stage::{ParamValue, StageDescriptor};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// An unresolved binding source as written in configuration:
/// `feed:NAME` or `STAGE.SLOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Feed(String),
    StageOutput { stage: String, slot: String },
}

impl SourceRef {
    /// Parse the configuration syntax. Returns `None` on malformed input.
    pub fn parse(raw: &str) -> Option<SourceRef> {
        if let Some(feed) = raw.strip_prefix("feed:") {
            if feed.is_empty() {
                return None;
            }
            return Some(SourceRef::Feed(feed.to_string()));
        }
        let (stage, slot) = raw.split_once('.')?;
        if stage.is_empty() || slot.is_empty() {
            return None;
        }
        Some(SourceRef::StageOutput {
            stage: stage.to_string(),
            slot: slot.to_string(),
        })
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::Feed(name) => write!(f, "feed:{name}"),
            SourceRef::StageOutput { stage, slot } => write!(f, "{stage}.{slot}"),
        }
    }
}

/// A resolved binding source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// An external feed by name.
    Feed(String),

    /// A named output slot of an earlier instance.
    Instance { instance: usize, slot: String },
}

/// One resolved input binding of a stage instance.
#[derive(Debug, Clone)]
pub struct Binding {
    pub slot: String,
    pub ty: String,
    pub source: InputSource,
}

/// A descriptor bound to concrete input sources at a pipeline position.
#[derive(Debug, Clone)]
pub struct StageInstance {
    id: usize,
    descriptor: Arc<StageDescriptor>,
    bindings: Vec<Binding>,
}

impl StageInstance {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<StageDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Input bindings in slot declaration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

/// Builder for an ordered, validated pipeline.
pub struct PipelineBuilder {
    region_map: Arc<RegionMap>,
    boards: Arc<BoardGrouping>,
    feeds: BTreeMap<String, String>,
    run_label: String,
    instances: Vec<StageInstance>,
    by_name: BTreeMap<String, usize>,
}

impl PipelineBuilder {
    pub fn new(
        region_map: Arc<RegionMap>,
        boards: Arc<BoardGrouping>,
        feeds: BTreeMap<String, String>,
        run_label: impl Into<String>,
    ) -> Self {
        Self {
            region_map,
            boards,
            feeds,
            run_label: run_label.into(),
            instances: Vec::new(),
            by_name: BTreeMap::new(),
        }
    }

    /// Append a stage instance, binding each declared input slot.
    pub fn add_stage(
        &mut self,
        descriptor: Arc<StageDescriptor>,
        bindings: &BTreeMap<String, SourceRef>,
    ) -> Result<usize, ConfigError> {
        let stage_name = descriptor.name().to_string();
        if self.by_name.contains_key(&stage_name) {
            return Err(ConfigError::DuplicateStageName(stage_name));
        }

        // A binding naming a slot the stage does not declare is a typo,
        // not a silently-ignored extra.
        for (slot, source) in bindings {
            if descriptor.input(slot).is_none() {
                return Err(ConfigError::UnresolvedInput {
                    stage: stage_name.clone(),
                    slot: slot.clone(),
                    origin: source.to_string(),
                });
            }
        }

        let mut resolved = Vec::with_capacity(descriptor.inputs().len());
        for decl in descriptor.inputs() {
            let source = bindings.get(&decl.name).ok_or_else(|| {
                ConfigError::UnresolvedInput {
                    stage: stage_name.clone(),
                    slot: decl.name.clone(),
                    origin: "<unbound>".to_string(),
                }
            })?;
            resolved.push(self.resolve(&stage_name, decl.name.as_str(), &decl.ty, source)?);
        }

        let id = self.instances.len();
        self.instances.push(StageInstance {
            id,
            descriptor,
            bindings: resolved,
        });
        self.by_name.insert(stage_name, id);
        Ok(id)
    }

    /// Add a sibling of an existing instance with overridden parameters.
    ///
    /// The sibling shares the original's bindings and position semantics
    /// but carries a fresh descriptor identity; the original instance,
    /// its bindings, and its downstream consumers are untouched.
    pub fn overlay(
        &mut self,
        instance_id: usize,
        overrides: &BTreeMap<String, ParamValue>,
    ) -> Result<usize, ConfigError> {
        let base = self
            .instances
            .get(instance_id)
            .ok_or_else(|| ConfigError::UnknownStage(format!("instance #{instance_id}")))?;

        let id = self.instances.len();
        let name = format!("{}_v{id}", base.name());
        if self.by_name.contains_key(&name) {
            return Err(ConfigError::DuplicateStageName(name));
        }
        let descriptor = base.descriptor.with_params(name.clone(), overrides)?;
        let bindings = base.bindings.clone();

        self.instances.push(StageInstance {
            id,
            descriptor: Arc::new(descriptor),
            bindings,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Validate the complete topology and produce the pipeline.
    pub fn finalize(self) -> Result<Pipeline, ConfigError> {
        for instance in &self.instances {
            let declared: BTreeSet<&str> = instance
                .descriptor
                .inputs()
                .iter()
                .map(|d| d.name.as_str())
                .collect();
            let bound: BTreeSet<&str> =
                instance.bindings.iter().map(|b| b.slot.as_str()).collect();
            if declared != bound {
                return Err(ConfigError::CyclicOrUnresolvedDependency(format!(
                    "stage {} has unbound input slots",
                    instance.name()
                )));
            }

            for binding in &instance.bindings {
                match &binding.source {
                    InputSource::Feed(name) => {
                        if !self.feeds.contains_key(name) {
                            return Err(ConfigError::CyclicOrUnresolvedDependency(format!(
                                "stage {} slot {} references undeclared feed {}",
                                instance.name(),
                                binding.slot,
                                name
                            )));
                        }
                    }
                    InputSource::Instance { instance: src, slot } => {
                        if *src >= instance.id {
                            return Err(ConfigError::CyclicOrUnresolvedDependency(format!(
                                "stage {} slot {} depends on a later instance",
                                instance.name(),
                                binding.slot
                            )));
                        }
                        if self.instances[*src].descriptor.output(slot).is_none() {
                            return Err(ConfigError::CyclicOrUnresolvedDependency(format!(
                                "stage {} slot {} references missing output {}.{}",
                                instance.name(),
                                binding.slot,
                                self.instances[*src].name(),
                                slot
                            )));
                        }
                    }
                }
            }
        }

        Ok(Pipeline {
            instances: self.instances,
            region_map: self.region_map,
            boards: self.boards,
            feeds: self.feeds,
            run_label: self.run_label,
        })
    }

    fn resolve(
        &self,
        stage: &str,
        slot: &str,
        expected_ty: &str,
        source: &SourceRef,
    ) -> Result<Binding, ConfigError> {
        let (input_source, actual_ty) = match source {
            SourceRef::Feed(name) => {
                let ty = self.feeds.get(name).ok_or_else(|| {
                    ConfigError::UnresolvedInput {
                        stage: stage.to_string(),
                        slot: slot.to_string(),
                        origin: source.to_string(),
                    }
                })?;
                (InputSource::Feed(name.clone()), ty.clone())
            }
            SourceRef::StageOutput { stage: src, slot: out } => {
                // Append-only: only already-added instances resolve.
                let &src_id = self.by_name.get(src).ok_or_else(|| {
                    ConfigError::UnresolvedInput {
                        stage: stage.to_string(),
                        slot: slot.to_string(),
                        origin: source.to_string(),
                    }
                })?;
                let decl = self.instances[src_id]
                    .descriptor
                    .output(out)
                    .ok_or_else(|| ConfigError::UnresolvedInput {
                        stage: stage.to_string(),
                        slot: slot.to_string(),
                        origin: source.to_string(),
                    })?;
                (
                    InputSource::Instance {
                        instance: src_id,
                        slot: out.clone(),
                    },
                    decl.ty.clone(),
                )
            }
        };

        if actual_ty != expected_ty {
            return Err(ConfigError::SlotTypeMismatch {
                stage: stage.to_string(),
                slot: slot.to_string(),
                expected: expected_ty.to_string(),
                actual: actual_ty,
                origin: source.to_string(),
            });
        }

        Ok(Binding {
            slot: slot.to_string(),
            ty: expected_ty.to_string(),
            source: input_source,
        })
    }
}

/// An ordered, validated DAG of stage instances plus its execution context.
#[derive(Debug, Clone)]
pub struct Pipeline {
    instances: Vec<StageInstance>,
    region_map: Arc<RegionMap>,
    boards: Arc<BoardGrouping>,
    feeds: BTreeMap<String, String>,
    run_label: String,
}

impl Pipeline {
    pub fn instances(&self) -> &[StageInstance] {
        &self.instances
    }

    pub fn region_map(&self) -> &Arc<RegionMap> {
        &self.region_map
    }

    pub fn boards(&self) -> &Arc<BoardGrouping> {
        &self.boards
    }

    /// Declared external feeds, name to type.
    pub fn feeds(&self) -> &BTreeMap<String, String> {
        &self.feeds
    }

    pub fn run_label(&self) -> &str {
        &self.run_label
    }

    pub fn instance_index(&self, stage: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.name() == stage)
    }

    pub fn instance(&self, stage: &str) -> Option<&StageInstance> {
        self.instances.iter().find(|i| i.name() == stage)
    }

    /// Feed names actually referenced by some binding.
    pub fn referenced_feeds(&self) -> BTreeSet<String> {
        self.instances
            .iter()
            .flat_map(|i| i.bindings.iter())
            .filter_map(|b| match &b.source {
                InputSource::Feed(name) => Some(name.clone()),
                InputSource::Instance { .. } => None,
            })
            .collect()
    }

    /// Replace one instance's descriptor, yielding a new pipeline.
    pub(crate) fn with_instance_descriptor(
        &self,
        index: usize,
        descriptor: Arc<StageDescriptor>,
    ) -> Pipeline {
        let mut pipeline = self.clone();
        pipeline.instances[index].descriptor = descriptor;
        pipeline
    }
}
