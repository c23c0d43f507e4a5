//! Declarative overlays on top of a built pipeline.
//!
//! Overlays never mutate the base pipeline: each application returns a
//! new `Pipeline`, so two configurations can be compared A/B in the same
//! process.

use crate::error::ConfigError;
use crate::io::DumpSpec;
use crate::pipeline::Pipeline;
use crate::stage::ParamValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Override one parameter of one stage, producing a new pipeline.
pub fn apply_feature_toggle(
    pipeline: &Pipeline,
    stage: &str,
    flag: &str,
    value: ParamValue,
) -> Result<Pipeline, ConfigError> {
    let index = pipeline
        .instance_index(stage)
        .ok_or_else(|| ConfigError::UnknownStage(stage.to_string()))?;

    let descriptor = pipeline.instances()[index].descriptor();
    let overrides = BTreeMap::from([(flag.to_string(), value)]);
    let toggled = descriptor.with_params(descriptor.name().to_string(), &overrides)?;

    Ok(pipeline.with_instance_descriptor(index, Arc::new(toggled)))
}

/// Batch-enable dump output for a set of stages, producing a new pipeline.
///
/// The template must carry `{stage}` and `{board}` substitution points.
pub fn apply_dump_naming(
    pipeline: &Pipeline,
    stages: &BTreeSet<String>,
    template: &str,
) -> Result<Pipeline, ConfigError> {
    let spec = DumpSpec::new(template)?;

    let mut result = pipeline.clone();
    for stage in stages {
        let index = result
            .instance_index(stage)
            .ok_or_else(|| ConfigError::UnknownStage(stage.clone()))?;
        let descriptor = result.instances()[index].descriptor();
        let dumped = descriptor.with_dump(spec.clone());
        result = result.with_instance_descriptor(index, Arc::new(dumped));
    }
    Ok(result)
}
