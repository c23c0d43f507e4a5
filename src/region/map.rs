//! Static partition of the input space into ordered regions.
//!
//! A [`RegionMap`] is built once at configuration time and never mutated
//! afterwards. Pipeline variants with different boundaries derive from a
//! base map via [`RegionMap::clone_with`], which is copy-on-write: the
//! source map is untouched and unaffected regions share boundary storage.

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One partition unit with its ordered boundary markers.
///
/// Boundaries are strictly increasing; `n` markers define `n - 1`
/// sub-ranges within the region.
#[derive(Debug, Clone)]
pub struct Region {
    id: u32,
    boundaries: Arc<[f64]>,
}

impl Region {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// Number of sub-ranges delimited by the boundary markers.
    pub fn sub_ranges(&self) -> usize {
        self.boundaries.len().saturating_sub(1)
    }
}

/// Ordered, contiguous set of regions covering the input space.
#[derive(Debug, Clone, Default)]
pub struct RegionMap {
    regions: Vec<Region>,
}

impl RegionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the next region. Ids are contiguous from zero; passing any
    /// other id fails rather than silently reindexing.
    pub fn define(&mut self, id: u32, boundaries: Vec<f64>) -> Result<&Region, ConfigError> {
        let expected = self.regions.len() as u32;
        if id != expected {
            return Err(ConfigError::NonContiguousRegionId { expected, got: id });
        }
        check_boundaries(id, &boundaries)?;

        self.regions.push(Region {
            id,
            boundaries: boundaries.into(),
        });
        Ok(&self.regions[id as usize])
    }

    /// Derive a new map with some regions' boundaries replaced.
    ///
    /// Copy-on-write: overridden regions get fresh boundary storage,
    /// untouched regions share theirs with the source. The source map is
    /// never mutated.
    pub fn clone_with(
        &self,
        overrides: &BTreeMap<u32, Vec<f64>>,
    ) -> Result<RegionMap, ConfigError> {
        for (&id, boundaries) in overrides {
            if id as usize >= self.regions.len() {
                return Err(ConfigError::UnknownRegion(id));
            }
            check_boundaries(id, boundaries)?;
        }

        let regions = self
            .regions
            .iter()
            .map(|region| match overrides.get(&region.id) {
                Some(boundaries) => Region {
                    id: region.id,
                    boundaries: boundaries.clone().into(),
                },
                None => region.clone(),
            })
            .collect();

        Ok(RegionMap { regions })
    }

    pub fn region(&self, id: u32) -> Option<&Region> {
        self.regions.get(id as usize)
    }

    pub fn contains(&self, id: u32) -> bool {
        (id as usize) < self.regions.len()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}

fn check_boundaries(region: u32, boundaries: &[f64]) -> Result<(), ConfigError> {
    if boundaries.len() < 2 {
        return Err(ConfigError::InvalidBoundary { region });
    }
    if boundaries.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::InvalidBoundary { region });
    }
    Ok(())
}
