//! Record and batch types flowing between stages.
//!
//! Items are schemaless JSON values; board-parallel stages route them by
//! the `"region"` field. Slot values keep a deterministic (sorted) key
//! order so merges and dumps are reproducible.

use std::collections::BTreeMap;

/// A single physics-object-like item.
pub type Item = serde_json::Value;

/// An ordered collection of items for one slot of one record.
pub type Batch = Vec<Item>;

/// Slot name to batch, for one stage invocation.
pub type SlotValues = BTreeMap<String, Batch>;

/// Extract the region id an item belongs to, if any.
pub fn region_of(item: &Item) -> Option<u32> {
    item.get("region").and_then(|v| v.as_u64()).map(|v| v as u32)
}

/// Filter a batch down to the items owned by the given region set.
///
/// Items without a region, or with a region outside the set, are dropped.
pub fn filter_for_regions(batch: &Batch, regions: &[u32]) -> Batch {
    batch
        .iter()
        .filter(|item| region_of(item).is_some_and(|r| regions.contains(&r)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_region_of() {
        assert_eq!(region_of(&json!({"region": 4, "pt": 2.5})), Some(4));
        assert_eq!(region_of(&json!({"pt": 2.5})), None);
        assert_eq!(region_of(&json!({"region": "left"})), None);
    }

    #[test]
    fn test_filter_for_regions() {
        let batch = vec![
            json!({"region": 0, "pt": 1.0}),
            json!({"region": 3, "pt": 2.0}),
            json!({"region": 9, "pt": 3.0}),
            json!({"pt": 4.0}),
        ];

        let filtered = filter_for_regions(&batch, &[0, 9]);
        assert_eq!(filtered.len(), 2);
        assert_eq!(region_of(&filtered[0]), Some(0));
        assert_eq!(region_of(&filtered[1]), Some(9));
    }

    #[test]
    fn test_filter_empty_set() {
        let batch = vec![json!({"region": 0})];
        assert!(filter_for_regions(&batch, &[]).is_empty());
    }
}
