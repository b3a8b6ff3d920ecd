//! Deterministic geocode grouping helpers shared by source implementations.
//!
//! Grouping is a pure re-arrangement: geocodes appear in first-seen order and
//! ids keep their relative order inside each geocode, so the same input
//! always yields the same partition.

use indexmap::IndexMap;

use crate::types::{Geocode, MeterId};

/// Partition `items` into ordered geocode buckets of meter ids.
///
/// Items whose `geocode_key` is `None` are left out; they can still be
/// reached through flat iteration.
pub fn partition_by_geocode<T, I, FId, FGeo>(
    items: I,
    id_key: FId,
    geocode_key: FGeo,
) -> IndexMap<Geocode, Vec<MeterId>>
where
    I: IntoIterator<Item = T>,
    FId: Fn(&T) -> MeterId,
    FGeo: Fn(&T) -> Option<Geocode>,
{
    let mut groups: IndexMap<Geocode, Vec<MeterId>> = IndexMap::new();
    for item in items {
        if let Some(geocode) = geocode_key(&item) {
            groups.entry(geocode).or_default().push(id_key(&item));
        }
    }
    groups
}

/// Concatenate grouped ids back into one flat, group-major id list.
pub fn flatten_groups(groups: &IndexMap<Geocode, Vec<MeterId>>) -> Vec<MeterId> {
    groups.values().flatten().cloned().collect()
}
