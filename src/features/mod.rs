//! Built-in feature functions over the reading matrix.

use std::sync::Arc;

use crate::feature::FeatureSet;

pub mod consumption;
pub mod load_shape;

pub use consumption::ConsumptionSummary;
pub use load_shape::LoadShape;

/// `ConsumptionSummary` followed by `LoadShape`.
pub fn builtin_features() -> FeatureSet {
    FeatureSet::new()
        .with(Arc::new(ConsumptionSummary))
        .with(Arc::new(LoadShape))
}
