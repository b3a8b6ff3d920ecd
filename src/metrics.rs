use indexmap::IndexMap;
use serde::Serialize;

use crate::data::{FailureKind, RunResult};
use crate::types::FeatureName;

/// Attempted vs. succeeded accounting for one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_fetch: usize,
    pub failed_feature: usize,
    pub panicked: usize,
    /// Geocodes whose id listing failed.
    pub failed_groups: usize,
    /// Share of attempted units that failed; `0.0` for an empty run.
    pub failure_rate: f64,
    pub per_feature: Vec<FeatureFailures>,
}

/// Failures attributed to one feature function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FeatureFailures {
    pub feature: FeatureName,
    pub count: usize,
}

/// Summarize a run result.
/// `per_feature` is sorted by count (descending), then feature name.
pub fn run_stats(result: &RunResult) -> RunStats {
    let mut stats = RunStats {
        failed_groups: result.failed_groups().len(),
        ..RunStats::default()
    };
    let mut by_feature: IndexMap<FeatureName, usize> = IndexMap::new();
    for (_, unit) in result.iter() {
        stats.attempted += 1;
        let Some(failure) = unit.failure() else {
            stats.succeeded += 1;
            continue;
        };
        stats.failed += 1;
        match failure.kind {
            FailureKind::DataFetch => stats.failed_fetch += 1,
            FailureKind::FeatureComputation => stats.failed_feature += 1,
            FailureKind::Panic => stats.panicked += 1,
        }
        if let Some(feature) = &failure.feature {
            *by_feature.entry(feature.clone()).or_default() += 1;
        }
    }
    stats.failure_rate = if stats.attempted == 0 {
        0.0
    } else {
        stats.failed as f64 / stats.attempted as f64
    };
    let mut per_feature: Vec<FeatureFailures> = by_feature
        .into_iter()
        .map(|(feature, count)| FeatureFailures { feature, count })
        .collect();
    per_feature.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.feature.cmp(&b.feature)));
    stats.per_feature = per_feature;
    stats
}
