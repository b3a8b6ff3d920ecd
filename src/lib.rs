#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Run configuration types.
pub mod config;
/// Centralized constants used across the cache, iterators, table, and sources.
pub mod constants;
/// Per-context memoizing caches and the shared run context.
pub mod context;
/// Meter, weather, and result data types.
pub mod data;
/// Reusable example runners shared by downstream crates.
pub mod example_apps;
/// Per-unit execution with fault isolation.
pub mod executor;
/// Feature-function contract and composition.
pub mod feature;
/// Built-in feature functions.
pub mod features;
/// Flat and grouped iteration strategies.
pub mod iteration;
/// Aggregate run metrics helpers.
pub mod metrics;
/// Reduction of run results into tables.
pub mod reduce;
/// Data source traits and built-in sources.
pub mod source;
/// Shared type aliases.
pub mod types;

mod errors;

pub use config::{CollisionPolicy, ColumnOrder, RunConfig};
pub use context::{CacheEntry, CacheKey, ContextCache, KeyedCache, LocalCache, RunContext};
pub use data::{
    CustomerRecord, DateFilter, FailureKind, FeatureMap, FeatureValue, IntervalWidth,
    MeterReadings, RunResult, UnitFailure, UnitResult, WeatherSeries,
};
pub use errors::FeatureError;
pub use executor::UnitExecutor;
pub use feature::{ExtraArgs, FeatureFunction, FeatureSet, FnFeature, feature_fn};
pub use features::{ConsumptionSummary, LoadShape, builtin_features};
pub use iteration::{
    CollectingSink, FlatIterator, GroupSink, GroupedIterator, iterate_meters,
    iterate_meters_parallel, iterate_zip,
};
pub use metrics::{FeatureFailures, RunStats, run_stats};
pub use reduce::{Cell, ResultTable, TableRow, to_table, to_table_with};
pub use source::{IdFilter, InMemorySource, JsonDirSource, MeterDataSource};
pub use types::{CacheCategory, FeatureName, Geocode, LogMessage, MeterId, SourceId};
