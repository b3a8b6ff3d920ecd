//! Iteration strategies: flat over ids, or grouped by geocode.
//!
//! Both strategies share one per-unit path (`fetch record -> UnitExecutor`)
//! so grouping changes only scheduling and caching, never feature values.
//! The unit of parallel dispatch is one id's fetch plus feature run; units
//! interact only through the shared `RunContext`.

use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::cache::WEATHER_CATEGORY;
use crate::constants::iteration::{PROGRESS_MIN_UNITS, PROGRESS_REPORT_INTERVAL};
use crate::context::{CacheKey, RunContext};
use crate::data::{FailureKind, RunResult, UnitResult};
use crate::errors::FeatureError;
use crate::executor::{UnitExecutor, failure, panic_message};
use crate::feature::ExtraArgs;
use crate::source::{IdFilter, MeterDataSource};
use crate::types::{Geocode, MeterId};

/// Receives each completed geocode group when grouped results are cached.
pub trait GroupSink {
    /// Take ownership of (or copy) one group's complete results.
    ///
    /// On `Err` the iterator keeps the group in its returned `RunResult`.
    fn flush_group(&mut self, geocode: &str, result: &RunResult) -> Result<(), FeatureError>;
}

/// `GroupSink` that keeps every flushed group in memory, in flush order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    groups: Vec<(Geocode, RunResult)>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &[(Geocode, RunResult)] {
        &self.groups
    }

    /// Merge every flushed group back into one result.
    pub fn into_merged(self) -> RunResult {
        let mut merged = RunResult::new();
        for (_, group) in self.groups {
            merged.merge(group);
        }
        merged
    }
}

impl GroupSink for CollectingSink {
    fn flush_group(&mut self, geocode: &str, result: &RunResult) -> Result<(), FeatureError> {
        self.groups.push((geocode.to_string(), result.clone()));
        Ok(())
    }
}

/// Wall-clock throttled progress reporting.
///
/// `planned` and `done` count the same thing: units for flat runs,
/// geocodes for grouped runs.
struct Progress {
    label: &'static str,
    total: usize,
    done: usize,
    failed: usize,
    started: Instant,
    last_report: Instant,
    periodic: bool,
}

impl Progress {
    fn start(label: &'static str, total: usize) -> Self {
        info!(strategy = label, planned = total, "iteration started");
        let now = Instant::now();
        Self {
            label,
            total,
            done: 0,
            failed: 0,
            started: now,
            last_report: now,
            periodic: total >= PROGRESS_MIN_UNITS,
        }
    }

    fn tick(&mut self, failed: bool) {
        self.done += 1;
        if failed {
            self.failed += 1;
        }
        if self.periodic && self.last_report.elapsed() >= PROGRESS_REPORT_INTERVAL {
            info!(
                strategy = self.label,
                done = self.done,
                planned = self.total,
                failed = self.failed,
                elapsed_s = self.started.elapsed().as_secs_f64(),
                "iteration progress"
            );
            self.last_report = Instant::now();
        }
    }

    fn finish(&self) {
        info!(
            strategy = self.label,
            done = self.done,
            failed = self.failed,
            elapsed_s = self.started.elapsed().as_secs_f64(),
            "iteration finished"
        );
    }
}

/// Drives the unit executor over an ordered list of ids.
pub struct FlatIterator<'a> {
    source: &'a dyn MeterDataSource,
}

impl<'a> FlatIterator<'a> {
    pub fn new(source: &'a dyn MeterDataSource) -> Self {
        Self { source }
    }

    /// Process `ids` in order, one unit at a time.
    ///
    /// The returned result has exactly one entry per distinct input id, in
    /// input order. Only run-wide configuration problems return `Err`.
    pub fn run(
        &self,
        ids: &[MeterId],
        ctx: &RunContext,
        extra: &ExtraArgs,
    ) -> Result<RunResult, FeatureError> {
        ctx.validate()?;
        let executor = UnitExecutor::for_context(ctx);
        let mut progress = Progress::start("flat", ids.len());
        let mut result = RunResult::new();
        for id in ids {
            let unit = self.run_unit(id, ctx, &executor, extra)?;
            progress.tick(unit.is_failure());
            result.insert(id.clone(), unit);
        }
        progress.finish();
        Ok(result)
    }

    /// List ids from the source with `filter`, then `run` them.
    pub fn run_all(
        &self,
        filter: &IdFilter,
        ctx: &RunContext,
        extra: &ExtraArgs,
    ) -> Result<RunResult, FeatureError> {
        ctx.validate()?;
        let ids = self.source.ids(filter)?;
        self.run(&ids, ctx, extra)
    }

    /// Process `ids` on the rayon pool, one unit per task.
    ///
    /// Output order still follows `ids`. Pair with a context built by
    /// `RunContext::concurrent` so shared cache entries are computed once.
    pub fn run_parallel(
        &self,
        ids: &[MeterId],
        ctx: &RunContext,
        extra: &ExtraArgs,
    ) -> Result<RunResult, FeatureError> {
        ctx.validate()?;
        let executor = UnitExecutor::for_context(ctx);
        let progress = Mutex::new(Progress::start("flat_parallel", ids.len()));
        let outcomes: Vec<Result<UnitResult, FeatureError>> = ids
            .par_iter()
            .map(|id| -> Result<UnitResult, FeatureError> {
                let unit = self.run_unit(id, ctx, &executor, extra)?;
                progress
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .tick(unit.is_failure());
                Ok(unit)
            })
            .collect();
        let mut result = RunResult::new();
        for (id, outcome) in ids.iter().zip(outcomes) {
            result.insert(id.clone(), outcome?);
        }
        progress
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .finish();
        Ok(result)
    }

    /// Fetch and execute one unit. Fetch faults become `DataFetch` or
    /// `Panic` failures, exactly like feature faults.
    pub(crate) fn run_unit(
        &self,
        id: &MeterId,
        ctx: &RunContext,
        executor: &UnitExecutor<'_>,
        extra: &ExtraArgs,
    ) -> Result<UnitResult, FeatureError> {
        let date_filter = ctx.config().date_filter;
        let fetched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.source.meter_data_for_id(id, date_filter.as_ref())
        }));
        let unit = match fetched {
            Ok(Ok(record)) => executor.execute(&record, ctx, extra)?,
            Ok(Err(err)) => failure(id, FailureKind::DataFetch, None, err.to_string()),
            Err(payload) => failure(id, FailureKind::Panic, None, panic_message(payload.as_ref())),
        };
        debug!(meter_id = %id, failed = unit.is_failure(), "unit completed");
        Ok(unit)
    }
}

/// Drives the unit executor geocode by geocode.
///
/// Before a group's first unit runs, the group's weather is fetched once and
/// stored in the context under the `weather` category keyed by geocode, so
/// feature functions for every unit in the group share it.
pub struct GroupedIterator<'a> {
    source: &'a dyn MeterDataSource,
}

impl<'a> GroupedIterator<'a> {
    pub fn new(source: &'a dyn MeterDataSource) -> Self {
        Self { source }
    }

    /// Process each geocode's ids in order.
    ///
    /// With `sink = None` every group is merged into the returned result.
    /// With a sink (cached results), each completed group is handed to the
    /// sink and dropped from memory along with its prefetched weather; the
    /// returned result then holds only groups the sink rejected.
    pub fn run(
        &self,
        geocodes: &[Geocode],
        ctx: &RunContext,
        extra: &ExtraArgs,
        mut sink: Option<&mut dyn GroupSink>,
    ) -> Result<RunResult, FeatureError> {
        ctx.validate()?;
        let executor = UnitExecutor::for_context(ctx);
        let flat = FlatIterator::new(self.source);
        let mut progress = Progress::start("grouped", geocodes.len());
        let mut result = RunResult::new();
        for geocode in geocodes {
            let ids = match self.source.ids_for_geocode(geocode) {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(geocode = %geocode, error = %err, "geocode listing failed");
                    result.record_group_failure(geocode.clone(), err.to_string());
                    progress.tick(true);
                    continue;
                }
            };
            let prefetched = self.prefetch_weather(geocode, ctx);
            let mut group = RunResult::new();
            for id in &ids {
                group.insert(id.clone(), flat.run_unit(id, ctx, &executor, extra)?);
            }
            debug!(geocode = %geocode, units = group.len(), "group completed");
            progress.tick(false);
            match sink.as_mut() {
                Some(sink) => match sink.flush_group(geocode, &group) {
                    Ok(()) => {
                        if prefetched {
                            ctx.cache()
                                .remove(&CacheKey::new(WEATHER_CATEGORY, geocode.as_str()));
                        }
                    }
                    Err(err) => {
                        warn!(
                            geocode = %geocode,
                            error = %err,
                            "group sink failed; keeping group in memory"
                        );
                        result.merge(group);
                    }
                },
                None => result.merge(group),
            }
        }
        progress.finish();
        Ok(result)
    }

    /// List geocodes from the source, then `run` them.
    pub fn run_all(
        &self,
        use_cache: bool,
        ctx: &RunContext,
        extra: &ExtraArgs,
        sink: Option<&mut dyn GroupSink>,
    ) -> Result<RunResult, FeatureError> {
        ctx.validate()?;
        let geocodes = self.source.geocodes(use_cache)?;
        self.run(&geocodes, ctx, extra, sink)
    }

    /// Store the group's weather in the context. Returns `true` when this
    /// call stored a new entry.
    fn prefetch_weather(&self, geocode: &Geocode, ctx: &RunContext) -> bool {
        if !ctx.config().prefetch_weather || ctx.weather(geocode).is_some() {
            return false;
        }
        match self.source.weather_for_geocode(geocode) {
            Ok(Some(weather)) => {
                let weather = match ctx.config().date_filter {
                    Some(filter) => weather.filter_dates(&filter),
                    None => weather,
                };
                ctx.store(WEATHER_CATEGORY, geocode, weather);
                debug!(geocode = %geocode, "weather prefetched");
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(geocode = %geocode, error = %err, "weather prefetch failed");
                false
            }
        }
    }
}

/// Flat iteration over `ids`.
pub fn iterate_meters(
    source: &dyn MeterDataSource,
    ids: &[MeterId],
    ctx: &RunContext,
    extra: &ExtraArgs,
) -> Result<RunResult, FeatureError> {
    FlatIterator::new(source).run(ids, ctx, extra)
}

/// Flat iteration over `ids` on the rayon pool.
pub fn iterate_meters_parallel(
    source: &dyn MeterDataSource,
    ids: &[MeterId],
    ctx: &RunContext,
    extra: &ExtraArgs,
) -> Result<RunResult, FeatureError> {
    FlatIterator::new(source).run_parallel(ids, ctx, extra)
}

/// Grouped iteration over `geocodes`; a `sink` enables cached results.
pub fn iterate_zip(
    source: &dyn MeterDataSource,
    geocodes: &[Geocode],
    ctx: &RunContext,
    extra: &ExtraArgs,
    sink: Option<&mut dyn GroupSink>,
) -> Result<RunResult, FeatureError> {
    GroupedIterator::new(source).run(geocodes, ctx, extra, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::data::{
        CustomerRecord, FeatureMap, FeatureValue, IntervalWidth, MeterReadings, WeatherSeries,
    };
    use crate::feature::{FeatureSet, feature_fn};
    use crate::source::InMemorySource;
    use chrono::NaiveDate;
    use std::io::{self, Write};
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    fn record(id: &str, geocode: &str) -> CustomerRecord {
        let readings =
            MeterReadings::new(IntervalWidth::Hourly, vec![day(1)], vec![vec![Some(1.0); 24]])
                .unwrap();
        CustomerRecord::new(id, readings).with_geocode(geocode)
    }

    fn source() -> InMemorySource {
        InMemorySource::new("mem", vec![record("A", "Z"), record("B", "Z"), record("C", "Y")])
            .with_weather("Z", WeatherSeries::new("KZ", vec![day(1)], vec![Some(4.0)]).unwrap())
    }

    fn weather_seen() -> FeatureSet {
        FeatureSet::new().with(feature_fn("weather_seen", |record, ctx, _extra| {
            let mut out = FeatureMap::new();
            let geocode = record.geocode.clone().unwrap_or_default();
            out.insert("prefetched".into(), ctx.weather(&geocode).is_some().into());
            Ok(out)
        }))
    }

    #[test]
    fn grouped_prefetches_weather_before_units() {
        let source = source();
        let ctx = RunContext::new(RunConfig::default(), weather_seen());
        let geocodes = vec!["Z".to_string(), "Y".to_string()];
        let result = iterate_zip(&source, &geocodes, &ctx, &ExtraArgs::new(), None).unwrap();
        let ids: Vec<&MeterId> = result.ids().collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        let prefetched = |id: &str| result.get(id).unwrap().features().unwrap()["prefetched"].clone();
        assert_eq!(prefetched("A"), FeatureValue::Flag(true));
        assert_eq!(prefetched("B"), FeatureValue::Flag(true));
        assert_eq!(prefetched("C"), FeatureValue::Flag(false));
    }

    #[test]
    fn prefetch_can_be_disabled() {
        let source = source();
        let config = RunConfig {
            prefetch_weather: false,
            ..RunConfig::default()
        };
        let ctx = RunContext::new(config, weather_seen());
        let result =
            iterate_zip(&source, &["Z".to_string()], &ctx, &ExtraArgs::new(), None).unwrap();
        assert_eq!(
            result.get("A").unwrap().features().unwrap()["prefetched"],
            FeatureValue::Flag(false)
        );
        assert!(ctx.cache().is_empty());
    }

    #[test]
    fn sink_receives_groups_and_weather_is_evicted() {
        let source = source();
        let ctx = RunContext::new(RunConfig::default(), weather_seen());
        let mut sink = CollectingSink::new();
        let geocodes = vec!["Z".to_string(), "Y".to_string()];
        let result =
            iterate_zip(&source, &geocodes, &ctx, &ExtraArgs::new(), Some(&mut sink)).unwrap();
        assert!(result.is_empty());
        assert_eq!(sink.groups().len(), 2);
        assert_eq!(sink.groups()[0].0, "Z");
        assert_eq!(sink.groups()[0].1.len(), 2);
        assert!(ctx.weather("Z").is_none());
        let merged = sink.into_merged();
        assert_eq!(merged.len(), 3);
    }

    struct RejectingSink;

    impl GroupSink for RejectingSink {
        fn flush_group(&mut self, _geocode: &str, _result: &RunResult) -> Result<(), FeatureError> {
            Err(FeatureError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn rejected_groups_stay_in_result() {
        let source = source();
        let ctx = RunContext::new(RunConfig::default(), weather_seen());
        let mut sink = RejectingSink;
        let result = iterate_zip(
            &source,
            &["Z".to_string()],
            &ctx,
            &ExtraArgs::new(),
            Some(&mut sink),
        )
        .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn empty_feature_set_aborts_before_fetching() {
        let source = source();
        let ctx = RunContext::new(RunConfig::default(), FeatureSet::new());
        let err = iterate_meters(&source, &["A".to_string()], &ctx, &ExtraArgs::new()).unwrap_err();
        assert!(matches!(err, FeatureError::Configuration(_)));
        let err = iterate_zip(&source, &["Z".to_string()], &ctx, &ExtraArgs::new(), None)
            .unwrap_err();
        assert!(matches!(err, FeatureError::Configuration(_)));
    }

    #[test]
    fn run_all_lists_from_source() {
        let source = source();
        let ctx = RunContext::new(RunConfig::default(), weather_seen());
        let flat = FlatIterator::new(&source)
            .run_all(&IdFilter::in_geocodes(["Y"]), &ctx, &ExtraArgs::new())
            .unwrap();
        assert_eq!(flat.ids().collect::<Vec<_>>(), vec!["C"]);
        let grouped = GroupedIterator::new(&source)
            .run_all(true, &ctx, &ExtraArgs::new(), None)
            .unwrap();
        assert_eq!(grouped.len(), 3);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured_logs(run: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::with_default(subscriber, run);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn line_with<'a>(logs: &'a str, message: &str) -> &'a str {
        logs.lines().find(|line| line.contains(message)).unwrap()
    }

    #[test]
    fn grouped_progress_counts_geocodes() {
        let source = source();
        let ctx = RunContext::new(RunConfig::default(), weather_seen());
        let logs = captured_logs(|| {
            iterate_zip(&source, &["Z".to_string()], &ctx, &ExtraArgs::new(), None).unwrap();
        });
        assert!(line_with(&logs, "iteration started").contains("planned=1"));
        let finished = line_with(&logs, "iteration finished");
        assert!(finished.contains("done=1"));
        assert!(finished.contains("failed=0"));
    }

    #[test]
    fn parallel_progress_counts_every_unit() {
        let source = source();
        let ctx = RunContext::concurrent(RunConfig::default(), weather_seen());
        let ids = vec!["A".to_string(), "B".to_string(), "missing".to_string()];
        let logs = captured_logs(|| {
            iterate_meters_parallel(&source, &ids, &ctx, &ExtraArgs::new()).unwrap();
        });
        assert!(line_with(&logs, "iteration started").contains("planned=3"));
        let finished = line_with(&logs, "iteration finished");
        assert!(finished.contains("done=3"));
        assert!(finished.contains("failed=1"));
    }
}
