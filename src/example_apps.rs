use std::error::Error;
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, ValueEnum, error::ErrorKind};
use serde_json::json;

use crate::config::{CollisionPolicy, ColumnOrder, RunConfig};
use crate::constants::cache::WEATHER_FEATURES_CATEGORY;
use crate::context::RunContext;
use crate::data::{DateFilter, FeatureMap};
use crate::errors::FeatureError;
use crate::feature::{ExtraArgs, FeatureSet, feature_fn};
use crate::features::builtin_features;
use crate::iteration::{GroupedIterator, iterate_meters, iterate_meters_parallel};
use crate::reduce::to_table_with;
use crate::source::{IdFilter, JsonDirSource, MeterDataSource};

type DynSource = Box<dyn MeterDataSource + 'static>;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColumnOrderArg {
    FirstSeen,
    Lexical,
}

impl From<ColumnOrderArg> for ColumnOrder {
    fn from(value: ColumnOrderArg) -> Self {
        match value {
            ColumnOrderArg::FirstSeen => ColumnOrder::FirstSeen,
            ColumnOrderArg::Lexical => ColumnOrder::Lexical,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "feature_table_demo",
    disable_help_subcommand = true,
    about = "Compute a feature table over meter data",
    long_about = "Run the built-in feature functions over every meter of a source and print the resulting table.",
    after_help = "Without --data-dir a small synthetic in-memory source is used. Set RUST_LOG=info to see run progress."
)]
/// CLI for `feature_table_demo`.
///
/// Common usage:
/// - Synthetic data, flat iteration: no arguments
/// - A directory of `<geocode>/<id>.json` meter files: `--data-dir /data/meters`
/// - Share per-geocode weather across a group: `--grouped`
/// - Fan units out over the rayon pool: `--parallel`
struct FeatureTableDemoCli {
    #[arg(
        long = "data-dir",
        value_name = "PATH",
        help = "Directory of <geocode>/<id>.json meter files"
    )]
    data_dir: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Optional JSON run configuration; flags below override it"
    )]
    config: Option<PathBuf>,
    #[arg(long, help = "Iterate geocode by geocode with shared weather")]
    grouped: bool,
    #[arg(
        long,
        conflicts_with = "grouped",
        help = "Run units in parallel with an atomic per-key context cache"
    )]
    parallel: bool,
    #[arg(long, help = "Abort when two feature functions emit the same key")]
    strict: bool,
    #[arg(long = "column-order", value_enum, help = "Table column ordering")]
    column_order: Option<ColumnOrderArg>,
    #[arg(
        long,
        value_name = "YYYY-MM-DD",
        value_parser = parse_date_arg,
        help = "First day kept (inclusive)"
    )]
    start: Option<NaiveDate>,
    #[arg(
        long,
        value_name = "YYYY-MM-DD",
        value_parser = parse_date_arg,
        help = "Last day kept (inclusive)"
    )]
    end: Option<NaiveDate>,
    #[arg(
        long = "geocode",
        value_name = "GEOCODE",
        help = "Restrict to a geocode, repeat as needed"
    )]
    geocodes: Vec<String>,
    #[arg(
        long,
        conflicts_with = "grouped",
        value_parser = parse_positive_usize,
        help = "Process at most this many meters"
    )]
    limit: Option<usize>,
    #[arg(long, help = "Print the table and run stats as JSON")]
    json: bool,
}

/// Run the feature-table demo.
///
/// `build_fallback_source` supplies the source used when `--data-dir` is not
/// given.
pub fn run_feature_table_demo<Build, I>(
    args_iter: I,
    build_fallback_source: Build,
) -> Result<(), Box<dyn Error>>
where
    Build: FnOnce() -> DynSource,
    I: Iterator<Item = String>,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let Some(cli) = parse_cli::<FeatureTableDemoCli, _>(
        std::iter::once("feature_table_demo".to_string()).chain(args_iter),
    )?
    else {
        return Ok(());
    };

    let mut config = match &cli.config {
        Some(path) => RunConfig::from_path(path)?,
        None => RunConfig::default(),
    };
    if cli.strict {
        config.collision_policy = CollisionPolicy::Strict;
    }
    if let Some(order) = cli.column_order {
        config.column_order = order.into();
    }
    if cli.start.is_some() || cli.end.is_some() {
        let current = config.date_filter.unwrap_or_default();
        config.date_filter = Some(DateFilter::new(
            cli.start.or(current.start),
            cli.end.or(current.end),
        ));
    }

    let source: DynSource = match &cli.data_dir {
        Some(dir) => Box::new(JsonDirSource::new(dir)),
        None => build_fallback_source(),
    };

    let features = demo_features();
    let ctx = if cli.parallel {
        RunContext::concurrent(config, features)
    } else {
        RunContext::new(config, features)
    };
    let extra = ExtraArgs::new();

    let mut filter = if cli.geocodes.is_empty() {
        IdFilter::all()
    } else {
        IdFilter::in_geocodes(cli.geocodes.iter().cloned())
    };
    if let Some(limit) = cli.limit {
        filter = filter.with_limit(limit);
    }

    let result = if cli.grouped {
        let mut geocodes = source.geocodes(true)?;
        if !cli.geocodes.is_empty() {
            geocodes.retain(|geocode| cli.geocodes.contains(geocode));
        }
        GroupedIterator::new(source.as_ref()).run(&geocodes, &ctx, &extra, None)?
    } else {
        let ids = source.ids(&filter)?;
        if cli.parallel {
            iterate_meters_parallel(source.as_ref(), &ids, &ctx, &extra)?
        } else {
            iterate_meters(source.as_ref(), &ids, &ctx, &extra)?
        }
    };

    let table = to_table_with(&result, ctx.config().column_order);
    let stats = result.stats();
    if cli.json {
        let payload = json!({ "table": table, "stats": stats });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("=== feature table ({}) ===", source.id());
    print!("{table}");
    println!();
    println!("[RUN STATS]");
    println!("  attempted: {}", stats.attempted);
    println!("  succeeded: {}", stats.succeeded);
    println!(
        "  failed: {} (fetch {}, feature {}, panic {})",
        stats.failed, stats.failed_fetch, stats.failed_feature, stats.panicked
    );
    for entry in &stats.per_feature {
        println!("    {}: {}", entry.feature, entry.count);
    }
    for (geocode, reason) in result.failed_groups() {
        println!("  group {geocode} skipped: {reason}");
    }
    Ok(())
}

/// Built-in features plus a per-geocode mean temperature memoized in the
/// run context.
fn demo_features() -> FeatureSet {
    builtin_features().with(feature_fn("mean_temperature", |record, ctx, _extra| {
        let mut out = FeatureMap::new();
        let Some(geocode) = record.geocode.as_deref() else {
            return Ok(out);
        };
        let Some(weather) = ctx.weather(geocode).or_else(|| record.weather.clone()) else {
            return Ok(out);
        };
        let mean = ctx.memoize(WEATHER_FEATURES_CATEGORY, geocode, || {
            let observed: Vec<f64> = weather.mean_temp_c.iter().flatten().copied().collect();
            if observed.is_empty() {
                return Err(FeatureError::computation(
                    "mean_temperature",
                    format!("no temperatures observed for geocode {geocode}"),
                ));
            }
            Ok(observed.iter().sum::<f64>() / observed.len() as f64)
        })?;
        out.insert("mean_temp_c".into(), (*mean).into());
        Ok(out)
    }))
}

fn parse_positive_usize(raw: &str) -> Result<usize, String> {
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| format!("Could not parse --limit value '{raw}' as a positive integer"))?;
    if parsed == 0 {
        return Err("--limit must be greater than zero".to_string());
    }
    Ok(parsed)
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date '{raw}': expected YYYY-MM-DD"))
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}
