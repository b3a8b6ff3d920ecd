use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::FeatureError;

pub use crate::types::{FeatureName, Geocode, LogMessage, MeterId};

/// Fixed intraday reading cadence of a meter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalWidth {
    /// 24 readings per day.
    Hourly,
    /// 96 readings per day.
    QuarterHourly,
}

impl IntervalWidth {
    /// Number of readings in one day.
    pub const fn per_day(self) -> usize {
        match self {
            Self::Hourly => 24,
            Self::QuarterHourly => 96,
        }
    }

    /// Number of readings in one hour.
    pub const fn per_hour(self) -> usize {
        self.per_day() / 24
    }

    /// Resolve a cadence from a row width, if it is one we support.
    pub fn from_per_day(width: usize) -> Option<Self> {
        match width {
            24 => Some(Self::Hourly),
            96 => Some(Self::QuarterHourly),
            _ => None,
        }
    }
}

/// Inclusive calendar-date bounds applied to meter and weather data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    /// First day kept (inclusive). `None` means unbounded.
    #[serde(default)]
    pub start: Option<NaiveDate>,
    /// Last day kept (inclusive). `None` means unbounded.
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl DateFilter {
    /// Create a filter from optional inclusive bounds.
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    /// Returns `true` when `date` falls inside the bounds.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
    }

    /// Returns `true` when `start` is after `end`, which can never match.
    pub fn is_inverted(&self) -> bool {
        matches!((self.start, self.end), (Some(start), Some(end)) if start > end)
    }
}

/// Day-by-interval matrix of meter readings.
///
/// Rows are days (ascending, one per entry in `days`), columns are the fixed
/// intraday intervals given by `interval`. `None` marks a missing reading.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MeterReadings {
    interval: IntervalWidth,
    days: Vec<NaiveDate>,
    rows: Vec<Vec<Option<f64>>>,
}

impl MeterReadings {
    /// Build a validated reading matrix.
    pub fn new(
        interval: IntervalWidth,
        days: Vec<NaiveDate>,
        rows: Vec<Vec<Option<f64>>>,
    ) -> Result<Self, FeatureError> {
        if days.len() != rows.len() {
            return Err(FeatureError::MalformedReadings(format!(
                "{} days but {} reading rows",
                days.len(),
                rows.len()
            )));
        }
        let width = interval.per_day();
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
            return Err(FeatureError::MalformedReadings(format!(
                "row {} for {} has {} readings, expected {}",
                idx,
                days[idx],
                row.len(),
                width
            )));
        }
        if days.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(FeatureError::MalformedReadings(
                "days must be strictly ascending".into(),
            ));
        }
        Ok(Self {
            interval,
            days,
            rows,
        })
    }

    /// An empty matrix with the given cadence.
    pub fn empty(interval: IntervalWidth) -> Self {
        Self {
            interval,
            days: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn interval(&self) -> IntervalWidth {
        self.interval
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn rows(&self) -> &[Vec<Option<f64>>] {
        &self.rows
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Keep only the days inside `filter`.
    pub fn filter_dates(&self, filter: &DateFilter) -> Self {
        let (days, rows) = self
            .days
            .iter()
            .zip(self.rows.iter())
            .filter(|(day, _)| filter.contains(**day))
            .map(|(day, row)| (*day, row.clone()))
            .unzip();
        Self {
            interval: self.interval,
            days,
            rows,
        }
    }

    /// Iterate every present reading in day-major order.
    pub fn valid_readings(&self) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().flatten().filter_map(|value| *value)
    }

    /// Sum of present readings per day; `None` for a day with no readings.
    pub fn daily_totals(&self) -> Vec<Option<f64>> {
        self.rows
            .iter()
            .map(|row| {
                let mut present = row.iter().filter_map(|value| *value).peekable();
                present.peek()?;
                Some(present.sum())
            })
            .collect()
    }

    /// Sum of every present reading, or `None` when nothing is present.
    pub fn total(&self) -> Option<f64> {
        let mut present = self.valid_readings().peekable();
        present.peek()?;
        Some(present.sum())
    }

    /// Mean reading per intraday slot across all days.
    pub fn interval_profile(&self) -> Vec<Option<f64>> {
        let width = self.interval.per_day();
        let mut sums = vec![0.0f64; width];
        let mut counts = vec![0usize; width];
        for row in &self.rows {
            for (slot, value) in row.iter().enumerate() {
                if let Some(value) = value {
                    sums[slot] += value;
                    counts[slot] += 1;
                }
            }
        }
        sums.into_iter()
            .zip(counts)
            .map(|(sum, count)| (count > 0).then(|| sum / count as f64))
            .collect()
    }

    /// Share of cells with no reading. An empty matrix reports `0.0`.
    pub fn missing_fraction(&self) -> f64 {
        let cells = self.rows.len() * self.interval.per_day();
        if cells == 0 {
            return 0.0;
        }
        let missing = self.rows.iter().flatten().filter(|v| v.is_none()).count();
        missing as f64 / cells as f64
    }
}

/// Daily weather observations for one station.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeatherSeries {
    /// Station identifier the observations came from.
    pub station: String,
    /// Observation days, aligned with `mean_temp_c`.
    pub days: Vec<NaiveDate>,
    /// Daily mean dry-bulb temperature in degrees Celsius.
    pub mean_temp_c: Vec<Option<f64>>,
}

impl WeatherSeries {
    /// Build a series, rejecting misaligned columns.
    pub fn new(
        station: impl Into<String>,
        days: Vec<NaiveDate>,
        mean_temp_c: Vec<Option<f64>>,
    ) -> Result<Self, FeatureError> {
        if days.len() != mean_temp_c.len() {
            return Err(FeatureError::MalformedReadings(format!(
                "weather has {} days but {} temperatures",
                days.len(),
                mean_temp_c.len()
            )));
        }
        Ok(Self {
            station: station.into(),
            days,
            mean_temp_c,
        })
    }

    /// Mean temperature on `date`, if observed.
    pub fn temperature_on(&self, date: NaiveDate) -> Option<f64> {
        let idx = self.days.binary_search(&date).ok()?;
        self.mean_temp_c[idx]
    }

    /// Keep only the days inside `filter`.
    pub fn filter_dates(&self, filter: &DateFilter) -> Self {
        let (days, mean_temp_c) = self
            .days
            .iter()
            .zip(self.mean_temp_c.iter())
            .filter(|(day, _)| filter.contains(**day))
            .map(|(day, temp)| (*day, *temp))
            .unzip();
        Self {
            station: self.station.clone(),
            days,
            mean_temp_c,
        }
    }
}

/// Per-meter input bundle handed to every feature function.
#[derive(Clone, Debug)]
pub struct CustomerRecord {
    /// Meter identifier, kept verbatim.
    pub id: MeterId,
    /// Geographic grouping for the meter, when known.
    pub geocode: Option<Geocode>,
    /// Reading matrix.
    pub readings: MeterReadings,
    /// Weather observations attached by the source, if any.
    pub weather: Option<Arc<WeatherSeries>>,
    /// Free-form metadata (tariff, rate class, ...).
    pub attributes: IndexMap<String, String>,
}

impl CustomerRecord {
    /// Create a record with no geocode, weather, or attributes.
    pub fn new(id: impl Into<MeterId>, readings: MeterReadings) -> Self {
        Self {
            id: id.into(),
            geocode: None,
            readings,
            weather: None,
            attributes: IndexMap::new(),
        }
    }

    pub fn with_geocode(mut self, geocode: impl Into<Geocode>) -> Self {
        self.geocode = Some(geocode.into());
        self
    }

    pub fn with_weather(mut self, weather: Arc<WeatherSeries>) -> Self {
        self.weather = Some(weather);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Copy of this record restricted to `filter` (weather included).
    pub fn filtered(&self, filter: &DateFilter) -> Self {
        Self {
            id: self.id.clone(),
            geocode: self.geocode.clone(),
            readings: self.readings.filter_dates(filter),
            weather: self
                .weather
                .as_ref()
                .map(|weather| Arc::new(weather.filter_dates(filter))),
            attributes: self.attributes.clone(),
        }
    }
}

/// A single feature value: scalar or nested structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<FeatureValue>),
    Record(IndexMap<String, FeatureValue>),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::List(_) | Self::Record(_) => {
                let encoded = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&encoded)
            }
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for FeatureValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<FeatureValue>> From<Vec<T>> for FeatureValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Feature name to value, in emission order.
pub type FeatureMap = IndexMap<FeatureName, FeatureValue>;

/// What kind of fault turned a unit into a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source could not produce a record for the id.
    DataFetch,
    /// A feature function returned an error.
    FeatureComputation,
    /// The fetch or a feature function panicked.
    Panic,
}

/// Failure sentinel payload for one unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: FailureKind,
    /// Feature function that faulted, when the fault came from one.
    pub feature: Option<FeatureName>,
    pub message: LogMessage,
}

/// Outcome of one unit: merged features, or the failure sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitResult {
    Features(FeatureMap),
    Failure(UnitFailure),
}

impl UnitResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn features(&self) -> Option<&FeatureMap> {
        match self {
            Self::Features(features) => Some(features),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&UnitFailure> {
        match self {
            Self::Features(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

/// Per-id outcomes of one iteration run, in iteration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunResult {
    units: IndexMap<MeterId, UnitResult>,
    failed_groups: IndexMap<Geocode, LogMessage>,
}

impl RunResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for `id`.
    ///
    /// A repeated id replaces the earlier outcome but keeps its position.
    pub fn insert(&mut self, id: impl Into<MeterId>, result: UnitResult) -> Option<UnitResult> {
        self.units.insert(id.into(), result)
    }

    /// Record a geocode whose member ids could not be listed.
    pub fn record_group_failure(&mut self, geocode: impl Into<Geocode>, reason: impl Into<String>) {
        self.failed_groups.insert(geocode.into(), reason.into());
    }

    pub fn get(&self, id: &str) -> Option<&UnitResult> {
        self.units.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &MeterId> {
        self.units.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MeterId, &UnitResult)> {
        self.units.iter()
    }

    /// Geocodes whose id listing failed, with the reason.
    pub fn failed_groups(&self) -> &IndexMap<Geocode, LogMessage> {
        &self.failed_groups
    }

    /// Attempted vs. succeeded accounting for this result.
    pub fn stats(&self) -> crate::metrics::RunStats {
        crate::metrics::run_stats(self)
    }

    /// Append every entry of `other` after the current entries.
    pub fn merge(&mut self, other: RunResult) {
        self.units.extend(other.units);
        self.failed_groups.extend(other.failed_groups);
    }
}

impl FromIterator<(MeterId, UnitResult)> for RunResult {
    fn from_iter<I: IntoIterator<Item = (MeterId, UnitResult)>>(iter: I) -> Self {
        Self {
            units: iter.into_iter().collect(),
            failed_groups: IndexMap::new(),
        }
    }
}
