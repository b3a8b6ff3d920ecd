//! Meter data source interface and the in-memory source.
//!
//! Ownership model:
//! - `MeterDataSource` is the iterator-facing capability. The iteration
//!   engine consumes it and never implements storage itself.
//! - Sources own id/geocode enumeration order; the engine preserves it.
//! - Records are built on demand per unit and are not retained by the
//!   engine.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::data::{CustomerRecord, DateFilter, WeatherSeries};
use crate::errors::FeatureError;
use crate::types::{Geocode, MeterId, SourceId};

/// Utility helpers used by source implementations.
pub mod utilities;
/// Source implementation modules.
pub mod sources;

pub use sources::json_dir::JsonDirSource;

/// Restricts which ids `MeterDataSource::ids` returns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdFilter {
    /// Only ids in these geocodes. Empty means every geocode.
    pub geocodes: Vec<Geocode>,
    /// Cap on the number of ids returned, applied after geocode filtering.
    pub limit: Option<usize>,
}

impl IdFilter {
    /// A filter that keeps everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_geocodes<I, G>(geocodes: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<Geocode>,
    {
        Self {
            geocodes: geocodes.into_iter().map(Into::into).collect(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` when a record in `geocode` passes the geocode filter.
    pub fn admits(&self, geocode: Option<&str>) -> bool {
        if self.geocodes.is_empty() {
            return true;
        }
        geocode.is_some_and(|geocode| self.geocodes.iter().any(|g| g == geocode))
    }
}

/// Capability the iteration engine consumes to enumerate and load meters.
///
/// For a fixed backing dataset, `ids`, `geocodes`, and `ids_for_geocode`
/// must return the same order on every call.
pub trait MeterDataSource: Send + Sync {
    /// Stable source identifier used in errors and logs.
    fn id(&self) -> &str;

    /// Ordered meter ids admitted by `filter`.
    fn ids(&self, filter: &IdFilter) -> Result<Vec<MeterId>, FeatureError>;

    /// Ordered geocodes. `use_cache` lets a source reuse an earlier listing.
    fn geocodes(&self, use_cache: bool) -> Result<Vec<Geocode>, FeatureError>;

    /// Ordered ids belonging to `geocode`.
    fn ids_for_geocode(&self, geocode: &str) -> Result<Vec<MeterId>, FeatureError> {
        self.ids(&IdFilter::in_geocodes([geocode]))
    }

    /// Build the record for `id`, restricted to `date_filter` when given.
    ///
    /// Fails with `FeatureError::DataFetch` for an unknown id.
    fn meter_data_for_id(
        &self,
        id: &str,
        date_filter: Option<&DateFilter>,
    ) -> Result<CustomerRecord, FeatureError>;

    /// Geocode-scoped weather, when the source has any.
    fn weather_for_geocode(&self, _geocode: &str) -> Result<Option<WeatherSeries>, FeatureError> {
        Ok(None)
    }
}

/// In-memory meter source for tests and small datasets.
pub struct InMemorySource {
    id: SourceId,
    records: Arc<IndexMap<MeterId, CustomerRecord>>,
    weather: IndexMap<Geocode, Arc<WeatherSeries>>,
}

impl InMemorySource {
    /// Create an in-memory source from prebuilt records.
    ///
    /// A later record with an already-seen id replaces the earlier one.
    pub fn new(id: impl Into<SourceId>, records: Vec<CustomerRecord>) -> Self {
        Self {
            id: id.into(),
            records: Arc::new(
                records
                    .into_iter()
                    .map(|record| (record.id.clone(), record))
                    .collect(),
            ),
            weather: IndexMap::new(),
        }
    }

    /// Attach weather for `geocode`; records in that geocode without their
    /// own weather get this series when fetched.
    pub fn with_weather(mut self, geocode: impl Into<Geocode>, weather: WeatherSeries) -> Self {
        self.weather.insert(geocode.into(), Arc::new(weather));
        self
    }

    fn unknown(&self, id: &str) -> FeatureError {
        FeatureError::DataFetch {
            source_id: self.id.clone(),
            id: id.to_string(),
            reason: "unknown meter id".into(),
        }
    }
}

impl MeterDataSource for InMemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn ids(&self, filter: &IdFilter) -> Result<Vec<MeterId>, FeatureError> {
        let admitted = self
            .records
            .values()
            .filter(|record| filter.admits(record.geocode.as_deref()))
            .map(|record| record.id.clone());
        Ok(match filter.limit {
            Some(limit) => admitted.take(limit).collect(),
            None => admitted.collect(),
        })
    }

    fn geocodes(&self, _use_cache: bool) -> Result<Vec<Geocode>, FeatureError> {
        let groups = utilities::grouping::partition_by_geocode(
            self.records.values(),
            |record| record.id.clone(),
            |record| record.geocode.clone(),
        );
        Ok(groups.into_keys().collect())
    }

    fn meter_data_for_id(
        &self,
        id: &str,
        date_filter: Option<&DateFilter>,
    ) -> Result<CustomerRecord, FeatureError> {
        let record = self.records.get(id).ok_or_else(|| self.unknown(id))?;
        let mut record = match date_filter {
            Some(filter) => record.filtered(filter),
            None => record.clone(),
        };
        if record.weather.is_none()
            && let Some(geocode) = record.geocode.as_deref()
            && let Some(weather) = self.weather.get(geocode)
        {
            record.weather = Some(match date_filter {
                Some(filter) => Arc::new(weather.filter_dates(filter)),
                None => Arc::clone(weather),
            });
        }
        Ok(record)
    }

    fn weather_for_geocode(&self, geocode: &str) -> Result<Option<WeatherSeries>, FeatureError> {
        Ok(self.weather.get(geocode).map(|weather| weather.as_ref().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{IntervalWidth, MeterReadings};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn record(id: &str, geocode: &str) -> CustomerRecord {
        let readings = MeterReadings::new(
            IntervalWidth::Hourly,
            vec![day(1), day(2), day(3)],
            vec![vec![Some(1.0); 24]; 3],
        )
        .unwrap();
        CustomerRecord::new(id, readings).with_geocode(geocode)
    }

    fn source() -> InMemorySource {
        InMemorySource::new(
            "mem",
            vec![
                record("000123", "94110").with_attribute("tariff", "E-TOU-C"),
                record("002", "02139"),
                record("003", "94110"),
            ],
        )
        .with_weather(
            "94110",
            WeatherSeries::new("KSFO", vec![day(1), day(2), day(3)], vec![
                Some(10.0),
                Some(11.0),
                Some(12.0),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn ids_preserve_insertion_order_and_filters() {
        let source = source();
        assert_eq!(source.ids(&IdFilter::all()).unwrap(), vec!["000123", "002", "003"]);
        assert_eq!(
            source.ids(&IdFilter::in_geocodes(["94110"])).unwrap(),
            vec!["000123", "003"]
        );
        assert_eq!(source.ids(&IdFilter::all().with_limit(1)).unwrap(), vec!["000123"]);
    }

    #[test]
    fn geocodes_follow_first_appearance() {
        let source = source();
        assert_eq!(source.geocodes(true).unwrap(), vec!["94110", "02139"]);
        assert_eq!(source.ids_for_geocode("02139").unwrap(), vec!["002"]);
    }

    #[test]
    fn fetch_applies_date_filter_and_attaches_weather() {
        let source = source();
        let filter = DateFilter::new(Some(day(2)), None);
        let fetched = source.meter_data_for_id("000123", Some(&filter)).unwrap();
        assert_eq!(fetched.id, "000123");
        assert_eq!(fetched.readings.day_count(), 2);
        let weather = fetched.weather.unwrap();
        assert_eq!(weather.days, vec![day(2), day(3)]);

        assert_eq!(fetched.attributes["tariff"], "E-TOU-C");

        let unweathered = source.meter_data_for_id("002", None).unwrap();
        assert!(unweathered.weather.is_none());
        assert!(unweathered.attributes.is_empty());
    }

    #[test]
    fn unknown_id_is_a_data_fetch_error() {
        let err = source().meter_data_for_id("123", None).unwrap_err();
        assert!(matches!(err, FeatureError::DataFetch { ref id, .. } if id == "123"));
    }
}
