use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::constants::json_dir::{METER_FILE_EXTENSION, WEATHER_FILE_NAME};
use crate::data::{CustomerRecord, DateFilter, IntervalWidth, MeterReadings, WeatherSeries};
use crate::errors::FeatureError;
use crate::source::{IdFilter, MeterDataSource};
use crate::types::{Geocode, MeterId, SourceId};

/// On-disk shape of one meter file.
#[derive(Debug, Deserialize)]
struct MeterFile {
    /// Overrides the file stem as the meter id when present.
    #[serde(default)]
    id: Option<MeterId>,
    #[serde(default)]
    interval: Option<IntervalWidth>,
    readings: Vec<DayReadings>,
    #[serde(default)]
    attributes: IndexMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DayReadings {
    date: NaiveDate,
    values: Vec<Option<f64>>,
}

#[derive(Clone, Debug)]
struct MeterEntry {
    path: PathBuf,
    geocode: Geocode,
}

/// Result of one directory scan.
#[derive(Debug, Default)]
struct DirIndex {
    meters: IndexMap<MeterId, MeterEntry>,
    groups: IndexMap<Geocode, Vec<MeterId>>,
    weather: IndexMap<Geocode, PathBuf>,
}

/// Directory-backed meter source.
///
/// Layout: `<root>/<geocode>/<meter id>.json`, plus an optional
/// `<root>/<geocode>/_weather.json` holding a `WeatherSeries`. Geocodes and
/// ids are listed in file-name order. A meter file may carry an explicit
/// `"id"` when the id is not a valid file name.
pub struct JsonDirSource {
    source_id: SourceId,
    root: PathBuf,
    follow_links: bool,
    index: RwLock<Option<Arc<DirIndex>>>,
    weather_cache: RwLock<HashMap<Geocode, Arc<WeatherSeries>>>,
}

impl JsonDirSource {
    /// Create a source rooted at `root`. Nothing is scanned until first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            source_id: format!("json_dir:{}", root.display()),
            root,
            follow_links: false,
            index: RwLock::new(None),
            weather_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Override the source identifier used in errors and logs.
    pub fn with_source_id(mut self, source_id: impl Into<SourceId>) -> Self {
        self.source_id = source_id.into();
        self
    }

    /// Configure symlink traversal.
    pub fn with_follow_symlinks(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index(&self, use_cache: bool) -> Result<Arc<DirIndex>, FeatureError> {
        if use_cache
            && let Some(index) = self
                .index
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
        {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(self.scan()?);
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&index));
        // Weather parsed against an older listing may no longer exist.
        self.weather_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(index)
    }

    fn scan(&self) -> Result<DirIndex, FeatureError> {
        if !self.root.is_dir() {
            return Err(FeatureError::SourceUnavailable {
                source_id: self.source_id.clone(),
                reason: format!("root '{}' is not a directory", self.root.display()),
            });
        }
        let mut index = DirIndex::default();
        let walker = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .follow_links(self.follow_links)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(source_id = %self.source_id, error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(geocode) = path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
            else {
                continue;
            };
            let file_name = entry.file_name().to_string_lossy();
            if file_name == WEATHER_FILE_NAME {
                index.weather.insert(geocode, path.to_path_buf());
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(METER_FILE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            else {
                continue;
            };
            let id = Self::declared_id(path).unwrap_or(stem);
            if let Some(existing) = index.meters.get(&id) {
                warn!(
                    source_id = %self.source_id,
                    meter_id = %id,
                    kept = %existing.path.display(),
                    skipped = %path.display(),
                    "duplicate meter id"
                );
                continue;
            }
            index.groups.entry(geocode.clone()).or_default().push(id.clone());
            index.meters.insert(
                id,
                MeterEntry {
                    path: path.to_path_buf(),
                    geocode,
                },
            );
        }
        debug!(
            source_id = %self.source_id,
            meters = index.meters.len(),
            geocodes = index.groups.len(),
            "meter directory scanned"
        );
        Ok(index)
    }

    /// Cheap peek at an explicit `"id"` field; full parsing happens on fetch.
    fn declared_id(path: &Path) -> Option<MeterId> {
        #[derive(Deserialize)]
        struct IdOnly {
            id: Option<MeterId>,
        }
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str::<IdOnly>(&raw).ok()?.id
    }

    fn fetch_error(&self, id: &str, reason: impl Into<String>) -> FeatureError {
        FeatureError::DataFetch {
            source_id: self.source_id.clone(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    fn load_meter(&self, id: &str, entry: &MeterEntry) -> Result<CustomerRecord, FeatureError> {
        let raw = fs::read_to_string(&entry.path)
            .map_err(|err| self.fetch_error(id, format!("{}: {err}", entry.path.display())))?;
        let file: MeterFile = serde_json::from_str(&raw)
            .map_err(|err| self.fetch_error(id, format!("{}: {err}", entry.path.display())))?;
        let width = file.readings.first().map(|day| day.values.len()).unwrap_or(24);
        let interval = match file.interval {
            Some(interval) => interval,
            None => IntervalWidth::from_per_day(width).ok_or_else(|| {
                self.fetch_error(id, format!("cannot infer interval from {width} readings per day"))
            })?,
        };
        let (days, rows) = file
            .readings
            .into_iter()
            .map(|day| (day.date, day.values))
            .unzip();
        let readings = MeterReadings::new(interval, days, rows)
            .map_err(|err| self.fetch_error(id, err.to_string()))?;
        let mut record = CustomerRecord::new(file.id.unwrap_or_else(|| id.to_string()), readings)
            .with_geocode(entry.geocode.clone());
        record.attributes = file.attributes;
        Ok(record)
    }

    fn load_weather(&self, geocode: &str) -> Result<Option<Arc<WeatherSeries>>, FeatureError> {
        if let Some(hit) = self
            .weather_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(geocode)
        {
            return Ok(Some(Arc::clone(hit)));
        }
        let index = self.index(true)?;
        let Some(path) = index.weather.get(geocode) else {
            return Ok(None);
        };
        let raw = fs::read_to_string(path)?;
        let parsed: WeatherSeries = serde_json::from_str(&raw)?;
        let weather = Arc::new(WeatherSeries::new(
            parsed.station,
            parsed.days,
            parsed.mean_temp_c,
        )?);
        self.weather_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(geocode.to_string(), Arc::clone(&weather));
        Ok(Some(weather))
    }
}

impl MeterDataSource for JsonDirSource {
    fn id(&self) -> &str {
        &self.source_id
    }

    fn ids(&self, filter: &IdFilter) -> Result<Vec<MeterId>, FeatureError> {
        let index = self.index(true)?;
        let admitted = index
            .meters
            .iter()
            .filter(|(_, entry)| filter.admits(Some(entry.geocode.as_str())))
            .map(|(id, _)| id.clone());
        Ok(match filter.limit {
            Some(limit) => admitted.take(limit).collect(),
            None => admitted.collect(),
        })
    }

    fn geocodes(&self, use_cache: bool) -> Result<Vec<Geocode>, FeatureError> {
        Ok(self.index(use_cache)?.groups.keys().cloned().collect())
    }

    fn ids_for_geocode(&self, geocode: &str) -> Result<Vec<MeterId>, FeatureError> {
        Ok(self
            .index(true)?
            .groups
            .get(geocode)
            .cloned()
            .unwrap_or_default())
    }

    fn meter_data_for_id(
        &self,
        id: &str,
        date_filter: Option<&DateFilter>,
    ) -> Result<CustomerRecord, FeatureError> {
        let index = self.index(true)?;
        let entry = index
            .meters
            .get(id)
            .ok_or_else(|| self.fetch_error(id, "unknown meter id"))?;
        let mut record = self.load_meter(id, entry)?;
        match self.load_weather(&entry.geocode) {
            Ok(weather) => record.weather = weather,
            Err(err) => warn!(
                source_id = %self.source_id,
                geocode = %entry.geocode,
                error = %err,
                "weather unavailable for meter"
            ),
        }
        Ok(match date_filter {
            Some(filter) => record.filtered(filter),
            None => record,
        })
    }

    fn weather_for_geocode(&self, geocode: &str) -> Result<Option<WeatherSeries>, FeatureError> {
        Ok(self
            .load_weather(geocode)?
            .map(|weather| weather.as_ref().clone()))
    }
}
