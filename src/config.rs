use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::data::DateFilter;
use crate::errors::FeatureError;

/// How the unit executor merges feature maps that share a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// A later feature function silently overwrites an earlier one's key.
    #[default]
    LastWriteWins,
    /// Any shared key aborts the run with `FeatureError::KeyCollision`.
    Strict,
}

/// Column ordering used when reducing a run into a table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnOrder {
    /// Order in which feature names are first seen while walking the run.
    #[default]
    FirstSeen,
    /// Byte-wise lexical order of feature names.
    Lexical,
}

/// Top-level run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Calendar bounds passed to the source for every fetch.
    pub date_filter: Option<DateFilter>,
    /// Key-merge behavior across feature functions.
    pub collision_policy: CollisionPolicy,
    /// Fetch geocode-scoped weather once per group before its units run.
    pub prefetch_weather: bool,
    /// Column ordering for `ResultTable`.
    pub column_order: ColumnOrder,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            date_filter: None,
            collision_policy: CollisionPolicy::LastWriteWins,
            prefetch_weather: true,
            column_order: ColumnOrder::FirstSeen,
        }
    }
}

impl RunConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, FeatureError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject settings that could never produce a meaningful run.
    pub fn validate(&self) -> Result<(), FeatureError> {
        if let Some(filter) = self.date_filter
            && filter.is_inverted()
        {
            return Err(FeatureError::Configuration(format!(
                "date filter start {:?} is after end {:?}",
                filter.start, filter.end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn empty_json_yields_defaults() {
        let config = RunConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RunConfig::default());
        assert!(config.prefetch_weather);
    }

    #[test]
    fn json_overrides_fields() {
        let config = RunConfig::from_json_str(
            r#"{
                "date_filter": {"start": "2024-01-01", "end": "2024-03-31"},
                "collision_policy": "strict",
                "prefetch_weather": false,
                "column_order": "lexical"
            }"#,
        )
        .unwrap();
        assert_eq!(config.collision_policy, CollisionPolicy::Strict);
        assert_eq!(config.column_order, ColumnOrder::Lexical);
        assert!(!config.prefetch_weather);
        let filter = config.date_filter.unwrap();
        assert_eq!(filter.start, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(filter.end, NaiveDate::from_ymd_opt(2024, 3, 31));
    }

    #[test]
    fn inverted_date_filter_is_a_configuration_error() {
        let err = RunConfig::from_json_str(
            r#"{"date_filter": {"start": "2024-05-01", "end": "2024-01-01"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FeatureError::Configuration(ref msg) if msg.contains("after end")));
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"column_order": "lexical"}"#).unwrap();
        let config = RunConfig::from_path(&path).unwrap();
        assert_eq!(config.column_order, ColumnOrder::Lexical);
    }

    #[test]
    fn unknown_enum_value_is_rejected() {
        let err = RunConfig::from_json_str(r#"{"collision_policy": "maybe"}"#).unwrap_err();
        assert!(matches!(err, FeatureError::Json(_)));
    }
}
