use std::io;

use thiserror::Error;

use crate::types::{FeatureName, MeterId, SourceId};

/// Error type for data fetches, feature computation, and run configuration.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("data source '{source_id}' could not fetch meter '{id}': {reason}")]
    DataFetch {
        source_id: SourceId,
        id: MeterId,
        reason: String,
    },
    #[error("data source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable { source_id: SourceId, reason: String },
    #[error("feature '{feature}' failed: {reason}")]
    FeatureComputation {
        feature: FeatureName,
        reason: String,
    },
    #[error("feature key '{key}' emitted by both '{first}' and '{second}'")]
    KeyCollision {
        key: FeatureName,
        first: FeatureName,
        second: FeatureName,
    },
    #[error("malformed meter readings: {0}")]
    MalformedReadings(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl FeatureError {
    /// Shorthand for a feature computation failure.
    pub fn computation(feature: impl Into<FeatureName>, reason: impl Into<String>) -> Self {
        Self::FeatureComputation {
            feature: feature.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for run-wide misconfiguration that must abort the run.
    ///
    /// Everything else is contained at the unit boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::KeyCollision { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_and_collisions_are_fatal() {
        assert!(FeatureError::Configuration("no features".into()).is_fatal());
        assert!(
            FeatureError::KeyCollision {
                key: "total_kwh".into(),
                first: "a".into(),
                second: "b".into(),
            }
            .is_fatal()
        );
        assert!(!FeatureError::computation("summary", "boom").is_fatal());
        assert!(
            !FeatureError::DataFetch {
                source_id: "mem".into(),
                id: "X".into(),
                reason: "unknown".into(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn data_fetch_message_keeps_id_verbatim() {
        let err = FeatureError::DataFetch {
            source_id: "mem".into(),
            id: "000123".into(),
            reason: "unknown meter".into(),
        };
        assert_eq!(
            err.to_string(),
            "data source 'mem' could not fetch meter '000123': unknown meter"
        );
    }
}
