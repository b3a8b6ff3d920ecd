/// Constants used by the run-context cache.
pub mod cache {
    /// Cache category holding raw `WeatherSeries` values keyed by geocode.
    pub const WEATHER_CATEGORY: &str = "weather";
    /// Cache category for derived per-geocode weather features.
    pub const WEATHER_FEATURES_CATEGORY: &str = "weather_features";
}

/// Constants used by the iteration strategies.
pub mod iteration {
    use std::time::Duration;

    /// Minimum wall-clock gap between progress log lines.
    pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_millis(750);
    /// Runs with at least this many planned items also log periodic progress.
    pub const PROGRESS_MIN_UNITS: usize = 1_000;
    /// Message recorded when a panic payload is not a string.
    pub const OPAQUE_PANIC_MESSAGE: &str = "panicked with a non-string payload";
}

/// Constants used when rendering a `ResultTable`.
pub mod table {
    /// Text written for a missing cell.
    pub const MISSING_MARKER: &str = "NA";
    /// Header of the trailing per-row status column.
    pub const STATUS_COLUMN: &str = "status";
    /// Header of the leading id column.
    pub const ID_COLUMN: &str = "id";
    /// Status value for a row that produced features.
    pub const STATUS_OK: &str = "ok";
    /// Status value for a failure-sentinel row.
    pub const STATUS_FAILED: &str = "failed";
}

/// Constants used by the JSON directory source.
pub mod json_dir {
    /// File extension of per-meter files.
    pub const METER_FILE_EXTENSION: &str = "json";
    /// Per-geocode weather file name (excluded from meter discovery).
    pub const WEATHER_FILE_NAME: &str = "_weather.json";
}
