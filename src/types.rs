/// Opaque meter/customer identifier. Never parsed as a number.
/// Examples: `000123`, `8172635499120038812736`, `MTR-44-B`
pub type MeterId = String;
/// Opaque geographic grouping key (usually a postal code).
/// Examples: `94110`, `02139`
pub type Geocode = String;
/// Identifier for the data source that produced a record.
/// Examples: `in_memory`, `json_dir:/data/meters`
pub type SourceId = String;
/// Name of a feature column emitted by a feature function.
/// Examples: `total_kwh`, `load_shape`, `peak_hour`
pub type FeatureName = String;
/// Namespace for entries in the run-context cache.
/// Examples: `weather`, `weather_features`
pub type CacheCategory = String;
/// Warning/log message text.
/// Examples: `feature 'summary' failed: no valid readings`
pub type LogMessage = String;
