//! Feature-function contract and the ordered set a run applies.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::context::RunContext;
use crate::data::{CustomerRecord, FeatureMap};
use crate::errors::FeatureError;
use crate::types::FeatureName;

/// Pluggable analysis over one customer record.
///
/// Implementations return a flat feature map or an error. They may read and
/// write the shared `RunContext` cache; that is the intended way to share
/// expensive per-geocode work across units.
pub trait FeatureFunction: Send + Sync {
    /// Stable name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Compute features for `record`.
    fn compute(
        &self,
        record: &CustomerRecord,
        ctx: &RunContext,
        extra: &ExtraArgs,
    ) -> Result<FeatureMap, FeatureError>;
}

/// Adapter turning a closure into a `FeatureFunction`.
pub struct FnFeature<F> {
    name: FeatureName,
    func: F,
}

impl<F> FnFeature<F>
where
    F: Fn(&CustomerRecord, &RunContext, &ExtraArgs) -> Result<FeatureMap, FeatureError>
        + Send
        + Sync,
{
    pub fn new(name: impl Into<FeatureName>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> FeatureFunction for FnFeature<F>
where
    F: Fn(&CustomerRecord, &RunContext, &ExtraArgs) -> Result<FeatureMap, FeatureError>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(
        &self,
        record: &CustomerRecord,
        ctx: &RunContext,
        extra: &ExtraArgs,
    ) -> Result<FeatureMap, FeatureError> {
        (self.func)(record, ctx, extra)
    }
}

/// Wrap a closure as a shareable feature function.
pub fn feature_fn<F>(name: impl Into<FeatureName>, func: F) -> Arc<dyn FeatureFunction>
where
    F: Fn(&CustomerRecord, &RunContext, &ExtraArgs) -> Result<FeatureMap, FeatureError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnFeature::new(name, func))
}

/// Ordered list of feature functions applied to every unit.
#[derive(Clone, Default)]
pub struct FeatureSet {
    functions: Vec<Arc<dyn FeatureFunction>>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a function; it runs after every function already present.
    pub fn push(&mut self, function: Arc<dyn FeatureFunction>) {
        self.functions.push(function);
    }

    /// Builder form of `push`.
    pub fn with(mut self, function: Arc<dyn FeatureFunction>) -> Self {
        self.push(function);
        self
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FeatureFunction>> {
        self.functions.iter()
    }

    /// Function names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.functions.iter().map(|function| function.name()).collect()
    }
}

impl FromIterator<Arc<dyn FeatureFunction>> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn FeatureFunction>>>(iter: I) -> Self {
        Self {
            functions: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Caller-supplied arguments forwarded untouched to every feature function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtraArgs {
    values: IndexMap<String, Value>,
}

impl ExtraArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `insert`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Decode an argument into `T`.
    ///
    /// Returns `Ok(None)` when absent and an error when present but of the
    /// wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FeatureError> {
        self.values
            .get(key)
            .map(|value| T::deserialize(value).map_err(FeatureError::from))
            .transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::data::{FeatureValue, IntervalWidth, MeterReadings};

    fn record() -> CustomerRecord {
        CustomerRecord::new("000123", MeterReadings::empty(IntervalWidth::Hourly))
    }

    #[test]
    fn closure_feature_sees_record_and_extra_args() {
        let function = feature_fn("echo", |record, _ctx, extra| {
            let mut out = FeatureMap::new();
            out.insert("id".into(), FeatureValue::from(record.id.as_str()));
            let base: f64 = extra.get_as("base_temp_c")?.unwrap_or(18.0);
            out.insert("base".into(), base.into());
            Ok(out)
        });
        let features = FeatureSet::new().with(Arc::clone(&function));
        let ctx = RunContext::new(RunConfig::default(), features);
        let extra = ExtraArgs::new().with("base_temp_c", 15.5);
        let out = function.compute(&record(), &ctx, &extra).unwrap();
        assert_eq!(out["id"], FeatureValue::Text("000123".into()));
        assert_eq!(out["base"], FeatureValue::Number(15.5));
    }

    #[test]
    fn feature_set_preserves_order() {
        let noop = |name: &'static str| {
            feature_fn(name, |_record, _ctx, _extra| Ok(FeatureMap::new()))
        };
        let set: FeatureSet = vec![noop("b"), noop("a"), noop("c")].into_iter().collect();
        assert_eq!(set.names(), vec!["b", "a", "c"]);
        assert_eq!(set.len(), 3);
        assert_eq!(format!("{set:?}"), r#"["b", "a", "c"]"#);
    }

    #[test]
    fn extra_args_type_mismatch_is_an_error() {
        let extra = ExtraArgs::new().with("base_temp_c", "warm");
        assert!(extra.get_as::<f64>("base_temp_c").is_err());
        assert_eq!(extra.get_as::<f64>("missing").unwrap(), None);
    }
}
