use crate::context::RunContext;
use crate::data::{CustomerRecord, FeatureMap, FeatureValue};
use crate::errors::FeatureError;
use crate::feature::{ExtraArgs, FeatureFunction};

/// Average intraday profile normalized by its overall mean.
///
/// `load_shape` has one entry per intraday slot (24 or 96). `peak_slot` is
/// the first slot with the highest mean and `peak_hour` is the hour it falls
/// in. Every slot needs at least one reading and the mean must be non-zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadShape;

impl LoadShape {
    pub const NAME: &'static str = "load_shape";
}

impl FeatureFunction for LoadShape {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compute(
        &self,
        record: &CustomerRecord,
        _ctx: &RunContext,
        _extra: &ExtraArgs,
    ) -> Result<FeatureMap, FeatureError> {
        let readings = &record.readings;
        let profile = readings
            .interval_profile()
            .into_iter()
            .enumerate()
            .map(|(slot, mean)| {
                mean.ok_or_else(|| {
                    FeatureError::computation(Self::NAME, format!("slot {slot} has no readings"))
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let overall = profile.iter().sum::<f64>() / profile.len() as f64;
        if overall == 0.0 || !overall.is_finite() {
            return Err(FeatureError::computation(
                Self::NAME,
                format!("profile mean is {overall}"),
            ));
        }

        let mut peak_slot = 0;
        for (slot, value) in profile.iter().enumerate() {
            if *value > profile[peak_slot] {
                peak_slot = slot;
            }
        }
        let shape: Vec<f64> = profile.iter().map(|value| value / overall).collect();

        let mut out = FeatureMap::new();
        out.insert("load_shape".into(), shape.into());
        out.insert("peak_slot".into(), FeatureValue::from(peak_slot));
        out.insert(
            "peak_hour".into(),
            FeatureValue::from(peak_slot / readings.interval().per_hour()),
        );
        Ok(out)
    }
}
