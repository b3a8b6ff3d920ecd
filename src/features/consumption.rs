use crate::context::RunContext;
use crate::data::{CustomerRecord, FeatureMap, FeatureValue};
use crate::errors::FeatureError;
use crate::feature::{ExtraArgs, FeatureFunction};

/// Whole-period consumption totals and extremes.
///
/// Emits `days`, `total_kwh`, `mean_daily_kwh`, `max_interval_kwh`,
/// `min_interval_kwh` and `missing_fraction`. `mean_daily_kwh` averages only
/// days with at least one reading. Fails when the record has no reading at
/// all.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsumptionSummary;

impl ConsumptionSummary {
    pub const NAME: &'static str = "consumption_summary";
}

impl FeatureFunction for ConsumptionSummary {
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
        let total = readings
            .total()
            .ok_or_else(|| FeatureError::computation(Self::NAME, "no valid readings"))?;

        let observed: Vec<f64> = readings.daily_totals().into_iter().flatten().collect();
        let mean_daily = total / observed.len() as f64;
        let (min, max) = readings
            .valid_readings()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), value| {
                (lo.min(value), hi.max(value))
            });

        let mut out = FeatureMap::new();
        out.insert("days".into(), FeatureValue::from(readings.day_count()));
        out.insert("total_kwh".into(), total.into());
        out.insert("mean_daily_kwh".into(), mean_daily.into());
        out.insert("max_interval_kwh".into(), max.into());
        out.insert("min_interval_kwh".into(), min.into());
        out.insert("missing_fraction".into(), readings.missing_fraction().into());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::data::{IntervalWidth, MeterReadings};
    use crate::feature::FeatureSet;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn ctx() -> RunContext {
        RunContext::new(
            RunConfig::default(),
            FeatureSet::new().with(Arc::new(ConsumptionSummary)),
        )
    }

    fn record(rows: Vec<Vec<Option<f64>>>) -> CustomerRecord {
        let days = (0..rows.len())
            .map(|offset| NaiveDate::from_ymd_opt(2024, 1, 1 + offset as u32).unwrap())
            .collect();
        let readings = MeterReadings::new(IntervalWidth::Hourly, days, rows).unwrap();
        CustomerRecord::new("000123", readings)
    }

    fn number(map: &FeatureMap, key: &str) -> f64 {
        match map[key] {
            FeatureValue::Number(value) => value,
            ref other => panic!("{key} is not a number: {other:?}"),
        }
    }

    #[test]
    fn summarizes_present_readings() {
        let mut first = vec![Some(1.0); 24];
        first[5] = Some(4.0);
        let mut second = vec![None; 24];
        second[0] = Some(0.5);
        let out = ConsumptionSummary
            .compute(&record(vec![first, second]), &ctx(), &ExtraArgs::new())
            .unwrap();

        assert_eq!(out["days"], FeatureValue::Integer(2));
        assert!((number(&out, "total_kwh") - 27.5).abs() < 1e-9);
        assert!((number(&out, "mean_daily_kwh") - 13.75).abs() < 1e-9);
        assert!((number(&out, "max_interval_kwh") - 4.0).abs() < 1e-9);
        assert!((number(&out, "min_interval_kwh") - 0.5).abs() < 1e-9);
        assert!((number(&out, "missing_fraction") - 23.0 / 48.0).abs() < 1e-9);
    }

    #[test]
    fn mean_daily_skips_days_without_readings() {
        let out = ConsumptionSummary
            .compute(
                &record(vec![vec![Some(2.0); 24], vec![None; 24]]),
                &ctx(),
                &ExtraArgs::new(),
            )
            .unwrap();
        assert!((number(&out, "mean_daily_kwh") - 48.0).abs() < 1e-9);
    }

    #[test]
    fn fails_without_valid_readings() {
        let err = ConsumptionSummary
            .compute(&record(vec![vec![None; 24]]), &ctx(), &ExtraArgs::new())
            .unwrap_err();
        assert!(matches!(
            err,
            FeatureError::FeatureComputation { ref feature, .. } if feature == ConsumptionSummary::NAME
        ));
    }
}
