use chrono::{Days, NaiveDate};
use meter_features::data::{CustomerRecord, IntervalWidth, MeterReadings, WeatherSeries};
use meter_features::source::{InMemorySource, MeterDataSource};

const DAYS: u64 = 14;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 7, 1).unwrap_or_default()
}

fn calendar() -> Vec<NaiveDate> {
    (0..DAYS)
        .filter_map(|offset| start().checked_add_days(Days::new(offset)))
        .collect()
}

/// Evening-peaking household profile scaled by `base`.
fn household(base: f64, gap_every: Option<usize>) -> Vec<Vec<Option<f64>>> {
    (0..DAYS as usize)
        .map(|day| {
            (0..24)
                .map(|hour| {
                    if gap_every.is_some_and(|every| (day * 24 + hour) % every == 0) {
                        return None;
                    }
                    let evening = if (17..22).contains(&hour) { 2.5 } else { 1.0 };
                    Some(base * evening * (1.0 + (day % 3) as f64 * 0.1))
                })
                .collect()
        })
        .collect()
}

fn weather(station: &str, base: f64) -> Option<WeatherSeries> {
    let days = calendar();
    let temps = (0..days.len()).map(|idx| Some(base + idx as f64 * 0.4)).collect();
    WeatherSeries::new(station, days, temps).ok()
}

fn meter(id: &str, geocode: &str, rows: Vec<Vec<Option<f64>>>) -> Option<CustomerRecord> {
    let readings = MeterReadings::new(IntervalWidth::Hourly, calendar(), rows).ok()?;
    Some(CustomerRecord::new(id, readings).with_geocode(geocode))
}

/// Small two-geocode dataset. Meter `004` has no readings at all so the demo
/// shows a failure row.
pub fn build_synthetic_source() -> Box<dyn MeterDataSource> {
    let records = [
        meter("000123", "94110", household(0.4, None)),
        meter("000124", "94110", household(0.7, Some(11))),
        meter("8172635499120038812736", "02139", household(0.9, None)),
        meter("004", "02139", vec![vec![None; 24]; DAYS as usize]),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut source = InMemorySource::new("synthetic", records);
    for (geocode, station, base) in [("94110", "KSFO", 16.0), ("02139", "KBOS", 21.0)] {
        if let Some(series) = weather(station, base) {
            source = source.with_weather(geocode, series);
        }
    }
    Box::new(source)
}
