use std::error::Error;

#[path = "common/synthetic_source.rs"]
mod synthetic_source;

fn main() -> Result<(), Box<dyn Error>> {
    meter_features::example_apps::run_feature_table_demo(
        std::env::args().skip(1),
        synthetic_source::build_synthetic_source,
    )
}
