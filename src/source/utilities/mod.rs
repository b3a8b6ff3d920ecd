/// Geocode grouping helpers.
pub mod grouping;
