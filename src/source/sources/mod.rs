/// Directory-of-JSON meter source.
pub mod json_dir;
