pub mod prelude;

pub mod file_records;
pub mod owner_settings;
