//! Configuration: application paths and persisted engine settings.

pub mod paths;
pub mod settings;

pub use paths::{config_file, data_file, ensure_dirs, PathConfig};
pub use settings::Settings;
