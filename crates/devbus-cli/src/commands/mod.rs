//! CLI command implementations

mod config;
mod soak;

pub use config::{config_init, config_path, config_show, load_manager_config};
pub use soak::{load_soak_config, run_soak, SessionReport, SoakConfig, SoakReport};
