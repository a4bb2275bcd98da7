use crate::config::AppConfig;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

pub fn setup_logging(config: &AppConfig) {
    common::setup_logging(config.environment, DEFAULT_LOG_FILTER);
}
