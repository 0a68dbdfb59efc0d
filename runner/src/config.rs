//! Runner Configuration
//!
//! Engine parameters come from an optional TOML file; command-line flags
//! override individual fields before validation.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use common::{Config, ConfigParams};

/// Command-line overrides applied on top of the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub worker_num: Option<usize>,
    pub pin_workers: bool,
}

/// Read raw parameters, falling back to defaults without a file
pub fn load_params(path: Option<&Path>) -> Result<ConfigParams> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let params = ConfigParams::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            Ok(params)
        }
        None => {
            info!("No configuration file given, using defaults");
            Ok(ConfigParams::default())
        }
    }
}

/// Apply overrides and validate
pub fn build_config(mut params: ConfigParams, overrides: &Overrides) -> Result<Config> {
    if let Some(workers) = overrides.worker_num {
        params.worker_num = workers;
    }
    if overrides.pin_workers {
        params.pin_workers = true;
    }
    Config::new(params).context("Invalid engine configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_before_validation() {
        let overrides = Overrides {
            worker_num: Some(7),
            pin_workers: true,
        };
        let config = build_config(ConfigParams::default(), &overrides).unwrap();
        assert_eq!(config.worker_num, 7);
        assert!(config.pin_workers);

        let zero = Overrides {
            worker_num: Some(0),
            ..Overrides::default()
        };
        assert!(build_config(ConfigParams::default(), &zero).is_err());
    }

    #[test]
    fn test_sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/massive_mimo.toml");
        let params = load_params(Some(&path)).unwrap();
        let config = build_config(params, &Overrides::default()).unwrap();
        assert_eq!(config.bs_ant_num, 16);
        assert!(load_params(Some(Path::new("/nonexistent/mimo.toml"))).is_err());
    }
}
