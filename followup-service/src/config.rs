use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use followup_inference::models::types::GenerationParams;
use serde::Deserialize;

/// Configuration for the follow-up service.
///
/// Read from the `followup_service` section of the configuration file, each
/// value can be overridden with a `FOLLOWUP_SERVICE__<FIELD>` environment
/// variable (nested values use `__` as separator, e.g.
/// `FOLLOWUP_SERVICE__GENERATION__TEMPERATURE`).
#[derive(Clone, Debug, Deserialize)]
pub struct FollowUpServiceConfig {
    /// Bind address for the HTTP server.
    #[serde(default = "default_service_bind_address")]
    pub service_bind_address: String,

    /// Sampling configuration used for every request.
    #[serde(default)]
    pub generation: GenerationParams,
}

fn default_service_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for FollowUpServiceConfig {
    fn default() -> Self {
        Self {
            service_bind_address: default_service_bind_address(),
            generation: GenerationParams::default(),
        }
    }
}

impl FollowUpServiceConfig {
    /// Creates a new `FollowUpServiceConfig` from a configuration file. A
    /// missing `followup_service` section yields the defaults.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(config_file_path.as_ref()))
            .add_source(environment());
        Self::from_builder(builder)
    }

    /// Defaults with environment overrides, used when no configuration file
    /// is given
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_builder(Config::builder().add_source(environment()))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        match builder.build()?.get::<Self>("followup_service") {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("FOLLOWUP_SERVICE")
        .keep_prefix(true)
        .separator("__")
        .try_parsing(true)
}
