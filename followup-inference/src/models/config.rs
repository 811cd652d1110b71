use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::models::types::QuantizationType;

/// Environment variable holding the Hugging Face access token
pub const HUGGINGFACE_API_KEY: &str = "HUGGINGFACE_API_KEY";

/// Name of the configuration file section read by [`ModelConfig::from_file_path`]
const CONFIG_SECTION: &str = "followup_inference";
/// Prefix of the environment variables overriding configuration values
const ENV_PREFIX: &str = "FOLLOWUP_INFERENCE";

/// `ModelConfig` - Model configuration values
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Hugging Face api key, falls back to the `HUGGINGFACE_API_KEY`
    /// environment variable when absent
    #[serde(default)]
    pub api_key: Option<String>,
    /// Cache directory, where model data is stored
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// The base model's name, according to HuggingFace's model hub
    #[serde(default = "default_base_model")]
    pub base_model: String,
    /// The base model's revision
    #[serde(default = "default_revision")]
    pub base_revision: String,
    /// The LoRA adapter repository, in PEFT format
    #[serde(default = "default_adapter_model")]
    pub adapter_model: String,
    /// The adapter's revision
    #[serde(default = "default_revision")]
    pub adapter_revision: String,
    /// Repository providing `tokenizer.json`, defaults to the adapter repository
    #[serde(default)]
    pub tokenizer_model: Option<String>,
    /// The GPU device ordinal, ignored when running on CPU
    #[serde(default)]
    pub device_id: usize,
    /// Block quantization applied to the linear layers at load time
    #[serde(default)]
    pub quantization: QuantizationType,
    /// Upper bound on prompt plus generated tokens
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_base_model() -> String {
    "meta-llama/Meta-Llama-3.1-8B".to_string()
}

fn default_adapter_model() -> String {
    "Pragades/LlaMa_Layers".to_string()
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_max_sequence_length() -> usize {
    4096
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            cache_dir: default_cache_dir(),
            base_model: default_base_model(),
            base_revision: default_revision(),
            adapter_model: default_adapter_model(),
            adapter_revision: default_revision(),
            tokenizer_model: None,
            device_id: 0,
            quantization: QuantizationType::default(),
            max_sequence_length: default_max_sequence_length(),
        }
    }
}

impl ModelConfig {
    /// Creates a new instance of `ModelConfig` from a file path, containing the
    /// contents of a configuration file with a `[followup_inference]` section.
    ///
    /// Values can be overridden with `FOLLOWUP_INFERENCE__<FIELD>` environment
    /// variables. A missing section yields the defaults.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(config_file_path.as_ref()))
            .add_source(environment());
        Self::from_builder(builder)
    }

    /// Builds the configuration from defaults and environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_builder(Config::builder().add_source(environment()))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config = builder.build()?;
        let mut model_config = match config.get::<Self>(CONFIG_SECTION) {
            Ok(model_config) => model_config,
            Err(ConfigError::NotFound(_)) => Self::default(),
            Err(e) => return Err(e),
        };
        if model_config.api_key.is_none() {
            model_config.api_key = std::env::var(HUGGINGFACE_API_KEY).ok();
        }
        Ok(model_config)
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key.clone()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// The repository the tokenizer files are fetched from
    pub fn tokenizer_model(&self) -> String {
        self.tokenizer_model
            .clone()
            .unwrap_or_else(|| self.adapter_model.clone())
    }

    /// Identifier reported for the loaded model, `base+adapter`
    pub fn model_id(&self) -> String {
        format!("{}+{}", self.base_model, self.adapter_model)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .keep_prefix(true)
        .separator("__")
        .try_parsing(true)
}
