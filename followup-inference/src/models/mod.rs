use std::path::PathBuf;

use ::candle::Error as CandleError;
use thiserror::Error;

use crate::models::config::ModelConfig;

pub mod candle;
pub mod config;
pub mod types;

pub type ModelId = String;

/// A text generation model that can be fetched, loaded once and then run
/// repeatedly from the model thread.
pub trait ModelTrait {
    type Input;
    type Output;
    type LoadData;

    /// Resolves (downloading if needed) every artifact the model needs.
    fn fetch(
        api_key: Option<String>,
        cache_dir: PathBuf,
        config: ModelConfig,
    ) -> Result<Self::LoadData, ModelError>;

    /// Builds the model from the data returned by [`ModelTrait::fetch`].
    fn load(load_data: Self::LoadData) -> Result<Self, ModelError>
    where
        Self: Sized;

    fn model_id(&self) -> ModelId;

    fn run(&mut self, input: Self::Input) -> Result<Self::Output, ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Deserialize error: `{0}`")]
    DeserializeError(#[from] serde_json::Error),
    #[error("{0}")]
    Msg(String),
    #[error("Candle error: `{0}`")]
    CandleError(#[from] CandleError),
    #[error("Io error: `{0}`")]
    IoError(#[from] std::io::Error),
    #[error("Error: `{0}`")]
    BoxedError(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error("ApiError error: `{0}`")]
    ApiError(#[from] hf_hub::api::sync::ApiError),
    #[error("Missing weight: `{0}`")]
    MissingWeight(String),
    #[error("Invalid adapter: `{0}`")]
    InvalidAdapter(String),
}
