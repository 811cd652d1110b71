use std::time::Instant;

use thiserror::Error;
use tracing::info;

use crate::{
    model_thread::{spawn_model_thread, ModelThreadDispatcher, ModelThreadError, ModelThreadHandle},
    models::{
        config::ModelConfig,
        types::{TextModelInput, TextModelOutput},
        ModelId, ModelTrait,
    },
};

/// Owns the model thread for the lifetime of the server
pub struct ModelService {
    model_thread_handle: ModelThreadHandle,
    dispatcher: ModelThreadDispatcher,
    model_id: ModelId,
    start_time: Instant,
}

impl ModelService {
    /// Starts the model thread and blocks until the model is fetched and
    /// loaded, which can take several minutes on a cold cache.
    pub fn start<M>(config: ModelConfig) -> Result<Self, ModelServiceError>
    where
        M: ModelTrait<Input = TextModelInput, Output = TextModelOutput> + 'static,
    {
        info!(
            target: "followup-inference",
            model_id = %config.model_id(),
            "Starting model service ..."
        );
        let start = Instant::now();
        let (dispatcher, model_thread_handle, model_id) =
            spawn_model_thread::<M>(config).map_err(ModelServiceError::ModelThreadError)?;
        info!(
            target: "followup-inference",
            model_id = %model_id,
            "Model service started in {:?}",
            start.elapsed()
        );

        Ok(Self {
            model_thread_handle,
            dispatcher,
            model_id,
            start_time: Instant::now(),
        })
    }

    pub fn dispatcher(&self) -> ModelThreadDispatcher {
        self.dispatcher.clone()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn stop(self) {
        info!(
            target: "followup-inference",
            "Stopping model service, running time: {:?}",
            self.start_time.elapsed()
        );
        drop(self.dispatcher);
        self.model_thread_handle.stop();
    }
}

#[derive(Debug, Error)]
pub enum ModelServiceError {
    #[error("Model thread error: `{0}`")]
    ModelThreadError(ModelThreadError),
}
