use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::mpsc,
};

use thiserror::Error;
use tokio::sync::oneshot::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::models::{
    config::ModelConfig,
    types::{TextModelInput, TextModelOutput},
    ModelError, ModelId, ModelTrait,
};

/// A generation request, together with the channel its result is sent back on
pub struct ModelThreadCommand(
    pub TextModelInput,
    pub oneshot::Sender<Result<TextModelOutput, ModelError>>,
);

#[derive(Debug, Error)]
pub enum ModelThreadError {
    #[error("Model error: `{0}`")]
    ModelError(ModelError),
    #[error("Failed to spawn model thread: `{0}`")]
    SpawnError(std::io::Error),
    #[error("Model thread exited before the model was ready")]
    StartupAborted,
    #[error("Model thread is shut down")]
    Shutdown,
    #[error("Model thread dropped the request: `{0}`")]
    ResponseDropped(RecvError),
}

impl From<ModelError> for ModelThreadError {
    fn from(error: ModelError) -> Self {
        Self::ModelError(error)
    }
}

pub struct ModelThreadHandle {
    sender: mpsc::Sender<ModelThreadCommand>,
    join_handle: std::thread::JoinHandle<()>,
}

impl ModelThreadHandle {
    /// Drops this handle's sender and waits for the model thread to finish.
    /// The thread exits once every dispatcher clone is dropped as well.
    pub fn stop(self) {
        drop(self.sender);
        if self.join_handle.join().is_err() {
            error!(target: "followup-inference", "Model thread panicked");
        }
    }
}

pub struct ModelThread<M: ModelTrait> {
    model: M,
    receiver: mpsc::Receiver<ModelThreadCommand>,
}

impl<M> ModelThread<M>
where
    M: ModelTrait<Input = TextModelInput, Output = TextModelOutput>,
{
    /// Serves commands one at a time until every sender is dropped. A failed
    /// or panicking generation is replied to its caller and does not stop the
    /// thread.
    pub fn run(mut self) {
        debug!(target: "followup-inference", "Start model thread");

        while let Ok(ModelThreadCommand(input, sender)) = self.receiver.recv() {
            // models reset their generation state at the start of every run
            let output = panic::catch_unwind(AssertUnwindSafe(|| self.model.run(input)))
                .unwrap_or_else(|payload| {
                    Err(ModelError::Msg(format!(
                        "model panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            if let Err(e) = &output {
                error!(target: "followup-inference", error = %e, "Failed to run inference");
            }
            if sender.send(output).is_err() {
                warn!(
                    target: "followup-inference",
                    "Inference caller went away before the result was ready"
                );
            }
        }

        debug!(target: "followup-inference", "Model thread channel closed, exiting");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Cloneable handle used to submit requests to the model thread
#[derive(Clone)]
pub struct ModelThreadDispatcher {
    sender: mpsc::Sender<ModelThreadCommand>,
}

impl ModelThreadDispatcher {
    /// Queues `input` on the model thread and waits for its output
    pub async fn run_inference(
        &self,
        input: TextModelInput,
    ) -> Result<TextModelOutput, ModelThreadError> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(ModelThreadCommand(input, sender))
            .map_err(|_| ModelThreadError::Shutdown)?;
        let output = receiver.await.map_err(ModelThreadError::ResponseDropped)?;
        Ok(output?)
    }
}

/// Spawns the model thread, which fetches and loads `M` before serving
/// commands. Blocks until the model is loaded, returning its id, or until
/// loading failed.
pub fn spawn_model_thread<M>(
    config: ModelConfig,
) -> Result<(ModelThreadDispatcher, ModelThreadHandle, ModelId), ModelThreadError>
where
    M: ModelTrait<Input = TextModelInput, Output = TextModelOutput> + 'static,
{
    let (sender, receiver) = mpsc::channel::<ModelThreadCommand>();
    let (ready_sender, ready_receiver) = mpsc::channel::<Result<ModelId, ModelError>>();

    let join_handle = std::thread::Builder::new()
        .name("model-thread".to_string())
        .spawn(move || {
            let api_key = config.api_key();
            let cache_dir = config.cache_dir();
            let model = match M::fetch(api_key, cache_dir, config).and_then(M::load) {
                Ok(model) => model,
                Err(e) => {
                    ready_sender.send(Err(e)).ok();
                    return;
                }
            };
            ready_sender.send(Ok(model.model_id())).ok();

            let model_thread = ModelThread { model, receiver };
            model_thread.run();
        })
        .map_err(ModelThreadError::SpawnError)?;

    let model_id = match ready_receiver.recv() {
        Ok(Ok(model_id)) => model_id,
        Ok(Err(e)) => {
            error!(target: "followup-inference", error = %e, "Failed to load model");
            join_handle.join().ok();
            return Err(ModelThreadError::ModelError(e));
        }
        Err(_) => {
            join_handle.join().ok();
            return Err(ModelThreadError::StartupAborted);
        }
    };
    info!(target: "followup-inference", model_id = %model_id, "Model thread ready");

    let dispatcher = ModelThreadDispatcher {
        sender: sender.clone(),
    };
    let handle = ModelThreadHandle {
        sender,
        join_handle,
    };
    Ok((dispatcher, handle, model_id))
}
