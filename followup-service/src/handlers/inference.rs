use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use followup_inference::{model_thread::ModelThreadError, models::types::TextModelInput};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use utoipa::{OpenApi, ToSchema};

use crate::{
    error::{ErrorResponse, FollowUpServiceError},
    prompt::{build_prompt, extract_follow_up},
    server::AppState,
};

pub const INFERENCE_PATH: &str = "/inference";

#[derive(OpenApi)]
#[openapi(
    paths(inference_handler),
    components(schemas(InferenceRequest, InferenceResponse, ErrorResponse))
)]
pub(crate) struct InferenceOpenApi;

/// A question and the answer it received
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct InferenceRequest {
    #[schema(example = "What is the capital of France?")]
    pub question: String,
    #[schema(example = "Paris.")]
    pub answer: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct InferenceResponse {
    #[serde(rename = "followUpQuestion")]
    #[schema(example = "What is the population of Paris?")]
    pub follow_up_question: String,
}

/// Generates a follow-up question for a question and answer pair.
///
/// The prompt is queued on the model thread and the handler waits for the
/// generation to finish, so requests are served one at a time by the model.
///
/// # Errors
///
/// * `400` if the body is not a JSON object with string `question` and
///   `answer` fields
/// * `500` if generation fails or the model thread is gone
#[utoipa::path(
    post,
    path = "",
    tag = "inference",
    request_body = InferenceRequest,
    responses(
        (status = OK, description = "Follow-up question generated", body = InferenceResponse),
        (status = BAD_REQUEST, description = "Invalid request body", body = ErrorResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Generation failed", body = ErrorResponse)
    )
)]
#[instrument(level = "info", skip_all, fields(path = INFERENCE_PATH))]
pub async fn inference_handler(
    State(state): State<AppState>,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>, FollowUpServiceError> {
    let Json(request) = payload.map_err(|e| FollowUpServiceError::InvalidBody {
        message: e.body_text(),
        endpoint: INFERENCE_PATH.to_string(),
    })?;
    info!(
        target: "followup-service",
        question_len = request.question.len(),
        answer_len = request.answer.len(),
        "Received inference request"
    );

    let prompt = build_prompt(&request.question, &request.answer);
    let input = TextModelInput {
        prompt: prompt.clone(),
        params: state.generation_params.clone(),
    };
    let output = state
        .dispatcher
        .run_inference(input)
        .await
        .map_err(|e| match e {
            ModelThreadError::ModelError(e) => FollowUpServiceError::ModelError {
                model_error: e.to_string(),
                endpoint: INFERENCE_PATH.to_string(),
            },
            e => FollowUpServiceError::InternalError {
                message: e.to_string(),
                endpoint: INFERENCE_PATH.to_string(),
            },
        })?;

    let follow_up_question = extract_follow_up(&output.generated_text, &prompt);
    debug!(
        target: "followup-service",
        model_id = %state.model_id,
        prompt_tokens = output.prompt_tokens,
        generated_tokens = output.generated_tokens,
        time = output.time,
        follow_up_question = %follow_up_question,
        "Generated follow-up question"
    );

    Ok(Json(InferenceResponse { follow_up_question }))
}
