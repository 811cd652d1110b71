use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::inference::{InferenceOpenApi, INFERENCE_PATH};
use crate::server::{HealthOpenApi, HEALTH_PATH};

/// Path the Swagger UI is served under
pub const DOCS_PATH: &str = "/docs";
/// Path of the generated OpenAPI document
pub const OPENAPI_JSON_PATH: &str = "/api-docs/openapi.json";

#[derive(OpenApi)]
#[openapi(
    nest(
        (path = HEALTH_PATH, api = HealthOpenApi),
        (path = INFERENCE_PATH, api = InferenceOpenApi),
    ),
    tags(
        (name = "health", description = "Health check"),
        (name = "inference", description = "Follow-up question generation"),
    ),
    servers(
        (url = "http://localhost:8000"),
    )
)]
pub(crate) struct ApiDoc;

pub fn openapi_routes() -> Router {
    Router::new().merge(SwaggerUi::new(DOCS_PATH).url(OPENAPI_JSON_PATH, ApiDoc::openapi()))
}
