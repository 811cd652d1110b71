use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use followup_inference::{model_thread::ModelThreadDispatcher, models::types::GenerationParams};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use utoipa::OpenApi;

use crate::{
    components::openapi::openapi_routes,
    handlers::inference::{inference_handler, INFERENCE_PATH},
};

pub const HEALTH_PATH: &str = "/health";

#[derive(OpenApi)]
#[openapi(paths(health))]
pub(crate) struct HealthOpenApi;

/// Represents the shared state of the application.
///
/// The model itself lives on the model thread; handlers only hold a
/// dispatcher to queue generation requests on it.
#[derive(Clone)]
pub struct AppState {
    /// Sender side of the model thread queue.
    pub dispatcher: ModelThreadDispatcher,

    /// Sampling configuration applied to every request.
    pub generation_params: GenerationParams,

    /// Identifier of the loaded model, `base+adapter`.
    pub model_id: String,
}

/// Creates the router serving the inference and health endpoints, along with
/// the Swagger UI, behind a CORS layer allowing any origin, method and header.
pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(INFERENCE_PATH, post(inference_handler))
        .route(HEALTH_PATH, get(health))
        .with_state(app_state)
        .merge(openapi_routes())
        .layer(ServiceBuilder::new().layer(cors).into_inner())
}

/// Starts and runs the HTTP server until Ctrl+C is received, then lets
/// in-flight requests finish before returning.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn run_server(app_state: AppState, tcp_listener: TcpListener) -> anyhow::Result<()> {
    let app = create_router(app_state);
    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(
                target: "followup-service",
                error = %e,
                "Failed to listen for Ctrl+C signal"
            );
        }
        info!(target: "followup-service", "Shutting down server...");
    };
    let server =
        axum::serve(tcp_listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal);
    server.await?;

    Ok(())
}

/// Health check, reporting the loaded model.
///
/// The model is loaded before the listener is bound, so a reachable server
/// is always ready to generate.
#[utoipa::path(
    get,
    path = "",
    tag = "health",
    responses(
        (status = OK, description = "Service is healthy", body = Value)
    )
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "model_id": state.model_id }))
}
