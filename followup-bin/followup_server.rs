use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use followup_inference::{
    models::{candle::followup_llama::FollowUpModel, config::ModelConfig},
    service::ModelService,
};
use followup_service::{
    config::FollowUpServiceConfig,
    server::{run_server, AppState},
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::{
    non_blocking,
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
    EnvFilter, Registry,
};

/// The directory where the logs are stored.
const LOGS: &str = "./logs";
/// The log file name.
const LOG_FILE: &str = "followup-server.log";

/// Command line arguments for the follow-up server
#[derive(Parser)]
#[command(version, about = "Generates follow-up questions for question and answer pairs")]
struct Args {
    /// Path to the configuration file. Defaults and environment variables are
    /// used when omitted.
    #[arg(short, long)]
    config_path: Option<String>,
}

/// Configuration of the model and of the HTTP service, read from the same
/// file.
#[derive(Debug)]
struct Config {
    inference: ModelConfig,
    service: FollowUpServiceConfig,
}

impl Config {
    fn load(config_path: Option<&str>) -> Result<Self> {
        let (inference, service) = match config_path {
            Some(path) => (
                ModelConfig::from_file_path(path),
                FollowUpServiceConfig::from_file_path(path),
            ),
            None => (ModelConfig::from_env(), FollowUpServiceConfig::from_env()),
        };
        Ok(Self {
            inference: inference.context("Failed to load model configuration")?,
            service: service.context("Failed to load service configuration")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _guard = setup_logging(LOGS).context("Failed to setup logging")?;

    let args = Args::parse();
    let config = Config::load(args.config_path.as_deref())?;

    info!(
        target = "followup-server",
        event = "model_service_start",
        base_model = %config.inference.base_model,
        adapter_model = %config.inference.adapter_model,
        quantization = %config.inference.quantization,
        "Loading model, this can take a while on the first run"
    );
    if config.inference.api_key.is_none() {
        info!(
            target = "followup-server",
            event = "missing_api_key",
            "No Hugging Face token configured, gated repositories will fail to download"
        );
    }

    // the listener is only bound once the model is loaded
    let model_config = config.inference.clone();
    let model_service =
        tokio::task::spawn_blocking(move || ModelService::start::<FollowUpModel>(model_config))
            .await
            .context("Model service startup task panicked")?
            .map_err(|e| {
                error!(
                    target = "followup-server",
                    event = "model_service_start_failed",
                    error = %e,
                    "Failed to start model service"
                );
                e
            })
            .context("Failed to start model service")?;

    let app_state = AppState {
        dispatcher: model_service.dispatcher(),
        generation_params: config.service.generation.clone(),
        model_id: model_service.model_id().to_string(),
    };

    let tcp_listener = TcpListener::bind(&config.service.service_bind_address)
        .await
        .context("Failed to bind TCP listener")?;

    info!(
        target = "followup-server",
        event = "followup_server_spawn",
        bind_address = %config.service.service_bind_address,
        model_id = model_service.model_id(),
        "Starting follow-up server"
    );

    let server_result = run_server(app_state, tcp_listener).await;
    if let Err(e) = &server_result {
        error!(
            target = "followup-server",
            event = "followup_server_shutdown",
            error = ?e,
            "Server terminated abruptly"
        );
    }

    tokio::task::spawn_blocking(move || model_service.stop())
        .await
        .context("Model service shutdown task panicked")?;
    server_result?;

    info!(
        target = "followup-server",
        event = "followup_server_shutdown",
        "Follow-up server shut down successfully"
    );
    Ok(())
}

/// Configure logging with JSON formatting, file output, and console output.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for the lifetime of the process.
fn setup_logging<P: AsRef<Path>>(log_dir: P) -> Result<WorkerGuard> {
    // Set up file appender with rotation
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_appender);

    let console_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::ENTER);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,followup_server=debug"));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
