mod config;
mod error;
mod models;
mod pipeline;
mod preprocess;
mod response;
mod routes;
mod upload;
mod visualization;

use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use config::AppConfig;
use models::ModelStore;
use pipeline::InferencePipeline;
use routes::{AppState, configure_routes, cors, cors_headers};
use std::env;
use upload::UploadStore;
use visualization::PanelRenderer;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let models = ModelStore::load(&config.models, config.image_size).map_err(|e| {
        log::error!("Failed to load models at startup: {}", e);
        std::io::Error::other(format!("Model loading failed: {}", e))
    })?;

    let uploads = UploadStore::new(&config.upload_dir, config.keep_uploads);
    std::fs::create_dir_all(uploads.dir())?;
    log::info!(
        "Uploads stored in {} (kept: {})",
        uploads.dir().display(),
        config.keep_uploads
    );

    let state = AppState {
        pipeline: InferencePipeline::new(models, config.mask_threshold),
        renderer: PanelRenderer::new(&config.visualization),
        uploads,
        image_size: config.image_size,
        max_upload_bytes: config.max_upload_bytes,
        redact_internal_errors: config.redact_internal_errors,
    };

    let bind_address = config.bind_address();
    let allowed_origin = config.allowed_origin.clone();
    log::info!("Allowing cross-origin requests from {}", allowed_origin);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(cors_headers(&allowed_origin))
            .wrap(cors(&allowed_origin))
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
