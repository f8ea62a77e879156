mod config;
mod inference;
mod routes;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use config::AppConfig;
use inference::{PredictionService, Preprocessor};
use routes::{configure_routes, UploadLimits};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::other(e)
    })?;

    let device = config.device.resolve();
    let preprocessor = Preprocessor::new(config.color_mode);
    log::info!(
        "Loading model from {} on {:?} (color mode {})",
        config.model_path.display(),
        device,
        preprocessor.color_mode()
    );

    let service = web::Data::new(PredictionService::load(
        preprocessor,
        &config.model_path,
        device,
    ));
    let limits = web::Data::new(UploadLimits {
        max_bytes: config.max_upload_bytes,
    });
    let allowed_origin = config.allowed_origin.clone();
    let bind_address = config.bind_address();

    log::info!("Starting server on {}", bind_address);

    let mut server = HttpServer::new(move || {
        let cors = match &allowed_origin {
            Some(origin) => Cors::default().allowed_origin(origin),
            None => Cors::default().allow_any_origin(),
        };
        App::new()
            .wrap(
                cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .app_data(service.clone())
            .app_data(limits.clone())
            .configure(configure_routes)
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }

    server.bind(&bind_address)?.run().await
}
