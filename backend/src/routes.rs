use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use futures::TryStreamExt;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use shared::{ErrorResponse, HealthResponse};
use std::time::Instant;
use uuid::Uuid;

use crate::inference::{PredictError, PredictionService, CLASS_LABELS};

pub const IMAGE_FIELD: &str = "image";
pub const HEALTH_MESSAGE: &str = "Chest X-Ray Classification API running";

/// Upload limits enforced while the multipart body is streamed in.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_bytes: usize,
}

impl ResponseError for PredictError {
    fn status_code(&self) -> StatusCode {
        match self {
            PredictError::MissingImage
            | PredictError::InvalidFilename
            | PredictError::EmptyImage
            | PredictError::Upload(_)
            | PredictError::Decode(_) => StatusCode::BAD_REQUEST,
            PredictError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PredictError::ModelUnavailable
            | PredictError::Inference(_)
            | PredictError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.client_message(),
        })
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(health)))
        .service(web::resource("/api").route(web::get().to(health)))
        .service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/api/predict").route(web::post().to(predict)));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        message: HEALTH_MESSAGE.to_string(),
        classes: CLASS_LABELS.to_vec(),
    })
}

struct ImageUpload {
    filename: String,
    data: Vec<u8>,
}

async fn predict(
    service: web::Data<PredictionService>,
    limits: web::Data<UploadLimits>,
    payload: Multipart,
) -> Result<HttpResponse, PredictError> {
    let request_id = Uuid::new_v4();

    if !service.is_ready() {
        warn!(
            "[{}] Rejecting prediction, model is not loaded: {}",
            request_id,
            service.unavailable_reason().unwrap_or("unknown")
        );
        return Err(PredictError::ModelUnavailable);
    }

    let upload = read_image_field(payload, limits.max_bytes)
        .await
        .inspect_err(|e| warn!("[{}] Rejected upload: {}", request_id, e))?;

    info!(
        "[{}] Received {} ({} bytes, sha256 {})",
        request_id,
        upload.filename,
        upload.data.len(),
        hex::encode(Sha256::digest(&upload.data))
    );

    let started = Instant::now();
    let service = service.into_inner();
    let outcome = web::block(move || service.predict(&upload.data))
        .await
        .map_err(|e| PredictError::Internal(e.to_string()))
        .and_then(|result| result);

    match outcome {
        Ok(prediction) => {
            info!(
                "[{}] Predicted {} in {:.1?}",
                request_id,
                prediction.predicted_class,
                started.elapsed()
            );
            Ok(HttpResponse::Ok().json(prediction))
        }
        Err(e) if e.is_client_error() => {
            warn!("[{}] Prediction rejected: {}", request_id, e);
            Err(e)
        }
        Err(e) => {
            error!("[{}] Prediction failed: {:?}", request_id, e);
            Err(e)
        }
    }
}

/// Takes the first `image` file part and drains everything else.
async fn read_image_field(
    mut payload: Multipart,
    max_bytes: usize,
) -> Result<ImageUpload, PredictError> {
    let mut upload: Option<ImageUpload> = None;

    while let Some(mut field) = payload.try_next().await.map_err(upload_error)? {
        // Only parts that carry a filename count as the uploaded file.
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let filename = match filename {
            Some(name) if upload.is_none() && field.name() == Some(IMAGE_FIELD) => name,
            _ => {
                while field.try_next().await.map_err(upload_error)?.is_some() {}
                continue;
            }
        };
        if filename.trim().is_empty() {
            return Err(PredictError::InvalidFilename);
        }

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(upload_error)? {
            if data.len() + chunk.len() > max_bytes {
                return Err(PredictError::TooLarge { limit: max_bytes });
            }
            data.extend_from_slice(&chunk);
        }
        upload = Some(ImageUpload { filename, data });
    }

    let upload = upload.ok_or(PredictError::MissingImage)?;
    if upload.data.is_empty() {
        return Err(PredictError::EmptyImage);
    }
    Ok(upload)
}

fn upload_error(err: actix_multipart::MultipartError) -> PredictError {
    PredictError::Upload(err.to_string())
}
