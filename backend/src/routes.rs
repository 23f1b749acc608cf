use crate::error::{PredictError, TransportError};
use crate::pipeline::InferencePipeline;
use crate::upload::{self, UploadStore};
use crate::visualization::{PanelRenderer, encode_data_uri};
use crate::{preprocess, response};
use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::middleware::DefaultHeaders;
use actix_web::{HttpResponse, web};
use lesion_shared::{LesionClass, PatientMetadata, PredictResponse};
use log::{error, info, warn};
use serde_json::json;
use std::path::Path;

pub const ALLOWED_HEADERS: &str = "Content-Type,Authorization";
pub const ALLOWED_METHODS: &str = "GET,POST,PUT,DELETE,OPTIONS";

/// Everything a request needs. Built once in `main` and shared through `web::Data`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: InferencePipeline,
    pub renderer: PanelRenderer,
    pub uploads: UploadStore,
    pub image_size: u32,
    pub max_upload_bytes: usize,
    pub redact_internal_errors: bool,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/predict")
            .route(web::post().to(predict))
            .route(web::method(actix_web::http::Method::OPTIONS).to(preflight)),
    )
    .service(web::resource("/health").route(web::get().to(health)));
}

pub fn cors(allowed_origin: &str) -> Cors {
    Cors::default()
        .allowed_origin(allowed_origin)
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
        .disable_preflight()
        .max_age(3600)
}

/// Cross-origin headers attached to every response, with or without an `Origin` header.
pub fn cors_headers(allowed_origin: &str) -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, allowed_origin.to_string()))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS))
}

async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "labels": LesionClass::labels(),
    }))
}

async fn predict(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, TransportError> {
    match run_prediction(&state, payload).await {
        Ok(prediction) => {
            info!("Prediction complete: {}", prediction.final_output);
            Ok(HttpResponse::Ok().json(prediction))
        }
        Err(e) => {
            if e.is_client_error() {
                warn!("Rejected prediction request: {}", e);
            } else {
                error!("Prediction failed: {}", e);
            }
            Err(if state.redact_internal_errors {
                e.redacted()
            } else {
                e.into_transport()
            })
        }
    }
}

async fn run_prediction(
    state: &web::Data<AppState>,
    payload: Multipart,
) -> Result<PredictResponse, PredictError> {
    let form = upload::read_form(payload, state.max_upload_bytes).await?;
    let image = form.image.ok_or(PredictError::MissingInput)?;
    let uploaded = state.uploads.persist(&image).await?;
    info!(
        "Received {} ({} bytes) as {}",
        uploaded.original_filename.as_deref().unwrap_or("<unnamed>"),
        uploaded.size,
        uploaded.path.display()
    );

    let worker_state = state.clone();
    let path = uploaded.path.clone();
    let metadata = form.metadata;
    let result = web::block(move || infer(&worker_state, &path, &metadata)).await;
    state.uploads.release(&uploaded).await;

    result.map_err(|e| PredictError::Internal(e.to_string()))?
}

fn infer(
    state: &AppState,
    path: &Path,
    metadata: &PatientMetadata,
) -> Result<PredictResponse, PredictError> {
    let image = preprocess::load(path, state.image_size)?;
    let outcome = state.pipeline.run(&image, metadata)?;
    let canvas = state.renderer.render(&image, &outcome);
    let plot_image =
        encode_data_uri(&canvas).map_err(|e| PredictError::Visualization(e.to_string()))?;
    Ok(response::assemble(&outcome, plot_image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisualizationSettings;
    use crate::error::REDACTED_MESSAGE;
    use crate::models::stub::{
        FailingClassifier, FixedMask, FixedPrediction, FixedProbabilities, PROBABILITIES,
    };
    use crate::models::tabular::TabularModel;
    use crate::models::{MetadataPrediction, ModelStore};
    use crate::visualization::DATA_URI_PREFIX;
    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use image::{ImageFormat, Rgb, RgbImage};
    use lesion_shared::ErrorResponse;
    use std::io::Cursor;
    use std::sync::Arc;

    const ORIGIN: &str = "https://skin-lesion-classifier.vercel.app";
    const BOUNDARY: &str = "lesion-test-boundary";

    struct Part<'a> {
        name: &'a str,
        filename: Option<&'a str>,
        data: Vec<u8>,
    }

    fn text(name: &'static str, value: &str) -> Part<'static> {
        Part {
            name,
            filename: None,
            data: value.as_bytes().to_vec(),
        }
    }

    fn image_part(data: Vec<u8>) -> Part<'static> {
        Part {
            name: "image",
            filename: Some("lesion.png"),
            data,
        }
    }

    fn metadata_parts() -> Vec<Part<'static>> {
        vec![
            text("dx_type", "histo"),
            text("age", "45"),
            text("sex", "male"),
            text("localization", "back"),
        ]
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        part.name
                    )
                    .as_bytes(),
                ),
            }
            body.extend_from_slice(&part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn predict_request(parts: &[Part<'_>]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/predict")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(parts))
    }

    fn synthetic_png() -> Vec<u8> {
        let image =
            RgbImage::from_fn(224, 224, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 120]));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn state_with(models: ModelStore, upload_dir: &Path, keep_uploads: bool) -> AppState {
        AppState {
            pipeline: InferencePipeline::new(models, 0.5),
            renderer: PanelRenderer::with_font(
                &VisualizationSettings {
                    panel_size: 32,
                    ..VisualizationSettings::default()
                },
                None,
            ),
            uploads: UploadStore::new(upload_dir, keep_uploads),
            image_size: 224,
            max_upload_bytes: 1024 * 1024,
            redact_internal_errors: false,
        }
    }

    fn stub_state(prediction: MetadataPrediction, upload_dir: &Path) -> AppState {
        state_with(crate::models::stub::store(prediction), upload_dir, true)
    }

    macro_rules! service {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .wrap(cors_headers(ORIGIN))
                    .wrap(cors(ORIGIN))
                    .app_data(web::Data::new($state))
                    .configure(configure_routes),
            )
            .await
        };
    }

    fn assert_cors_headers(headers: &header::HeaderMap) {
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), ORIGIN);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(), ALLOWED_HEADERS);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(), ALLOWED_METHODS);
    }

    #[actix_web::test]
    async fn missing_image_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let resp = test::call_service(&app, predict_request(&metadata_parts()).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_cors_headers(resp.headers());
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "No image provided");
    }

    #[actix_web::test]
    async fn non_multipart_body_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload(r#"{"image": "nope"}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body.get("error").is_some());
    }

    #[actix_web::test]
    async fn preflight_returns_empty_success_with_cors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let req = test::TestRequest::default()
            .method(actix_web::http::Method::OPTIONS)
            .uri("/predict")
            .set_payload("ignored body")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors_headers(resp.headers());
        assert!(test::read_body(resp).await.is_empty());
    }

    #[actix_web::test]
    async fn other_origins_still_see_only_the_configured_origin() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let req = predict_request(&metadata_parts())
            .insert_header((header::ORIGIN, "https://other.example"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_cors_headers(resp.headers());
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "No image provided");
    }

    #[actix_web::test]
    async fn end_to_end_prediction_with_stub_models() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let mut parts = vec![image_part(synthetic_png())];
        parts.extend(metadata_parts());
        let resp = test::call_service(
            &app,
            predict_request(&parts)
                .insert_header((header::ORIGIN, ORIGIN))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors_headers(resp.headers());

        let body: PredictResponse = test::read_body_json(resp).await;
        assert_eq!(body.cnn_output, "Predicted Class: nv (Confidence: 0.60)");
        assert_eq!(body.final_output, "This disease is most probably classified as: nv");
        assert_eq!(body.nlp_output, "NLP Prediction: 0.2");
        assert_eq!(body.segmentation_output, "U-Net Segmentation Applied");
        assert!(body.plot_image.starts_with(DATA_URI_PREFIX));

        let entries: Vec<&str> = body.all_class_probabilities.split(", ").collect();
        assert_eq!(entries.len(), 7);
        let total: f32 = entries
            .iter()
            .map(|entry| entry.rsplit(": ").next().unwrap().parse::<f32>().unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-3);
    }

    #[actix_web::test]
    async fn numeric_class_label_is_reported_as_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = TabularModel::from_json(
            r#"{"intercept": [0.0, 1.0], "classes": ["0", "1"]}"#,
        )
        .unwrap();
        let models = ModelStore::new(
            Arc::new(FixedMask { value: 1.0 }),
            Arc::new(FixedProbabilities(PROBABILITIES.to_vec())),
            Arc::new(metadata),
        );
        let app = service!(state_with(models, dir.path(), true));

        let mut parts = vec![image_part(synthetic_png())];
        parts.extend(metadata_parts());
        let resp = test::call_service(&app, predict_request(&parts).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: PredictResponse = test::read_body_json(resp).await;
        assert_eq!(body.nlp_output, "NLP Prediction: 1");
        assert_eq!(body.final_output, "This disease is most probably classified as: nv");
    }

    #[actix_web::test]
    async fn identical_requests_give_identical_labels() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let mut parts = vec![image_part(synthetic_png())];
            parts.extend(metadata_parts());
            let resp = test::call_service(&app, predict_request(&parts).to_request()).await;
            let body: PredictResponse = test::read_body_json(resp).await;
            outputs.push((body.cnn_output, body.final_output));
        }
        assert_eq!(outputs[0], outputs[1]);
        // Each request got its own upload file.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[actix_web::test]
    async fn categorical_metadata_prediction_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(
            MetadataPrediction::Label("Melanocytic nevi".into()),
            dir.path()
        ));

        let resp = test::call_service(
            &app,
            predict_request(&[image_part(synthetic_png())]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: PredictResponse = test::read_body_json(resp).await;
        assert_eq!(
            body.final_output,
            "This disease is most probably classified as: Melanocytic nevi"
        );
    }

    #[actix_web::test]
    async fn undecodable_image_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let resp = test::call_service(
            &app,
            predict_request(&[image_part(b"not a picture".to_vec())]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(body.error.starts_with("Could not read image from path:"));
    }

    #[actix_web::test]
    async fn model_failure_is_internal_error_and_can_be_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let models = ModelStore::new(
            Arc::new(FixedMask { value: 1.0 }),
            Arc::new(FailingClassifier),
            Arc::new(FixedPrediction(MetadataPrediction::numeric(0.2))),
        );

        let exposed = service!(state_with(models.clone(), dir.path(), true));
        let resp = test::call_service(
            &exposed,
            predict_request(&[image_part(synthetic_png())]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "Model inference failed: classifier unavailable");

        let redacted = service!(AppState {
            redact_internal_errors: true,
            ..state_with(models, dir.path(), true)
        });
        let resp = test::call_service(
            &redacted,
            predict_request(&[image_part(synthetic_png())]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, REDACTED_MESSAGE);
    }

    #[actix_web::test]
    async fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(AppState {
            max_upload_bytes: 16,
            ..stub_state(MetadataPrediction::numeric(0.2), dir.path())
        });

        let resp = test::call_service(
            &app,
            predict_request(&[image_part(synthetic_png())]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[actix_web::test]
    async fn uploads_are_removed_when_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(state_with(
            crate::models::stub::store(MetadataPrediction::numeric(0.2)),
            dir.path(),
            false
        ));

        let resp = test::call_service(
            &app,
            predict_request(&[image_part(synthetic_png())]).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[actix_web::test]
    async fn health_lists_labels() {
        let dir = tempfile::tempdir().unwrap();
        let app = service!(stub_state(MetadataPrediction::numeric(0.2), dir.path()));

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["labels"].as_array().unwrap().len(), 7);
    }
}
