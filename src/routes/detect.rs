use crate::{error::ApiError, response::DetectionResponse, server::SharedState};
use axum::{
    extract::{Multipart, State},
    response::Json,
};
use image::DynamicImage;
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/detect";
const FILE_FIELD: &str = "file";

/// Takes the `file` field of the upload and decodes it, rejecting anything
/// that is not a non-empty image.
async fn read_image(mut multipart: Multipart) -> Result<DynamicImage, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let is_image = field
            .content_type()
            .is_some_and(|content_type| content_type.starts_with("image/"));
        if !is_image {
            return Err(ApiError::InvalidContentType);
        }

        let data = field.bytes().await?;
        if data.is_empty() {
            return Err(ApiError::EmptyFile);
        }

        return image::load_from_memory(&data).map_err(ApiError::InvalidImage);
    }

    Err(ApiError::MissingFile)
}

async fn run_detection(
    state: &SharedState,
    multipart: Multipart,
) -> Result<DetectionResponse, ApiError> {
    let image = read_image(multipart).await?;
    tracing::debug!("Decoded {}x{} image", image.width(), image.height());

    let detector = state.detector.clone();
    let started = Instant::now();
    let detections = tokio::task::spawn_blocking(move || detector.detect(&image))
        .await?
        .map_err(|e| ApiError::processing(e, state.expose_error_details))?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    state.metrics.record_detection_duration(elapsed_ms, ROUTE);
    state.metrics.record_detected_items(detections.len());
    tracing::info!("Detected {} items in {} ms", detections.len(), elapsed_ms);

    Ok(DetectionResponse::from(detections))
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    let result = run_detection(&state, multipart).await;

    let status = match &result {
        Ok(_) => 200,
        Err(err) => err.status().as_u16(),
    };
    state.metrics.record_request(ROUTE, status);

    result.map(Json)
}

#[cfg(test)]
mod tests {
    use crate::{
        detector::{BoundingBox, Detection, Detector, DetectorError},
        response::{DetectionResponse, NONE_DETECTED_MESSAGE},
        server::{build_router, SharedState},
        telemetry::Metrics,
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        Router,
    };
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::{
        io::Cursor,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tower::ServiceExt;

    const BOUNDARY: &str = "healthyeyeboundary";

    type Outcome = fn() -> Result<Vec<Detection>, DetectorError>;

    struct MockDetector {
        calls: Arc<AtomicUsize>,
        outcome: Outcome,
    }

    impl Detector for MockDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bbox: BoundingBox {
                x1: 1.,
                y1: 1.,
                x2: 4.,
                y2: 4.,
            },
        }
    }

    fn app(outcome: Outcome, expose_error_details: bool) -> (Router, Arc<AtomicUsize>) {
        app_with_limit(outcome, expose_error_details, 1024 * 1024)
    }

    fn app_with_limit(
        outcome: Outcome,
        expose_error_details: bool,
        max_upload_bytes: usize,
    ) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = SharedState {
            detector: Arc::new(MockDetector {
                calls: calls.clone(),
                outcome,
            }),
            metrics: Arc::new(Metrics::new().unwrap()),
            expose_error_details,
        };
        (build_router(state, max_upload_bytes), calls)
    }

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(8, 8, Rgb([30, 200, 40]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    fn upload(field: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"meal.png\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/detect")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_detect_returns_parallel_lists() {
        let (router, calls) = app(
            || Ok(vec![detection("apple", 0.91), detection("carrot", 0.42)]),
            false,
        );

        let (status, json) = send(router, upload("file", "image/png", &png_bytes())).await;

        assert_eq!(status, StatusCode::OK);
        let response: DetectionResponse = serde_json::from_value(json).unwrap();
        assert_eq!(response.detected_items, vec!["apple", "carrot"]);
        assert_eq!(
            response.detected_items.len(),
            response.confidence_scores.len()
        );
        assert!(response
            .confidence_scores
            .iter()
            .all(|score| (0.0..=1.0).contains(score)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detect_with_nothing_found() {
        let (router, _) = app(|| Ok(Vec::new()), false);

        let (status, json) = send(router, upload("file", "image/png", &png_bytes())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], NONE_DETECTED_MESSAGE);
        assert_eq!(json["detected_items"], serde_json::json!([]));
        assert_eq!(json["confidence_scores"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_non_image_content_type_never_reaches_detector() {
        let (router, calls) = app(|| Ok(Vec::new()), false);

        let (status, json) = send(router, upload("file", "text/plain", b"hello")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_content_type");
        assert_eq!(json["message"], "File must be an image");
        assert_eq!(json["type"], "ValidationError");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected() {
        let (router, calls) = app(|| Ok(Vec::new()), false);

        let (status, json) = send(router, upload("file", "image/jpeg", b"")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "empty_file");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_image_is_rejected() {
        let (router, calls) = app(|| Ok(Vec::new()), false);

        let (status, json) =
            send(router, upload("file", "image/png", b"definitely not a png")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_image");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_file_field_is_rejected() {
        let (router, _) = app(|| Ok(Vec::new()), false);

        let (status, json) = send(router, upload("photo", "image/png", &png_bytes())).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "missing_file");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let (router, calls) = app_with_limit(|| Ok(Vec::new()), false, 64);

        let (status, json) = send(router, upload("file", "image/png", &[0u8; 4096])).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["error"], "file_too_large");
        assert_eq!(json["message"], "Uploaded file exceeds the size limit");
        assert_eq!(json["type"], "ValidationError");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detector_failure_is_internal_error() {
        let (router, _) = app(
            || Err(DetectorError::Inference("session crashed".to_string())),
            false,
        );

        let (status, json) = send(router, upload("file", "image/png", &png_bytes())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "detection_failed");
        assert_eq!(json["message"], "Inference failed: session crashed");
        assert_eq!(json["type"], "InferenceError");
        assert!(json.get("traceback").is_none());
        assert!(json.get("error_line").is_none());
    }

    #[tokio::test]
    async fn test_detector_failure_exposes_details_when_enabled() {
        let (router, _) = app(
            || Err(DetectorError::Output("missing output `logits`".to_string())),
            true,
        );

        let (status, json) = send(router, upload("file", "image/png", &png_bytes())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["type"], "OutputError");
        assert_eq!(
            json["traceback"][0],
            "OutputError: Unexpected model output: missing output `logits`"
        );
        assert!(json["error_line"]
            .as_str()
            .unwrap()
            .contains("routes/detect.rs"));
    }
}
