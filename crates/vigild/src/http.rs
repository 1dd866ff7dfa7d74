//! Browser-facing HTTP surface: MJPEG feed, alert polling, reference uploads.

use crate::state::{AppState, ThresholdError};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use vigil_core::reference::{sanitize_file_name, validate_upload};
use vigil_core::SharedStateSlot;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const MJPEG_BOUNDARY: &str = "frame";
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/get_alert", get(get_alert))
        .route("/upload_photo", post(upload_photo))
        .route("/status", get(status))
        .route("/references", get(references))
        .route("/stream/start", post(stream_start))
        .route("/stream/stop", post(stream_stop))
        .route("/threshold", get(get_threshold).post(set_threshold))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body with a status code.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// One multipart part wrapping a JPEG.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let head = format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

async fn video_feed(State(state): State<AppState>) -> Response {
    let interval = state.poll_interval;
    let frames = futures::stream::unfold(
        (state.slot, 0u64),
        move |(slot, seen): (Arc<SharedStateSlot>, u64)| async move {
            loop {
                if let Some((sequence, jpeg)) = slot.read_frame_after(seen) {
                    return Some((Ok::<_, Infallible>(mjpeg_part(&jpeg)), (slot, sequence)));
                }
                tokio::time::sleep(interval).await;
            }
        },
    );

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn get_alert(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.take_alert_json())
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.status_json())
}

async fn references(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "references": state.references.list() }))
}

async fn stream_start(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let started = state.start_stream().await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "started": started, "state": state.stream.state() })))
}

async fn stream_stop(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stopped = state.stop_stream().await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "stopped": stopped, "state": state.stream.state() })))
}

#[derive(Deserialize)]
struct ThresholdRequest {
    threshold: f32,
}

async fn get_threshold(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "threshold": state.threshold.as_ref().map(|t| t.get()) }))
}

async fn set_threshold(
    State(state): State<AppState>,
    Json(request): Json<ThresholdRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let applied = state.set_threshold(request.threshold).map_err(|e| match e {
        ThresholdError::OutOfRange(_) => ApiError::bad_request(e.to_string()),
        ThresholdError::Unsupported(_) => ApiError(StatusCode::CONFLICT, e.to_string()),
    })?;
    Ok(Json(json!({ "threshold": applied })))
}

/// `file` and `name` fields of an upload form.
#[derive(Default)]
struct UploadForm {
    label: String,
    file_name: Option<String>,
    data: Option<Bytes>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed form: {e}")))?
    {
        match field.name() {
            Some("name") => {
                form.label = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("malformed name field: {e}")))?;
            }
            Some("file") => {
                form.file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("malformed file field: {e}")))?;
                form.data = Some(data).filter(|d| !d.is_empty());
            }
            _ => {}
        }
    }
    Ok(form)
}

async fn upload_photo(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let form = read_upload_form(multipart).await?;
    let file_name = form.data.as_ref().and(form.file_name.as_deref());
    let label = validate_upload(&form.label, file_name)
        .map_err(|e| ApiError::bad_request(e.to_string()))?
        .to_string();
    // validate_upload guarantees both are present.
    let (Some(data), Some(file_name)) = (form.data, form.file_name) else {
        return Err(ApiError::bad_request("no file uploaded"));
    };

    let Some(engine) = state.engine.clone() else {
        return Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "face enrollment is not available".into(),
        ));
    };

    let image = image::load_from_memory(&data)
        .map_err(|e| ApiError::bad_request(format!("cannot decode image: {e}")))?
        .to_rgb8();

    let result = engine.enroll(label.clone(), image).await.map_err(|e| {
        if e.is_no_face() {
            ApiError(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        } else if e.is_invalid_input() {
            ApiError::bad_request(e.to_string())
        } else {
            ApiError::internal(e)
        }
    })?;

    let saved_as = sanitize_file_name(&file_name);
    let path = state.uploads_dir.join(&saved_as);
    if let Err(e) = save_upload(&state.uploads_dir, &path, &data).await {
        tracing::warn!(path = %path.display(), error = %e, "could not keep uploaded original");
    }

    tracing::info!(label = %result.label, file = %saved_as, "reference uploaded");
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Uploaded {} and saved embedding for {}", saved_as, result.label),
        "label": result.label,
        "references": result.references,
    })))
}

async fn save_upload(dir: &std::path::Path, path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::testing::{app_state, png_bytes, region, CyclingEmbedder, FixedDetector};
    use axum::http::Request;
    use futures::StreamExt;
    use std::time::Duration;
    use tower::ServiceExt;
    use vigil_core::{Alert, Embedding, ReferenceStore, SharedThreshold};

    struct Fixture {
        state: AppState,
        refs: tempfile::TempDir,
        uploads: tempfile::TempDir,
    }

    fn fixture(with_engine: bool, faces: Vec<vigil_core::BoundingBox>) -> Fixture {
        fixture_with(with_engine, faces, None)
    }

    fn fixture_with(
        with_engine: bool,
        faces: Vec<vigil_core::BoundingBox>,
        threshold: Option<SharedThreshold>,
    ) -> Fixture {
        let refs = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        let store = Arc::new(ReferenceStore::open(refs.path()).unwrap());

        let engine = with_engine.then(|| {
            spawn_engine(
                FixedDetector::new(faces),
                CyclingEmbedder::new(vec![Embedding::new(vec![0.6, 0.8])]),
                Arc::clone(&store),
            )
            .unwrap()
        });

        Fixture {
            state: app_state(store, uploads.path(), engine, threshold),
            refs,
            uploads,
        }
    }

    fn multipart_request(name: &str, file: Option<(&str, &[u8])>) -> Request<Body> {
        let boundary = "XBOUNDARYX";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\n{name}\r\n")
                .as_bytes(),
        );
        if let Some((file_name, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload_photo")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_mjpeg_part_framing() {
        let part = mjpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_get_alert_clears_on_read() {
        let fx = fixture(false, vec![]);
        fx.state
            .slot
            .write(Bytes::from_static(b"jpeg"), Some(Alert::identity("alice")));
        let app = router(fx.state.clone());

        let first = json_body(app.clone().oneshot(get_request("/get_alert")).await.unwrap()).await;
        assert_eq!(first["alert"], "ALERT: alice detected!");
        let second = json_body(app.oneshot(get_request("/get_alert")).await.unwrap()).await;
        assert!(second["alert"].is_null());
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_extension() {
        let fx = fixture(true, vec![region(1.0, 1.0, 10.0, 0.9)]);
        let app = router(fx.state.clone());
        let response = app
            .oneshot(multipart_request("alice", Some(("alice.gif", b"GIF89a"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("gif"));
        assert_eq!(std::fs::read_dir(fx.refs.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_requires_name_and_file() {
        let fx = fixture(true, vec![region(1.0, 1.0, 10.0, 0.9)]);
        let app = router(fx.state.clone());
        let png = png_bytes();

        let no_name = app
            .clone()
            .oneshot(multipart_request("", Some(("a.png", &png))))
            .await
            .unwrap();
        assert_eq!(no_name.status(), StatusCode::BAD_REQUEST);

        let no_file = app.oneshot(multipart_request("alice", None)).await.unwrap();
        assert_eq!(no_file.status(), StatusCode::BAD_REQUEST);
        assert_eq!(std::fs::read_dir(fx.refs.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_enrolls_reference() {
        let fx = fixture(true, vec![region(1.0, 1.0, 10.0, 0.9)]);
        let app = router(fx.state.clone());
        let response = app
            .oneshot(multipart_request("alice", Some(("../alice face.PNG", &png_bytes()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["label"], "alice");

        assert!(fx.refs.path().join("alice_embedding.npy").exists());
        assert!(fx.uploads.path().join("alice_face.PNG").exists());
        assert_eq!(fx.state.references.snapshot().labels(), ["alice"]);
    }

    #[tokio::test]
    async fn test_upload_without_face_is_unprocessable() {
        let fx = fixture(true, vec![]);
        let app = router(fx.state.clone());
        let response = app
            .oneshot(multipart_request("bob", Some(("bob.jpg", &png_bytes()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(std::fs::read_dir(fx.refs.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(fx.uploads.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_without_engine_is_unavailable() {
        let fx = fixture(false, vec![]);
        let app = router(fx.state.clone());
        let response = app
            .oneshot(multipart_request("alice", Some(("a.png", &png_bytes()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_and_stream_control() {
        let fx = fixture(false, vec![]);
        let app = router(fx.state.clone());

        let status = json_body(app.clone().oneshot(get_request("/status")).await.unwrap()).await;
        assert_eq!(status["stream"]["state"], "stopped");
        assert_eq!(status["references"], 0);

        let start = Request::builder()
            .method("POST")
            .uri("/stream/start")
            .body(Body::empty())
            .unwrap();
        let started = json_body(app.clone().oneshot(start).await.unwrap()).await;
        assert_eq!(started["started"], true);

        let stop = Request::builder()
            .method("POST")
            .uri("/stream/stop")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(stop).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_video_feed_streams_new_frames_only() {
        let fx = fixture(false, vec![]);
        fx.state.slot.write(Bytes::from_static(b"\xFF\xD8first\xFF\xD9"), None);
        let response = router(fx.state.clone()).oneshot(get_request("/video_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            &first[..],
            &b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8first\xFF\xD9\r\n"[..]
        );

        // Nothing new in the slot: the stream waits instead of resending.
        assert!(tokio::time::timeout(Duration::from_millis(50), body.next())
            .await
            .is_err());

        fx.state.slot.write(Bytes::from_static(b"\xFF\xD8second\xFF\xD9"), None);
        let second = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            &second[..],
            &b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8second\xFF\xD9\r\n"[..]
        );
    }

    fn threshold_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/threshold")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_threshold_updates_live_value() {
        let threshold = SharedThreshold::new(0.5);
        let fx = fixture_with(false, vec![], Some(threshold.clone()));
        let app = router(fx.state.clone());

        let response = app.clone().oneshot(threshold_request(r#"{"threshold": 0.8}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!((json_body(response).await["threshold"].as_f64().unwrap() - 0.8).abs() < 1e-6);
        assert!((threshold.get() - 0.8).abs() < 1e-6);

        let rejected = app.clone().oneshot(threshold_request(r#"{"threshold": 1.5}"#)).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        assert!((threshold.get() - 0.8).abs() < 1e-6);

        let current = json_body(app.oneshot(get_request("/threshold")).await.unwrap()).await;
        assert!((current["threshold"].as_f64().unwrap() - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_threshold_not_adjustable_in_face_mode() {
        let fx = fixture(false, vec![]);
        let response = router(fx.state.clone())
            .oneshot(threshold_request(r#"{"threshold": 0.3}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
