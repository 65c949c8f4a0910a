//! HTTP surface over a [`Session`].
//!
//! API endpoints:
//! - POST   /api/frames                  - Track one frame of detections
//! - POST   /api/rename                  - Rename an identity
//! - POST   /api/merge                   - Merge one identity into another
//! - GET    /api/identities              - All identities
//! - GET    /api/identities/unknown      - Auto-named identities
//! - GET    /api/identities/{reid}/image - Representative image (base64)
//! - DELETE /api/identities/{reid}       - Dismiss an identity
//! - GET    /api/roster                  - Named identities
//! - GET    /api/duplicates              - Look-alike pairs
//! - POST   /api/reset                   - Forget live tracks
//! - GET    /api/status                  - Session counters
//!
//! Session calls run on the blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use gazer_reid::annotate::draw;
use gazer_reid::{AdminOutcome, ReidNum, Session};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::wire::{FrameInput, FrameOutput, encode_png};

type AppState = Arc<Session>;

/// Error response carrying a status and a message.
#[derive(Debug)]
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            error!(error = %self.1, "request failed");
        }
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<gazer_reid::ReidError> for ApiError {
    fn from(e: gazer_reid::ReidError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

pub fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/api/frames", post(process_frame))
        .route("/api/rename", post(rename))
        .route("/api/merge", post(merge))
        .route("/api/identities", get(list_identities))
        .route("/api/identities/unknown", get(unknown_identities))
        .route("/api/identities/{reid}/image", get(identity_image))
        .route("/api/identities/{reid}", delete(dismiss))
        .route("/api/roster", get(roster))
        .route("/api/duplicates", get(duplicates))
        .route("/api/reset", post(reset))
        .route("/api/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(session)
}

/// Serves until the listener fails.
pub async fn serve(addr: &str, session: Arc<Session>) -> Result<()> {
    let addr = parse_addr(addr)?;
    let app = router(session);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server started");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Parse address string to SocketAddr.
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    Ok(addr.parse()?)
}

fn outcome(o: AdminOutcome) -> Response {
    let code = if o.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (code, Json(o)).into_response()
}

/// Runs `f` on the blocking pool. Registry calls take locks and hit the
/// store, so they stay off the async workers.
async fn blocking<T, F>(session: AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Session) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&session))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn frame_output(session: &Session, input: FrameInput) -> Result<FrameOutput, ApiError> {
    let frame = input
        .frame()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("{e:#}")))?;
    let use_tracking = input.use_tracking;
    let detections = input.into_detections(frame.as_ref());

    let summary = if use_tracking {
        session.summarize(session.track(detections))
    } else {
        session.identify(detections)
    };
    let annotated = match frame {
        Some(frame) => Some(
            encode_png(&draw(&frame, &summary.faces))
                .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
        ),
        None => None,
    };
    Ok(FrameOutput { summary, annotated })
}

async fn process_frame(
    State(session): State<AppState>,
    Json(input): Json<FrameInput>,
) -> Result<Json<FrameOutput>, ApiError> {
    Ok(Json(blocking(session, move |s| frame_output(s, input)).await??))
}

#[derive(Deserialize)]
struct RenameRequest {
    reid: String,
    name: String,
}

async fn rename(
    State(session): State<AppState>,
    Json(req): Json<RenameRequest>,
) -> Result<Response, ApiError> {
    Ok(outcome(blocking(session, move |s| s.rename(&req.reid, &req.name)).await?))
}

#[derive(Deserialize)]
struct MergeRequest {
    source: String,
    target: String,
}

async fn merge(
    State(session): State<AppState>,
    Json(req): Json<MergeRequest>,
) -> Result<Response, ApiError> {
    Ok(outcome(blocking(session, move |s| s.merge(&req.source, &req.target)).await?))
}

async fn dismiss(
    State(session): State<AppState>,
    Path(reid): Path<String>,
) -> Result<Response, ApiError> {
    Ok(outcome(blocking(session, move |s| s.dismiss(&reid)).await?))
}

async fn list_identities(State(session): State<AppState>) -> Result<Response, ApiError> {
    let ids = blocking(session, |s| s.list_identities()).await??;
    Ok(Json(ids).into_response())
}

async fn unknown_identities(State(session): State<AppState>) -> Result<Response, ApiError> {
    let ids = blocking(session, |s| s.unknown_identities()).await??;
    Ok(Json(ids).into_response())
}

async fn roster(State(session): State<AppState>) -> Result<Response, ApiError> {
    let ids = blocking(session, |s| s.roster()).await??;
    Ok(Json(ids).into_response())
}

async fn identity_image(
    State(session): State<AppState>,
    Path(reid): Path<String>,
) -> Result<Response, ApiError> {
    let reid: ReidNum = reid
        .parse()
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, "Invalid ReID number".into()))?;
    match blocking(session, move |s| s.identity_image(reid)).await?? {
        Some(bytes) => Ok(Json(serde_json::json!({
            "reid": reid,
            "image": STANDARD.encode(bytes),
        }))
        .into_response()),
        None => Err(ApiError(StatusCode::NOT_FOUND, "Face image not found".into())),
    }
}

#[derive(Deserialize)]
struct DuplicatesQuery {
    threshold: Option<f32>,
}

async fn duplicates(
    State(session): State<AppState>,
    Query(q): Query<DuplicatesQuery>,
) -> Result<Response, ApiError> {
    let pairs = blocking(session, move |s| s.find_duplicates(q.threshold)).await??;
    Ok(Json(serde_json::json!({
        "count": pairs.len(),
        "duplicates": pairs,
    }))
    .into_response())
}

async fn reset(State(session): State<AppState>) -> Result<Response, ApiError> {
    blocking(session, |s| s.reset()).await?;
    Ok(outcome(AdminOutcome::ok("Tracker reset")))
}

async fn status(State(session): State<AppState>) -> Result<Response, ApiError> {
    let st = blocking(session, |s| s.status()).await??;
    Ok(Json(st).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_forms() {
        assert_eq!(parse_addr(":8080").unwrap().to_string(), "0.0.0.0:8080");
        assert_eq!(
            parse_addr("127.0.0.1:9000").unwrap().to_string(),
            "127.0.0.1:9000"
        );
        assert!(parse_addr("localhost").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_work_runs_off_the_async_workers() {
        let session: AppState = Arc::new(Session::builder().build().unwrap());
        // Blocking on the runtime panics from an async worker.
        let n = blocking(Arc::clone(&session), |_| {
            tokio::runtime::Handle::current().block_on(async { 7 })
        })
        .await
        .unwrap();
        assert_eq!(n, 7);
        let frames = blocking(Arc::clone(&session), |s| s.status().map(|st| st.frames))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn untracked_frame_keeps_no_tracks() {
        let session: AppState = Arc::new(Session::builder().build().unwrap());
        let input: FrameInput = serde_json::from_str(
            r#"{"detections":[{"bbox":[0,0,10,10],"embedding":[1,0]}],"use_tracking":false}"#,
        )
        .unwrap();
        let out = blocking(Arc::clone(&session), move |s| frame_output(s, input))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.summary.names, vec!["Unknown_1"]);
        assert!(out.summary.faces[0].track_id.is_none());
        assert!(out.annotated.is_none());
        assert_eq!(session.status().unwrap().live_tracks, 0);
    }
}
