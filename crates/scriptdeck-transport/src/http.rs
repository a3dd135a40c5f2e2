//! HTTP transport: run streaming over server-sent events plus the script
//! and history endpoints.

use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use scriptdeck_core::{
    HistoryStore, ProcessRunner, RunEvent, RunRequest, ScriptDefinition, ScriptStore,
    StorageError,
};
use scriptdeck_session::{CoordinatorError, RunCoordinator};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::protocol::{CancelMessage, Frame, RenameMessage};

/// Response header carrying the id of a started run.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// API error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Coordinator(CoordinatorError::ScriptNotFound(_) | CoordinatorError::SessionNotFound(_))
            | Self::Storage(StorageError::NotFound(_))
            | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Coordinator(CoordinatorError::EmptyRequest) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Storage(StorageError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Coordinator(CoordinatorError::Storage(_)) | Self::Storage(StorageError::Internal(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the API router.
pub fn router<S, R>(coordinator: RunCoordinator<S, R>) -> Router
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    Router::new()
        .route("/api/scripts/run", post(run_script::<S, R>))
        .route("/api/scripts/cancel", post(cancel_run::<S, R>))
        .route("/api/scripts/last-result", get(last_result::<S, R>))
        .route("/api/scripts/rename", post(rename_script::<S, R>))
        .route("/api/scripts/{name}/history", get(script_history::<S, R>))
        .route(
            "/api/scripts",
            get(list_scripts::<S, R>).post(save_script::<S, R>),
        )
        .route(
            "/api/scripts/{name}",
            get(get_script::<S, R>).delete(delete_script::<S, R>),
        )
        .route("/api/categories", get(list_categories::<S, R>))
        .route("/api/runs", get(active_runs::<S, R>))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

fn sse_stream<St>(events: St) -> impl Stream<Item = Result<Event, Infallible>>
where
    St: Stream<Item = RunEvent>,
{
    events.map(|event| Ok::<_, Infallible>(Frame::from_event(&event).to_sse_event()))
}

fn no_buffering(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
}

async fn run_script<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Json(request): Json<RunRequest>,
) -> Response
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let mut response = match coordinator.run(request).await {
        Ok(handle) => {
            let session_id = handle.session_id;
            let mut response = Sse::new(sse_stream(handle.events))
                .keep_alive(KeepAlive::default())
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
            }
            response
        }
        // Resolution failures are reported in-band so clients only need
        // one code path.
        Err(err @ (CoordinatorError::ScriptNotFound(_) | CoordinatorError::EmptyRequest)) => {
            tracing::info!(%err, "Run request rejected");
            let events = stream::iter([RunEvent::Error(err.to_string()), RunEvent::Done]);
            Sse::new(sse_stream(events)).into_response()
        }
        Err(err) => return ApiError::from(err).into_response(),
    };
    no_buffering(&mut response);
    response
}

async fn cancel_run<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Json(message): Json<CancelMessage>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let outcome = coordinator.cancel(message.session_id).await?;
    Ok(Json(json!({ "status": outcome })))
}

async fn last_result<S, R>(State(coordinator): State<RunCoordinator<S, R>>) -> String
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    coordinator.get_last_result().await
}

async fn script_history<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let history = coordinator.get_history(&name).await?;
    Ok(Json(json!({ "history": history })))
}

async fn list_scripts<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let scripts = coordinator.storage().list_scripts().await?;
    Ok(Json(json!({ "scripts": scripts })))
}

async fn get_script<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Path(name): Path<String>,
) -> Result<Json<ScriptDefinition>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    coordinator
        .storage()
        .get_script(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Script not found: {}", name.trim())))
}

fn validate(script: &ScriptDefinition) -> Result<(), ApiError> {
    if script.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Script name is required".to_string()));
    }
    if script.body.trim().is_empty() {
        return Err(ApiError::BadRequest("Script body is required".to_string()));
    }
    Ok(())
}

async fn save_script<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Json(script): Json<ScriptDefinition>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    validate(&script)?;
    coordinator.storage().save_script(script).await?;
    Ok(Json(json!({ "status": "success" })))
}

async fn delete_script<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    if coordinator.storage().delete_script(&name).await? {
        Ok(Json(json!({ "status": "success" })))
    } else {
        Err(ApiError::NotFound(format!("Script not found: {}", name.trim())))
    }
}

async fn rename_script<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
    Json(message): Json<RenameMessage>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let RenameMessage {
        old_name,
        new_name,
        description,
        body,
        category,
        working_directory,
    } = message;
    let updated = ScriptDefinition {
        name: new_name,
        description,
        body,
        category,
        working_directory,
    };
    validate(&updated)?;
    coordinator.storage().rename_script(&old_name, updated).await?;
    Ok(Json(json!({ "status": "success" })))
}

async fn list_categories<S, R>(
    State(coordinator): State<RunCoordinator<S, R>>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    let categories = coordinator.storage().categories().await?;
    Ok(Json(json!({ "categories": categories })))
}

async fn active_runs<S, R>(State(coordinator): State<RunCoordinator<S, R>>) -> Json<serde_json::Value>
where
    S: ScriptStore + HistoryStore + 'static,
    R: ProcessRunner + 'static,
{
    Json(json!({ "runs": coordinator.active_runs().await }))
}

#[cfg(all(test, unix))]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use scriptdeck_core::{EngineConfig, EventKind};
    use scriptdeck_executor::ShellRunner;
    use scriptdeck_session::storage::MemoryStorage;
    use tower::ServiceExt;

    use super::*;
    use crate::protocol::FrameDecoder;

    async fn app() -> (Router, RunCoordinator<MemoryStorage, ShellRunner>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            default_working_dir: dir.path().to_path_buf(),
            terminate_grace_ms: 500,
            ..EngineConfig::default()
        };
        let storage = MemoryStorage::new();
        storage
            .save_script(ScriptDefinition::new("hello", "echo \"hello $1\"").with_category("Demo"))
            .await
            .unwrap();
        let coordinator = RunCoordinator::new(storage, ShellRunner::new(), config);
        (router(coordinator.clone()), coordinator, dir)
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn frames(wire: &str) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(wire);
        frames.extend(decoder.finish());
        frames
    }

    #[tokio::test]
    async fn run_streams_frames_with_session_header() {
        let (app, coordinator, _dir) = app().await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/scripts/run",
                &json!({ "name": "hello", "args": "there" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(SESSION_ID_HEADER));
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let frames = frames(&body_text(response).await);
        assert_eq!(
            frames,
            vec![
                Frame::new(EventKind::Output, "hello there\n"),
                Frame::new(EventKind::Done, "Script execution completed"),
            ]
        );
        assert_eq!(coordinator.get_last_result().await, "hello there\n");
    }

    #[tokio::test]
    async fn unknown_script_yields_error_then_done() {
        let (app, _coordinator, _dir) = app().await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/scripts/run",
                &json!({ "script_name": "missing" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frames = frames(&body_text(response).await);
        assert_eq!(
            frames,
            vec![
                Frame::new(EventKind::Error, "Script not found: missing"),
                Frame::new(EventKind::Done, "Script execution completed"),
            ]
        );
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_404() {
        let (app, _coordinator, _dir) = app().await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/scripts/cancel",
                &json!({ "session_id": uuid::Uuid::new_v4() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .starts_with("Session not found"));
    }

    #[tokio::test]
    async fn cancel_running_session_reports_cancelled() {
        let (app, coordinator, _dir) = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/scripts/run",
                &json!({ "body": "sleep 30" }),
            ))
            .await
            .unwrap();
        let session_id = response.headers()[SESSION_ID_HEADER].to_str().unwrap().to_string();

        while coordinator
            .active_runs()
            .await
            .iter()
            .any(|run| run.status == scriptdeck_core::SessionStatus::Created)
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let cancel = app
            .oneshot(json_request(
                "POST",
                "/api/scripts/cancel",
                &json!({ "session_id": session_id }),
            ))
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);
        assert_eq!(body_json(cancel).await, json!({ "status": "cancelled" }));

        let frames = frames(&body_text(response).await);
        assert_eq!(
            frames.last(),
            Some(&Frame::new(EventKind::Cancelled, "Script execution cancelled"))
        );
    }

    #[tokio::test]
    async fn history_and_last_result_follow_runs() {
        let (app, _coordinator, dir) = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/scripts/run",
                &json!({ "script_name": "hello", "arguments": "a" }),
            ))
            .await
            .unwrap();
        body_text(response).await;

        let response = app.clone().oneshot(get("/api/scripts/last-result")).await.unwrap();
        assert_eq!(body_text(response).await, "hello a\n");

        let response = app.oneshot(get("/api/scripts/hello/history")).await.unwrap();
        let history = body_json(response).await;
        assert_eq!(history["history"][0]["arguments"], "a");
        assert_eq!(
            history["history"][0]["working_directory"],
            dir.path().to_str().unwrap()
        );
    }

    #[tokio::test]
    async fn script_crud() {
        let (app, _coordinator, _dir) = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/scripts",
                &json!({ "name": "list", "body": "ls", "description": "List files" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/api/scripts/list")).await.unwrap();
        let script = body_json(response).await;
        assert_eq!(script["category"], "Uncategorized");

        let response = app.clone().oneshot(get("/api/categories")).await.unwrap();
        assert_eq!(
            body_json(response).await,
            json!({ "categories": ["Demo", "Uncategorized"] })
        );

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/scripts/rename",
                &json!({ "old_name": "list", "new_name": "hello", "body": "ls" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/scripts",
                &json!({ "name": "  ", "body": "ls" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/scripts/list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/api/scripts/list")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
