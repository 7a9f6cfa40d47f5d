//! HTTP transport: WebSocket event stream plus amplifier session endpoints.
//!
//! Project `name` resolves to the store at `<data_dir>/stores/<name>` and
//! runs sessions in `<data_dir>/projects/<name>`.

pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::config::Settings;
use crate::errors::AttractorError;
use crate::events::Broadcaster;
use crate::models::SessionInfo;
use crate::session::{SessionConfig, SessionManager};
use crate::store::{GitVcs, ProjectStore, StoreHandle, VersionControl};

/// Process-wide state shared by every handler.
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub sessions: Arc<SessionManager>,
    pub settings: Settings,
    /// Version control used for every project store.
    pub vcs: Arc<dyn VersionControl>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let sessions = SessionManager::new(SessionConfig {
            command: settings.amplifier_cmd.clone(),
        });
        Self {
            broadcaster: Arc::new(Broadcaster::new()),
            sessions: Arc::new(sessions),
            settings,
            vcs: Arc::new(GitVcs::new()),
        }
    }
}

type SharedState = Arc<AppState>;

// ── Errors ───────────────────────────────────────────────────────────

/// Renders an [`AttractorError`] as `{"error": "..."}` with its mapped status.
#[derive(Debug)]
pub struct ApiError(AttractorError);

impl From<AttractorError> for ApiError {
    fn from(err: AttractorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

// ── Router ───────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/api/amplifier/sessions", get(list_sessions))
        .route(
            "/api/projects/{name}/issues/{number}/amplifier",
            get(session_status)
                .post(start_session)
                .delete(cancel_session),
        )
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "listeners": state.broadcaster.listener_count(),
    }))
}

async fn list_sessions(State(state): State<SharedState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_sessions())
}

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    /// When given, the store manifest must carry this id.
    store_id: Option<String>,
}

/// Open the store backing project `name`. Without `expected_store_id` the
/// store only has to exist with a manifest.
fn open_project_store(
    settings: &Settings,
    name: &str,
    expected_store_id: Option<&str>,
    vcs: Arc<dyn VersionControl>,
) -> crate::Result<ProjectStore> {
    if !is_valid_project_name(name) {
        return Err(AttractorError::NotFound(format!("Project '{}' not found", name)));
    }
    let root = settings.store_dir(name);
    match expected_store_id {
        Some(store_id) => ProjectStore::open_verified(root, store_id, vcs),
        None => {
            let store = ProjectStore::open(root, vcs);
            if store.read_manifest()?.is_none() {
                return Err(AttractorError::NotFound(format!(
                    "Project '{}' not found",
                    name
                )));
            }
            Ok(store)
        }
    }
}

fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

async fn start_session(
    State(state): State<SharedState>,
    Path((name, number)): Path<(String, i64)>,
    Query(params): Query<StartParams>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let settings = state.settings.clone();
    let vcs = state.vcs.clone();
    let project = name.clone();
    let store = tokio::task::spawn_blocking(move || {
        open_project_store(&settings, &project, params.store_id.as_deref(), vcs)
    })
    .await
    .map_err(|e| AttractorError::Other(anyhow::anyhow!("store task panicked: {}", e)))??;
    let store = StoreHandle::new(store);

    let issue = store
        .call(move |store| store.read_issue(number))
        .await?
        .ok_or_else(|| AttractorError::NotFound(format!("Issue #{} not found", number)))?;

    let working_dir = state.settings.project_dir(&name);
    tokio::fs::create_dir_all(&working_dir)
        .await
        .map_err(|e| AttractorError::io(&working_dir, e))?;

    state
        .sessions
        .run(&name, &issue, store, state.broadcaster.clone(), &working_dir)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "started"})),
    ))
}

async fn session_status(
    State(state): State<SharedState>,
    Path((name, number)): Path<(String, i64)>,
) -> Result<Json<SessionInfo>, ApiError> {
    state
        .sessions
        .get_status(&name, number)
        .map(Json)
        .ok_or_else(|| no_session(&name, number))
}

async fn cancel_session(
    State(state): State<SharedState>,
    Path((name, number)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.cancel(&name, number) {
        tracing::info!(project = %name, issue = number, "amplifier session cancel requested");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(no_session(&name, number))
    }
}

fn no_session(project: &str, number: i64) -> ApiError {
    ApiError(AttractorError::NotFound(format!(
        "No running amplifier session for {} issue #{}",
        project, number
    )))
}

// ── Serve loop ───────────────────────────────────────────────────────

/// Bind, serve until Ctrl+C, then signal any running sessions.
pub async fn start_server(settings: Settings) -> Result<()> {
    std::fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            settings.data_dir.display()
        )
    })?;

    let addr = settings.bind_addr();
    let state = Arc::new(AppState::new(settings));
    let app = build_router(state.clone()).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "attractor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let signalled = state.sessions.shutdown();
    if signalled > 0 {
        tracing::info!(sessions = signalled, "signalled running amplifier sessions");
    }
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        build_router(Arc::new(AppState::new(Settings::default())))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["listeners"], 0);
    }

    #[tokio::test]
    async fn test_list_sessions_empty() {
        let req = Request::builder()
            .uri("/api/amplifier/sessions")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_session_status_not_found() {
        let req = Request::builder()
            .uri("/api/projects/demo/issues/3/amplifier")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("demo issue #3"));
    }

    #[tokio::test]
    async fn test_cancel_without_session_is_404() {
        let req = Request::builder()
            .method("DELETE")
            .uri("/api/projects/demo/issues/3/amplifier")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_issue_number_is_rejected() {
        let req = Request::builder()
            .uri("/api/projects/demo/issues/abc/amplifier")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_api_error_maps_status_and_body() {
        let resp = ApiError::from(AttractorError::Conflict("already running".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "Conflict: already running");

        let resp = ApiError::from(AttractorError::SyncFailure {
            operation: "push".into(),
            detail: "rejected".into(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[cfg(unix)]
    mod start {
        use super::*;
        use crate::events::ChannelListener;
        use crate::models::{Issue, SimpleUser};
        use crate::store::MemoryVcs;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// State whose data dir holds project `demo` with issue #1.
        fn project_state(script: &str) -> (Arc<AppState>, TempDir) {
            let dir = TempDir::new().unwrap();
            let tool = dir.path().join("amplifier.sh");
            std::fs::write(&tool, script).unwrap();
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

            let mut state = AppState::new(Settings {
                data_dir: dir.path().join("data"),
                amplifier_cmd: tool.to_string_lossy().to_string(),
                ..Settings::default()
            });
            let vcs = Arc::new(MemoryVcs::new());
            state.vcs = vcs.clone();

            let store =
                ProjectStore::init(state.settings.store_dir("demo"), "store-1", vcs).unwrap();
            let issue = Issue::new(
                1,
                "Login fails",
                SimpleUser::user("local-user", 1),
                chrono::Utc::now(),
            );
            store.write_issue(&issue).unwrap();
            (Arc::new(state), dir)
        }

        fn post(uri: &str) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        }

        #[tokio::test]
        async fn test_start_session_accepted_and_completes() {
            let (state, _dir) = project_state(
                "#!/bin/sh\necho '{\"status\":\"success\",\"response\":\"Fixed\"}'\n",
            );
            let (listener, mut rx) = ChannelListener::channel(16);
            state.broadcaster.connect(Arc::new(listener));

            let resp = build_router(state.clone())
                .oneshot(post("/api/projects/demo/issues/1/amplifier"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
            assert_eq!(body_json(resp).await, serde_json::json!({"status": "started"}));

            for task in state.sessions.take_tasks() {
                task.await.unwrap();
            }
            let mut events = Vec::new();
            while let Ok(raw) = rx.try_recv() {
                let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
                events.push(value["event"].as_str().unwrap().to_string());
            }
            assert_eq!(events, vec!["amplifier:started", "amplifier:completed"]);

            let store = ProjectStore::open(state.settings.store_dir("demo"), state.vcs.clone());
            assert_eq!(store.read_issue(1).unwrap().unwrap().comments, 1);
            assert!(state.settings.project_dir("demo").is_dir());
        }

        #[tokio::test]
        async fn test_start_session_missing_issue_or_project_is_404() {
            let (state, _dir) = project_state("#!/bin/sh\n");
            let app = build_router(state.clone());

            let resp = app
                .clone()
                .oneshot(post("/api/projects/demo/issues/9/amplifier"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            assert!(body_json(resp).await["error"]
                .as_str()
                .unwrap()
                .contains("Issue #9"));

            let resp = app
                .clone()
                .oneshot(post("/api/projects/other/issues/1/amplifier"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);

            let resp = app
                .oneshot(post("/api/projects/..demo/issues/1/amplifier"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            assert!(state.sessions.list_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_start_session_store_id_mismatch_is_409() {
            let (state, _dir) = project_state("#!/bin/sh\n");
            let resp = build_router(state.clone())
                .oneshot(post("/api/projects/demo/issues/1/amplifier?store_id=store-2"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CONFLICT);
            assert!(state.sessions.get_status("demo", 1).is_none());
        }

        #[tokio::test]
        async fn test_start_session_twice_is_409() {
            let (state, _dir) = project_state("#!/bin/sh\nexec sleep 30\n");
            let app = build_router(state.clone());

            let resp = app
                .clone()
                .oneshot(post("/api/projects/demo/issues/1/amplifier?store_id=store-1"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::ACCEPTED);

            let resp = app
                .oneshot(post("/api/projects/demo/issues/1/amplifier"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CONFLICT);
            assert!(body_json(resp).await["error"]
                .as_str()
                .unwrap()
                .contains("already running"));

            assert_eq!(state.sessions.shutdown(), 1);
            for task in state.sessions.take_tasks() {
                task.await.unwrap();
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_running_session_status_and_cancel() {
        use crate::models::{Issue, SimpleUser};
        use crate::store::{MemoryVcs, ProjectStore, StoreHandle};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("amplifier.sh");
        std::fs::write(&tool, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = Settings {
            amplifier_cmd: tool.to_string_lossy().to_string(),
            ..Settings::default()
        };
        let state = Arc::new(AppState::new(settings));
        let store = ProjectStore::init(dir.path().join("store"), "s-1", Arc::new(MemoryVcs::new()))
            .unwrap();
        let issue = Issue::new(5, "Hang", SimpleUser::user("local-user", 1), chrono::Utc::now());
        store.write_issue(&issue).unwrap();

        state
            .sessions
            .run(
                "demo",
                &issue,
                StoreHandle::new(store),
                state.broadcaster.clone(),
                dir.path(),
            )
            .await
            .unwrap();

        let app = build_router(state.clone());
        let req = Request::builder()
            .uri("/api/projects/demo/issues/5/amplifier")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "running");
        assert_eq!(json["issueNumber"], 5);

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/projects/demo/issues/5/amplifier")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        for task in state.sessions.take_tasks() {
            task.await.unwrap();
        }
        let info = state.sessions.get_status("demo", 5).unwrap();
        assert_eq!(info.status.as_str(), "failed");
    }
}
