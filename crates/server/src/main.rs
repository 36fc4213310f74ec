use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_api::{
    advance_phase, create_project, create_topic, end_session, feedback_summary, list_feedback,
    list_projects, live_snapshot, pause_session, resume_session, share_topic, start_session,
    submit_feedback, ApiContext, NewProject, NewTopic,
};
use shared::{
    domain::{
        FeedbackKind, ProjectId, Reviewer, Role, SessionConfig, TopicId, UserId, Viewer,
    },
    error::{ApiError, ErrorCode},
    protocol::{MemberPayload, ScorePayload, ServerEvent},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

mod config;
mod fanout;

use config::{load_settings, prepare_database_url};
use fanout::SessionEvents;

struct AppState {
    api: ApiContext,
    events: SessionEvents,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct CreateTopicRequest {
    user_id: i64,
    title: String,
    #[serde(default)]
    config: SessionConfig,
    #[serde(default)]
    submit_open_at: Option<DateTime<Utc>>,
    #[serde(default)]
    submit_close_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    user_id: i64,
    title: String,
    #[serde(default)]
    repo_url: Option<String>,
    #[serde(default)]
    demo_url: Option<String>,
    #[serde(default)]
    members: Vec<MemberPayload>,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ViewerQuery {
    user_id: Option<i64>,
    access_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    user_id: i64,
    #[serde(default)]
    first_project_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    project_id: i64,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    guest_id: Option<Uuid>,
    #[serde(default)]
    guest_name: Option<String>,
    #[serde(default = "default_feedback_kind")]
    feedback_kind: FeedbackKind,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    scores: Vec<ScorePayload>,
}

fn default_feedback_kind() -> FeedbackKind {
    FeedbackKind::Comment
}

#[derive(Debug, Deserialize)]
struct FeedbackListQuery {
    project_id: i64,
    user_id: Option<i64>,
    access_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    project_id: i64,
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    topic_id: i64,
    user_id: Option<i64>,
    access_key: Option<String>,
}

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext { storage };
    let events = SessionEvents::new(settings.events_capacity);

    let state = AppState { api, events };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/topics", post(http_create_topic))
        .route("/topics/:topic_id/projects", get(http_list_projects))
        .route("/topics/:topic_id/projects", post(http_create_project))
        .route("/topics/:topic_id/share", post(http_share_topic))
        .route("/topics/:topic_id/live", get(http_live_snapshot))
        .route("/sessions/:topic_id/start", post(http_start_session))
        .route("/sessions/:topic_id/advance", post(http_advance_phase))
        .route("/sessions/:topic_id/pause", post(http_pause_session))
        .route("/sessions/:topic_id/resume", post(http_resume_session))
        .route("/sessions/:topic_id/end", post(http_end_session))
        .route("/sessions/:topic_id/feedback", post(http_submit_feedback))
        .route("/sessions/:topic_id/feedback", get(http_list_feedback))
        .route(
            "/sessions/:topic_id/feedback/summary",
            get(http_feedback_summary),
        )
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(code: &ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden | ErrorCode::SessionClosed => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::InvalidTransition => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(&err.code), Json(err))
}

fn internal(err: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    reject(ApiError::new(ErrorCode::Internal, err.to_string()))
}

/// Resolves the caller into the viewer union the core consumes: a known
/// registered user, or a guest holding the topic's share code.
async fn resolve_viewer(
    state: &AppState,
    topic_id: TopicId,
    user_id: Option<i64>,
    access_key: Option<&str>,
) -> Result<Viewer, (StatusCode, Json<ApiError>)> {
    if let Some(user_id) = user_id {
        let user_id = UserId(user_id);
        let role = state
            .api
            .storage
            .user_role(user_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| reject(ApiError::new(ErrorCode::Unauthorized, "unknown user")))?;
        return Ok(Viewer::Registered { user_id, role });
    }

    if let Some(access_key) = access_key {
        let key_topic = session_api::topic_for_access_key(access_key).map_err(reject)?;
        if key_topic != topic_id {
            return Err(reject(ApiError::new(
                ErrorCode::Forbidden,
                "access key does not match this topic",
            )));
        }
        return Ok(Viewer::Guest);
    }

    Err(reject(ApiError::new(
        ErrorCode::Unauthorized,
        "user_id or access_key is required",
    )))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        )));
    }
    let user_id = state
        .api
        .storage
        .create_user(username, req.role.unwrap_or(Role::Student))
        .await
        .map_err(internal)?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_create_topic(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTopicRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let topic_id = create_topic(
        &state.api,
        UserId(req.user_id),
        NewTopic {
            title: req.title,
            config: req.config,
            submit_open_at: req.submit_open_at,
            submit_close_at: req.submit_close_at,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(serde_json::json!({ "topic_id": topic_id.0 })))
}

async fn http_create_project(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let project_id = create_project(
        &state.api,
        UserId(req.user_id),
        TopicId(topic_id),
        NewProject {
            title: req.title,
            repo_url: req.repo_url,
            demo_url: req.demo_url,
            members: req.members,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(serde_json::json!({ "project_id": project_id.0 })))
}

async fn http_list_projects(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<shared::protocol::ProjectSummary>>, (StatusCode, Json<ApiError>)> {
    let topic_id = TopicId(topic_id);
    let viewer = resolve_viewer(&state, topic_id, Some(q.user_id), None).await?;
    let projects = list_projects(&state.api, &viewer, topic_id)
        .await
        .map_err(reject)?;
    Ok(Json(projects))
}

async fn http_share_topic(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let access_key = share_topic(&state.api, UserId(req.user_id), TopicId(topic_id))
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "access_key": access_key })))
}

async fn http_live_snapshot(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Query(q): Query<ViewerQuery>,
) -> Result<Json<shared::protocol::LiveSnapshot>, (StatusCode, Json<ApiError>)> {
    let topic_id = TopicId(topic_id);
    let viewer = resolve_viewer(&state, topic_id, q.user_id, q.access_key.as_deref()).await?;
    let snapshot = live_snapshot(&state.api, &viewer, topic_id)
        .await
        .map_err(reject)?;
    Ok(Json(snapshot))
}

/// Shared shape of the five session-control handlers: run the operation,
/// broadcast the committed snapshot, echo it to the caller. A failed
/// broadcast can only drop messages, never the transition itself.
async fn control_session<F, Fut>(
    state: &AppState,
    topic_id: TopicId,
    op: F,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)>
where
    F: FnOnce(ApiContext, TopicId) -> Fut,
    Fut: std::future::Future<Output = Result<ServerEvent, ApiError>>,
{
    let event = op(state.api.clone(), topic_id).await.map_err(reject)?;
    state.events.publish(topic_id, event.clone()).await;
    Ok(Json(event))
}

async fn http_start_session(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)> {
    let actor = UserId(req.user_id);
    let first_project = req.first_project_id.map(ProjectId);
    control_session(&state, TopicId(topic_id), |api, topic_id| async move {
        start_session(&api, actor, topic_id, first_project).await
    })
    .await
}

async fn http_advance_phase(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)> {
    let actor = UserId(req.user_id);
    control_session(&state, TopicId(topic_id), |api, topic_id| async move {
        advance_phase(&api, actor, topic_id).await
    })
    .await
}

async fn http_pause_session(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)> {
    let actor = UserId(req.user_id);
    control_session(&state, TopicId(topic_id), |api, topic_id| async move {
        pause_session(&api, actor, topic_id).await
    })
    .await
}

async fn http_resume_session(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)> {
    let actor = UserId(req.user_id);
    control_session(&state, TopicId(topic_id), |api, topic_id| async move {
        resume_session(&api, actor, topic_id).await
    })
    .await
}

async fn http_end_session(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)> {
    let actor = UserId(req.user_id);
    control_session(&state, TopicId(topic_id), |api, topic_id| async move {
        end_session(&api, actor, topic_id).await
    })
    .await
}

async fn http_submit_feedback(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<ServerEvent>, (StatusCode, Json<ApiError>)> {
    let reviewer = match (req.user_id, req.guest_id) {
        (Some(user_id), _) => Reviewer::Registered {
            user_id: UserId(user_id),
        },
        (None, Some(guest_id)) => Reviewer::Guest {
            guest_id,
            name: req.guest_name.unwrap_or_default(),
        },
        (None, None) => {
            return Err(reject(ApiError::new(
                ErrorCode::Unauthorized,
                "user_id or guest_id is required",
            )))
        }
    };

    let topic_id = TopicId(topic_id);
    let event = submit_feedback(
        &state.api,
        topic_id,
        ProjectId(req.project_id),
        reviewer,
        req.feedback_kind,
        req.comment,
        req.scores,
    )
    .await
    .map_err(reject)?;
    state.events.publish(topic_id, event.clone()).await;
    Ok(Json(event))
}

async fn http_list_feedback(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Query(q): Query<FeedbackListQuery>,
) -> Result<Json<Vec<shared::protocol::FeedbackPayload>>, (StatusCode, Json<ApiError>)> {
    let topic_id = TopicId(topic_id);
    let viewer = resolve_viewer(&state, topic_id, q.user_id, q.access_key.as_deref()).await?;
    let entries = list_feedback(&state.api, &viewer, topic_id, ProjectId(q.project_id))
        .await
        .map_err(reject)?;
    Ok(Json(entries))
}

async fn http_feedback_summary(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<i64>,
    Query(q): Query<SummaryQuery>,
) -> Result<Json<Vec<shared::protocol::ScoreAggregate>>, (StatusCode, Json<ApiError>)> {
    let aggregates = feedback_summary(
        &state.api,
        UserId(q.user_id),
        TopicId(topic_id),
        ProjectId(q.project_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(aggregates))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let topic_id = TopicId(q.topic_id);
    let viewer = resolve_viewer(&state, topic_id, q.user_id, q.access_key.as_deref()).await?;
    let topic = state
        .api
        .storage
        .load_topic(topic_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| reject(ApiError::new(ErrorCode::NotFound, "topic not found")))?;
    session_api::ensure_channel_access(&viewer, &topic).map_err(reject)?;

    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, topic_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    topic_id: TopicId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe(topic_id).await;

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                // Lagging receivers skip ahead; the client refetches the
                // snapshot if it cares about what it missed.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(topic_id = topic_id.0, missed, "subscriber lagging");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // The channel is an observer: inbound frames carry nothing.
    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use shared::domain::SessionStatus;
    use tower::ServiceExt;

    async fn test_app(config: SessionConfig) -> (Router, i64, i64, i64) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let teacher = storage
            .create_user("teacher", Role::Teacher)
            .await
            .expect("teacher");
        let topic = storage
            .create_topic(teacher, "Demo Day", &config, None, None)
            .await
            .expect("topic");
        let project = storage
            .create_project(topic, "team one", None, None, &[])
            .await
            .expect("project");

        let api = ApiContext { storage };
        let events = SessionEvents::new(32);
        let app = build_router(Arc::new(AppState { api, events }));
        (app, teacher.0, topic.0, project.0)
    }

    fn json_post(uri: String, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn healthz_responds() {
        let (app, _, _, _) = test_app(SessionConfig::default()).await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn owner_can_start_and_advance_a_session() {
        let (app, teacher, topic, _) = test_app(SessionConfig::default()).await;

        let response = app
            .clone()
            .oneshot(json_post(
                format!("/sessions/{topic}/start"),
                serde_json::json!({ "user_id": teacher }),
            ))
            .await
            .expect("start response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(json_post(
                format!("/sessions/{topic}/advance"),
                serde_json::json!({ "user_id": teacher }),
            ))
            .await
            .expect("advance response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let event: ServerEvent = serde_json::from_slice(&bytes).expect("event json");
        match event {
            ServerEvent::SessionUpdated { session, .. } => {
                assert_eq!(session.status, SessionStatus::Active);
                assert_eq!(session.phase, shared::domain::SessionPhase::Qa);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn advancing_an_idle_session_is_a_bad_request() {
        let (app, teacher, topic, _) = test_app(SessionConfig::default()).await;
        let response = app
            .oneshot(json_post(
                format!("/sessions/{topic}/advance"),
                serde_json::json!({ "user_id": teacher }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_owner_cannot_control_the_session() {
        let (app, _, topic, _) = test_app(SessionConfig::default()).await;
        let response = app
            .oneshot(json_post(
                format!("/sessions/{topic}/start"),
                serde_json::json!({ "user_id": 999 }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn guest_snapshot_needs_the_topic_to_allow_guests() {
        let (app, _, topic, _) = test_app(SessionConfig::default()).await;
        let access_key = session_api::access_key_for_topic(TopicId(topic));
        let response = app
            .oneshot(
                Request::get(format!("/topics/{topic}/live?access_key={access_key}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn feedback_is_rate_limited_per_guest() {
        let config = SessionConfig {
            allow_guest: true,
            max_comments_per_project: 1,
            ..SessionConfig::default()
        };
        let (app, teacher, topic, project) = test_app(config).await;

        let response = app
            .clone()
            .oneshot(json_post(
                format!("/sessions/{topic}/start"),
                serde_json::json!({ "user_id": teacher }),
            ))
            .await
            .expect("start");
        assert_eq!(response.status(), StatusCode::OK);

        let guest_id = Uuid::new_v4();
        let body = serde_json::json!({
            "project_id": project,
            "guest_id": guest_id,
            "guest_name": "Visiting Vi",
            "comment": "nice demo",
        });

        let response = app
            .clone()
            .oneshot(json_post(format!("/sessions/{topic}/feedback"), body.clone()))
            .await
            .expect("first feedback");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(json_post(format!("/sessions/{topic}/feedback"), body))
            .await
            .expect("second feedback");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn feedback_outside_a_session_is_forbidden() {
        let config = SessionConfig {
            allow_guest: true,
            ..SessionConfig::default()
        };
        let (app, _, topic, project) = test_app(config).await;

        let response = app
            .oneshot(json_post(
                format!("/sessions/{topic}/feedback"),
                serde_json::json!({
                    "project_id": project,
                    "guest_id": Uuid::new_v4(),
                    "guest_name": "Visiting Vi",
                    "comment": "too early",
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
