use crate::broadcaster::{Broadcaster, EventKind, ServerEvent};
use crate::config::Config;
use crate::cop::{can_clear, CompletionGate, CopReport};
use crate::error::ApiError;
use crate::follower::TranscriptFollower;
use crate::gate::{GateReport, StreamingGate};
use crate::state::SessionStateHolder;
use crate::{lock_store, SharedStore};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, Method},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use wag_core::{
    now_millis, AppRecord, Header, Message, MessageMetadata, MessageType, Mode, Role,
    SessionState, DEFAULT_BRANCH,
};
use wag_storage::WagStore;
use wag_transcript::TranscriptTail;

const SSE_BACKLOG: usize = 50;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub broadcaster: Broadcaster,
    pub session: Arc<SessionStateHolder>,
    pub follower: Arc<TranscriptFollower>,
    pub cop: Arc<CompletionGate>,
    pub gate: Arc<StreamingGate>,
}

impl AppState {
    pub fn from_config(store: WagStore, config: &Config) -> Self {
        Self::new(
            store,
            TranscriptTail::new(config.transcript_root.clone()),
            config.poll_interval,
            CompletionGate::standard(&config.lint_cmd, &config.test_cmd),
            StreamingGate::new(config.lint_cmd.clone(), config.test_cmd.clone()),
        )
    }

    pub fn new(
        store: WagStore,
        tail: TranscriptTail,
        poll_interval: Duration,
        cop: CompletionGate,
        gate: StreamingGate,
    ) -> Self {
        let store: SharedStore = Arc::new(Mutex::new(store));
        let broadcaster = Broadcaster::new();
        let follower = TranscriptFollower::new(tail, store.clone(), broadcaster.clone(), poll_interval);
        Self {
            store,
            broadcaster,
            session: Arc::new(SessionStateHolder::new()),
            follower: Arc::new(follower),
            cop: Arc::new(cop),
            gate: Arc::new(gate),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/state", get(get_state).post(post_state))
        .route(
            "/api/v1/messages",
            get(list_messages).post(post_message).delete(clear_messages),
        )
        .route("/api/v1/messages/:id", get(get_message))
        .route("/api/v1/apps", get(list_apps))
        .route("/api/v1/select", post(select_app))
        .route("/api/v1/cop", post(run_cop))
        .route("/api/v1/cop/:pbi", get(cop_status))
        .route("/api/v1/gate", post(run_gate))
        .route("/events", get(events))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateRequest {
    pub app: String,
    pub app_root: Option<String>,
    pub repo: Option<String>,
    pub mode: Option<Mode>,
    pub branch: String,
    pub context: String,
    pub pbi: Option<String>,
    pub task: Option<u32>,
    pub total_tasks: Option<u32>,
}

impl StateRequest {
    /// Summary line stored as the synthesized context message.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(mode) = self.mode {
            parts.push(format!("Mode: {mode}"));
        }
        if let Some(pbi) = &self.pbi {
            parts.push(pbi.clone());
        }
        if let (Some(task), Some(total)) = (non_zero(self.task), non_zero(self.total_tasks)) {
            parts.push(format!("Task {task}/{total}"));
        }
        if !self.context.is_empty() {
            parts.push(self.context.clone());
        }
        parts.join(" | ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRequest {
    pub role: Role,
    pub r#type: MessageType,
    pub content: String,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectRequest {
    pub app: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemRequest {
    pub pbi: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateBody {
    app: Option<String>,
    app_root: Option<String>,
    repo: Option<String>,
    mode: Option<String>,
    branch: Option<String>,
    context: Option<String>,
    pbi: Option<String>,
    task: Option<u32>,
    total_tasks: Option<u32>,
}

#[derive(Deserialize)]
struct MessageBody {
    role: Option<String>,
    #[serde(rename = "type")]
    r#type: Option<String>,
    content: Option<String>,
    file: Option<String>,
    task: Option<u32>,
    pbi: Option<String>,
    approved: Option<bool>,
}

#[derive(Deserialize)]
struct SelectBody {
    app: Option<String>,
}

#[derive(Deserialize)]
struct WorkItemBody {
    pbi: Option<String>,
}

/// An empty body reads as `{}`.
pub fn parse_body(body: &[u8]) -> Result<Value, &'static str> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_json::from_slice(body).map_err(|_| "invalid JSON body")?;
    if !value.is_object() {
        return Err("request body must be a JSON object");
    }
    Ok(value)
}

pub fn parse_state_request(payload: &Value) -> Result<StateRequest, &'static str> {
    let body: StateBody =
        serde_json::from_value(payload.clone()).map_err(|_| "invalid state payload")?;
    let app = non_empty(body.app).ok_or("app is required")?;
    let mode = match non_empty(body.mode) {
        Some(mode) => Some(
            mode.parse::<Mode>()
                .map_err(|_| "mode must be one of DOCS, ADR, DEV")?,
        ),
        None => None,
    };
    Ok(StateRequest {
        app,
        app_root: non_empty(body.app_root),
        repo: non_empty(body.repo),
        mode,
        branch: non_empty(body.branch).unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        context: body.context.unwrap_or_default(),
        pbi: non_empty(body.pbi),
        task: body.task,
        total_tasks: body.total_tasks,
    })
}

pub fn parse_message_request(payload: &Value) -> Result<MessageRequest, &'static str> {
    let body: MessageBody =
        serde_json::from_value(payload.clone()).map_err(|_| "invalid message payload")?;
    let role = body
        .role
        .ok_or("role is required")?
        .parse::<Role>()
        .map_err(|_| "role must be one of user, pm, architect, dev")?;
    let r#type = body
        .r#type
        .ok_or("type is required")?
        .parse::<MessageType>()
        .map_err(|_| "type must be one of chat, proposal, review, diff, decision, system, context")?;
    let content = body.content.ok_or("content is required")?;
    Ok(MessageRequest {
        role,
        r#type,
        content,
        metadata: MessageMetadata {
            file: non_empty(body.file),
            task: non_zero(body.task),
            pbi: non_empty(body.pbi),
            approved: body.approved,
            source: None,
        },
    })
}

pub fn parse_select_request(payload: &Value) -> Result<SelectRequest, &'static str> {
    let body: SelectBody =
        serde_json::from_value(payload.clone()).map_err(|_| "invalid select payload")?;
    let app = non_empty(body.app).ok_or("app is required")?;
    Ok(SelectRequest { app })
}

pub fn parse_work_item_request(payload: &Value) -> Result<WorkItemRequest, &'static str> {
    let body: WorkItemBody =
        serde_json::from_value(payload.clone()).map_err(|_| "invalid work item payload")?;
    let pbi = non_empty(body.pbi).ok_or("pbi is required")?;
    Ok(WorkItemRequest { pbi })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn non_zero(value: Option<u32>) -> Option<u32> {
    value.filter(|value| *value != 0)
}

async fn get_state(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "state": state.session.get() }))
}

async fn post_state(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request = parse_state_request(&parse_body(&body)?)?;

    let mut selected_app = state.session.get().selected_app;
    if let Some(app_root) = &request.app_root {
        let record = AppRecord {
            name: request.app.clone(),
            app_root: app_root.clone(),
            repo_root: request.repo.clone(),
            last_used: now_millis(),
        };
        lock_store(&state.store).upsert_app(&record)?;
        state.follower.start(&record);
        selected_app = Some(record);
    }

    let snapshot = state.session.replace(SessionState {
        header: Header {
            mode: request.mode,
            app: request.app.clone(),
            branch: request.branch.clone(),
            context: request.context.clone(),
        },
        active_pbi: request.pbi.clone(),
        current_task: request.task,
        total_tasks: request.total_tasks,
        selected_app,
    });
    state.broadcaster.publish(EventKind::State, &snapshot);

    let message = Message::new(
        snapshot.header.clone(),
        Role::Dev,
        MessageType::Context,
        request.summary(),
    );
    append_and_publish(&state, &message)?;

    Ok(Json(json!({ "success": true, "state": snapshot })))
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let limit = match query.get("limit") {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .map_err(|_| ApiError::from("limit must be a non-negative integer"))?,
        ),
        None => None,
    };
    let messages = lock_store(&state.store).messages(limit)?;
    Ok(Json(json!({
        "success": true,
        "count": messages.len(),
        "messages": messages,
    })))
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message = lock_store(&state.store).message(&id)?;
    match message {
        Some(message) => Ok(Json(json!({ "success": true, "message": message }))),
        None => Err(ApiError::NotFound(format!("Message \"{id}\" not found"))),
    }
}

async fn post_message(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request = parse_message_request(&parse_body(&body)?)?;
    let header = state.session.get().header;
    let message = Message::new(header, request.role, request.r#type, request.content)
        .with_metadata(request.metadata);

    append_and_publish(&state, &message)?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// Publishes under the store lock, so a subscriber registered under the same
/// lock gets the message either in its backlog or live, never both.
fn append_and_publish(state: &AppState, message: &Message) -> Result<(), ApiError> {
    let store = lock_store(&state.store);
    store.append_message(message)?;
    state.broadcaster.publish(EventKind::Message, message);
    Ok(())
}

async fn clear_messages(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let current = state.session.get();
    let app = current.app_name().to_string();
    let pbi = current.active_pbi.clone();

    let removed = {
        let store = lock_store(&state.store);
        let decision = can_clear(&store, &app, pbi.as_deref())?;
        if let Some(reason) = decision.reason() {
            warn!(event = "clear_refused", app = %app, pbi = ?pbi, reason = %reason);
            return Err(ApiError::Forbidden(reason));
        }
        let removed = store.clear_messages()?;
        if let Some(pbi) = &pbi {
            store.clear_completion_session(&app, pbi)?;
        }
        state.broadcaster.publish(EventKind::Clear, json!({}));
        removed
    };

    let reset = state.session.reset();
    state.broadcaster.publish(EventKind::State, &reset);
    info!(event = "messages_cleared", app = %app, removed);

    Ok(Json(json!({ "success": true, "message": "Messages cleared" })))
}

async fn list_apps(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let apps = lock_store(&state.store).apps()?;
    Ok(Json(json!({ "success": true, "apps": apps })))
}

async fn select_app(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request = parse_select_request(&parse_body(&body)?)?;

    let app = {
        let store = lock_store(&state.store);
        let Some(mut app) = store.app(&request.app)? else {
            return Err(ApiError::NotFound(format!("App \"{}\" not found", request.app)));
        };
        app.last_used = now_millis();
        store.upsert_app(&app)?;
        app
    };

    let snapshot = state.session.update(|current| {
        current.header.app = app.name.clone();
        current.selected_app = Some(app.clone());
    });
    state.follower.start(&app);
    state.broadcaster.publish(EventKind::State, &snapshot);
    state.broadcaster.publish(EventKind::AppChanged, json!({ "app": app }));

    Ok(Json(json!({ "success": true, "app": app })))
}

fn selected_app(state: &AppState) -> Result<AppRecord, ApiError> {
    state
        .session
        .get()
        .selected_app
        .ok_or_else(|| ApiError::BadRequest("No app selected. Select an app first.".to_string()))
}

#[derive(Debug, Serialize)]
pub struct Succeeded<T> {
    pub success: bool,
    #[serde(flatten)]
    pub report: T,
}

impl<T> Succeeded<T> {
    fn json(report: T) -> Json<Self> {
        Json(Self {
            success: true,
            report,
        })
    }
}

fn detached_failure(err: JoinError) -> ApiError {
    ApiError::Internal(format!("gate task failed: {err}"))
}

/// Gate runs are spawned so a client that disconnects mid-run does not
/// cancel them.
async fn run_cop(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Succeeded<CopReport>>, ApiError> {
    let request = parse_work_item_request(&parse_body(&body)?)?;
    let app = selected_app(&state)?;
    let cop = state.cop.clone();
    let store = state.store.clone();
    let task = tokio::spawn(async move {
        cop.run(
            &store,
            &app.name,
            std::path::Path::new(&app.app_root),
            &request.pbi,
        )
        .await
    });
    let report = task.await.map_err(detached_failure)??;
    Ok(Succeeded::json(report))
}

async fn cop_status(
    State(state): State<AppState>,
    Path(pbi): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let app = selected_app(&state)?;
    let session = lock_store(&state.store).latest_completion_session(&app.name, &pbi)?;
    Ok(Json(json!({ "success": true, "session": session })))
}

async fn run_gate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Succeeded<GateReport>>, ApiError> {
    let request = parse_work_item_request(&parse_body(&body)?)?;
    let app = selected_app(&state)?;
    let gate = state.gate.clone();
    let broadcaster = state.broadcaster.clone();
    let task = tokio::spawn(async move {
        gate.run(
            std::path::Path::new(&app.app_root),
            &request.pbi,
            &broadcaster,
        )
        .await
    });
    let report = task.await.map_err(detached_failure)?;
    Ok(Succeeded::json(report))
}

async fn events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let snapshot = state.session.get();

    // Backlog read and registration share one store lock; message writers
    // publish under it too.
    let subscription = {
        let store = lock_store(&state.store);
        let backlog = store.recent_messages(SSE_BACKLOG)?;

        let mut preamble = Vec::with_capacity(backlog.len() + 2);
        preamble.push(ServerEvent::new(
            EventKind::Connected,
            json!({ "timestamp": now_millis() }),
        ));
        preamble.push(ServerEvent::new(EventKind::State, &snapshot));
        preamble.extend(
            backlog
                .iter()
                .map(|message| ServerEvent::new(EventKind::Message, message)),
        );
        state.broadcaster.subscribe_with(preamble)
    };

    let stream = subscription.map(|event| Ok(sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

fn sse_event(event: ServerEvent) -> Event {
    Event::default()
        .event(event.kind.as_str())
        .data(event.data.to_string())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "clients": state.broadcaster.subscriber_count() }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}
