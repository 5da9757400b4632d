//! In-process experiment server for end-to-end tests.
//!
//! Serves the participant, questionnaire, node/info and waiting-room routes
//! the participant client talks to, keeps everything in memory, and exposes
//! hooks for tests: inject failures, push or cut waiting-room traffic, and
//! inspect what the client sent.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

type Fields = HashMap<String, String>;

/// A registered participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRow {
    pub id: u64,
    pub worker_id: String,
    pub hit_id: String,
    pub assignment_id: String,
    pub unique_id: String,
    pub mode: String,
    pub recruiter_id: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub status: String,
    #[serde(skip)]
    pub entry_information: Option<Value>,
}

/// One questionnaire post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRow {
    pub participant_id: u64,
    pub question: String,
    pub number: u32,
    pub response: String,
}

/// A registration as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationLog {
    pub path: String,
    pub fields: Fields,
}

#[derive(Debug, Clone)]
struct Failure {
    status: StatusCode,
    html: Option<String>,
}

#[derive(Debug, Clone)]
enum ChatCommand {
    Frame(String),
    Disconnect,
}

#[derive(Debug, Default)]
struct Records {
    next_participant: u64,
    next_node: u64,
    next_info: u64,
    participants: BTreeMap<u64, ParticipantRow>,
    registrations: Vec<RegistrationLog>,
    questions: Vec<QuestionRow>,
    completed: Vec<u64>,
    error_reports: Vec<Fields>,
    infos: BTreeMap<u64, Vec<Value>>,
    failures: HashMap<String, Failure>,
    chat_open: usize,
    chat_total: usize,
}

/// Server configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerConfig {
    /// Participants needed before the experiment starts. `None` disables the
    /// waiting room.
    pub quorum: Option<u32>,
}

#[derive(Clone)]
struct ServerState {
    config: ServerConfig,
    records: Arc<RwLock<Records>>,
    chat: broadcast::Sender<ChatCommand>,
}

/// A running fake server. Dropping it stops the server.
pub struct FakeServer {
    addr: SocketAddr,
    base_url: Url,
    state: ServerState,
    task: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeServer {
    /// Bind to an ephemeral local port and start serving.
    pub async fn start(config: ServerConfig) -> std::io::Result<Self> {
        let (chat, _) = broadcast::channel(64);
        let state = ServerState {
            config,
            records: Arc::new(RwLock::new(Records::default())),
            chat,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let base_url = Url::parse(&format!("http://{addr}"))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let app = build_router(state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Fake server stopped");
            }
        });
        info!(%addr, quorum = ?config.quorum, "Fake experiment server listening");

        Ok(Self {
            addr,
            base_url,
            state,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> Url {
        self.base_url.clone()
    }

    /// Entry URL carrying recruitment parameters.
    pub fn entry_url(&self, query: &str) -> Url {
        let mut url = self.base_url();
        url.set_path("/ad");
        url.set_query(Some(query));
        url
    }

    /// Make requests to `path` fail with `status`, optionally rendering an
    /// error page.
    pub async fn fail(&self, path: &str, status: u16, html: Option<&str>) {
        let failure = Failure {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            html: html.map(str::to_string),
        };
        self.state.records.write().await.failures.insert(path.to_string(), failure);
    }

    /// Push a raw frame to every waiting-room client.
    pub fn push_frame(&self, frame: impl Into<String>) -> usize {
        self.state
            .chat
            .send(ChatCommand::Frame(frame.into()))
            .unwrap_or(0)
    }

    /// Drop every waiting-room connection.
    pub fn disconnect_chat(&self) {
        let _ = self.state.chat.send(ChatCommand::Disconnect);
    }

    /// Wait until at least `open` waiting-room connections are open and
    /// `total` have ever been accepted.
    pub async fn wait_for_chat(&self, open: usize, total: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            {
                let records = self.state.records.read().await;
                if records.chat_open >= open && records.chat_total >= total {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn participants(&self) -> Vec<ParticipantRow> {
        self.state.records.read().await.participants.values().cloned().collect()
    }

    pub async fn registrations(&self) -> Vec<RegistrationLog> {
        self.state.records.read().await.registrations.clone()
    }

    pub async fn questions(&self) -> Vec<QuestionRow> {
        self.state.records.read().await.questions.clone()
    }

    pub async fn completed(&self) -> Vec<u64> {
        self.state.records.read().await.completed.clone()
    }

    pub async fn error_reports(&self) -> Vec<Fields> {
        self.state.records.read().await.error_reports.clone()
    }
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/participant", post(create_participant))
        .route(
            "/participant/:worker_id/:hit_id/:assignment_id/:mode",
            post(create_participant_legacy),
        )
        .route("/participant/:id", get(get_participant))
        .route("/load-participant", post(load_participant))
        .route("/worker_complete", post(worker_complete))
        .route("/question/:id", post(create_question))
        .route("/node/:id", post(create_node))
        .route("/node/:id/infos", get(node_infos))
        .route("/node/:id/received_infos", get(node_received_infos))
        .route("/node/:id/transmissions", get(node_transmissions))
        .route("/info/:node_id", post(create_info))
        .route("/info/:node_id/:info_id", get(get_info))
        .route("/experiment/:property", get(experiment_property))
        .route("/chat", get(chat_handler))
        .route("/error-page", post(error_page))
        .route("/recruiter-exit", get(recruiter_exit))
        .layer(middleware::from_fn_with_state(state.clone(), inject_failures))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn inject_failures(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let failure = state
        .records
        .read()
        .await
        .failures
        .get(request.uri().path())
        .cloned();
    match failure {
        Some(Failure { status, html: Some(html) }) => {
            (status, Json(json!({ "status": "error", "html": html }))).into_response()
        }
        Some(Failure { status, html: None }) => (status, "error").into_response(),
        None => next.run(request).await,
    }
}

fn field(fields: &Fields, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_else(|| "undefined".to_string())
}

async fn register(state: &ServerState, path: String, fields: Fields, row: ParticipantRow) -> Json<Value> {
    let mut records = state.records.write().await;
    records.registrations.push(RegistrationLog { path, fields });
    records.next_participant += 1;
    let id = records.next_participant;
    let row = ParticipantRow { id, ..row };
    records.participants.insert(id, row.clone());
    let arrived = records.participants.len() as u32;
    drop(records);

    debug!(id, worker_id = %row.worker_id, "Participant registered");
    let mut body = json!({ "status": "success", "participant": row });
    if let Some(q) = state.config.quorum {
        let overrecruited = arrived > q;
        let n = arrived.min(q);
        body["quorum"] = json!({ "n": n, "q": q, "overrecruited": overrecruited });
        if !overrecruited {
            let _ = state
                .chat
                .send(ChatCommand::Frame(format!("quorum:{}", json!({ "n": n, "q": q }))));
        }
    }
    Json(body)
}

async fn create_participant(State(state): State<ServerState>, Form(fields): Form<Fields>) -> Response {
    let entry: Value = match fields.get("entry_information").map(|raw| serde_json::from_str(raw)) {
        Some(Ok(entry)) => entry,
        _ => return (StatusCode::BAD_REQUEST, "missing entry_information").into_response(),
    };
    let entry_field = |name: &str| {
        entry
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("undefined")
            .to_string()
    };
    let worker_id = entry_field("worker_id");
    let assignment_id = entry_field("assignment_id");
    let row = ParticipantRow {
        id: 0,
        unique_id: format!("{worker_id}:{assignment_id}"),
        worker_id,
        hit_id: entry_field("hit_id"),
        assignment_id,
        mode: field(&fields, "mode"),
        recruiter_id: fields.get("recruiter").cloned(),
        fingerprint_hash: fields.get("fingerprint_hash").cloned(),
        status: "working".to_string(),
        entry_information: Some(entry.clone()),
    };
    register(&state, "/participant".to_string(), fields, row).await.into_response()
}

#[derive(Debug, Deserialize)]
struct LegacyQuery {
    fingerprint_hash: Option<String>,
    recruiter: Option<String>,
}

async fn create_participant_legacy(
    State(state): State<ServerState>,
    Path((worker_id, hit_id, assignment_id, mode)): Path<(String, String, String, String)>,
    Query(query): Query<LegacyQuery>,
) -> Json<Value> {
    let path = format!("/participant/{worker_id}/{hit_id}/{assignment_id}/{mode}");
    let mut fields = Fields::new();
    if let Some(hash) = &query.fingerprint_hash {
        fields.insert("fingerprint_hash".into(), hash.clone());
    }
    let row = ParticipantRow {
        id: 0,
        unique_id: format!("{worker_id}:{assignment_id}"),
        worker_id,
        hit_id,
        assignment_id,
        mode,
        recruiter_id: query.recruiter,
        fingerprint_hash: query.fingerprint_hash.filter(|h| !h.is_empty()),
        status: "working".to_string(),
        entry_information: None,
    };
    register(&state, path, fields, row).await
}

async fn get_participant(
    State(state): State<ServerState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, StatusCode> {
    let records = state.records.read().await;
    let row = records.participants.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "status": "success", "participant": row })))
}

async fn load_participant(
    State(state): State<ServerState>,
    Form(fields): Form<Fields>,
) -> Result<Json<Value>, StatusCode> {
    let assignment_id = fields.get("assignment_id").ok_or(StatusCode::BAD_REQUEST)?;
    let records = state.records.read().await;
    let row = records
        .participants
        .values()
        .find(|row| &row.assignment_id == assignment_id)
        .ok_or(StatusCode::FORBIDDEN)?;
    Ok(Json(json!({ "status": "success", "participant": row })))
}

async fn worker_complete(
    State(state): State<ServerState>,
    Form(fields): Form<Fields>,
) -> Result<Json<Value>, StatusCode> {
    let id: u64 = fields
        .get("participant_id")
        .and_then(|id| id.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let mut records = state.records.write().await;
    let row = records.participants.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    row.status = "submitted".to_string();
    records.completed.push(id);
    info!(id, "Assignment completed");
    Ok(Json(json!({ "status": "success" })))
}

async fn create_question(
    State(state): State<ServerState>,
    Path(id): Path<u64>,
    Form(fields): Form<Fields>,
) -> Result<Json<Value>, StatusCode> {
    let number = fields
        .get("number")
        .and_then(|n| n.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let mut records = state.records.write().await;
    if !records.participants.contains_key(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    records.questions.push(QuestionRow {
        participant_id: id,
        question: field(&fields, "question"),
        number,
        response: field(&fields, "response"),
    });
    Ok(Json(json!({ "status": "success" })))
}

async fn create_node(
    State(state): State<ServerState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, StatusCode> {
    let mut records = state.records.write().await;
    let working = records
        .participants
        .get(&id)
        .is_some_and(|row| row.status == "working");
    if !working {
        return Err(StatusCode::FORBIDDEN);
    }
    records.next_node += 1;
    let node_id = records.next_node;
    records.infos.insert(node_id, Vec::new());
    Ok(Json(json!({ "status": "success", "node": { "id": node_id, "participant_id": id } })))
}

async fn create_info(
    State(state): State<ServerState>,
    Path(node_id): Path<u64>,
    Form(fields): Form<Fields>,
) -> Result<Json<Value>, StatusCode> {
    let mut records = state.records.write().await;
    records.next_info += 1;
    let info = json!({
        "id": records.next_info,
        "origin_id": node_id,
        "contents": field(&fields, "contents"),
    });
    records
        .infos
        .get_mut(&node_id)
        .ok_or(StatusCode::NOT_FOUND)?
        .push(info.clone());
    Ok(Json(json!({ "status": "success", "info": info })))
}

async fn get_info(
    State(state): State<ServerState>,
    Path((node_id, info_id)): Path<(u64, u64)>,
) -> Result<Json<Value>, StatusCode> {
    let records = state.records.read().await;
    let info = records
        .infos
        .get(&node_id)
        .and_then(|infos| infos.iter().find(|info| info["id"] == info_id))
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "status": "success", "info": info })))
}

async fn node_infos(
    State(state): State<ServerState>,
    Path(node_id): Path<u64>,
) -> Result<Json<Value>, StatusCode> {
    let records = state.records.read().await;
    let infos = records.infos.get(&node_id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "status": "success", "infos": infos })))
}

async fn node_received_infos(Path(_node_id): Path<u64>) -> Json<Value> {
    Json(json!({ "status": "success", "infos": [] }))
}

async fn node_transmissions(
    Path(node_id): Path<u64>,
    Query(filter): Query<Fields>,
) -> Json<Value> {
    debug!(node_id, ?filter, "Listing transmissions");
    Json(json!({ "status": "success", "transmissions": [], "filter": filter }))
}

async fn experiment_property(
    State(state): State<ServerState>,
    Path(property): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match property.as_str() {
        "quorum" => Ok(Json(json!({ "status": "success", "quorum": state.config.quorum }))),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn error_page(State(state): State<ServerState>, Form(fields): Form<Fields>) -> Html<&'static str> {
    warn!(participant_id = ?fields.get("participant_id"), "Error report received");
    state.records.write().await.error_reports.push(fields);
    Html("<p>Sorry, something went wrong. We have been notified.</p>")
}

async fn recruiter_exit() -> Html<&'static str> {
    Html("<p>Thank you for participating.</p>")
}

async fn chat_handler(ws: WebSocketUpgrade, State(state): State<ServerState>, Query(query): Query<Fields>) -> impl IntoResponse {
    debug!(?query, "Waiting-room upgrade");
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state))
}

async fn handle_chat_socket(mut socket: WebSocket, state: ServerState) {
    let mut commands = state.chat.subscribe();
    {
        let mut records = state.records.write().await;
        records.chat_open += 1;
        records.chat_total += 1;
    }
    info!("Waiting-room client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    info!("Waiting-room client disconnected");
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Waiting-room socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(ChatCommand::Frame(frame)) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(ChatCommand::Disconnect) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Waiting-room client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.records.write().await.chat_open -= 1;
}
