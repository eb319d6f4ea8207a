//! Mock docchat backend for integration tests: REST auth/documents/query
//! routes and a WebSocket endpoint, served by axum on a free local port.
//! The server task is left running when the test ends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Form, Multipart, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lib::auth::{Navigator, Route};
use lib::config::Config;
use lib::realtime::{ConnectionState, RealtimeChannel};
use lib::token::TokenStore;
use lib::Client;
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub const USERNAME: &str = "ada";
pub const PASSWORD: &str = "secret";
pub const TOKEN: &str = "tok-ada";

pub struct MockState {
    /// Token the backend currently accepts. Changing it makes every bearer call 401.
    pub valid_token: Mutex<String>,
    pub login_delay: Mutex<Duration>,
    pub me_delay: Mutex<Duration>,
    pub list_delay: Mutex<Duration>,
    /// Content-Type header of the last document list request, if any.
    pub list_content_type: Mutex<Option<String>>,
    /// Record chat frames without answering them.
    pub mute_chat: AtomicBool,
    /// Server-side upload limit in bytes; larger files get 413.
    pub max_upload: Mutex<usize>,
    pub fail_uploads: AtomicBool,
    pub documents: Mutex<Vec<Value>>,
    pub list_calls: AtomicUsize,
    pub uploads: AtomicUsize,
    pub last_upload_type: Mutex<Option<String>>,
    pub last_query: Mutex<Option<(String, Value)>>,
    pub ws_connections: AtomicUsize,
    pub ws_received: Mutex<Vec<String>>,
    kick: broadcast::Sender<()>,
    push: broadcast::Sender<String>,
}

impl MockState {
    fn new() -> Self {
        let (kick, _) = broadcast::channel(8);
        let (push, _) = broadcast::channel(64);
        Self {
            valid_token: Mutex::new(TOKEN.to_string()),
            login_delay: Mutex::new(Duration::ZERO),
            me_delay: Mutex::new(Duration::ZERO),
            list_delay: Mutex::new(Duration::ZERO),
            list_content_type: Mutex::new(None),
            mute_chat: AtomicBool::new(false),
            max_upload: Mutex::new(1024 * 1024),
            fail_uploads: AtomicBool::new(false),
            documents: Mutex::new(vec![json!({
                "id": 1,
                "title": "intro.pdf",
                "content_type": "pdf",
                "status": "completed",
                "user_id": "u1"
            })]),
            list_calls: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            last_upload_type: Mutex::new(None),
            last_query: Mutex::new(None),
            ws_connections: AtomicUsize::new(0),
            ws_received: Mutex::new(Vec::new()),
            kick,
            push,
        }
    }

    /// Close every open socket from the server side.
    pub fn drop_sockets(&self) {
        let _ = self.kick.send(());
    }

    /// Send a raw text frame to every open socket.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.push.send(frame.into());
    }

    pub fn revoke_token(&self) {
        *self.valid_token.lock().unwrap() = "revoked".to_string();
    }

    pub fn received(&self) -> Vec<String> {
        self.ws_received.lock().unwrap().clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let valid = self.valid_token.lock().unwrap().clone();
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t == valid)
            .unwrap_or(false)
    }
}

pub struct MockBackend {
    pub base_url: String,
    pub ws_url: String,
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::new());
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/me", get(me))
            .route("/api/documents", get(list_documents))
            .route("/api/documents/upload", post(upload))
            .route("/api/documents/:id", get(get_document).delete(delete_document))
            .route("/api/documents/:id/query", post(query_documents))
            .route("/api/ai/query/:id", post(query_ai))
            .route("/ws", get(ws_handler))
            .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{}", addr),
            ws_url: format!("ws://{}/ws", addr),
            state,
        }
    }

    /// Config pointing at this backend with fast reconnects.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.api.base_url = self.base_url.clone();
        config.api.ws_url = Some(self.ws_url.clone());
        config.realtime.reconnect_initial_ms = 20;
        config.realtime.reconnect_max_ms = 200;
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 50;
        config
    }

    /// Wait until the server side has accepted `n` sockets, so pushes reach them.
    pub async fn sockets_accepted(&self, n: usize) {
        let state = self.state.clone();
        let ok = eventually(move || state.ws_connections.load(Ordering::SeqCst) >= n).await;
        assert!(ok, "server never accepted {} socket(s)", n);
    }

    pub fn client(&self) -> (Client, Arc<RecordingNavigator>) {
        self.client_with(self.config(), TokenStore::in_memory())
    }

    pub fn client_with(&self, config: Config, tokens: TokenStore) -> (Client, Arc<RecordingNavigator>) {
        let nav = Arc::new(RecordingNavigator::default());
        (Client::with_parts(config, tokens, nav.clone()), nav)
    }
}

#[derive(Default)]
pub struct RecordingNavigator(Mutex<Vec<Route>>);

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<Route> {
        self.0.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: Route) {
        self.0.lock().unwrap().push(route);
    }
}

pub fn temp_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("docchat-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Wait until the channel reaches `want`, or panic after 5s.
pub async fn wait_for_state(channel: &RealtimeChannel, want: ConnectionState) {
    let mut rx = channel.watch_state();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    assert!(
        reached,
        "channel did not reach {:?}; now {:?}",
        want,
        channel.state()
    );
}

/// Poll `cond` every 10ms for up to 5s.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn login(State(s): State<Arc<MockState>>, Form(form): Form<HashMap<String, String>>) -> Response {
    let delay = *s.login_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    let ok = form.get("username").map(String::as_str) == Some(USERNAME)
        && form.get("password").map(String::as_str) == Some(PASSWORD);
    if !ok {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Incorrect username or password"})),
        )
            .into_response();
    }
    let token = s.valid_token.lock().unwrap().clone();
    Json(json!({"access_token": token, "token_type": "bearer"})).into_response()
}

async fn me(State(s): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let delay = *s.me_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "id": "u1",
        "email": "ada@example.com",
        "full_name": "Ada",
        "role": "user",
        "is_active": true
    }))
    .into_response()
}

async fn list_documents(State(s): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    s.list_calls.fetch_add(1, Ordering::SeqCst);
    *s.list_content_type.lock().unwrap() = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let delay = *s.list_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    let docs = s.documents.lock().unwrap().clone();
    let total = docs.len();
    Json(json!({"data": docs, "total": total})).into_response()
}

async fn get_document(
    State(s): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let found = s
        .documents
        .lock()
        .unwrap()
        .iter()
        .find(|d| d["id"].to_string().trim_matches('"') == id)
        .cloned();
    match found {
        Some(doc) => Json(doc).into_response(),
        None => (StatusCode::NOT_FOUND, "Document not found").into_response(),
    }
}

async fn delete_document(
    State(s): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    s.documents
        .lock()
        .unwrap()
        .retain(|d| d["id"].to_string().trim_matches('"') != id);
    StatusCode::NO_CONTENT.into_response()
}

async fn upload(State(s): State<Arc<MockState>>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut file_name = None;
    let mut size = 0;
    let mut document_type = None;
    while let Some(field) = multipart.next_field().await.expect("multipart field") {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file_name = field.file_name().map(String::from);
                size = field.bytes().await.expect("file bytes").len();
            }
            "document_type" => document_type = Some(field.text().await.expect("document_type")),
            _ => {}
        }
    }
    *s.last_upload_type.lock().unwrap() = document_type;
    let max = *s.max_upload.lock().unwrap();
    if size > max {
        return (StatusCode::PAYLOAD_TOO_LARGE, "File too large").into_response();
    }
    if s.fail_uploads.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "processing failed").into_response();
    }
    let n = s.uploads.fetch_add(1, Ordering::SeqCst);
    let doc = json!({
        "id": 100 + n,
        "title": file_name.unwrap_or_else(|| "upload".to_string()),
        "content_type": "txt",
        "status": "pending",
        "created_at": "2024-03-01T10:00:00",
        "user_id": "u1"
    });
    s.documents.lock().unwrap().push(doc.clone());
    Json(doc).into_response()
}

async fn query_documents(
    State(s): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    *s.last_query.lock().unwrap() = Some((format!("/api/documents/{}/query", id), body));
    Json(json!({"answer": "from documents", "sources": [{"page": 1}], "context_chunks": ["c1"]}))
        .into_response()
}

async fn query_ai(
    State(s): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !s.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    *s.last_query.lock().unwrap() = Some((format!("/api/ai/query/{}", id), body));
    Json(json!({"answer": "from ai"})).into_response()
}

async fn ws_handler(
    State(s): State<Arc<MockState>>,
    Query(q): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let valid = s.valid_token.lock().unwrap().clone();
    if q.get("token") != Some(&valid) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, s))
}

async fn handle_socket(mut socket: WebSocket, s: Arc<MockState>) {
    let mut kick = s.kick.subscribe();
    let mut push = s.push.subscribe();
    s.ws_connections.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            Ok(frame) = push.recv() => {
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    s.ws_received.lock().unwrap().push(text.clone());
                    let Ok(v) = serde_json::from_str::<Value>(&text) else { continue };
                    if v["type"] == "chat" && !s.mute_chat.load(Ordering::SeqCst) {
                        let doc = v["document_id"].clone();
                        for reply in [
                            json!({"type": "chat_partial", "content": "Hel", "document_id": doc}),
                            json!({"type": "chat_partial", "content": "lo", "document_id": doc}),
                            json!({"type": "chat_response", "content": {"answer": "Hello", "sources": [{"page": 1}]}, "document_id": doc}),
                        ] {
                            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            }
        }
    }
}
