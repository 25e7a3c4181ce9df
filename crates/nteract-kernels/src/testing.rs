//! In-process stand-ins for kernels: a memory channel connector driven by a
//! scriptable fake kernel, and a fake Jupyter server speaking the REST and
//! websocket APIs.

use crate::error::TransportError;
use crate::kernelspec::KernelSpecification;
use crate::notification::{LifecycleNotification, Notification, NotificationStream};
use crate::transport::{ChannelConnector, ChannelHandle, ConnectTarget, Fanout, MessageStream};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use nteract_messaging::{decode_ws_frame, encode_ws_frame, Channel, JupyterMessage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// An unsolicited iopub status, as kernels and servers publish on their own.
pub fn status_message(state: &str) -> JupyterMessage {
    JupyterMessage::new("status", json!({ "execution_state": state })).with_channel(Channel::Iopub)
}

/// Replies a well-behaved kernel sends for `request`, each pinned to the
/// channel it travels on.
pub fn kernel_replies(request: &JupyterMessage, language: &str) -> Vec<JupyterMessage> {
    let status = |state: &str| {
        JupyterMessage::new("status", json!({ "execution_state": state }))
            .with_parent(request)
            .with_channel(Channel::Iopub)
    };
    match request.msg_type() {
        "kernel_info_request" => vec![
            status("busy"),
            request
                .reply(
                    "kernel_info_reply",
                    json!({
                        "status": "ok",
                        "protocol_version": "5.3",
                        "implementation": "fake",
                        "language_info": {
                            "name": language,
                            "version": "3.12.1",
                            "file_extension": ".py",
                        },
                    }),
                )
                .with_channel(Channel::Shell),
            status("idle"),
        ],
        "execute_request" => {
            let code = request
                .content
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            vec![
                status("busy"),
                JupyterMessage::new("stream", json!({ "name": "stdout", "text": code }))
                    .with_parent(request)
                    .with_channel(Channel::Iopub),
                request
                    .reply(
                        "execute_reply",
                        json!({ "status": "ok", "execution_count": 1 }),
                    )
                    .with_channel(Channel::Shell),
                status("idle"),
            ]
        }
        "shutdown_request" => vec![request
            .reply("shutdown_reply", json!({ "status": "ok", "restart": false }))
            .with_channel(Channel::Shell)],
        "interrupt_request" => vec![request
            .reply("interrupt_reply", json!({ "status": "ok" }))
            .with_channel(Channel::Control)],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeKernelBehavior {
    pub language: String,
    pub answer_kernel_info: bool,
    /// `None` never answers shutdown_request.
    pub shutdown_reply_after: Option<Duration>,
}

impl Default for FakeKernelBehavior {
    fn default() -> Self {
        Self {
            language: "python".to_string(),
            answer_kernel_info: true,
            shutdown_reply_after: Some(Duration::from_millis(50)),
        }
    }
}

/// Channel handle wired straight to a fake kernel task.
#[derive(Debug)]
pub struct MemoryChannelHandle {
    identity: String,
    fanout: Arc<Fanout>,
    requests: mpsc::UnboundedSender<JupyterMessage>,
    sent: Mutex<Vec<JupyterMessage>>,
    completions: AtomicUsize,
    kernel: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryChannelHandle {
    pub fn spawn(identity: &str, behavior: FakeKernelBehavior) -> Arc<Self> {
        let fanout = Arc::new(Fanout::new());
        let (requests, rx) = mpsc::unbounded_channel();
        let kernel = tokio::spawn(run_fake_kernel(rx, fanout.clone(), behavior));
        Arc::new(Self {
            identity: identity.to_string(),
            fanout,
            requests,
            sent: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            kernel: Mutex::new(Some(kernel)),
        })
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|message| message.msg_type().to_string())
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Delivers a message as if the kernel had sent it unprompted.
    pub fn publish(&self, message: JupyterMessage) {
        let channel = message.target_channel();
        self.fanout.publish(channel, message);
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannelHandle {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send(&self, message: JupyterMessage) -> Result<(), TransportError> {
        if self.fanout.is_closed() {
            return Err(TransportError::Closed);
        }
        let message = message.with_session(&self.identity);
        self.sent.lock().expect("sent lock").push(message.clone());
        self.requests
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, channel: Channel) -> MessageStream {
        self.fanout.subscribe(channel)
    }

    async fn complete(&self) {
        if self.fanout.close() {
            self.completions.fetch_add(1, Ordering::SeqCst);
            if let Some(kernel) = self.kernel.lock().expect("kernel lock").take() {
                kernel.abort();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.fanout.is_closed()
    }
}

async fn run_fake_kernel(
    mut requests: mpsc::UnboundedReceiver<JupyterMessage>,
    fanout: Arc<Fanout>,
    behavior: FakeKernelBehavior,
) {
    while let Some(request) = requests.recv().await {
        match request.msg_type() {
            "kernel_info_request" if !behavior.answer_kernel_info => {}
            "shutdown_request" => {
                let Some(delay) = behavior.shutdown_reply_after else {
                    continue;
                };
                let fanout = fanout.clone();
                let replies = kernel_replies(&request, &behavior.language);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    publish_all(&fanout, replies);
                });
            }
            _ => publish_all(&fanout, kernel_replies(&request, &behavior.language)),
        }
    }
}

fn publish_all(fanout: &Fanout, messages: Vec<JupyterMessage>) {
    for message in messages {
        let channel = message.target_channel();
        fanout.publish(channel, message);
    }
}

/// Hands out memory channels regardless of target, or fails every connect.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    behavior: FakeKernelBehavior,
    fail_with: Option<TransportError>,
    connect_delay: Duration,
    handles: Mutex<Vec<Arc<MemoryChannelHandle>>>,
}

impl MemoryConnector {
    pub fn new(behavior: FakeKernelBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    pub fn failing(err: TransportError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::default()
        }
    }

    /// Holds every connect back, like a kernel slow to bind its sockets.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn handles(&self) -> Vec<Arc<MemoryChannelHandle>> {
        self.handles.lock().expect("handles lock").clone()
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(
        &self,
        _target: ConnectTarget<'_>,
        identity: &str,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let handle = MemoryChannelHandle::spawn(identity, self.behavior.clone());
        self.handles
            .lock()
            .expect("handles lock")
            .push(handle.clone());
        Ok(handle)
    }
}

/// A `sh -c` stand-in kernel. The connection file path arrives as `$0`.
pub fn sh_kernel_spec(name: &str, script: &str) -> KernelSpecification {
    KernelSpecification::new(
        name,
        "python",
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "{connection_file}".to_string(),
        ],
    )
}

pub async fn next_notification(rx: &mut NotificationStream) -> Notification {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification stream closed")
}

/// Collects notifications up to and including the first one matching
/// `done`.
pub async fn collect_until<F>(rx: &mut NotificationStream, done: F) -> Vec<LifecycleNotification>
where
    F: Fn(&LifecycleNotification) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_notification(rx).await.event;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Everything that arrives within `window`.
pub async fn drain_for(rx: &mut NotificationStream, window: Duration) -> Vec<LifecycleNotification> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(notification)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        seen.push(notification.event);
    }
    seen
}

#[derive(Debug, Default)]
struct ServerState {
    token: Option<String>,
    interrupt_delay: Duration,
    started_paths: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    interrupts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ServerState {
    fn authorized(&self, headers: &HeaderMap, query: Option<&HashMap<String, String>>) -> bool {
        let Some(token) = &self.token else {
            return true;
        };
        let header_ok = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(|value| value == format!("token {token}"))
            .unwrap_or(false);
        let query_ok = query
            .and_then(|query| query.get("token"))
            .map(|value| value == token)
            .unwrap_or(false);
        header_ok || query_ok
    }
}

/// Jupyter server double covering kernel start, interrupt, delete and the
/// channels websocket.
pub struct FakeJupyterServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl FakeJupyterServer {
    pub async fn spawn(token: Option<&str>) -> Self {
        Self::spawn_with(token, Duration::ZERO).await
    }

    pub async fn spawn_with(token: Option<&str>, interrupt_delay: Duration) -> Self {
        let state = Arc::new(ServerState {
            token: token.map(str::to_string),
            interrupt_delay,
            ..ServerState::default()
        });
        let app = Router::new()
            .route("/api/kernels", post(start_kernel))
            .route("/api/kernels/:id", delete(delete_kernel))
            .route("/api/kernels/:id/interrupt", post(interrupt_kernel))
            .route("/api/kernels/:id/channels", get(kernel_channels))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("fake server addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn started_paths(&self) -> Vec<String> {
        self.state.started_paths.lock().expect("paths lock").clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().expect("deleted lock").clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.state.interrupts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_interrupts(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for FakeJupyterServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start_kernel(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers, None) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("python3")
        .to_string();
    let path = body
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    state.started_paths.lock().expect("paths lock").push(path);
    let kernel = json!({
        "id": Uuid::new_v4().to_string(),
        "name": name,
        "execution_state": "starting",
        "last_activity": Utc::now(),
        "connections": 0,
    });
    (StatusCode::CREATED, Json(kernel)).into_response()
}

async fn interrupt_kernel(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    AxumPath(_id): AxumPath<String>,
) -> Response {
    if !state.authorized(&headers, None) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(state.interrupt_delay).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    state.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_kernel(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if !state.authorized(&headers, None) {
        return StatusCode::FORBIDDEN.into_response();
    }
    state.deleted.lock().expect("deleted lock").push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn kernel_channels(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.authorized(&headers, Some(&query)) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(serve_kernel_socket)
}

async fn serve_kernel_socket(mut socket: WebSocket) {
    while let Some(Ok(frame)) = socket.recv().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(request) = decode_ws_frame(&text) else {
            continue;
        };
        for reply in kernel_replies(&request, "python") {
            let Ok(encoded) = encode_ws_frame(&reply) else {
                continue;
            };
            if socket.send(Message::Text(encoded)).await.is_err() {
                return;
            }
        }
    }
}
