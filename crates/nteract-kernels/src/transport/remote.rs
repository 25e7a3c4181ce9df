use super::{ChannelHandle, Fanout, MessageStream};
use crate::config::RemoteServerConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use nteract_messaging::{decode_ws_frame, encode_ws_frame, Channel, JupyterMessage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A kernel as reported by the Jupyter server REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteKernel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// REST client for kernel management on a Jupyter server.
#[derive(Debug, Clone)]
pub struct RemoteKernelClient {
    http: reqwest::Client,
    server: RemoteServerConfig,
}

impl RemoteKernelClient {
    pub fn new(server: RemoteServerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            server,
        }
    }

    pub fn server(&self) -> &RemoteServerConfig {
        &self.server
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.server
            .base_url
            .join(path)
            .map_err(|err| TransportError::Url(err.to_string()))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.server.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, format!("token {token}")),
            None => request,
        }
    }

    pub async fn start(&self, kernelspec_name: &str, cwd: &Path) -> Result<RemoteKernel, TransportError> {
        let url = self.url("api/kernels")?;
        let response = self
            .authorize(self.http.post(url))
            .json(&json!({ "name": kernelspec_name, "path": cwd.display().to_string() }))
            .send()
            .await
            .map_err(http_error)?;
        let kernel: RemoteKernel = check_status(response)
            .await?
            .json()
            .await
            .map_err(http_error)?;
        info!(event = "remote_kernel_started", kernel_id = %kernel.id, kernel = %kernel.name);
        Ok(kernel)
    }

    pub async fn interrupt(&self, kernel_id: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("api/kernels/{kernel_id}/interrupt"))?;
        let response = self
            .authorize(self.http.post(url))
            .send()
            .await
            .map_err(http_error)?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn kill(&self, kernel_id: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("api/kernels/{kernel_id}"))?;
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(http_error)?;
        check_status(response).await?;
        info!(event = "remote_kernel_killed", kernel_id);
        Ok(())
    }

    pub fn channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url, TransportError> {
        let mut url = self.url(&format!("api/kernels/{kernel_id}/channels"))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Url(format!("cannot use {scheme} for {url}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session_id", session_id);
            if let Some(token) = &self.server.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

fn http_error(err: reqwest::Error) -> TransportError {
    TransportError::Http {
        status: err.status().map(|status| status.as_u16()),
        message: err.to_string(),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Http {
        status: Some(status.as_u16()),
        message: if body.is_empty() {
            status.to_string()
        } else {
            body
        },
    })
}

/// All four channels multiplexed over one Jupyter server websocket.
pub struct RemoteChannelHandle {
    identity: String,
    kernel_id: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    fanout: Arc<Fanout>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChannelHandle")
            .field("identity", &self.identity)
            .field("kernel_id", &self.kernel_id)
            .field("closed", &self.fanout.is_closed())
            .finish()
    }
}

impl RemoteChannelHandle {
    pub async fn connect(
        client: &RemoteKernelClient,
        kernel_id: &str,
        identity: &str,
    ) -> Result<Self, TransportError> {
        let url = client.channels_url(kernel_id, identity)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Url(err.to_string()))?;
        if let Some(token) = &client.server().token {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|err| TransportError::Url(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (ws, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Connect {
                endpoint: redact_token(&url),
                message: err.to_string(),
            })?;
        debug!(event = "kernel_channels_connected", transport = "websocket", kernel_id, identity);

        let fanout = Arc::new(Fanout::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(websocket_loop(ws, rx, fanout.clone(), kernel_id.to_string()));
        Ok(Self {
            identity: identity.to_string(),
            kernel_id: kernel_id.to_string(),
            outbound: Mutex::new(Some(tx)),
            fanout,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }
}

#[async_trait]
impl ChannelHandle for RemoteChannelHandle {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send(&self, message: JupyterMessage) -> Result<(), TransportError> {
        let message = message.with_session(&self.identity);
        let channel = message.target_channel();
        if channel == Channel::Iopub {
            return Err(TransportError::Send {
                channel: channel.to_string(),
                message: "channel is receive-only".to_string(),
            });
        }
        let text = encode_ws_frame(&message)?;
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match outbound.as_ref() {
            Some(tx) if !self.fanout.is_closed() => {
                tx.send(text).map_err(|_| TransportError::Closed)
            }
            _ => Err(TransportError::Closed),
        }
    }

    fn subscribe(&self, channel: Channel) -> MessageStream {
        self.fanout.subscribe(channel)
    }

    /// Closes the socket politely, then gives up after a short grace period.
    async fn complete(&self) {
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_none() && task.is_none() {
            return;
        }
        drop(sender);
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.fanout.close();
        debug!(event = "kernel_channels_closed", transport = "websocket", kernel_id = %self.kernel_id);
    }

    fn is_closed(&self) -> bool {
        self.fanout.is_closed()
    }
}

impl Drop for RemoteChannelHandle {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

async fn websocket_loop(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    fanout: Arc<Fanout>,
    kernel_id: String,
) {
    loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match decode_ws_frame(&text) {
                        Ok(message) => {
                            let channel = message.channel.unwrap_or(Channel::Shell);
                            fanout.publish(channel, message);
                        }
                        Err(err) => {
                            warn!(event = "kernel_message_rejected", kernel_id = %kernel_id, error = %err);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!(event = "kernel_websocket_closed", kernel_id = %kernel_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "kernel_websocket_error", kernel_id = %kernel_id, error = %err);
                        break;
                    }
                }
            }
            next = outbound.recv() => {
                let Some(text) = next else {
                    let _ = ws.close(None).await;
                    break;
                };
                if let Err(err) = ws.send(Message::Text(text)).await {
                    warn!(event = "kernel_websocket_error", kernel_id = %kernel_id, error = %err);
                    break;
                }
            }
        }
    }
    fanout.close();
}

fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.to_string()
}
