use super::{ChannelHandle, Fanout, MessageStream};
use crate::connection::ConnectionInfo;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use nteract_messaging::{
    decode_zmq_frames, encode_zmq_frames, Channel, JupyterMessage, MessageSigner,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const HEARTBEAT_PING: &[u8] = b"ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZmqOptions {
    pub connect_timeout: Duration,
    /// Zero disables the heartbeat monitor.
    pub heartbeat_interval: Duration,
}

/// ZMQ sockets to a local kernel: dealers for shell, control and stdin, a
/// subscriber for iopub, and an optional heartbeat monitor. Each socket is
/// driven by its own pump task.
pub struct LocalChannelHandle {
    identity: String,
    signer: MessageSigner,
    outbound: HashMap<Channel, mpsc::UnboundedSender<ZmqMessage>>,
    fanout: Arc<Fanout>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannelHandle")
            .field("identity", &self.identity)
            .field("closed", &self.fanout.is_closed())
            .finish()
    }
}

impl LocalChannelHandle {
    pub async fn connect(
        info: &ConnectionInfo,
        identity: &str,
        options: ZmqOptions,
    ) -> Result<Self, TransportError> {
        let signer = info.signer()?;
        let deadline = Instant::now() + options.connect_timeout;

        let shell: DealerSocket = connect_socket(&info.shell_endpoint(), deadline).await?;
        let control: DealerSocket = connect_socket(&info.control_endpoint(), deadline).await?;
        let stdin: DealerSocket = connect_socket(&info.stdin_endpoint(), deadline).await?;
        let mut iopub: SubSocket = connect_socket(&info.iopub_endpoint(), deadline).await?;
        iopub
            .subscribe("")
            .await
            .map_err(|err| TransportError::Connect {
                endpoint: info.iopub_endpoint(),
                message: err.to_string(),
            })?;

        let fanout = Arc::new(Fanout::new());
        let mut outbound = HashMap::new();
        let mut tasks = Vec::new();
        for (channel, socket) in [
            (Channel::Shell, shell),
            (Channel::Control, control),
            (Channel::Stdin, stdin),
        ] {
            let (tx, rx) = mpsc::unbounded_channel();
            outbound.insert(channel, tx);
            tasks.push(tokio::spawn(dealer_pump(
                socket,
                channel,
                signer.clone(),
                fanout.clone(),
                rx,
            )));
        }
        tasks.push(tokio::spawn(iopub_pump(iopub, signer.clone(), fanout.clone())));
        if !options.heartbeat_interval.is_zero() {
            tasks.push(tokio::spawn(heartbeat_loop(
                info.heartbeat_endpoint(),
                options.heartbeat_interval,
            )));
        }
        debug!(
            event = "kernel_channels_connected",
            transport = "zmq",
            identity,
            shell = %info.shell_endpoint()
        );

        Ok(Self {
            identity: identity.to_string(),
            signer,
            outbound,
            fanout,
            tasks: Mutex::new(tasks),
        })
    }
}

#[async_trait]
impl ChannelHandle for LocalChannelHandle {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send(&self, message: JupyterMessage) -> Result<(), TransportError> {
        if self.fanout.is_closed() {
            return Err(TransportError::Closed);
        }
        let message = message.with_session(&self.identity);
        let channel = message.target_channel();
        let tx = self
            .outbound
            .get(&channel)
            .ok_or_else(|| TransportError::Send {
                channel: channel.to_string(),
                message: "channel is receive-only".to_string(),
            })?;
        let frames = encode_zmq_frames(&message, &self.signer)?;
        tx.send(to_zmq_message(frames))
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, channel: Channel) -> MessageStream {
        self.fanout.subscribe(channel)
    }

    async fn complete(&self) {
        if !self.fanout.close() {
            return;
        }
        let tasks = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        debug!(event = "kernel_channels_closed", transport = "zmq", identity = %self.identity);
    }

    fn is_closed(&self) -> bool {
        self.fanout.is_closed()
    }
}

impl Drop for LocalChannelHandle {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn to_zmq_message(frames: Vec<Bytes>) -> ZmqMessage {
    let mut frames = frames.into_iter();
    let mut message = ZmqMessage::from(frames.next().unwrap_or_default());
    for frame in frames {
        message.push_back(frame);
    }
    message
}

/// Kernels bind their sockets a moment after the process starts. Failed
/// connects are retried with backoff and every attempt is bounded by
/// `deadline`.
async fn connect_socket<S: Socket>(endpoint: &str, deadline: Instant) -> Result<S, TransportError> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let mut socket = S::new();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = match tokio::time::timeout(remaining, socket.connect(endpoint)).await {
            Ok(Ok(())) => return Ok(socket),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "timed out".to_string(),
        };
        if Instant::now() + backoff > deadline {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                message,
            });
        }
        debug!(event = "kernel_socket_retry", endpoint, error = %message);
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}

fn deliver(frames: ZmqMessage, channel: Channel, signer: &MessageSigner, fanout: &Fanout) {
    match decode_zmq_frames(&frames.into_vec(), channel, signer) {
        Ok(message) => fanout.publish(channel, message),
        Err(err) => {
            warn!(event = "kernel_message_rejected", channel = %channel, error = %err);
        }
    }
}

async fn dealer_pump(
    mut socket: DealerSocket,
    channel: Channel,
    signer: MessageSigner,
    fanout: Arc<Fanout>,
    mut outbound: mpsc::UnboundedReceiver<ZmqMessage>,
) {
    loop {
        tokio::select! {
            received = socket.recv() => {
                match received {
                    Ok(frames) => deliver(frames, channel, &signer, &fanout),
                    Err(err) => {
                        warn!(event = "kernel_socket_recv_failed", channel = %channel, error = %err);
                        break;
                    }
                }
            }
            next = outbound.recv() => {
                let Some(frames) = next else {
                    break;
                };
                if let Err(err) = socket.send(frames).await {
                    warn!(event = "kernel_socket_send_failed", channel = %channel, error = %err);
                }
            }
        }
    }
}

async fn iopub_pump(mut socket: SubSocket, signer: MessageSigner, fanout: Arc<Fanout>) {
    loop {
        match socket.recv().await {
            Ok(frames) => deliver(frames, Channel::Iopub, &signer, &fanout),
            Err(err) => {
                warn!(event = "kernel_socket_recv_failed", channel = "iopub", error = %err);
                break;
            }
        }
    }
}

/// Pings the heartbeat port. Misses are logged only; process events stay
/// authoritative for status. A REQ socket is unusable after a missed reply,
/// so it is rebuilt.
async fn heartbeat_loop(endpoint: String, interval: Duration) {
    let mut socket: Option<ReqSocket> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mut current = match socket.take() {
            Some(current) => current,
            None => {
                let mut fresh = ReqSocket::new();
                match tokio::time::timeout(interval, fresh.connect(&endpoint)).await {
                    Ok(Ok(())) => fresh,
                    Ok(Err(err)) => {
                        warn!(event = "kernel_heartbeat_missed", endpoint = %endpoint, error = %err);
                        continue;
                    }
                    Err(_) => {
                        warn!(event = "kernel_heartbeat_missed", endpoint = %endpoint, error = "connect timed out");
                        continue;
                    }
                }
            }
        };
        if let Err(err) = current
            .send(ZmqMessage::from(Bytes::from_static(HEARTBEAT_PING)))
            .await
        {
            warn!(event = "kernel_heartbeat_missed", endpoint = %endpoint, error = %err);
            continue;
        }
        match tokio::time::timeout(interval, current.recv()).await {
            Ok(Ok(_)) => socket = Some(current),
            Ok(Err(err)) => {
                warn!(event = "kernel_heartbeat_missed", endpoint = %endpoint, error = %err);
            }
            Err(_) => {
                warn!(event = "kernel_heartbeat_missed", endpoint = %endpoint, timeout_ms = interval.as_millis() as u64);
            }
        }
    }
}
