//! Uniform channel interface over the two kernel transports: ZMQ sockets for
//! local processes and a Jupyter server websocket for remote kernels.

pub mod remote;
pub mod zmq;

use crate::connection::ConnectionInfo;
use crate::error::TransportError;
use async_trait::async_trait;
use nteract_messaging::{Channel, JupyterMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub use remote::{RemoteChannelHandle, RemoteKernel, RemoteKernelClient};
pub use zmq::{LocalChannelHandle, ZmqOptions};

/// Incoming messages for one sub-channel, FIFO as received. Ends when the
/// handle completes; resubscribing only sees later messages.
pub type MessageStream = mpsc::UnboundedReceiver<JupyterMessage>;

#[async_trait]
pub trait ChannelHandle: Send + Sync + fmt::Debug {
    /// Session id stamped on outgoing headers.
    fn identity(&self) -> &str;

    /// Sends on shell, control or stdin as the message type dictates.
    async fn send(&self, message: JupyterMessage) -> Result<(), TransportError>;

    fn subscribe(&self, channel: Channel) -> MessageStream;

    /// Ends every subscription and releases sockets. Idempotent.
    async fn complete(&self);

    fn is_closed(&self) -> bool;
}

/// Where a connector should attach.
#[derive(Debug, Clone, Copy)]
pub enum ConnectTarget<'a> {
    Local(&'a ConnectionInfo),
    Remote {
        client: &'a RemoteKernelClient,
        kernel_id: &'a str,
    },
}

#[async_trait]
pub trait ChannelConnector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        target: ConnectTarget<'_>,
        identity: &str,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError>;
}

/// Connects local targets over ZMQ and remote targets over a websocket.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl DefaultConnector {
    pub fn new(connect_timeout: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            connect_timeout,
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl ChannelConnector for DefaultConnector {
    async fn connect(
        &self,
        target: ConnectTarget<'_>,
        identity: &str,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        match target {
            ConnectTarget::Local(info) => {
                let options = ZmqOptions {
                    connect_timeout: self.connect_timeout,
                    heartbeat_interval: self.heartbeat_interval,
                };
                let handle = LocalChannelHandle::connect(info, identity, options).await?;
                Ok(Arc::new(handle))
            }
            ConnectTarget::Remote { client, kernel_id } => {
                let handle = RemoteChannelHandle::connect(client, kernel_id, identity).await?;
                Ok(Arc::new(handle))
            }
        }
    }
}

/// Per-channel subscriber registry shared by both transports.
#[derive(Debug, Default)]
pub struct Fanout {
    state: Mutex<FanoutState>,
}

#[derive(Debug, Default)]
struct FanoutState {
    closed: bool,
    subscribers: HashMap<Channel, Vec<mpsc::UnboundedSender<JupyterMessage>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FanoutState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, channel: Channel) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            state.subscribers.entry(channel).or_default().push(tx);
        }
        rx
    }

    /// Delivers to every live subscriber of `channel`, pruning closed ones.
    pub fn publish(&self, channel: Channel, message: JupyterMessage) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(subscribers) = state.subscribers.get_mut(&channel) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    /// Drops every sender so all streams end. Returns false if already closed.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.subscribers.clear();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
