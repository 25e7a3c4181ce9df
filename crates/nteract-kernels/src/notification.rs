use crate::error::{
    ConnectionFileError, InterruptError, KernelInfoError, KillError, LaunchError, RestartError,
    ShutdownTimeoutError,
};
use chrono::{DateTime, Utc};
use nteract_messaging::{ExecutionState, LanguageInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Names one user-facing kernel slot. Every command carries the ref it
/// targets; a slot holds at most one current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelRef(Uuid);

impl KernelRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for KernelRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KernelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for KernelRef {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(input.trim())
            .map(Self)
            .map_err(|err| format!("Invalid kernel ref: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    LocalProcess,
    RemoteWebsocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalProcess => "local-process",
            TransportKind::RemoteWebsocket => "remote-websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Launching,
    Launched,
    Starting,
    Idle,
    Busy,
    Restarting,
    /// The kernel (or its server) reported itself dead. Not terminal for
    /// the session: a server may still bring the kernel back.
    Dead,
    ShuttingDown,
    Errored,
    Exited,
    Disconnected,
    Terminated,
}

impl KernelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelStatus::Launching => "launching",
            KernelStatus::Launched => "launched",
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Restarting => "restarting",
            KernelStatus::Dead => "dead",
            KernelStatus::ShuttingDown => "shutting down",
            KernelStatus::Errored => "errored",
            KernelStatus::Exited => "exited",
            KernelStatus::Disconnected => "disconnected",
            KernelStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KernelStatus::Errored
                | KernelStatus::Exited
                | KernelStatus::Disconnected
                | KernelStatus::Terminated
        )
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().replace('_', " ").as_str() {
            "launching" => Ok(KernelStatus::Launching),
            "launched" => Ok(KernelStatus::Launched),
            "starting" => Ok(KernelStatus::Starting),
            "idle" => Ok(KernelStatus::Idle),
            "busy" => Ok(KernelStatus::Busy),
            "restarting" => Ok(KernelStatus::Restarting),
            "dead" => Ok(KernelStatus::Dead),
            "shutting down" => Ok(KernelStatus::ShuttingDown),
            "errored" => Ok(KernelStatus::Errored),
            "exited" => Ok(KernelStatus::Exited),
            "disconnected" => Ok(KernelStatus::Disconnected),
            "terminated" => Ok(KernelStatus::Terminated),
            other => Err(format!("Unknown kernel status: {other}")),
        }
    }
}

impl From<ExecutionState> for KernelStatus {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Restarting => KernelStatus::Restarting,
            ExecutionState::Dead => KernelStatus::Dead,
        }
    }
}

/// Everything a presentation layer needs to describe a freshly launched
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSummary {
    pub kernel_ref: KernelRef,
    pub kernelspec_name: String,
    pub language: String,
    pub transport: TransportKind,
    pub cwd: PathBuf,
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotification {
    Launched(KernelSummary),
    KernelInfoReceived(LanguageInfo),
    KernelInfoFailed(KernelInfoError),
    StatusChanged(KernelStatus),
    Stdout(String),
    Stderr(String),
    LaunchFailed(LaunchError),
    InterruptSucceeded,
    InterruptFailed(InterruptError),
    KillSucceeded,
    KillFailed(KillError),
    ShutdownReplySucceeded(Value),
    ShutdownReplyTimedOut(ShutdownTimeoutError),
    ConnectionFileDeleted(PathBuf),
    ConnectionFileDeleteFailed(ConnectionFileError),
    RestartSucceeded { clear_outputs: bool },
    RestartFailed(RestartError),
}

impl LifecycleNotification {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleNotification::Launched(_) => "launched",
            LifecycleNotification::KernelInfoReceived(_) => "kernel_info_received",
            LifecycleNotification::KernelInfoFailed(_) => "kernel_info_failed",
            LifecycleNotification::StatusChanged(_) => "status_changed",
            LifecycleNotification::Stdout(_) => "stdout",
            LifecycleNotification::Stderr(_) => "stderr",
            LifecycleNotification::LaunchFailed(_) => "launch_failed",
            LifecycleNotification::InterruptSucceeded => "interrupt_succeeded",
            LifecycleNotification::InterruptFailed(_) => "interrupt_failed",
            LifecycleNotification::KillSucceeded => "kill_succeeded",
            LifecycleNotification::KillFailed(_) => "kill_failed",
            LifecycleNotification::ShutdownReplySucceeded(_) => "shutdown_reply_succeeded",
            LifecycleNotification::ShutdownReplyTimedOut(_) => "shutdown_reply_timed_out",
            LifecycleNotification::ConnectionFileDeleted(_) => "connection_file_deleted",
            LifecycleNotification::ConnectionFileDeleteFailed(_) => {
                "connection_file_delete_failed"
            }
            LifecycleNotification::RestartSucceeded { .. } => "restart_succeeded",
            LifecycleNotification::RestartFailed(_) => "restart_failed",
        }
    }
}

/// A lifecycle event scoped to the slot and session that produced it.
/// `session_id` is `None` for events raised before a session exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kernel_ref: KernelRef,
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
    pub event: LifecycleNotification,
}

pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

/// Emits notifications for one slot, optionally tagged with a session
/// identity. Sends after the receiver is gone are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    kernel_ref: KernelRef,
    session_id: Option<String>,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new(kernel_ref: KernelRef, tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            kernel_ref,
            session_id: None,
            tx,
        }
    }

    pub fn channel(kernel_ref: KernelRef) -> (Self, NotificationStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(kernel_ref, tx), rx)
    }

    pub fn with_session(&self, session_id: &str) -> Self {
        Self {
            kernel_ref: self.kernel_ref,
            session_id: Some(session_id.to_string()),
            tx: self.tx.clone(),
        }
    }

    pub fn kernel_ref(&self) -> KernelRef {
        self.kernel_ref
    }

    pub fn emit(&self, event: LifecycleNotification) {
        let _ = self.tx.send(Notification {
            kernel_ref: self.kernel_ref,
            session_id: self.session_id.clone(),
            at: Utc::now(),
            event,
        });
    }
}
