use nteract_messaging::WireError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// Errors travel inside notifications, so they carry owned strings and stay
// Clone + PartialEq.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFileError {
    #[error("failed to allocate kernel ports: {0}")]
    PortAllocation(String),
    #[error("failed to write connection file {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error("failed to read connection file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("malformed connection file {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("failed to delete connection file {path}: {message}")]
    Delete { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelspecError {
    #[error("no kernelspec named `{0}`")]
    NotFound(String),
    #[error("kernelspec `{0}` has an empty argv")]
    EmptyArgv(String),
    #[error("failed to read kernelspec {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("malformed kernelspec {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect {endpoint}: {message}")]
    Connect { endpoint: String, message: String },
    #[error("send failed on {channel}: {message}")]
    Send { channel: String, message: String },
    #[error("channels are closed")]
    Closed,
    #[error("invalid url: {0}")]
    Url(String),
    #[error("server request failed (status {status:?}): {message}")]
    Http { status: Option<u16>, message: String },
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Kernelspec(#[from] KernelspecError),
    #[error(transparent)]
    ConnectionFile(#[from] ConnectionFileError),
    #[error("failed to spawn kernel `{name}`: {message}")]
    Spawn { name: String, message: String },
    #[error("kernel `{name}` exited during startup")]
    ExitedDuringStartup { name: String },
    #[error("failed to establish kernel channels: {0}")]
    Transport(#[from] TransportError),
    #[error("no remote server configured")]
    NoServer,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("failed to signal kernel process: {0}")]
    Signal(String),
    #[error("failed to wait on kernel process: {0}")]
    Wait(String),
    #[error("kernel process is no longer running")]
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterruptError {
    #[error("no kernel session to interrupt")]
    NoSession,
    #[error("interrupt not supported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KillError {
    #[error("no kernel session to kill")]
    NoSession,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no shutdown_reply within {timeout:?}")]
pub struct ShutdownTimeoutError {
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelInfoError {
    #[error("no kernel_info_reply within {0:?}")]
    TimedOut(Duration),
    #[error("failed to send kernel_info_request: {0}")]
    Send(TransportError),
    #[error("shell channel closed before kernel_info_reply")]
    ChannelClosed,
    #[error("malformed kernel_info_reply: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestartError {
    #[error("no kernel session to restart")]
    NoSession,
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid server url `{value}`: {message}")]
    ServerUrl { value: String, message: String },
    #[error("invalid duration for {key}: {value}")]
    Duration { key: String, value: String },
}
