//! Kernel lifecycle core: connection files, kernelspecs, process launch,
//! local and remote channel transports, the per-session state machine, and
//! the command/notification surface that drives them.

pub mod config;
pub mod connection;
pub mod error;
pub mod kernelspec;
pub mod launcher;
pub mod manager;
pub mod notification;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{KernelConfig, LogSettings, RemoteServerConfig};
pub use connection::{ConnectionFile, ConnectionInfo};
pub use error::{
    ConfigError, ConnectionFileError, InterruptError, KernelInfoError, KernelspecError,
    KillError, LaunchError, ProcessError, RestartError, ShutdownTimeoutError, TransportError,
};
pub use kernelspec::{DirectoryCatalog, KernelSpecification, KernelspecCatalog, StaticCatalog};
pub use launcher::{LaunchedProcess, ProcessHandle};
pub use manager::{KernelCommand, KernelManager};
pub use notification::{
    KernelRef, KernelStatus, KernelSummary, LifecycleNotification, Notification,
    NotificationStream, Notifier, TransportKind,
};
pub use session::{KernelSession, SessionBackend, StatusTracker};
pub use transport::{
    ChannelConnector, ChannelHandle, ConnectTarget, DefaultConnector, MessageStream,
};
