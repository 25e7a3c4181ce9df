use crate::config::KernelConfig;
use crate::connection::ConnectionFile;
use crate::error::{InterruptError, KernelInfoError, KillError, LaunchError, ShutdownTimeoutError};
use crate::kernelspec::KernelSpecification;
use crate::launcher::{self, LaunchedProcess, ProcessHandle};
use crate::notification::{
    KernelRef, KernelStatus, KernelSummary, LifecycleNotification, Notifier, TransportKind,
};
use crate::transport::{
    ChannelConnector, ChannelHandle, ConnectTarget, MessageStream, RemoteKernel,
    RemoteKernelClient,
};
use chrono::{DateTime, Utc};
use nteract_messaging::{
    child_of, execution_state, interrupt_request, kernel_info_request, language_info,
    of_message_type, shutdown_request, Channel,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kernelspec `interrupt_mode` asking for `interrupt_request` on control
/// instead of a signal.
const MESSAGE_INTERRUPT_MODE: &str = "message";

/// Current status of one session plus the time the kernel was last heard
/// from. Every announcement goes through one lock, so a kernel-reported
/// state can never land after the session has started closing or after
/// the process or channels are gone.
#[derive(Debug)]
pub struct StatusTracker {
    status: watch::Sender<KernelStatus>,
    state: Mutex<TrackerState>,
    notifier: Notifier,
}

#[derive(Debug)]
struct TrackerState {
    last_activity: DateTime<Utc>,
    /// Set by shutdown, kill and restart; never by the kernel.
    closing: bool,
    /// Set once the process has ended or the channels were lost.
    ended: bool,
}

impl StatusTracker {
    fn new(notifier: Notifier) -> Self {
        let (status, _) = watch::channel(KernelStatus::Launching);
        Self {
            status,
            state: Mutex::new(TrackerState {
                last_activity: Utc::now(),
                closing: false,
                ended: false,
            }),
            notifier,
        }
    }

    pub fn current(&self) -> KernelStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<KernelStatus> {
        self.status.subscribe()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state().last_activity
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.state().last_activity = Utc::now();
    }

    /// Marks the session as being replaced by a restart.
    pub(crate) fn mark_restarting(&self) {
        self.begin_teardown(KernelStatus::Restarting);
    }

    fn begin_teardown(&self, status: KernelStatus) {
        let mut state = self.state();
        state.closing = true;
        self.announce(status);
    }

    fn set(&self, status: KernelStatus) {
        let _state = self.state();
        self.announce(status);
    }

    fn announce(&self, status: KernelStatus) {
        self.status.send_replace(status);
        self.notifier
            .emit(LifecycleNotification::StatusChanged(status));
    }

    /// Applies a status the kernel reported on iopub.
    fn apply_kernel_status(&self, status: KernelStatus) {
        let state = self.state();
        if state.closing || state.ended {
            return;
        }
        self.announce(status);
    }

    /// Records that the process or channels are gone. During teardown the
    /// status is only recorded. Returns whether it was announced.
    fn end(&self, status: KernelStatus) -> bool {
        let mut state = self.state();
        if state.ended {
            return false;
        }
        state.ended = true;
        if state.closing {
            self.status.send_replace(status);
            return false;
        }
        self.announce(status);
        true
    }

    /// Emits a session notification unless the kernel is already gone.
    fn emit_while_alive(&self, event: LifecycleNotification) {
        let state = self.state();
        if !state.ended {
            self.notifier.emit(event);
        }
    }
}

/// Resources a session owns exclusively, by transport.
#[derive(Debug)]
pub enum SessionBackend {
    Local {
        process: ProcessHandle,
        connection: ConnectionFile,
    },
    Remote {
        client: RemoteKernelClient,
        kernel: RemoteKernel,
    },
}

impl SessionBackend {
    pub fn transport(&self) -> TransportKind {
        match self {
            SessionBackend::Local { .. } => TransportKind::LocalProcess,
            SessionBackend::Remote { .. } => TransportKind::RemoteWebsocket,
        }
    }

    /// The single place interrupt capability is decided. Local kernels get
    /// SIGINT unless their kernelspec asks for a control message; remote
    /// kernels go through the server's interrupt endpoint.
    async fn interrupt(
        &self,
        interrupt_mode: Option<&str>,
        channels: &dyn ChannelHandle,
    ) -> Result<(), InterruptError> {
        match self {
            SessionBackend::Local { process, .. } => {
                if interrupt_mode == Some(MESSAGE_INTERRUPT_MODE) {
                    channels.send(interrupt_request()).await?;
                    return Ok(());
                }
                signal_interrupt(process).await
            }
            SessionBackend::Remote { client, kernel } => {
                client.interrupt(&kernel.id).await?;
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
async fn signal_interrupt(process: &ProcessHandle) -> Result<(), InterruptError> {
    process.interrupt().await.map_err(InterruptError::from)
}

#[cfg(not(unix))]
async fn signal_interrupt(_process: &ProcessHandle) -> Result<(), InterruptError> {
    Err(InterruptError::Unsupported(
        "signal interrupts require a unix platform".to_string(),
    ))
}

/// One live kernel: its channels, its process or remote kernel, and the
/// background tasks observing them. Dropping a session without `shutdown`
/// or `kill` still kills a local process, but leaks its connection file.
#[derive(Debug)]
pub struct KernelSession {
    kernel_ref: KernelRef,
    identity: String,
    spec: KernelSpecification,
    cwd: PathBuf,
    channels: Arc<dyn ChannelHandle>,
    backend: SessionBackend,
    tracker: Arc<StatusTracker>,
    created_at: DateTime<Utc>,
    tasks: Vec<JoinHandle<()>>,
    notifier: Notifier,
    shutdown_timeout: Duration,
    kernel_info_timeout: Duration,
}

impl KernelSession {
    /// Spawns a local kernel process and attaches to its channels. A process
    /// that ends before the channels come up fails the launch.
    pub async fn launch_local(
        spec: KernelSpecification,
        cwd: &Path,
        config: &KernelConfig,
        connector: &dyn ChannelConnector,
        notifier: &Notifier,
    ) -> Result<Self, LaunchError> {
        let identity = Uuid::new_v4().to_string();
        let notifier = notifier.with_session(&identity);
        let LaunchedProcess {
            process,
            connection,
            ..
        } = launcher::launch(&spec, cwd, config, &notifier).await?;

        let connected = tokio::select! {
            result = connector.connect(ConnectTarget::Local(connection.info()), &identity) => {
                result.map_err(LaunchError::from)
            }
            _ = process.finished() => Err(LaunchError::ExitedDuringStartup {
                name: spec.name.clone(),
            }),
        };
        let channels = match connected {
            Ok(channels) => channels,
            Err(err) => {
                if let Err(kill_err) = process.terminate().await {
                    warn!(event = "kernel_launch_cleanup_failed", kernel = %spec.name, error = %kill_err);
                }
                if let Err(delete_err) = connection.delete().await {
                    warn!(event = "kernel_launch_cleanup_failed", kernel = %spec.name, error = %delete_err);
                }
                return Err(err);
            }
        };

        let mut session = Self::assemble(
            notifier,
            identity,
            spec,
            cwd,
            channels,
            SessionBackend::Local {
                process,
                connection,
            },
            config,
        );
        session.start();
        Ok(session)
    }

    /// Starts a kernel on a Jupyter server and attaches to its websocket.
    pub async fn launch_remote(
        kernelspec_name: &str,
        cwd: &Path,
        client: RemoteKernelClient,
        config: &KernelConfig,
        connector: &dyn ChannelConnector,
        notifier: &Notifier,
    ) -> Result<Self, LaunchError> {
        let identity = Uuid::new_v4().to_string();
        let notifier = notifier.with_session(&identity);
        let kernel = client.start(kernelspec_name, cwd).await?;
        let target = ConnectTarget::Remote {
            client: &client,
            kernel_id: &kernel.id,
        };
        let channels = match connector.connect(target, &identity).await {
            Ok(channels) => channels,
            Err(err) => {
                if let Err(kill_err) = client.kill(&kernel.id).await {
                    warn!(event = "kernel_launch_cleanup_failed", kernel_id = %kernel.id, error = %kill_err);
                }
                return Err(err.into());
            }
        };

        let spec = KernelSpecification::new(kernel.name.clone(), String::new(), Vec::new());
        let mut session = Self::assemble(
            notifier,
            identity,
            spec,
            cwd,
            channels,
            SessionBackend::Remote { client, kernel },
            config,
        );
        session.start();
        Ok(session)
    }

    fn assemble(
        notifier: Notifier,
        identity: String,
        spec: KernelSpecification,
        cwd: &Path,
        channels: Arc<dyn ChannelHandle>,
        backend: SessionBackend,
        config: &KernelConfig,
    ) -> Self {
        Self {
            kernel_ref: notifier.kernel_ref(),
            identity,
            spec,
            cwd: cwd.to_path_buf(),
            channels,
            backend,
            tracker: Arc::new(StatusTracker::new(notifier.clone())),
            created_at: Utc::now(),
            tasks: Vec::new(),
            notifier,
            shutdown_timeout: config.shutdown_timeout,
            kernel_info_timeout: config.kernel_info_timeout,
        }
    }

    /// Announces the session, then starts status tracking and the
    /// kernel_info handshake. Both streams are subscribed before anything
    /// is sent.
    fn start(&mut self) {
        let iopub = self.channels.subscribe(Channel::Iopub);
        let shell = self.channels.subscribe(Channel::Shell);
        let summary = self.summary();
        info!(
            event = "kernel_launched",
            kernel_ref = %self.kernel_ref,
            kernel = %self.spec.name,
            transport = %summary.transport,
            identity = %self.identity
        );
        self.notifier.emit(LifecycleNotification::Launched(summary));
        self.tracker.set(KernelStatus::Launched);

        self.tasks
            .push(tokio::spawn(track_status(iopub, self.tracker.clone())));
        let handshake = tokio::spawn(kernel_info_handshake(
            self.channels.clone(),
            shell,
            self.kernel_info_timeout,
            self.tracker.clone(),
        ));
        if let SessionBackend::Local { process, .. } = &self.backend {
            self.tasks.push(tokio::spawn(watch_process_exit(
                process.status_watch(),
                self.tracker.clone(),
                handshake.abort_handle(),
            )));
        }
        self.tasks.push(handshake);
    }

    pub fn kernel_ref(&self) -> KernelRef {
        self.kernel_ref
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn spec(&self) -> &KernelSpecification {
        &self.spec
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn transport(&self) -> TransportKind {
        self.backend.transport()
    }

    pub fn status(&self) -> KernelStatus {
        self.tracker.current()
    }

    pub fn tracker(&self) -> Arc<StatusTracker> {
        self.tracker.clone()
    }

    pub fn channels(&self) -> Arc<dyn ChannelHandle> {
        self.channels.clone()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn remote_client(&self) -> Option<&RemoteKernelClient> {
        match &self.backend {
            SessionBackend::Remote { client, .. } => Some(client),
            SessionBackend::Local { .. } => None,
        }
    }

    pub fn summary(&self) -> KernelSummary {
        let (pid, connection_file, remote_id) = match &self.backend {
            SessionBackend::Local {
                process,
                connection,
            } => (
                process.pid(),
                Some(connection.path().to_path_buf()),
                None,
            ),
            SessionBackend::Remote { kernel, .. } => (None, None, Some(kernel.id.clone())),
        };
        KernelSummary {
            kernel_ref: self.kernel_ref,
            kernelspec_name: self.spec.name.clone(),
            language: self.spec.language.clone(),
            transport: self.backend.transport(),
            cwd: self.cwd.clone(),
            identity: self.identity.clone(),
            pid,
            connection_file,
            remote_id,
            created_at: self.created_at,
        }
    }

    pub async fn interrupt(&self) -> Result<(), InterruptError> {
        let result = self
            .backend
            .interrupt(self.spec.interrupt_mode.as_deref(), self.channels.as_ref())
            .await;
        match &result {
            Ok(()) => debug!(event = "kernel_interrupted", identity = %self.identity),
            Err(err) => warn!(event = "kernel_interrupt_failed", identity = %self.identity, error = %err),
        }
        result
    }

    /// Asks the kernel to shut down, waits up to the shutdown timeout for
    /// its reply, then force-releases everything no matter which side of
    /// the race won.
    pub async fn shutdown(self) {
        let request = shutdown_request(false);
        let mut shell = self.channels.subscribe(Channel::Shell);
        self.tracker.begin_teardown(KernelStatus::ShuttingDown);

        let is_child = child_of(&request);
        let is_shutdown_reply = of_message_type(["shutdown_reply"]);
        let reply = async move {
            while let Some(message) = shell.recv().await {
                if is_child(&message) && is_shutdown_reply(&message) {
                    return message;
                }
            }
            std::future::pending().await
        };
        if let Err(err) = self.channels.send(request).await {
            warn!(event = "kernel_shutdown_request_failed", identity = %self.identity, error = %err);
        }

        let timeout = self.shutdown_timeout;
        match tokio::time::timeout(timeout, reply).await {
            Ok(reply) => {
                debug!(event = "kernel_shutdown_reply", identity = %self.identity);
                self.notifier
                    .emit(LifecycleNotification::ShutdownReplySucceeded(reply.content));
            }
            Err(_) => {
                warn!(event = "kernel_shutdown_timed_out", identity = %self.identity, timeout_ms = timeout.as_millis() as u64);
                self.notifier
                    .emit(LifecycleNotification::ShutdownReplyTimedOut(
                        ShutdownTimeoutError { timeout },
                    ));
            }
        }

        let notifier = self.notifier.clone();
        if let Err(err) = self.release().await {
            notifier.emit(LifecycleNotification::KillFailed(err));
        }
    }

    /// Releases everything immediately, without asking the kernel.
    pub async fn kill(self) {
        self.tracker.begin_teardown(KernelStatus::ShuttingDown);
        let notifier = self.notifier.clone();
        match self.release().await {
            Ok(()) => notifier.emit(LifecycleNotification::KillSucceeded),
            Err(err) => notifier.emit(LifecycleNotification::KillFailed(err)),
        }
    }

    /// Closes channels, kills the process (or remote kernel) and deletes the
    /// connection file. Runs once per session since it consumes it.
    async fn release(self) -> Result<(), KillError> {
        let KernelSession {
            identity,
            channels,
            backend,
            tracker,
            tasks,
            notifier,
            ..
        } = self;
        for task in tasks {
            task.abort();
        }
        channels.complete().await;

        let result = match backend {
            SessionBackend::Local {
                process,
                connection,
            } => {
                let killed = process.terminate().await;
                let path = connection.path().to_path_buf();
                match connection.delete().await {
                    Ok(()) => notifier.emit(LifecycleNotification::ConnectionFileDeleted(path)),
                    Err(err) => {
                        notifier.emit(LifecycleNotification::ConnectionFileDeleteFailed(err))
                    }
                }
                killed.map_err(KillError::from)
            }
            SessionBackend::Remote { client, kernel } => {
                client.kill(&kernel.id).await.map_err(KillError::from)
            }
        };
        tracker.set(KernelStatus::Terminated);
        info!(event = "kernel_released", identity = %identity, ok = result.is_ok());
        result
    }
}

async fn track_status(mut iopub: MessageStream, tracker: Arc<StatusTracker>) {
    while let Some(message) = iopub.recv().await {
        tracker.touch();
        if let Some(state) = execution_state(&message) {
            tracker.apply_kernel_status(state.into());
        }
    }
    if tracker.end(KernelStatus::Disconnected) {
        warn!(event = "kernel_channels_lost");
    }
}

/// Sends kernel_info_request and waits, bounded, for the reply linked to it.
async fn kernel_info_handshake(
    channels: Arc<dyn ChannelHandle>,
    mut shell: MessageStream,
    timeout: Duration,
    tracker: Arc<StatusTracker>,
) {
    let request = kernel_info_request();
    let is_child = child_of(&request);
    let is_info_reply = of_message_type(["kernel_info_reply"]);
    if let Err(err) = channels.send(request).await {
        tracker.emit_while_alive(LifecycleNotification::KernelInfoFailed(
            KernelInfoError::Send(err),
        ));
        return;
    }

    let reply = async {
        while let Some(message) = shell.recv().await {
            if is_child(&message) && is_info_reply(&message) {
                return Some(message);
            }
        }
        None
    };
    let event = match tokio::time::timeout(timeout, reply).await {
        Ok(Some(reply)) => match language_info(&reply) {
            Ok(info) => {
                debug!(event = "kernel_info_received", language = %info.name);
                LifecycleNotification::KernelInfoReceived(info)
            }
            Err(message) => {
                LifecycleNotification::KernelInfoFailed(KernelInfoError::Malformed(message))
            }
        },
        Ok(None) => LifecycleNotification::KernelInfoFailed(KernelInfoError::ChannelClosed),
        Err(_) => {
            warn!(event = "kernel_info_timed_out", timeout_ms = timeout.as_millis() as u64);
            LifecycleNotification::KernelInfoFailed(KernelInfoError::TimedOut(timeout))
        }
    };
    tracker.emit_while_alive(event);
}

/// Announces how the kernel process ended, unless the session ended it,
/// and stops a handshake that can no longer be answered.
async fn watch_process_exit(
    mut exit: watch::Receiver<Option<KernelStatus>>,
    tracker: Arc<StatusTracker>,
    handshake: AbortHandle,
) {
    let status = match exit.wait_for(Option::is_some).await {
        Ok(status) => *status,
        Err(_) => return,
    };
    match status {
        None | Some(KernelStatus::Terminated) => {}
        Some(status) => {
            handshake.abort();
            tracker.end(status);
        }
    }
}
