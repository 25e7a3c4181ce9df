//! Command surface: every command names the [`KernelRef`] it targets, and
//! each ref owns one slot actor holding at most one current session.
//!
//! Slots run commands one at a time, which serializes interrupts and keeps
//! launch, restart and teardown from interleaving. Retired sessions shut
//! down on their own task so a relaunch never waits for the old kernel.

use crate::config::KernelConfig;
use crate::error::{InterruptError, KillError, LaunchError, RestartError, TransportError};
use crate::kernelspec::{KernelSpecification, KernelspecCatalog};
use crate::notification::{
    KernelRef, KernelStatus, KernelSummary, LifecycleNotification, Notification,
    NotificationStream, Notifier,
};
use crate::session::KernelSession;
use crate::transport::{ChannelConnector, DefaultConnector, MessageStream, RemoteKernelClient};
use nteract_messaging::{Channel, JupyterMessage};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum KernelCommand {
    LaunchByName {
        kernel_ref: KernelRef,
        name: String,
        cwd: PathBuf,
    },
    Launch {
        kernel_ref: KernelRef,
        spec: KernelSpecification,
        cwd: PathBuf,
    },
    LaunchRemote {
        kernel_ref: KernelRef,
        name: String,
        cwd: PathBuf,
    },
    Interrupt {
        kernel_ref: KernelRef,
    },
    Kill {
        kernel_ref: KernelRef,
    },
    Shutdown {
        kernel_ref: KernelRef,
    },
    Restart {
        kernel_ref: KernelRef,
        clear_outputs: bool,
    },
}

impl KernelCommand {
    pub fn kernel_ref(&self) -> KernelRef {
        match self {
            KernelCommand::LaunchByName { kernel_ref, .. }
            | KernelCommand::Launch { kernel_ref, .. }
            | KernelCommand::LaunchRemote { kernel_ref, .. }
            | KernelCommand::Interrupt { kernel_ref }
            | KernelCommand::Kill { kernel_ref }
            | KernelCommand::Shutdown { kernel_ref }
            | KernelCommand::Restart { kernel_ref, .. } => *kernel_ref,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KernelCommand::LaunchByName { .. } => "launch_by_name",
            KernelCommand::Launch { .. } => "launch",
            KernelCommand::LaunchRemote { .. } => "launch_remote",
            KernelCommand::Interrupt { .. } => "interrupt",
            KernelCommand::Kill { .. } => "kill",
            KernelCommand::Shutdown { .. } => "shutdown",
            KernelCommand::Restart { .. } => "restart",
        }
    }
}

enum SlotRequest {
    Command(KernelCommand),
    Send {
        message: JupyterMessage,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Subscribe {
        channel: Channel,
        reply: oneshot::Sender<Option<MessageStream>>,
    },
    Describe {
        reply: oneshot::Sender<Option<(KernelSummary, KernelStatus)>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct ManagerInner {
    config: KernelConfig,
    catalog: Arc<dyn KernelspecCatalog>,
    connector: Arc<dyn ChannelConnector>,
    notifications: mpsc::UnboundedSender<Notification>,
    slots: Mutex<HashMap<KernelRef, mpsc::UnboundedSender<SlotRequest>>>,
}

/// Entry point for embedding applications. Cheap to clone; all clones share
/// the same slots and notification stream.
#[derive(Clone)]
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManager")
            .field("config", &self.inner.config)
            .field("slots", &self.lock_slots().len())
            .finish()
    }
}

impl KernelManager {
    /// Builds a manager that talks ZMQ to local kernels and websockets to
    /// remote ones. The returned stream carries every slot's notifications.
    pub fn new(
        config: KernelConfig,
        catalog: Arc<dyn KernelspecCatalog>,
    ) -> (Self, NotificationStream) {
        let connector = Arc::new(DefaultConnector::new(
            config.connect_timeout,
            config.heartbeat_interval,
        ));
        Self::with_connector(config, catalog, connector)
    }

    pub fn with_connector(
        config: KernelConfig,
        catalog: Arc<dyn KernelspecCatalog>,
        connector: Arc<dyn ChannelConnector>,
    ) -> (Self, NotificationStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                catalog,
                connector,
                notifications: tx,
                slots: Mutex::new(HashMap::new()),
            }),
        };
        (manager, rx)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    fn lock_slots(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<KernelRef, mpsc::UnboundedSender<SlotRequest>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, kernel_ref: KernelRef) -> mpsc::UnboundedSender<SlotRequest> {
        let mut slots = self.lock_slots();
        if let Some(tx) = slots.get(&kernel_ref) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SlotActor {
            kernel_ref,
            notifier: Notifier::new(kernel_ref, self.inner.notifications.clone()),
            config: self.inner.config.clone(),
            catalog: self.inner.catalog.clone(),
            connector: self.inner.connector.clone(),
            current: None,
            teardowns: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        slots.insert(kernel_ref, tx.clone());
        tx
    }

    fn existing_slot(&self, kernel_ref: KernelRef) -> Option<mpsc::UnboundedSender<SlotRequest>> {
        self.lock_slots()
            .get(&kernel_ref)
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    /// Queues `command` on its slot. Outcomes arrive as notifications.
    pub fn dispatch(&self, command: KernelCommand) {
        debug!(event = "kernel_command", command = command.name(), kernel_ref = %command.kernel_ref());
        let tx = self.slot(command.kernel_ref());
        if tx.send(SlotRequest::Command(command)).is_err() {
            warn!(event = "kernel_command_dropped");
        }
    }

    pub fn launch_by_name(&self, kernel_ref: KernelRef, name: &str, cwd: &Path) {
        self.dispatch(KernelCommand::LaunchByName {
            kernel_ref,
            name: name.to_string(),
            cwd: cwd.to_path_buf(),
        });
    }

    pub fn launch(&self, kernel_ref: KernelRef, spec: KernelSpecification, cwd: &Path) {
        self.dispatch(KernelCommand::Launch {
            kernel_ref,
            spec,
            cwd: cwd.to_path_buf(),
        });
    }

    pub fn launch_remote(&self, kernel_ref: KernelRef, name: &str, cwd: &Path) {
        self.dispatch(KernelCommand::LaunchRemote {
            kernel_ref,
            name: name.to_string(),
            cwd: cwd.to_path_buf(),
        });
    }

    pub fn interrupt(&self, kernel_ref: KernelRef) {
        self.dispatch(KernelCommand::Interrupt { kernel_ref });
    }

    pub fn kill(&self, kernel_ref: KernelRef) {
        self.dispatch(KernelCommand::Kill { kernel_ref });
    }

    pub fn shutdown(&self, kernel_ref: KernelRef) {
        self.dispatch(KernelCommand::Shutdown { kernel_ref });
    }

    pub fn restart(&self, kernel_ref: KernelRef, clear_outputs: bool) {
        self.dispatch(KernelCommand::Restart {
            kernel_ref,
            clear_outputs,
        });
    }

    /// Forwards a request to the slot's current session. Waits behind any
    /// command already queued on the slot.
    pub async fn send(
        &self,
        kernel_ref: KernelRef,
        message: JupyterMessage,
    ) -> Result<(), TransportError> {
        let Some(slot) = self.existing_slot(kernel_ref) else {
            return Err(TransportError::Closed);
        };
        let (reply, rx) = oneshot::channel();
        if slot.send(SlotRequest::Send { message, reply }).is_err() {
            return Err(TransportError::Closed);
        }
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Stream of `channel` on the slot's current session, if any. The stream
    /// ends when that session is torn down.
    pub async fn subscribe(&self, kernel_ref: KernelRef, channel: Channel) -> Option<MessageStream> {
        let slot = self.existing_slot(kernel_ref)?;
        let (reply, rx) = oneshot::channel();
        slot.send(SlotRequest::Subscribe { channel, reply }).ok()?;
        rx.await.ok().flatten()
    }

    async fn describe(&self, kernel_ref: KernelRef) -> Option<(KernelSummary, KernelStatus)> {
        let slot = self.existing_slot(kernel_ref)?;
        let (reply, rx) = oneshot::channel();
        slot.send(SlotRequest::Describe { reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn status(&self, kernel_ref: KernelRef) -> Option<KernelStatus> {
        self.describe(kernel_ref).await.map(|(_, status)| status)
    }

    pub async fn summary(&self, kernel_ref: KernelRef) -> Option<KernelSummary> {
        self.describe(kernel_ref).await.map(|(summary, _)| summary)
    }

    /// Gracefully shuts down every slot and waits until each has released
    /// its kernels, retired ones included.
    pub async fn shutdown_all(&self) {
        let slots: Vec<_> = self.lock_slots().drain().collect();
        let mut pending = Vec::new();
        for (kernel_ref, slot) in slots {
            let (reply, rx) = oneshot::channel();
            if slot.send(SlotRequest::Close { reply }).is_ok() {
                pending.push((kernel_ref, rx));
            }
        }
        for (kernel_ref, rx) in pending {
            if rx.await.is_err() {
                warn!(event = "kernel_slot_close_lost", kernel_ref = %kernel_ref);
            }
        }
        info!(event = "kernel_manager_shutdown");
    }
}

enum LaunchTarget {
    Local(KernelSpecification),
    Remote {
        client: RemoteKernelClient,
        name: String,
    },
}

struct SlotActor {
    kernel_ref: KernelRef,
    notifier: Notifier,
    config: KernelConfig,
    catalog: Arc<dyn KernelspecCatalog>,
    connector: Arc<dyn ChannelConnector>,
    current: Option<KernelSession>,
    teardowns: Vec<JoinHandle<()>>,
}

impl SlotActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SlotRequest>) {
        while let Some(request) = rx.recv().await {
            self.teardowns.retain(|teardown| !teardown.is_finished());
            match request {
                SlotRequest::Command(command) => self.handle(command).await,
                SlotRequest::Send { message, reply } => {
                    let result = match &self.current {
                        Some(session) => session.channels().send(message).await,
                        None => Err(TransportError::Closed),
                    };
                    let _ = reply.send(result);
                }
                SlotRequest::Subscribe { channel, reply } => {
                    let stream = self
                        .current
                        .as_ref()
                        .map(|session| session.channels().subscribe(channel));
                    let _ = reply.send(stream);
                }
                SlotRequest::Describe { reply } => {
                    let described = self
                        .current
                        .as_ref()
                        .map(|session| (session.summary(), session.status()));
                    let _ = reply.send(described);
                }
                SlotRequest::Close { reply } => {
                    self.close().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.close().await;
    }

    async fn handle(&mut self, command: KernelCommand) {
        match command {
            KernelCommand::LaunchByName { name, cwd, .. } => {
                match self.catalog.lookup(&name).await {
                    Ok(spec) => self.launch_reporting(LaunchTarget::Local(spec), cwd).await,
                    Err(err) => {
                        warn!(event = "kernel_launch_failed", kernel_ref = %self.kernel_ref, kernel = %name, error = %err);
                        self.notifier
                            .emit(LifecycleNotification::LaunchFailed(err.into()));
                    }
                }
            }
            KernelCommand::Launch { spec, cwd, .. } => {
                self.launch_reporting(LaunchTarget::Local(spec), cwd).await
            }
            KernelCommand::LaunchRemote { name, cwd, .. } => match self.config.server.clone() {
                Some(server) => {
                    let client = RemoteKernelClient::new(server);
                    self.launch_reporting(LaunchTarget::Remote { client, name }, cwd)
                        .await
                }
                None => self
                    .notifier
                    .emit(LifecycleNotification::LaunchFailed(LaunchError::NoServer)),
            },
            KernelCommand::Interrupt { .. } => match &self.current {
                Some(session) => match session.interrupt().await {
                    Ok(()) => session
                        .notifier()
                        .emit(LifecycleNotification::InterruptSucceeded),
                    Err(err) => session
                        .notifier()
                        .emit(LifecycleNotification::InterruptFailed(err)),
                },
                None => self.notifier.emit(LifecycleNotification::InterruptFailed(
                    InterruptError::NoSession,
                )),
            },
            KernelCommand::Kill { .. } => match self.current.take() {
                Some(session) => session.kill().await,
                None => self
                    .notifier
                    .emit(LifecycleNotification::KillFailed(KillError::NoSession)),
            },
            KernelCommand::Shutdown { .. } => match self.current.take() {
                Some(session) => session.shutdown().await,
                None => self
                    .notifier
                    .emit(LifecycleNotification::KillFailed(KillError::NoSession)),
            },
            KernelCommand::Restart { clear_outputs, .. } => self.restart(clear_outputs).await,
        }
    }

    async fn launch_reporting(&mut self, target: LaunchTarget, cwd: PathBuf) {
        if let Err(err) = self.launch(target, cwd).await {
            warn!(event = "kernel_launch_failed", kernel_ref = %self.kernel_ref, error = %err);
            self.notifier.emit(LifecycleNotification::LaunchFailed(err));
        }
    }

    /// Retires the current session onto its own teardown task, then brings
    /// up the replacement. The two never share a process or connection file.
    async fn launch(&mut self, target: LaunchTarget, cwd: PathBuf) -> Result<(), LaunchError> {
        if let Some(previous) = self.current.take() {
            debug!(event = "kernel_session_retired", kernel_ref = %self.kernel_ref, identity = %previous.identity());
            self.teardowns.push(tokio::spawn(previous.shutdown()));
        }
        let connector = self.connector.as_ref();
        let session = match target {
            LaunchTarget::Local(spec) => {
                KernelSession::launch_local(spec, &cwd, &self.config, connector, &self.notifier)
                    .await?
            }
            LaunchTarget::Remote { client, name } => {
                KernelSession::launch_remote(
                    &name,
                    &cwd,
                    client,
                    &self.config,
                    connector,
                    &self.notifier,
                )
                .await?
            }
        };
        self.current = Some(session);
        Ok(())
    }

    /// Shuts the current session down completely, then relaunches it from
    /// the same kernelspec and directory.
    async fn restart(&mut self, clear_outputs: bool) {
        let Some(previous) = self.current.take() else {
            self.notifier
                .emit(LifecycleNotification::RestartFailed(RestartError::NoSession));
            return;
        };
        let cwd = previous.cwd().to_path_buf();
        let target = match previous.remote_client() {
            Some(client) => LaunchTarget::Remote {
                client: client.clone(),
                name: previous.spec().name.clone(),
            },
            None => LaunchTarget::Local(previous.spec().clone()),
        };
        info!(event = "kernel_restarting", kernel_ref = %self.kernel_ref, identity = %previous.identity());
        previous.tracker().mark_restarting();
        previous.shutdown().await;

        match self.launch(target, cwd).await {
            Ok(()) => {
                let notifier = self
                    .current
                    .as_ref()
                    .map(|session| session.notifier().clone())
                    .unwrap_or_else(|| self.notifier.clone());
                notifier.emit(LifecycleNotification::RestartSucceeded { clear_outputs });
            }
            Err(err) => {
                warn!(event = "kernel_restart_failed", kernel_ref = %self.kernel_ref, error = %err);
                self.notifier
                    .emit(LifecycleNotification::RestartFailed(err.into()));
            }
        }
    }

    async fn close(&mut self) {
        if let Some(session) = self.current.take() {
            session.shutdown().await;
        }
        for teardown in self.teardowns.drain(..) {
            if let Err(err) = teardown.await {
                warn!(event = "kernel_teardown_panicked", kernel_ref = %self.kernel_ref, error = %err);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RemoteServerConfig;
    use crate::error::{KernelInfoError, KernelspecError};
    use crate::kernelspec::StaticCatalog;
    use crate::notification::TransportKind;
    use crate::testing::{
        collect_until, drain_for, next_notification, sh_kernel_spec, status_message,
        FakeJupyterServer, FakeKernelBehavior, MemoryConnector,
    };
    use nteract_messaging::{execute_request, ExecuteOptions};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const SLEEPING_KERNEL: &str = "exec sleep 30";

    struct Fixture {
        manager: KernelManager,
        notifications: NotificationStream,
        connector: Arc<MemoryConnector>,
        runtime: TempDir,
        cwd: TempDir,
    }

    fn fixture(behavior: FakeKernelBehavior, specs: Vec<KernelSpecification>) -> Fixture {
        fixture_with(behavior, specs, |config| config)
    }

    fn fixture_with(
        behavior: FakeKernelBehavior,
        specs: Vec<KernelSpecification>,
        configure: impl FnOnce(KernelConfig) -> KernelConfig,
    ) -> Fixture {
        let runtime = TempDir::new().expect("runtime dir");
        let cwd = TempDir::new().expect("cwd");
        let config = configure(KernelConfig::default().with_runtime_dir(runtime.path()));
        let connector = Arc::new(MemoryConnector::new(behavior));
        let (manager, notifications) = KernelManager::with_connector(
            config,
            Arc::new(StaticCatalog::new(specs)),
            connector.clone(),
        );
        Fixture {
            manager,
            notifications,
            connector,
            runtime,
            cwd,
        }
    }

    fn runtime_files(dir: &TempDir) -> Vec<PathBuf> {
        std::fs::read_dir(dir.path())
            .map(|entries| entries.flatten().map(|entry| entry.path()).collect())
            .unwrap_or_default()
    }

    fn pid_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !pid_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    fn is_status(event: &LifecycleNotification, status: KernelStatus) -> bool {
        matches!(event, LifecycleNotification::StatusChanged(s) if *s == status)
    }

    async fn launched_summary(rx: &mut NotificationStream) -> KernelSummary {
        let events = collect_until(rx, |event| {
            matches!(
                event,
                LifecycleNotification::Launched(_) | LifecycleNotification::LaunchFailed(_)
            )
        })
        .await;
        match events.last() {
            Some(LifecycleNotification::Launched(summary)) => summary.clone(),
            other => panic!("expected launch, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn launch_announces_then_handshakes_to_idle() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());

        let first = next_notification(&mut fx.notifications).await;
        let summary = match first.event {
            LifecycleNotification::Launched(summary) => summary,
            other => panic!("expected launched first, got {other:?}"),
        };
        assert_eq!(summary.kernel_ref, kernel_ref);
        assert_eq!(summary.kernelspec_name, "python3");
        assert_eq!(summary.transport, TransportKind::LocalProcess);
        assert!(summary.pid.is_some());
        let connection_file = summary.connection_file.clone().expect("connection file");
        assert!(connection_file.exists());

        let second = next_notification(&mut fx.notifications).await;
        assert_eq!(second.session_id.as_deref(), Some(summary.identity.as_str()));
        assert!(is_status(&second.event, KernelStatus::Launched));

        let mut saw_info = false;
        let mut saw_idle = false;
        while !(saw_info && saw_idle) {
            match next_notification(&mut fx.notifications).await.event {
                LifecycleNotification::KernelInfoReceived(info) => {
                    assert_eq!(info.name, "python");
                    saw_info = true;
                }
                LifecycleNotification::StatusChanged(KernelStatus::Idle) => saw_idle = true,
                _ => {}
            }
        }
        assert_eq!(fx.manager.status(kernel_ref).await, Some(KernelStatus::Idle));
        let handle = &fx.connector.handles()[0];
        assert_eq!(handle.sent_types(), vec!["kernel_info_request".to_string()]);

        fx.manager.shutdown_all().await;
        assert!(!connection_file.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_executable_fails_once_without_launching() {
        let spec = KernelSpecification::new(
            "ghost",
            "python",
            vec!["/definitely/not/a/kernel".to_string()],
        );
        let mut fx = fixture(FakeKernelBehavior::default(), Vec::new());
        fx.manager.launch(KernelRef::new(), spec, fx.cwd.path());

        let failure = next_notification(&mut fx.notifications).await;
        assert!(matches!(
            failure.event,
            LifecycleNotification::LaunchFailed(LaunchError::Spawn { .. })
        ));
        assert!(failure.session_id.is_none());
        let rest = drain_for(&mut fx.notifications, Duration::from_millis(300)).await;
        assert!(rest.is_empty(), "unexpected events: {rest:?}");
        assert!(runtime_files(&fx.runtime).is_empty());
        assert!(fx.connector.handles().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_kernelspec_reports_not_found() {
        let mut fx = fixture(FakeKernelBehavior::default(), Vec::new());
        fx.manager
            .launch_by_name(KernelRef::new(), "julia", fx.cwd.path());
        let failure = next_notification(&mut fx.notifications).await;
        assert_eq!(
            failure.event,
            LifecycleNotification::LaunchFailed(LaunchError::Kernelspec(
                KernelspecError::NotFound("julia".to_string())
            ))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channel_failure_cleans_up_process_and_file() {
        let runtime = TempDir::new().expect("runtime dir");
        let connector = Arc::new(MemoryConnector::failing(TransportError::Connect {
            endpoint: "tcp://127.0.0.1:1".to_string(),
            message: "refused".to_string(),
        }));
        let (manager, mut notifications) = KernelManager::with_connector(
            KernelConfig::default().with_runtime_dir(runtime.path()),
            Arc::new(StaticCatalog::new(Vec::new())),
            connector,
        );
        manager.launch(
            KernelRef::new(),
            sh_kernel_spec("python3", SLEEPING_KERNEL),
            runtime.path(),
        );
        let events = collect_until(&mut notifications, |event| {
            matches!(event, LifecycleNotification::LaunchFailed(_))
        })
        .await;
        assert!(matches!(
            events.last(),
            Some(LifecycleNotification::LaunchFailed(LaunchError::Transport(_)))
        ));
        assert!(!events
            .iter()
            .any(|event| matches!(event, LifecycleNotification::Launched(_))));
        assert!(runtime_files(&runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_with_reply_kills_and_deletes() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        let summary = launched_summary(&mut fx.notifications).await;
        let pid = summary.pid.expect("pid");
        let connection_file = summary.connection_file.expect("connection file");

        let started = Instant::now();
        fx.manager.shutdown(kernel_ref);
        let events = collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Terminated)
        })
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let replied = events
            .iter()
            .position(|event| matches!(event, LifecycleNotification::ShutdownReplySucceeded(_)))
            .expect("shutdown reply");
        let deleted = events
            .iter()
            .position(|event| {
                matches!(event, LifecycleNotification::ConnectionFileDeleted(path) if *path == connection_file)
            })
            .expect("connection file deleted");
        assert!(replied < deleted);
        assert!(!events
            .iter()
            .any(|event| matches!(event, LifecycleNotification::ShutdownReplyTimedOut(_))));

        assert!(wait_until_gone(pid).await, "kernel process survived shutdown");
        assert!(!connection_file.exists());
        assert_eq!(fx.connector.handles()[0].completions(), 1);
        assert_eq!(fx.manager.status(kernel_ref).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_without_reply_times_out_then_cleans_up() {
        let behavior = FakeKernelBehavior {
            shutdown_reply_after: None,
            ..FakeKernelBehavior::default()
        };
        let mut fx = fixture(behavior, vec![sh_kernel_spec("python3", SLEEPING_KERNEL)]);
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        let summary = launched_summary(&mut fx.notifications).await;
        let pid = summary.pid.expect("pid");

        let started = Instant::now();
        fx.manager.shutdown(kernel_ref);
        let events = collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::ShutdownReplyTimedOut(_))
        })
        .await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2), "timed out early: {waited:?}");
        assert!(waited < Duration::from_secs(5));
        assert!(matches!(
            events.last(),
            Some(LifecycleNotification::ShutdownReplyTimedOut(err)) if err.timeout == Duration::from_secs(2)
        ));

        let rest = collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Terminated)
        })
        .await;
        assert!(rest
            .iter()
            .any(|event| matches!(event, LifecycleNotification::ConnectionFileDeleted(_))));
        assert!(!rest
            .iter()
            .any(|event| matches!(event, LifecycleNotification::ShutdownReplySucceeded(_))));
        assert!(wait_until_gone(pid).await);
        assert!(runtime_files(&fx.runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unexpected_exit_reports_exited_once() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", "sleep 1; echo bye")],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        launched_summary(&mut fx.notifications).await;

        let events = collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Exited)
        })
        .await;
        assert!(events
            .iter()
            .any(|event| matches!(event, LifecycleNotification::Stdout(text) if text.contains("bye"))));
        let rest = drain_for(&mut fx.notifications, Duration::from_millis(500)).await;
        assert!(
            !rest.iter().any(|event| matches!(
                event,
                LifecycleNotification::StatusChanged(_)
                    | LifecycleNotification::Stdout(_)
                    | LifecycleNotification::Stderr(_)
            )),
            "events after exit: {rest:?}"
        );
        assert_eq!(fx.manager.status(kernel_ref).await, Some(KernelStatus::Exited));

        fx.manager.kill(kernel_ref);
        let teardown = collect_until(&mut fx.notifications, |event| {
            matches!(
                event,
                LifecycleNotification::KillSucceeded | LifecycleNotification::KillFailed(_)
            )
        })
        .await;
        assert!(teardown
            .iter()
            .any(|event| matches!(event, LifecycleNotification::ConnectionFileDeleted(_))));
        assert!(runtime_files(&fx.runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_without_a_session_report_no_session() {
        let mut fx = fixture(FakeKernelBehavior::default(), Vec::new());
        let kernel_ref = KernelRef::new();

        fx.manager.interrupt(kernel_ref);
        fx.manager.kill(kernel_ref);
        fx.manager.shutdown(kernel_ref);
        fx.manager.restart(kernel_ref, true);

        let mut events = Vec::new();
        for _ in 0..4 {
            events.push(next_notification(&mut fx.notifications).await.event);
        }
        assert_eq!(
            events,
            vec![
                LifecycleNotification::InterruptFailed(InterruptError::NoSession),
                LifecycleNotification::KillFailed(KillError::NoSession),
                LifecycleNotification::KillFailed(KillError::NoSession),
                LifecycleNotification::RestartFailed(RestartError::NoSession),
            ]
        );
        assert_eq!(
            fx.manager.send(kernel_ref, execute_request("1", &ExecuteOptions::default())).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relaunch_tears_down_previous_session() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        let first = launched_summary(&mut fx.notifications).await;
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());

        let first_file = first.connection_file.clone().expect("first file");
        let mut second = None;
        let mut first_deleted = false;
        while second.is_none() || !first_deleted {
            match next_notification(&mut fx.notifications).await.event {
                LifecycleNotification::Launched(summary) => second = Some(summary),
                LifecycleNotification::ConnectionFileDeleted(path) => {
                    assert_eq!(path, first_file, "only the retired session is torn down");
                    first_deleted = true;
                }
                _ => {}
            }
        }
        let second = second.expect("second launch");
        assert_ne!(first.identity, second.identity);
        let second_file = second.connection_file.clone().expect("second file");
        assert_ne!(first_file, second_file);

        assert!(wait_until_gone(first.pid.expect("first pid")).await);
        assert!(pid_alive(second.pid.expect("second pid")));
        assert!(second_file.exists());

        fx.manager.shutdown_all().await;
        assert!(runtime_files(&fx.runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_relaunches_same_spec() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        let first = launched_summary(&mut fx.notifications).await;

        fx.manager.restart(kernel_ref, true);
        let events = collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::RestartSucceeded { .. })
        })
        .await;
        assert!(events
            .iter()
            .any(|event| is_status(event, KernelStatus::Restarting)));
        let terminated = events
            .iter()
            .position(|event| is_status(event, KernelStatus::Terminated))
            .expect("old session terminated");
        let relaunched = events
            .iter()
            .position(|event| matches!(event, LifecycleNotification::Launched(_)))
            .expect("relaunched");
        assert!(terminated < relaunched);
        let second = match &events[relaunched] {
            LifecycleNotification::Launched(summary) => summary.clone(),
            _ => unreachable!(),
        };
        assert_eq!(second.kernelspec_name, "python3");
        assert_eq!(second.cwd, first.cwd);
        assert_ne!(second.identity, first.identity);
        assert_eq!(
            events.last(),
            Some(&LifecycleNotification::RestartSucceeded {
                clear_outputs: true
            })
        );
        assert!(!first.connection_file.expect("first file").exists());

        fx.manager.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kernel_info_timeout_keeps_session_launched() {
        let behavior = FakeKernelBehavior {
            answer_kernel_info: false,
            ..FakeKernelBehavior::default()
        };
        let mut fx = fixture_with(
            behavior,
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
            |mut config| {
                config.kernel_info_timeout = Duration::from_millis(200);
                config
            },
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        let events = collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::KernelInfoFailed(_))
        })
        .await;
        assert_eq!(
            events.last(),
            Some(&LifecycleNotification::KernelInfoFailed(
                KernelInfoError::TimedOut(Duration::from_millis(200))
            ))
        );
        assert_eq!(
            fx.manager.status(kernel_ref).await,
            Some(KernelStatus::Launched)
        );
        fx.manager.kill(kernel_ref);
        collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::KillSucceeded)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_reaches_kernel_and_replies_stream_back() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        launched_summary(&mut fx.notifications).await;

        let mut iopub = fx
            .manager
            .subscribe(kernel_ref, Channel::Iopub)
            .await
            .expect("iopub");
        let request = execute_request("print(1)", &ExecuteOptions::default());
        fx.manager
            .send(kernel_ref, request.clone())
            .await
            .expect("send");

        let stream = loop {
            let message = tokio::time::timeout(Duration::from_secs(5), iopub.recv())
                .await
                .expect("iopub timed out")
                .expect("iopub closed");
            if message.msg_type() == "stream" {
                break message;
            }
        };
        assert!(stream.is_child_of(&request));
        assert_eq!(stream.content["text"], "print(1)");

        fx.manager.shutdown_all().await;
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while iopub.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "iopub stayed open after shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kernel_reported_restart_and_death_do_not_freeze_status() {
        let mut fx = fixture(
            FakeKernelBehavior::default(),
            vec![sh_kernel_spec("python3", SLEEPING_KERNEL)],
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        launched_summary(&mut fx.notifications).await;
        collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Idle)
        })
        .await;

        let handle = fx.connector.handles()[0].clone();
        for state in ["restarting", "starting", "idle"] {
            handle.publish(status_message(state));
        }
        let events = collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Idle)
        })
        .await;
        let restarting = events
            .iter()
            .position(|event| is_status(event, KernelStatus::Restarting))
            .expect("restarting announced");
        let starting = events
            .iter()
            .position(|event| is_status(event, KernelStatus::Starting))
            .expect("starting announced");
        assert!(restarting < starting);
        assert_eq!(fx.manager.status(kernel_ref).await, Some(KernelStatus::Idle));

        handle.publish(status_message("dead"));
        handle.publish(status_message("busy"));
        collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Busy)
        })
        .await;
        assert_eq!(fx.manager.status(kernel_ref).await, Some(KernelStatus::Busy));

        fx.manager.shutdown_all().await;
        assert!(runtime_files(&fx.runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_before_kernel_info_is_the_last_word() {
        let behavior = FakeKernelBehavior {
            answer_kernel_info: false,
            ..FakeKernelBehavior::default()
        };
        let mut fx = fixture_with(
            behavior,
            vec![sh_kernel_spec("python3", "sleep 0.3")],
            |mut config| {
                config.kernel_info_timeout = Duration::from_millis(800);
                config
            },
        );
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        launched_summary(&mut fx.notifications).await;

        let events = collect_until(&mut fx.notifications, |event| {
            is_status(event, KernelStatus::Exited)
        })
        .await;
        assert!(!events
            .iter()
            .any(|event| matches!(event, LifecycleNotification::KernelInfoFailed(_))));

        fx.connector.handles()[0].publish(status_message("busy"));
        let rest = drain_for(&mut fx.notifications, Duration::from_millis(1200)).await;
        assert!(
            !rest.iter().any(|event| matches!(
                event,
                LifecycleNotification::StatusChanged(_) | LifecycleNotification::KernelInfoFailed(_)
            )),
            "events after exit: {rest:?}"
        );
        assert_eq!(fx.manager.status(kernel_ref).await, Some(KernelStatus::Exited));

        fx.manager.kill(kernel_ref);
        collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::KillSucceeded)
        })
        .await;
        assert!(runtime_files(&fx.runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_during_startup_reports_a_single_failure() {
        let runtime = TempDir::new().expect("runtime dir");
        let connector = Arc::new(
            MemoryConnector::new(FakeKernelBehavior::default())
                .with_connect_delay(Duration::from_millis(500)),
        );
        let (manager, mut notifications) = KernelManager::with_connector(
            KernelConfig::default().with_runtime_dir(runtime.path()),
            Arc::new(StaticCatalog::new(Vec::new())),
            connector.clone(),
        );
        manager.launch(
            KernelRef::new(),
            sh_kernel_spec("python3", "exit 3"),
            runtime.path(),
        );

        let events = collect_until(&mut notifications, |event| {
            matches!(event, LifecycleNotification::LaunchFailed(_))
        })
        .await;
        assert_eq!(
            events.last(),
            Some(&LifecycleNotification::LaunchFailed(
                LaunchError::ExitedDuringStartup {
                    name: "python3".to_string()
                }
            ))
        );
        let rest = drain_for(&mut notifications, Duration::from_millis(800)).await;
        let failures = events
            .iter()
            .chain(rest.iter())
            .filter(|event| {
                matches!(
                    event,
                    LifecycleNotification::StatusChanged(_)
                        | LifecycleNotification::LaunchFailed(_)
                        | LifecycleNotification::Launched(_)
                )
            })
            .count();
        assert_eq!(failures, 1, "events: {events:?} then {rest:?}");
        assert!(connector.handles().is_empty());
        assert!(runtime_files(&runtime).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn message_interrupt_mode_sends_control_request() {
        let mut spec = sh_kernel_spec("python3", SLEEPING_KERNEL);
        spec.interrupt_mode = Some("message".to_string());
        let mut fx = fixture(FakeKernelBehavior::default(), vec![spec]);
        let kernel_ref = KernelRef::new();
        fx.manager.launch_by_name(kernel_ref, "python3", fx.cwd.path());
        launched_summary(&mut fx.notifications).await;

        fx.manager.interrupt(kernel_ref);
        collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::InterruptSucceeded)
        })
        .await;
        assert!(fx.connector.handles()[0]
            .sent_types()
            .contains(&"interrupt_request".to_string()));
        fx.manager.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn launch_remote_without_server_fails() {
        let mut fx = fixture(FakeKernelBehavior::default(), Vec::new());
        fx.manager
            .launch_remote(KernelRef::new(), "python3", fx.cwd.path());
        assert_eq!(
            next_notification(&mut fx.notifications).await.event,
            LifecycleNotification::LaunchFailed(LaunchError::NoServer)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_interrupts_are_serialized_and_kill_deletes() {
        let server = FakeJupyterServer::spawn_with(Some("secret"), Duration::from_millis(150)).await;
        let remote = RemoteServerConfig::new(&server.base_url(), Some("secret".to_string()))
            .expect("server config");
        let mut fx = fixture_with(FakeKernelBehavior::default(), Vec::new(), |config| {
            config.with_server(remote)
        });
        let kernel_ref = KernelRef::new();
        fx.manager.launch_remote(kernel_ref, "python3", fx.cwd.path());
        let summary = launched_summary(&mut fx.notifications).await;
        assert_eq!(summary.transport, TransportKind::RemoteWebsocket);
        let remote_id = summary.remote_id.expect("remote id");
        assert_eq!(
            server.started_paths(),
            vec![fx.cwd.path().to_string_lossy().to_string()]
        );

        for _ in 0..3 {
            fx.manager.interrupt(kernel_ref);
        }
        let mut succeeded = 0;
        while succeeded < 3 {
            match next_notification(&mut fx.notifications).await.event {
                LifecycleNotification::InterruptSucceeded => succeeded += 1,
                LifecycleNotification::InterruptFailed(err) => panic!("interrupt failed: {err}"),
                _ => {}
            }
        }
        assert_eq!(server.interrupt_count(), 3);
        assert_eq!(server.max_concurrent_interrupts(), 1);

        fx.manager.kill(kernel_ref);
        collect_until(&mut fx.notifications, |event| {
            matches!(event, LifecycleNotification::KillSucceeded)
        })
        .await;
        assert_eq!(server.deleted(), vec![remote_id]);
    }
}
