use crate::config::KernelConfig;
use crate::connection::ConnectionFile;
use crate::error::{KernelspecError, LaunchError, ProcessError};
use crate::kernelspec::KernelSpecification;
use crate::notification::{KernelStatus, LifecycleNotification, Notifier};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OUTPUT_CHUNK_BYTES: usize = 8 * 1024;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// A spawned kernel process together with the connection file it was
/// launched against. Both belong to exactly one session.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub process: ProcessHandle,
    pub connection: ConnectionFile,
    pub argv: Vec<String>,
}

enum ProcessControl {
    Interrupt(oneshot::Sender<Result<(), ProcessError>>),
    Terminate(oneshot::Sender<Result<(), ProcessError>>),
}

/// Control side of a watched child process. The watcher task owns the child
/// and publishes exactly one final status on its watch: `exited` when the
/// process ends on its own, `errored` when waiting on it fails,
/// `disconnected` when this handle is dropped without terminating, and
/// `terminated` after `terminate`. Announcing it is left to the owner, so a
/// launch that never produced a session stays silent about it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::Sender<ProcessControl>,
    finished: watch::Receiver<Option<KernelStatus>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Final status once the process has ended, `None` while it runs.
    pub fn status_watch(&self) -> watch::Receiver<Option<KernelStatus>> {
        self.finished.clone()
    }

    pub fn has_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }

    /// Resolves with the final status once the watcher has observed the end
    /// of the process.
    pub async fn finished(&self) -> KernelStatus {
        let mut finished = self.finished.clone();
        let result = finished.wait_for(Option::is_some).await.map(|status| *status);
        match result {
            Ok(Some(status)) => status,
            _ => KernelStatus::Disconnected,
        }
    }

    pub async fn interrupt(&self) -> Result<(), ProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(ProcessControl::Interrupt(reply_tx))
            .await
            .map_err(|_| ProcessError::Gone)?;
        reply_rx.await.map_err(|_| ProcessError::Gone)?
    }

    /// Closes the output streams and force-kills the process. Succeeds
    /// trivially if the process already ended.
    pub async fn terminate(&self) -> Result<(), ProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .control
            .send(ProcessControl::Terminate(reply_tx))
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }
}

pub async fn launch(
    spec: &KernelSpecification,
    cwd: &Path,
    config: &KernelConfig,
    notifier: &Notifier,
) -> Result<LaunchedProcess, LaunchError> {
    if spec.argv.is_empty() {
        return Err(KernelspecError::EmptyArgv(spec.name.clone()).into());
    }
    let connection = ConnectionFile::create(config, &spec.name).await?;
    let argv = spec.render_argv(connection.path());

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .envs(&spec.env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            if let Err(delete_err) = connection.delete().await {
                warn!(
                    event = "connection_file_cleanup_failed",
                    kernel = %spec.name,
                    error = %delete_err
                );
            }
            return Err(LaunchError::Spawn {
                name: spec.name.clone(),
                message: format!("{}: {err}", argv[0]),
            });
        }
    };

    let pid = child.id();
    info!(
        event = "kernel_process_spawned",
        kernel = %spec.name,
        pid = pid.unwrap_or_default(),
        connection_file = %connection.path().display()
    );

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(forward_chunks(stdout, notifier.clone(), false)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward_chunks(stderr, notifier.clone(), true)));

    let (control_tx, control_rx) = mpsc::channel(8);
    let (finished_tx, finished_rx) = watch::channel(None);
    tokio::spawn(watch_process(
        child,
        pid,
        OutputTasks {
            stdout: stdout_task,
            stderr: stderr_task,
        },
        control_rx,
        finished_tx,
    ));

    Ok(LaunchedProcess {
        process: ProcessHandle {
            pid,
            control: control_tx,
            finished: finished_rx,
        },
        connection,
        argv,
    })
}

/// Forwards output as it arrives, one notification per read.
async fn forward_chunks<R>(mut reader: R, notifier: Notifier, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if is_stderr {
                    notifier.emit(LifecycleNotification::Stderr(text));
                } else {
                    notifier.emit(LifecycleNotification::Stdout(text));
                }
            }
            Err(err) => {
                debug!(event = "kernel_output_read_failed", stderr = is_stderr, error = %err);
                break;
            }
        }
    }
}

struct OutputTasks {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl OutputTasks {
    /// Lets readers flush what the process wrote before it ended.
    async fn drain(&mut self) {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            if let Some(task) = self.stdout.as_mut() {
                let _ = task.await;
            }
            if let Some(task) = self.stderr.as_mut() {
                let _ = task.await;
            }
        })
        .await;
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.stdout.take() {
            task.abort();
        }
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
    }
}

async fn watch_process(
    mut child: Child,
    pid: Option<u32>,
    mut output: OutputTasks,
    mut control_rx: mpsc::Receiver<ProcessControl>,
    finished_tx: watch::Sender<Option<KernelStatus>>,
) {
    let terminal = loop {
        tokio::select! {
            status = child.wait() => {
                output.drain().await;
                break match status {
                    Ok(status) => {
                        info!(event = "kernel_process_exited", pid = pid.unwrap_or_default(), status = %status);
                        KernelStatus::Exited
                    }
                    Err(err) => {
                        warn!(event = "kernel_process_wait_failed", pid = pid.unwrap_or_default(), error = %err);
                        KernelStatus::Errored
                    }
                };
            }
            command = control_rx.recv() => {
                match command {
                    Some(ProcessControl::Interrupt(reply)) => {
                        let _ = reply.send(send_interrupt(pid));
                    }
                    Some(ProcessControl::Terminate(reply)) => {
                        output.abort();
                        let result = child
                            .start_kill()
                            .map_err(|err| ProcessError::Signal(err.to_string()));
                        let _ = child.wait().await;
                        debug!(event = "kernel_process_terminated", pid = pid.unwrap_or_default());
                        let _ = finished_tx.send(Some(KernelStatus::Terminated));
                        let _ = reply.send(result);
                        return;
                    }
                    None => {
                        output.abort();
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        warn!(event = "kernel_process_disconnected", pid = pid.unwrap_or_default());
                        break KernelStatus::Disconnected;
                    }
                }
            }
        }
    };
    let _ = finished_tx.send(Some(terminal));
}

#[cfg(unix)]
fn send_interrupt(pid: Option<u32>) -> Result<(), ProcessError> {
    let pid = pid.ok_or(ProcessError::Gone)?;
    let pid: libc::pid_t = pid
        .try_into()
        .map_err(|_| ProcessError::Signal(format!("pid {pid} out of range")))?;
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Err(ProcessError::Gone);
    }
    Err(ProcessError::Signal(err.to_string()))
}

#[cfg(not(unix))]
fn send_interrupt(_pid: Option<u32>) -> Result<(), ProcessError> {
    Err(ProcessError::Signal(
        "SIGINT is not available on this platform".to_string(),
    ))
}
