use crate::config::KernelConfig;
use crate::error::ConnectionFileError;
use nteract_messaging::{MessageSigner, WireError};
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Jupyter connection-file contents: five ports plus transport and key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub ip: String,
    pub key: String,
    pub transport: String,
    pub signature_scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_name: String,
}

impl ConnectionInfo {
    pub fn shell_endpoint(&self) -> String {
        self.endpoint(self.shell_port)
    }

    pub fn iopub_endpoint(&self) -> String {
        self.endpoint(self.iopub_port)
    }

    pub fn stdin_endpoint(&self) -> String {
        self.endpoint(self.stdin_port)
    }

    pub fn control_endpoint(&self) -> String {
        self.endpoint(self.control_port)
    }

    pub fn heartbeat_endpoint(&self) -> String {
        self.endpoint(self.hb_port)
    }

    fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    pub fn signer(&self) -> Result<MessageSigner, WireError> {
        MessageSigner::new(&self.key, &self.signature_scheme)
    }

    pub async fn read(path: &Path) -> Result<Self, ConnectionFileError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|err| ConnectionFileError::Read {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        serde_json::from_slice(&raw).map_err(|err| ConnectionFileError::Malformed {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

/// A connection file written to the runtime dir. Owned by exactly one
/// session; `delete` consumes it so removal happens at most once.
#[derive(Debug)]
pub struct ConnectionFile {
    path: PathBuf,
    info: ConnectionInfo,
}

impl ConnectionFile {
    pub async fn create(
        config: &KernelConfig,
        kernel_name: &str,
    ) -> Result<Self, ConnectionFileError> {
        let ports = allocate_ports(&config.ip)?;
        let info = ConnectionInfo {
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            ip: config.ip.clone(),
            key: Uuid::new_v4().to_string(),
            transport: config.transport.clone(),
            signature_scheme: config.signature_scheme.clone(),
            kernel_name: kernel_name.to_string(),
        };

        let dir = &config.runtime_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| ConnectionFileError::Write {
                path: dir.clone(),
                message: err.to_string(),
            })?;
        restrict_permissions(dir, 0o700).await;

        let path = dir.join(format!("kernel-{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(&info).map_err(|err| ConnectionFileError::Write {
            path: path.clone(),
            message: err.to_string(),
        })?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| ConnectionFileError::Write {
                path: path.clone(),
                message: err.to_string(),
            })?;
        restrict_permissions(&path, 0o600).await;
        debug!(
            event = "connection_file_created",
            path = %path.display(),
            shell_port = info.shell_port,
            iopub_port = info.iopub_port
        );
        Ok(Self { path, info })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub async fn delete(self) -> Result<(), ConnectionFileError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(event = "connection_file_deleted", path = %self.path.display());
                Ok(())
            }
            Err(err) => {
                warn!(
                    event = "connection_file_delete_failed",
                    path = %self.path.display(),
                    error = %err
                );
                Err(ConnectionFileError::Delete {
                    path: self.path,
                    message: err.to_string(),
                })
            }
        }
    }
}

/// Binds all five listeners before releasing any, so the ports are distinct.
fn allocate_ports(ip: &str) -> Result<[u16; 5], ConnectionFileError> {
    let mut listeners = Vec::with_capacity(5);
    for _ in 0..5 {
        let listener = TcpListener::bind((ip, 0))
            .map_err(|err| ConnectionFileError::PortAllocation(format!("{ip}: {err}")))?;
        listeners.push(listener);
    }
    let mut ports = [0u16; 5];
    for (slot, listener) in ports.iter_mut().zip(listeners.iter()) {
        *slot = listener
            .local_addr()
            .map_err(|err| ConnectionFileError::PortAllocation(err.to_string()))?
            .port();
    }
    Ok(ports)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
    {
        warn!(
            event = "connection_file_permissions_failed",
            path = %path.display(),
            error = %err
        );
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) {}
