use crate::error::ConfigError;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_TRANSPORT: &str = "tcp";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Runtime knobs shared by every session a manager launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub runtime_dir: PathBuf,
    pub kernelspec_dirs: Vec<PathBuf>,
    pub ip: String,
    pub transport: String,
    pub signature_scheme: String,
    pub shutdown_timeout: Duration,
    pub kernel_info_timeout: Duration,
    pub connect_timeout: Duration,
    /// Zero disables the heartbeat monitor.
    pub heartbeat_interval: Duration,
    pub server: Option<RemoteServerConfig>,
    pub log: LogSettings,
}

/// Tracing output for whichever process hosts the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub dir: Option<PathBuf>,
    /// `None` means stderr only when no log file is open.
    pub stderr: Option<bool>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            dir: None,
            stderr: None,
        }
    }
}

impl LogSettings {
    fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            level: lookup("NTERACT_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            dir: lookup("NTERACT_LOG_DIR").map(PathBuf::from),
            stderr: lookup("NTERACT_LOG_STDERR").and_then(|value| parse_switch(&value)),
        }
    }

    pub fn writes_stderr(&self, has_file: bool) -> bool {
        self.stderr.unwrap_or(!has_file)
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServerConfig {
    pub base_url: Url,
    pub token: Option<String>,
}

impl RemoteServerConfig {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ConfigError> {
        let mut base_url = Url::parse(base_url.trim()).map_err(|err| ConfigError::ServerUrl {
            value: base_url.to_string(),
            message: err.to_string(),
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::ServerUrl {
                value: base_url.to_string(),
                message: "expected an http or https url".to_string(),
            });
        }
        // Url::join drops the last segment unless the path ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let token = token.filter(|value| !value.trim().is_empty());
        Ok(Self { base_url, token })
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            kernelspec_dirs: default_kernelspec_dirs(None),
            ip: DEFAULT_IP.to_string(),
            transport: DEFAULT_TRANSPORT.to_string(),
            signature_scheme: nteract_messaging::DEFAULT_SIGNATURE_SCHEME.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            kernel_info_timeout: DEFAULT_KERNEL_INFO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            server: None,
            log: LogSettings::default(),
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves every field through `lookup`, falling back to defaults for
    /// unset or blank values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let runtime_dir = lookup("NTERACT_RUNTIME_DIR")
            .or_else(|| lookup("JUPYTER_RUNTIME_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(default_runtime_dir);
        let kernelspec_dirs = default_kernelspec_dirs(lookup("JUPYTER_PATH").as_deref());
        let server = match lookup("NTERACT_SERVER_URL") {
            Some(url) => Some(RemoteServerConfig::new(&url, lookup("NTERACT_SERVER_TOKEN"))?),
            None => None,
        };
        Ok(Self {
            runtime_dir,
            kernelspec_dirs,
            ip: lookup("NTERACT_KERNEL_IP").unwrap_or_else(|| DEFAULT_IP.to_string()),
            transport: DEFAULT_TRANSPORT.to_string(),
            signature_scheme: nteract_messaging::DEFAULT_SIGNATURE_SCHEME.to_string(),
            shutdown_timeout: resolve_duration_ms(
                &lookup,
                "NTERACT_SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT,
            )?,
            kernel_info_timeout: resolve_duration_ms(
                &lookup,
                "NTERACT_KERNEL_INFO_TIMEOUT_MS",
                DEFAULT_KERNEL_INFO_TIMEOUT,
            )?,
            connect_timeout: resolve_duration_ms(
                &lookup,
                "NTERACT_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT,
            )?,
            heartbeat_interval: resolve_duration_ms(
                &lookup,
                "NTERACT_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL,
            )?,
            server,
            log: LogSettings::from_lookup(&lookup),
        })
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_server(mut self, server: RemoteServerConfig) -> Self {
        self.server = Some(server);
        self
    }
}

fn resolve_duration_ms<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Duration {
                key: key.to_string(),
                value,
            }),
        None => Ok(default),
    }
}

fn default_runtime_dir() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir.join("jupyter");
    }
    if let Some(dir) = dirs::data_dir() {
        return dir.join("jupyter").join("runtime");
    }
    env::temp_dir().join("jupyter").join("runtime")
}

fn default_kernelspec_dirs(jupyter_path: Option<&str>) -> Vec<PathBuf> {
    let mut dirs_out: Vec<PathBuf> = Vec::new();
    if let Some(raw) = jupyter_path {
        dirs_out.extend(env::split_paths(raw).filter(|path| !path.as_os_str().is_empty()));
    }
    if let Some(dir) = dirs::data_dir() {
        dirs_out.push(dir.join("jupyter"));
    }
    dirs_out.push(Path::new("/usr/local/share/jupyter").to_path_buf());
    dirs_out.push(Path::new("/usr/share/jupyter").to_path_buf());
    dirs_out.dedup();
    dirs_out
}
