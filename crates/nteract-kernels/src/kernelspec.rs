use crate::error::KernelspecError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";
pub const RESOURCE_DIR_PLACEHOLDER: &str = "{resource_dir}";

/// Immutable launch descriptor for one named kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecification {
    pub name: String,
    pub display_name: String,
    pub language: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl KernelSpecification {
    pub fn new(name: impl Into<String>, language: impl Into<String>, argv: Vec<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            language: language.into(),
            argv,
            env: BTreeMap::new(),
            resource_dir: None,
            interrupt_mode: None,
            metadata: Value::Null,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Expands `{connection_file}` and `{resource_dir}` in every argv entry.
    pub fn render_argv(&self, connection_file: &Path) -> Vec<String> {
        let connection_file = connection_file.display().to_string();
        let resource_dir = self
            .resource_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace(CONNECTION_FILE_PLACEHOLDER, &connection_file)
                    .replace(RESOURCE_DIR_PLACEHOLDER, &resource_dir)
            })
            .collect()
    }
}

/// On-disk `kernel.json` layout.
#[derive(Debug, Deserialize)]
struct KernelJson {
    argv: Vec<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    interrupt_mode: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[async_trait]
pub trait KernelspecCatalog: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<KernelSpecification, KernelspecError>;
    async fn list(&self) -> Result<Vec<KernelSpecification>, KernelspecError>;
}

/// Scans `<dir>/kernels/<name>/kernel.json` across the configured dirs.
/// Earlier dirs shadow later ones.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dirs: Vec<PathBuf>,
}

impl DirectoryCatalog {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    async fn load(name: &str, resource_dir: &Path) -> Result<KernelSpecification, KernelspecError> {
        let path = resource_dir.join("kernel.json");
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|err| KernelspecError::Io {
                path: path.clone(),
                message: err.to_string(),
            })?;
        let parsed: KernelJson =
            serde_json::from_slice(&raw).map_err(|err| KernelspecError::Malformed {
                path: path.clone(),
                message: err.to_string(),
            })?;
        if parsed.argv.is_empty() {
            return Err(KernelspecError::EmptyArgv(name.to_string()));
        }
        let display_name = if parsed.display_name.is_empty() {
            name.to_string()
        } else {
            parsed.display_name
        };
        Ok(KernelSpecification {
            name: name.to_string(),
            display_name,
            language: parsed.language,
            argv: parsed.argv,
            env: parsed.env,
            resource_dir: Some(resource_dir.to_path_buf()),
            interrupt_mode: parsed.interrupt_mode,
            metadata: parsed.metadata,
        })
    }
}

#[async_trait]
impl KernelspecCatalog for DirectoryCatalog {
    async fn lookup(&self, name: &str) -> Result<KernelSpecification, KernelspecError> {
        for dir in &self.dirs {
            let resource_dir = dir.join("kernels").join(name);
            if tokio::fs::metadata(resource_dir.join("kernel.json"))
                .await
                .is_ok()
            {
                debug!(
                    event = "kernelspec_found",
                    kernel = name,
                    resource_dir = %resource_dir.display()
                );
                return Self::load(name, &resource_dir).await;
            }
        }
        Err(KernelspecError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<KernelSpecification>, KernelspecError> {
        let mut found: BTreeMap<String, KernelSpecification> = BTreeMap::new();
        for dir in &self.dirs {
            let kernels_dir = dir.join("kernels");
            let mut entries = match tokio::fs::read_dir(&kernels_dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if found.contains_key(&name) {
                    continue;
                }
                match Self::load(&name, &entry.path()).await {
                    Ok(spec) => {
                        found.insert(name, spec);
                    }
                    Err(err) => {
                        debug!(event = "kernelspec_skipped", kernel = %name, error = %err);
                    }
                }
            }
        }
        Ok(found.into_values().collect())
    }
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    specs: HashMap<String, KernelSpecification>,
}

impl StaticCatalog {
    pub fn new(specs: impl IntoIterator<Item = KernelSpecification>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }
}

#[async_trait]
impl KernelspecCatalog for StaticCatalog {
    async fn lookup(&self, name: &str) -> Result<KernelSpecification, KernelspecError> {
        self.specs
            .get(name)
            .cloned()
            .ok_or_else(|| KernelspecError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<KernelSpecification>, KernelspecError> {
        let mut specs: Vec<_> = self.specs.values().cloned().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }
}
