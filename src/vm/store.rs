//! On-disk VM records
//!
//! `<root>/<name>/` is the VM. Inside it `config.json` and `metadata.json`
//! are written in that order, so a crash mid-create leaves a directory
//! without metadata, which listing reports as a partial record.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::config::{VmConfig, VmMetadata};
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.json";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone)]
pub struct VmStore {
    root: PathBuf,
}

impl VmStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(CONFIG_FILE)
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(METADATA_FILE)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::metadata(self.vm_dir(name))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Directory, then config, then metadata
    ///
    /// An existing directory is reused; existing metadata is a conflict.
    pub async fn create_directory(
        &self,
        name: &str,
        config: &VmConfig,
    ) -> Result<(VmConfig, VmMetadata)> {
        validate_vm_name(name)?;
        let dir = self.vm_dir(name);
        tokio::fs::create_dir_all(&dir).await?;

        if tokio::fs::try_exists(self.metadata_path(name)).await? {
            return Err(Error::Conflict(format!("vm {} already exists", name)));
        }

        let mut config = config.clone();
        config.name = name.to_string();
        write_json(&self.config_path(name), &config).await?;

        let metadata = VmMetadata::new();
        write_json(&self.metadata_path(name), &metadata).await?;

        debug!(vm = name, dir = %dir.display(), "vm directory created");
        Ok((config, metadata))
    }

    pub async fn read_config(&self, name: &str) -> Result<Option<VmConfig>> {
        read_json(&self.config_path(name)).await
    }

    pub async fn read_metadata(&self, name: &str) -> Result<Option<VmMetadata>> {
        read_json(&self.metadata_path(name)).await
    }

    /// Config that must be present
    pub async fn config(&self, name: &str) -> Result<VmConfig> {
        self.read_config(name)
            .await?
            .ok_or_else(|| Error::not_found("vm config", name))
    }

    pub async fn write_config(&self, name: &str, config: &VmConfig) -> Result<()> {
        write_json(&self.config_path(name), config).await
    }

    pub async fn write_metadata(&self, name: &str, metadata: &VmMetadata) -> Result<()> {
        write_json(&self.metadata_path(name), metadata).await
    }

    /// Read-modify-write of `metadata.json`; last writer wins
    ///
    /// A partial record (directory without metadata) starts from fresh metadata.
    pub async fn update_metadata<F>(&self, name: &str, update: F) -> Result<VmMetadata>
    where
        F: FnOnce(&mut VmMetadata),
    {
        let mut metadata = match self.read_metadata(name).await? {
            Some(metadata) => metadata,
            None if self.exists(name).await => VmMetadata::new(),
            None => return Err(Error::not_found("vm", name)),
        };
        update(&mut metadata);
        metadata.modified_at = Utc::now();
        self.write_metadata(name, &metadata).await?;
        Ok(metadata)
    }

    /// Names of every VM directory, sorted
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Recursively remove the VM directory
    pub async fn remove(&self, name: &str) -> Result<()> {
        tokio::fs::remove_dir_all(self.vm_dir(name)).await?;
        Ok(())
    }
}

/// VM names become directory names and `-name` arguments
pub fn validate_vm_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid vm name {:?}", name)))
    }
}

/// Missing file is `None`; an unparsable one is logged and treated as missing
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&json) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable vm document");
            Ok(None)
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
