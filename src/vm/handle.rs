//! Live process table
//!
//! A [`ProcessHandle`] exists for every VM this control plane believes is
//! running. The [`ProcessRegistry`] is injected into the manager rather than
//! being a global, so tests and embedders get their own table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::metrics::VMS_RUNNING;
use crate::monitor::{ConsoleClient, Endpoint};

/// One running hypervisor process
pub struct ProcessHandle {
    pub name: String,
    pub pid: u32,
    pub disk_path: PathBuf,
    pub console_endpoint: Endpoint,
    pub qmp_endpoint: Endpoint,
    /// Full launch command line
    pub command: String,
    pub started_at: DateTime<Utc>,
    /// Picked up from persisted metadata rather than launched by this process
    pub adopted: bool,
    /// Shared so console commands for one VM are serialized
    console: Arc<ConsoleClient>,
}

impl ProcessHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        pid: u32,
        disk_path: PathBuf,
        console_endpoint: Endpoint,
        qmp_endpoint: Endpoint,
        command: String,
        console: Arc<ConsoleClient>,
        adopted: bool,
    ) -> Self {
        Self {
            name,
            pid,
            disk_path,
            console_endpoint,
            qmp_endpoint,
            command,
            started_at: Utc::now(),
            adopted,
            console,
        }
    }

    pub fn console(&self) -> Arc<ConsoleClient> {
        Arc::clone(&self.console)
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("disk_path", &self.disk_path)
            .field("console_endpoint", &self.console_endpoint)
            .field("qmp_endpoint", &self.qmp_endpoint)
            .field("adopted", &self.adopted)
            .field("uptime", &self.uptime())
            .finish()
    }
}

/// name → handle
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: RwLock<HashMap<String, Arc<ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a handle, replacing any previous one for the same name
    pub async fn insert(&self, handle: ProcessHandle) -> Arc<ProcessHandle> {
        let handle = Arc::new(handle);
        let mut handles = self.handles.write().await;
        handles.insert(handle.name.clone(), Arc::clone(&handle));
        VMS_RUNNING.set(handles.len() as f64);
        handle
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        self.handles.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        let mut handles = self.handles.write().await;
        let removed = handles.remove(name);
        VMS_RUNNING.set(handles.len() as f64);
        removed
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.handles.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }

    /// Drop every handle whose pid fails `is_alive`; returns the dropped names
    pub async fn prune<F>(&self, is_alive: F) -> Vec<String>
    where
        F: Fn(u32) -> bool,
    {
        let mut handles = self.handles.write().await;
        let dead: Vec<String> = handles
            .iter()
            .filter(|(_, h)| !is_alive(h.pid))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &dead {
            handles.remove(name);
        }
        VMS_RUNNING.set(handles.len() as f64);
        dead
    }
}
