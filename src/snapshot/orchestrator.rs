//! Snapshot operations as console command sequences
//!
//! Each step's reply is checked with the console error-substring rule and
//! any hit stops the sequence. Nothing is rolled back automatically except
//! in `rename`, which deletes the snapshot it just created when the old one
//! cannot be removed.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    validate_snapshot_name, ListQuery, LoadOutcome, Page, SnapshotIndex, SnapshotRecord,
    SnapshotStatus, SnapshotView, SortKey, SortOrder,
};
use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::metrics::{outcome, SNAPSHOT_OPERATIONS};
use crate::monitor::console::{parse_snapshot_list, validate_response, Console, LiveSnapshot};

/// Runs snapshot operations for one VM
pub struct SnapshotOrchestrator {
    vm_name: String,
    console: Arc<dyn Console>,
    index: SnapshotIndex,
    /// Backing image, stat'ed after a save for the size estimate
    disk_path: Option<PathBuf>,
    timing: SnapshotConfig,
}

impl SnapshotOrchestrator {
    pub fn new(
        vm_name: impl Into<String>,
        console: Arc<dyn Console>,
        index: SnapshotIndex,
        timing: SnapshotConfig,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            console,
            index,
            disk_path: None,
            timing,
        }
    }

    pub fn with_disk(mut self, disk_path: impl Into<PathBuf>) -> Self {
        self.disk_path = Some(disk_path.into());
        self
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Issue a command and fail on any error marker in the reply
    async fn run(&self, command: &str) -> Result<String> {
        let response = self.console.execute(command).await?;
        validate_response(&response, command)?;
        Ok(response)
    }

    /// Current snapshot table of the disk image
    pub async fn live_snapshots(&self) -> Result<Vec<LiveSnapshot>> {
        let response = self.console.execute("info snapshots").await?;
        Ok(parse_snapshot_list(&response))
    }

    /// Fetch the live table and prune index entries it no longer holds
    ///
    /// Every operation starts here, so a snapshot removed behind our back
    /// never blocks reuse of its name.
    async fn sync_with_image(&self) -> Result<Vec<LiveSnapshot>> {
        let live = self.live_snapshots().await?;
        self.prune(&live).await?;
        Ok(live)
    }

    async fn prune(&self, live: &[LiveSnapshot]) -> Result<Vec<String>> {
        let pruned = self
            .index
            .retain(&self.vm_name, |r| live.iter().any(|s| s.tag == r.name))
            .await?;
        if !pruned.is_empty() {
            debug!(vm = %self.vm_name, pruned = ?pruned, "stale snapshot index entries removed");
        }
        Ok(pruned)
    }

    async fn is_running(&self) -> Result<bool> {
        let status = self.console.execute("info status").await?;
        Ok(status.to_lowercase().contains("running"))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// `savevm <name>` and index the result
    #[instrument(skip(self, description), fields(vm = %self.vm_name))]
    pub async fn create(&self, name: &str, description: &str) -> Result<SnapshotRecord> {
        let result = self.create_inner(name, description).await;
        SNAPSHOT_OPERATIONS
            .with_label_values(&["create", outcome(&result)])
            .inc();
        result
    }

    async fn create_inner(&self, name: &str, description: &str) -> Result<SnapshotRecord> {
        validate_snapshot_name(name)?;
        let live = self.sync_with_image().await?;
        // savevm silently overwrites an existing tag
        if live.iter().any(|s| s.tag == name) {
            return Err(Error::Conflict(format!(
                "snapshot {} already exists for {}",
                name, self.vm_name
            )));
        }

        self.run(&format!("savevm {}", name)).await?;

        let record = SnapshotRecord {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            vm_name: self.vm_name.clone(),
            description: description.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            last_load_time: None,
            size_bytes: self.measure_disk().await,
            status: SnapshotStatus::Active,
        };
        self.index.upsert(record.clone()).await?;

        info!(snapshot = name, size = ?record.size_bytes, "snapshot created");
        Ok(record)
    }

    /// Size of the backing image after the save has had time to land
    async fn measure_disk(&self) -> Option<u64> {
        let path = self.disk_path.as_ref()?;
        tokio::time::sleep(self.timing.size_settle()).await;
        match tokio::fs::metadata(path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot size unknown");
                None
            }
        }
    }

    /// Pause if running, `loadvm`, verify, resume if it was running
    #[instrument(skip(self), fields(vm = %self.vm_name))]
    pub async fn load(&self, name: &str) -> Result<LoadOutcome> {
        let result = self.load_inner(name).await;
        SNAPSHOT_OPERATIONS
            .with_label_values(&["load", outcome(&result)])
            .inc();
        result
    }

    async fn load_inner(&self, name: &str) -> Result<LoadOutcome> {
        self.sync_with_image().await?;
        let mut record = self
            .index
            .find(&self.vm_name, name)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", name))?;

        let was_running = self.is_running().await?;
        if was_running {
            self.run("stop").await?;
            tokio::time::sleep(self.timing.pause_settle()).await;
        }

        self.run(&format!("loadvm {}", name)).await?;
        tokio::time::sleep(self.timing.load_verify_delay()).await;

        if !self.live_snapshots().await?.iter().any(|s| s.tag == name) {
            return Err(Error::Protocol(format!(
                "snapshot {} missing from image after loadvm",
                name
            )));
        }
        let status = self.console.execute("info status").await?.to_lowercase();
        if status.contains("internal error") || status.contains("internal-error") {
            return Err(Error::Protocol(format!(
                "guest reports an internal error after loading {}: {}",
                name, status
            )));
        }

        if was_running {
            self.run("cont").await?;
        }

        let now = Utc::now();
        record.last_load_time = Some(now);
        record.updated_at = Some(now);
        self.index.upsert(record.clone()).await?;

        info!(snapshot = name, resumed = was_running, "snapshot loaded");
        Ok(LoadOutcome {
            snapshot: record,
            resumed: was_running,
        })
    }

    /// `delvm <name>`; the index entry is only dropped when the console agrees
    #[instrument(skip(self), fields(vm = %self.vm_name))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let result = self.delete_inner(name).await;
        SNAPSHOT_OPERATIONS
            .with_label_values(&["delete", outcome(&result)])
            .inc();
        result
    }

    async fn delete_inner(&self, name: &str) -> Result<()> {
        self.sync_with_image().await?;
        if self.index.find(&self.vm_name, name).await?.is_none() {
            return Err(Error::not_found("snapshot", name));
        }

        self.run(&format!("delvm {}", name)).await?;
        self.index.remove(&self.vm_name, name).await?;

        info!(snapshot = name, "snapshot deleted");
        Ok(())
    }

    /// load(old) → save(new) → delete(old)
    ///
    /// When delete(old) fails the new snapshot is deleted again and the index
    /// is reconciled with the image, then the delete error is returned.
    #[instrument(skip(self, description), fields(vm = %self.vm_name))]
    pub async fn rename(
        &self,
        old_name: &str,
        new_name: &str,
        description: Option<&str>,
    ) -> Result<SnapshotRecord> {
        let result = self.rename_inner(old_name, new_name, description).await;
        SNAPSHOT_OPERATIONS
            .with_label_values(&["rename", outcome(&result)])
            .inc();
        result
    }

    async fn rename_inner(
        &self,
        old_name: &str,
        new_name: &str,
        description: Option<&str>,
    ) -> Result<SnapshotRecord> {
        validate_snapshot_name(new_name)?;
        if old_name == new_name {
            return Err(Error::InvalidInput("new name equals old name".into()));
        }
        let live = self.sync_with_image().await?;
        let old = self
            .index
            .find(&self.vm_name, old_name)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", old_name))?;
        if live.iter().any(|s| s.tag == new_name) {
            return Err(Error::Conflict(format!("snapshot {} already exists", new_name)));
        }

        let loaded = self.load(old_name).await?.snapshot;
        let created = self
            .create(new_name, description.unwrap_or(&old.description))
            .await?;

        if let Err(e) = self.delete(old_name).await {
            warn!(old = old_name, new = new_name, error = %e, "rename failed after save, removing new snapshot");
            self.compensate_rename(new_name).await;
            return Err(e);
        }

        // Same logical snapshot under a new name
        let renamed = SnapshotRecord {
            name: created.name,
            description: created.description,
            size_bytes: created.size_bytes,
            updated_at: Some(Utc::now()),
            ..loaded
        };
        self.index.upsert(renamed.clone()).await?;
        info!(old = old_name, new = new_name, "snapshot renamed");
        Ok(renamed)
    }

    /// Best-effort undo of the save half of a rename
    async fn compensate_rename(&self, new_name: &str) {
        let command = format!("delvm {}", new_name);
        match self.console.execute(&command).await {
            Ok(response) => {
                if let Err(e) = validate_response(&response, &command) {
                    warn!(snapshot = new_name, error = %e, "compensating delete reported an error");
                }
            }
            Err(e) => warn!(snapshot = new_name, error = %e, "compensating delete failed"),
        }

        if let Err(e) = self.index.remove(&self.vm_name, new_name).await {
            warn!(snapshot = new_name, error = %e, "failed to drop renamed entry from index");
        }
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "index reconciliation after failed rename did not complete");
        }
    }

    /// Drop index entries whose snapshot no longer exists in the image
    pub async fn reconcile(&self) -> Result<Vec<String>> {
        let live = self.live_snapshots().await?;
        self.prune(&live).await
    }

    /// Indexed snapshots merged with the live table, sorted and paginated
    pub async fn list(&self, query: &ListQuery) -> Result<Page<SnapshotView>> {
        let live = self.sync_with_image().await?;
        let mut views: Vec<SnapshotView> = self
            .index
            .load(&self.vm_name)
            .await?
            .into_iter()
            .map(|record| SnapshotView {
                live: live.iter().find(|s| s.tag == record.name).cloned(),
                record,
            })
            .collect();

        views.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortKey::CreatedAt => a.record.created_at.cmp(&b.record.created_at),
                SortKey::Name => a.record.name.cmp(&b.record.name),
                SortKey::Size => a.record.size_bytes.cmp(&b.record.size_bytes),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        Ok(Page::paginate(views, query))
    }

    /// One indexed snapshot merged with its live row
    pub async fn detail(&self, name: &str) -> Result<SnapshotView> {
        let live = self.sync_with_image().await?;
        let record = self
            .index
            .find(&self.vm_name, name)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", name))?;
        let live = live.into_iter().find(|s| s.tag == name);
        Ok(SnapshotView { record, live })
    }
}
