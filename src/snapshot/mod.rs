//! Internal snapshots driven through the text console
//!
//! QEMU keeps snapshots inside the guest disk image; that table is the truth.
//! The index kept here only adds what QEMU does not store (id, description,
//! load history) and is reconciled against `info snapshots` before use.

pub mod index;
pub mod orchestrator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::monitor::LiveSnapshot;

pub use index::SnapshotIndex;
pub use orchestrator::SnapshotOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Active,
}

/// Indexed metadata for one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,
    pub name: String,
    pub vm_name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_load_time: Option<DateTime<Utc>>,
    /// Disk image size measured right after the save; `None` when unknown
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub status: SnapshotStatus,
}

/// Index record merged with the hypervisor's own view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    #[serde(flatten)]
    pub record: SnapshotRecord,
    /// Row from `info snapshots`; `None` when the image no longer has it
    pub live: Option<LiveSnapshot>,
}

/// Result of a successful load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub snapshot: SnapshotRecord,
    /// Guest was running before the load and has been resumed
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Name,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Pagination and ordering for snapshot listings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListQuery {
    /// 1-based
    pub page: usize,
    pub limit: usize,
    pub sort_by: SortKey,
    pub order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            sort_by: SortKey::default(),
            order: SortOrder::default(),
        }
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Slice `items` according to `query` (page and limit clamped to >= 1)
    pub fn paginate(items: Vec<T>, query: &ListQuery) -> Self {
        let limit = query.limit.max(1);
        let page = query.page.max(1);
        let total = items.len();
        let total_pages = total.div_ceil(limit);
        let items = items
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();

        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// Snapshot names end up inside console commands; keep them to one token
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid snapshot name {:?}", name)))
    }
}
