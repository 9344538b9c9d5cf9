//! Per-VM snapshot index documents
//!
//! `<dir>/<vm>.json` holds a JSON array of [`SnapshotRecord`]s. Every write
//! replaces the whole document.

use std::path::{Path, PathBuf};

use super::SnapshotRecord;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SnapshotIndex {
    dir: PathBuf,
}

impl SnapshotIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", vm_name))
    }

    /// All records for a VM; a missing document is an empty index
    pub async fn load(&self, vm_name: &str) -> Result<Vec<SnapshotRecord>> {
        match tokio::fs::read_to_string(self.path(vm_name)).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, vm_name: &str, records: &[SnapshotRecord]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(records)?;
        tokio::fs::write(self.path(vm_name), json).await?;
        Ok(())
    }

    pub async fn find(&self, vm_name: &str, name: &str) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .load(vm_name)
            .await?
            .into_iter()
            .find(|r| r.name == name))
    }

    /// Insert or replace the record with the same name
    pub async fn upsert(&self, record: SnapshotRecord) -> Result<()> {
        let mut records = self.load(&record.vm_name).await?;
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.save(&record.vm_name, &records).await
    }

    /// Drop a record; returns whether anything was removed
    pub async fn remove(&self, vm_name: &str, name: &str) -> Result<bool> {
        let mut records = self.load(vm_name).await?;
        let before = records.len();
        records.retain(|r| r.name != name);
        if records.len() == before {
            return Ok(false);
        }
        self.save(vm_name, &records).await?;
        Ok(true)
    }

    /// Keep only records whose name satisfies `keep`; returns removed names
    pub async fn retain<F>(&self, vm_name: &str, mut keep: F) -> Result<Vec<String>>
    where
        F: FnMut(&SnapshotRecord) -> bool,
    {
        let records = self.load(vm_name).await?;
        let (kept, dropped): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| keep(r));
        if !dropped.is_empty() {
            self.save(vm_name, &kept).await?;
        }
        Ok(dropped.into_iter().map(|r| r.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotStatus;
    use chrono::Utc;

    fn record(vm: &str, name: &str) -> SnapshotRecord {
        SnapshotRecord {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.to_string(),
            vm_name: vm.to_string(),
            description: String::new(),
            created_at: Utc::now(),
            updated_at: None,
            last_load_time: None,
            size_bytes: None,
            status: SnapshotStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = SnapshotIndex::new(dir.path().join("snapshots"));
        assert!(index.load("alpha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_find_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = SnapshotIndex::new(dir.path());

        index.upsert(record("alpha", "s1")).await.unwrap();
        index.upsert(record("alpha", "s2")).await.unwrap();
        index.upsert(record("beta", "s1")).await.unwrap();

        assert_eq!(index.load("alpha").await.unwrap().len(), 2);
        assert!(index.find("alpha", "s2").await.unwrap().is_some());

        assert!(index.remove("alpha", "s1").await.unwrap());
        assert!(!index.remove("alpha", "s1").await.unwrap());
        assert_eq!(index.load("alpha").await.unwrap().len(), 1);
        assert_eq!(index.load("beta").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retain_reports_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let index = SnapshotIndex::new(dir.path());
        index.upsert(record("alpha", "keep")).await.unwrap();
        index.upsert(record("alpha", "stale")).await.unwrap();

        let dropped = index.retain("alpha", |r| r.name == "keep").await.unwrap();
        assert_eq!(dropped, vec!["stale".to_string()]);
        assert_eq!(index.load("alpha").await.unwrap()[0].name, "keep");
    }
}
