//! File-based snapshot store under `<data_dir>/snapshots/`.
//!
//! Each snapshot is a pair of files named by its snapshot id: `<id>.snap`
//! (canonical manifest JSON) and `<id>.meta` (serialized snapshot
//! metadata). Ids are zero-padded log indexes, so lexical order is log
//! order. Only the newest few snapshots are retained.

use std::io;
use std::path::{Path, PathBuf};

use crate::typ::SnapshotMeta;

pub const DEFAULT_RETAIN: usize = 3;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(data_dir: &Path, retain: usize) -> io::Result<SnapshotStore> {
        let dir = data_dir.join("snapshots");
        std::fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir, retain })
    }

    pub fn save(&self, meta: &SnapshotMeta, data: &[u8]) -> io::Result<()> {
        let meta_bytes = serde_json::to_vec(meta).map_err(io::Error::other)?;
        std::fs::write(self.dir.join(format!("{}.snap", meta.snapshot_id)), data)?;
        std::fs::write(self.dir.join(format!("{}.meta", meta.snapshot_id)), meta_bytes)?;
        self.prune()
    }

    pub fn load_latest(&self) -> io::Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let Some(id) = self.ids()?.pop() else {
            return Ok(None);
        };
        let meta_bytes = std::fs::read(self.dir.join(format!("{id}.meta")))?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes).map_err(io::Error::other)?;
        let data = std::fs::read(self.dir.join(format!("{id}.snap")))?;
        Ok(Some((meta, data)))
    }

    pub fn has_any(&self) -> io::Result<bool> {
        Ok(!self.ids()?.is_empty())
    }

    /// Snapshot ids present on disk, oldest first. A `.snap` without its
    /// `.meta` sidecar is an interrupted write and is ignored.
    fn ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".meta") {
                if self.dir.join(format!("{id}.snap")).exists() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn prune(&self) -> io::Result<()> {
        let ids = self.ids()?;
        if ids.len() <= self.retain {
            return Ok(());
        }
        for id in &ids[..ids.len() - self.retain] {
            let _ = std::fs::remove_file(self.dir.join(format!("{id}.snap")));
            let _ = std::fs::remove_file(self.dir.join(format!("{id}.meta")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typ::SnapshotMeta;

    fn meta(id: &str) -> SnapshotMeta {
        SnapshotMeta {
            last_log_id: None,
            last_membership: Default::default(),
            snapshot_id: id.to_string(),
        }
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), DEFAULT_RETAIN).unwrap();
        assert!(!store.has_any().unwrap());
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_latest_wins_and_old_snapshots_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 3).unwrap();

        for index in 1..=5u64 {
            let id = format!("{index:020}");
            store.save(&meta(&id), id.as_bytes()).unwrap();
        }

        let (latest, data) = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.snapshot_id, format!("{:020}", 5u64));
        assert_eq!(data, format!("{:020}", 5u64).into_bytes());
        assert_eq!(store.ids().unwrap().len(), 3);
    }
}
