//! Durable log and stable stores, one redb database file each
//! (`raft-log.db`, `raft-stable.db`) under the node's data directory.

use std::fmt::Debug;
use std::io;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{IOFlushed, LogState, RaftLogStorage};
use openraft::RaftLogReader;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::typ::{Entry, LogId, TypeConfig, Vote};

const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("entries");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";

fn io_err<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::other(e)
}

/// Ordered log entries live in `raft-log.db`; term/vote/purge metadata in
/// `raft-stable.db`. Entries are stored as their canonical JSON encoding.
#[derive(Debug, Clone)]
pub struct LogStore {
    log: Arc<Database>,
    stable: Arc<Database>,
}

impl LogStore {
    pub fn open(data_dir: &Path) -> io::Result<LogStore> {
        let log = Database::create(data_dir.join("raft-log.db")).map_err(io_err)?;
        let stable = Database::create(data_dir.join("raft-stable.db")).map_err(io_err)?;

        // Eagerly create both tables so reads work before the first write.
        let txn = log.begin_write().map_err(io_err)?;
        txn.open_table(ENTRIES).map_err(io_err)?;
        txn.commit().map_err(io_err)?;
        let txn = stable.begin_write().map_err(io_err)?;
        txn.open_table(META).map_err(io_err)?;
        txn.commit().map_err(io_err)?;

        Ok(LogStore {
            log: Arc::new(log),
            stable: Arc::new(stable),
        })
    }

    /// True when either store carries state from a previous run. Used to
    /// skip bootstrap on recovery.
    pub fn has_existing_state(&self) -> io::Result<bool> {
        if self.last_entry_bytes()?.is_some() {
            return Ok(true);
        }
        Ok(self.read_meta(KEY_VOTE)?.is_some() || self.read_meta(KEY_LAST_PURGED)?.is_some())
    }

    fn append_batch(&self, batch: Vec<(u64, Vec<u8>)>) -> io::Result<()> {
        let txn = self.log.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(io_err)?;
            for (index, bytes) in batch {
                table.insert(index, bytes.as_slice()).map_err(io_err)?;
            }
        }
        txn.commit().map_err(io_err)
    }

    fn entries_in<RB: RangeBounds<u64>>(&self, range: RB) -> io::Result<Vec<Vec<u8>>> {
        let txn = self.log.begin_read().map_err(io_err)?;
        let table = txn.open_table(ENTRIES).map_err(io_err)?;
        let mut out = Vec::new();
        for item in table.range(range).map_err(io_err)? {
            let (_, value) = item.map_err(io_err)?;
            out.push(value.value().to_vec());
        }
        Ok(out)
    }

    fn last_entry_bytes(&self) -> io::Result<Option<Vec<u8>>> {
        let txn = self.log.begin_read().map_err(io_err)?;
        let table = txn.open_table(ENTRIES).map_err(io_err)?;
        let last = table.last().map_err(io_err)?;
        Ok(last.map(|(_, value)| value.value().to_vec()))
    }

    /// Removes entries with `index >= from`.
    fn truncate_from(&self, from: u64) -> io::Result<()> {
        self.remove_range(from..)
    }

    /// Removes entries with `index <= upto`.
    fn purge_upto(&self, upto: u64) -> io::Result<()> {
        self.remove_range(..=upto)
    }

    fn remove_range<RB: RangeBounds<u64>>(&self, range: RB) -> io::Result<()> {
        let txn = self.log.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(io_err)?;
            let doomed: Vec<u64> = table
                .range(range)
                .map_err(io_err)?
                .map(|item| item.map(|(key, _)| key.value()))
                .collect::<Result<_, _>>()
                .map_err(io_err)?;
            for key in doomed {
                table.remove(key).map_err(io_err)?;
            }
        }
        txn.commit().map_err(io_err)
    }

    fn read_meta(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let txn = self.stable.begin_read().map_err(io_err)?;
        let table = txn.open_table(META).map_err(io_err)?;
        let value = table.get(key).map_err(io_err)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn write_meta(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let txn = self.stable.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(META).map_err(io_err)?;
            table.insert(key, bytes).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)
    }

    fn last_purged(&self) -> io::Result<Option<LogId>> {
        match self.read_meta(KEY_LAST_PURGED)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(io_err),
        }
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, io::Error> {
        self.entries_in(range)?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(io_err))
            .collect()
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, io::Error> {
        match self.read_meta(KEY_VOTE)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(io_err),
        }
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, io::Error> {
        let last_purged_log_id = self.last_purged()?;
        let last_log_id = match self.last_entry_bytes()? {
            Some(bytes) => {
                let entry: Entry = serde_json::from_slice(&bytes).map_err(io_err)?;
                Some(entry.log_id)
            }
            None => last_purged_log_id,
        };
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), io::Error> {
        let bytes = serde_json::to_vec(vote).map_err(io_err)?;
        self.write_meta(KEY_VOTE, &bytes)
    }

    async fn append<I>(&mut self, entries: I, callback: IOFlushed<TypeConfig>) -> Result<(), io::Error>
    where
        I: IntoIterator<Item = Entry> + Send,
    {
        let batch: Result<Vec<(u64, Vec<u8>)>, io::Error> = entries
            .into_iter()
            .map(|entry| {
                serde_json::to_vec(&entry)
                    .map(|bytes| (entry.log_id.index, bytes))
                    .map_err(io_err)
            })
            .collect();
        let result = batch.and_then(|batch| self.append_batch(batch));
        callback.io_completed(result);
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), io::Error> {
        self.truncate_from(log_id.index)
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), io::Error> {
        let bytes = serde_json::to_vec(&log_id).map_err(io_err)?;
        self.write_meta(KEY_LAST_PURGED, &bytes)?;
        self.purge_upto(log_id.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fresh_store_has_no_state() {
        let (_dir, store) = store();
        assert!(!store.has_existing_state().unwrap());
        assert!(store.last_entry_bytes().unwrap().is_none());
        assert!(store.entries_in(..).unwrap().is_empty());
    }

    #[test]
    fn test_append_and_range_read() {
        let (_dir, store) = store();
        store
            .append_batch(vec![(1, b"one".to_vec()), (2, b"two".to_vec()), (3, b"three".to_vec())])
            .unwrap();

        assert_eq!(store.entries_in(2..).unwrap(), vec![b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(store.last_entry_bytes().unwrap(), Some(b"three".to_vec()));
        assert!(store.has_existing_state().unwrap());
    }

    #[test]
    fn test_truncate_drops_suffix() {
        let (_dir, store) = store();
        store
            .append_batch((1..=5).map(|i| (i, vec![i as u8])).collect())
            .unwrap();
        store.truncate_from(3).unwrap();
        assert_eq!(store.entries_in(..).unwrap().len(), 2);
        assert_eq!(store.last_entry_bytes().unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_purge_drops_prefix() {
        let (_dir, store) = store();
        store
            .append_batch((1..=5).map(|i| (i, vec![i as u8])).collect())
            .unwrap();
        store.purge_upto(3).unwrap();
        assert_eq!(store.entries_in(..).unwrap(), vec![vec![4], vec![5]]);
    }

    #[test]
    fn test_meta_roundtrip_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path()).unwrap();
            store.write_meta(KEY_VOTE, b"{\"fake\":1}").unwrap();
        }
        let store = LogStore::open(dir.path()).unwrap();
        assert_eq!(store.read_meta(KEY_VOTE).unwrap(), Some(b"{\"fake\":1}".to_vec()));
        assert!(store.has_existing_state().unwrap());
        assert_eq!(store.read_meta(KEY_LAST_PURGED).unwrap(), None);
    }
}
