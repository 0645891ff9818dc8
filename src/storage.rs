// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, HopOutcome, KeyTuple, Row, TxnId};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// One buffered row write; the whole row, key columns included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    pub table: String,
    pub key: KeyTuple,
    pub row: Row,
}

/// What a node remembers about a hop it has applied. Replays of the same
/// `(txn_id, hop_index)` get `outcome` back verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub txn_id: TxnId,
    pub hop_index: usize,
    pub outcome: HopOutcome,
    /// The instance's logical timestamp the hop ran with.
    pub timestamp: u64,
}

/// Writes and dedup record of one hop; committed together or not at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicUnit {
    pub writes: Vec<Write>,
    pub dedup: DedupRecord,
}

/// A `Store` is the node-local row storage a [crate::NodeExecutor] runs
/// against. Clients may provide their own; [MemStore] and [FileStore] are
/// supplied.
///
/// Stores are simple maps from `(table, key)` to [Row], plus the dedup log.
/// The only multi-row mutation is `commit`, which must apply every write of
/// the [AtomicUnit] and record its [DedupRecord] in one step, or fail having
/// changed nothing. Isolation between concurrent hops is the executor's job
/// (it holds row locks), so stores need not provide any.
pub trait Store: Send + Sync + 'static {
    fn get(&self, table: &str, key: &KeyTuple) -> Option<Row>;

    /// Writes a row outside any hop, for initial loading.
    fn put(&mut self, table: &str, key: KeyTuple, row: Row) -> Result<(), Error>;

    fn applied(&self, txn_id: TxnId, hop_index: usize) -> Option<DedupRecord>;

    fn commit(&mut self, unit: AtomicUnit) -> Result<(), Error>;

    /// The whole dedup log, in `(txn_id, hop_index)` order.
    fn dedup_log(&self) -> Vec<DedupRecord>;
}

/// In-memory [Store]. Can be told to fail upcoming commits, to exercise the
/// storage-fault path.
#[derive(Debug, Default)]
pub struct MemStore {
    rows: BTreeMap<(String, KeyTuple), Row>,
    dedup: BTreeMap<(TxnId, usize), DedupRecord>,
    failing_commits: usize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `commit` fail without effect.
    pub fn fail_next_commits(&mut self, n: usize) {
        self.failing_commits = n;
    }

    fn apply(&mut self, unit: AtomicUnit) {
        for w in unit.writes {
            self.rows.insert((w.table, w.key), w.row);
        }
        let d = unit.dedup;
        self.dedup.insert((d.txn_id, d.hop_index), d);
    }
}

impl Store for MemStore {
    fn get(&self, table: &str, key: &KeyTuple) -> Option<Row> {
        self.rows.get(&(table.to_string(), key.clone())).cloned()
    }

    fn put(&mut self, table: &str, key: KeyTuple, row: Row) -> Result<(), Error> {
        self.rows.insert((table.to_string(), key), row);
        Ok(())
    }

    fn applied(&self, txn_id: TxnId, hop_index: usize) -> Option<DedupRecord> {
        self.dedup.get(&(txn_id, hop_index)).cloned()
    }

    fn commit(&mut self, unit: AtomicUnit) -> Result<(), Error> {
        if self.failing_commits > 0 {
            self.failing_commits -= 1;
            return Err(Error::Storage(format!(
                "injected commit failure for {:?} hop {}",
                unit.dedup.txn_id, unit.dedup.hop_index
            )));
        }
        self.apply(unit);
        Ok(())
    }

    fn dedup_log(&self) -> Vec<DedupRecord> {
        self.dedup.values().cloned().collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalEntry {
    Put(Write),
    Unit(AtomicUnit),
}

/// A [Store] that journals every mutation as one JSON line and keeps a
/// [MemStore] image in memory. Opening replays the journal; a final line
/// that doesn't parse is taken to be a torn write and ignored, since its
/// unit never reported success.
#[derive(Debug)]
pub struct FileStore {
    journal: LineJournal,
    image: MemStore,
}

/// An append-only file of newline-terminated lines. Anything past the end
/// of the last successful append (a write that failed partway, say) is cut
/// off before the next line goes in.
#[derive(Debug)]
pub(crate) struct LineJournal {
    path: PathBuf,
    file: File,
    durable: u64,
}

impl LineJournal {
    /// Opens `path` for appending, keeping only its first `durable` bytes.
    pub(crate) fn open(path: &Path, durable: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut journal = LineJournal {
            path: path.to_path_buf(),
            file,
            durable,
        };
        journal.cut_back()?;
        Ok(journal)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn cut_back(&mut self) -> io::Result<()> {
        let len = self.file.metadata()?.len();
        if len != self.durable {
            warn!(
                "cutting {} back from {} to {} bytes",
                self.path.display(),
                len,
                self.durable
            );
            self.file.set_len(self.durable)?;
        }
        Ok(())
    }

    pub(crate) fn append(&mut self, line: &str) -> io::Result<()> {
        self.cut_back()?;
        let res = writeln!(self.file, "{}", line).and_then(|_| self.file.sync_data());
        match res {
            Ok(()) => {
                self.durable += line.len() as u64 + 1;
                Ok(())
            }
            Err(e) => {
                if let Err(e2) = self.cut_back() {
                    warn!("{} left with a partial line: {}", self.path.display(), e2);
                }
                Err(e)
            }
        }
    }
}

/// Length of the prefix of `bytes` made of complete, newline-terminated
/// lines.
pub(crate) fn complete_prefix(bytes: &[u8]) -> usize {
    bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let io_err = |what: &str, e: std::io::Error| {
            Error::Storage(format!("{} {}: {}", what, path.display(), e))
        };
        let mut image = MemStore::new();
        let mut durable = 0;
        if path.exists() {
            let bytes = std::fs::read(path).map_err(|e| io_err("read", e))?;
            // Only newline-terminated lines were completely written; the
            // piece after the last newline (if any) is a torn append.
            durable = complete_prefix(&bytes);
            if durable < bytes.len() {
                warn!("ignoring torn journal tail in {}", path.display());
            }
            let mut replayed = 0;
            for line in bytes[..durable].split(|b| *b == b'\n') {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<JournalEntry>(line) {
                    Ok(JournalEntry::Put(w)) => {
                        image.rows.insert((w.table, w.key), w.row);
                    }
                    Ok(JournalEntry::Unit(u)) => image.apply(u),
                    Err(e) => {
                        return Err(Error::Storage(format!(
                            "corrupt journal {}: {}",
                            path.display(),
                            e
                        )))
                    }
                }
                replayed += 1;
            }
            debug!("replayed {} journal entries from {}", replayed, path.display());
        }
        let journal =
            LineJournal::open(path, durable as u64).map_err(|e| io_err("open", e))?;
        Ok(FileStore { journal, image })
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<(), Error> {
        let line = serde_json::to_string(entry).map_err(|e| Error::Storage(e.to_string()))?;
        self.journal
            .append(&line)
            .map_err(|e| Error::Storage(format!("write {}: {}", self.path().display(), e)))
    }
}

impl Store for FileStore {
    fn get(&self, table: &str, key: &KeyTuple) -> Option<Row> {
        self.image.get(table, key)
    }

    fn put(&mut self, table: &str, key: KeyTuple, row: Row) -> Result<(), Error> {
        let w = Write {
            table: table.to_string(),
            key,
            row,
        };
        self.append(&JournalEntry::Put(w.clone()))?;
        self.image.rows.insert((w.table, w.key), w.row);
        Ok(())
    }

    fn applied(&self, txn_id: TxnId, hop_index: usize) -> Option<DedupRecord> {
        self.image.applied(txn_id, hop_index)
    }

    fn commit(&mut self, unit: AtomicUnit) -> Result<(), Error> {
        self.append(&JournalEntry::Unit(unit.clone()))?;
        self.image.apply(unit);
        Ok(())
    }

    fn dedup_log(&self) -> Vec<DedupRecord> {
        self.image.dedup_log()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env, DispatcherId, Value};

    fn unit(event: u64, score: i64) -> AtomicUnit {
        let key = KeyTuple::from(vec![1i64]);
        AtomicUnit {
            writes: vec![Write {
                table: "T".into(),
                key,
                row: env(vec![("id", 1i64), ("score", score)]),
            }],
            dedup: DedupRecord {
                txn_id: TxnId::new(DispatcherId(1), 10, event),
                hop_index: 0,
                outcome: HopOutcome::Committed {
                    env: env(vec![("seen", score)]),
                    returned: None,
                },
                timestamp: 10,
            },
        }
    }

    #[test]
    fn failed_commit_changes_nothing() {
        let mut s = MemStore::new();
        s.fail_next_commits(1);
        assert!(matches!(s.commit(unit(1, 5)), Err(Error::Storage(_))));
        assert!(s.get("T", &KeyTuple::from(vec![1i64])).is_none());
        assert!(s.dedup_log().is_empty());
        s.commit(unit(1, 5)).unwrap();
        assert_eq!(s.dedup_log().len(), 1);
        assert_eq!(
            s.get("T", &KeyTuple::from(vec![1i64])).unwrap()["score"],
            Value::Int(5)
        );
    }

    #[test]
    fn file_store_replays_its_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node0.jsonl");
        {
            let mut s = FileStore::open(&path).unwrap();
            s.put("T", KeyTuple::from(vec![2i64]), env(vec![("id", 2i64), ("score", 0)]))
                .unwrap();
            s.commit(unit(1, 7)).unwrap();
        }
        let s = FileStore::open(&path).unwrap();
        assert!(s.get("T", &KeyTuple::from(vec![2i64])).is_some());
        let t = TxnId::new(DispatcherId(1), 10, 1);
        assert_eq!(s.applied(t, 0), Some(unit(1, 7).dedup));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node0.jsonl");
        {
            let mut s = FileStore::open(&path).unwrap();
            s.commit(unit(1, 7)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"Unit\":{{\"writes\":[").unwrap();
        }
        {
            let mut s = FileStore::open(&path).unwrap();
            assert_eq!(s.dedup_log().len(), 1);
            s.commit(unit(2, 9)).unwrap();
        }
        let s = FileStore::open(&path).unwrap();
        assert_eq!(s.dedup_log().len(), 2);
    }

    #[test]
    fn partial_append_is_cut_before_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node0.jsonl");
        let mut s = FileStore::open(&path).unwrap();
        s.commit(unit(1, 7)).unwrap();
        // What a write that failed halfway leaves behind.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"Unit\":{{\"wri").unwrap();
        }
        s.commit(unit(2, 9)).unwrap();
        drop(s);
        let s = FileStore::open(&path).unwrap();
        assert_eq!(s.dedup_log().len(), 2);
        assert_eq!(
            s.get("T", &KeyTuple::from(vec![1i64])).unwrap()["score"],
            Value::Int(9)
        );
    }
}
