// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Continuation records: what a dispatcher writes down after every ack so
//! that a restarted dispatcher resumes each instance at its last
//! acknowledged hop instead of hop 0.

use crate::{
    storage::{complete_prefix, LineJournal},
    Env, Error, TxnId, Value,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Running,
    Completed { returned: Option<Value> },
    Failed(Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationRecord {
    pub txn_id: TxnId,
    pub txn_name: String,
    /// The first hop not yet acknowledged.
    pub next_hop: usize,
    /// Parameters plus everything produced by hops `0..next_hop`.
    pub env: Env,
    pub status: RecordStatus,
}

impl ContinuationRecord {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, RecordStatus::Running)
    }
}

pub trait DispatchLog: Send + Sync + 'static {
    fn append(&mut self, rec: &ContinuationRecord) -> Result<(), Error>;

    /// The most recent record of every instance, in id order.
    fn load_latest(&self) -> Result<Vec<ContinuationRecord>, Error>;
}

fn latest(records: impl IntoIterator<Item = ContinuationRecord>) -> Vec<ContinuationRecord> {
    let mut by_txn = BTreeMap::new();
    for r in records {
        by_txn.insert(r.txn_id, r);
    }
    by_txn.into_iter().map(|(_, r)| r).collect()
}

/// In-memory [DispatchLog]. Clones share the same records, so a test can
/// hand one clone to a dispatcher, drop the dispatcher, and recover a new
/// one from another clone.
#[derive(Clone, Debug, Default)]
pub struct MemDispatchLog {
    records: Arc<Mutex<Vec<ContinuationRecord>>>,
}

impl MemDispatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ContinuationRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DispatchLog for MemDispatchLog {
    fn append(&mut self, rec: &ContinuationRecord) -> Result<(), Error> {
        self.records
            .lock()
            .map_err(|_| Error::Storage("dispatch log lock poisoned".into()))?
            .push(rec.clone());
        Ok(())
    }

    fn load_latest(&self) -> Result<Vec<ContinuationRecord>, Error> {
        Ok(latest(self.records()))
    }
}

/// JSON-lines [DispatchLog], one record per line. A torn final line left by
/// a crash is cut off when the log is opened.
#[derive(Debug)]
pub struct FileDispatchLog {
    journal: LineJournal,
}

impl FileDispatchLog {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let io_err = |what: &str, e: std::io::Error| {
            Error::Storage(format!("{} dispatch log {}: {}", what, path.display(), e))
        };
        let durable = if path.exists() {
            let bytes = std::fs::read(path).map_err(|e| io_err("read", e))?;
            complete_prefix(&bytes)
        } else {
            0
        };
        let journal = LineJournal::open(path, durable as u64).map_err(|e| io_err("open", e))?;
        Ok(FileDispatchLog { journal })
    }
}

impl DispatchLog for FileDispatchLog {
    fn append(&mut self, rec: &ContinuationRecord) -> Result<(), Error> {
        let line = serde_json::to_string(rec).map_err(|e| Error::Storage(e.to_string()))?;
        self.journal
            .append(&line)
            .map_err(|e| Error::Storage(format!("write dispatch log: {}", e)))
    }

    fn load_latest(&self) -> Result<Vec<ContinuationRecord>, Error> {
        let bytes = std::fs::read(self.journal.path())
            .map_err(|e| Error::Storage(format!("read dispatch log: {}", e)))?;
        let durable = complete_prefix(&bytes);
        if durable < bytes.len() {
            // A torn final append; the hop it describes was acked but its
            // successor never sent, so resuming from the previous record
            // re-sends a hop the node will deduplicate.
            warn!("ignoring torn dispatch log tail");
        }
        let mut records = Vec::new();
        for line in bytes[..durable].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let rec = serde_json::from_slice(line)
                .map_err(|e| Error::Storage(format!("parse dispatch log: {}", e)))?;
            records.push(rec);
        }
        Ok(latest(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env, DispatcherId};
    use std::{fs::OpenOptions, io::Write};

    fn rec(event: u64, next_hop: usize, status: RecordStatus) -> ContinuationRecord {
        ContinuationRecord {
            txn_id: TxnId::new(DispatcherId(3), 50, event),
            txn_name: "t".into(),
            next_hop,
            env: env(vec![("x", next_hop as i64)]),
            status,
        }
    }

    #[test]
    fn latest_record_wins() {
        let mut log = MemDispatchLog::new();
        let shared = log.clone();
        log.append(&rec(1, 0, RecordStatus::Running)).unwrap();
        log.append(&rec(2, 0, RecordStatus::Running)).unwrap();
        log.append(&rec(1, 1, RecordStatus::Running)).unwrap();
        log.append(&rec(2, 1, RecordStatus::Failed(Error::Aborted))).unwrap();
        let got = shared.load_latest().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].next_hop, 1);
        assert!(!got[0].is_terminal());
        assert!(got[1].is_terminal());
    }

    #[test]
    fn file_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.jsonl");
        {
            let mut log = FileDispatchLog::open(&path).unwrap();
            log.append(&rec(1, 0, RecordStatus::Running)).unwrap();
            log.append(&rec(1, 2, RecordStatus::Completed { returned: None }))
                .unwrap();
        }
        let log = FileDispatchLog::open(&path).unwrap();
        let got = log.load_latest().unwrap();
        assert_eq!(got, vec![rec(1, 2, RecordStatus::Completed { returned: None })]);
    }

    #[test]
    fn torn_tail_does_not_poison_later_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.jsonl");
        {
            let mut log = FileDispatchLog::open(&path).unwrap();
            log.append(&rec(1, 0, RecordStatus::Running)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // Cut inside a multi-byte character, too.
            f.write_all(b"{\"txn_id\":{\"n\xc3").unwrap();
        }
        {
            let mut log = FileDispatchLog::open(&path).unwrap();
            assert_eq!(log.load_latest().unwrap().len(), 1);
            log.append(&rec(1, 1, RecordStatus::Running)).unwrap();
            log.append(&rec(2, 0, RecordStatus::Running)).unwrap();
        }
        let log = FileDispatchLog::open(&path).unwrap();
        let got = log.load_latest().unwrap();
        assert_eq!(
            got,
            vec![rec(1, 1, RecordStatus::Running), rec(2, 0, RecordStatus::Running)]
        );
    }
}
