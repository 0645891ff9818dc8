// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    interp, AtomicUnit, Catalog, DedupRecord, Env, Error, HopAck, HopMessage, HopOutcome, KeyTuple,
    NodeId, Row, RuntimeConfig, Store, SyncBoxFuture,
};
use async_std::sync::{Arc, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use tracing::{debug, debug_span, trace, warn, Instrument};

type LockTable<K> = Arc<Mutex<(usize, HashMap<K, Arc<Mutex<()>>>)>>;

/// Applies hops at one node. Cheap to clone; clones share the store and
/// lock tables.
pub struct NodeExecutor<S: Store> {
    node: NodeId,
    catalog: Arc<Catalog>,

    // Serializes concurrent deliveries of the same (txn, hop), so the dedup
    // check and the commit that follows it can't interleave with a twin.
    hop_locks: LockTable<(crate::TxnId, usize)>,

    // One lock per row a running hop may touch. Hops take the locks for
    // their whole footprint, in key order, before reading anything.
    //
    // Both tables are paired with a usize counting acquisitions; once every
    // `lock_gc_frequency` we drop locks nobody holds or waits on.
    row_locks: LockTable<(String, KeyTuple)>,
    lock_gc_frequency: usize,

    store: Arc<RwLock<S>>,
}

impl<S: Store> Clone for NodeExecutor<S> {
    fn clone(&self) -> Self {
        NodeExecutor {
            node: self.node,
            catalog: self.catalog.clone(),
            hop_locks: self.hop_locks.clone(),
            row_locks: self.row_locks.clone(),
            lock_gc_frequency: self.lock_gc_frequency,
            store: self.store.clone(),
        }
    }
}

async fn get_lock<K: Clone + Eq + Hash>(
    table: &LockTable<K>,
    key: &K,
    gc_frequency: usize,
) -> Arc<Mutex<()>> {
    let mut guard = table.lock().await;

    // Maybe GC locks before issuing new one.
    guard.0 += 1;
    if guard.0 > gc_frequency {
        let pre_count = guard.1.len();
        guard.1.retain(|_, l| Arc::strong_count(l) > 1);
        let post_count = guard.1.len();
        debug!(
            "GC'ed {:?} locks, {:?} remaining",
            pre_count - post_count,
            post_count
        );
        guard.0 = 0;
    }

    guard
        .1
        .entry(key.clone())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

impl<S: Store> NodeExecutor<S> {
    pub fn new(node: NodeId, catalog: Arc<Catalog>, config: &RuntimeConfig, store: S) -> Self {
        NodeExecutor {
            node,
            catalog,
            hop_locks: Arc::new(Mutex::new((0, HashMap::new()))),
            row_locks: Arc::new(Mutex::new((0, HashMap::new()))),
            lock_gc_frequency: config.lock_gc_frequency,
            store: Arc::new(RwLock::new(store)),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn store(&self) -> Arc<RwLock<S>> {
        self.store.clone()
    }

    /// Writes a row outside any transaction, e.g. to load initial data.
    /// Missing non-key columns take their zero value; the row must belong
    /// on this node.
    pub async fn load(&self, table: &str, row: Row) -> Result<(), Error> {
        let schema = self.catalog.schema();
        let t = schema
            .table(table)
            .ok_or_else(|| Error::Schema(format!("unknown table {}", table)))?;
        let bindings = t
            .primary
            .iter()
            .filter_map(|p| row.get(p).map(|v| (p.clone(), v.clone())))
            .collect::<BTreeMap<_, _>>();
        let key = schema.key_tuple(table, &bindings)?;
        let owner = schema.resolve_tuple(table, &key)?;
        if owner != self.node {
            return Err(Error::Schema(format!(
                "{}{:?} belongs on {:?}, not {:?}",
                table, key, owner, self.node
            )));
        }
        let mut full = Row::new();
        for c in &t.columns {
            let v = match row.get(&c.name) {
                Some(v) => v.clone().coerce_to(c.ty).ok_or_else(|| {
                    Error::Schema(format!("{}.{} expects {:?}, got {}", table, c.name, c.ty, v))
                })?,
                None => c.ty.zero(),
            };
            full.insert(c.name.clone(), v);
        }
        if let Some(extra) = row.keys().find(|k| t.column(k).is_none()) {
            return Err(Error::Schema(format!("{} has no column {}", table, extra)));
        }
        self.store.write().await.put(table, key, full)
    }

    /// Reads a row by named key bindings; for inspection and tests.
    pub async fn get(&self, table: &str, key: &Env) -> Result<Option<Row>, Error> {
        let key = self.catalog.schema().key_tuple(table, key)?;
        Ok(self.store.read().await.get(table, &key))
    }

    pub async fn dedup_log(&self) -> Vec<DedupRecord> {
        self.store.read().await.dedup_log()
    }

    /// Applies one hop message and returns the ack to send back. Never
    /// fails as a future: every failure is an outcome in the ack.
    pub fn apply_hop(&self, msg: HopMessage) -> SyncBoxFuture<HopAck> {
        let this = self.clone();
        Box::pin(async move {
            let span =
                debug_span!("apply_hop", node=?this.node, txn=?msg.txn_id, hop=msg.hop_index);
            this.apply_hop_(msg).instrument(span).await
        })
    }

    async fn apply_hop_(&self, msg: HopMessage) -> HopAck {
        let outcome = self.outcome_for(&msg).await;
        HopAck {
            txn_id: msg.txn_id,
            hop_index: msg.hop_index,
            node: self.node,
            outcome,
        }
    }

    async fn outcome_for(&self, msg: &HopMessage) -> HopOutcome {
        let hop_key = (msg.txn_id, msg.hop_index);
        let hop_lock = get_lock(&self.hop_locks, &hop_key, self.lock_gc_frequency).await;
        let _hop_guard = hop_lock.lock().await;

        if let Some(rec) = self.store.read().await.applied(msg.txn_id, msg.hop_index) {
            debug!("hop already applied, replaying recorded outcome");
            return rec.outcome;
        }

        let schema = self.catalog.schema();
        let hop = match self.catalog.hop(&msg.txn_name, msg.hop_index) {
            Some(hop) => hop,
            None => {
                warn!("no hop {} in {}", msg.hop_index, msg.txn_name);
                return HopOutcome::Rejected(Error::UnknownTransaction(format!(
                    "{} hop {}",
                    msg.txn_name, msg.hop_index
                )));
            }
        };
        match hop.node_for(schema, &msg.env, msg.timestamp) {
            Ok(n) if n == self.node && msg.node == self.node => (),
            Ok(n) => {
                warn!("misrouted hop: belongs on {:?}", n);
                return HopOutcome::Rejected(Error::Schema(format!(
                    "hop {} of {:?} belongs on {:?}, not {:?}",
                    msg.hop_index, msg.txn_id, n, self.node
                )));
            }
            Err(e) => return HopOutcome::Rejected(e),
        }

        // Evaluate the footprint and check every row is ours before
        // touching anything.
        let mut rows = BTreeSet::new();
        for r in &hop.footprint {
            let resolved = interp::eval_key(schema, &r.table, &r.key, &msg.env, msg.timestamp)
                .and_then(|k| schema.resolve_tuple(&r.table, &k).map(|n| (k, n)));
            match resolved {
                Ok((k, n)) if n == self.node => {
                    rows.insert((r.table.clone(), k));
                }
                Ok((k, n)) => {
                    return HopOutcome::Rejected(Error::Schema(format!(
                        "{}{:?} lives on {:?}, not {:?}",
                        r.table, k, n, self.node
                    )))
                }
                Err(e) => return HopOutcome::Rejected(e),
            }
        }

        debug!("acquiring {:?} row locks", rows.len());
        let mut row_arcs = Vec::new();
        for r in rows.iter() {
            row_arcs.push(get_lock(&self.row_locks, r, self.lock_gc_frequency).await);
        }
        let mut row_guards = Vec::new();
        for arc in row_arcs.iter() {
            row_guards.push(arc.lock().await);
        }

        let result = {
            let store = self.store.read().await;
            interp::run_hop(schema, hop, msg.env.clone(), msg.timestamp, &*store)
        };
        let (writes, outcome) = match result {
            Ok(fx) => (
                fx.writes,
                HopOutcome::Committed {
                    env: fx.env,
                    returned: fx.returned,
                },
            ),
            Err(Error::Aborted) => (Vec::new(), HopOutcome::Aborted),
            Err(Error::Data(m)) => (Vec::new(), HopOutcome::DataError(m)),
            Err(e) => return HopOutcome::Rejected(e),
        };
        trace!("committing {} writes with outcome {:?}", writes.len(), outcome);
        let unit = AtomicUnit {
            writes,
            dedup: DedupRecord {
                txn_id: msg.txn_id,
                hop_index: msg.hop_index,
                outcome: outcome.clone(),
                timestamp: msg.timestamp,
            },
        };
        match self.store.write().await.commit(unit) {
            Ok(()) => outcome,
            Err(e) => {
                warn!("commit failed: {}", e);
                HopOutcome::StorageFault(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env, ir::key, Column, DispatcherId, Expr, HopSource, MemStore, PartitionExpr,
        SchemaBuilder, Stmt, Table, TxnId, TxnSource, TypeName, Value,
    };
    use async_std::task;
    use futures::future::join_all;

    fn catalog() -> Arc<Catalog> {
        let mut b = SchemaBuilder::new(2);
        b.register(Table::new(
            "Counter",
            vec![Column::new("id", TypeName::Int), Column::new("n", TypeName::Int)],
            &["id"],
            PartitionExpr::key_mod("id", 2),
        ))
        .unwrap();
        let mut cat = Catalog::new(b.build().unwrap());
        let k = || key(vec![("id", Expr::var("id"))]);
        cat.define(
            &TxnSource::new("bump")
                .param("id", TypeName::Int)
                .param("by", TypeName::Int)
                .hop(HopSource::on_partition(
                    "Counter",
                    k(),
                    vec![
                        Stmt::let_(
                            "n",
                            TypeName::Int,
                            Expr::field("Counter", k(), "n").plus(Expr::var("by")),
                        ),
                        Stmt::update("Counter", k(), vec![("n", Expr::var("n"))]),
                    ],
                )),
        )
        .unwrap();
        Arc::new(cat)
    }

    fn executor(node: u32) -> NodeExecutor<MemStore> {
        NodeExecutor::new(NodeId(node), catalog(), &RuntimeConfig::default(), MemStore::new())
    }

    fn bump(event: u64, id: i64, by: i64) -> HopMessage {
        HopMessage {
            txn_id: TxnId::new(DispatcherId(1), 100, event),
            txn_name: "bump".into(),
            hop_index: 0,
            node: NodeId((id % 2) as u32),
            timestamp: 100,
            env: env(vec![("id", id), ("by", by)]),
        }
    }

    async fn count(exec: &NodeExecutor<MemStore>, id: i64) -> Value {
        let row = exec.get("Counter", &env(vec![("id", id)])).await.unwrap().unwrap();
        row["n"].clone()
    }

    #[test]
    fn replays_are_identical_and_apply_once() {
        task::block_on(async {
            let exec = executor(0);
            exec.load("Counter", env(vec![("id", 4i64)])).await.unwrap();
            let first = exec.apply_hop(bump(1, 4, 3)).await;
            let second = exec.apply_hop(bump(1, 4, 3)).await;
            assert_eq!(first, second);
            assert_eq!(count(&exec, 4).await, Value::Int(3));
            assert_eq!(exec.dedup_log().await.len(), 1);
            match first.outcome {
                HopOutcome::Committed { env, .. } => assert_eq!(env["n"], Value::Int(3)),
                other => panic!("unexpected {:?}", other),
            }
        })
    }

    #[test]
    fn concurrent_hops_on_one_row_serialize() {
        task::block_on(async {
            let exec = executor(0);
            exec.load("Counter", env(vec![("id", 2i64)])).await.unwrap();
            let acks = join_all((1..=20).map(|e| exec.apply_hop(bump(e, 2, 1)))).await;
            assert!(acks.iter().all(|a| a.outcome.is_committed()));
            // Duplicate deliveries racing each other still apply once.
            let dups = join_all((0..5).map(|_| exec.apply_hop(bump(7, 2, 1)))).await;
            assert!(dups.iter().all(|a| *a == dups[0]));
            assert_eq!(count(&exec, 2).await, Value::Int(20));
        })
    }

    #[test]
    fn missing_row_is_recorded_as_a_data_error() {
        task::block_on(async {
            let exec = executor(1);
            let ack = exec.apply_hop(bump(1, 5, 1)).await;
            assert!(matches!(ack.outcome, HopOutcome::DataError(_)));
            let log = exec.dedup_log().await;
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].outcome, ack.outcome);
            assert_eq!(exec.apply_hop(bump(1, 5, 1)).await, ack);
        })
    }

    #[test]
    fn storage_fault_records_nothing() {
        task::block_on(async {
            let exec = executor(1);
            exec.load("Counter", env(vec![("id", 3i64)])).await.unwrap();
            exec.store().write().await.fail_next_commits(1);
            let ack = exec.apply_hop(bump(1, 3, 1)).await;
            assert!(matches!(ack.outcome, HopOutcome::StorageFault(_)));
            assert!(exec.dedup_log().await.is_empty());
            assert_eq!(count(&exec, 3).await, Value::Int(0));
        })
    }

    #[test]
    fn misrouted_hops_are_rejected() {
        task::block_on(async {
            let exec = executor(0);
            let mut msg = bump(1, 3, 1);
            msg.node = NodeId(0);
            let ack = exec.apply_hop(msg).await;
            assert!(matches!(ack.outcome, HopOutcome::Rejected(Error::Schema(_))));
            assert!(exec.dedup_log().await.is_empty());
            assert!(exec.load("Counter", env(vec![("id", 3i64)])).await.is_err());
        })
    }
}
