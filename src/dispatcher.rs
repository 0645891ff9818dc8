// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The dispatcher drives transaction instances through their hop chains.
//!
//! Each instance runs as its own task and has at most one hop in flight:
//! resolve the hop's node from the current environment, send it, wait for
//! the ack, fold the produced variables into the environment, persist a
//! continuation record, move on. Transport faults are retried with the same
//! message (the executor deduplicates); every other failure ends the
//! instance, leaving the hops that already committed in place.

use crate::{
    dispatch_log::RecordStatus, Catalog, Clock, ContinuationRecord, DispatchLog, DispatcherId, Env,
    Error, HopAck, HopMessage, RuntimeConfig, SyncBoxFuture, TransactionDefinition, Transport,
    TransportFault, TxnId, TxnIdIssuer, Value,
};
use async_std::{
    future,
    sync::{Arc, Mutex, RwLock},
    task::{self, JoinHandle},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, debug_span, info, instrument, trace, warn, Instrument};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Accepted; no hop sent yet (or resumed and not yet re-sent).
    Pending,
    InFlight { hop: usize },
    Completed,
    Failed(Error),
}

impl TxnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnStatus::Completed | TxnStatus::Failed(_))
    }
}

/// The result of an instance that ran every hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub txn_id: TxnId,
    /// Parameters plus every variable produced along the chain.
    pub env: Env,
    pub returned: Option<Value>,
}

/// A running instance. Awaiting [TxnHandle::outcome] waits for it to end.
pub struct TxnHandle {
    txn_id: TxnId,
    join: JoinHandle<Result<Completion, Error>>,
}

impl TxnHandle {
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub async fn outcome(self) -> Result<Completion, Error> {
        self.join.await
    }
}

/// Mutable, dispatcher-private state of one live instance.
struct Instance {
    txn_name: String,
    status: TxnStatus,
    next_hop: usize,
    env: Env,
    abort_requested: bool,
}

pub struct Dispatcher<T: Transport, D: DispatchLog> {
    id: DispatcherId,
    catalog: Arc<Catalog>,
    config: Arc<RuntimeConfig>,
    transport: Arc<T>,
    log: Arc<Mutex<D>>,
    issuer: Arc<Mutex<TxnIdIssuer>>,
    live: Arc<RwLock<BTreeMap<TxnId, Instance>>>,
    finished: Arc<RwLock<BTreeMap<TxnId, TxnStatus>>>,
}

impl<T: Transport, D: DispatchLog> Clone for Dispatcher<T, D> {
    fn clone(&self) -> Self {
        Dispatcher {
            id: self.id,
            catalog: self.catalog.clone(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            log: self.log.clone(),
            issuer: self.issuer.clone(),
            live: self.live.clone(),
            finished: self.finished.clone(),
        }
    }
}

impl<T: Transport, D: DispatchLog> Dispatcher<T, D> {
    pub fn new(
        id: DispatcherId,
        clock: Box<dyn Clock>,
        catalog: Arc<Catalog>,
        config: RuntimeConfig,
        transport: T,
        log: D,
    ) -> Self {
        Dispatcher {
            id,
            catalog,
            config: Arc::new(config),
            transport: Arc::new(transport),
            log: Arc::new(Mutex::new(log)),
            issuer: Arc::new(Mutex::new(TxnIdIssuer::new(id, clock))),
            live: Arc::new(RwLock::new(BTreeMap::new())),
            finished: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Starts a new instance of `txn_name` and returns a handle to it.
    /// Unknown transactions, bad parameters and an unresolvable first hop
    /// are reported here, before anything is sent.
    #[instrument(skip(self, params))]
    pub async fn submit(&self, txn_name: &str, params: Env) -> Result<TxnHandle, Error> {
        let def = self
            .catalog
            .get(txn_name)
            .cloned()
            .ok_or_else(|| Error::UnknownTransaction(txn_name.to_string()))?;
        let txn_id = self.issuer.lock().await.issue();
        let fut = self.begin(txn_id, def, params).await?;
        let span = debug_span!("instance", dispatcher=?self.id, txn=?txn_id);
        Ok(TxnHandle {
            txn_id,
            join: task::spawn(fut.instrument(span)),
        })
    }

    /// Registers an instance under a caller-chosen id and returns the
    /// future that drives it, without spawning it.
    pub async fn begin(
        &self,
        txn_id: TxnId,
        def: Arc<TransactionDefinition>,
        params: Env,
    ) -> Result<SyncBoxFuture<Result<Completion, Error>>, Error> {
        let env = def.bind_params(params)?;
        let first = def
            .hop(0)
            .ok_or_else(|| Error::UnknownTransaction(def.name.clone()))?;
        first.node_for(self.catalog.schema(), &env, txn_id.logical_time())?;
        {
            let mut live = self.live.write().await;
            if live.contains_key(&txn_id) || self.finished.read().await.contains_key(&txn_id) {
                return Err(Error::DuplicateTxnId(txn_id));
            }
            live.insert(
                txn_id,
                Instance {
                    txn_name: def.name.clone(),
                    status: TxnStatus::Pending,
                    next_hop: 0,
                    env: env.clone(),
                    abort_requested: false,
                },
            );
        }
        let rec = ContinuationRecord {
            txn_id,
            txn_name: def.name.clone(),
            next_hop: 0,
            env,
            status: RecordStatus::Running,
        };
        if let Err(e) = self.persist(&rec).await {
            self.live.write().await.remove(&txn_id);
            return Err(e);
        }
        debug!("began {:?} as {}", txn_id, def.name);
        let this = self.clone();
        Ok(Box::pin(async move { this.drive(txn_id, def).await }))
    }

    /// Asks a live instance to stop before its next hop is dispatched. A
    /// hop already in flight is not recalled, so an abort that arrives
    /// during the last hop changes nothing. Returns false if the instance
    /// is unknown or already finished.
    pub async fn abort(&self, txn_id: TxnId) -> bool {
        match self.live.write().await.get_mut(&txn_id) {
            Some(inst) => {
                debug!("abort requested for {:?}", txn_id);
                inst.abort_requested = true;
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        if let Some(inst) = self.live.read().await.get(&txn_id) {
            return Some(inst.status.clone());
        }
        self.finished.read().await.get(&txn_id).cloned()
    }

    /// Reloads every instance this dispatcher logged and restarts the ones
    /// that hadn't finished from their first unacknowledged hop.
    pub async fn recover(&self) -> Result<Vec<TxnHandle>, Error> {
        let records = self.log.lock().await.load_latest()?;
        let mut handles = Vec::new();
        for rec in records {
            if rec.txn_id.dispatcher != self.id {
                warn!("skipping {:?}: logged by another dispatcher", rec.txn_id);
                continue;
            }
            self.issuer.lock().await.observe(rec.txn_id);
            let status = match rec.status {
                RecordStatus::Running => None,
                RecordStatus::Completed { .. } => Some(TxnStatus::Completed),
                RecordStatus::Failed(e) => Some(TxnStatus::Failed(e)),
            };
            if let Some(status) = status {
                self.finished.write().await.insert(rec.txn_id, status);
                continue;
            }
            let def = match self.catalog.get(&rec.txn_name) {
                Some(def) => def.clone(),
                None => {
                    warn!("cannot resume {:?}: no transaction {}", rec.txn_id, rec.txn_name);
                    let e = Error::UnknownTransaction(rec.txn_name.clone());
                    self.finished
                        .write()
                        .await
                        .insert(rec.txn_id, TxnStatus::Failed(e));
                    continue;
                }
            };
            info!("resuming {:?} at hop {}", rec.txn_id, rec.next_hop);
            self.live.write().await.insert(
                rec.txn_id,
                Instance {
                    txn_name: rec.txn_name,
                    status: TxnStatus::Pending,
                    next_hop: rec.next_hop,
                    env: rec.env,
                    abort_requested: false,
                },
            );
            let this = self.clone();
            let txn_id = rec.txn_id;
            let span = debug_span!("instance", dispatcher=?self.id, txn=?txn_id);
            handles.push(TxnHandle {
                txn_id,
                join: task::spawn(async move { this.drive(txn_id, def).await }.instrument(span)),
            });
        }
        Ok(handles)
    }

    async fn persist(&self, rec: &ContinuationRecord) -> Result<(), Error> {
        self.log.lock().await.append(rec)
    }

    async fn set_status(&self, txn_id: TxnId, status: TxnStatus) {
        if let Some(inst) = self.live.write().await.get_mut(&txn_id) {
            inst.status = status;
        }
    }

    async fn drive(
        &self,
        txn_id: TxnId,
        def: Arc<TransactionDefinition>,
    ) -> Result<Completion, Error> {
        let res = self.drive_(txn_id, &def).await;
        self.finish(txn_id, &res).await;
        res
    }

    async fn drive_(
        &self,
        txn_id: TxnId,
        def: &TransactionDefinition,
    ) -> Result<Completion, Error> {
        let now = txn_id.logical_time();
        let mut returned = None;
        loop {
            let (cursor, env, abort_requested) = {
                let live = self.live.read().await;
                let inst = live
                    .get(&txn_id)
                    .ok_or_else(|| Error::UnknownTransaction(format!("{:?}", txn_id)))?;
                (inst.next_hop, inst.env.clone(), inst.abort_requested)
            };
            // Once the last hop is acked there is nothing left to cancel.
            let hop = match def.hop(cursor) {
                Some(hop) => hop,
                None => {
                    return Ok(Completion {
                        txn_id,
                        env,
                        returned,
                    })
                }
            };
            if abort_requested {
                return Err(Error::Cancelled(cursor));
            }
            let node = hop.node_for(self.catalog.schema(), &env, now)?;
            let msg = HopMessage {
                txn_id,
                txn_name: def.name.clone(),
                hop_index: cursor,
                node,
                timestamp: now,
                env: hop
                    .consumes
                    .iter()
                    .filter_map(|v| env.get(v).map(|x| (v.clone(), x.clone())))
                    .collect(),
            };
            self.set_status(txn_id, TxnStatus::InFlight { hop: cursor })
                .await;
            let ack = self.send_with_retry(msg).await?;
            let (produced, ret) = ack.outcome.into_result()?;
            trace!("hop {} of {:?} produced {:?}", cursor, txn_id, produced);
            let mut env = env;
            for (k, v) in produced {
                env.entry(k).or_insert(v);
            }
            if ret.is_some() {
                returned = ret;
            }
            let rec = ContinuationRecord {
                txn_id,
                txn_name: def.name.clone(),
                next_hop: cursor + 1,
                env: env.clone(),
                status: RecordStatus::Running,
            };
            self.persist(&rec).await?;
            if let Some(inst) = self.live.write().await.get_mut(&txn_id) {
                inst.next_hop = cursor + 1;
                inst.env = env;
            }
        }
    }

    async fn send_with_retry(&self, msg: HopMessage) -> Result<HopAck, Error> {
        let mut attempt: u32 = 0;
        loop {
            let sent = self.transport.send(msg.node, msg.clone());
            let res = match future::timeout(self.config.hop_timeout(), sent).await {
                Ok(Ok(ack)) if ack.txn_id != msg.txn_id || ack.hop_index != msg.hop_index => {
                    warn!(
                        "ack for {:?} hop {} while awaiting hop {}",
                        ack.txn_id, ack.hop_index, msg.hop_index
                    );
                    Err(TransportFault::Disconnected.into())
                }
                Ok(res) => res,
                Err(_) => Err(TransportFault::Timeout.into()),
            };
            match res {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt < self.config.retry_budget => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "hop {} to {:?} failed ({}); retry {} in {:?}",
                        msg.hop_index, msg.node, e, attempt, delay
                    );
                    task::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!("hop {} to {:?}: retries exhausted", msg.hop_index, msg.node);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn finish(&self, txn_id: TxnId, res: &Result<Completion, Error>) {
        let inst = self.live.write().await.remove(&txn_id);
        let (status, rec_status) = match res {
            Ok(c) => (
                TxnStatus::Completed,
                RecordStatus::Completed {
                    returned: c.returned.clone(),
                },
            ),
            Err(e) => (TxnStatus::Failed(e.clone()), RecordStatus::Failed(e.clone())),
        };
        match res {
            Ok(_) => info!("{:?} completed", txn_id),
            Err(e) => info!("{:?} failed: {}", txn_id, e),
        }
        self.finished.write().await.insert(txn_id, status);
        if let Some(inst) = inst {
            let rec = ContinuationRecord {
                txn_id,
                txn_name: inst.txn_name,
                next_hop: inst.next_hop,
                env: inst.env,
                status: rec_status,
            };
            if let Err(e) = self.persist(&rec).await {
                warn!("could not record the end of {:?}: {}", txn_id, e);
            }
        }
    }
}
