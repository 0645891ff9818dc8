// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Hop messages, acks, and the contract for carrying them between a
//! dispatcher and node executors.
//!
//! Delivery is at-least-once from the dispatcher's point of view: any
//! transport failure is reported as a [TransportFault] and the dispatcher
//! resends the identical message, relying on the executor's dedup log to
//! make a duplicate harmless.

use crate::{
    Env, Error, NodeExecutor, NodeId, Store, SyncBoxFuture, TransportFault, TxnId, Value,
};
use async_std::{
    sync::{Arc, Mutex},
    task,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, debug_span, trace, Instrument};

/// Request to apply one hop of one instance at one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopMessage {
    pub txn_id: TxnId,
    pub txn_name: String,
    pub hop_index: usize,
    pub node: NodeId,
    /// The instance's logical timestamp.
    pub timestamp: u64,
    /// Only the variables the hop consumes.
    pub env: Env,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopOutcome {
    Committed {
        /// The variables the hop produced.
        env: Env,
        returned: Option<Value>,
    },
    /// The hop ran `abort`; nothing was written.
    Aborted,
    DataError(String),
    /// The local atomic unit failed to commit; effects are indeterminate.
    StorageFault(String),
    /// The node refused the message (misrouted, unknown transaction).
    /// Nothing is recorded.
    Rejected(Error),
}

impl HopOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, HopOutcome::Committed { .. })
    }

    pub fn into_result(self) -> Result<(Env, Option<Value>), Error> {
        match self {
            HopOutcome::Committed { env, returned } => Ok((env, returned)),
            HopOutcome::Aborted => Err(Error::Aborted),
            HopOutcome::DataError(msg) => Err(Error::Data(msg)),
            HopOutcome::StorageFault(msg) => Err(Error::Storage(msg)),
            HopOutcome::Rejected(e) => Err(e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopAck {
    pub txn_id: TxnId,
    pub hop_index: usize,
    pub node: NodeId,
    pub outcome: HopOutcome,
}

/// `send` resolves to the node's ack, or to `Err(Error::Transport(_))` if
/// the message or the ack was lost or the node couldn't be reached.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, node: NodeId, msg: HopMessage) -> SyncBoxFuture<Result<HopAck, Error>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    Sent,
    Unreachable,
    RequestLost,
    AckLost,
    Acked,
}

/// One line of a [LocalTransport]'s delivery log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub txn_id: TxnId,
    pub hop_index: usize,
    pub node: NodeId,
    pub event: DeliveryEvent,
}

#[derive(Clone, Debug, Default)]
struct FaultPlan {
    down: bool,
    lose_requests: usize,
    lose_acks: usize,
    delay: Option<Duration>,
    stall: Option<Duration>,
}

struct LocalState<S: Store> {
    nodes: BTreeMap<NodeId, NodeExecutor<S>>,
    faults: BTreeMap<NodeId, FaultPlan>,
    log: Vec<Delivery>,
}

/// In-process [Transport] that calls registered executors directly, with
/// per-node fault injection and a log of every delivery attempt.
pub struct LocalTransport<S: Store> {
    state: Arc<Mutex<LocalState<S>>>,
}

impl<S: Store> Clone for LocalTransport<S> {
    fn clone(&self) -> Self {
        LocalTransport {
            state: self.state.clone(),
        }
    }
}

impl<S: Store> Default for LocalTransport<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> LocalTransport<S> {
    pub fn new() -> Self {
        LocalTransport {
            state: Arc::new(Mutex::new(LocalState {
                nodes: BTreeMap::new(),
                faults: BTreeMap::new(),
                log: Vec::new(),
            })),
        }
    }

    pub async fn register(&self, exec: NodeExecutor<S>) {
        let mut st = self.state.lock().await;
        st.nodes.insert(exec.node(), exec);
    }

    /// Marks a node unreachable (or reachable again).
    pub async fn set_down(&self, node: NodeId, down: bool) {
        self.state.lock().await.faults.entry(node).or_default().down = down;
    }

    /// Loses the next `n` messages to `node` before they are applied.
    pub async fn lose_requests(&self, node: NodeId, n: usize) {
        self.state.lock().await.faults.entry(node).or_default().lose_requests = n;
    }

    /// Applies the next `n` messages to `node` but loses their acks: the
    /// node committed and then went silent before replying.
    pub async fn lose_acks(&self, node: NodeId, n: usize) {
        self.state.lock().await.faults.entry(node).or_default().lose_acks = n;
    }

    /// Holds every delivery to `node` for `delay` before applying it.
    pub async fn set_delay(&self, node: NodeId, delay: Option<Duration>) {
        self.state.lock().await.faults.entry(node).or_default().delay = delay;
    }

    /// Holds only the next delivery to `node` for `stall`. The held message
    /// still reaches the node even if the sender stops waiting for it.
    pub async fn stall_next(&self, node: NodeId, stall: Duration) {
        self.state.lock().await.faults.entry(node).or_default().stall = Some(stall);
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.log.clone()
    }

    async fn send_(&self, node: NodeId, msg: HopMessage) -> Result<HopAck, Error> {
        let (txn_id, hop_index) = (msg.txn_id, msg.hop_index);
        let note = |st: &mut LocalState<S>, event| {
            st.log.push(Delivery {
                txn_id,
                hop_index,
                node,
                event,
            })
        };
        let (exec, delay, stall) = {
            let mut st = self.state.lock().await;
            note(&mut *st, DeliveryEvent::Sent);
            let plan = st.faults.get(&node).cloned().unwrap_or_default();
            let exec = match st.nodes.get(&node) {
                Some(exec) if !plan.down => exec.clone(),
                _ => {
                    note(&mut *st, DeliveryEvent::Unreachable);
                    return Err(TransportFault::Unreachable(node).into());
                }
            };
            if plan.lose_requests > 0 {
                st.faults.entry(node).or_default().lose_requests -= 1;
                note(&mut *st, DeliveryEvent::RequestLost);
                debug!("losing request for hop {} of {:?}", hop_index, txn_id);
                return Err(TransportFault::Timeout.into());
            }
            let stall = st.faults.entry(node).or_default().stall.take();
            (exec, plan.delay, stall)
        };
        if let Some(d) = delay {
            task::sleep(d).await;
        }
        let ack = match stall {
            Some(d) => {
                debug!("stalling hop {} of {:?} for {:?}", hop_index, txn_id, d);
                task::spawn(async move {
                    task::sleep(d).await;
                    exec.apply_hop(msg).await
                })
                .await
            }
            None => exec.apply_hop(msg).await,
        };
        let mut st = self.state.lock().await;
        let plan = st.faults.entry(node).or_default();
        if plan.lose_acks > 0 {
            plan.lose_acks -= 1;
            note(&mut *st, DeliveryEvent::AckLost);
            debug!("losing ack for hop {} of {:?}", hop_index, txn_id);
            return Err(TransportFault::Disconnected.into());
        }
        note(&mut *st, DeliveryEvent::Acked);
        trace!("delivered ack {:?}", ack.outcome);
        Ok(ack)
    }
}

impl<S: Store> Transport for LocalTransport<S> {
    fn send(&self, node: NodeId, msg: HopMessage) -> SyncBoxFuture<Result<HopAck, Error>> {
        let this = self.clone();
        Box::pin(async move {
            let span = debug_span!("local_send", ?node, txn=?msg.txn_id, hop=msg.hop_index);
            this.send_(node, msg).instrument(span).await
        })
    }
}
