// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Hop delivery over edelcrantz RPC connections. A [NodeServer] answers
//! `Apply` requests with its executor's ack; a [NetTransport] is the
//! dispatcher's end, holding one connection per node.
//!
//! Both ends of an edelcrantz connection have to be advanced for either to
//! make progress, so each connection gets its own service worker task.

use crate::{
    DispatcherId, Error, HopAck, HopMessage, NodeExecutor, NodeId, Store, SyncBoxFuture, Transport,
    TransportFault,
};
use async_std::{
    sync::{Arc, Mutex, RwLock},
    task,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, debug_span, trace, warn, Instrument};

type Conn = edelcrantz::Connection<OneWay, Req, Res>;
type Queue = edelcrantz::Queue<OneWay, Req, Res>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Req {
    Apply(HopMessage),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Res {
    Ack(HopAck),
    /// The far end doesn't execute hops.
    Refused(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum OneWay {
    /// Sent once by a dispatcher when it connects.
    Hello(DispatcherId),
}

/// Runs the service loop for one connection until the connection fails.
fn spawn_service_worker<F>(conn: Arc<Mutex<Conn>>, label: String, serve: F)
where
    F: Fn(Req) -> SyncBoxFuture<Res> + Clone + Send + Sync + 'static,
{
    task::spawn(async move {
        let mut n: usize = 0;
        loop {
            n += 1;
            let sreq = {
                let serve = serve.clone();
                let span = debug_span!("rpc-task", conn=%label, ?n);
                move |req| task::spawn(serve(req).instrument(span))
            };
            let sow = {
                let label = label.clone();
                move |ow| match ow {
                    OneWay::Hello(id) => debug!("{} greeted by dispatcher {:?}", label, id),
                }
            };
            let mut guard = conn.lock().await;
            trace!("service worker for {} advancing (step {:?})", label, n);
            let span = debug_span!("service", conn=%label);
            let res = guard.advance(sreq, sow).instrument(span).await;
            trace!(
                "service worker for {} advanced (step {:?}), got result {:?}",
                label,
                n,
                res
            );
            match res {
                Ok(()) => (),
                // The dispatcher gave up waiting (timeout) and dropped the
                // response future; it will resend.
                Err(edelcrantz::Error::ResponseChannelDropped(_)) => (),
                Err(_) => break,
            }
        }
        warn!("service worker for {} exited", label);
    });
}

/// Serves one node's executor to any number of dispatcher connections.
pub struct NodeServer<S: Store> {
    exec: NodeExecutor<S>,
}

impl<S: Store> Clone for NodeServer<S> {
    fn clone(&self) -> Self {
        NodeServer {
            exec: self.exec.clone(),
        }
    }
}

impl<S: Store> NodeServer<S> {
    pub fn new(exec: NodeExecutor<S>) -> Self {
        NodeServer { exec }
    }

    pub fn executor(&self) -> &NodeExecutor<S> {
        &self.exec
    }

    /// Accepts a connection from a dispatcher and starts serving it. The
    /// `io` handle should be a full-duplex `AsyncRead+AsyncWrite` type.
    pub fn accept<IO: edelcrantz::AsyncReadWrite>(&self, io: IO) {
        let node = self.exec.node();
        debug!("node {:?} accepting a dispatcher connection", node);
        let conn = Arc::new(Mutex::new(edelcrantz::Connection::new(io)));
        let this = self.clone();
        spawn_service_worker(conn, format!("node {:?}", node), move |req| {
            this.serve_req(req)
        });
    }

    fn serve_req(&self, req: Req) -> SyncBoxFuture<Res> {
        let this = self.clone();
        Box::pin(async move { this.serve_req_(req).await })
    }

    async fn serve_req_(&self, req: Req) -> Res {
        match req {
            Req::Apply(msg) => {
                trace!("apply request {:?}", msg);
                let ack = self.exec.apply_hop(msg).await;
                trace!("apply response {:?}", ack);
                Res::Ack(ack)
            }
        }
    }
}

fn refuse(req: Req) -> SyncBoxFuture<Res> {
    Box::pin(async move {
        warn!("dispatcher connection got a request: {:?}", req);
        Res::Refused("dispatchers do not apply hops".into())
    })
}

/// A [Transport] over edelcrantz connections, one per node.
#[derive(Clone)]
pub struct NetTransport {
    dispatcher: DispatcherId,
    queues: Arc<RwLock<BTreeMap<NodeId, Queue>>>,
}

impl NetTransport {
    pub fn new(dispatcher: DispatcherId) -> Self {
        NetTransport {
            dispatcher,
            queues: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Adds (or replaces) the connection to `node` and starts its service
    /// worker. The `io` handle should be a full-duplex `AsyncRead+AsyncWrite`
    /// type.
    pub async fn connect<IO: edelcrantz::AsyncReadWrite>(
        &self,
        node: NodeId,
        io: IO,
    ) -> Result<(), Error> {
        debug!(
            "connecting dispatcher {:?} to node {:?}",
            self.dispatcher, node
        );
        let conn = edelcrantz::Connection::new(io);
        let queue = conn.queue.clone();
        spawn_service_worker(
            Arc::new(Mutex::new(conn)),
            format!("{:?}->{:?}", self.dispatcher, node),
            refuse,
        );
        queue.enqueue_oneway(OneWay::Hello(self.dispatcher)).await?;
        self.queues.write().await.insert(node, queue);
        Ok(())
    }

    pub async fn connected(&self) -> Vec<NodeId> {
        self.queues.read().await.keys().cloned().collect()
    }

    async fn send_(&self, node: NodeId, msg: HopMessage) -> Result<HopAck, Error> {
        let fut = match self.queues.read().await.get(&node) {
            None => return Err(TransportFault::Unreachable(node).into()),
            Some(queue) => queue.enqueue_request(Req::Apply(msg)),
        };
        match fut.await {
            Ok(Res::Ack(ack)) => Ok(ack),
            Ok(Res::Refused(why)) => Err(Error::Schema(format!("{:?} refused hop: {}", node, why))),
            Err(e) => {
                warn!("rpc to {:?} failed: {:?}", node, e);
                Err(e.into())
            }
        }
    }
}

impl Transport for NetTransport {
    fn send(&self, node: NodeId, msg: HopMessage) -> SyncBoxFuture<Result<HopAck, Error>> {
        let this = self.clone();
        Box::pin(async move {
            let span = debug_span!("net_send", ?node, txn=?msg.txn_id, hop=msg.hop_index);
            this.send_(node, msg).instrument(span).await
        })
    }
}
