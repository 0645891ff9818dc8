// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate runs distributed transactions over horizontally partitioned data
//! as _hop chains_: a transaction is an ordered sequence of hops, each confined
//! to a single data-owning node and applied there atomically. Hops forward an
//! environment of bound variables from one to the next. There is no global
//! coordinator and no two-phase commit.
//!
//! ## Summary
//!
//!   - A [Schema] maps every table row to exactly one node through a pure
//!     [PartitionExpr] over its primary key.
//!
//!   - The [compile] step turns a front-end [TxnSource] into a
//!     [TransactionDefinition]: a linear array of hops, each statically proven
//!     to touch only rows owned by its own node, annotated with the variables
//!     it consumes from and produces into the environment.
//!
//!   - A [Dispatcher] drives each transaction instance as its own
//!     task, one node round-trip at a time, persisting a continuation record
//!     after every ack so a restart resumes from the last acknowledged hop.
//!
//!   - A [NodeExecutor] applies a hop inside one local atomic unit, committing
//!     its writes together with a dedup record keyed by `(txn, hop)`. Replays
//!     of an already-applied hop return the recorded result unchanged, which is
//!     what makes the dispatcher's retries safe.
//!
//!   - A [Transport] carries [HopMessage]s and [HopAck]s; [LocalTransport]
//!     delivers in-process (with fault injection) and [NetTransport] delivers
//!     over edelcrantz RPC connections.
//!
//! ## Caveats
//!
//!  - Hops already committed stay committed when a later hop fails. There is
//!    no compensation; transaction authors design around this, typically with
//!    commutative or monotonic updates.
//!
//!  - Only transport faults are retried. Data errors and storage faults fail
//!    the instance at once.
//!
//!  - The runtime performs no cross-hop conflict analysis between concurrent
//!    instances beyond per-node serialization of overlapping hops.

use futures::Future;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, pin::Pin};
use thiserror::Error;

/// Why a message or ack did not make it across the transport. These are the
/// only failures the dispatcher retries.
#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportFault {
    #[error("node {0:?} unreachable")]
    Unreachable(NodeId),
    #[error("timed out awaiting ack")]
    Timeout,
    #[error("connection lost before ack")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    #[error("compile error: {}", summarize_issues(.0))]
    Compile(Vec<CompileIssue>),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("data error: {0}")]
    Data(String),
    #[error("transport fault: {0}")]
    Transport(TransportFault),
    #[error("storage fault: {0}")]
    Storage(String),
    #[error("transaction aborted")]
    Aborted,
    #[error("transaction cancelled before hop {0} was dispatched")]
    Cancelled(usize),
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),
    #[error("transaction id {0:?} is already in use")]
    DuplicateTxnId(TxnId),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Only transport faults are safe to replay, because hop application is
    /// idempotent per `(txn, hop)`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<TransportFault> for Error {
    fn from(fault: TransportFault) -> Self {
        Error::Transport(fault)
    }
}

impl From<edelcrantz::Error> for Error {
    fn from(_: edelcrantz::Error) -> Self {
        Error::Transport(TransportFault::Disconnected)
    }
}

fn summarize_issues(issues: &[CompileIssue]) -> String {
    match issues {
        [] => "no issues recorded".to_string(),
        [one] => one.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

mod compiler;
mod config;
mod dispatch_log;
mod dispatcher;
mod executor;
mod ids;
mod interp;
mod ir;
mod network;
mod schema;
mod storage;
mod transport;
mod value;

// As in many async codebases we wrap most nontrivial async fn calls in a boxed
// future: it costs an extra heap allocation per call, but compiles faster,
// handles recursion, and lets us spawn the result. The standard BoxFuture is
// not Sync, so we define our own.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use compiler::{
    compile, Catalog, CompileIssue, Hop, NodeBinding, RowRef, TransactionDefinition,
};
pub use config::RuntimeConfig;
pub use dispatch_log::{
    ContinuationRecord, DispatchLog, FileDispatchLog, MemDispatchLog, RecordStatus,
};
pub use dispatcher::{Completion, Dispatcher, TxnHandle, TxnStatus};
pub use executor::NodeExecutor;
pub use ids::{Clock, DispatcherId, NodeId, RealClock, TestClock, TxnId, TxnIdIssuer};
pub use ir::{key, BinaryOp, Expr, HopSource, HopTarget, KeyExprs, Stmt, TxnSource, UnaryOp};
pub use network::{NetTransport, NodeServer};
pub use schema::{Column, PartitionExpr, Schema, SchemaBuilder, Table};
pub use storage::{AtomicUnit, DedupRecord, FileStore, MemStore, Store, Write};
pub use transport::{
    Delivery, DeliveryEvent, HopAck, HopMessage, HopOutcome, LocalTransport, Transport,
};
pub use value::{env, Env, KeyTuple, Row, TypeName, Value};
