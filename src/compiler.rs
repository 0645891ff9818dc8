// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Turns a [TxnSource] into a checked [TransactionDefinition].
//!
//! Besides ordinary name and type checking, the compiler proves that every
//! row a hop touches lives on that hop's node. It does this symbolically:
//! each row access's key expressions are substituted into the table's
//! [PartitionExpr], as are the hop target's, and both sides are normalized
//! into a canonical polynomial over the variables the hop receives. Keys
//! may only mention literals, parameters, the logical timestamp and
//! variables bound by earlier hops, so those are constants for the duration
//! of the hop and equal polynomials mean equal nodes. Anything the
//! normalizer cannot prove equal is rejected.
//!
//! The same restriction means every row a hop can touch is computable when
//! the hop starts; that list is kept as the hop's `footprint` and used by
//! the executor to take row locks up front.

use crate::{
    interp,
    ir::KeyExprs,
    BinaryOp, Env, Error, Expr, HopSource, HopTarget, NodeId, PartitionExpr, Schema, Stmt, Table,
    TxnSource, TypeName, UnaryOp, Value,
};
use async_std::sync::Arc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileIssue {
    #[error("transaction {0} has no hops")]
    NoHops(String),
    #[error("transaction {0} is already defined")]
    DuplicateTransaction(String),
    #[error("parameter {0} declared twice")]
    DuplicateParameter(String),
    #[error("hop {hop}: unknown table {table}")]
    UnknownTable { hop: usize, table: String },
    #[error("hop {hop}: unknown column {table}.{column}")]
    UnknownColumn {
        hop: usize,
        table: String,
        column: String,
    },
    #[error("hop {hop}: column {table}.{column} given twice")]
    DuplicateColumn {
        hop: usize,
        table: String,
        column: String,
    },
    #[error("hop {hop}: bad key for {table}: {detail}")]
    BadKey {
        hop: usize,
        table: String,
        detail: String,
    },
    #[error("hop {hop}: undeclared variable {name}")]
    Undeclared { hop: usize, name: String },
    #[error("hop {hop}: variable {name} is already declared")]
    Redeclared { hop: usize, name: String },
    #[error("hop {hop}: {name} is bound outside this hop and cannot be assigned")]
    NotAssignable { hop: usize, name: String },
    #[error("hop {hop}: type mismatch: {detail}")]
    TypeMismatch { hop: usize, detail: String },
    #[error("hop {hop}: {detail}")]
    Misplaced { hop: usize, detail: String },
    #[error("hop {hop}: cross-partition access within one hop: {detail}")]
    CrossPartition { hop: usize, detail: String },
    #[error("hop {hop}: bad target: {detail}")]
    BadTarget { hop: usize, detail: String },
}

/// One row a hop may read or write, with key expressions that are fixed
/// at hop entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRef {
    pub table: String,
    pub key: KeyExprs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBinding {
    Literal(NodeId),
    Partition { table: String, key: KeyExprs },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub index: usize,
    pub binding: NodeBinding,
    pub body: Vec<Stmt>,
    /// Variables this hop reads from the transaction environment.
    pub consumes: BTreeSet<String>,
    /// Variables this hop adds to the transaction environment.
    pub produces: BTreeSet<String>,
    pub footprint: Vec<RowRef>,
}

impl Hop {
    /// Resolves the node this hop runs on, given the environment it will
    /// receive and the instance's logical timestamp.
    pub fn node_for(&self, schema: &Schema, env: &Env, now: u64) -> Result<NodeId, Error> {
        match &self.binding {
            NodeBinding::Literal(n) => Ok(*n),
            NodeBinding::Partition { table, key } => {
                let tuple = interp::eval_key(schema, table, key, env, now)?;
                schema.resolve_tuple(table, &tuple)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDefinition {
    pub name: String,
    pub params: Vec<(String, TypeName)>,
    pub hops: Vec<Hop>,
    pub returns: Option<TypeName>,
}

impl TransactionDefinition {
    pub fn hop(&self, index: usize) -> Option<&Hop> {
        self.hops.get(index)
    }

    /// Checks a caller's parameters against the declared ones and returns
    /// them as the instance's initial environment.
    pub fn bind_params(&self, params: Env) -> Result<Env, Error> {
        let mut params = params;
        let mut out = Env::new();
        for (name, ty) in &self.params {
            let v = params.remove(name).ok_or_else(|| {
                Error::Schema(format!("{} missing parameter {}", self.name, name))
            })?;
            let shown = v.to_string();
            let v = v.coerce_to(*ty).ok_or_else(|| {
                Error::Schema(format!(
                    "{} parameter {} expects {:?}, got {}",
                    self.name, name, ty, shown
                ))
            })?;
            out.insert(name.clone(), v);
        }
        if let Some(extra) = params.keys().next() {
            return Err(Error::Schema(format!(
                "{} has no parameter {}",
                self.name, extra
            )));
        }
        Ok(out)
    }
}

/// Immutable catalog of schema and compiled transactions, built once at
/// startup and shared by dispatchers and executors.
#[derive(Clone, Debug)]
pub struct Catalog {
    schema: Arc<Schema>,
    txns: BTreeMap<String, Arc<TransactionDefinition>>,
}

impl Catalog {
    pub fn new(schema: Schema) -> Self {
        Catalog {
            schema: Arc::new(schema),
            txns: BTreeMap::new(),
        }
    }

    pub fn define(&mut self, source: &TxnSource) -> Result<Arc<TransactionDefinition>, Error> {
        if self.txns.contains_key(&source.name) {
            return Err(Error::Compile(vec![CompileIssue::DuplicateTransaction(
                source.name.clone(),
            )]));
        }
        let def = Arc::new(compile(&self.schema, source)?);
        debug!("defined {} with {} hops", def.name, def.hops.len());
        self.txns.insert(def.name.clone(), def.clone());
        Ok(def)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TransactionDefinition>> {
        self.txns.get(name)
    }

    pub fn hop(&self, name: &str, index: usize) -> Option<&Hop> {
        self.txns.get(name).and_then(|d| d.hop(index))
    }
}

pub fn compile(schema: &Schema, source: &TxnSource) -> Result<TransactionDefinition, Error> {
    let mut ck = Checker::new(schema, source.hops.len());
    for (name, ty) in &source.params {
        if ck.globals.contains_key(name) {
            ck.issues
                .push(CompileIssue::DuplicateParameter(name.clone()));
        }
        ck.globals.insert(
            name.clone(),
            VarInfo {
                ty: *ty,
                origin: Origin::Param,
            },
        );
    }
    if source.hops.is_empty() {
        ck.issues.push(CompileIssue::NoHops(source.name.clone()));
    }
    let hops: Vec<Hop> = source
        .hops
        .iter()
        .enumerate()
        .map(|(i, h)| ck.hop(i, h))
        .collect();
    if !ck.issues.is_empty() {
        debug!("{} rejected with {} issues", source.name, ck.issues.len());
        return Err(Error::Compile(ck.issues));
    }
    Ok(TransactionDefinition {
        name: source.name.clone(),
        params: source.params.clone(),
        hops,
        returns: ck.returns,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Param,
    EarlierHop,
    Local,
}

#[derive(Clone, Copy, Debug)]
struct VarInfo {
    ty: TypeName,
    origin: Origin,
}

/// What we know about the current hop's node, symbolically.
enum Binding {
    /// The target was already reported as broken; skip partition checks.
    Invalid,
    Known(Poly),
    /// Valid target whose node we can't reason about; every access fails.
    Opaque,
}

struct Checker<'a> {
    schema: &'a Schema,
    issues: Vec<CompileIssue>,
    /// Parameters and top-level variables of already-checked hops.
    globals: BTreeMap<String, VarInfo>,
    /// Scopes of the hop being checked; `frames[0]` is its top level.
    frames: Vec<BTreeMap<String, TypeName>>,
    hop: usize,
    hop_count: usize,
    loop_depth: usize,
    binding: Binding,
    consumes: BTreeSet<String>,
    footprint: Vec<RowRef>,
    returns: Option<TypeName>,
}

impl<'a> Checker<'a> {
    fn new(schema: &'a Schema, hop_count: usize) -> Self {
        Checker {
            schema,
            issues: Vec::new(),
            globals: BTreeMap::new(),
            frames: Vec::new(),
            hop: 0,
            hop_count,
            loop_depth: 0,
            binding: Binding::Invalid,
            consumes: BTreeSet::new(),
            footprint: Vec::new(),
            returns: None,
        }
    }

    fn hop(&mut self, index: usize, src: &HopSource) -> Hop {
        self.hop = index;
        self.frames = vec![BTreeMap::new()];
        self.loop_depth = 0;
        let binding = self.target(&src.target);
        for s in &src.body {
            self.stmt(s);
        }
        let top = self.frames.pop().unwrap_or_default();
        self.frames.clear();
        let produces = top.keys().cloned().collect();
        for (name, ty) in top {
            self.globals.insert(
                name,
                VarInfo {
                    ty,
                    origin: Origin::EarlierHop,
                },
            );
        }
        Hop {
            index,
            binding,
            body: src.body.clone(),
            consumes: std::mem::take(&mut self.consumes),
            produces,
            footprint: std::mem::take(&mut self.footprint),
        }
    }

    fn lookup(&self, name: &str) -> Option<VarInfo> {
        for frame in self.frames.iter().rev() {
            if let Some(ty) = frame.get(name) {
                return Some(VarInfo {
                    ty: *ty,
                    origin: Origin::Local,
                });
            }
        }
        self.globals.get(name).copied()
    }

    fn declare(&mut self, name: &str, ty: TypeName) {
        if self.lookup(name).is_some() {
            self.issues.push(CompileIssue::Redeclared {
                hop: self.hop,
                name: name.to_string(),
            });
            return;
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), ty);
        }
    }

    fn mismatch(&mut self, detail: String) {
        self.issues.push(CompileIssue::TypeMismatch {
            hop: self.hop,
            detail,
        });
    }

    fn misplaced(&mut self, detail: &str) {
        self.issues.push(CompileIssue::Misplaced {
            hop: self.hop,
            detail: detail.to_string(),
        });
    }

    fn table(&mut self, name: &str) -> Option<&'a Table> {
        let schema = self.schema;
        let t = schema.table(name);
        if t.is_none() {
            self.issues.push(CompileIssue::UnknownTable {
                hop: self.hop,
                table: name.to_string(),
            });
        }
        t
    }

    fn target(&mut self, target: &HopTarget) -> NodeBinding {
        match target {
            HopTarget::Node(n) => {
                self.binding = match self.schema.node_in_range(i64::from(n.0)) {
                    Ok(_) => Binding::Known(Poly::constant(i64::from(n.0))),
                    Err(_) => {
                        self.issues.push(CompileIssue::BadTarget {
                            hop: self.hop,
                            detail: format!(
                                "node {:?} outside cluster of {}",
                                n,
                                self.schema.cluster_size()
                            ),
                        });
                        Binding::Invalid
                    }
                };
                NodeBinding::Literal(*n)
            }
            HopTarget::Partition { table, key } => {
                self.binding = Binding::Invalid;
                if let Some(t) = self.table(table) {
                    if self.check_key(t, key) {
                        self.binding = match key_poly(t, key) {
                            Some(p) => match p.as_const() {
                                Some(c) if self.schema.node_in_range(c).is_err() => {
                                    self.issues.push(CompileIssue::BadTarget {
                                        hop: self.hop,
                                        detail: format!(
                                            "{} key always resolves to node {}, outside the cluster",
                                            table, c
                                        ),
                                    });
                                    Binding::Invalid
                                }
                                _ => Binding::Known(p),
                            },
                            None => Binding::Opaque,
                        };
                    }
                } else {
                    for (_, e) in key {
                        self.expr(e);
                    }
                }
                NodeBinding::Partition {
                    table: table.clone(),
                    key: key.clone(),
                }
            }
        }
    }

    /// Checks that `key` is a complete, well-typed primary key of `t` whose
    /// expressions are fixed at hop entry. Returns whether it is.
    fn check_key(&mut self, t: &Table, key: &KeyExprs) -> bool {
        let mut ok = true;
        let mut seen = BTreeSet::new();
        let hop = self.hop;
        let bad_key = |detail: String| CompileIssue::BadKey {
            hop,
            table: t.name.clone(),
            detail,
        };
        for (col, e) in key {
            let ty = self.expr(e);
            if !seen.insert(col.as_str()) {
                self.issues.push(bad_key(format!("{} bound twice", col)));
                ok = false;
            }
            match t.column(col) {
                None => {
                    self.issues.push(CompileIssue::UnknownColumn {
                        hop: self.hop,
                        table: t.name.clone(),
                        column: col.clone(),
                    });
                    ok = false;
                    continue;
                }
                Some(_) if !t.is_primary(col) => {
                    self.issues
                        .push(bad_key(format!("{} is not a primary key column", col)));
                    ok = false;
                }
                Some(c) => match ty {
                    Some(ty) if !c.ty.accepts(&ty) => {
                        self.mismatch(format!(
                            "key {}.{} expects {:?}, got {:?}",
                            t.name, col, c.ty, ty
                        ));
                        ok = false;
                    }
                    None => ok = false,
                    _ => (),
                },
            }
            if e.reads_rows() {
                self.issues
                    .push(bad_key(format!("key {} reads a row", col)));
                ok = false;
            }
            for v in e.vars() {
                if let Some(VarInfo {
                    origin: Origin::Local,
                    ..
                }) = self.lookup(&v)
                {
                    self.issues.push(bad_key(format!(
                        "key {} depends on {}, which is assigned inside the hop",
                        col, v
                    )));
                    ok = false;
                }
            }
        }
        for p in &t.primary {
            if !seen.contains(p.as_str()) {
                self.issues.push(CompileIssue::BadKey {
                    hop: self.hop,
                    table: t.name.clone(),
                    detail: format!("omits primary column {}", p),
                });
                ok = false;
            }
        }
        ok
    }

    /// Checks a point access and records it in the footprint.
    fn row_access(&mut self, table: &str, key: &KeyExprs) -> Option<&'a Table> {
        let t = match self.table(table) {
            Some(t) => t,
            None => {
                for (_, e) in key {
                    self.expr(e);
                }
                return None;
            }
        };
        if self.check_key(t, key) {
            let provable = match (&self.binding, key_poly(t, key)) {
                (Binding::Invalid, _) => true,
                (Binding::Known(node), Some(p)) => *node == p,
                _ => false,
            };
            if !provable {
                self.issues.push(CompileIssue::CrossPartition {
                    hop: self.hop,
                    detail: format!("{} row is not provably on this hop's node", table),
                });
            }
            let r = RowRef {
                table: table.to_string(),
                key: key.clone(),
            };
            if !self.footprint.contains(&r) {
                self.footprint.push(r);
            }
        }
        Some(t)
    }

    fn block(&mut self, stmts: &[Stmt]) {
        self.frames.push(BTreeMap::new());
        for s in stmts {
            self.stmt(s);
        }
        self.frames.pop();
    }

    fn cond(&mut self, e: &Expr, what: &str) {
        match self.expr(e) {
            Some(TypeName::Bool) | None => (),
            Some(ty) => self.mismatch(format!("{} condition is {:?}, not Bool", what, ty)),
        }
    }

    fn columns(&mut self, t: &Table, cols: &[(String, Expr)], what: &str) {
        let mut seen = BTreeSet::new();
        for (col, e) in cols {
            let ty = self.expr(e);
            if !seen.insert(col.as_str()) {
                self.issues.push(CompileIssue::DuplicateColumn {
                    hop: self.hop,
                    table: t.name.clone(),
                    column: col.clone(),
                });
            }
            match t.column(col) {
                None => self.issues.push(CompileIssue::UnknownColumn {
                    hop: self.hop,
                    table: t.name.clone(),
                    column: col.clone(),
                }),
                Some(_) if t.is_primary(col) => self.issues.push(CompileIssue::BadKey {
                    hop: self.hop,
                    table: t.name.clone(),
                    detail: format!("cannot {} primary column {}", what, col),
                }),
                Some(c) => {
                    if let Some(ty) = ty {
                        if !c.ty.accepts(&ty) {
                            self.mismatch(format!(
                                "{}.{} expects {:?}, got {:?}",
                                t.name, col, c.ty, ty
                            ));
                        }
                    }
                }
            }
        }
    }

    fn stmt(&mut self, s: &Stmt) {
        match s {
            Stmt::Let { name, ty, init } => {
                if let Some(got) = self.expr(init) {
                    if !ty.accepts(&got) {
                        self.mismatch(format!("let {}: {:?} initialized with {:?}", name, ty, got));
                    }
                }
                self.declare(name, *ty);
            }
            Stmt::Set { name, value } => {
                let got = self.expr(value);
                match self.lookup(name) {
                    None => self.issues.push(CompileIssue::Undeclared {
                        hop: self.hop,
                        name: name.clone(),
                    }),
                    Some(VarInfo {
                        origin: Origin::Local,
                        ty,
                    }) => {
                        if let Some(got) = got {
                            if !ty.accepts(&got) {
                                self.mismatch(format!("{}: {:?} assigned {:?}", name, ty, got));
                            }
                        }
                    }
                    Some(_) => self.issues.push(CompileIssue::NotAssignable {
                        hop: self.hop,
                        name: name.clone(),
                    }),
                }
            }
            Stmt::Update {
                table,
                key,
                assigns,
            } => match self.row_access(table, key) {
                Some(t) => self.columns(t, assigns, "update"),
                None => {
                    for (_, e) in assigns {
                        self.expr(e);
                    }
                }
            },
            Stmt::Insert { table, key, values } => match self.row_access(table, key) {
                Some(t) => self.columns(t, values, "insert"),
                None => {
                    for (_, e) in values {
                        self.expr(e);
                    }
                }
            },
            Stmt::If { cond, then, els } => {
                self.cond(cond, "if");
                self.block(then);
                self.block(els);
            }
            Stmt::While {
                cond,
                body,
                max_iterations,
            } => {
                self.cond(cond, "while");
                if *max_iterations == 0 {
                    self.misplaced("while loop must allow at least one iteration");
                }
                self.loop_depth += 1;
                self.block(body);
                self.loop_depth -= 1;
            }
            Stmt::Break | Stmt::Continue => {
                if self.loop_depth == 0 {
                    self.misplaced("break or continue outside a loop");
                }
            }
            Stmt::Abort => {
                if self.hop != 0 {
                    self.misplaced("abort is only allowed in the first hop");
                }
            }
            Stmt::Return(e) => {
                if self.hop + 1 != self.hop_count {
                    self.misplaced("return is only allowed in the last hop");
                }
                if let Some(ty) = self.expr(e) {
                    match self.returns {
                        None => self.returns = Some(ty),
                        Some(prev) if prev == ty => (),
                        Some(prev) => {
                            self.mismatch(format!("returns both {:?} and {:?}", prev, ty))
                        }
                    }
                }
            }
        }
    }

    /// Infers the type of `e`, recording issues. `None` means an issue
    /// has already been reported for it.
    fn expr(&mut self, e: &Expr) -> Option<TypeName> {
        match e {
            Expr::Lit(v) => Some(v.type_name()),
            Expr::Now => Some(TypeName::Int),
            Expr::Var(name) => match self.lookup(name) {
                Some(info) => {
                    if info.origin != Origin::Local {
                        self.consumes.insert(name.clone());
                    }
                    Some(info.ty)
                }
                None => {
                    self.issues.push(CompileIssue::Undeclared {
                        hop: self.hop,
                        name: name.clone(),
                    });
                    None
                }
            },
            Expr::Field { table, key, column } => {
                let t = self.row_access(table, key)?;
                match t.column(column) {
                    Some(c) => Some(c.ty),
                    None => {
                        self.issues.push(CompileIssue::UnknownColumn {
                            hop: self.hop,
                            table: table.clone(),
                            column: column.clone(),
                        });
                        None
                    }
                }
            }
            Expr::Unary { op, expr } => {
                let ty = self.expr(expr)?;
                match (op, ty) {
                    (UnaryOp::Neg, ty) if ty.is_numeric() => Some(ty),
                    (UnaryOp::Not, TypeName::Bool) => Some(TypeName::Bool),
                    _ => {
                        self.mismatch(format!("{:?} applied to {:?}", op, ty));
                        None
                    }
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                let (l, r) = (l?, r?);
                let res = binary_type(*op, l, r);
                if res.is_none() {
                    self.mismatch(format!("{:?} applied to {:?} and {:?}", op, l, r));
                }
                res
            }
        }
    }
}

/// Result type of a binary operator, or `None` if the operands don't fit.
pub(crate) fn binary_type(op: BinaryOp, l: TypeName, r: TypeName) -> Option<TypeName> {
    use TypeName::*;
    match op {
        BinaryOp::Add if l == Str && r == Str => Some(Str),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => match (l, r) {
            (Int, Int) => Some(Int),
            (l, r) if l.is_numeric() && r.is_numeric() => Some(Float),
            _ => None,
        },
        BinaryOp::Mod => match (l, r) {
            (Int, Int) => Some(Int),
            _ => None,
        },
        BinaryOp::Eq | BinaryOp::Neq => {
            if l == r || (l.is_numeric() && r.is_numeric()) {
                Some(Bool)
            } else {
                None
            }
        }
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            if (l.is_numeric() && r.is_numeric()) || (l == Str && r == Str) {
                Some(Bool)
            } else {
                None
            }
        }
        BinaryOp::And | BinaryOp::Or => match (l, r) {
            (Bool, Bool) => Some(Bool),
            _ => None,
        },
    }
}

// Canonical integer polynomials. A monomial is a sorted list of atoms;
// division and modulus that can't be folded become atoms over canonical
// operands, so `(a + b) % 3` and `(b + a) % 3` normalize identically.

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq)]
enum Atom {
    Var(String),
    Now,
    Div(Poly, Poly),
    Mod(Poly, Poly),
}

#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq)]
struct Poly(BTreeMap<Vec<Atom>, i64>);

impl Poly {
    fn constant(c: i64) -> Poly {
        let mut terms = BTreeMap::new();
        if c != 0 {
            terms.insert(Vec::new(), c);
        }
        Poly(terms)
    }

    fn atom(a: Atom) -> Poly {
        let mut terms = BTreeMap::new();
        terms.insert(vec![a], 1);
        Poly(terms)
    }

    fn as_const(&self) -> Option<i64> {
        match self.0.len() {
            0 => Some(0),
            1 => self.0.get(&Vec::new()).copied(),
            _ => None,
        }
    }

    fn add(&self, other: &Poly) -> Option<Poly> {
        let mut terms = self.0.clone();
        for (mono, c) in &other.0 {
            let slot = terms.entry(mono.clone()).or_insert(0);
            *slot = slot.checked_add(*c)?;
        }
        terms.retain(|_, c| *c != 0);
        Some(Poly(terms))
    }

    fn neg(&self) -> Option<Poly> {
        let mut terms = BTreeMap::new();
        for (mono, c) in &self.0 {
            terms.insert(mono.clone(), c.checked_neg()?);
        }
        Some(Poly(terms))
    }

    fn sub(&self, other: &Poly) -> Option<Poly> {
        self.add(&other.neg()?)
    }

    fn mul(&self, other: &Poly) -> Option<Poly> {
        let mut acc = Poly::default();
        for (ma, ca) in &self.0 {
            for (mb, cb) in &other.0 {
                let mut mono: Vec<Atom> = ma.iter().chain(mb.iter()).cloned().collect();
                mono.sort();
                let mut term = BTreeMap::new();
                term.insert(mono, ca.checked_mul(*cb)?);
                acc = acc.add(&Poly(term))?;
            }
        }
        Some(acc)
    }

    fn div(&self, other: &Poly) -> Option<Poly> {
        match (self.as_const(), other.as_const()) {
            (_, Some(0)) => None,
            (Some(a), Some(b)) => Some(Poly::constant(a.checked_div_euclid(b)?)),
            (_, Some(1)) => Some(self.clone()),
            _ => Some(Poly::atom(Atom::Div(self.clone(), other.clone()))),
        }
    }

    fn rem(&self, other: &Poly) -> Option<Poly> {
        match (self.as_const(), other.as_const()) {
            (_, Some(0)) => None,
            (Some(a), Some(b)) => Some(Poly::constant(a.checked_rem_euclid(b)?)),
            (_, Some(1)) | (_, Some(-1)) => Some(Poly::constant(0)),
            _ => {
                // (x % m) % m == x % m
                if let Some((mono, 1)) = self.0.iter().next().map(|(m, c)| (m, *c)) {
                    if self.0.len() == 1 {
                        if let [Atom::Mod(_, m)] = mono.as_slice() {
                            if m == other {
                                return Some(self.clone());
                            }
                        }
                    }
                }
                Some(Poly::atom(Atom::Mod(self.clone(), other.clone())))
            }
        }
    }
}

fn expr_poly(e: &Expr) -> Option<Poly> {
    match e {
        Expr::Lit(Value::Int(i)) => Some(Poly::constant(*i)),
        Expr::Var(v) => Some(Poly::atom(Atom::Var(v.clone()))),
        Expr::Now => Some(Poly::atom(Atom::Now)),
        Expr::Unary {
            op: UnaryOp::Neg,
            expr,
        } => expr_poly(expr)?.neg(),
        Expr::Binary { op, left, right } => {
            let l = expr_poly(left)?;
            let r = expr_poly(right)?;
            match op {
                BinaryOp::Add => l.add(&r),
                BinaryOp::Sub => l.sub(&r),
                BinaryOp::Mul => l.mul(&r),
                BinaryOp::Div => l.div(&r),
                BinaryOp::Mod => l.rem(&r),
                _ => None,
            }
        }
        _ => None,
    }
}

fn partition_poly(p: &PartitionExpr, subst: &BTreeMap<String, Poly>) -> Option<Poly> {
    match p {
        PartitionExpr::Const(c) => Some(Poly::constant(*c)),
        PartitionExpr::Key(c) => subst.get(c).cloned(),
        PartitionExpr::Neg(a) => partition_poly(a, subst)?.neg(),
        PartitionExpr::Add(a, b) => partition_poly(a, subst)?.add(&partition_poly(b, subst)?),
        PartitionExpr::Sub(a, b) => partition_poly(a, subst)?.sub(&partition_poly(b, subst)?),
        PartitionExpr::Mul(a, b) => partition_poly(a, subst)?.mul(&partition_poly(b, subst)?),
        PartitionExpr::Div(a, b) => partition_poly(a, subst)?.div(&partition_poly(b, subst)?),
        PartitionExpr::Mod(a, b) => partition_poly(a, subst)?.rem(&partition_poly(b, subst)?),
    }
}

/// The symbolic node of `t`'s row at `key`.
fn key_poly(t: &Table, key: &KeyExprs) -> Option<Poly> {
    let mut subst = BTreeMap::new();
    for col in t.partition.columns() {
        let (_, e) = key.iter().find(|(c, _)| *c == col)?;
        subst.insert(col, expr_poly(e)?);
    }
    partition_poly(&t.partition, &subst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::key, Column, SchemaBuilder};

    fn schema() -> Schema {
        let mut b = SchemaBuilder::new(3);
        b.register(Table::new(
            "Account",
            vec![
                Column::new("id", TypeName::Int),
                Column::new("balance", TypeName::Float),
                Column::new("owner", TypeName::Str),
            ],
            &["id"],
            PartitionExpr::key_mod("id", 3),
        ))
        .unwrap();
        b.register(Table::new(
            "Audit",
            vec![
                Column::new("id", TypeName::Int),
                Column::new("count", TypeName::Int),
            ],
            &["id"],
            PartitionExpr::Mod(
                Box::new(PartitionExpr::Add(
                    Box::new(PartitionExpr::key("id")),
                    Box::new(PartitionExpr::Const(1)),
                )),
                Box::new(PartitionExpr::Const(3)),
            ),
        ))
        .unwrap();
        b.register(Table::new(
            "UserScore",
            vec![
                Column::new("userID", TypeName::Int),
                Column::new("gameID", TypeName::Int),
                Column::new("score", TypeName::Int),
            ],
            &["userID", "gameID"],
            PartitionExpr::Mod(
                Box::new(PartitionExpr::Add(
                    Box::new(PartitionExpr::key("userID")),
                    Box::new(PartitionExpr::key("gameID")),
                )),
                Box::new(PartitionExpr::Const(3)),
            ),
        ))
        .unwrap();
        b.build().unwrap()
    }

    fn issues(src: &TxnSource) -> Vec<CompileIssue> {
        match compile(&schema(), src) {
            Err(Error::Compile(issues)) => issues,
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    fn acct(e: Expr) -> KeyExprs {
        key(vec![("id", e)])
    }

    fn transfer() -> TxnSource {
        TxnSource::new("transfer")
            .param("from", TypeName::Int)
            .param("to", TypeName::Int)
            .param("amount", TypeName::Float)
            .hop(HopSource::on_partition(
                "Account",
                acct(Expr::var("from")),
                vec![
                    Stmt::let_(
                        "old",
                        TypeName::Float,
                        Expr::field("Account", acct(Expr::var("from")), "balance"),
                    ),
                    Stmt::update(
                        "Account",
                        acct(Expr::var("from")),
                        vec![("balance", Expr::var("old").minus(Expr::var("amount")))],
                    ),
                ],
            ))
            .hop(HopSource::on_partition(
                "Account",
                acct(Expr::var("to")),
                vec![
                    Stmt::update(
                        "Account",
                        acct(Expr::var("to")),
                        vec![(
                            "balance",
                            Expr::field("Account", acct(Expr::var("to")), "balance")
                                .plus(Expr::var("amount")),
                        )],
                    ),
                    Stmt::Return(Expr::var("old")),
                ],
            ))
    }

    #[test]
    fn free_variable_sets() {
        let def = compile(&schema(), &transfer()).unwrap();
        assert_eq!(def.hops.len(), 2);
        let h0 = &def.hops[0];
        assert_eq!(
            h0.consumes.iter().cloned().collect::<Vec<_>>(),
            vec!["amount".to_string(), "from".to_string()]
        );
        assert_eq!(h0.produces.iter().cloned().collect::<Vec<_>>(), vec!["old".to_string()]);
        assert_eq!(h0.footprint.len(), 1);
        let h1 = &def.hops[1];
        assert!(h1.consumes.contains("old"));
        assert!(!h1.consumes.contains("from"));
        assert!(h1.produces.is_empty());
        assert_eq!(def.returns, Some(TypeName::Float));
    }

    #[test]
    fn differently_partitioned_rows_are_rejected() {
        let src = TxnSource::new("bad").param("uid", TypeName::Int).hop(HopSource::on_partition(
            "Account",
            acct(Expr::var("uid")),
            vec![Stmt::update(
                "Audit",
                acct(Expr::var("uid")),
                vec![("count", Expr::lit(1i64))],
            )],
        ));
        let found = issues(&src);
        assert!(found
            .iter()
            .any(|i| matches!(i, CompileIssue::CrossPartition { hop: 0, .. })));
    }

    #[test]
    fn algebraically_equal_partitions_are_accepted() {
        // Audit[id = uid - 1] lands where Account[uid] does.
        let src = TxnSource::new("ok").param("uid", TypeName::Int).hop(HopSource::on_partition(
            "Account",
            acct(Expr::var("uid")),
            vec![Stmt::update(
                "Audit",
                acct(Expr::var("uid").minus(Expr::lit(1i64))),
                vec![("count", Expr::lit(1i64))],
            )],
        ));
        assert!(compile(&schema(), &src).is_ok());

        // Composite keys commute.
        let src = TxnSource::new("ok2")
            .param("u", TypeName::Int)
            .param("g", TypeName::Int)
            .hop(HopSource::on_partition(
                "UserScore",
                key(vec![("userID", Expr::var("u")), ("gameID", Expr::var("g"))]),
                vec![Stmt::update(
                    "UserScore",
                    key(vec![("gameID", Expr::var("u")), ("userID", Expr::var("g"))]),
                    vec![("score", Expr::lit(0i64))],
                )],
            ));
        assert!(compile(&schema(), &src).is_ok());
    }

    #[test]
    fn literal_nodes_fold_constant_keys() {
        let hop = |id: i64| {
            TxnSource::new("lit").hop(HopSource::on_node(
                NodeId(1),
                vec![Stmt::insert("Account", acct(Expr::lit(id)), vec![])],
            ))
        };
        assert!(compile(&schema(), &hop(4)).is_ok());
        assert!(compile(&schema(), &hop(-2)).is_ok());
        assert!(issues(&hop(5))
            .iter()
            .any(|i| matches!(i, CompileIssue::CrossPartition { .. })));

        let out_of_range = TxnSource::new("far").hop(HopSource::on_node(NodeId(3), vec![]));
        assert!(matches!(issues(&out_of_range)[0], CompileIssue::BadTarget { .. }));
    }

    #[test]
    fn keys_must_be_fixed_at_hop_entry() {
        let src = TxnSource::new("moving").param("uid", TypeName::Int).hop(HopSource::on_partition(
            "Account",
            acct(Expr::var("uid")),
            vec![
                Stmt::let_("next", TypeName::Int, Expr::var("uid").plus(Expr::lit(3i64))),
                Stmt::update("Account", acct(Expr::var("next")), vec![("balance", Expr::lit(0.0))]),
            ],
        ));
        assert!(issues(&src)
            .iter()
            .any(|i| matches!(i, CompileIssue::BadKey { .. })));
    }

    #[test]
    fn name_and_type_errors_are_all_collected() {
        let src = TxnSource::new("sloppy").param("uid", TypeName::Int).hop(HopSource::on_partition(
            "Account",
            acct(Expr::var("uid")),
            vec![
                Stmt::let_("x", TypeName::Int, Expr::var("nope")),
                Stmt::let_("y", TypeName::Int, Expr::lit("text")),
                Stmt::insert("Nowhere", acct(Expr::var("uid")), vec![]),
                Stmt::update("Account", acct(Expr::var("uid")), vec![("colour", Expr::lit(1i64))]),
                Stmt::insert("UserScore", key(vec![("userID", Expr::var("uid"))]), vec![]),
                Stmt::Break,
                Stmt::set("uid", Expr::lit(2i64)),
            ],
        ));
        let found = issues(&src);
        assert!(found.iter().any(|i| matches!(i, CompileIssue::Undeclared { .. })));
        assert!(found.iter().any(|i| matches!(i, CompileIssue::TypeMismatch { .. })));
        assert!(found.iter().any(|i| matches!(i, CompileIssue::UnknownTable { .. })));
        assert!(found.iter().any(|i| matches!(i, CompileIssue::UnknownColumn { .. })));
        assert!(found.iter().any(|i| matches!(i, CompileIssue::BadKey { .. })));
        assert!(found.iter().any(|i| matches!(i, CompileIssue::Misplaced { .. })));
        assert!(found.iter().any(|i| matches!(i, CompileIssue::NotAssignable { .. })));
    }

    #[test]
    fn control_flow_placement() {
        let src = TxnSource::new("late_abort")
            .param("a", TypeName::Int)
            .param("b", TypeName::Int)
            .hop(HopSource::on_partition(
                "Account",
                acct(Expr::var("a")),
                vec![Stmt::Return(Expr::lit(1i64))],
            ))
            .hop(HopSource::on_partition(
                "Account",
                acct(Expr::var("b")),
                vec![Stmt::Abort, Stmt::while_(Expr::lit(true), 0, vec![])],
            ));
        let found = issues(&src);
        let misplaced = found
            .iter()
            .filter(|i| matches!(i, CompileIssue::Misplaced { .. }))
            .count();
        assert_eq!(misplaced, 3);
    }

    #[test]
    fn earlier_hop_variables_are_read_only() {
        let mut src = transfer();
        src.hops[1]
            .body
            .push(Stmt::set("old", Expr::lit(0.0)));
        assert!(issues(&src)
            .iter()
            .any(|i| matches!(i, CompileIssue::NotAssignable { hop: 1, .. })));
    }

    #[test]
    fn nested_scopes_end_with_their_block() {
        let src = TxnSource::new("scoped").param("uid", TypeName::Int).hop(HopSource::on_partition(
            "Account",
            acct(Expr::var("uid")),
            vec![
                Stmt::if_(
                    Expr::var("uid").less_than(Expr::lit(0i64)),
                    vec![Stmt::let_("tmp", TypeName::Int, Expr::lit(1i64))],
                    vec![Stmt::let_("tmp", TypeName::Int, Expr::lit(2i64))],
                ),
                Stmt::let_("after", TypeName::Int, Expr::var("tmp")),
            ],
        ));
        let found = issues(&src);
        assert_eq!(found.len(), 1);
        assert!(matches!(found[0], CompileIssue::Undeclared { .. }));
    }

    #[test]
    fn params_are_bound_and_widened() {
        let def = compile(&schema(), &transfer()).unwrap();
        let env = def
            .bind_params(crate::env(vec![
                ("from", Value::Int(1)),
                ("to", Value::Int(2)),
                ("amount", Value::Int(5)),
            ]))
            .unwrap();
        assert_eq!(env["amount"], Value::Float(5.0));
        assert!(matches!(
            def.bind_params(crate::env(vec![("from", 1i64)])),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn catalog_rejects_duplicate_names() {
        let mut cat = Catalog::new(schema());
        cat.define(&transfer()).unwrap();
        assert!(cat.define(&transfer()).is_err());
        assert!(cat.hop("transfer", 1).is_some());
        assert!(cat.hop("transfer", 2).is_none());
    }
}
