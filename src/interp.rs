// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Evaluation of hop bodies.
//!
//! A hop runs against an overlay: reads see the store plus the hop's own
//! buffered writes, and nothing reaches the store until the caller commits
//! the returned writes. Evaluation is a pure function of the incoming
//! environment, the rows read and the logical timestamp, so re-running a
//! hop that crashed before committing produces the same effects.
//!
//! Integer `/` and `%` are Euclidean, matching [crate::PartitionExpr], so a
//! key computed by a statement lands where the partition resolver says it
//! does.

use crate::{
    compiler::Hop, ir::KeyExprs, BinaryOp, Env, Error, Expr, KeyTuple, Row, Schema, Stmt, Store,
    TypeName, UnaryOp, Value, Write,
};
use std::{cmp::Ordering, collections::BTreeMap, convert::TryFrom};
use tracing::trace;

/// What a successfully evaluated hop wants committed and reported.
#[derive(Debug)]
pub(crate) struct HopEffects {
    /// Values of the hop's produced variables.
    pub env: Env,
    pub returned: Option<Value>,
    pub writes: Vec<Write>,
}

pub(crate) fn run_hop(
    schema: &Schema,
    hop: &Hop,
    env: Env,
    now: u64,
    store: &dyn Store,
) -> Result<HopEffects, Error> {
    let mut run = Run::new(schema, Some(store), env, now);
    run.block(&hop.body)?;
    let env = hop
        .produces
        .iter()
        .filter_map(|n| run.env.get(n).map(|v| (n.clone(), v.clone())))
        .collect();
    let writes = run
        .writes
        .into_iter()
        .map(|((table, key), row)| Write { table, key, row })
        .collect::<Vec<_>>();
    trace!("hop produced {} writes", writes.len());
    Ok(HopEffects {
        env,
        returned: run.returned,
        writes,
    })
}

/// Evaluates a key that may not read rows, as hop targets and footprints are.
pub(crate) fn eval_key(
    schema: &Schema,
    table: &str,
    key: &KeyExprs,
    env: &Env,
    now: u64,
) -> Result<KeyTuple, Error> {
    let mut run = Run::new(schema, None, env.clone(), now);
    run.key(table, key)
}

enum Flow {
    Next,
    Break,
    Continue,
    Return,
}

struct Run<'a> {
    schema: &'a Schema,
    store: Option<&'a dyn Store>,
    env: Env,
    now: i64,
    writes: BTreeMap<(String, KeyTuple), Row>,
    returned: Option<Value>,
}

fn data<T>(msg: String) -> Result<T, Error> {
    Err(Error::Data(msg))
}

impl<'a> Run<'a> {
    fn new(schema: &'a Schema, store: Option<&'a dyn Store>, env: Env, now: u64) -> Self {
        Run {
            schema,
            store,
            env,
            now: i64::try_from(now).unwrap_or(i64::MAX),
            writes: BTreeMap::new(),
            returned: None,
        }
    }

    fn key(&mut self, table: &str, key: &KeyExprs) -> Result<KeyTuple, Error> {
        let mut bindings = BTreeMap::new();
        for (col, e) in key {
            bindings.insert(col.clone(), self.eval(e)?);
        }
        self.schema.key_tuple(table, &bindings)
    }

    fn row(&self, table: &str, key: &KeyTuple) -> Result<Option<Row>, Error> {
        if let Some(row) = self.writes.get(&(table.to_string(), key.clone())) {
            return Ok(Some(row.clone()));
        }
        match self.store {
            Some(store) => Ok(store.get(table, key)),
            None => data(format!("{} row read where only bound values are allowed", table)),
        }
    }

    fn column_type(&self, table: &str, column: &str) -> Result<TypeName, Error> {
        self.schema
            .table(table)
            .and_then(|t| t.column(column))
            .map(|c| c.ty)
            .ok_or_else(|| Error::Schema(format!("unknown column {}.{}", table, column)))
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow, Error> {
        for s in stmts {
            match self.stmt(s)? {
                Flow::Next => (),
                other => return Ok(other),
            }
        }
        Ok(Flow::Next)
    }

    fn stmt(&mut self, s: &Stmt) -> Result<Flow, Error> {
        match s {
            Stmt::Let { name, ty, init } => {
                let v = coerce(self.eval(init)?, *ty)?;
                self.env.insert(name.clone(), v);
            }
            Stmt::Set { name, value } => {
                let v = self.eval(value)?;
                let v = match self.env.get(name) {
                    Some(old) => coerce(v, old.type_name())?,
                    None => return data(format!("assignment to unbound variable {}", name)),
                };
                self.env.insert(name.clone(), v);
            }
            Stmt::Update {
                table,
                key,
                assigns,
            } => {
                let k = self.key(table, key)?;
                let mut row = match self.row(table, &k)? {
                    Some(row) => row,
                    None => return data(format!("no {} row at {:?} to update", table, k)),
                };
                // Right-hand sides all see the row as it was before this statement.
                let mut vals = Vec::with_capacity(assigns.len());
                for (col, e) in assigns {
                    let ty = self.column_type(table, col)?;
                    vals.push((col.clone(), coerce(self.eval(e)?, ty)?));
                }
                row.extend(vals);
                self.writes.insert((table.clone(), k), row);
            }
            Stmt::Insert { table, key, values } => {
                let k = self.key(table, key)?;
                let schema = self.schema;
                let t = schema
                    .table(table)
                    .ok_or_else(|| Error::Schema(format!("unknown table {}", table)))?;
                let mut row: Row = t
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.ty.zero()))
                    .collect();
                for (col, v) in t.primary.iter().zip(k.0.iter()) {
                    row.insert(col.clone(), v.clone());
                }
                for (col, e) in values {
                    let ty = self.column_type(table, col)?;
                    let v = coerce(self.eval(e)?, ty)?;
                    row.insert(col.clone(), v);
                }
                self.writes.insert((table.clone(), k), row);
            }
            Stmt::If { cond, then, els } => {
                return if self.truth(cond)? {
                    self.block(then)
                } else {
                    self.block(els)
                };
            }
            Stmt::While {
                cond,
                body,
                max_iterations,
            } => {
                let mut iterations = 0;
                while self.truth(cond)? {
                    if iterations == *max_iterations {
                        return data(format!(
                            "loop still running after its bound of {} iterations",
                            max_iterations
                        ));
                    }
                    iterations += 1;
                    match self.block(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Next | Flow::Continue => (),
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Abort => return Err(Error::Aborted),
            Stmt::Return(e) => {
                self.returned = Some(self.eval(e)?);
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Next)
    }

    fn truth(&mut self, e: &Expr) -> Result<bool, Error> {
        match self.eval(e)? {
            Value::Bool(b) => Ok(b),
            other => data(format!("condition evaluated to {}", other)),
        }
    }

    fn eval(&mut self, e: &Expr) -> Result<Value, Error> {
        match e {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Now => Ok(Value::Int(self.now)),
            Expr::Var(name) => match self.env.get(name) {
                Some(v) => Ok(v.clone()),
                None => data(format!("unbound variable {}", name)),
            },
            Expr::Field { table, key, column } => {
                let k = self.key(table, key)?;
                match self.row(table, &k)? {
                    None => data(format!("no {} row at {:?}", table, k)),
                    Some(row) => match row.get(column) {
                        Some(v) => Ok(v.clone()),
                        None => data(format!("{} row at {:?} lacks {}", table, k, column)),
                    },
                }
            }
            Expr::Unary { op, expr } => match (op, self.eval(expr)?) {
                (UnaryOp::Neg, Value::Int(i)) => match i.checked_neg() {
                    Some(n) => Ok(Value::Int(n)),
                    None => data(format!("overflow negating {}", i)),
                },
                (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (op, v) => data(format!("{:?} applied to {}", op, v)),
            },
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => Ok(Value::Bool(self.truth(left)? && self.truth(right)?)),
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => Ok(Value::Bool(self.truth(left)? || self.truth(right)?)),
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary(*op, l, r)
            }
        }
    }
}

fn coerce(v: Value, ty: TypeName) -> Result<Value, Error> {
    let shown = v.to_string();
    v.coerce_to(ty)
        .ok_or_else(|| Error::Data(format!("expected {:?}, got {}", ty, shown)))
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, Error> {
    if op.is_comparison() {
        return compare(op, &l, &r).map(Value::Bool);
    }
    match (op, l, r) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (op, Value::Int(a), Value::Int(b)) => {
            let res = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div | BinaryOp::Mod if b == 0 => {
                    return data(format!("division of {} by zero", a))
                }
                BinaryOp::Div => a.checked_div_euclid(b),
                BinaryOp::Mod => a.checked_rem_euclid(b),
                _ => None,
            };
            res.map(Value::Int)
                .ok_or_else(|| Error::Data(format!("{:?} of {} and {} overflowed", op, a, b)))
        }
        (op, l, r) => match (l.as_float(), r.as_float()) {
            (Some(a), Some(b)) => match op {
                BinaryOp::Add => Ok(Value::Float(a + b)),
                BinaryOp::Sub => Ok(Value::Float(a - b)),
                BinaryOp::Mul => Ok(Value::Float(a * b)),
                BinaryOp::Div if b == 0.0 => data(format!("division of {} by zero", a)),
                BinaryOp::Div => Ok(Value::Float(a / b)),
                _ => data(format!("{:?} applied to {} and {}", op, l, r)),
            },
            _ => data(format!("{:?} applied to {} and {}", op, l, r)),
        },
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<bool, Error> {
    let ord = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, BinaryOp::Eq | BinaryOp::Neq) => a.cmp(b),
        _ => match (l.as_float(), r.as_float()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => return data(format!("{:?} applied to {} and {}", op, l, r)),
        },
    };
    Ok(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Neq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Lte => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compile, env, ir::key, Column, HopSource, MemStore, NodeId, PartitionExpr, SchemaBuilder,
        Table, TxnSource,
    };

    fn schema() -> Schema {
        let mut b = SchemaBuilder::new(1);
        b.register(Table::new(
            "Counter",
            vec![
                Column::new("id", TypeName::Int),
                Column::new("n", TypeName::Int),
                Column::new("label", TypeName::Str),
            ],
            &["id"],
            PartitionExpr::Const(0),
        ))
        .unwrap();
        b.build().unwrap()
    }

    fn one_hop(body: Vec<Stmt>) -> Hop {
        let src = TxnSource::new("t")
            .param("id", TypeName::Int)
            .hop(HopSource::on_node(NodeId(0), body));
        compile(&schema(), &src).unwrap().hops.remove(0)
    }

    fn counter() -> Expr {
        Expr::field("Counter", key(vec![("id", Expr::var("id"))]), "n")
    }

    fn run(hop: &Hop, store: &MemStore) -> Result<HopEffects, Error> {
        run_hop(&schema(), hop, env(vec![("id", 7i64)]), 1_000, store)
    }

    #[test]
    fn reads_see_own_writes() {
        let hop = one_hop(vec![
            Stmt::insert(
                "Counter",
                key(vec![("id", Expr::var("id"))]),
                vec![("n", Expr::lit(41i64))],
            ),
            Stmt::update(
                "Counter",
                key(vec![("id", Expr::var("id"))]),
                vec![("n", counter().plus(Expr::lit(1i64)))],
            ),
            Stmt::let_("seen", TypeName::Int, counter()),
        ]);
        let fx = run(&hop, &MemStore::new()).unwrap();
        assert_eq!(fx.env["seen"], Value::Int(42));
        assert_eq!(fx.writes.len(), 1);
        assert_eq!(fx.writes[0].row["label"], Value::Str(String::new()));
    }

    #[test]
    fn missing_row_is_a_data_error() {
        let hop = one_hop(vec![Stmt::let_("seen", TypeName::Int, counter())]);
        assert!(matches!(run(&hop, &MemStore::new()), Err(Error::Data(_))));
    }

    #[test]
    fn loops_are_bounded() {
        let body = |bound| {
            one_hop(vec![
                Stmt::let_("i", TypeName::Int, Expr::lit(0i64)),
                Stmt::while_(
                    Expr::var("i").less_than(Expr::lit(5i64)),
                    bound,
                    vec![Stmt::set("i", Expr::var("i").plus(Expr::lit(1i64)))],
                ),
            ])
        };
        let fx = run(&body(5), &MemStore::new()).unwrap();
        assert_eq!(fx.env["i"], Value::Int(5));
        assert!(matches!(run(&body(4), &MemStore::new()), Err(Error::Data(_))));
    }

    #[test]
    fn arithmetic_faults_and_timestamp() {
        let hop = one_hop(vec![Stmt::let_(
            "q",
            TypeName::Int,
            Expr::var("id").modulo(Expr::lit(0i64)),
        )]);
        assert!(matches!(run(&hop, &MemStore::new()), Err(Error::Data(_))));

        let hop = one_hop(vec![
            Stmt::let_("neg", TypeName::Int, Expr::lit(-7i64).modulo(Expr::lit(3i64))),
            Stmt::let_("t", TypeName::Int, Expr::Now),
        ]);
        let fx = run(&hop, &MemStore::new()).unwrap();
        assert_eq!(fx.env["neg"], Value::Int(2));
        assert_eq!(fx.env["t"], Value::Int(1_000));
    }

    #[test]
    fn abort_and_return() {
        let hop = one_hop(vec![Stmt::if_(
            Expr::var("id").equals(Expr::lit(7i64)),
            vec![Stmt::Abort],
            vec![],
        )]);
        assert!(matches!(run(&hop, &MemStore::new()), Err(Error::Aborted)));

        let hop = one_hop(vec![
            Stmt::let_("x", TypeName::Float, Expr::lit(1i64)),
            Stmt::Return(Expr::var("x")),
            Stmt::set("x", Expr::lit(9.0)),
        ]);
        let fx = run(&hop, &MemStore::new()).unwrap();
        assert_eq!(fx.returned, Some(Value::Float(1.0)));
        assert_eq!(fx.env["x"], Value::Float(1.0));
    }
}
