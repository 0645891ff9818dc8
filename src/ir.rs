// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The intermediate representation a DSL front-end hands to [compile](crate::compile).
//!
//! This is deliberately a plain tree: a transaction is a name, typed
//! parameters and an ordered list of hop blocks; each block names where it
//! runs and holds ordinary imperative statements. Nothing here has been
//! checked yet; that's the compiler's job.

use crate::{NodeId, TypeName, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Named primary-key bindings for a point access, `column = expr`.
pub type KeyExprs = Vec<(String, Expr)>;

pub fn key(pairs: Vec<(&str, Expr)>) -> KeyExprs {
    pairs
        .into_iter()
        .map(|(c, e)| (c.to_string(), e))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Neq
                | BinaryOp::Lt
                | BinaryOp::Lte
                | BinaryOp::Gt
                | BinaryOp::Gte
        )
    }
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Lit(Value),
    Var(String),
    /// Point read of one column of the row with the given primary key.
    Field {
        table: String,
        key: KeyExprs,
        column: String,
    },
    /// The instance's logical timestamp (milliseconds); the only clock a hop sees.
    Now,
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn lit<V: Into<Value>>(v: V) -> Expr {
        Expr::Lit(v.into())
    }

    pub fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    pub fn field(table: &str, key: KeyExprs, column: &str) -> Expr {
        Expr::Field {
            table: table.to_string(),
            key,
            column: column.to_string(),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn plus(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, other)
    }

    pub fn minus(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Sub, self, other)
    }

    pub fn times(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Mul, self, other)
    }

    pub fn modulo(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Mod, self, other)
    }

    pub fn less_than(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Lt, self, other)
    }

    pub fn equals(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, self, other)
    }

    /// Every variable name the expression mentions, including inside keys.
    pub fn vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    pub(crate) fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Lit(_) | Expr::Now => (),
            Expr::Var(v) => {
                out.insert(v.clone());
            }
            Expr::Field { key, .. } => {
                for (_, e) in key {
                    e.collect_vars(out);
                }
            }
            Expr::Unary { expr, .. } => expr.collect_vars(out),
            Expr::Binary { left, right, .. } => {
                left.collect_vars(out);
                right.collect_vars(out);
            }
        }
    }

    /// True if evaluating the expression dereferences any row.
    pub fn reads_rows(&self) -> bool {
        match self {
            Expr::Field { .. } => true,
            Expr::Lit(_) | Expr::Var(_) | Expr::Now => false,
            Expr::Unary { expr, .. } => expr.reads_rows(),
            Expr::Binary { left, right, .. } => left.reads_rows() || right.reads_rows(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    /// Declares a variable. At a hop's top level the variable joins the
    /// transaction environment and is visible to later hops.
    Let {
        name: String,
        ty: TypeName,
        init: Expr,
    },
    /// Reassigns a variable declared earlier in the same hop.
    Set {
        name: String,
        value: Expr,
    },
    /// Assigns columns of an existing row; the row must exist.
    Update {
        table: String,
        key: KeyExprs,
        assigns: Vec<(String, Expr)>,
    },
    /// Creates the row, or replaces it if present. Omitted non-key columns
    /// take their type's zero value.
    Insert {
        table: String,
        key: KeyExprs,
        values: Vec<(String, Expr)>,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        els: Vec<Stmt>,
    },
    /// A loop that fails the hop rather than run more than `max_iterations` times.
    While {
        cond: Expr,
        body: Vec<Stmt>,
        max_iterations: u32,
    },
    Break,
    Continue,
    Abort,
    Return(Expr),
}

impl Stmt {
    pub fn let_(name: &str, ty: TypeName, init: Expr) -> Stmt {
        Stmt::Let {
            name: name.to_string(),
            ty,
            init,
        }
    }

    pub fn set(name: &str, value: Expr) -> Stmt {
        Stmt::Set {
            name: name.to_string(),
            value,
        }
    }

    pub fn update(table: &str, key: KeyExprs, assigns: Vec<(&str, Expr)>) -> Stmt {
        Stmt::Update {
            table: table.to_string(),
            key,
            assigns: assigns
                .into_iter()
                .map(|(c, e)| (c.to_string(), e))
                .collect(),
        }
    }

    pub fn insert(table: &str, key: KeyExprs, values: Vec<(&str, Expr)>) -> Stmt {
        Stmt::Insert {
            table: table.to_string(),
            key,
            values: values
                .into_iter()
                .map(|(c, e)| (c.to_string(), e))
                .collect(),
        }
    }

    pub fn if_(cond: Expr, then: Vec<Stmt>, els: Vec<Stmt>) -> Stmt {
        Stmt::If { cond, then, els }
    }

    pub fn while_(cond: Expr, max_iterations: u32, body: Vec<Stmt>) -> Stmt {
        Stmt::While {
            cond,
            body,
            max_iterations,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopTarget {
    Node(NodeId),
    /// The node owning `table`'s row at `key`.
    Partition { table: String, key: KeyExprs },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopSource {
    pub target: HopTarget,
    pub body: Vec<Stmt>,
}

impl HopSource {
    pub fn on_node(node: NodeId, body: Vec<Stmt>) -> Self {
        HopSource {
            target: HopTarget::Node(node),
            body,
        }
    }

    pub fn on_partition(table: &str, key: KeyExprs, body: Vec<Stmt>) -> Self {
        HopSource {
            target: HopTarget::Partition {
                table: table.to_string(),
                key,
            },
            body,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnSource {
    pub name: String,
    pub params: Vec<(String, TypeName)>,
    pub hops: Vec<HopSource>,
}

impl TxnSource {
    pub fn new(name: &str) -> Self {
        TxnSource {
            name: name.to_string(),
            params: Vec::new(),
            hops: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, ty: TypeName) -> Self {
        self.params.push((name.to_string(), ty));
        self
    }

    pub fn hop(mut self, hop: HopSource) -> Self {
        self.hops.push(hop);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_look_inside_keys() {
        let e = Expr::field("User", key(vec![("id", Expr::var("uid"))]), "cursor")
            .plus(Expr::var("delta"));
        let vs: Vec<_> = e.vars().into_iter().collect();
        assert_eq!(vs, vec!["delta".to_string(), "uid".to_string()]);
        assert!(e.reads_rows());
        assert!(!Expr::var("x").plus(Expr::lit(1i64)).reads_rows());
    }
}
