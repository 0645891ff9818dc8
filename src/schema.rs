// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The schema registry and partition resolver.
//!
//! Each [Table] carries a [PartitionExpr]: a small integer AST over the
//! table's primary-key columns whose value is the id of the node owning the
//! row. The AST has no impure node, so evaluating it is a pure function of
//! the key; that is what lets the compiler reason about it statically and
//! the executor double-check it at runtime.
//!
//! A [Schema] is built once at startup through a [SchemaBuilder] and then
//! shared immutably (usually in an `Arc`) by everything that needs it.

use crate::{Error, KeyTuple, NodeId, TypeName, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: TypeName,
}

impl Column {
    pub fn new(name: &str, ty: TypeName) -> Self {
        Column {
            name: name.to_string(),
            ty,
        }
    }
}

/// Integer arithmetic over primary-key columns. `Mod` is Euclidean, so a
/// negative key still lands on a valid node.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionExpr {
    Const(i64),
    Key(String),
    Neg(Box<PartitionExpr>),
    Add(Box<PartitionExpr>, Box<PartitionExpr>),
    Sub(Box<PartitionExpr>, Box<PartitionExpr>),
    Mul(Box<PartitionExpr>, Box<PartitionExpr>),
    Div(Box<PartitionExpr>, Box<PartitionExpr>),
    Mod(Box<PartitionExpr>, Box<PartitionExpr>),
}

impl PartitionExpr {
    pub fn key(column: &str) -> Self {
        PartitionExpr::Key(column.to_string())
    }

    /// `key % modulus`, the usual hash-free placement.
    pub fn key_mod(column: &str, modulus: i64) -> Self {
        PartitionExpr::Mod(
            Box::new(PartitionExpr::key(column)),
            Box::new(PartitionExpr::Const(modulus)),
        )
    }

    pub fn columns(&self) -> BTreeSet<String> {
        fn walk(e: &PartitionExpr, out: &mut BTreeSet<String>) {
            match e {
                PartitionExpr::Const(_) => (),
                PartitionExpr::Key(c) => {
                    out.insert(c.clone());
                }
                PartitionExpr::Neg(a) => walk(a, out),
                PartitionExpr::Add(a, b)
                | PartitionExpr::Sub(a, b)
                | PartitionExpr::Mul(a, b)
                | PartitionExpr::Div(a, b)
                | PartitionExpr::Mod(a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
            }
        }
        let mut out = BTreeSet::new();
        walk(self, &mut out);
        out
    }

    /// Evaluates against integer bindings for the referenced key columns.
    pub fn eval(&self, keys: &BTreeMap<String, i64>) -> Result<i64, Error> {
        fn arith(
            op: &str,
            a: i64,
            b: i64,
            f: fn(i64, i64) -> Option<i64>,
        ) -> Result<i64, Error> {
            f(a, b).ok_or_else(|| Error::Schema(format!("partition arithmetic {} {} {} failed", a, op, b)))
        }
        match self {
            PartitionExpr::Const(c) => Ok(*c),
            PartitionExpr::Key(c) => keys
                .get(c)
                .copied()
                .ok_or_else(|| Error::Schema(format!("missing key column {}", c))),
            PartitionExpr::Neg(a) => {
                let a = a.eval(keys)?;
                a.checked_neg()
                    .ok_or_else(|| Error::Schema(format!("partition negation of {} overflowed", a)))
            }
            PartitionExpr::Add(a, b) => arith("+", a.eval(keys)?, b.eval(keys)?, i64::checked_add),
            PartitionExpr::Sub(a, b) => arith("-", a.eval(keys)?, b.eval(keys)?, i64::checked_sub),
            PartitionExpr::Mul(a, b) => arith("*", a.eval(keys)?, b.eval(keys)?, i64::checked_mul),
            PartitionExpr::Div(a, b) => {
                arith("/", a.eval(keys)?, b.eval(keys)?, i64::checked_div_euclid)
            }
            PartitionExpr::Mod(a, b) => {
                arith("%", a.eval(keys)?, b.eval(keys)?, i64::checked_rem_euclid)
            }
        }
    }

    fn has_literal_zero_divisor(&self) -> bool {
        match self {
            PartitionExpr::Const(_) | PartitionExpr::Key(_) => false,
            PartitionExpr::Neg(a) => a.has_literal_zero_divisor(),
            PartitionExpr::Div(a, b) | PartitionExpr::Mod(a, b) => {
                **b == PartitionExpr::Const(0)
                    || a.has_literal_zero_divisor()
                    || b.has_literal_zero_divisor()
            }
            PartitionExpr::Add(a, b) | PartitionExpr::Sub(a, b) | PartitionExpr::Mul(a, b) => {
                a.has_literal_zero_divisor() || b.has_literal_zero_divisor()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Ordered subset of `columns` forming the (possibly composite) key.
    pub primary: Vec<String>,
    pub partition: PartitionExpr,
}

impl Table {
    pub fn new(name: &str, columns: Vec<Column>, primary: &[&str], partition: PartitionExpr) -> Self {
        Table {
            name: name.to_string(),
            columns,
            primary: primary.iter().map(|s| s.to_string()).collect(),
            partition,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_primary(&self, name: &str) -> bool {
        self.primary.iter().any(|p| p == name)
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &Column> + '_ {
        self.primary.iter().filter_map(move |p| self.column(p))
    }

    fn validate(&self) -> Result<(), Error> {
        let bad = |msg: String| Err(Error::Schema(format!("table {}: {}", self.name, msg)));
        if self.columns.is_empty() {
            return bad("no columns".into());
        }
        let mut seen = BTreeSet::new();
        for c in &self.columns {
            if !seen.insert(c.name.as_str()) {
                return bad(format!("duplicate column {}", c.name));
            }
        }
        if self.primary.is_empty() {
            return bad("must have at least one primary key column".into());
        }
        let mut seen_pk = BTreeSet::new();
        for p in &self.primary {
            if self.column(p).is_none() {
                return bad(format!("primary key column {} is not declared", p));
            }
            if !seen_pk.insert(p.as_str()) {
                return bad(format!("primary key column {} listed twice", p));
            }
        }
        for c in self.partition.columns() {
            match self.column(&c) {
                Some(col) if self.is_primary(&c) && col.ty == TypeName::Int => (),
                Some(_) if self.is_primary(&c) => {
                    return bad(format!("partition expression uses non-integer key {}", c))
                }
                _ => return bad(format!("partition expression uses non-key column {}", c)),
            }
        }
        if self.partition.has_literal_zero_divisor() {
            return bad("partition expression divides by zero".into());
        }
        Ok(())
    }
}

/// Accumulates validated tables; `build` freezes them into a [Schema].
pub struct SchemaBuilder {
    cluster_size: u32,
    tables: BTreeMap<String, Table>,
}

impl SchemaBuilder {
    pub fn new(cluster_size: u32) -> Self {
        SchemaBuilder {
            cluster_size,
            tables: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, table: Table) -> Result<&mut Self, Error> {
        table.validate()?;
        if self.tables.contains_key(&table.name) {
            return Err(Error::Schema(format!("table {} already registered", table.name)));
        }
        self.tables.insert(table.name.clone(), table);
        Ok(self)
    }

    pub fn build(self) -> Result<Schema, Error> {
        if self.cluster_size == 0 {
            return Err(Error::Schema("cluster size must be at least 1".into()));
        }
        Ok(Schema {
            cluster_size: self.cluster_size,
            tables: self.tables,
        })
    }
}

/// Immutable set of table definitions plus the cluster size they partition over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    cluster_size: u32,
    tables: BTreeMap<String, Table>,
}

impl Schema {
    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> + '_ {
        self.tables.values()
    }

    fn table_or_err(&self, name: &str) -> Result<&Table, Error> {
        self.table(name)
            .ok_or_else(|| Error::Schema(format!("unknown table {}", name)))
    }

    /// Orders named key bindings into the table's [KeyTuple], checking that
    /// every primary column is bound exactly once with a value of its type.
    pub fn key_tuple(&self, table: &str, bindings: &BTreeMap<String, Value>) -> Result<KeyTuple, Error> {
        let t = self.table_or_err(table)?;
        if let Some(extra) = bindings.keys().find(|k| !t.is_primary(k)) {
            return Err(Error::Schema(format!(
                "{} is not a primary key column of {}",
                extra, table
            )));
        }
        let mut parts = Vec::with_capacity(t.primary.len());
        for col in t.primary_columns() {
            let v = bindings.get(&col.name).ok_or_else(|| {
                Error::Schema(format!("key for {} omits primary column {}", table, col.name))
            })?;
            let v = v.clone().coerce_to(col.ty).ok_or_else(|| {
                Error::Schema(format!(
                    "key column {}.{} expects {:?}, got {}",
                    table, col.name, col.ty, v
                ))
            })?;
            parts.push(v);
        }
        Ok(KeyTuple(parts))
    }

    /// Resolves the node owning the row of `table` with the given key.
    pub fn resolve(&self, table: &str, bindings: &BTreeMap<String, Value>) -> Result<NodeId, Error> {
        let key = self.key_tuple(table, bindings)?;
        self.resolve_tuple(table, &key)
    }

    /// Like [Schema::resolve], from an already-ordered [KeyTuple].
    pub fn resolve_tuple(&self, table: &str, key: &KeyTuple) -> Result<NodeId, Error> {
        let t = self.table_or_err(table)?;
        if key.0.len() != t.primary.len() {
            return Err(Error::Schema(format!(
                "key {:?} for {} has {} components, expected {}",
                key,
                table,
                key.0.len(),
                t.primary.len()
            )));
        }
        let mut ints = BTreeMap::new();
        for (col, v) in t.primary.iter().zip(key.0.iter()) {
            if let Some(i) = v.as_int() {
                ints.insert(col.clone(), i);
            }
        }
        let raw = t.partition.eval(&ints)?;
        self.node_in_range(raw).map_err(|_| {
            Error::Schema(format!(
                "partition of {}{:?} yields node {} outside cluster of {}",
                table, key, raw, self.cluster_size
            ))
        })
    }

    /// Checks a raw node number against the configured cluster size.
    pub fn node_in_range(&self, raw: i64) -> Result<NodeId, Error> {
        if raw >= 0 && raw < i64::from(self.cluster_size) {
            Ok(NodeId(raw as u32))
        } else {
            Err(Error::Schema(format!(
                "node {} outside cluster of {}",
                raw, self.cluster_size
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env;

    fn user_score() -> Table {
        Table::new(
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
        )
    }

    fn schema() -> Schema {
        let mut b = SchemaBuilder::new(3);
        b.register(user_score()).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn resolve_is_deterministic() {
        let s = schema();
        let key = env(vec![("userID", 1i64), ("gameID", 100)]);
        let first = s.resolve("UserScore", &key).unwrap();
        for _ in 0..10 {
            assert_eq!(s.resolve("UserScore", &key).unwrap(), first);
        }
        assert_eq!(first, NodeId(101 % 3));
    }

    #[test]
    fn negative_keys_stay_in_range() {
        let s = schema();
        let key = env(vec![("userID", -5i64), ("gameID", 0)]);
        assert_eq!(s.resolve("UserScore", &key).unwrap(), NodeId(1));
    }

    #[test]
    fn missing_key_column_is_a_schema_error() {
        let s = schema();
        let key = env(vec![("userID", 1i64)]);
        assert!(matches!(s.resolve("UserScore", &key), Err(Error::Schema(_))));
        let key = env(vec![("userID", 1i64), ("gameID", 2), ("score", 3)]);
        assert!(matches!(s.resolve("UserScore", &key), Err(Error::Schema(_))));
    }

    #[test]
    fn out_of_range_node_is_a_schema_error() {
        let mut b = SchemaBuilder::new(2);
        b.register(Table::new(
            "Wide",
            vec![Column::new("id", TypeName::Int)],
            &["id"],
            PartitionExpr::key("id"),
        ))
        .unwrap();
        let s = b.build().unwrap();
        assert_eq!(s.resolve("Wide", &env(vec![("id", 1i64)])).unwrap(), NodeId(1));
        assert!(matches!(
            s.resolve("Wide", &env(vec![("id", 2i64)])),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn register_rejects_bad_tables() {
        let mut b = SchemaBuilder::new(3);
        b.register(user_score()).unwrap();
        assert!(b.register(user_score()).is_err(), "duplicate table");

        let non_key = Table::new(
            "T",
            vec![Column::new("id", TypeName::Int), Column::new("v", TypeName::Int)],
            &["id"],
            PartitionExpr::key_mod("v", 3),
        );
        assert!(SchemaBuilder::new(3).register(non_key).is_err());

        let string_key = Table::new(
            "T",
            vec![Column::new("name", TypeName::Str)],
            &["name"],
            PartitionExpr::key("name"),
        );
        assert!(SchemaBuilder::new(3).register(string_key).is_err());

        let undeclared = Table::new(
            "T",
            vec![Column::new("id", TypeName::Int)],
            &["nope"],
            PartitionExpr::Const(0),
        );
        assert!(SchemaBuilder::new(3).register(undeclared).is_err());

        let zero_div = Table::new(
            "T",
            vec![Column::new("id", TypeName::Int)],
            &["id"],
            PartitionExpr::key_mod("id", 0),
        );
        assert!(SchemaBuilder::new(3).register(zero_div).is_err());
    }

    #[test]
    fn float_keys_accept_ints_in_tuples() {
        let mut b = SchemaBuilder::new(1);
        b.register(Table::new(
            "F",
            vec![Column::new("k", TypeName::Float)],
            &["k"],
            PartitionExpr::Const(0),
        ))
        .unwrap();
        let s = b.build().unwrap();
        let t = s.key_tuple("F", &env(vec![("k", 2i64)])).unwrap();
        assert_eq!(t, KeyTuple(vec![Value::Float(2.0)]));
    }
}
