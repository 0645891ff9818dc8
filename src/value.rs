// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Runtime values, their static types, and the containers built from them:
//! environments of bound variables, primary-key tuples and rows.

use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, hash::Hash};

/// Static type of a column, parameter or variable.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeName {
    Int,
    Float,
    Str,
    Bool,
}

impl TypeName {
    /// A `Float` slot accepts an `Int`; everything else must match exactly.
    pub fn accepts(&self, actual: &TypeName) -> bool {
        self == actual || (*self == TypeName::Float && *actual == TypeName::Int)
    }

    /// The value a freshly inserted column holds when none is given.
    pub fn zero(&self) -> Value {
        match self {
            TypeName::Int => Value::Int(0),
            TypeName::Float => Value::Float(0.0),
            TypeName::Str => Value::Str(String::new()),
            TypeName::Bool => Value::Bool(false),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeName::Int | TypeName::Float)
    }
}

/// A `Value` is what variables, parameters, key components and columns hold.
///
/// Floats are ordered with [f64::total_cmp] so that `Value` is totally ordered
/// and hashable, which lets it appear inside [KeyTuple]s and `BTreeMap` keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn type_name(&self) -> TypeName {
        match self {
            Value::Int(_) => TypeName::Int,
            Value::Float(_) => TypeName::Float,
            Value::Str(_) => TypeName::Str,
            Value::Bool(_) => TypeName::Bool,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Converts `self` to be stored in a slot of type `ty`, widening integers
    /// into float slots. Returns `None` if the types are incompatible.
    pub fn coerce_to(self, ty: TypeName) -> Option<Value> {
        match (ty, self) {
            (TypeName::Float, Value::Int(i)) => Some(Value::Float(i as f64)),
            (ty, v) if v.type_name() == ty => Some(v),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Float(_) => 1,
            Value::Str(_) => 2,
            Value::Bool(_) => 3,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bool(b) => b.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Variable name -> value. Accumulated left-to-right along a hop chain.
pub type Env = BTreeMap<String, Value>;

/// Column name -> value, for every column of a table (key columns included).
pub type Row = BTreeMap<String, Value>;

/// Builds an [Env] from `(name, value)` pairs; handy for parameters.
pub fn env<K, V, I>(pairs: I) -> Env
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Primary-key values of one row, in the table's declared primary-key order.
#[derive(Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyTuple(pub Vec<Value>);

impl std::fmt::Debug for KeyTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str(")")
    }
}

impl<V: Into<Value>> From<Vec<V>> for KeyTuple {
    fn from(vs: Vec<V>) -> Self {
        KeyTuple(vs.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_slots_take_ints() {
        assert!(TypeName::Float.accepts(&TypeName::Int));
        assert!(!TypeName::Int.accepts(&TypeName::Float));
        assert_eq!(Value::Int(3).coerce_to(TypeName::Float), Some(Value::Float(3.0)));
        assert_eq!(Value::Str("x".into()).coerce_to(TypeName::Int), None);
    }

    #[test]
    fn values_are_totally_ordered() {
        let mut vs = vec![
            Value::Bool(true),
            Value::Float(f64::NAN),
            Value::Int(2),
            Value::Float(-1.5),
            Value::Int(-7),
            Value::Str("b".into()),
        ];
        vs.sort();
        assert_eq!(vs[0], Value::Int(-7));
        assert_eq!(vs[1], Value::Int(2));
        assert_eq!(vs[2], Value::Float(-1.5));
        assert_eq!(vs[5], Value::Bool(true));
        // NaN equals itself under total ordering, so keys containing it stay findable.
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn key_tuples_print_compactly() {
        let k = KeyTuple::from(vec![1i64, 100]);
        assert_eq!(format!("{:?}", k), "(1, 100)");
    }
}
